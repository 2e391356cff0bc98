use std::{
    io,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, SystemTime},
};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::{config::RelayConfig, poster::Poster};

const LOCALHOST: &str = "localhost";
const LOOPBACK: &str = "127.0.0.1";
const MAX_DATAGRAM_LEN: usize = 65_535;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("couldn't bind UDP socket on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum ClientState {
    Disconnected,
    Ready(UdpSocket),
}

/// Re-sends raw datagrams to a second statsd endpoint.
///
/// The socket is connected lazily and rebuilt on the next datagram after a send error.
struct Forwarder {
    target: (String, u16),
    client_state: ClientState,
}

impl Forwarder {
    fn new(ip: &str, port: u16) -> Self {
        Self {
            target: (ip.to_string(), port),
            client_state: ClientState::Disconnected,
        }
    }

    fn connect(&self) -> io::Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((self.target.0.as_str(), self.target.1))?;
        Ok(socket)
    }

    fn try_send(&mut self, payload: &[u8]) -> io::Result<usize> {
        loop {
            match std::mem::replace(&mut self.client_state, ClientState::Disconnected) {
                ClientState::Disconnected => {
                    self.client_state = ClientState::Ready(self.connect()?);
                }
                ClientState::Ready(socket) => {
                    let result = socket.send(payload);
                    if result.is_ok() {
                        self.client_state = ClientState::Ready(socket);
                    } else {
                        self.client_state = ClientState::Disconnected;
                    }
                    return result;
                }
            }
        }
    }
}

/// Stops a running [`Server`] at its next read timeout.
#[derive(Clone, Debug)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Binds `ip:port` with `bind`. A failure to bind `localhost` is retried once on `127.0.0.1`.
fn bind_with_fallback<T>(
    ip: &str,
    port: u16,
    mut bind: impl FnMut(&str, u16) -> io::Result<T>,
) -> Result<T, ServerError> {
    match bind(ip, port) {
        Ok(bound) => Ok(bound),
        Err(err) if ip == LOCALHOST => {
            warn!(%err, port, "Couldn't bind {LOCALHOST}, retrying on {LOOPBACK}.");
            bind(LOOPBACK, port).map_err(|source| ServerError::Bind {
                addr: format!("{LOOPBACK}:{port}"),
                source,
            })
        }
        Err(source) => Err(ServerError::Bind {
            addr: format!("{ip}:{port}"),
            source,
        }),
    }
}

/// How long to wait before reading again after `err`. `None` for an ordinary read timeout.
fn recv_backoff(err: &io::Error, read_timeout: Duration) -> Option<Duration> {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => None,
        _ => Some(read_timeout),
    }
}

/// Receives statsd datagrams over UDP and hands each one to the [`Poster`].
pub struct Server {
    socket: UdpSocket,
    poster: Poster,
    forwarder: Option<Forwarder>,
    running: Arc<AtomicBool>,
    read_timeout: Duration,
}

impl Server {
    /// Binds the listen address. A failure to bind `localhost` is retried once on `127.0.0.1`.
    pub fn bind(config: &RelayConfig, poster: Poster) -> Result<Self, ServerError> {
        let socket = bind_with_fallback(config.get_listen_ip(), config.get_listen_port(), |ip, port| {
            UdpSocket::bind((ip, port))
        })?;
        let read_timeout = config.get_read_timeout();
        socket.set_read_timeout(Some(read_timeout))?;

        let forwarder = config
            .get_forward_addr()
            .map(|(ip, port)| Forwarder::new(ip, port));
        Ok(Self {
            socket,
            poster,
            forwarder,
            running: Arc::new(AtomicBool::new(true)),
            read_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.running))
    }

    /// Reads datagrams until stopped. Per-datagram failures are logged and never end the loop. Other socket errors
    /// pause reading for one read timeout.
    pub fn run(&mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        if let Ok(addr) = self.socket.local_addr() {
            info!(%addr, forwarding = self.forwarder.is_some(), "Listening for statsd packets.");
        }
        while self.running.load(Ordering::SeqCst) {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err) => {
                    if let Some(backoff) = recv_backoff(&err, self.read_timeout) {
                        error!(%err, ?backoff, "Failed to read from socket.");
                        std::thread::sleep(backoff);
                    }
                    continue;
                }
            };
            let packet = &buf[..len];
            trace!(%from, len, "Received packet.");
            self.poster.submit(packet, SystemTime::now());
            if let Some(forwarder) = self.forwarder.as_mut() {
                if let Err(err) = forwarder.try_send(packet) {
                    debug!(%err, target = ?forwarder.target, "Failed to forward packet.");
                }
            }
        }
        info!("Server stopped.");
    }

    pub fn start(mut self) -> JoinHandle<()> {
        std::thread::spawn(move || self.run())
    }
}
