use std::{
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, SystemTime},
};

use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    client::TelemetryClient,
    config::RelayConfig,
    element::Elements,
    metric::{epoch_secs, EventRecord, MetricKind, MetricUpdate},
    parser::{self, ParseError},
};

const INTERNAL_NAMESPACE: &str = "netuitive-statsd";
const PACKETS_RECEIVED: &str = "packets_received";
const SAMPLES_RECEIVED: &str = "samples_received";
const EVENTS_RECEIVED: &str = "events_received";
const DEFAULT_EVENT_PRIORITY: &str = "normal";
const DEFAULT_EVENT_ALERT_TYPE: &str = "info";

/// What a single [`Poster::flush`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Everything was delivered, or there was nothing to deliver.
    Posted,
    /// At least one element or event wasn't accepted upstream; it stays buffered.
    Failed,
    /// Upstream kept failing past the error budget and all buffered state was discarded.
    Dropped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PosterStats {
    pub packets: u64,
    pub samples: u64,
    pub events: u64,
    pub pending_events: usize,
    pub elements: usize,
}

struct PosterState {
    elements: Elements,
    events: Vec<EventRecord>,
    packet_count: u64,
    sample_count: u64,
    event_count: u64,
    failing_since: Option<SystemTime>,
}

impl PosterState {
    fn reset_counts(&mut self) {
        self.packet_count = 0;
        self.sample_count = 0;
        self.event_count = 0;
    }

    fn drop_all(&mut self) {
        self.elements.delete_all();
        self.events.clear();
        self.reset_counts();
        self.failing_since = None;
    }

    // The counts are cumulative since the last successful flush, so a retried cycle replaces what an earlier
    // attempt added instead of adding to it.
    fn add_internal_metrics(&mut self, config: &RelayConfig, now: SystemTime) {
        let counts = [
            (PACKETS_RECEIVED, self.packet_count),
            (SAMPLES_RECEIVED, self.sample_count),
            (EVENTS_RECEIVED, self.event_count),
        ];
        for (name, count) in counts {
            let name = format!("{INTERNAL_NAMESPACE}.{name}");
            let metric_id = config.metric_id(&name);
            let update = MetricUpdate::new(name.as_str(), count as f64, MetricKind::Counter);
            self.elements.remove_metric(None, &metric_id);
            self.elements.add_sample(&metric_id, &update, now);
        }
    }
}

/// Owns the element registry and the event queue, and periodically delivers them upstream.
///
/// Cloning is cheap and every clone shares the same state. [`Poster::submit`] and [`Poster::flush`] are
/// serialized through one lock.
#[derive(Clone)]
pub struct Poster {
    state: Arc<Mutex<PosterState>>,
    client: Arc<dyn TelemetryClient>,
    config: Arc<RelayConfig>,
    interval: Duration,
    flush_error_max: Duration,
    /// One sender per flush loop started and not yet stopped.
    shutdown: Arc<Mutex<Vec<Sender<()>>>>,
}

impl Poster {
    pub fn new(config: &RelayConfig, client: Arc<dyn TelemetryClient>) -> Self {
        let state = PosterState {
            elements: Elements::new(config.get_hostname(), config.get_element_type())
                .with_host_tags(config.tags.clone()),
            events: Vec::new(),
            packet_count: 0,
            sample_count: 0,
            event_count: 0,
            failing_since: None,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            client,
            interval: config.get_interval(),
            flush_error_max: config.flush_error_max(),
            config: Arc::new(config.clone()),
            shutdown: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Parses one datagram and folds it into the registry.
    ///
    /// The packet is always counted; a packet that fails to parse contributes nothing else.
    pub fn submit(&self, packet: &[u8], timestamp: SystemTime) {
        let parsed = parser::parse(packet);
        let mut state = self.state.lock();
        state.packet_count += 1;
        let batch = match parsed {
            Ok(batch) => batch,
            Err(ParseError::Empty) => {
                debug!("Ignoring packet with nothing in it.");
                return;
            }
            Err(ParseError::InvalidLine { line, source }) => {
                error!(
                    packet = %String::from_utf8_lossy(packet),
                    %line,
                    reason = %source,
                    "Dropping malformed packet."
                );
                return;
            }
        };

        state.sample_count += batch.counts.messages;
        state.event_count += batch.counts.events;
        for mut event in batch.events {
            event.date_happened.get_or_insert(epoch_secs(timestamp));
            event
                .hostname
                .get_or_insert_with(|| self.config.get_hostname().to_string());
            event
                .priority
                .get_or_insert_with(|| DEFAULT_EVENT_PRIORITY.to_string());
            event
                .alert_type
                .get_or_insert_with(|| DEFAULT_EVENT_ALERT_TYPE.to_string());
            state.events.push(event);
        }
        for update in &batch.metrics {
            let metric_id = self.config.metric_id(&update.name);
            state.elements.add_sample(&metric_id, update, timestamp);
        }
    }

    /// Runs one flush cycle.
    ///
    /// Elements whose post fails keep their aggregates and are retried whole on the next cycle. Once the
    /// upstream has been failing for longer than `max(interval * 15, 900s)` everything buffered is dropped.
    pub fn flush(&self, now: SystemTime) -> FlushOutcome {
        let mut state = self.state.lock();
        if let Some(since) = state.failing_since {
            let failing_for = now.duration_since(since).unwrap_or_default();
            if failing_for > self.flush_error_max {
                error!(
                    ?failing_for,
                    elements = state.elements.len(),
                    events = state.events.len(),
                    "Upstream has been failing for too long, dropping all buffered metrics and events."
                );
                state.drop_all();
                return FlushOutcome::Dropped;
            }
        }

        if !self.config.no_internal_metrics {
            state.add_internal_metrics(&self.config, now);
        }

        let mut delivered = true;
        let mut samples_posted = 0;
        let element_ids: Vec<String> = state.elements.iter().map(|e| e.id().to_string()).collect();
        for element_id in &element_ids {
            if state.elements.prepare(element_id, now) == 0 {
                continue;
            }
            let Some(element) = state.elements.get(element_id) else {
                continue;
            };
            match self.client.post_element(element) {
                Ok(()) => {
                    samples_posted += element.samples().len();
                    state.elements.clear_samples(Some(element_id), false);
                }
                Err(err) => {
                    delivered = false;
                    error!(element = %element_id, %err, "Failed to post element.");
                }
            }
        }

        let events_queued = state.events.len();
        state.events.retain(|event| match self.client.post_event(event) {
            Ok(()) => false,
            Err(err) => {
                warn!(title = %event.title, %err, "Failed to post event.");
                true
            }
        });
        if !state.events.is_empty() {
            delivered = false;
        }

        debug!(
            elements = element_ids.len(),
            samples_posted,
            events_posted = events_queued - state.events.len(),
            delivered,
            "Flushed."
        );
        if delivered {
            state.reset_counts();
            state.failing_since = None;
            let pruned = state.elements.prune(now, self.flush_error_max);
            if pruned > 0 {
                debug!(pruned, elements = state.elements.len(), "Forgot idle metrics.");
            }
            FlushOutcome::Posted
        } else {
            state.failing_since.get_or_insert(now);
            FlushOutcome::Failed
        }
    }

    /// Spawns a flush loop. It ticks every `interval` until [`Poster::stop`] is called.
    pub fn start(&self) -> JoinHandle<()> {
        let poster = self.clone();
        let ticker = tick(self.interval);
        let (shutdown_tx, shutdown_rx) = bounded(1);
        self.shutdown.lock().push(shutdown_tx);
        info!(interval = ?self.interval, "Starting poster.");
        std::thread::spawn(move || loop {
            select! {
                recv(ticker) -> _ => {
                    poster.flush(SystemTime::now());
                }
                recv(shutdown_rx) -> _ => {
                    debug!("Poster stopped.");
                    break;
                }
            }
        })
    }

    /// Stops every flush loop started so far. Loops started afterwards are unaffected.
    pub fn stop(&self) {
        for shutdown_tx in self.shutdown.lock().drain(..) {
            let _ = shutdown_tx.try_send(());
        }
    }

    pub fn stats(&self) -> PosterStats {
        let state = self.state.lock();
        PosterStats {
            packets: state.packet_count,
            samples: state.sample_count,
            events: state.event_count,
            pending_events: state.events.len(),
            elements: state.elements.len(),
        }
    }
}
