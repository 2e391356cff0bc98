use tokio::net::UdpSocket;

const PACKETS: &[&[u8]] = &[
    b"relay.test.requests:1|c|#route:/health",
    b"relay.test.latency:12|ms|@0.5\nrelay.test.latency:30|ms",
    b"relay.test.queue_depth:42|g",
    b"relay.test.queue_depth:-2|g",
    b"relay.test.users:1001|s|#h:web-2,un:users",
    b"_e{14,18}:deploy started|rolling out v1.4.2|t:info",
    b"_sc|relay.test.db|0|m:all good",
];

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
pub async fn main() {
    let target = std::env::var("RELAY_ADDR").unwrap_or("127.0.0.1:8125".to_string());
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .expect("Failed to bind UDP socket!");
    loop {
        for packet in PACKETS {
            socket
                .send_to(packet, target.as_str())
                .await
                .expect("Failed to send packet!");
        }
        println!("Sent {} packets!", PACKETS.len());
        tokio::time::sleep(tokio::time::Duration::from_millis(3000)).await;
    }
}
