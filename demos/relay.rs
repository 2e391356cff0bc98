use std::{sync::Arc, time::Duration};

use statsd_relay::{element::Element, *};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Prints every flushed sample instead of sending it anywhere.
struct LoggingClient;

impl TelemetryClient for LoggingClient {
    fn post_element(&self, element: &Element) -> Result<(), PostError> {
        for sample in element.samples() {
            info!(
                element = element.id(),
                metric = %sample.metric_id,
                value = sample.value,
                metric_type = sample.metric_type,
                count = ?sample.count,
                "Sample."
            );
        }
        Ok(())
    }

    fn post_event(&self, event: &EventRecord) -> Result<(), PostError> {
        info!(title = %event.title, text = %event.text, priority = ?event.priority, "Event.");
        Ok(())
    }
}

pub fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RelayConfig::default()
        .with_listen_addr("127.0.0.1", 8125)
        .with_interval(Duration::from_secs(10));
    config.validate().expect("Invalid relay config!");

    // Re-emit to a Datadog agent when one is configured, otherwise just log.
    let client: Arc<dyn TelemetryClient> = if std::env::var(client::STATSD_HOST_ENV).is_ok() {
        Arc::new(DogstatsdUpstream::from_env().expect("Failed to instantiate client!"))
    } else {
        Arc::new(LoggingClient)
    };
    let poster = Poster::new(&config, client);
    let flush_loop = poster.start();
    let server = Server::bind(&config, poster.clone()).expect("Failed to bind UDP socket!");
    server.start().join().expect("Server thread panicked!");
    poster.stop();
    flush_loop.join().expect("Flush thread panicked!");
}
