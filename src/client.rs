use std::{collections::HashMap, env, num::NonZeroU32, sync::Arc, time::Duration};

use dogstatsd::{Client, DogstatsdError, Options};
use governor::{
    clock::{Clock, DefaultClock},
    DefaultDirectRateLimiter, Quota, RateLimiter,
};
use nonzero_ext::nonzero;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::{
    element::Element,
    metric::{EventRecord, MetricKind, OutboundSample, Tag},
};

pub const STATSD_HOST_ENV: &str = "STATSD_HOST";
pub const STATSD_PORT_ENV: &str = "STATSD_PORT";
const DEFAULT_ORIGIN: &str = "0.0.0.0:0";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8125";
const DEFAULT_RATE_LIMIT_PER_SECOND: NonZeroU32 = nonzero!(42_000u32);
const DEFAULT_BURST_LIMIT: NonZeroU32 = nonzero!(42u32);
const CARRY_EPSILON: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum PostError {
    #[error("upstream rejected the payload: {0}")]
    Rejected(String),
    #[error("failed to reach upstream: {0}")]
    Transport(String),
}

impl From<DogstatsdError> for PostError {
    fn from(err: DogstatsdError) -> Self {
        PostError::Transport(err.to_string())
    }
}

/// The upstream telemetry API the poster delivers to.
///
/// Calls are synchronous and only ever made from the flush loop.
pub trait TelemetryClient: Send + Sync {
    /// Delivers an element together with the samples from its last [`Element::prepare`].
    fn post_element(&self, element: &Element) -> Result<(), PostError>;
    fn post_event(&self, event: &EventRecord) -> Result<(), PostError>;
}

/// Whole counts already sent for a counter's current window, plus the fraction left over from the last one.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct CounterLedger {
    carry: f64,
    emitted: i64,
}

impl CounterLedger {
    /// Whole counts not yet sent for a window whose running sum is `sum`.
    fn owed(&self, sum: f64) -> i64 {
        (self.carry + sum).trunc() as i64 - self.emitted
    }

    /// Closes the window once the element was delivered. `None` when nothing is left to carry.
    fn settle(self, sum: f64) -> Option<Self> {
        let carry = self.carry + sum - self.emitted as f64;
        (carry.abs() > CARRY_EPSILON).then_some(Self { carry, emitted: 0 })
    }
}

/// Relays aggregated samples and events to a Datadog agent.
///
/// Counters go out as `count`, every other sample as `gauge`, each tagged with `host:<element id>`.
/// dogstatsd counts are integers, so a counter only sends whole units and carries the fraction into its next window.
/// A window re-posted after a partial failure only sends what the earlier attempt didn't.
///
/// Packets are throttled with a rate limiter so a large flush doesn't flood the agent.
#[derive(Clone)]
pub struct DogstatsdUpstream {
    /// The Arc around the dogstatsd client is a hack to work around the lack of a native Clone implementation.
    client: Arc<Client>,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    /// Element id -> metric id -> ledger.
    counters: Arc<Mutex<HashMap<String, HashMap<String, CounterLedger>>>>,
}

impl DogstatsdUpstream {
    /// Targets `STATSD_HOST:STATSD_PORT`, defaulting to `127.0.0.1:8125`.
    pub fn from_env() -> Result<Self, DogstatsdError> {
        let no_tags = &[] as &[&str];
        Self::new(None, no_tags)
    }

    pub fn new<I, T>(namespace: Option<&str>, default_tags: I) -> Result<Self, DogstatsdError>
    where
        T: AsRef<str>,
        I: IntoIterator<Item = T>,
    {
        let mut default_tags = default_tags
            .into_iter()
            .map(|t| t.as_ref().to_string())
            .collect::<Vec<_>>();
        default_tags.sort();

        let statsd_host = env::var(STATSD_HOST_ENV).unwrap_or(DEFAULT_HOST.to_string());
        let statsd_port = env::var(STATSD_PORT_ENV).unwrap_or(DEFAULT_PORT.to_string());
        let options = Options {
            socket_path: None,
            batching_options: None,
            default_tags,
            from_addr: DEFAULT_ORIGIN.to_string(),
            to_addr: format!("{}:{}", statsd_host, statsd_port),
            namespace: namespace.unwrap_or("").to_string(),
        };
        let client = Client::new(options)?;
        Ok(Self::with_client(client))
    }

    fn with_client(client: Client) -> Self {
        Self {
            client: Arc::new(client),
            rate_limiter: Arc::new(RateLimiter::direct(
                Quota::per_second(DEFAULT_RATE_LIMIT_PER_SECOND).allow_burst(DEFAULT_BURST_LIMIT),
            )),
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_rate_limit(self, per_second: NonZeroU32, burst: NonZeroU32) -> Self {
        Self {
            rate_limiter: Arc::new(RateLimiter::direct(
                Quota::per_second(per_second).allow_burst(burst),
            )),
            ..self
        }
    }

    fn emit_sample(&self, element: &Element, sample: &OutboundSample) -> Result<(), PostError> {
        let tags = sample_tags(element, sample);
        if let Some(sum) = counter_sum(sample) {
            return self.emit_count(element, sample, sum, &tags);
        }
        check_and_wait(&DefaultClock::default(), &self.rate_limiter);
        self.client
            .gauge(sample.metric_id.as_str(), sample.value.to_string(), &tags)?;
        Ok(())
    }

    fn emit_count(
        &self,
        element: &Element,
        sample: &OutboundSample,
        sum: f64,
        tags: &[String],
    ) -> Result<(), PostError> {
        let ledger = self
            .counters
            .lock()
            .get(element.id())
            .and_then(|ledgers| ledgers.get(&sample.metric_id))
            .copied()
            .unwrap_or_default();
        let owed = ledger.owed(sum);
        if owed != 0 {
            check_and_wait(&DefaultClock::default(), &self.rate_limiter);
            self.client.count(sample.metric_id.as_str(), owed, tags)?;
        }
        self.counters
            .lock()
            .entry(element.id().to_string())
            .or_default()
            .insert(
                sample.metric_id.clone(),
                CounterLedger {
                    emitted: ledger.emitted + owed,
                    ..ledger
                },
            );
        Ok(())
    }

    // Counters absent from this window lose their carry.
    fn settle_counters(&self, element: &Element) {
        let mut counters = self.counters.lock();
        let previous = counters.remove(element.id()).unwrap_or_default();
        let settled: HashMap<String, CounterLedger> = element
            .samples()
            .iter()
            .filter_map(|sample| {
                let sum = counter_sum(sample)?;
                let ledger = previous.get(&sample.metric_id).copied().unwrap_or_default();
                Some((sample.metric_id.clone(), ledger.settle(sum)?))
            })
            .collect();
        if !settled.is_empty() {
            counters.insert(element.id().to_string(), settled);
        }
    }
}

fn counter_sum(sample: &OutboundSample) -> Option<f64> {
    (sample.metric_type == MetricKind::Counter.wire_type()).then(|| sample.sum.unwrap_or(sample.value))
}

impl TelemetryClient for DogstatsdUpstream {
    fn post_element(&self, element: &Element) -> Result<(), PostError> {
        for sample in element.samples() {
            self.emit_sample(element, sample)?;
        }
        self.settle_counters(element);
        Ok(())
    }

    fn post_event(&self, event: &EventRecord) -> Result<(), PostError> {
        check_and_wait(&DefaultClock::default(), &self.rate_limiter);
        self.client
            .event(event.title.as_str(), event.text.as_str(), event_tags(event))?;
        Ok(())
    }
}

fn sample_tags(element: &Element, sample: &OutboundSample) -> Vec<String> {
    let mut tags: Vec<String> = element
        .tags()
        .iter()
        .chain(sample.tags.iter())
        .map(Tag::to_string)
        .collect();
    tags.push(format!("host:{}", sample.element_id));
    if !sample.unit.is_empty() {
        tags.push(format!("unit:{}", sample.unit));
    }
    tags
}

fn event_tags(event: &EventRecord) -> Vec<String> {
    let mut tags: Vec<String> = event.tags.iter().map(Tag::to_string).collect();
    let extras = [
        ("host", &event.hostname),
        ("priority", &event.priority),
        ("alert_type", &event.alert_type),
        ("source_type_name", &event.source_type_name),
        ("aggregation_key", &event.aggregation_key),
    ];
    for (key, value) in extras {
        if let Some(value) = value {
            tags.push(format!("{key}:{value}"));
        }
    }
    tags
}

fn check_and_sleep(clock: &DefaultClock, rate_limiter: &DefaultDirectRateLimiter) -> bool {
    match rate_limiter.check() {
        Ok(_) => true,
        Err(negative) => {
            trace!(?negative, "Forced to wait before emitting.");
            let wait_time = negative.wait_time_from(clock.now()).as_millis();
            std::thread::sleep(Duration::from_millis(wait_time as u64));
            false
        }
    }
}

fn check_and_wait(clock: &DefaultClock, rate_limiter: &DefaultDirectRateLimiter) {
    while !check_and_sleep(clock, rate_limiter) {}
}
