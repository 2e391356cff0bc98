use std::{
    collections::HashSet,
    time::{Duration, SystemTime},
};

use derive_more::From;
use ordered_float::OrderedFloat;

use crate::metric::{epoch_millis, MetricKind, MetricUpdate, OutboundSample, Sign, Tag};

const DEFAULT_SPARSE_DATA_STRATEGY: &str = "None";
const STATSD_TYPE_TAG: &str = "statsdType";

/// Statistics derived from one flush window of an instrument.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rollup {
    pub value: f64,
    pub sum: Option<f64>,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub count: Option<u64>,
}

impl Rollup {
    fn from_values(value: impl FnOnce(f64, f64) -> f64, values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let sum: f64 = values.iter().sum();
        let count = values.len();
        let avg = sum / count as f64;
        Self {
            value: value(sum, avg),
            sum: Some(sum),
            avg: Some(avg),
            min: sorted.first().copied(),
            max: sorted.last().copied(),
            count: Some(count as u64),
        }
    }
}

fn signed(value: f64, sign: Option<Sign>) -> f64 {
    match sign {
        Some(Sign::Minus) => -value,
        _ => value,
    }
}

/// Buffers every rate-scaled delta of a window.
#[derive(Clone, Debug, Default)]
pub struct Counter {
    values: Vec<f64>,
}

impl Counter {
    pub fn add_value(&mut self, value: f64, sign: Option<Sign>, rate: Option<f64>) {
        self.values
            .push(signed(value * rate.unwrap_or(1.0), sign));
    }
    pub fn drain(&self) -> Rollup {
        Rollup::from_values(|sum, _| sum, &self.values)
    }
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Tracks a running level; the last level is carried into the next window.
#[derive(Clone, Debug, Default)]
pub struct Gauge {
    value: f64,
    values: Vec<f64>,
}

impl Gauge {
    pub fn add_value(&mut self, value: f64, sign: Option<Sign>) {
        match sign {
            None => self.value = value,
            Some(Sign::Plus) => self.value += value,
            Some(Sign::Minus) => self.value -= value,
        }
        self.values.push(self.value);
    }
    pub fn value(&self) -> f64 {
        self.value
    }
    pub fn drain(&self) -> Rollup {
        let value = self.value;
        Rollup::from_values(|_, _| value, &self.values)
    }
    pub fn clear(&mut self) {
        self.values.clear();
        self.values.push(self.value);
    }
}

/// Timer/histogram samples of a window.
#[derive(Clone, Debug, Default)]
pub struct Histogram {
    values: Vec<f64>,
}

impl Histogram {
    pub fn add_value(&mut self, value: f64, sign: Option<Sign>) {
        self.values.push(signed(value, sign));
    }
    pub fn drain(&self) -> Rollup {
        Rollup::from_values(|_, avg| avg, &self.values)
    }
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Distinct values seen in a window.
#[derive(Clone, Debug, Default)]
pub struct Set {
    members: HashSet<OrderedFloat<f64>>,
}

impl Set {
    pub fn add_value(&mut self, value: f64, sign: Option<Sign>) {
        self.members.insert(OrderedFloat(signed(value, sign)));
    }
    pub fn drain(&self) -> Rollup {
        Rollup {
            value: self.members.len() as f64,
            ..Default::default()
        }
    }
    pub fn clear(&mut self) {
        self.members.clear();
    }
}

#[derive(Clone, Debug, From)]
pub enum Instrument {
    Counter(Counter),
    Gauge(Gauge),
    Histogram(Histogram),
    Set(Set),
}

impl Instrument {
    pub fn for_kind(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Counter::default().into(),
            MetricKind::Gauge => Gauge::default().into(),
            MetricKind::Timer | MetricKind::Histogram => Histogram::default().into(),
            MetricKind::Set => Set::default().into(),
        }
    }
    /// The statsd type codes this instrument can absorb.
    pub fn org_kinds(&self) -> &'static [MetricKind] {
        match self {
            Instrument::Counter(_) => &[MetricKind::Counter],
            Instrument::Gauge(_) => &[MetricKind::Gauge],
            Instrument::Histogram(_) => &[MetricKind::Timer, MetricKind::Histogram],
            Instrument::Set(_) => &[MetricKind::Set],
        }
    }
    pub fn accepts(&self, kind: MetricKind) -> bool {
        self.org_kinds().contains(&kind)
    }
    pub fn add_value(&mut self, value: f64, sign: Option<Sign>, rate: Option<f64>) {
        match self {
            Instrument::Counter(counter) => counter.add_value(value, sign, rate),
            Instrument::Gauge(gauge) => gauge.add_value(value, sign),
            Instrument::Histogram(histogram) => histogram.add_value(value, sign),
            Instrument::Set(set) => set.add_value(value, sign),
        }
    }
    /// Whether the current window holds anything worth reporting.
    pub fn is_empty(&self) -> bool {
        match self {
            Instrument::Counter(counter) => counter.values.is_empty(),
            Instrument::Gauge(gauge) => gauge.values.is_empty(),
            Instrument::Histogram(histogram) => histogram.values.is_empty(),
            Instrument::Set(set) => set.members.is_empty(),
        }
    }
    pub fn drain(&self) -> Rollup {
        match self {
            Instrument::Counter(counter) => counter.drain(),
            Instrument::Gauge(gauge) => gauge.drain(),
            Instrument::Histogram(histogram) => histogram.drain(),
            Instrument::Set(set) => set.drain(),
        }
    }
    pub fn clear(&mut self) {
        match self {
            Instrument::Counter(counter) => counter.clear(),
            Instrument::Gauge(gauge) => gauge.clear(),
            Instrument::Histogram(histogram) => histogram.clear(),
            Instrument::Set(set) => set.clear(),
        }
    }
}

/// Running aggregate for one metric on one element.
#[derive(Clone, Debug)]
pub struct Aggregator {
    name: String,
    kind: MetricKind,
    sparse_data_strategy: String,
    unit: String,
    tags: Vec<Tag>,
    instrument: Instrument,
    last_touched: SystemTime,
}

impl Aggregator {
    pub fn new<S: Into<String>>(name: S, update: &MetricUpdate, now: SystemTime) -> Self {
        let mut tags = update.tags.clone();
        tags.push(Tag::pair(STATSD_TYPE_TAG, update.kind.code()));
        Self {
            name: name.into(),
            kind: update.kind,
            sparse_data_strategy: update
                .sparse_data_strategy
                .clone()
                .unwrap_or_else(|| DEFAULT_SPARSE_DATA_STRATEGY.to_string()),
            unit: update.unit.clone().unwrap_or_default(),
            tags,
            instrument: Instrument::for_kind(update.kind),
            last_touched: now,
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> MetricKind {
        self.kind
    }
    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }
    pub fn last_touched(&self) -> SystemTime {
        self.last_touched
    }
    pub fn accepts(&self, kind: MetricKind) -> bool {
        self.instrument.accepts(kind)
    }
    /// Nothing is buffered, or it's a gauge nobody has updated for longer than `gauge_ttl`.
    pub fn is_idle(&self, now: SystemTime, gauge_ttl: Duration) -> bool {
        match self.instrument {
            Instrument::Gauge(_) => now
                .duration_since(self.last_touched)
                .map(|untouched| untouched > gauge_ttl)
                .unwrap_or(false),
            _ => self.instrument.is_empty(),
        }
    }
    pub fn add_value(&mut self, update: &MetricUpdate, now: SystemTime) {
        if let Some(unit) = &update.unit {
            self.unit.clone_from(unit);
        }
        if let Some(strategy) = &update.sparse_data_strategy {
            self.sparse_data_strategy.clone_from(strategy);
        }
        self.instrument
            .add_value(update.value, update.sign, update.rate);
        self.last_touched = now;
    }
    /// Computes the outbound sample for the current window without clearing it.
    ///
    /// Returns `None` when the window holds no samples.
    pub fn drain(&self, element_id: &str, now: SystemTime) -> Option<OutboundSample> {
        if self.instrument.is_empty() {
            return None;
        }
        let rollup = self.instrument.drain();
        Some(OutboundSample {
            metric_id: self.name.clone(),
            timestamp: epoch_millis(now),
            value: rollup.value,
            metric_type: self.kind.wire_type(),
            element_id: element_id.to_string(),
            sparse_data_strategy: self.sparse_data_strategy.clone(),
            unit: self.unit.clone(),
            tags: self.tags.clone(),
            min: rollup.min,
            max: rollup.max,
            avg: rollup.avg,
            sum: rollup.sum,
            count: rollup.count,
        })
    }
    pub fn clear(&mut self) {
        self.instrument.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::{assert_relative_eq, relative_eq};
    use proptest::prelude::*;

    #[test]
    fn test_counter_sum_and_rate() {
        let mut counter = Counter::default();
        counter.add_value(3.0, None, None);
        counter.add_value(2.0, None, None);
        counter.add_value(4.0, Some(Sign::Minus), Some(0.5));
        let rollup = counter.drain();
        assert_relative_eq!(rollup.value, 3.0);
        assert_eq!(rollup.sum, Some(3.0));
        assert_eq!(rollup.count, Some(3));
        assert_eq!(rollup.min, Some(-2.0));
        assert_eq!(rollup.max, Some(3.0));
        assert_relative_eq!(rollup.avg.unwrap(), 1.0);
    }

    #[test]
    fn test_counter_clear_retains_nothing() {
        let mut counter = Counter::default();
        counter.add_value(1.0, None, None);
        counter.clear();
        assert_eq!(counter.drain(), Rollup::default());
        assert!(Instrument::Counter(counter).is_empty());
    }

    #[test]
    fn test_gauge_absolute_and_relative() {
        let mut gauge = Gauge::default();
        gauge.add_value(120.0, None);
        gauge.add_value(5.0, Some(Sign::Plus));
        assert_relative_eq!(gauge.value(), 125.0);
        gauge.add_value(25.0, Some(Sign::Minus));
        assert_relative_eq!(gauge.value(), 100.0);
        gauge.add_value(7.0, None);
        assert_relative_eq!(gauge.value(), 7.0);

        let rollup = gauge.drain();
        assert_relative_eq!(rollup.value, 7.0);
        assert_eq!(rollup.count, Some(4));
        assert_eq!(rollup.min, Some(7.0));
        assert_eq!(rollup.max, Some(125.0));
    }

    #[test]
    fn test_gauge_survives_clear() {
        let mut gauge = Gauge::default();
        gauge.add_value(42.0, None);
        gauge.add_value(43.0, None);
        gauge.clear();
        let rollup = gauge.drain();
        assert_relative_eq!(rollup.value, 43.0);
        assert_eq!(rollup.count, Some(1));
        assert_eq!(rollup.sum, Some(43.0));
        // Relative updates keep building on the retained level.
        gauge.add_value(2.0, Some(Sign::Plus));
        assert_relative_eq!(gauge.drain().value, 45.0);
    }

    #[test]
    fn test_histogram() {
        let mut histogram = Histogram::default();
        for v in [10.0, 30.0, 20.0] {
            histogram.add_value(v, None);
        }
        let rollup = histogram.drain();
        assert_relative_eq!(rollup.value, 20.0);
        assert_eq!(rollup.min, Some(10.0));
        assert_eq!(rollup.max, Some(30.0));
        assert_eq!(rollup.sum, Some(60.0));
        assert_eq!(rollup.count, Some(3));
        histogram.clear();
        assert_eq!(histogram.drain(), Rollup::default());
    }

    #[test]
    fn test_set_cardinality() {
        let mut set = Set::default();
        for v in [1.0, 2.0, 2.0, 3.0, 1.0] {
            set.add_value(v, None);
        }
        let rollup = set.drain();
        assert_relative_eq!(rollup.value, 3.0);
        assert_eq!(rollup.min, None);
        assert_eq!(rollup.avg, None);
        set.clear();
        assert_relative_eq!(set.drain().value, 0.0);
    }

    #[test]
    fn test_org_kinds() {
        let counter = Instrument::for_kind(MetricKind::Counter);
        assert!(counter.accepts(MetricKind::Counter));
        assert!(!counter.accepts(MetricKind::Gauge));

        let timer = Instrument::for_kind(MetricKind::Timer);
        assert!(timer.accepts(MetricKind::Histogram));
        assert!(timer.accepts(MetricKind::Timer));
        assert!(!timer.accepts(MetricKind::Set));

        let set = Instrument::for_kind(MetricKind::Set);
        assert!(matches!(set, Instrument::Set(_)));
        assert!(!set.accepts(MetricKind::Counter));
    }

    #[test]
    fn test_aggregator_sample() {
        let now = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(10);
        let update = MetricUpdate {
            unit: Some("ms".to_string()),
            ..MetricUpdate::new("db.query", 12.0, MetricKind::Timer)
                .with_tags(vec![Tag::pair("env", "prod")])
        };
        let mut aggregator = Aggregator::new("statsd.db.query", &update, now);
        aggregator.add_value(&update, now);
        aggregator.add_value(&MetricUpdate::new("db.query", 18.0, MetricKind::Histogram), now);

        let sample = aggregator.drain("web-1", now).expect("window has samples");
        assert_eq!(sample.metric_id, "statsd.db.query");
        assert_eq!(sample.timestamp, 10_000);
        assert_eq!(sample.element_id, "web-1");
        assert_eq!(sample.metric_type, "GAUGE");
        assert_eq!(sample.unit, "ms");
        assert_eq!(sample.sparse_data_strategy, "None");
        assert_eq!(
            sample.tags,
            vec![Tag::pair("env", "prod"), Tag::pair("statsdType", "ms")]
        );
        assert_relative_eq!(sample.value, 15.0);
        assert_eq!(sample.count, Some(2));

        // Draining twice without clearing yields the same sample.
        assert_eq!(aggregator.drain("web-1", now), Some(sample));
        aggregator.clear();
        assert_eq!(aggregator.drain("web-1", now), None);
    }

    #[test]
    fn test_aggregator_tracks_last_touched() {
        let start = SystemTime::UNIX_EPOCH;
        let later = start + std::time::Duration::from_secs(30);
        let update = MetricUpdate::new("hits", 1.0, MetricKind::Counter);
        let mut aggregator = Aggregator::new("hits", &update, start);
        assert_eq!(aggregator.last_touched(), start);
        aggregator.add_value(&update, later);
        assert_eq!(aggregator.last_touched(), later);
    }

    #[test]
    fn test_idle_aggregators() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let ttl = Duration::from_secs(900);

        let update = MetricUpdate::new("hits", 1.0, MetricKind::Counter);
        let mut counter = Aggregator::new("hits", &update, start);
        counter.add_value(&update, start);
        assert!(!counter.is_idle(start, ttl));
        counter.clear();
        assert!(counter.is_idle(start, ttl));

        let update = MetricUpdate::new("mem", 3.0, MetricKind::Gauge);
        let mut gauge = Aggregator::new("mem", &update, start);
        gauge.add_value(&update, start);
        gauge.clear();
        assert!(!gauge.is_idle(start + ttl, ttl));
        assert!(gauge.is_idle(start + ttl + Duration::from_secs(1), ttl));
    }

    proptest! {
        #[test]
        fn prop_counter_sum(updates in prop::collection::vec((0.0f64..1_000.0, 0.01f64..1.0, any::<bool>()), 1..64)) {
            let mut counter = Counter::default();
            let mut expected = 0.0;
            for (value, rate, negative) in &updates {
                let sign = if *negative { Some(Sign::Minus) } else { None };
                counter.add_value(*value, sign, Some(*rate));
                expected += if *negative { -(value * rate) } else { value * rate };
            }
            let rollup = counter.drain();
            prop_assert!(relative_eq!(rollup.sum.unwrap(), expected, epsilon = 1e-6, max_relative = 1e-9));
            prop_assert_eq!(rollup.count, Some(updates.len() as u64));
        }

        #[test]
        fn prop_set_cardinality(values in prop::collection::vec(0u8..32, 0..128)) {
            let mut set = Set::default();
            for v in &values {
                set.add_value(*v as f64, None);
            }
            let distinct: HashSet<u8> = values.iter().copied().collect();
            prop_assert_eq!(set.drain().value as usize, distinct.len());
        }

        #[test]
        fn prop_histogram_ordering(values in prop::collection::vec(-1_000.0f64..1_000.0, 1..64)) {
            let mut histogram = Histogram::default();
            for v in &values {
                histogram.add_value(*v, None);
            }
            let rollup = histogram.drain();
            let (min, max, avg) = (rollup.min.unwrap(), rollup.max.unwrap(), rollup.avg.unwrap());
            let slack = 1e-9 * avg.abs().max(1.0);
            prop_assert!(min <= avg + slack);
            prop_assert!(avg <= max + slack);
            prop_assert_eq!(rollup.count, Some(values.len() as u64));
        }
    }
}
