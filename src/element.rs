use std::{
    collections::{btree_map, BTreeMap, HashMap},
    time::{Duration, SystemTime},
};

use tracing::error;

use crate::{
    aggregator::Aggregator,
    metric::{MetricKind, MetricUpdate, OutboundSample, Tag},
};

const APP_VERSION_ATTRIBUTE: &str = "app.version";

/// What [`Elements::add_sample`] did with an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    /// The metric name was reused with an incompatible type; the old aggregator was discarded.
    Replaced { previous: MetricKind },
}

/// One monitored entity and its aggregates.
#[derive(Clone, Debug)]
pub struct Element {
    id: String,
    element_type: String,
    attributes: BTreeMap<String, String>,
    tags: Vec<Tag>,
    metrics: HashMap<String, Aggregator>,
    samples: Vec<OutboundSample>,
}

impl Element {
    pub fn new<I: Into<String>, T: Into<String>>(id: I, element_type: T) -> Self {
        Self {
            id: id.into(),
            element_type: element_type.into(),
            attributes: BTreeMap::new(),
            tags: Vec::new(),
            metrics: HashMap::new(),
            samples: Vec::new(),
        }
    }
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn element_type(&self) -> &str {
        &self.element_type
    }
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }
    pub fn add_tag(&mut self, tag: Tag) {
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }
    pub fn set_attribute<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.attributes.insert(key.into(), value.into());
    }
    pub fn metric(&self, metric_id: &str) -> Option<&Aggregator> {
        self.metrics.get(metric_id)
    }
    pub fn metrics(&self) -> impl Iterator<Item = &Aggregator> {
        self.metrics.values()
    }
    pub fn remove_metric(&mut self, metric_id: &str) -> Option<Aggregator> {
        self.metrics.remove(metric_id)
    }
    /// Samples computed by the last [`Element::prepare`].
    pub fn samples(&self) -> &[OutboundSample] {
        &self.samples
    }

    fn add_sample(&mut self, metric_id: &str, update: &MetricUpdate, now: SystemTime) -> Applied {
        if let Some(element_type) = &update.element_type {
            self.element_type.clone_from(element_type);
        }
        if let Some(version) = &update.app_version {
            self.set_attribute(APP_VERSION_ATTRIBUTE, version.as_str());
        }

        let applied = match self.metrics.get(metric_id) {
            None => Applied::Created,
            Some(existing) if existing.accepts(update.kind) => Applied::Updated,
            Some(existing) => {
                error!(
                    metric = metric_id,
                    element = %self.id,
                    old_kind = %existing.kind(),
                    new_kind = %update.kind,
                    "Metric type changed, discarding the previous aggregate."
                );
                Applied::Replaced {
                    previous: existing.kind(),
                }
            }
        };
        if applied != Applied::Updated {
            self.metrics.insert(
                metric_id.to_string(),
                Aggregator::new(metric_id, update, now),
            );
        }
        if let Some(aggregator) = self.metrics.get_mut(metric_id) {
            aggregator.add_value(update, now);
        }
        applied
    }

    /// Drains every aggregator into [`Element::samples`] and returns how many samples there are.
    ///
    /// Aggregators are left untouched so a failed delivery can be retried from the same state.
    pub fn prepare(&mut self, now: SystemTime) -> usize {
        self.samples.clear();
        let id = &self.id;
        self.samples.extend(
            self.metrics
                .values()
                .filter_map(|aggregator| aggregator.drain(id, now)),
        );
        self.samples
            .sort_by(|a, b| a.metric_id.cmp(&b.metric_id));
        self.samples.len()
    }

    /// Ends the current window for every aggregator.
    pub fn clear_samples(&mut self) {
        self.samples.clear();
        for aggregator in self.metrics.values_mut() {
            aggregator.clear();
        }
    }

    fn prune(&mut self, now: SystemTime, gauge_ttl: Duration) -> usize {
        let before = self.metrics.len();
        self.metrics
            .retain(|_, aggregator| !aggregator.is_idle(now, gauge_ttl));
        before - self.metrics.len()
    }
}

/// Every element known to the relay, keyed by element id.
///
/// The local host's element always exists.
#[derive(Clone, Debug)]
pub struct Elements {
    hostname: String,
    element_type: String,
    host_tags: Vec<Tag>,
    elements: BTreeMap<String, Element>,
}

impl Elements {
    pub fn new<H: Into<String>, T: Into<String>>(hostname: H, element_type: T) -> Self {
        let mut elements = Self {
            hostname: hostname.into(),
            element_type: element_type.into(),
            host_tags: Vec::new(),
            elements: BTreeMap::new(),
        };
        elements.delete_all();
        elements
    }
    /// Tags carried by the host element, reapplied whenever it is recreated.
    pub fn with_host_tags(mut self, tags: Vec<Tag>) -> Self {
        self.host_tags = tags;
        self.delete_all();
        self
    }
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
    pub fn len(&self) -> usize {
        self.elements.len()
    }
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
    pub fn get(&self, element_id: &str) -> Option<&Element> {
        self.elements.get(element_id)
    }
    pub fn host(&self) -> Option<&Element> {
        self.elements.get(&self.hostname)
    }
    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.elements.values_mut()
    }

    /// Routes an update to its element (the local host unless `h:` overrode it), creating the element
    /// and aggregator as needed.
    pub fn add_sample(&mut self, metric_id: &str, update: &MetricUpdate, now: SystemTime) -> Applied {
        let element_id = update.element_id.as_deref().unwrap_or(&self.hostname);
        let element = match self.elements.entry(element_id.to_string()) {
            btree_map::Entry::Occupied(occupied) => occupied.into_mut(),
            btree_map::Entry::Vacant(vacant) => {
                vacant.insert(Element::new(element_id, self.element_type.as_str()))
            }
        };
        element.add_sample(metric_id, update, now)
    }

    /// Drops every element and aggregate, leaving only an empty host element.
    pub fn delete_all(&mut self) {
        self.elements.clear();
        let mut host = Element::new(self.hostname.as_str(), self.element_type.as_str());
        for tag in &self.host_tags {
            host.add_tag(tag.clone());
        }
        self.elements.insert(self.hostname.clone(), host);
    }

    /// Drops one aggregator, from the host element when `element_id` is `None`.
    pub fn remove_metric(&mut self, element_id: Option<&str>, metric_id: &str) -> Option<Aggregator> {
        let element_id = element_id.unwrap_or(&self.hostname);
        self.elements.get_mut(element_id)?.remove_metric(metric_id)
    }

    /// Forgets idle aggregators (see [`Aggregator::is_idle`]), then every element other than the host that has
    /// none left. Returns how many aggregators were removed.
    pub fn prune(&mut self, now: SystemTime, gauge_ttl: Duration) -> usize {
        let removed: usize = self
            .elements
            .values_mut()
            .map(|element| element.prune(now, gauge_ttl))
            .sum();
        let hostname = &self.hostname;
        self.elements
            .retain(|id, element| id == hostname || !element.metrics.is_empty());
        removed
    }

    /// Clears buffered aggregator state for one element (the host when `element_id` is `None`), or for
    /// all of them when `everything` is set.
    pub fn clear_samples(&mut self, element_id: Option<&str>, everything: bool) {
        if everything {
            self.elements
                .values_mut()
                .for_each(Element::clear_samples);
            return;
        }
        let element_id = element_id.unwrap_or(&self.hostname);
        if let Some(element) = self.elements.get_mut(element_id) {
            element.clear_samples();
        }
    }

    pub fn prepare(&mut self, element_id: &str, now: SystemTime) -> usize {
        self.elements
            .get_mut(element_id)
            .map(|element| element.prepare(now))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metric::Sign;
    use approx::assert_relative_eq;
    use maplit::btreemap;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000)
    }

    fn elements() -> Elements {
        Elements::new("host-a", "SERVER")
    }

    #[test]
    fn test_host_element_always_exists() {
        let elements = elements();
        assert_eq!(elements.len(), 1);
        let host = elements.host().expect("host element");
        assert_eq!(host.id(), "host-a");
        assert_eq!(host.element_type(), "SERVER");
        assert_eq!(host.metrics().count(), 0);
    }

    #[test]
    fn test_counter_accumulates() {
        let mut elements = elements();
        let update = MetricUpdate::new("a.b", 3.0, MetricKind::Counter);
        assert_eq!(elements.add_sample("a.b", &update, now()), Applied::Created);
        let update = MetricUpdate::new("a.b", 2.0, MetricKind::Counter);
        assert_eq!(elements.add_sample("a.b", &update, now()), Applied::Updated);

        assert_eq!(elements.prepare("host-a", now()), 1);
        let sample = &elements.host().unwrap().samples()[0];
        assert_eq!(sample.sum, Some(5.0));
        assert_eq!(sample.count, Some(2));
        assert_eq!(sample.metric_type, "COUNTER");
    }

    #[test]
    fn test_element_override_creates_element() {
        let mut elements = elements();
        let update = MetricUpdate {
            element_type: Some("CONTAINER".to_string()),
            app_version: Some("2.1.0".to_string()),
            ..MetricUpdate::new("cpu", 0.5, MetricKind::Gauge).with_element_id("box-7")
        };
        elements.add_sample("cpu", &update, now());
        assert_eq!(elements.len(), 2);

        let element = elements.get("box-7").expect("created lazily");
        assert_eq!(element.element_type(), "CONTAINER");
        assert_eq!(
            element.attributes(),
            &btreemap! {"app.version".to_string() => "2.1.0".to_string()}
        );
        assert!(element.metric("cpu").is_some());
        assert!(elements.host().unwrap().metric("cpu").is_none());
    }

    #[test]
    fn test_type_conflict_replaces_aggregator() {
        let mut elements = elements();
        elements.add_sample("x", &MetricUpdate::new("x", 1.0, MetricKind::Counter), now());
        let applied = elements.add_sample("x", &MetricUpdate::new("x", 1.0, MetricKind::Gauge), now());
        assert_eq!(
            applied,
            Applied::Replaced {
                previous: MetricKind::Counter
            }
        );
        let aggregator = elements.host().unwrap().metric("x").unwrap();
        assert_eq!(aggregator.kind(), MetricKind::Gauge);
        assert_eq!(aggregator.instrument().drain().count, Some(1));
    }

    #[test]
    fn test_timer_and_histogram_share_aggregator() {
        let mut elements = elements();
        elements.add_sample("t", &MetricUpdate::new("t", 1.0, MetricKind::Timer), now());
        let applied = elements.add_sample("t", &MetricUpdate::new("t", 3.0, MetricKind::Histogram), now());
        assert_eq!(applied, Applied::Updated);
    }

    #[test]
    fn test_prepare_is_repeatable_until_cleared() {
        let mut elements = elements();
        elements.add_sample("hits", &MetricUpdate::new("hits", 4.0, MetricKind::Counter), now());
        elements.add_sample("uniq", &MetricUpdate::new("uniq", 9.0, MetricKind::Set), now());

        assert_eq!(elements.prepare("host-a", now()), 2);
        let first = elements.host().unwrap().samples().to_vec();
        assert_eq!(elements.prepare("host-a", now()), 2);
        assert_eq!(elements.host().unwrap().samples(), first.as_slice());

        elements.clear_samples(None, false);
        assert!(elements.host().unwrap().samples().is_empty());
        assert_eq!(elements.prepare("host-a", now()), 0);
    }

    #[test]
    fn test_gauge_reported_after_clear() {
        let mut elements = elements();
        elements.add_sample("mem", &MetricUpdate::new("mem", 120.0, MetricKind::Gauge), now());
        elements.add_sample(
            "mem",
            &MetricUpdate::new("mem", 5.0, MetricKind::Gauge).with_sign(Sign::Plus),
            now(),
        );
        elements.clear_samples(Some("host-a"), false);
        assert_eq!(elements.prepare("host-a", now()), 1);
        assert_relative_eq!(elements.host().unwrap().samples()[0].value, 125.0);
    }

    #[test]
    fn test_clear_everything() {
        let mut elements = elements();
        elements.add_sample("a", &MetricUpdate::new("a", 1.0, MetricKind::Counter), now());
        elements.add_sample(
            "b",
            &MetricUpdate::new("b", 1.0, MetricKind::Counter).with_element_id("other"),
            now(),
        );
        elements.clear_samples(None, true);
        assert_eq!(elements.prepare("host-a", now()), 0);
        assert_eq!(elements.prepare("other", now()), 0);
        assert_eq!(elements.len(), 2);
    }

    #[test]
    fn test_delete_all() {
        let mut elements = elements();
        elements.add_sample("a", &MetricUpdate::new("a", 1.0, MetricKind::Counter), now());
        elements.add_sample(
            "b",
            &MetricUpdate::new("b", 1.0, MetricKind::Counter).with_element_id("other"),
            now(),
        );
        elements.delete_all();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements.host().unwrap().metrics().count(), 0);
        assert!(elements.get("other").is_none());
    }

    #[test]
    fn test_prune_forgets_idle_elements_and_metrics() {
        let ttl = Duration::from_secs(900);
        let mut elements = elements();
        for i in 0..50 {
            let update = MetricUpdate::new(format!("m{i}"), 1.0, MetricKind::Counter)
                .with_element_id(format!("box-{i}"));
            elements.add_sample(&format!("m{i}"), &update, now());
        }
        elements.add_sample("hits", &MetricUpdate::new("hits", 1.0, MetricKind::Counter), now());
        elements.add_sample("mem", &MetricUpdate::new("mem", 8.0, MetricKind::Gauge), now());
        assert_eq!(elements.len(), 51);

        // Nothing is idle while windows still hold samples.
        assert_eq!(elements.prune(now(), ttl), 0);
        assert_eq!(elements.len(), 51);

        elements.clear_samples(None, true);
        assert_eq!(elements.prune(now(), ttl), 51);
        assert_eq!(elements.len(), 1);
        let host = elements.host().unwrap();
        assert!(host.metric("hits").is_none());
        assert!(host.metric("mem").is_some());

        let later = now() + ttl + Duration::from_secs(1);
        assert_eq!(elements.prune(later, ttl), 1);
        assert_eq!(elements.host().unwrap().metrics().count(), 0);
    }

    #[test]
    fn test_remove_metric() {
        let mut elements = elements();
        elements.add_sample("a", &MetricUpdate::new("a", 1.0, MetricKind::Counter), now());
        assert!(elements.remove_metric(None, "a").is_some());
        assert!(elements.remove_metric(None, "a").is_none());
        assert!(elements.remove_metric(Some("missing"), "a").is_none());
    }

    #[test]
    fn test_host_tags_survive_delete_all() {
        let mut elements = elements().with_host_tags(vec![Tag::pair("dc", "ams1")]);
        assert_eq!(elements.host().unwrap().tags(), &[Tag::pair("dc", "ams1")]);
        elements.delete_all();
        assert_eq!(elements.host().unwrap().tags(), &[Tag::pair("dc", "ams1")]);
    }

    #[test]
    fn test_element_tags_are_deduplicated() {
        let mut element = Element::new("e", "SERVER");
        element.add_tag(Tag::pair("role", "db"));
        element.add_tag(Tag::pair("role", "db"));
        assert_eq!(element.tags(), &[Tag::pair("role", "db")]);
    }
}
