use std::{fmt, time::SystemTime};

use derive_more::Display;

/// The statsd metric type a line was sent with.
#[derive(Clone, Copy, Debug, Display, Hash, PartialEq, Eq)]
pub enum MetricKind {
    #[display("c")]
    Counter,
    #[display("g")]
    Gauge,
    #[display("ms")]
    Timer,
    #[display("h")]
    Histogram,
    #[display("s")]
    Set,
}

impl MetricKind {
    /// Maps the one/two-letter type code from the wire.
    pub fn from_code(code: &[u8]) -> Option<Self> {
        match code {
            b"c" => Some(MetricKind::Counter),
            b"g" => Some(MetricKind::Gauge),
            b"ms" => Some(MetricKind::Timer),
            b"h" => Some(MetricKind::Histogram),
            b"s" => Some(MetricKind::Set),
            _ => None,
        }
    }
    pub fn code(&self) -> &'static str {
        match self {
            MetricKind::Counter => "c",
            MetricKind::Gauge => "g",
            MetricKind::Timer => "ms",
            MetricKind::Histogram => "h",
            MetricKind::Set => "s",
        }
    }
    /// Metric type name in the upstream data model.
    pub fn wire_type(&self) -> &'static str {
        match self {
            MetricKind::Counter => "COUNTER",
            _ => "GAUGE",
        }
    }
}

/// Explicit `+`/`-` prefix on a value, meaning "adjust" rather than "set".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sign {
    Plus,
    Minus,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tag {
    pub key: String,
    pub value: Option<String>,
}

impl Tag {
    pub fn new<K: Into<String>>(key: K, value: Option<&str>) -> Self {
        Self {
            key: key.into(),
            value: value.map(str::to_string),
        }
    }
    pub fn pair<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}:{}", self.key, value),
            None => f.write_str(&self.key),
        }
    }
}

/// One parsed metric line.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricUpdate {
    pub name: String,
    pub value: f64,
    pub kind: MetricKind,
    pub sign: Option<Sign>,
    pub rate: Option<f64>,
    pub tags: Vec<Tag>,
    /// `h:` tag, routes the sample to another element than the local host.
    pub element_id: Option<String>,
    /// `un:` tag
    pub unit: Option<String>,
    /// `sds:` tag
    pub sparse_data_strategy: Option<String>,
    /// `ty:` tag, overrides the owning element's type.
    pub element_type: Option<String>,
    /// `v:` tag, stored as the element's `app.version` attribute.
    pub app_version: Option<String>,
}

impl MetricUpdate {
    pub fn new<S: Into<String>>(name: S, value: f64, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            value,
            kind,
            sign: None,
            rate: None,
            tags: Vec::new(),
            element_id: None,
            unit: None,
            sparse_data_strategy: None,
            element_type: None,
            app_version: None,
        }
    }
    pub fn with_sign(self, sign: Sign) -> Self {
        Self {
            sign: Some(sign),
            ..self
        }
    }
    pub fn with_rate(self, rate: f64) -> Self {
        Self {
            rate: Some(rate),
            ..self
        }
    }
    pub fn with_tags(self, tags: Vec<Tag>) -> Self {
        Self { tags, ..self }
    }
    pub fn with_element_id<S: Into<String>>(self, element_id: S) -> Self {
        Self {
            element_id: Some(element_id.into()),
            ..self
        }
    }
}

/// A DogStatsD event or service check.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventRecord {
    pub title: String,
    pub text: String,
    /// Seconds since the Unix epoch.
    pub date_happened: Option<u64>,
    pub hostname: Option<String>,
    pub aggregation_key: Option<String>,
    pub priority: Option<String>,
    pub source_type_name: Option<String>,
    pub alert_type: Option<String>,
    pub tags: Vec<Tag>,
}

/// A drained metric value as handed to the upstream client.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundSample {
    pub metric_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub value: f64,
    pub metric_type: &'static str,
    pub element_id: String,
    pub sparse_data_strategy: String,
    pub unit: String,
    pub tags: Vec<Tag>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub sum: Option<f64>,
    pub count: Option<u64>,
}

pub(crate) fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
