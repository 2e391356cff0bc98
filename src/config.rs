use std::time::Duration;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::debug;

use crate::metric::Tag;

pub const INTERVAL_SECS_ENV_VAR: &str = "STATSD_RELAY_INTERVAL_SECS";
pub const HOSTNAME_ENV_VAR: &str = "HOSTNAME";

const DEFAULT_LISTEN_IP: &str = "localhost";
const DEFAULT_STATSD_PORT: u16 = 8125;
const DEFAULT_INTERVAL_SECS: u64 = 60;
const DEFAULT_ELEMENT_TYPE: &str = "SERVER";
const DEFAULT_PREFIX: &str = "statsd";
const DEFAULT_HOSTNAME: &str = "localhost";
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
// Failures are tolerated for at least this long before buffered data is dropped.
const MIN_FLUSH_ERROR_MAX: Duration = Duration::from_secs(900);
const FLUSH_ERROR_INTERVALS: u32 = 15;

static LOCAL_HOSTNAME: OnceCell<String> = OnceCell::new();

fn local_hostname() -> &'static str {
    LOCAL_HOSTNAME.get_or_init(|| match std::env::var(HOSTNAME_ENV_VAR) {
        Ok(hostname) if !hostname.trim().is_empty() => hostname.trim().to_string(),
        _ => {
            debug!("{HOSTNAME_ENV_VAR} wasn't set, falling back to {DEFAULT_HOSTNAME}.");
            DEFAULT_HOSTNAME.to_string()
        }
    })
}

fn get_env_or_fallback(env_var: &str, fallback: u64) -> u64 {
    match std::env::var(env_var) {
        Err(_) => {
            debug!("Falling back to default, {env_var} wasn't specified and wasn't set in the code.");
            fallback
        }
        Ok(value) => value.parse::<u64>().unwrap_or_else(|_| {
            debug!("Couldn't parse {env_var} as a u64, falling back to default.");
            fallback
        }),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("flush interval must be greater than zero")]
    ZeroInterval,
    #[error("forwarding is enabled but no forward address was given")]
    MissingForwardAddress,
}

/// Already-parsed relay settings.
///
/// Optional values fall back to the environment, then to built-in defaults.
#[derive(Clone, Debug, Default)]
pub struct RelayConfig {
    pub listen_ip: Option<String>,
    pub listen_port: Option<u16>,
    pub forward: bool,
    pub forward_ip: Option<String>,
    pub forward_port: Option<u16>,
    pub interval: Option<Duration>,
    pub element_type: Option<String>,
    pub prefix: Option<String>,
    pub hostname: Option<String>,
    pub no_internal_metrics: bool,
    pub read_timeout: Option<Duration>,
    /// Tags attached to the local host's element.
    pub tags: Vec<Tag>,
}

impl RelayConfig {
    pub fn with_listen_addr<S: Into<String>>(mut self, ip: S, port: u16) -> Self {
        self.listen_ip = Some(ip.into());
        self.listen_port = Some(port);
        self
    }
    pub fn with_forward<S: Into<String>>(mut self, ip: S, port: u16) -> Self {
        self.forward = true;
        self.forward_ip = Some(ip.into());
        self.forward_port = Some(port);
        self
    }
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
    pub fn with_hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.hostname = Some(hostname.into());
        self
    }
    pub fn with_element_type<S: Into<String>>(mut self, element_type: S) -> Self {
        self.element_type = Some(element_type.into());
        self
    }
    pub fn with_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
    pub fn without_internal_metrics(mut self) -> Self {
        self.no_internal_metrics = true;
        self
    }
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }
    pub fn with_tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.tags.push(Tag::pair(key, value));
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.get_interval().is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.forward && self.forward_ip.is_none() {
            return Err(ConfigError::MissingForwardAddress);
        }
        Ok(())
    }

    pub fn get_listen_ip(&self) -> &str {
        self.listen_ip.as_deref().unwrap_or(DEFAULT_LISTEN_IP)
    }
    pub fn get_listen_port(&self) -> u16 {
        self.listen_port.unwrap_or(DEFAULT_STATSD_PORT)
    }
    /// The forward target, when forwarding is enabled.
    pub fn get_forward_addr(&self) -> Option<(&str, u16)> {
        if !self.forward {
            return None;
        }
        let ip = self.forward_ip.as_deref()?;
        Some((ip, self.forward_port.unwrap_or(DEFAULT_STATSD_PORT)))
    }
    pub fn get_interval(&self) -> Duration {
        self.interval.unwrap_or_else(|| {
            Duration::from_secs(get_env_or_fallback(
                INTERVAL_SECS_ENV_VAR,
                DEFAULT_INTERVAL_SECS,
            ))
        })
    }
    pub fn get_element_type(&self) -> &str {
        self.element_type.as_deref().unwrap_or(DEFAULT_ELEMENT_TYPE)
    }
    pub fn get_prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or(DEFAULT_PREFIX)
    }
    pub fn get_hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or_else(|| local_hostname())
    }
    pub fn get_read_timeout(&self) -> Duration {
        self.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT)
    }
    /// How long flushes may keep failing before buffered data is dropped: `max(interval * 15, 900s)`.
    pub fn flush_error_max(&self) -> Duration {
        (self.get_interval() * FLUSH_ERROR_INTERVALS).max(MIN_FLUSH_ERROR_MAX)
    }
    /// Applies the metric-name prefix, if any.
    pub fn metric_id(&self, name: &str) -> String {
        match self.get_prefix() {
            "" => name.to_string(),
            prefix => format!("{prefix}.{name}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default().with_interval(Duration::from_secs(60));
        assert_eq!(config.get_listen_ip(), "localhost");
        assert_eq!(config.get_listen_port(), 8125);
        assert_eq!(config.get_forward_addr(), None);
        assert_eq!(config.get_element_type(), "SERVER");
        assert_eq!(config.get_prefix(), "statsd");
        assert_eq!(config.get_read_timeout(), Duration::from_secs(5));
        assert!(!config.get_hostname().is_empty());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_hostname_override() {
        let config = RelayConfig::default().with_hostname("web-7");
        assert_eq!(config.get_hostname(), "web-7");
        let fallback = RelayConfig::default();
        assert_eq!(fallback.get_hostname(), local_hostname());
    }

    #[test]
    fn test_host_tags() {
        let config = RelayConfig::default()
            .with_tag("dc", "ams1")
            .with_tag("role", "edge");
        assert_eq!(config.tags, vec![Tag::pair("dc", "ams1"), Tag::pair("role", "edge")]);
    }

    #[test]
    fn test_flush_error_max() {
        let short = RelayConfig::default().with_interval(Duration::from_secs(10));
        assert_eq!(short.flush_error_max(), Duration::from_secs(900));
        let long = RelayConfig::default().with_interval(Duration::from_secs(120));
        assert_eq!(long.flush_error_max(), Duration::from_secs(1_800));
    }

    #[test]
    fn test_metric_id_prefix() {
        let config = RelayConfig::default();
        assert_eq!(config.metric_id("foo"), "statsd.foo");
        let config = RelayConfig::default().with_prefix("");
        assert_eq!(config.metric_id("foo"), "foo");
    }

    #[test]
    fn test_forward_addr() {
        let config = RelayConfig::default().with_forward("10.0.0.2", 9125);
        assert_eq!(config.get_forward_addr(), Some(("10.0.0.2", 9125)));

        let config = RelayConfig {
            forward: true,
            ..Default::default()
        }
        .with_interval(Duration::from_secs(1));
        assert_eq!(config.validate(), Err(ConfigError::MissingForwardAddress));
    }

    #[test]
    fn test_zero_interval_is_invalid() {
        let config = RelayConfig::default().with_interval(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroInterval));
    }
}
