//! statsd-relay is a StatsD/DogStatsD relay that aggregates locally before posting upstream.
//! The [Server](server::Server) reads datagrams off a UDP socket and hands them to the [Poster](poster::Poster),
//! which folds every parsed metric into per-element aggregates. Once per flush interval the poster drains
//! those aggregates and delivers them, along with any queued events, through a [TelemetryClient].
//!
//! ### Example: running a relay that re-emits to a Datadog agent
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use statsd_relay::*;
//!
//! let config = RelayConfig::default()
//!     .with_listen_addr("0.0.0.0", 8125)
//!     .with_interval(Duration::from_secs(10));
//! config.validate().expect("Invalid relay config!");
//!
//! let upstream = DogstatsdUpstream::from_env().expect("Failed to instantiate client!");
//! let poster = Poster::new(&config, Arc::new(upstream));
//! let flush_loop = poster.start();
//! let server = Server::bind(&config, poster.clone()).expect("Failed to bind!");
//! server.start().join().expect("Server thread panicked!");
//! poster.stop();
//! flush_loop.join().expect("Flush thread panicked!");
//! ```
//! # Usage
//!
//! ## Wire format
//!
//! Each datagram holds one message per line. Metric lines look like `name:value|type[|@rate][|#tags]`
//! where `type` is one of `c`, `g`, `ms`, `h` or `s`. DogStatsD events (`_e{<title len>,<text len>}:title|text|...`) and
//! service checks (`_sc|name|status|...`) are queued and posted as events.
//!
//! Parsing is all-or-nothing per datagram: one malformed line drops the whole packet.
//!
//! A handful of tags are reserved and consumed rather than passed through: `h:` routes the metric to another element,
//! `un:` sets the unit, `sds:` the sparse data strategy, `ty:` the element type and `v:` the element's `app.version`.
//!
//! ## Elements
//!
//! Every metric belongs to an element, by default the local host. Samples are kept per element and aggregated by type:
//! counters sum, gauges keep their last value, timers and histograms roll up min/max/avg/sum/count, and sets count
//! distinct members.
//!
//! ## Delivery failures
//!
//! An element whose post fails keeps its aggregates for the next cycle. If the upstream keeps failing for longer than
//! `max(interval * 15, 900s)` everything buffered is dropped, see [Poster::flush](poster::Poster::flush).
//!

/// [Aggregator](aggregator::Aggregator) keeps the samples of one metric between flushes.
pub mod aggregator;
/// [TelemetryClient] is the seam between the relay and wherever flushed data goes.
pub mod client;
pub mod config;
/// [Elements](element::Elements) is the registry of monitored entities and their aggregates.
pub mod element;
pub mod metric;
pub mod parser;
/// [Poster](poster::Poster) owns the registry and runs the flush loop.
pub mod poster;
pub mod server;

pub use client::{DogstatsdUpstream, PostError, TelemetryClient};
pub use config::{ConfigError, RelayConfig};
pub use metric::*;
pub use poster::{FlushOutcome, Poster, PosterStats};
pub use server::{Server, ServerError, StopHandle};
