//! Metrics registry and exporter hooks
//!
//! The registry defines every metric family the control plane exports;
//! counters are live, gauges are refreshed from component stats on an
//! interval. The HTTP exporter is a thin hook around the registry and is
//! optional (`--disable-metrics`).

pub mod metrics;
pub mod server;

pub use metrics::MetricsRegistry;
pub use server::{MetricsServer, MetricsServerConfig};
