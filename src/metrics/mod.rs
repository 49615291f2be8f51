//! Per-transport latency/reliability tracking and scoring.
//!
//! Every [`Transport`](crate::transport::Transport) owns exactly one
//! [`TransportMetrics`]; sends, probes and pings record into it and the
//! connection pool ranks transports by [`TransportMetrics::score`].

mod transport_metrics;

pub use transport_metrics::{MetricsSnapshot, TransportMetrics};

use std::time::Duration;

/// Maximum latency samples retained per transport.
pub const MAX_LATENCY_SAMPLES: usize = 100;

/// Samples averaged for `avg_latency_ms`.
pub const AVERAGE_WINDOW: usize = 10;

/// Latency at which the latency component of the score reaches zero.
pub const LATENCY_CEILING_MS: f64 = 500.0;

/// Consecutive failures at which a transport stops being healthy.
pub const UNHEALTHY_FAILURES: u32 = 3;

/// Maximum recency penalty applied right after a failure.
pub const RECENCY_PENALTY: f64 = 0.2;

/// Window over which the recency penalty decays to zero.
pub const RECENCY_WINDOW: Duration = Duration::from_secs(30);

/// Score weights.
pub const LATENCY_WEIGHT: f64 = 0.4;
pub const RELIABILITY_WEIGHT: f64 = 0.4;
pub const BATTERY_WEIGHT: f64 = 0.2;
