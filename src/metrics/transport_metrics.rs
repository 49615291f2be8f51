//! Rolling statistics for one transport instance.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{
    AVERAGE_WINDOW, BATTERY_WEIGHT, LATENCY_CEILING_MS, LATENCY_WEIGHT, MAX_LATENCY_SAMPLES,
    RECENCY_PENALTY, RECENCY_WINDOW, RELIABILITY_WEIGHT, UNHEALTHY_FAILURES,
};
use crate::types::{TransportState, TransportType};

#[derive(Debug)]
struct Inner {
    /// Ring buffer of latency samples in milliseconds.
    samples: VecDeque<f64>,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
}

/// Latency and success/failure statistics for one transport.
///
/// Interior mutability lets the owning transport record through `&self`;
/// nothing outside that transport writes here.
#[derive(Debug)]
pub struct TransportMetrics {
    transport_type: TransportType,
    inner: Mutex<Inner>,
}

/// Point-in-time copy of the metrics, for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub transport_type: TransportType,
    pub avg_latency_ms: Option<f64>,
    pub success_rate: f64,
    pub packet_loss: f64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub samples: usize,
    pub score: f64,
}

impl TransportMetrics {
    pub fn new(transport_type: TransportType) -> Self {
        Self {
            transport_type,
            inner: Mutex::new(Inner {
                samples: VecDeque::with_capacity(MAX_LATENCY_SAMPLES),
                successes: 0,
                failures: 0,
                consecutive_failures: 0,
                last_failure: None,
                last_success: None,
            }),
        }
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    /// Record a successful operation with a measured latency.
    pub fn record_latency(&self, latency: Duration) {
        self.record_sample(latency);
        self.record_success();
    }

    /// Add a latency sample to an operation already counted by `record_success`.
    pub fn record_sample(&self, latency: Duration) {
        let mut inner = self.inner.lock();
        if inner.samples.len() >= MAX_LATENCY_SAMPLES {
            inner.samples.pop_front();
        }
        inner.samples.push_back(latency.as_secs_f64() * 1000.0);
    }

    /// Record a successful operation without a latency sample.
    pub fn record_success(&self) {
        Self::success_locked(&mut self.inner.lock());
    }

    fn success_locked(inner: &mut Inner) {
        inner.successes += 1;
        inner.consecutive_failures = 0;
        inner.last_success = Some(Instant::now());
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub(crate) fn record_failure_at(&self, at: Instant) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(at);
    }

    /// Average of the most recent samples, `None` before the first sample.
    pub fn avg_latency_ms(&self) -> Option<f64> {
        let inner = self.inner.lock();
        Self::avg_locked(&inner)
    }

    fn avg_locked(inner: &Inner) -> Option<f64> {
        if inner.samples.is_empty() {
            return None;
        }
        let recent: Vec<f64> = inner
            .samples
            .iter()
            .rev()
            .take(AVERAGE_WINDOW)
            .copied()
            .collect();
        Some(recent.iter().sum::<f64>() / recent.len() as f64)
    }

    /// Fraction of successful operations; 1.0 before any attempt.
    pub fn success_rate(&self) -> f64 {
        let inner = self.inner.lock();
        1.0 - Self::loss_locked(&inner)
    }

    /// Fraction of failed operations; 0.0 before any attempt.
    pub fn packet_loss(&self) -> f64 {
        Self::loss_locked(&self.inner.lock())
    }

    fn loss_locked(inner: &Inner) -> f64 {
        let total = inner.successes + inner.failures;
        if total == 0 {
            0.0
        } else {
            inner.failures as f64 / total as f64
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn sample_count(&self) -> usize {
        self.inner.lock().samples.len()
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.inner.lock().last_success
    }

    /// Healthy = connected and fewer than three consecutive failures.
    pub fn is_healthy(&self, state: TransportState) -> bool {
        state == TransportState::Connected && self.consecutive_failures() < UNHEALTHY_FAILURES
    }

    /// Weighted score in roughly `[-0.2, 1.0]`, higher is better.
    ///
    /// `0.4 * latency + 0.4 * reliability + 0.2 * battery - recency_penalty`
    pub fn score(&self) -> f64 {
        self.score_at(Instant::now())
    }

    /// Score as seen at `now` (lets callers pin the recency clock).
    pub fn score_at(&self, now: Instant) -> f64 {
        let inner = self.inner.lock();

        let latency_score = Self::avg_locked(&inner)
            .map_or(0.5, |avg| (1.0 - avg / LATENCY_CEILING_MS).max(0.0));
        let reliability_score = 1.0 - Self::loss_locked(&inner);
        let battery_score = 1.0 - self.transport_type.battery_cost();

        let penalty = match inner.last_failure {
            Some(at) if inner.consecutive_failures > 0 => {
                let elapsed = now.saturating_duration_since(at);
                if elapsed >= RECENCY_WINDOW {
                    0.0
                } else {
                    RECENCY_PENALTY * (1.0 - elapsed.as_secs_f64() / RECENCY_WINDOW.as_secs_f64())
                }
            }
            _ => 0.0,
        };

        LATENCY_WEIGHT * latency_score
            + RELIABILITY_WEIGHT * reliability_score
            + BATTERY_WEIGHT * battery_score
            - penalty
    }

    /// Score gated on health: unhealthy transports score zero.
    pub fn effective_score(&self, state: TransportState) -> f64 {
        if self.is_healthy(state) {
            self.score()
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let score = self.score();
        let inner = self.inner.lock();
        MetricsSnapshot {
            transport_type: self.transport_type,
            avg_latency_ms: Self::avg_locked(&inner),
            success_rate: 1.0 - Self::loss_locked(&inner),
            packet_loss: Self::loss_locked(&inner),
            successes: inner.successes,
            failures: inner.failures,
            consecutive_failures: inner.consecutive_failures,
            samples: inner.samples.len(),
            score,
        }
    }

    /// Summary string for logs.
    pub fn summary(&self) -> String {
        let snap = self.snapshot();
        format!(
            "{} avg={} loss={:.1}% score={:.3}",
            snap.transport_type,
            snap.avg_latency_ms
                .map_or_else(|| "n/a".to_string(), |ms| format!("{ms:.1}ms")),
            snap.packet_loss * 100.0,
            snap.score
        )
    }
}
