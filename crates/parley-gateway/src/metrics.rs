//! Session metrics.
//!
//! `MetricsCollector` is created once by the server and shared with every
//! session. Counters are kept locally (for `/health` and tests) and mirrored
//! to the `metrics` facade when the `metrics` feature is enabled.

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return the handle for rendering `/metrics`.
#[cfg(feature = "metrics")]
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    sessions_started: AtomicU64,
    sessions_ended: AtomicU64,
    active_sessions: AtomicU64,
    turns: AtomicU64,
    interrupts: AtomicU64,
    generation_failures: AtomicU64,
    synthesis_failures: AtomicU64,
    stt_reconnects: AtomicU64,
    persistence_failures: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub active_sessions: u64,
    pub turns: u64,
    pub interrupts: u64,
    pub generation_failures: u64,
    pub synthesis_failures: u64,
    pub stt_reconnects: u64,
    pub persistence_failures: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("parley_sessions_started_total").increment(1);
            metrics::gauge!("parley_sessions_active").increment(1.0);
        }
    }

    pub fn session_ended(&self) {
        self.sessions_ended.fetch_add(1, Ordering::Relaxed);
        // Never underflow if an end is reported without a start.
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("parley_sessions_ended_total").increment(1);
            metrics::gauge!("parley_sessions_active").decrement(1.0);
        }
    }

    pub fn turn(&self) {
        self.turns.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!("parley_turns_total").increment(1);
    }

    pub fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!("parley_interrupts_total").increment(1);
    }

    pub fn generation_failed(&self) {
        self.generation_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error("generation");
    }

    pub fn synthesis_failed(&self) {
        self.synthesis_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error("tts");
    }

    pub fn stt_reconnect(&self) {
        self.stt_reconnects.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!("parley_stt_reconnects_total").increment(1);
    }

    pub fn persistence_failed(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error("persistence");
    }

    /// Count an error by `ParleyError::kind` label.
    pub fn record_error(&self, kind: &str) {
        #[cfg(feature = "metrics")]
        {
            let labels = [("kind", kind.to_string())];
            metrics::counter!("parley_errors_total", &labels).increment(1);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = kind;
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_ended: self.sessions_ended.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            turns: self.turns.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            generation_failures: self.generation_failures.load(Ordering::Relaxed),
            synthesis_failures: self.synthesis_failures.load(Ordering::Relaxed),
            stt_reconnects: self.stt_reconnects.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}
