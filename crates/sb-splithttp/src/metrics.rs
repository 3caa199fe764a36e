//! # 指标 / Metrics
//!
//! Prometheus counters for the split-HTTP server side, compiled only with the
//! `metrics` feature. They live in a crate-local registry; embedders gather it
//! through [`registry`] and merge it into their own exposition.
//! 仅在启用 `metrics` 特性时编译；指标注册到本 crate 的注册表中。

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static METRICS: Lazy<SplitHttpMetrics> = Lazy::new(|| SplitHttpMetrics::register(&REGISTRY));

pub struct SplitHttpMetrics {
    /// Sessions currently held by a registry.
    pub sessions_active: IntGauge,
    /// Sessions removed by the idle sweep.
    pub sessions_evicted: IntCounter,
    /// Upload segments by outcome: `accepted` or `duplicate`.
    pub segments: IntCounterVec,
    /// Payload bytes by direction: `up` (client to server) or `down`.
    pub bytes: IntCounterVec,
    /// Client uploads that failed (transport error or non-2xx).
    pub upload_failures: IntCounter,
}

impl SplitHttpMetrics {
    fn register(registry: &Registry) -> Self {
        let metrics = Self {
            sessions_active: int_gauge("splithttp_sessions_active", "Active split-http sessions"),
            sessions_evicted: int_counter(
                "splithttp_sessions_evicted_total",
                "Sessions removed by the idle sweep",
            ),
            segments: int_counter_vec(
                "splithttp_segments_total",
                "Upload segments by outcome",
                &["result"],
            ),
            bytes: int_counter_vec(
                "splithttp_bytes_total",
                "Payload bytes by direction",
                &["dir"],
            ),
            upload_failures: int_counter(
                "splithttp_upload_failures_total",
                "Failed client upload requests",
            ),
        };
        // Best-effort: a duplicate name leaves the metric unregistered but usable.
        let _ = registry.register(Box::new(metrics.sessions_active.clone()));
        let _ = registry.register(Box::new(metrics.sessions_evicted.clone()));
        let _ = registry.register(Box::new(metrics.segments.clone()));
        let _ = registry.register(Box::new(metrics.bytes.clone()));
        let _ = registry.register(Box::new(metrics.upload_failures.clone()));
        metrics
    }
}

fn int_gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).unwrap_or_else(|_| {
        #[allow(clippy::unwrap_used)]
        IntGauge::new("dummy_gauge", "dummy").unwrap()
    })
}

fn int_counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).unwrap_or_else(|_| {
        #[allow(clippy::unwrap_used)]
        IntCounter::new("dummy_counter", "dummy").unwrap()
    })
}

fn int_counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).unwrap_or_else(|_| {
        #[allow(clippy::unwrap_used)]
        IntCounterVec::new(Opts::new("dummy_counter_vec", "dummy"), &["label"]).unwrap()
    })
}

/// Process-wide split-HTTP metrics.
pub fn global() -> &'static SplitHttpMetrics {
    &METRICS
}

/// Registry holding every split-HTTP metric.
pub fn registry() -> &'static Registry {
    Lazy::force(&METRICS);
    &REGISTRY
}
