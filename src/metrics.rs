// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for searchbox.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `searchbox_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `index`: configured index name
//! - `stage`: compile, facet_search, execute
//! - `hook`: stable hook identifier
//! - `status`: success, error, contract_violation

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a compile outcome for an index
pub fn record_compile(index: &str, status: &str) {
    counter!(
        "searchbox_compiles_total",
        "index" => index.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record latency of one stage
pub fn record_latency(stage: &str, duration: Duration) {
    histogram!(
        "searchbox_stage_seconds",
        "stage" => stage.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a hook callback invocation
pub fn record_hook_invocation(hook: &str, status: &str) {
    counter!(
        "searchbox_hook_invocations_total",
        "hook" => hook.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Set the number of registered hook callbacks
pub fn set_registered_hooks(count: usize) {
    gauge!("searchbox_registered_hooks").set(count as f64);
}

/// Record facet aggregations compiled for one request
pub fn record_facet_aggregations(count: usize) {
    histogram!("searchbox_facet_aggregations").record(count as f64);
}

/// Record an executed search
pub fn record_search(index: &str, status: &str) {
    counter!(
        "searchbox_searches_total",
        "index" => index.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record hit count of one search
pub fn record_hits(count: usize) {
    histogram!("searchbox_hits").record(count as f64);
}

/// Record an error by kind
pub fn record_error(kind: &'static str) {
    counter!(
        "searchbox_errors_total",
        "kind" => kind
    )
    .increment(1);
}

/// Record a retried executor operation
pub fn record_retry(operation: &str, attempt: usize) {
    counter!(
        "searchbox_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
    histogram!(
        "searchbox_retry_attempt",
        "operation" => operation.to_string()
    )
    .record(attempt as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    stage: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.stage, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_recorders_do_not_panic_without_exporter() {
        record_compile("products", "success");
        record_latency("compile", Duration::from_micros(100));
        record_hook_invocation("filter.global", "success");
        set_registered_hooks(3);
        record_facet_aggregations(4);
        record_search("products", "error");
        record_hits(20);
        record_error("malformed_filter");
        record_retry("connect", 2);
    }

    #[test]
    fn test_latency_timer() {
        let timer = LatencyTimer::new("compile");
        std::thread::sleep(Duration::from_micros(10));
        assert!(timer.elapsed() >= Duration::from_micros(10));
    }

    #[test]
    fn test_compile_counter_is_labelled() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, || {
            record_compile("products", "success");
            record_compile("products", "success");
        });

        let counted: Vec<u64> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == "searchbox_compiles_total")
            .filter_map(|(_, _, _, value)| match value {
                DebugValue::Counter(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(counted, vec![2]);
    }
}
