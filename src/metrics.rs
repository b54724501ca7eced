// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for tenant-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding service is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `tenant_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: pull, push, dispatch
//! - `status`: ok, or the error code (`AccessDeniedError`, `TimeoutError`, ...)
//! - `procedure`: registered procedure name
//!
//! Tenant ids appear only on the conflict counter, where the tenant is what
//! an operator needs to find.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════════════════════

/// Record a finished pull, push or dispatch
pub fn record_request(operation: &str, status: &str) {
    counter!(
        "tenant_sync_requests_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record request latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "tenant_sync_request_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a request that hit its deadline
pub fn record_timeout(operation: &str) {
    counter!(
        "tenant_sync_timeouts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Pull
// ═══════════════════════════════════════════════════════════════════════════

/// Record the number of patch operations returned by one pull
pub fn record_patch_size(ops: usize) {
    histogram!("tenant_sync_patch_operations").record(ops as f64);
}

/// Record rows sent for one view, by diff outcome
pub fn record_view_rows(view: &str, creates: usize, updates: usize, deletes: usize, fast_forward: usize) {
    for (kind, count) in [
        ("create", creates),
        ("update", updates),
        ("delete", deletes),
        ("fast_forward", fast_forward),
    ] {
        if count > 0 {
            counter!(
                "tenant_sync_diff_rows_total",
                "view" => view.to_string(),
                "kind" => kind
            )
            .increment(count as u64);
        }
    }
}

/// Record a pull cut short by the row budget
pub fn record_partial_pull() {
    counter!("tenant_sync_partial_pulls_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Push and dispatch
// ═══════════════════════════════════════════════════════════════════════════

/// Record one pushed mutation: applied, skipped (already processed) or failed
pub fn record_mutation(outcome: &str) {
    counter!(
        "tenant_sync_mutations_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a dispatched procedure with its outcome and latency
pub fn record_dispatch(procedure: &str, status: &str, duration: Duration) {
    counter!(
        "tenant_sync_dispatch_total",
        "procedure" => procedure.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "tenant_sync_dispatch_seconds",
        "procedure" => procedure.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a policy denial by predicate class (static, relationship, state)
pub fn record_policy_denial(procedure: &str, kind: &str) {
    counter!(
        "tenant_sync_policy_denials_total",
        "procedure" => procedure.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a fallback effect replacing a denied mutation
pub fn record_fallback(procedure: &str, fallback: &str) {
    counter!(
        "tenant_sync_fallbacks_total",
        "procedure" => procedure.to_string(),
        "fallback" => fallback.to_string()
    )
    .increment(1);
}

/// Set the number of client groups holding a push lock entry
pub fn set_push_lock_entries(count: usize) {
    gauge!("tenant_sync_push_lock_entries").set(count as f64);
}

/// Record a poke publish attempt
pub fn record_poke(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "tenant_sync_pokes_total",
        "status" => status
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Storage
// ═══════════════════════════════════════════════════════════════════════════

/// Record a commit rejected by optimistic locking (the transaction is re-run)
pub fn record_transaction_conflict(tenant_id: &str) {
    counter!(
        "tenant_sync_transaction_conflicts_total",
        "tenant_id" => tenant_id.to_string()
    )
    .increment(1);
}

/// Record a storage backend error by kind
pub fn record_store_error(backend: &str, kind: &str) {
    counter!(
        "tenant_sync_store_errors_total",
        "backend" => backend.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder is installed: these only check the calls are well-formed.

    #[test]
    fn test_request_metrics() {
        record_request("pull", "ok");
        record_request("push", "TimeoutError");
        record_latency("dispatch", Duration::from_millis(3));
        record_timeout("pull");
    }

    #[test]
    fn test_pull_metrics() {
        record_patch_size(12);
        record_view_rows("products", 3, 1, 0, 2);
        record_partial_pull();
    }

    #[test]
    fn test_push_metrics() {
        record_mutation("applied");
        record_mutation("skipped");
        record_dispatch("createRoom", "ok", Duration::from_micros(250));
        record_policy_denial("archiveProduct", "state");
        record_fallback("archiveProduct", "hard_delete");
        set_push_lock_entries(4);
        record_poke(true);
    }

    #[test]
    fn test_storage_metrics() {
        record_transaction_conflict("t1");
        record_store_error("sql", "backend");
    }

    #[test]
    fn test_latency_timer() {
        let timer = LatencyTimer::new("pull");
        std::thread::sleep(Duration::from_micros(10));
        assert!(timer.elapsed() >= Duration::from_micros(10));
    }
}
