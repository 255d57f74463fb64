// SPDX-License-Identifier: Apache-2.0

//! Lightweight in-process metrics for federated runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct FederationMetrics {
    runs_total: AtomicU64,
    runs_failed: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
    sub_queries_total: AtomicU64,
    sub_queries_failed: AtomicU64,
    staged_tables_created: AtomicU64,
    staged_tables_dropped: AtomicU64,
    cleanup_failures: AtomicU64,
}

static FEDERATION_METRICS: OnceLock<FederationMetrics> = OnceLock::new();

fn metrics() -> &'static FederationMetrics {
    FEDERATION_METRICS.get_or_init(FederationMetrics::default)
}

pub fn record_run(duration_ms: f64, success: bool) {
    let duration_ms = duration_ms.max(0.0) as u64;
    let metrics = metrics();
    metrics.runs_total.fetch_add(1, Ordering::Relaxed);
    if !success {
        metrics.runs_failed.fetch_add(1, Ordering::Relaxed);
    }
    metrics
        .duration_total_ms
        .fetch_add(duration_ms, Ordering::Relaxed);

    let mut current = metrics.duration_max_ms.load(Ordering::Relaxed);
    while duration_ms > current {
        match metrics.duration_max_ms.compare_exchange(
            current,
            duration_ms,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(next) => current = next,
        }
    }
}

pub fn record_sub_query(success: bool) {
    let metrics = metrics();
    metrics.sub_queries_total.fetch_add(1, Ordering::Relaxed);
    if !success {
        metrics.sub_queries_failed.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_staged_created() {
    metrics().staged_tables_created.fetch_add(1, Ordering::Relaxed);
}

pub fn record_staged_dropped() {
    metrics().staged_tables_dropped.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cleanup_failure() {
    metrics().cleanup_failures.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Serialize)]
pub struct FederationMetricsSnapshot {
    pub runs_total: u64,
    pub runs_failed: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
    pub sub_queries_total: u64,
    pub sub_queries_failed: u64,
    pub staged_tables_created: u64,
    pub staged_tables_dropped: u64,
    pub cleanup_failures: u64,
}

pub fn snapshot() -> FederationMetricsSnapshot {
    let metrics = metrics();
    let runs_total = metrics.runs_total.load(Ordering::Relaxed);
    let duration_total = metrics.duration_total_ms.load(Ordering::Relaxed);
    let max_ms = metrics.duration_max_ms.load(Ordering::Relaxed);

    let avg_ms = if runs_total > 0 {
        Some(duration_total as f64 / runs_total as f64)
    } else {
        None
    };

    FederationMetricsSnapshot {
        runs_total,
        runs_failed: metrics.runs_failed.load(Ordering::Relaxed),
        avg_ms,
        max_ms: if max_ms > 0 { Some(max_ms) } else { None },
        sub_queries_total: metrics.sub_queries_total.load(Ordering::Relaxed),
        sub_queries_failed: metrics.sub_queries_failed.load(Ordering::Relaxed),
        staged_tables_created: metrics.staged_tables_created.load(Ordering::Relaxed),
        staged_tables_dropped: metrics.staged_tables_dropped.load(Ordering::Relaxed),
        cleanup_failures: metrics.cleanup_failures.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_flow() {
        // Counters are process-wide; compare against a baseline.
        let initial = snapshot();

        record_run(100.0, true);
        record_run(50.0, false);
        let s1 = snapshot();
        assert!(s1.runs_total >= initial.runs_total + 2);
        assert!(s1.runs_failed > initial.runs_failed);

        record_sub_query(true);
        record_sub_query(false);
        let s2 = snapshot();
        assert!(s2.sub_queries_total >= initial.sub_queries_total + 2);
        assert!(s2.sub_queries_failed > initial.sub_queries_failed);

        record_staged_created();
        record_staged_dropped();
        record_cleanup_failure();
        let s3 = snapshot();
        assert!(s3.staged_tables_created > initial.staged_tables_created);
        assert!(s3.staged_tables_dropped > initial.staged_tables_dropped);
        assert!(s3.cleanup_failures > initial.cleanup_failures);

        record_run(99999.0, true);
        assert!(snapshot().max_ms.unwrap() >= 99999);
    }
}
