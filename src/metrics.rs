use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

use crate::model::Stage;
use crate::parser::ParserError;

/// Scan-wide counters. Gauges (queue depth, pool size) are sampled by the
/// coordinator and passed in when a snapshot is taken.
#[derive(Debug, Default)]
pub struct ScanMetrics {
    fetch_failures: AtomicU64,
    not_found_skips: AtomicU64,
    plugin_errors: AtomicU64,
    plugin_timeouts: AtomicU64,
    findings: AtomicU64,
    duplicate_findings: AtomicU64,
    crawl_duplicates: AtomicU64,
    crawl_out_of_scope: AtomicU64,
    crawl_too_deep: AtomicU64,
    dropped: AtomicU64,
    parser_timeouts: AtomicU64,
    parser_memory: AtomicU64,
    parser_crashes: AtomicU64,
    parser_too_large: AtomicU64,
    parser_other: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub fetch_failures: u64,
    pub not_found_skips: u64,
    pub plugin_errors: u64,
    pub plugin_timeouts: u64,
    pub findings: u64,
    pub duplicate_findings: u64,
    pub crawl_duplicates: u64,
    pub crawl_out_of_scope: u64,
    pub crawl_too_deep: u64,
    /// Work pushed at a closed or halted stage.
    pub dropped: u64,
    pub parser_timeouts: u64,
    pub parser_memory: u64,
    pub parser_crashes: u64,
    pub parser_too_large: u64,
    pub parser_other: u64,
}

impl Counters {
    pub fn parser_failures(&self) -> u64 {
        self.parser_timeouts
            + self.parser_memory
            + self.parser_crashes
            + self.parser_too_large
            + self.parser_other
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StageGauge {
    pub stage: Stage,
    pub depth: usize,
    pub disk_depth: usize,
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Counters,
    pub stages: Vec<StageGauge>,
    pub not_found_hit_rate: f64,
    pub admission_accepted: u64,
    pub admission_rejected: u64,
    pub request_timeout_ms: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ScanMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch_failed(&self) {
        bump(&self.fetch_failures);
    }

    pub fn not_found_skipped(&self) {
        bump(&self.not_found_skips);
    }

    pub fn plugin_failed(&self) {
        bump(&self.plugin_errors);
    }

    pub fn plugin_timed_out(&self) {
        bump(&self.plugin_timeouts);
    }

    pub fn finding_recorded(&self, fresh: bool) {
        if fresh {
            bump(&self.findings);
        } else {
            bump(&self.duplicate_findings);
        }
    }

    pub fn crawl_duplicate(&self) {
        bump(&self.crawl_duplicates);
    }

    pub fn crawl_out_of_scope(&self) {
        bump(&self.crawl_out_of_scope);
    }

    pub fn crawl_too_deep(&self) {
        bump(&self.crawl_too_deep);
    }

    pub fn dropped(&self) {
        bump(&self.dropped);
    }

    pub fn parser_failed(&self, error: &ParserError) {
        match error {
            ParserError::Timeout { .. } => bump(&self.parser_timeouts),
            ParserError::Memory => bump(&self.parser_memory),
            ParserError::Crash { .. } => bump(&self.parser_crashes),
            ParserError::TooLarge { .. } => bump(&self.parser_too_large),
            _ => bump(&self.parser_other),
        }
    }

    pub fn counters(&self) -> Counters {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Counters {
            fetch_failures: load(&self.fetch_failures),
            not_found_skips: load(&self.not_found_skips),
            plugin_errors: load(&self.plugin_errors),
            plugin_timeouts: load(&self.plugin_timeouts),
            findings: load(&self.findings),
            duplicate_findings: load(&self.duplicate_findings),
            crawl_duplicates: load(&self.crawl_duplicates),
            crawl_out_of_scope: load(&self.crawl_out_of_scope),
            crawl_too_deep: load(&self.crawl_too_deep),
            dropped: load(&self.dropped),
            parser_timeouts: load(&self.parser_timeouts),
            parser_memory: load(&self.parser_memory),
            parser_crashes: load(&self.parser_crashes),
            parser_too_large: load(&self.parser_too_large),
            parser_other: load(&self.parser_other),
        }
    }
}

/// Emits one `info` line per stage plus one scan-wide line.
pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    for gauge in &snapshot.stages {
        info!(
            stage = %gauge.stage,
            depth = gauge.depth,
            disk_depth = gauge.disk_depth,
            workers = gauge.workers,
            idle = gauge.idle,
            busy = gauge.busy,
            "stage gauges"
        );
    }
    let c = &snapshot.counters;
    info!(
        findings = c.findings,
        fetch_failures = c.fetch_failures,
        plugin_errors = c.plugin_errors,
        parser_failures = c.parser_failures(),
        not_found_skips = c.not_found_skips,
        not_found_hit_rate = snapshot.not_found_hit_rate,
        admission_accepted = snapshot.admission_accepted,
        admission_rejected = snapshot.admission_rejected,
        request_timeout_ms = snapshot.request_timeout_ms,
        "scan metrics"
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn parser_failures_are_counted_by_kind() {
        let m = ScanMetrics::new();
        m.parser_failed(&ParserError::Memory);
        m.parser_failed(&ParserError::Timeout {
            budget: Duration::from_secs(1),
        });
        m.parser_failed(&ParserError::Unavailable);
        let c = m.counters();
        assert_eq!(c.parser_memory, 1);
        assert_eq!(c.parser_timeouts, 1);
        assert_eq!(c.parser_other, 1);
        assert_eq!(c.parser_failures(), 3);
    }

    #[test]
    fn duplicate_findings_are_separate() {
        let m = ScanMetrics::new();
        m.finding_recorded(true);
        m.finding_recorded(false);
        m.finding_recorded(false);
        let c = m.counters();
        assert_eq!(c.findings, 1);
        assert_eq!(c.duplicate_findings, 2);
    }
}
