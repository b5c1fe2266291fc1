/*
 * Metrics for the table-state engine.
 *
 * Atomic counters with a Prometheus exposition formatter. One registry is
 * shared process-wide and handed to snapshots, the commit engine, and the
 * compaction executor.
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counter registry for the engine.
#[derive(Debug, Default)]
pub struct TableStoreMetrics {
    // Read path
    pub snapshots_created: AtomicU64,
    pub snapshot_cache_hits: AtomicU64,
    pub partitions_listed: AtomicU64,
    pub partitions_pruned: AtomicU64,
    pub files_resolved: AtomicU64,

    // Commit path
    pub commits_attempted: AtomicU64,
    pub commits_succeeded: AtomicU64,
    pub commits_conflicted: AtomicU64,
    pub commits_failed: AtomicU64,
    pub append_rebases: AtomicU64,

    // Compaction
    pub compactions_planned: AtomicU64,
    pub buckets_compacted: AtomicU64,
    pub compactions_aborted: AtomicU64,
    pub bytes_compacted: AtomicU64,

    // Lifecycle
    pub files_discarded: AtomicU64,
    pub files_cleaned: AtomicU64,
    pub partitions_expired: AtomicU64,

    // Timing (microseconds)
    pub total_resolve_time_us: AtomicU64,
    pub total_commit_time_us: AtomicU64,
}

impl TableStoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_snapshot(&self, cache_hit: bool) {
        if cache_hit {
            self.snapshot_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.snapshots_created.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_partitions_pruned(&self, listed: u64, selected: u64) {
        self.partitions_listed.fetch_add(listed, Ordering::Relaxed);
        self.partitions_pruned
            .fetch_add(listed.saturating_sub(selected), Ordering::Relaxed);
    }

    pub fn record_files_resolved(&self, files: u64) {
        self.files_resolved.fetch_add(files, Ordering::Relaxed);
    }

    pub fn record_commit_attempt(&self) {
        self.commits_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit_outcome(&self, outcome: CommitMetricOutcome) {
        let counter = match outcome {
            CommitMetricOutcome::Succeeded => &self.commits_succeeded,
            CommitMetricOutcome::Conflicted => &self.commits_conflicted,
            CommitMetricOutcome::Failed => &self.commits_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_append_rebase(&self) {
        self.append_rebases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compaction_planned(&self) {
        self.compactions_planned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bucket_compacted(&self, input_bytes: u64) {
        self.buckets_compacted.fetch_add(1, Ordering::Relaxed);
        self.bytes_compacted.fetch_add(input_bytes, Ordering::Relaxed);
    }

    pub fn record_compaction_aborted(&self) {
        self.compactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_files_discarded(&self, files: u64) {
        self.files_discarded.fetch_add(files, Ordering::Relaxed);
    }

    pub fn record_files_cleaned(&self, files: u64) {
        self.files_cleaned.fetch_add(files, Ordering::Relaxed);
    }

    pub fn record_partition_expired(&self) {
        self.partitions_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolve_time(&self, duration: Duration) {
        self.total_resolve_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_commit_time(&self, duration: Duration) {
        self.total_commit_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            snapshots_created: self.snapshots_created.load(Ordering::Relaxed),
            snapshot_cache_hits: self.snapshot_cache_hits.load(Ordering::Relaxed),
            partitions_listed: self.partitions_listed.load(Ordering::Relaxed),
            partitions_pruned: self.partitions_pruned.load(Ordering::Relaxed),
            files_resolved: self.files_resolved.load(Ordering::Relaxed),
            commits_attempted: self.commits_attempted.load(Ordering::Relaxed),
            commits_succeeded: self.commits_succeeded.load(Ordering::Relaxed),
            commits_conflicted: self.commits_conflicted.load(Ordering::Relaxed),
            commits_failed: self.commits_failed.load(Ordering::Relaxed),
            append_rebases: self.append_rebases.load(Ordering::Relaxed),
            compactions_planned: self.compactions_planned.load(Ordering::Relaxed),
            buckets_compacted: self.buckets_compacted.load(Ordering::Relaxed),
            compactions_aborted: self.compactions_aborted.load(Ordering::Relaxed),
            bytes_compacted: self.bytes_compacted.load(Ordering::Relaxed),
            files_discarded: self.files_discarded.load(Ordering::Relaxed),
            files_cleaned: self.files_cleaned.load(Ordering::Relaxed),
            partitions_expired: self.partitions_expired.load(Ordering::Relaxed),
            total_resolve_time_us: self.total_resolve_time_us.load(Ordering::Relaxed),
            total_commit_time_us: self.total_commit_time_us.load(Ordering::Relaxed),
        }
    }

    /// Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let snap = self.snapshot();
        format!(
            r#"# HELP tablestore_snapshots_total Snapshots by source
# TYPE tablestore_snapshots_total counter
tablestore_snapshots_total{{source="built"}} {}
tablestore_snapshots_total{{source="cache"}} {}

# HELP tablestore_partitions_total Partitions seen by the planner
# TYPE tablestore_partitions_total counter
tablestore_partitions_total{{state="listed"}} {}
tablestore_partitions_total{{state="pruned"}} {}

# HELP tablestore_files_resolved Data files produced by the resolver
# TYPE tablestore_files_resolved counter
tablestore_files_resolved {}

# HELP tablestore_commits_total Commit submissions by outcome
# TYPE tablestore_commits_total counter
tablestore_commits_total{{outcome="attempted"}} {}
tablestore_commits_total{{outcome="succeeded"}} {}
tablestore_commits_total{{outcome="conflicted"}} {}
tablestore_commits_total{{outcome="failed"}} {}

# HELP tablestore_append_rebases Appends rebased after a conflict
# TYPE tablestore_append_rebases counter
tablestore_append_rebases {}

# HELP tablestore_compactions_total Compaction runs by state
# TYPE tablestore_compactions_total counter
tablestore_compactions_total{{state="planned"}} {}
tablestore_compactions_total{{state="aborted"}} {}

# HELP tablestore_buckets_compacted Buckets merged by the executor
# TYPE tablestore_buckets_compacted counter
tablestore_buckets_compacted {}

# HELP tablestore_bytes_compacted Input bytes consumed by compaction
# TYPE tablestore_bytes_compacted counter
tablestore_bytes_compacted {}

# HELP tablestore_discard_files_total Discard-log traffic
# TYPE tablestore_discard_files_total counter
tablestore_discard_files_total{{state="recorded"}} {}
tablestore_discard_files_total{{state="cleaned"}} {}

# HELP tablestore_partitions_expired Partitions tombstoned by the TTL sweep
# TYPE tablestore_partitions_expired counter
tablestore_partitions_expired {}

# HELP tablestore_resolve_time_seconds Total file-resolution time
# TYPE tablestore_resolve_time_seconds counter
tablestore_resolve_time_seconds {}

# HELP tablestore_commit_time_seconds Total commit time
# TYPE tablestore_commit_time_seconds counter
tablestore_commit_time_seconds {}
"#,
            snap.snapshots_created,
            snap.snapshot_cache_hits,
            snap.partitions_listed,
            snap.partitions_pruned,
            snap.files_resolved,
            snap.commits_attempted,
            snap.commits_succeeded,
            snap.commits_conflicted,
            snap.commits_failed,
            snap.append_rebases,
            snap.compactions_planned,
            snap.compactions_aborted,
            snap.buckets_compacted,
            snap.bytes_compacted,
            snap.files_discarded,
            snap.files_cleaned,
            snap.partitions_expired,
            snap.total_resolve_time_us as f64 / 1_000_000.0,
            snap.total_commit_time_us as f64 / 1_000_000.0,
        )
    }
}

/// How a commit submission ended, for metrics purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMetricOutcome {
    Succeeded,
    Conflicted,
    Failed,
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub snapshots_created: u64,
    pub snapshot_cache_hits: u64,
    pub partitions_listed: u64,
    pub partitions_pruned: u64,
    pub files_resolved: u64,
    pub commits_attempted: u64,
    pub commits_succeeded: u64,
    pub commits_conflicted: u64,
    pub commits_failed: u64,
    pub append_rebases: u64,
    pub compactions_planned: u64,
    pub buckets_compacted: u64,
    pub compactions_aborted: u64,
    pub bytes_compacted: u64,
    pub files_discarded: u64,
    pub files_cleaned: u64,
    pub partitions_expired: u64,
    pub total_resolve_time_us: u64,
    pub total_commit_time_us: u64,
}

impl MetricsSnapshot {
    /// Fraction of commit submissions that succeeded.
    pub fn commit_success_rate(&self) -> f64 {
        if self.commits_attempted == 0 {
            1.0
        } else {
            self.commits_succeeded as f64 / self.commits_attempted as f64
        }
    }

    /// Fraction of snapshot requests served from cache.
    pub fn snapshot_cache_hit_rate(&self) -> f64 {
        let total = self.snapshots_created + self.snapshot_cache_hits;
        if total == 0 {
            0.0
        } else {
            self.snapshot_cache_hits as f64 / total as f64
        }
    }
}

/// Timer guard; records elapsed time into a counter on drop.
pub struct Timer {
    start: Instant,
    metrics: Arc<TableStoreMetrics>,
    record_fn: fn(&TableStoreMetrics, Duration),
}

impl Timer {
    /// Times a file-resolution pass.
    pub fn resolve(metrics: Arc<TableStoreMetrics>) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            record_fn: |m, d| m.record_resolve_time(d),
        }
    }

    /// Times a commit submission.
    pub fn commit(metrics: Arc<TableStoreMetrics>) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            record_fn: |m, d| m.record_commit_time(d),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        (self.record_fn)(&self.metrics, self.start.elapsed());
    }
}

/// Tracing span names for consistent instrumentation.
pub mod spans {
    pub const BUILD_SNAPSHOT: &str = "build_snapshot";
    pub const PLAN_PARTITIONS: &str = "plan_partitions";
    pub const RESOLVE_FILES: &str = "resolve_files";
    pub const COMMIT: &str = "commit";
    pub const COMPACT_PARTITION: &str = "compact_partition";
    pub const TTL_SWEEP: &str = "ttl_sweep";
    pub const CLEAN_DISCARDS: &str = "clean_discards";
}
