/*
 * LakeState - Core
 *
 * The table-state engine:
 * 1. Snapshots with partition-predicate pushdown and lazy file resolution
 * 2. Atomic multi-partition commits with typed conflict handling
 * 3. Merge-on-read file-set resolution with compaction barriers
 * 4. Hash-bucketed compaction planning and execution
 * 5. TTL lifecycle and discard-log cleanup
 */

pub mod cleanup;
pub mod commit;
pub mod compaction;
pub mod predicate;
pub mod resolver;
pub mod snapshot;
pub mod store;
pub mod ttl;

pub use cleanup::{CleanupReport, DiscardCleaner};
pub use commit::{CommitBuilder, CommitEngine};
pub use compaction::{
    partition_dir, BucketPlan, CancelFlag, CompactionExecutor, CompactionIo, CompactionOutcome,
    CompactionPlan, CompactionPlanner, MergeTask, MergedFile,
};
pub use predicate::{
    canonical_key, classify, evaluate_partitions, split_filters, CatalogAccessPath, Predicate,
    SplitFilters,
};
pub use resolver::{group_by_bucket, resolve_files, TimeBounds};
pub use snapshot::{PartitionFilterInfo, ReadType, ScanFileSet, Snapshot};
pub use store::TableStore;
pub use ttl::{TtlManager, MS_PER_DAY};

// Re-export the catalog surface embedders need alongside the engine.
pub use lakestate_catalog as catalog;
pub use lakestate_common as common;
