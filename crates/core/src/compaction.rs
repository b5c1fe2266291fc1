/*
 * Compaction planning and execution.
 *
 * The planner resolves a partition's current file set and decides which
 * buckets are worth rewriting. The executor drives the external IO layer to
 * merge each bucket, commits a single CompactionCommit per partition, and
 * records every superseded input in the discard log. Outputs of a run that
 * conflicts, fails, or is cancelled are never deleted here; they go to the
 * discard log for async cleanup.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use lakestate_catalog::{
    current_timestamp_ms, CatalogClient, CatalogClientRef, CommitId, CommitOp, DataFileInfo,
    DataFileOp, DiscardedFile, FileRole, PartitionDesc, PartitionInfo, TableInfo,
    PROP_HASH_BUCKET_NUM,
};
use lakestate_common::{retry_async, Result, RetryConfig, TableStoreConfig, TableStoreMetrics};

use crate::commit::{CommitBuilder, CommitEngine};
use crate::resolver::{group_by_bucket, resolve_files, TimeBounds};

/// Cooperative cancellation, checked between bucket passes.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One bucket's input set, in merge order.
#[derive(Debug, Clone)]
pub struct BucketPlan {
    pub bucket_id: u32,
    pub files: Vec<DataFileInfo>,
    pub input_bytes: u64,
}

/// A partition-level compaction decision.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    pub table_info: TableInfo,
    /// The partition head the plan was computed against.
    pub partition: PartitionInfo,
    pub buckets: Vec<BucketPlan>,
    /// Differs from the table's bucket count only in rebucketing mode.
    pub target_bucket_num: usize,
}

impl CompactionPlan {
    pub fn is_rebucketing(&self) -> bool {
        self.target_bucket_num != self.table_info.hash_bucket_num
    }

    pub fn input_bytes(&self) -> u64 {
        self.buckets.iter().map(|b| b.input_bytes).sum()
    }
}

/// Everything the IO layer needs to merge one bucket, passed explicitly.
#[derive(Debug, Clone)]
pub struct MergeTask {
    /// Table properties forwarded as IO configuration.
    pub io_properties: HashMap<String, String>,
    pub native_io: bool,
    pub table_info: TableInfo,
    pub partition_desc: PartitionDesc,
    /// Inputs in merge order: compacted base first, then deltas.
    pub input_files: Vec<DataFileInfo>,
    /// Last-write-wins per primary key when set; op=delete rows dropped.
    pub cdc_column: Option<String>,
    /// The bucket this task rewrites; None fans rows out across all
    /// `target_bucket_num` buckets (rebucketing).
    pub source_bucket: Option<u32>,
    pub target_bucket_num: usize,
    pub commit_id: CommitId,
    pub output_dir: String,
    /// `compact` normally, `part` when rename-on-compact is configured.
    pub output_prefix: String,
    /// Outputs are split at this many bytes.
    pub max_file_size: u64,
}

impl MergeTask {
    pub fn input_bytes(&self) -> u64 {
        self.input_files.iter().map(|f| f.size).sum()
    }

    /// Output name for the `seq`-th file of a bucket. The bucket suffix
    /// stays last so bucket-id parsing works on every output.
    pub fn output_file_name(&self, bucket_id: u32, seq: usize) -> String {
        if seq == 0 {
            format!("{}-{}-bucket{bucket_id}.parquet", self.output_prefix, self.commit_id)
        } else {
            format!(
                "{}-{}-seq{seq}-bucket{bucket_id}.parquet",
                self.output_prefix, self.commit_id
            )
        }
    }

    pub fn output_path(&self, bucket_id: u32, seq: usize) -> String {
        format!(
            "{}/{}",
            self.output_dir.trim_end_matches('/'),
            self.output_file_name(bucket_id, seq)
        )
    }
}

/// One file written by the IO layer.
#[derive(Debug, Clone)]
pub struct MergedFile {
    pub path: String,
    pub size: u64,
    pub bucket_id: u32,
    pub row_count: u64,
}

/// The external columnar IO collaborator. Implementations stream-merge the
/// task's inputs (applying CDC semantics when configured), split outputs at
/// `max_file_size`, and name files via [`MergeTask::output_path`].
#[async_trait]
pub trait CompactionIo: Send + Sync {
    async fn merge_bucket(&self, task: &MergeTask) -> Result<Vec<MergedFile>>;
}

/// Decides which buckets of a partition to rewrite.
pub struct CompactionPlanner {
    catalog: CatalogClientRef,
    config: TableStoreConfig,
    metrics: Arc<TableStoreMetrics>,
}

impl CompactionPlanner {
    pub fn new(
        catalog: CatalogClientRef,
        config: TableStoreConfig,
        metrics: Arc<TableStoreMetrics>,
    ) -> Self {
        Self {
            catalog,
            config,
            metrics,
        }
    }

    /// Plans compaction for one partition. `target_bucket_num` other than
    /// the table's current count switches to rebucketing mode, which forces
    /// every bucket to participate.
    pub async fn plan(
        &self,
        table: &TableInfo,
        desc: &PartitionDesc,
        target_bucket_num: Option<usize>,
    ) -> Result<Option<CompactionPlan>> {
        let head = match self
            .catalog
            .get_single_partition(&table.table_id, desc, 0)
            .await?
        {
            Some(head) if head.commit_op != CommitOp::Delete => head,
            _ => return Ok(None),
        };

        let commits = retry_async(&RetryConfig::for_catalog(), || {
            self.catalog.get_commits(&table.table_id, &head.read_files)
        })
        .await?;
        let files = resolve_files(table, &head, &commits, TimeBounds::default())?;
        let target = target_bucket_num.unwrap_or(table.hash_bucket_num);
        let rebucketing = target != table.hash_bucket_num;

        let limits = &self.config.compaction;
        let mut buckets = Vec::new();
        for (bucket_id, files) in group_by_bucket(&files) {
            if files.is_empty() {
                continue;
            }
            let input_bytes: u64 = files.iter().map(|f| f.size).sum();
            let has_deltas = files.iter().any(|f| f.role == FileRole::Add);

            if !rebucketing {
                if limits.only_save_once && !has_deltas {
                    continue;
                }
                let candidate = files.len() >= limits.level1_file_number_limit
                    || input_bytes >= limits.level1_merge_size_limit;
                if !candidate {
                    continue;
                }
            }

            buckets.push(BucketPlan {
                bucket_id,
                files,
                input_bytes,
            });
        }

        if buckets.is_empty() {
            return Ok(None);
        }

        // Smallest buckets first; oldest input breaks ties.
        buckets.sort_by_key(|b| {
            (
                b.input_bytes,
                b.files.iter().map(|f| f.modification_time).min().unwrap_or(0),
            )
        });

        self.metrics.record_compaction_planned();
        info!(
            "planned compaction of {} bucket(s) on '{}' v{} ({} bytes)",
            buckets.len(),
            desc,
            head.version,
            buckets.iter().map(|b| b.input_bytes).sum::<u64>()
        );
        Ok(Some(CompactionPlan {
            table_info: table.clone(),
            partition: head,
            buckets,
            target_bucket_num: target,
        }))
    }
}

/// What a successful compaction produced.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    /// The new partition head (a CompactionCommit).
    pub partition: PartitionInfo,
    pub outputs: Vec<MergedFile>,
    pub discarded_inputs: usize,
    pub bucket_num_changed: bool,
}

/// Runs a compaction plan through the IO layer and commits the result.
pub struct CompactionExecutor {
    catalog: CatalogClientRef,
    io: Arc<dyn CompactionIo>,
    config: TableStoreConfig,
    metrics: Arc<TableStoreMetrics>,
}

impl CompactionExecutor {
    pub fn new(
        catalog: CatalogClientRef,
        io: Arc<dyn CompactionIo>,
        config: TableStoreConfig,
        metrics: Arc<TableStoreMetrics>,
    ) -> Self {
        Self {
            catalog,
            io,
            config,
            metrics,
        }
    }

    /// Executes the plan. Returns `Ok(None)` when cancelled between buckets;
    /// IO failures and commit conflicts abort the run and are surfaced after
    /// every already-written output has been routed to the discard log.
    pub async fn execute(
        &self,
        plan: CompactionPlan,
        cancel: &CancelFlag,
    ) -> Result<Option<CompactionOutcome>> {
        if plan.buckets.is_empty() {
            return Ok(None);
        }

        let table = &plan.table_info;
        let commit_id = Uuid::now_v7();
        let tasks = self.merge_tasks(&plan, commit_id);

        let mut outputs: Vec<MergedFile> = Vec::new();
        let width = self.config.compaction.level1_merge_num_limit.max(1);
        for chunk in tasks.chunks(width) {
            if cancel.is_cancelled() {
                warn!(
                    "compaction of '{}' cancelled after {} output file(s)",
                    plan.partition.partition_desc,
                    outputs.len()
                );
                self.abandon(table, &outputs).await;
                self.metrics.record_compaction_aborted();
                return Ok(None);
            }

            let results =
                futures::future::join_all(chunk.iter().map(|task| self.io.merge_bucket(task)))
                    .await;
            for (task, result) in chunk.iter().zip(results) {
                match result {
                    Ok(files) => {
                        self.metrics.record_bucket_compacted(task.input_bytes());
                        outputs.extend(files);
                    }
                    Err(e) => {
                        warn!(
                            "bucket merge failed on '{}': {e}; abandoning run",
                            plan.partition.partition_desc
                        );
                        self.abandon(table, &outputs).await;
                        self.metrics.record_compaction_aborted();
                        return Err(e);
                    }
                }
            }
        }

        let file_exist_cols = table.schema.field_names().join(",");
        let file_ops: Vec<DataFileOp> = outputs
            .iter()
            .map(|f| DataFileOp::add(f.path.clone(), f.size, file_exist_cols.clone()))
            .collect();

        let envelope = CommitBuilder::new(table.clone(), CommitOp::Compaction)
            .with_partition(plan.partition.partition_desc.clone(), file_ops)
            .with_read_partitions(vec![plan.partition.clone()])
            .build();

        let engine = CommitEngine::new(self.catalog.clone(), self.config.clone(), self.metrics.clone());
        let mut partitions = match engine.commit(envelope).await {
            Ok(partitions) => partitions,
            Err(e) => {
                warn!(
                    "compaction commit on '{}' rejected: {e}; outputs sent to discard log",
                    plan.partition.partition_desc
                );
                self.abandon(table, &outputs).await;
                self.metrics.record_compaction_aborted();
                return Err(e);
            }
        };

        // Inputs are superseded; record them for async physical deletion.
        let now = current_timestamp_ms();
        let discards: Vec<DiscardedFile> = plan
            .buckets
            .iter()
            .flat_map(|b| &b.files)
            .map(|f| DiscardedFile::new(f.path.clone(), table.table_path.clone(), now))
            .collect();
        let discarded_inputs = discards.len();
        if let Err(e) = self.catalog.record_discard(discards).await {
            // The commit stands; the leaked inputs are left for GC.
            warn!("failed to record {discarded_inputs} discarded input(s): {e}");
        } else {
            self.metrics.record_files_discarded(discarded_inputs as u64);
        }

        let bucket_num_changed = plan.is_rebucketing();
        if bucket_num_changed {
            self.catalog
                .update_properties(
                    &table.table_id,
                    HashMap::from([(
                        PROP_HASH_BUCKET_NUM.to_string(),
                        plan.target_bucket_num.to_string(),
                    )]),
                )
                .await?;
            info!(
                "table {} rebucketed to {} bucket(s)",
                table.table_id, plan.target_bucket_num
            );
        }

        Ok(Some(CompactionOutcome {
            partition: partitions.remove(0),
            outputs,
            discarded_inputs,
            bucket_num_changed,
        }))
    }

    fn merge_tasks(&self, plan: &CompactionPlan, commit_id: CommitId) -> Vec<MergeTask> {
        let table = &plan.table_info;
        let output_dir = partition_dir(&table.table_path, &plan.partition.partition_desc);
        let output_prefix = if self.config.compaction.rename_compacted {
            "part"
        } else {
            "compact"
        };
        let base = MergeTask {
            io_properties: table.properties.clone(),
            native_io: self.config.scan.native_io_enable,
            table_info: table.clone(),
            partition_desc: plan.partition.partition_desc.clone(),
            input_files: Vec::new(),
            cdc_column: table.cdc_column.clone(),
            source_bucket: None,
            target_bucket_num: plan.target_bucket_num,
            commit_id,
            output_dir,
            output_prefix: output_prefix.to_string(),
            max_file_size: self.config.compaction.max_file_size,
        };

        if plan.is_rebucketing() {
            // One task rehashes every row across the new bucket layout.
            let mut task = base;
            task.input_files = plan
                .buckets
                .iter()
                .flat_map(|b| b.files.iter().cloned())
                .collect();
            vec![task]
        } else {
            plan.buckets
                .iter()
                .map(|bucket| {
                    let mut task = base.clone();
                    task.input_files = bucket.files.clone();
                    task.source_bucket = Some(bucket.bucket_id);
                    task
                })
                .collect()
        }
    }

    /// Routes orphaned outputs to the discard log; best-effort.
    async fn abandon(&self, table: &TableInfo, outputs: &[MergedFile]) {
        if outputs.is_empty() {
            return;
        }
        let now = current_timestamp_ms();
        let discards: Vec<DiscardedFile> = outputs
            .iter()
            .map(|f| DiscardedFile::new(f.path.clone(), table.table_path.clone(), now))
            .collect();
        let count = discards.len();
        if let Err(e) = self.catalog.record_discard(discards).await {
            warn!("failed to record {count} abandoned compaction output(s): {e}");
        } else {
            self.metrics.record_files_discarded(count as u64);
        }
    }
}

/// Directory that holds a partition's data files.
pub fn partition_dir(table_path: &str, desc: &PartitionDesc) -> String {
    let base = table_path.trim_end_matches('/');
    if desc.is_unpartitioned() {
        base.to_string()
    } else {
        format!("{base}/{}", desc.path_segment())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakestate_catalog::{MemCatalog, SchemaField, TableSchema};
    use crate::commit::CommitBuilder;

    fn table(buckets: usize) -> TableInfo {
        TableInfo {
            table_id: Uuid::new_v4(),
            namespace: "default".to_string(),
            table_name: Some("t".to_string()),
            table_path: "/tmp/t".to_string(),
            schema: TableSchema::new(vec![
                SchemaField::new("k", "string", false),
                SchemaField::new("v", "bigint", true),
            ]),
            range_partitions: vec![],
            hash_partitions: vec!["k".to_string()],
            hash_bucket_num: buckets,
            properties: HashMap::new(),
            cdc_column: None,
        }
    }

    fn config_with_file_limit(limit: usize) -> TableStoreConfig {
        let mut config = TableStoreConfig::default();
        config.compaction.level1_file_number_limit = limit;
        config
    }

    async fn seed_appends(
        catalog: &Arc<MemCatalog>,
        t: &TableInfo,
        desc: &PartitionDesc,
        n: usize,
    ) {
        let engine = CommitEngine::new(
            catalog.clone(),
            TableStoreConfig::default(),
            Arc::new(TableStoreMetrics::new()),
        );
        let mut head: Option<PartitionInfo> = None;
        for i in 0..n {
            let envelope = CommitBuilder::new(t.clone(), CommitOp::Append)
                .with_partition(
                    desc.clone(),
                    vec![DataFileOp::add(
                        format!("/tmp/t/part-f{i}-bucket0.parquet"),
                        10,
                        "k,v",
                    )],
                )
                .with_read_partitions(head.clone().into_iter().collect())
                .build();
            head = Some(engine.commit(envelope).await.unwrap().remove(0));
        }
    }

    #[tokio::test]
    async fn test_planner_below_thresholds_is_noop() {
        let catalog = Arc::new(MemCatalog::new());
        let t = table(1);
        catalog.create_table(t.clone()).await.unwrap();
        let desc = PartitionDesc::unpartitioned();
        seed_appends(&catalog, &t, &desc, 2).await;

        let planner = CompactionPlanner::new(
            catalog.clone(),
            config_with_file_limit(5),
            Arc::new(TableStoreMetrics::new()),
        );
        let plan = planner.plan(&t, &desc, None).await.unwrap();
        assert!(plan.is_none());
    }

    #[tokio::test]
    async fn test_planner_triggers_on_file_count() {
        let catalog = Arc::new(MemCatalog::new());
        let t = table(1);
        catalog.create_table(t.clone()).await.unwrap();
        let desc = PartitionDesc::unpartitioned();
        seed_appends(&catalog, &t, &desc, 3).await;

        let planner = CompactionPlanner::new(
            catalog.clone(),
            config_with_file_limit(3),
            Arc::new(TableStoreMetrics::new()),
        );
        let plan = planner.plan(&t, &desc, None).await.unwrap().unwrap();
        assert_eq!(plan.buckets.len(), 1);
        assert_eq!(plan.buckets[0].files.len(), 3);
        assert!(!plan.is_rebucketing());
    }

    #[tokio::test]
    async fn test_rebucketing_forces_participation() {
        let catalog = Arc::new(MemCatalog::new());
        let t = table(1);
        catalog.create_table(t.clone()).await.unwrap();
        let desc = PartitionDesc::unpartitioned();
        seed_appends(&catalog, &t, &desc, 1).await;

        let planner = CompactionPlanner::new(
            catalog.clone(),
            config_with_file_limit(100),
            Arc::new(TableStoreMetrics::new()),
        );
        let plan = planner.plan(&t, &desc, Some(4)).await.unwrap().unwrap();
        assert!(plan.is_rebucketing());
        assert_eq!(plan.target_bucket_num, 4);
    }

    #[test]
    fn test_output_naming_keeps_bucket_suffix_last() {
        let t = table(2);
        let task = MergeTask {
            io_properties: HashMap::new(),
            native_io: true,
            table_info: t,
            partition_desc: PartitionDesc::unpartitioned(),
            input_files: vec![],
            cdc_column: None,
            source_bucket: Some(1),
            target_bucket_num: 2,
            commit_id: Uuid::nil(),
            output_dir: "/tmp/t".to_string(),
            output_prefix: "compact".to_string(),
            max_file_size: 1024,
        };

        let first = task.output_path(1, 0);
        let second = task.output_path(1, 1);
        assert_eq!(lakestate_catalog::parse_bucket_id(&first), Some(1));
        assert_eq!(lakestate_catalog::parse_bucket_id(&second), Some(1));
        assert_ne!(first, second);
    }

    #[test]
    fn test_partition_dir() {
        assert_eq!(partition_dir("/w/t/", &PartitionDesc::unpartitioned()), "/w/t");
        assert_eq!(
            partition_dir("/w/t", &PartitionDesc::from("d=2024 01")),
            "/w/t/d=2024%2001"
        );
    }
}
