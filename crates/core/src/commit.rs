/*
 * Commit engine.
 *
 * One entry point builds nothing and decides nothing about file contents: it
 * submits a CommitEnvelope, interprets the catalog's typed conflict answer,
 * and applies the only safe local recovery - rebasing an append whose adds
 * are orthogonal to what landed in between.
 */

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use lakestate_catalog::{
    current_timestamp_ms, CatalogClient, CatalogClientRef, CommitEnvelope, CommitOp,
    CommitOutcome, DataCommitInfo, DataFileOp, PartitionDesc, PartitionInfo, TableInfo,
    TableSchema,
};
use lakestate_common::{
    retry_async, CommitMetricOutcome, ConflictKind, LakeStateError, Result, RetryConfig,
    TableStoreConfig, TableStoreMetrics, Timer,
};

/// Builds commit envelopes from staged per-partition file operations.
pub struct CommitBuilder {
    table_info: TableInfo,
    commit_type: CommitOp,
    staged: Vec<(PartitionDesc, Vec<DataFileOp>)>,
    read_partitions: Vec<PartitionInfo>,
}

impl CommitBuilder {
    pub fn new(table_info: TableInfo, commit_type: CommitOp) -> Self {
        Self {
            table_info,
            commit_type,
            staged: Vec::new(),
            read_partitions: Vec::new(),
        }
    }

    /// Stages file operations for one partition.
    pub fn with_partition(mut self, desc: PartitionDesc, file_ops: Vec<DataFileOp>) -> Self {
        self.staged.push((desc, file_ops));
        self
    }

    /// Names the partition versions this commit was computed against,
    /// typically a snapshot's read set.
    pub fn with_read_partitions(mut self, read: Vec<PartitionInfo>) -> Self {
        self.read_partitions = read;
        self
    }

    pub fn build(self) -> CommitEnvelope {
        let now = current_timestamp_ms();
        let mut data_commits = Vec::with_capacity(self.staged.len());
        let mut new_partitions = Vec::with_capacity(self.staged.len());

        for (desc, file_ops) in self.staged {
            let commit = DataCommitInfo {
                commit_id: Uuid::now_v7(),
                table_id: self.table_info.table_id,
                partition_desc: desc.clone(),
                commit_op: self.commit_type,
                file_ops,
                timestamp: now,
                committed: false,
            };

            let read_head = self
                .read_partitions
                .iter()
                .find(|p| p.partition_desc == desc);
            // A compaction supersedes the chain; everything else extends it.
            let mut read_files = if self.commit_type == CommitOp::Compaction {
                Vec::new()
            } else {
                read_head.map(|p| p.read_files.clone()).unwrap_or_default()
            };
            read_files.push(commit.commit_id);

            new_partitions.push(PartitionInfo {
                table_id: self.table_info.table_id,
                partition_desc: desc,
                version: read_head.map(|p| p.version + 1).unwrap_or(0),
                read_files,
                commit_op: self.commit_type,
                expression: None,
                timestamp: now,
            });
            data_commits.push(commit);
        }

        CommitEnvelope {
            table_info: self.table_info,
            commit_type: self.commit_type,
            data_commits,
            new_partitions,
            read_partitions: self.read_partitions,
        }
    }
}

/// Submits envelopes and interprets conflict outcomes.
pub struct CommitEngine {
    catalog: CatalogClientRef,
    config: TableStoreConfig,
    metrics: Arc<TableStoreMetrics>,
}

impl CommitEngine {
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

    /// Commits the envelope. Appends that lose to a compaction are rebased
    /// onto the new head and resubmitted; every other conflict surfaces as a
    /// typed error.
    pub async fn commit(&self, mut envelope: CommitEnvelope) -> Result<Vec<PartitionInfo>> {
        let _timer = Timer::commit(self.metrics.clone());
        self.metrics.record_commit_attempt();

        let rebase_budget = RetryConfig::for_commit().max_retries;
        for attempt in 0..=rebase_budget {
            let submitted = envelope.clone();
            let outcome = retry_async(&RetryConfig::for_catalog(), || {
                self.catalog.commit(submitted.clone())
            })
            .await
            .map_err(|e| {
                self.metrics.record_commit_outcome(CommitMetricOutcome::Failed);
                e
            })?;

            match outcome {
                CommitOutcome::Committed { partitions } => {
                    self.metrics
                        .record_commit_outcome(CommitMetricOutcome::Succeeded);
                    info!(
                        "committed {} on {} partition(s) of table {}",
                        envelope.commit_type,
                        partitions.len(),
                        envelope.table_info.table_id
                    );
                    return Ok(partitions);
                }
                CommitOutcome::Conflict {
                    kind,
                    partition_desc,
                    current,
                } => {
                    let recoverable = envelope.commit_type == CommitOp::Append
                        && attempt < rebase_budget
                        && match kind {
                            ConflictKind::CompactionRaced => true,
                            ConflictKind::SchemaChanged => self.config.schema_auto_merge,
                            _ => false,
                        };
                    if !recoverable {
                        self.metrics
                            .record_commit_outcome(CommitMetricOutcome::Conflicted);
                        return Err(LakeStateError::conflict(kind, partition_desc.as_str()));
                    }

                    warn!(
                        "append conflict ({kind}) on '{partition_desc}', rebasing (attempt {})",
                        attempt + 1
                    );
                    self.metrics.record_append_rebase();
                    match kind {
                        ConflictKind::CompactionRaced => {
                            self.rebase_append(&mut envelope, &partition_desc, current)
                                .await?;
                        }
                        ConflictKind::SchemaChanged => {
                            // Re-read table metadata; the data files already
                            // carry their own column lists.
                            envelope.table_info = self
                                .catalog
                                .get_table_info_by_id(&envelope.table_info.table_id)
                                .await?;
                        }
                        _ => unreachable!("conflict kind filtered above"),
                    }
                }
            }
        }

        self.metrics
            .record_commit_outcome(CommitMetricOutcome::Conflicted);
        Err(LakeStateError::Unexpected(
            "append rebase budget exhausted".to_string(),
        ))
    }

    /// Verifies a staged write's schema against the table. With auto-merge
    /// on, additive changes are persisted and the updated table info
    /// returned; otherwise any difference is incompatible.
    pub async fn ensure_schema(
        &self,
        table_info: &TableInfo,
        staged: &TableSchema,
    ) -> Result<TableInfo> {
        if &table_info.schema == staged {
            return Ok(table_info.clone());
        }
        if !self.config.schema_auto_merge {
            return Err(LakeStateError::SchemaIncompatible(format!(
                "table {} schema differs from staged write and auto-merge is off",
                table_info.table_id
            )));
        }
        let merged = table_info.schema.merge_additive(staged)?;
        self.catalog
            .update_schema(&table_info.table_id, merged.clone())
            .await?;
        info!(
            "auto-merged schema of table {} to {} field(s)",
            table_info.table_id,
            merged.fields.len()
        );
        let mut updated = table_info.clone();
        updated.schema = merged;
        Ok(updated)
    }

    /// Rebases a conflicted append: repoint the read version at the current
    /// head and rebuild the proposed merge order on top of it.
    async fn rebase_append(
        &self,
        envelope: &mut CommitEnvelope,
        desc: &PartitionDesc,
        current: Option<PartitionInfo>,
    ) -> Result<()> {
        let head = match current {
            Some(head) => head,
            None => self
                .catalog
                .get_single_partition(&envelope.table_info.table_id, desc, 0)
                .await?
                .ok_or_else(|| LakeStateError::PartitionNotFound {
                    table_id: envelope.table_info.table_id.to_string(),
                    partition_desc: desc.as_str().to_string(),
                })?,
        };

        let own_commits: Vec<_> = envelope
            .data_commits
            .iter()
            .filter(|c| &c.partition_desc == desc)
            .map(|c| c.commit_id)
            .collect();

        if let Some(np) = envelope
            .new_partitions
            .iter_mut()
            .find(|p| &p.partition_desc == desc)
        {
            np.version = head.version + 1;
            np.read_files = head.read_files.iter().copied().chain(own_commits).collect();
        }

        envelope
            .read_partitions
            .retain(|p| &p.partition_desc != desc);
        envelope.read_partitions.push(head);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakestate_catalog::{MemCatalog, SchemaField};
    use std::collections::HashMap;

    fn table() -> TableInfo {
        TableInfo {
            table_id: Uuid::new_v4(),
            namespace: "default".to_string(),
            table_name: Some("t".to_string()),
            table_path: "/tmp/t".to_string(),
            schema: TableSchema::new(vec![
                SchemaField::new("d", "string", false),
                SchemaField::new("v", "bigint", true),
            ]),
            range_partitions: vec!["d".to_string()],
            hash_partitions: vec![],
            hash_bucket_num: 1,
            properties: HashMap::new(),
            cdc_column: None,
        }
    }

    fn engine(catalog: CatalogClientRef, auto_merge: bool) -> CommitEngine {
        let config = TableStoreConfig {
            schema_auto_merge: auto_merge,
            ..Default::default()
        };
        CommitEngine::new(catalog, config, Arc::new(TableStoreMetrics::new()))
    }

    #[tokio::test]
    async fn test_append_then_read_head() {
        let catalog: CatalogClientRef = Arc::new(MemCatalog::new());
        let t = table();
        catalog.create_table(t.clone()).await.unwrap();
        let engine = engine(catalog.clone(), false);

        let envelope = CommitBuilder::new(t.clone(), CommitOp::Append)
            .with_partition(
                PartitionDesc::from("d=1"),
                vec![DataFileOp::add("/tmp/t/d=1/part-a-bucket0.parquet", 10, "d,v")],
            )
            .build();
        let linked = engine.commit(envelope).await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].version, 0);
    }

    #[tokio::test]
    async fn test_append_rebases_over_compaction() {
        let catalog: CatalogClientRef = Arc::new(MemCatalog::new());
        let t = table();
        catalog.create_table(t.clone()).await.unwrap();
        let engine = engine(catalog.clone(), false);
        let desc = PartitionDesc::from("d=1");

        let v0 = engine
            .commit(
                CommitBuilder::new(t.clone(), CommitOp::Append)
                    .with_partition(desc.clone(), vec![DataFileOp::add("/t/part-a-bucket0.parquet", 10, "d,v")])
                    .build(),
            )
            .await
            .unwrap()
            .remove(0);

        // Stage an append against v0, then let a compaction land first.
        let stale = CommitBuilder::new(t.clone(), CommitOp::Append)
            .with_partition(desc.clone(), vec![DataFileOp::add("/t/part-b-bucket0.parquet", 10, "d,v")])
            .with_read_partitions(vec![v0.clone()])
            .build();

        engine
            .commit(
                CommitBuilder::new(t.clone(), CommitOp::Compaction)
                    .with_partition(desc.clone(), vec![DataFileOp::add("/t/compact-c-bucket0.parquet", 10, "d,v")])
                    .with_read_partitions(vec![v0])
                    .build(),
            )
            .await
            .unwrap();

        // Rebase succeeds: the append lands on top of the barrier.
        let linked = engine.commit(stale).await.unwrap().remove(0);
        assert_eq!(linked.version, 2);
        assert_eq!(linked.read_files.len(), 2);
    }

    #[tokio::test]
    async fn test_update_conflict_surfaces() {
        let catalog: CatalogClientRef = Arc::new(MemCatalog::new());
        let t = table();
        catalog.create_table(t.clone()).await.unwrap();
        let engine = engine(catalog.clone(), false);
        let desc = PartitionDesc::from("d=1");

        let v0 = engine
            .commit(
                CommitBuilder::new(t.clone(), CommitOp::Append)
                    .with_partition(desc.clone(), vec![DataFileOp::add("/t/part-a-bucket0.parquet", 10, "d,v")])
                    .build(),
            )
            .await
            .unwrap()
            .remove(0);

        engine
            .commit(
                CommitBuilder::new(t.clone(), CommitOp::Append)
                    .with_partition(desc.clone(), vec![DataFileOp::add("/t/part-b-bucket0.parquet", 10, "d,v")])
                    .with_read_partitions(vec![v0.clone()])
                    .build(),
            )
            .await
            .unwrap();

        let stale_update = CommitBuilder::new(t.clone(), CommitOp::Update)
            .with_partition(desc.clone(), vec![DataFileOp::add("/t/part-c-bucket0.parquet", 10, "d,v")])
            .with_read_partitions(vec![v0])
            .build();

        let err = engine.commit(stale_update).await.unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::StalePartition));
    }

    #[tokio::test]
    async fn test_ensure_schema_auto_merge() {
        let catalog: CatalogClientRef = Arc::new(MemCatalog::new());
        let t = table();
        catalog.create_table(t.clone()).await.unwrap();

        let staged = TableSchema::new(vec![
            SchemaField::new("d", "string", false),
            SchemaField::new("v", "bigint", true),
            SchemaField::new("note", "string", true),
        ]);

        // Off: surfaced.
        let strict = engine(catalog.clone(), false);
        assert!(matches!(
            strict.ensure_schema(&t, &staged).await,
            Err(LakeStateError::SchemaIncompatible(_))
        ));

        // On: merged and persisted.
        let merging = engine(catalog.clone(), true);
        let updated = merging.ensure_schema(&t, &staged).await.unwrap();
        assert_eq!(updated.schema.fields.len(), 3);
        let reloaded = catalog.get_table_info_by_id(&t.table_id).await.unwrap();
        assert_eq!(reloaded.schema, updated.schema);
    }
}
