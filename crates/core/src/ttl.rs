/*
 * TTL and partition lifecycle.
 *
 * Two orthogonal TTLs live in table properties: partition_ttl_days retires
 * whole partitions by writing delete-all tombstone versions, and
 * compaction_ttl_days gates when the discard cleaner may physically delete
 * superseded files. Tombstoning never deletes anything itself; it routes the
 * partition's live files to the discard log.
 */

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use lakestate_catalog::{
    current_timestamp_ms, CatalogClient, CatalogClientRef, CommitOp, DataFileOp, DiscardedFile,
    PartitionDesc, PartitionInfo, TableInfo,
};
use lakestate_common::{
    keys, retry_async, LakeStateError, Result, RetryConfig, TableStoreConfig, TableStoreMetrics,
};

use crate::commit::{CommitBuilder, CommitEngine};
use crate::resolver::{resolve_files, TimeBounds};

pub const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Drives TTL properties, tombstoning, and explicit partition drops.
pub struct TtlManager {
    catalog: CatalogClientRef,
    config: TableStoreConfig,
    metrics: Arc<TableStoreMetrics>,
}

impl TtlManager {
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

    pub async fn set_partition_ttl(&self, table: &TableInfo, days: u32) -> Result<()> {
        self.set_property(table, keys::PARTITION_TTL_DAYS, days.to_string())
            .await
    }

    pub async fn clear_partition_ttl(&self, table: &TableInfo) -> Result<()> {
        self.set_property(table, keys::PARTITION_TTL_DAYS, String::new())
            .await
    }

    pub async fn set_compaction_ttl(&self, table: &TableInfo, days: u32) -> Result<()> {
        self.set_property(table, keys::COMPACTION_TTL_DAYS, days.to_string())
            .await
    }

    pub async fn clear_compaction_ttl(&self, table: &TableInfo) -> Result<()> {
        self.set_property(table, keys::COMPACTION_TTL_DAYS, String::new())
            .await
    }

    async fn set_property(&self, table: &TableInfo, key: &str, value: String) -> Result<()> {
        self.catalog
            .update_properties(
                &table.table_id,
                HashMap::from([(key.to_string(), value)]),
            )
            .await
    }

    /// The engine config overlaid with the table's own properties.
    pub fn effective_config(&self, table: &TableInfo) -> Result<TableStoreConfig> {
        let mut config = self.config.clone();
        config.apply_properties(&table.properties)?;
        Ok(config)
    }

    /// Tombstones every partition whose head is older than the partition
    /// TTL. Partitions that conflict mid-sweep are skipped; the next sweep
    /// picks them up. Returns the descriptors tombstoned.
    pub async fn sweep_expired_partitions(
        &self,
        table: &TableInfo,
        now_ms: i64,
    ) -> Result<Vec<PartitionDesc>> {
        let config = self.effective_config(table)?;
        let Some(days) = config.partition_ttl_days else {
            return Ok(Vec::new());
        };
        let cutoff = now_ms - days as i64 * MS_PER_DAY;

        let heads = retry_async(&RetryConfig::for_catalog(), || {
            self.catalog.list_partitions(&table.table_id)
        })
        .await?;

        let mut tombstoned = Vec::new();
        for head in heads {
            if head.commit_op == CommitOp::Delete || head.timestamp >= cutoff {
                continue;
            }
            match self.tombstone(table, &head).await {
                Ok(_) => {
                    self.metrics.record_partition_expired();
                    tombstoned.push(head.partition_desc.clone());
                }
                Err(e) if e.conflict_kind().is_some() => {
                    warn!(
                        "TTL sweep lost a race on '{}': {e}; will retry next sweep",
                        head.partition_desc
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if !tombstoned.is_empty() {
            info!(
                "TTL sweep tombstoned {} partition(s) of table {}",
                tombstoned.len(),
                table.table_id
            );
        }
        Ok(tombstoned)
    }

    /// Explicitly drops one partition by writing a delete-all tombstone.
    pub async fn drop_partition(
        &self,
        table: &TableInfo,
        desc: &PartitionDesc,
    ) -> Result<PartitionInfo> {
        if !table.is_range_partitioned() {
            return Err(LakeStateError::InvalidState(format!(
                "table {} is not range-partitioned; nothing to drop",
                table.table_id
            )));
        }
        let head = self
            .catalog
            .get_single_partition(&table.table_id, desc, 0)
            .await?
            .ok_or_else(|| LakeStateError::PartitionNotFound {
                table_id: table.table_id.to_string(),
                partition_desc: desc.as_str().to_string(),
            })?;
        if head.commit_op == CommitOp::Delete {
            return Ok(head);
        }
        self.tombstone(table, &head).await
    }

    /// Writes a delete-all version over `head` and records its live files in
    /// the discard log.
    async fn tombstone(&self, table: &TableInfo, head: &PartitionInfo) -> Result<PartitionInfo> {
        let commits = retry_async(&RetryConfig::for_catalog(), || {
            self.catalog.get_commits(&table.table_id, &head.read_files)
        })
        .await?;
        let live = resolve_files(table, head, &commits, TimeBounds::default())?;

        let file_ops: Vec<DataFileOp> =
            live.iter().map(|f| DataFileOp::del(f.path.clone())).collect();
        let envelope = CommitBuilder::new(table.clone(), CommitOp::Delete)
            .with_partition(head.partition_desc.clone(), file_ops)
            .with_read_partitions(vec![head.clone()])
            .build();

        let engine = CommitEngine::new(
            self.catalog.clone(),
            self.config.clone(),
            self.metrics.clone(),
        );
        let tombstone = engine.commit(envelope).await?.remove(0);

        let now = current_timestamp_ms();
        let discards: Vec<DiscardedFile> = live
            .iter()
            .map(|f| DiscardedFile::new(f.path.clone(), table.table_path.clone(), now))
            .collect();
        let count = discards.len();
        if count > 0 {
            if let Err(e) = self.catalog.record_discard(discards).await {
                warn!(
                    "failed to record {count} discarded file(s) for dropped '{}': {e}",
                    head.partition_desc
                );
            } else {
                self.metrics.record_files_discarded(count as u64);
            }
        }

        info!(
            "tombstoned '{}' at v{} ({count} file(s) to discard log)",
            head.partition_desc, tombstone.version
        );
        Ok(tombstone)
    }
}
