/*
 * TableStore: the engine facade.
 *
 * Owns the injected catalog client, the engine configuration, metrics, and a
 * TTL-bounded cache of latest-mode snapshots. Commit success invalidates the
 * cached snapshot of the table, so a writer's next snapshot sees its own
 * commit.
 */

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::debug;

use lakestate_catalog::{
    CatalogClient, CatalogClientRef, CommitEnvelope, PartitionDesc, PartitionInfo, TableId,
    TableInfo,
};
use lakestate_common::{Result, TableStoreConfig, TableStoreMetrics};

use crate::cleanup::DiscardCleaner;
use crate::commit::CommitEngine;
use crate::compaction::{
    CancelFlag, CompactionExecutor, CompactionIo, CompactionOutcome, CompactionPlanner,
};
use crate::snapshot::{ReadType, Snapshot};
use crate::ttl::TtlManager;

struct CachedSnapshot {
    snapshot: Arc<Snapshot>,
    created_at: Instant,
}

pub struct TableStore {
    catalog: CatalogClientRef,
    config: TableStoreConfig,
    metrics: Arc<TableStoreMetrics>,
    engine: CommitEngine,
    snapshots: RwLock<HashMap<TableId, CachedSnapshot>>,
    table_infos: RwLock<HashMap<TableId, (TableInfo, Instant)>>,
}

impl TableStore {
    pub fn new(catalog: CatalogClientRef, config: TableStoreConfig) -> Self {
        Self::with_metrics(catalog, config, Arc::new(TableStoreMetrics::new()))
    }

    pub fn with_metrics(
        catalog: CatalogClientRef,
        config: TableStoreConfig,
        metrics: Arc<TableStoreMetrics>,
    ) -> Self {
        let engine = CommitEngine::new(catalog.clone(), config.clone(), metrics.clone());
        Self {
            catalog,
            config,
            metrics,
            engine,
            snapshots: RwLock::new(HashMap::new()),
            table_infos: RwLock::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &CatalogClientRef {
        &self.catalog
    }

    pub fn config(&self) -> &TableStoreConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<TableStoreMetrics> {
        self.metrics.clone()
    }

    pub async fn create_table(&self, info: TableInfo) -> Result<()> {
        self.catalog.create_table(info).await
    }

    /// Table metadata, served from a TTL-bounded cache.
    pub async fn table_by_id(&self, table_id: &TableId) -> Result<TableInfo> {
        let expire = self.config.scan.snapshot_cache_expire;
        if let Ok(cache) = self.table_infos.read() {
            if let Some((info, cached_at)) = cache.get(table_id) {
                if cached_at.elapsed() < expire {
                    return Ok(info.clone());
                }
            }
        }
        let info = self.catalog.get_table_info_by_id(table_id).await?;
        if let Ok(mut cache) = self.table_infos.write() {
            cache.insert(*table_id, (info.clone(), Instant::now()));
        }
        Ok(info)
    }

    pub async fn table_by_path(&self, path: &str) -> Result<TableInfo> {
        self.catalog.get_table_info_by_path(path).await
    }

    /// The engine config overlaid with a table's own properties.
    pub fn effective_config(&self, table: &TableInfo) -> Result<TableStoreConfig> {
        let mut config = self.config.clone();
        config.apply_properties(&table.properties)?;
        Ok(config)
    }

    /// A latest-mode snapshot, served from cache within the configured
    /// expiry window.
    pub async fn snapshot(&self, table_id: &TableId) -> Result<Arc<Snapshot>> {
        let expire = self.config.scan.snapshot_cache_expire;
        if let Ok(cache) = self.snapshots.read() {
            if let Some(entry) = cache.get(table_id) {
                if entry.created_at.elapsed() < expire {
                    self.metrics.record_snapshot(true);
                    return Ok(entry.snapshot.clone());
                }
            }
        }

        let snapshot = self.open_snapshot(table_id, ReadType::Full).await?;
        if let Ok(mut cache) = self.snapshots.write() {
            cache.insert(
                *table_id,
                CachedSnapshot {
                    snapshot: snapshot.clone(),
                    created_at: Instant::now(),
                },
            );
        }
        Ok(snapshot)
    }

    /// A time-travel snapshot pinned at `ts` (ms). Never cached.
    pub async fn snapshot_at(&self, table_id: &TableId, ts: i64) -> Result<Arc<Snapshot>> {
        self.open_snapshot(table_id, ReadType::SnapshotAt { ts }).await
    }

    /// An incremental view over `(start_ts, end_ts]`. Never cached.
    pub async fn incremental(
        &self,
        table_id: &TableId,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Arc<Snapshot>> {
        self.open_snapshot(table_id, ReadType::Incremental { start_ts, end_ts })
            .await
    }

    async fn open_snapshot(&self, table_id: &TableId, read_type: ReadType) -> Result<Arc<Snapshot>> {
        let table = self.table_by_id(table_id).await?;
        let effective = self.effective_config(&table)?;
        self.metrics.record_snapshot(false);
        let snapshot = Snapshot::open(
            self.catalog.clone(),
            Arc::new(table),
            read_type,
            effective.scan,
            self.metrics.clone(),
        )
        .await?;
        Ok(Arc::new(snapshot))
    }

    /// Commits an envelope and invalidates this table's cached snapshot
    /// (read-your-writes).
    pub async fn commit(&self, envelope: CommitEnvelope) -> Result<Vec<PartitionInfo>> {
        let table_id = envelope.table_info.table_id;
        let partitions = self.engine.commit(envelope).await?;
        self.invalidate_table(&table_id);
        Ok(partitions)
    }

    pub fn commit_engine(&self) -> &CommitEngine {
        &self.engine
    }

    /// Plans and executes compaction of one partition. `target_bucket_num`
    /// different from the table's bucket count runs a rebucketing pass.
    pub async fn compact(
        &self,
        table_id: &TableId,
        desc: &PartitionDesc,
        io: Arc<dyn CompactionIo>,
        target_bucket_num: Option<usize>,
        cancel: &CancelFlag,
    ) -> Result<Option<CompactionOutcome>> {
        let table = self.table_by_id(table_id).await?;
        let effective = self.effective_config(&table)?;

        let planner =
            CompactionPlanner::new(self.catalog.clone(), effective.clone(), self.metrics.clone());
        let Some(plan) = planner.plan(&table, desc, target_bucket_num).await? else {
            debug!("no compaction needed for '{desc}' of table {table_id}");
            return Ok(None);
        };

        let executor =
            CompactionExecutor::new(self.catalog.clone(), io, effective, self.metrics.clone());
        let outcome = executor.execute(plan, cancel).await?;
        if outcome.is_some() {
            self.invalidate_table(table_id);
        }
        Ok(outcome)
    }

    /// TTL and partition lifecycle operations.
    pub fn lifecycle(&self) -> TtlManager {
        TtlManager::new(self.catalog.clone(), self.config.clone(), self.metrics.clone())
    }

    /// Tombstones expired partitions and invalidates the table on change.
    pub async fn sweep_expired_partitions(
        &self,
        table: &TableInfo,
        now_ms: i64,
    ) -> Result<Vec<PartitionDesc>> {
        let swept = self.lifecycle().sweep_expired_partitions(table, now_ms).await?;
        if !swept.is_empty() {
            self.invalidate_table(&table.table_id);
        }
        Ok(swept)
    }

    /// A discard cleaner bound to the table's storage location.
    pub fn cleaner_for(&self, table: &TableInfo) -> Result<DiscardCleaner> {
        DiscardCleaner::for_table(self.catalog.clone(), table, self.metrics.clone())
    }

    /// Drops the cached snapshot and table info and clears the snapshot's
    /// interior caches.
    pub fn invalidate_table(&self, table_id: &TableId) {
        if let Ok(mut cache) = self.snapshots.write() {
            if let Some(entry) = cache.remove(table_id) {
                entry.snapshot.invalidate();
            }
        }
        if let Ok(mut cache) = self.table_infos.write() {
            cache.remove(table_id);
        }
    }
}
