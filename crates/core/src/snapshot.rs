/*
 * Snapshots: an immutable view of a table at one logical read time.
 *
 * A snapshot never observes commits that land after it was opened: each
 * partition head is pinned the first time it is read, and time-travel
 * snapshots pin every head up front. Interior caches only memoize work; they
 * never change an observable result.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use lakestate_catalog::{
    CatalogClient, CatalogClientRef, DataFileInfo, PartitionDesc, PartitionInfo, TableInfo,
};
use lakestate_common::{
    retry_async, LakeStateError, Result, RetryConfig, ScanConfig, TableStoreMetrics, Timer,
};

use crate::predicate::{
    canonical_key, classify, evaluate_partitions, split_filters, CatalogAccessPath, Predicate,
};
use crate::resolver::{resolve_files, TimeBounds};

/// What moment a snapshot reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadType {
    /// Latest state as of first access.
    Full,
    /// State as of a historical timestamp (ms).
    SnapshotAt { ts: i64 },
    /// Only changes with commit timestamp in `(start_ts, end_ts]`.
    Incremental { start_ts: i64, end_ts: i64 },
}

impl ReadType {
    fn bounds(&self) -> TimeBounds {
        match self {
            ReadType::Full => TimeBounds::default(),
            ReadType::SnapshotAt { ts } => TimeBounds::upto(*ts),
            ReadType::Incremental { start_ts, end_ts } => TimeBounds::between(*start_ts, *end_ts),
        }
    }
}

/// A partition selected by the planner, with its evaluated column values.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionFilterInfo {
    pub partition_desc: PartitionDesc,
    pub values: HashMap<String, String>,
    pub version: i64,
    pub timestamp: i64,
}

/// What a scan receives: ordered files plus the predicates the IO layer must
/// still apply.
#[derive(Debug, Clone)]
pub struct ScanFileSet {
    pub files: Vec<DataFileInfo>,
    pub data_predicates: Vec<Predicate>,
}

pub struct Snapshot {
    table_info: Arc<TableInfo>,
    read_type: ReadType,
    catalog: CatalogClientRef,
    scan_config: ScanConfig,
    metrics: Arc<TableStoreMetrics>,

    /// Pinned partition heads, keyed by descriptor string.
    version_map: RwLock<HashMap<String, PartitionInfo>>,
    /// Set once `list_partitions` has populated the whole map.
    fully_listed: AtomicBool,

    filter_cache: RwLock<HashMap<String, Arc<Vec<PartitionFilterInfo>>>>,
    file_cache: RwLock<HashMap<String, Arc<Vec<DataFileInfo>>>>,

    /// Partition versions read through this snapshot, for commits launched
    /// from it.
    read_set: RwLock<Vec<PartitionInfo>>,
}

impl Snapshot {
    pub(crate) async fn open(
        catalog: CatalogClientRef,
        table_info: Arc<TableInfo>,
        read_type: ReadType,
        scan_config: ScanConfig,
        metrics: Arc<TableStoreMetrics>,
    ) -> Result<Self> {
        let snapshot = Self {
            table_info,
            read_type,
            catalog,
            scan_config,
            metrics,
            version_map: RwLock::new(HashMap::new()),
            fully_listed: AtomicBool::new(false),
            filter_cache: RwLock::new(HashMap::new()),
            file_cache: RwLock::new(HashMap::new()),
            read_set: RwLock::new(Vec::new()),
        };

        // Time travel pins every head up front; latest reads pin lazily so
        // predicate pushdown can avoid full enumeration.
        match read_type {
            ReadType::Full => {}
            ReadType::SnapshotAt { ts } | ReadType::Incremental { end_ts: ts, .. } => {
                snapshot.materialize_at(ts).await?;
            }
        }
        Ok(snapshot)
    }

    pub fn table_info(&self) -> &Arc<TableInfo> {
        &self.table_info
    }

    pub fn read_type(&self) -> ReadType {
        self.read_type
    }

    /// Partitions selected by the filters, cheapest catalog path first.
    /// Results are cached per canonicalized partition-predicate set.
    pub async fn partitions_for_scan(
        &self,
        filters: &[Predicate],
    ) -> Result<Vec<PartitionFilterInfo>> {
        let split = split_filters(filters, &self.table_info.range_partitions);
        let key = canonical_key(&split.partition);

        if let Some(hit) = self.lock_read(&self.filter_cache)?.get(&key) {
            return Ok((**hit).clone());
        }

        let selected = self.select_partitions(&split.partition).await?;
        let mut infos = Vec::with_capacity(selected.len());
        for p in &selected {
            infos.push(PartitionFilterInfo {
                values: p.partition_desc.values()?,
                partition_desc: p.partition_desc.clone(),
                version: p.version,
                timestamp: p.timestamp,
            });
        }

        self.lock_write(&self.filter_cache)?
            .insert(key, Arc::new(infos.clone()));
        Ok(infos)
    }

    /// Resolves the ordered file set for the selected partitions and returns
    /// it with the data predicates the IO layer must apply.
    pub async fn files_for_scan(&self, filters: &[Predicate]) -> Result<ScanFileSet> {
        let _timer = Timer::resolve(self.metrics.clone());
        let split = split_filters(filters, &self.table_info.range_partitions);
        let selected = self.partitions_for_scan(filters).await?;
        let bounds = self.read_type.bounds();

        // Serve cached descriptors, resolve the rest with overlapped commit
        // fetches.
        let mut ordered: Vec<(String, Option<Arc<Vec<DataFileInfo>>>)> = Vec::new();
        {
            let cache = self.lock_read(&self.file_cache)?;
            for info in &selected {
                let desc = info.partition_desc.as_str().to_string();
                ordered.push((desc.clone(), cache.get(&desc).cloned()));
            }
        }

        let mut missing: Vec<PartitionInfo> = Vec::new();
        {
            let map = self.lock_read(&self.version_map)?;
            for (desc, cached) in &ordered {
                if cached.is_none() {
                    let pinned = map.get(desc).ok_or_else(|| LakeStateError::Unexpected(
                        format!("selected partition '{desc}' missing from version map"),
                    ))?;
                    missing.push(pinned.clone());
                }
            }
        }

        let table = self.table_info.clone();
        let resolved = futures::future::try_join_all(missing.into_iter().map(|pv| {
            let catalog = self.catalog.clone();
            let table = table.clone();
            async move {
                let commits = retry_async(&RetryConfig::for_catalog(), || {
                    catalog.get_commits(&table.table_id, &pv.read_files)
                })
                .await?;
                let files = resolve_files(&table, &pv, &commits, bounds)?;
                Ok::<_, LakeStateError>((pv.partition_desc.as_str().to_string(), files))
            }
        }))
        .await?;

        let mut fresh: HashMap<String, Arc<Vec<DataFileInfo>>> = HashMap::new();
        {
            let mut cache = self.lock_write(&self.file_cache)?;
            for (desc, files) in resolved {
                let files = Arc::new(files);
                cache.insert(desc.clone(), files.clone());
                fresh.insert(desc, files);
            }
        }

        let mut files = Vec::new();
        for (desc, cached) in ordered {
            let list = cached
                .or_else(|| fresh.get(&desc).cloned())
                .ok_or_else(|| LakeStateError::Unexpected(format!("no files resolved for '{desc}'")))?;
            files.extend(list.iter().cloned());
        }

        self.metrics.record_files_resolved(files.len() as u64);
        debug!(
            "scan over {} partition(s) yields {} file(s)",
            selected.len(),
            files.len()
        );
        Ok(ScanFileSet {
            files,
            data_predicates: split.data,
        })
    }

    /// Splits a resolved file list into ordered scan groups of at most the
    /// configured size, never splitting a bucket across groups.
    pub fn scan_groups(&self, files: &[DataFileInfo]) -> Vec<Vec<DataFileInfo>> {
        let limit = match self.scan_config.file_number_limit {
            Some(limit) if limit > 0 => limit,
            _ => return vec![files.to_vec()],
        };

        let mut groups: Vec<Vec<DataFileInfo>> = Vec::new();
        let mut current: Vec<DataFileInfo> = Vec::new();
        let mut i = 0;
        while i < files.len() {
            // Take the whole run of one (partition, bucket) at once.
            let mut j = i + 1;
            while j < files.len()
                && files[j].bucket_id == files[i].bucket_id
                && files[j].partition_desc == files[i].partition_desc
            {
                j += 1;
            }
            let run = &files[i..j];
            if !current.is_empty() && current.len() + run.len() > limit {
                groups.push(std::mem::take(&mut current));
            }
            current.extend(run.iter().cloned());
            i = j;
        }
        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }

    /// Adds a partition version to the read set used by commits launched
    /// from this snapshot.
    pub fn record_partition_read(&self, pv: PartitionInfo) {
        if let Ok(mut set) = self.read_set.write() {
            if !set
                .iter()
                .any(|p| p.partition_desc == pv.partition_desc && p.version == pv.version)
            {
                set.push(pv);
            }
        }
    }

    pub fn read_set(&self) -> Vec<PartitionInfo> {
        self.read_set.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// The pinned head for a descriptor, fetching (and pinning) it for
    /// latest-mode snapshots.
    pub async fn partition_head(&self, desc: &PartitionDesc) -> Result<Option<PartitionInfo>> {
        if let Some(pinned) = self.lock_read(&self.version_map)?.get(desc.as_str()) {
            return Ok(Some(pinned.clone()));
        }
        if self.read_type != ReadType::Full || self.fully_listed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let fetched = self
            .catalog
            .get_single_partition(&self.table_info.table_id, desc, 0)
            .await?;
        Ok(fetched.map(|p| self.pin(p)))
    }

    /// Drops every cache. A latest-mode snapshot starts pinning afresh; a
    /// time-travel snapshot keeps its materialized version map.
    pub fn invalidate(&self) {
        if let Ok(mut c) = self.filter_cache.write() {
            c.clear();
        }
        if let Ok(mut c) = self.file_cache.write() {
            c.clear();
        }
        if self.read_type == ReadType::Full {
            if let Ok(mut m) = self.version_map.write() {
                m.clear();
            }
            self.fully_listed.store(false, Ordering::Release);
        }
    }

    async fn select_partitions(&self, preds: &[Predicate]) -> Result<Vec<PartitionInfo>> {
        if self.read_type != ReadType::Full {
            // Time travel evaluates client-side over the materialized map;
            // catalog index paths would answer for the wrong moment.
            return evaluate_partitions(preds, self.all_pinned()?);
        }

        let path = classify(preds, &self.table_info.range_partitions)?;
        let selected = match path {
            CatalogAccessPath::Empty => Vec::new(),
            CatalogAccessPath::SinglePartition(desc) => {
                self.partition_head(&desc).await?.into_iter().collect()
            }
            CatalogAccessPath::EqualityQuery(query) => {
                if self.fully_listed.load(Ordering::Acquire) {
                    evaluate_partitions(preds, self.all_pinned()?)?
                } else {
                    let fetched = retry_async(&RetryConfig::for_catalog(), || {
                        self.catalog
                            .get_partitions_by_eq(&self.table_info.table_id, &query)
                    })
                    .await?;
                    fetched.into_iter().map(|p| self.pin(p)).collect()
                }
            }
            CatalogAccessPath::FullList => {
                self.ensure_listed().await?;
                evaluate_partitions(preds, self.all_pinned()?)?
            }
        };

        self.metrics
            .record_partitions_pruned(self.lock_read(&self.version_map)?.len() as u64, selected.len() as u64);
        Ok(selected)
    }

    async fn ensure_listed(&self) -> Result<()> {
        if self.fully_listed.load(Ordering::Acquire) {
            return Ok(());
        }
        let heads = retry_async(&RetryConfig::for_catalog(), || {
            self.catalog.list_partitions(&self.table_info.table_id)
        })
        .await?;
        for head in heads {
            self.pin(head);
        }
        self.fully_listed.store(true, Ordering::Release);
        Ok(())
    }

    async fn materialize_at(&self, ts: i64) -> Result<()> {
        let heads = retry_async(&RetryConfig::for_catalog(), || {
            self.catalog.list_partitions(&self.table_info.table_id)
        })
        .await?;

        let catalog = self.catalog.clone();
        let table_id = self.table_info.table_id;
        let pinned = futures::future::try_join_all(heads.into_iter().map(|head| {
            let catalog = catalog.clone();
            async move {
                let version = catalog
                    .version_upto_ts(&table_id, &head.partition_desc, ts)
                    .await?;
                if version < 0 {
                    return Ok::<_, LakeStateError>(None);
                }
                catalog
                    .get_single_partition(&table_id, &head.partition_desc, version)
                    .await
            }
        }))
        .await?;

        {
            let mut map = self.lock_write(&self.version_map)?;
            for p in pinned.into_iter().flatten() {
                map.insert(p.partition_desc.as_str().to_string(), p);
            }
        }
        self.fully_listed.store(true, Ordering::Release);
        Ok(())
    }

    /// Pins a head unless the descriptor is already pinned; first read wins
    /// so one snapshot never sees two versions of a partition.
    fn pin(&self, p: PartitionInfo) -> PartitionInfo {
        let mut map = match self.version_map.write() {
            Ok(map) => map,
            Err(_) => return p,
        };
        map.entry(p.partition_desc.as_str().to_string())
            .or_insert(p)
            .clone()
    }

    fn all_pinned(&self) -> Result<Vec<PartitionInfo>> {
        let map = self.lock_read(&self.version_map)?;
        let mut all: Vec<PartitionInfo> = map.values().cloned().collect();
        all.sort_by(|a, b| a.partition_desc.cmp(&b.partition_desc));
        Ok(all)
    }

    fn lock_read<'a, T>(&self, lock: &'a RwLock<T>) -> Result<std::sync::RwLockReadGuard<'a, T>> {
        lock.read()
            .map_err(|e| LakeStateError::Unexpected(format!("snapshot lock poisoned: {e}")))
    }

    fn lock_write<'a, T>(
        &self,
        lock: &'a RwLock<T>,
    ) -> Result<std::sync::RwLockWriteGuard<'a, T>> {
        lock.write()
            .map_err(|e| LakeStateError::Unexpected(format!("snapshot lock poisoned: {e}")))
    }
}
