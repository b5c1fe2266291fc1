/*
 * Embedded in-memory catalog.
 *
 * Implements the full commit transaction and conflict rule table on process
 * state. Useful for tests and single-process embedding; a service-backed
 * client implements the same trait over the wire entities.
 *
 * Conflict rules, evaluated atomically against current chain state:
 *   append      - admitted on top of newer versions (adds are orthogonal)
 *                 unless a compaction barrier or tombstone landed since the
 *                 read
 *   update      - must be latest
 *   delete      - must be latest
 *   compaction  - must be latest; any lost race reports CompactionRaced
 *   merge       - must be latest on every involved partition
 */

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use lakestate_common::{ConflictKind, LakeStateError, Result};

use crate::client::{CatalogClient, CommitEnvelope, CommitOutcome};
use crate::model::{
    current_timestamp_ms, CommitId, CommitOp, DataCommitInfo, DiscardedFile, PartitionDesc,
    PartitionInfo, TableId, TableInfo, TableSchema,
};

/// Property key under which the bucket count is mirrored, so a rebucketing
/// compaction can land the change as an ordinary property update.
pub const PROP_HASH_BUCKET_NUM: &str = "hash_bucket_num";

#[derive(Default)]
struct CatalogState {
    tables: HashMap<TableId, TableInfo>,
    paths: HashMap<String, TableId>,
    /// Version chains, ascending, per (table, descriptor).
    partitions: HashMap<(TableId, String), Vec<PartitionInfo>>,
    commits: HashMap<(TableId, CommitId), DataCommitInfo>,
    discards: Vec<DiscardedFile>,
}

/// In-memory catalog service.
#[derive(Default)]
pub struct MemCatalog {
    state: RwLock<CatalogState>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, CatalogState>> {
        self.state
            .read()
            .map_err(|e| LakeStateError::Unexpected(format!("catalog lock poisoned: {e}")))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, CatalogState>> {
        self.state
            .write()
            .map_err(|e| LakeStateError::Unexpected(format!("catalog lock poisoned: {e}")))
    }
}

/// What the conflict check decided for one partition of an envelope.
enum PartitionDecision {
    /// Link on top of the writer's read version as proposed.
    AsProposed,
    /// Append admitted over newer versions; read_files must be rebuilt from
    /// the current head.
    Rebase,
}

fn check_partition(
    commit_type: CommitOp,
    read_version: i64,
    chain: Option<&Vec<PartitionInfo>>,
    desc: &PartitionDesc,
) -> std::result::Result<PartitionDecision, (ConflictKind, Option<PartitionInfo>)> {
    let current = chain.and_then(|c| c.last());
    let current_version = current.map(|p| p.version).unwrap_or(-1);

    if current_version == read_version {
        return Ok(PartitionDecision::AsProposed);
    }
    if current_version < read_version {
        // The writer claims to have read a version the catalog never wrote.
        debug!(
            "partition '{}': read version {} ahead of chain head {}",
            desc, read_version, current_version
        );
        return Err((ConflictKind::StalePartition, current.cloned()));
    }

    let intervening = chain
        .map(|c| {
            c.iter()
                .filter(|p| p.version > read_version && p.version <= current_version)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let saw_tombstone = intervening.iter().any(|p| p.commit_op == CommitOp::Delete);
    let saw_barrier = intervening
        .iter()
        .any(|p| p.commit_op == CommitOp::Compaction);

    let kind = match commit_type {
        CommitOp::Append => {
            if saw_tombstone {
                ConflictKind::TombstoneRaced
            } else if saw_barrier {
                ConflictKind::CompactionRaced
            } else {
                return Ok(PartitionDecision::Rebase);
            }
        }
        // A compaction that lost any race must be replanned from scratch.
        CommitOp::Compaction => ConflictKind::CompactionRaced,
        CommitOp::Update | CommitOp::Delete | CommitOp::Merge => {
            if saw_tombstone {
                ConflictKind::TombstoneRaced
            } else {
                ConflictKind::StalePartition
            }
        }
    };
    Err((kind, current.cloned()))
}

#[async_trait]
impl CatalogClient for MemCatalog {
    async fn create_table(&self, info: TableInfo) -> Result<()> {
        info.validate()?;
        let mut state = self.write()?;
        if state.tables.contains_key(&info.table_id) {
            return Err(LakeStateError::InvalidState(format!(
                "table id {} already exists",
                info.table_id
            )));
        }
        if state.paths.contains_key(&info.table_path) {
            return Err(LakeStateError::InvalidState(format!(
                "table path '{}' already registered",
                info.table_path
            )));
        }
        state.paths.insert(info.table_path.clone(), info.table_id);
        state.tables.insert(info.table_id, info);
        Ok(())
    }

    async fn get_table_info_by_id(&self, table_id: &TableId) -> Result<TableInfo> {
        self.read()?
            .tables
            .get(table_id)
            .cloned()
            .ok_or_else(|| LakeStateError::TableNotFound(table_id.to_string()))
    }

    async fn get_table_info_by_path(&self, path: &str) -> Result<TableInfo> {
        let state = self.read()?;
        let id = state
            .paths
            .get(path)
            .ok_or_else(|| LakeStateError::TableNotFound(path.to_string()))?;
        state
            .tables
            .get(id)
            .cloned()
            .ok_or_else(|| LakeStateError::TableNotFound(path.to_string()))
    }

    async fn list_partitions(&self, table_id: &TableId) -> Result<Vec<PartitionInfo>> {
        let state = self.read()?;
        if !state.tables.contains_key(table_id) {
            return Err(LakeStateError::TableNotFound(table_id.to_string()));
        }
        let mut heads: Vec<PartitionInfo> = state
            .partitions
            .iter()
            .filter(|((tid, _), _)| tid == table_id)
            .filter_map(|(_, chain)| chain.last().cloned())
            .collect();
        heads.sort_by(|a, b| a.partition_desc.cmp(&b.partition_desc));
        Ok(heads)
    }

    async fn get_single_partition(
        &self,
        table_id: &TableId,
        desc: &PartitionDesc,
        version: i64,
    ) -> Result<Option<PartitionInfo>> {
        let state = self.read()?;
        let chain = state
            .partitions
            .get(&(*table_id, desc.as_str().to_string()));
        Ok(match chain {
            None => None,
            Some(chain) if version <= 0 => chain.last().cloned(),
            Some(chain) => chain.iter().find(|p| p.version == version).cloned(),
        })
    }

    async fn get_partitions_by_eq(
        &self,
        table_id: &TableId,
        query: &[(String, String)],
    ) -> Result<Vec<PartitionInfo>> {
        let heads = self.list_partitions(table_id).await?;
        let mut matched = Vec::new();
        for head in heads {
            let values = head.partition_desc.values()?;
            if query
                .iter()
                .all(|(col, value)| values.get(col) == Some(value))
            {
                matched.push(head);
            }
        }
        Ok(matched)
    }

    async fn version_upto_ts(
        &self,
        table_id: &TableId,
        desc: &PartitionDesc,
        ts: i64,
    ) -> Result<i64> {
        let state = self.read()?;
        Ok(state
            .partitions
            .get(&(*table_id, desc.as_str().to_string()))
            .and_then(|chain| {
                chain
                    .iter()
                    .filter(|p| p.timestamp <= ts)
                    .map(|p| p.version)
                    .max()
            })
            .unwrap_or(-1))
    }

    async fn get_commits(
        &self,
        table_id: &TableId,
        commit_ids: &[CommitId],
    ) -> Result<Vec<DataCommitInfo>> {
        let state = self.read()?;
        commit_ids
            .iter()
            .map(|id| {
                state
                    .commits
                    .get(&(*table_id, *id))
                    .cloned()
                    .ok_or_else(|| LakeStateError::CommitNotFound(id.to_string()))
            })
            .collect()
    }

    async fn commit(&self, envelope: CommitEnvelope) -> Result<CommitOutcome> {
        let mut state = self.write()?;
        let table_id = envelope.table_info.table_id;
        let table = state
            .tables
            .get(&table_id)
            .ok_or_else(|| LakeStateError::TableNotFound(table_id.to_string()))?;

        // The writer staged against a schema the catalog no longer holds.
        if table.schema != envelope.table_info.schema {
            let desc = envelope
                .new_partitions
                .first()
                .map(|p| p.partition_desc.clone())
                .unwrap_or_else(PartitionDesc::unpartitioned);
            return Ok(CommitOutcome::Conflict {
                kind: ConflictKind::SchemaChanged,
                partition_desc: desc,
                current: None,
            });
        }

        let mut seen = std::collections::HashSet::new();
        for p in &envelope.new_partitions {
            if !seen.insert(p.partition_desc.as_str().to_string()) {
                return Err(LakeStateError::InvalidState(format!(
                    "envelope names partition '{}' twice",
                    p.partition_desc
                )));
            }
        }
        for c in &envelope.data_commits {
            if !seen.contains(c.partition_desc.as_str()) {
                return Err(LakeStateError::InvalidState(format!(
                    "data commit {} targets partition '{}' missing from envelope",
                    c.commit_id, c.partition_desc
                )));
            }
        }

        // Phase 1: every partition must pass before anything is written.
        let mut decisions = Vec::with_capacity(envelope.new_partitions.len());
        for proposed in &envelope.new_partitions {
            let key = (table_id, proposed.partition_desc.as_str().to_string());
            let read_version = envelope.read_version(&proposed.partition_desc);
            match check_partition(
                envelope.commit_type,
                read_version,
                state.partitions.get(&key),
                &proposed.partition_desc,
            ) {
                Ok(decision) => decisions.push(decision),
                Err((kind, current)) => {
                    debug!(
                        "commit rejected: {} on '{}' ({} commit)",
                        kind, proposed.partition_desc, envelope.commit_type
                    );
                    return Ok(CommitOutcome::Conflict {
                        kind,
                        partition_desc: proposed.partition_desc.clone(),
                        current,
                    });
                }
            }
        }

        // Phase 2: link new versions and flip commits, all under this lock.
        let now = current_timestamp_ms();
        let mut linked = Vec::with_capacity(envelope.new_partitions.len());
        for (proposed, decision) in envelope.new_partitions.iter().zip(decisions) {
            let key = (table_id, proposed.partition_desc.as_str().to_string());
            let chain = state.partitions.entry(key).or_default();
            let current_version = chain.last().map(|p| p.version).unwrap_or(-1);

            let read_files = match decision {
                PartitionDecision::AsProposed => proposed.read_files.clone(),
                PartitionDecision::Rebase => {
                    let mut rebased = chain
                        .last()
                        .map(|p| p.read_files.clone())
                        .unwrap_or_default();
                    rebased.extend(
                        envelope
                            .data_commits
                            .iter()
                            .filter(|c| c.partition_desc == proposed.partition_desc)
                            .map(|c| c.commit_id),
                    );
                    rebased
                }
            };

            let info = PartitionInfo {
                table_id,
                partition_desc: proposed.partition_desc.clone(),
                version: current_version + 1,
                read_files,
                commit_op: envelope.commit_type,
                expression: proposed.expression.clone(),
                timestamp: if proposed.timestamp > 0 {
                    proposed.timestamp
                } else {
                    now
                },
            };
            chain.push(info.clone());
            linked.push(info);
        }

        for mut commit in envelope.data_commits {
            commit.committed = true;
            state.commits.insert((table_id, commit.commit_id), commit);
        }

        debug!(
            "committed {} partition(s) ({} commit) on table {}",
            linked.len(),
            envelope.commit_type,
            table_id
        );
        Ok(CommitOutcome::Committed { partitions: linked })
    }

    async fn update_properties(
        &self,
        table_id: &TableId,
        props: HashMap<String, String>,
    ) -> Result<()> {
        let mut state = self.write()?;
        let table = state
            .tables
            .get_mut(table_id)
            .ok_or_else(|| LakeStateError::TableNotFound(table_id.to_string()))?;
        if let Some(n) = props.get(PROP_HASH_BUCKET_NUM) {
            table.hash_bucket_num = n.parse().map_err(|_| {
                LakeStateError::InvalidState(format!("bad {PROP_HASH_BUCKET_NUM} value '{n}'"))
            })?;
        }
        table.properties.extend(props);
        Ok(())
    }

    async fn update_schema(&self, table_id: &TableId, schema: TableSchema) -> Result<()> {
        let mut state = self.write()?;
        let table = state
            .tables
            .get_mut(table_id)
            .ok_or_else(|| LakeStateError::TableNotFound(table_id.to_string()))?;
        table.schema = schema;
        Ok(())
    }

    async fn record_discard(&self, files: Vec<DiscardedFile>) -> Result<()> {
        let mut state = self.write()?;
        state.discards.extend(files);
        Ok(())
    }

    async fn list_discarded(&self, older_than_ts: i64) -> Result<Vec<DiscardedFile>> {
        let state = self.read()?;
        Ok(state
            .discards
            .iter()
            .filter(|f| f.timestamp <= older_than_ts)
            .cloned()
            .collect())
    }

    async fn delete_discarded(&self, paths: &[String]) -> Result<()> {
        let mut state = self.write()?;
        let doomed: std::collections::HashSet<&str> = paths.iter().map(|s| s.as_str()).collect();
        state.discards.retain(|f| !doomed.contains(f.path.as_str()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataFileOp, SchemaField};

    fn table() -> TableInfo {
        TableInfo {
            table_id: uuid::Uuid::new_v4(),
            namespace: "default".to_string(),
            table_name: Some("events".to_string()),
            table_path: "/tmp/events".to_string(),
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

    fn append_envelope(
        table: &TableInfo,
        desc: &PartitionDesc,
        read: Option<&PartitionInfo>,
        path: &str,
    ) -> CommitEnvelope {
        let commit = DataCommitInfo {
            commit_id: uuid::Uuid::new_v4(),
            table_id: table.table_id,
            partition_desc: desc.clone(),
            commit_op: CommitOp::Append,
            file_ops: vec![DataFileOp::add(path, 100, "d,v")],
            timestamp: current_timestamp_ms(),
            committed: false,
        };
        let mut read_files: Vec<CommitId> =
            read.map(|p| p.read_files.clone()).unwrap_or_default();
        read_files.push(commit.commit_id);
        CommitEnvelope {
            table_info: table.clone(),
            commit_type: CommitOp::Append,
            new_partitions: vec![PartitionInfo {
                table_id: table.table_id,
                partition_desc: desc.clone(),
                version: 0,
                read_files,
                commit_op: CommitOp::Append,
                expression: None,
                timestamp: 0,
            }],
            read_partitions: read.cloned().into_iter().collect(),
            data_commits: vec![commit],
        }
    }

    fn compaction_envelope(
        table: &TableInfo,
        desc: &PartitionDesc,
        read: &PartitionInfo,
    ) -> CommitEnvelope {
        let commit = DataCommitInfo {
            commit_id: uuid::Uuid::new_v4(),
            table_id: table.table_id,
            partition_desc: desc.clone(),
            commit_op: CommitOp::Compaction,
            file_ops: vec![DataFileOp::add("/tmp/compact-x-bucket0.parquet", 200, "d,v")],
            timestamp: current_timestamp_ms(),
            committed: false,
        };
        CommitEnvelope {
            table_info: table.clone(),
            commit_type: CommitOp::Compaction,
            new_partitions: vec![PartitionInfo {
                table_id: table.table_id,
                partition_desc: desc.clone(),
                version: 0,
                read_files: vec![commit.commit_id],
                commit_op: CommitOp::Compaction,
                expression: None,
                timestamp: 0,
            }],
            read_partitions: vec![read.clone()],
            data_commits: vec![commit],
        }
    }

    async fn committed(catalog: &MemCatalog, envelope: CommitEnvelope) -> PartitionInfo {
        match catalog.commit(envelope).await.unwrap() {
            CommitOutcome::Committed { mut partitions } => partitions.remove(0),
            CommitOutcome::Conflict { kind, .. } => panic!("unexpected conflict: {kind}"),
        }
    }

    #[tokio::test]
    async fn test_versions_gap_free() {
        let catalog = MemCatalog::new();
        let table = table();
        catalog.create_table(table.clone()).await.unwrap();
        let desc = PartitionDesc::from("d=1");

        let mut head: Option<PartitionInfo> = None;
        for i in 0..5i64 {
            let envelope = append_envelope(&table, &desc, head.as_ref(), &format!("/tmp/f{i}"));
            let linked = committed(&catalog, envelope).await;
            assert_eq!(linked.version, i);
            assert_eq!(linked.read_files.len(), (i + 1) as usize);
            head = Some(linked);
        }
    }

    #[tokio::test]
    async fn test_concurrent_appends_both_admitted() {
        let catalog = MemCatalog::new();
        let table = table();
        catalog.create_table(table.clone()).await.unwrap();
        let desc = PartitionDesc::from("d=1");

        let base = committed(&catalog, append_envelope(&table, &desc, None, "/tmp/f0")).await;

        // Both writers stage against the same head.
        let a = append_envelope(&table, &desc, Some(&base), "/tmp/fa");
        let b = append_envelope(&table, &desc, Some(&base), "/tmp/fb");
        let a_id = a.data_commits[0].commit_id;
        let b_id = b.data_commits[0].commit_id;

        let va = committed(&catalog, a).await;
        let vb = committed(&catalog, b).await;

        assert_eq!(va.version, 1);
        assert_eq!(vb.version, 2);
        // The later append was rebased: it carries both new commits.
        assert_eq!(vb.read_files.last(), Some(&b_id));
        assert!(vb.read_files.contains(&a_id));
    }

    #[tokio::test]
    async fn test_append_rejected_after_compaction_barrier() {
        let catalog = MemCatalog::new();
        let table = table();
        catalog.create_table(table.clone()).await.unwrap();
        let desc = PartitionDesc::from("d=1");

        let v0 = committed(&catalog, append_envelope(&table, &desc, None, "/tmp/f0")).await;
        let stale_append = append_envelope(&table, &desc, Some(&v0), "/tmp/f1");
        committed(&catalog, compaction_envelope(&table, &desc, &v0)).await;

        match catalog.commit(stale_append).await.unwrap() {
            CommitOutcome::Conflict { kind, current, .. } => {
                assert_eq!(kind, ConflictKind::CompactionRaced);
                assert_eq!(current.unwrap().version, 1);
            }
            CommitOutcome::Committed { .. } => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn test_compaction_loses_any_race() {
        let catalog = MemCatalog::new();
        let table = table();
        catalog.create_table(table.clone()).await.unwrap();
        let desc = PartitionDesc::from("d=1");

        let v0 = committed(&catalog, append_envelope(&table, &desc, None, "/tmp/f0")).await;
        let compaction = compaction_envelope(&table, &desc, &v0);
        committed(&catalog, append_envelope(&table, &desc, Some(&v0), "/tmp/f1")).await;

        match catalog.commit(compaction).await.unwrap() {
            CommitOutcome::Conflict { kind, .. } => {
                assert_eq!(kind, ConflictKind::CompactionRaced)
            }
            CommitOutcome::Committed { .. } => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn test_update_requires_latest() {
        let catalog = MemCatalog::new();
        let table = table();
        catalog.create_table(table.clone()).await.unwrap();
        let desc = PartitionDesc::from("d=1");

        let v0 = committed(&catalog, append_envelope(&table, &desc, None, "/tmp/f0")).await;
        committed(&catalog, append_envelope(&table, &desc, Some(&v0), "/tmp/f1")).await;

        let mut stale_update = append_envelope(&table, &desc, Some(&v0), "/tmp/f2");
        stale_update.commit_type = CommitOp::Update;
        stale_update.data_commits[0].commit_op = CommitOp::Update;

        match catalog.commit(stale_update).await.unwrap() {
            CommitOutcome::Conflict { kind, .. } => {
                assert_eq!(kind, ConflictKind::StalePartition)
            }
            CommitOutcome::Committed { .. } => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn test_schema_change_detected() {
        let catalog = MemCatalog::new();
        let table = table();
        catalog.create_table(table.clone()).await.unwrap();
        let desc = PartitionDesc::from("d=1");

        let envelope = append_envelope(&table, &desc, None, "/tmp/f0");
        catalog
            .update_schema(
                &table.table_id,
                TableSchema::new(vec![SchemaField::new("d", "string", false)]),
            )
            .await
            .unwrap();

        match catalog.commit(envelope).await.unwrap() {
            CommitOutcome::Conflict { kind, .. } => {
                assert_eq!(kind, ConflictKind::SchemaChanged)
            }
            CommitOutcome::Committed { .. } => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn test_commits_flipped_and_fetchable() {
        let catalog = MemCatalog::new();
        let table = table();
        catalog.create_table(table.clone()).await.unwrap();
        let desc = PartitionDesc::from("d=1");

        let head = committed(&catalog, append_envelope(&table, &desc, None, "/tmp/f0")).await;
        let commits = catalog
            .get_commits(&table.table_id, &head.read_files)
            .await
            .unwrap();
        assert_eq!(commits.len(), 1);
        assert!(commits[0].committed);
    }

    #[tokio::test]
    async fn test_eq_query_and_version_upto_ts() {
        let catalog = MemCatalog::new();
        let mut table = table();
        table.schema.fields.push(SchemaField::new("r", "string", false));
        table.range_partitions = vec!["r".to_string(), "d".to_string()];
        catalog.create_table(table.clone()).await.unwrap();

        let us = PartitionDesc::from("r=us,d=1");
        let eu = PartitionDesc::from("r=eu,d=1");
        let v0 = committed(&catalog, append_envelope(&table, &us, None, "/tmp/us0")).await;
        committed(&catalog, append_envelope(&table, &eu, None, "/tmp/eu0")).await;

        let matched = catalog
            .get_partitions_by_eq(&table.table_id, &[("r".to_string(), "us".to_string())])
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].partition_desc, us);

        let version = catalog
            .version_upto_ts(&table.table_id, &us, v0.timestamp)
            .await
            .unwrap();
        assert_eq!(version, 0);
        let version = catalog
            .version_upto_ts(&table.table_id, &us, v0.timestamp - 1)
            .await
            .unwrap();
        assert_eq!(version, -1);
    }

    #[tokio::test]
    async fn test_discard_log_round_trip() {
        let catalog = MemCatalog::new();
        let files = vec![
            DiscardedFile::new("/tmp/a", "/tmp", 100),
            DiscardedFile::new("/tmp/b", "/tmp", 200),
        ];
        catalog.record_discard(files).await.unwrap();

        let old = catalog.list_discarded(150).await.unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].path, "/tmp/a");

        catalog.delete_discarded(&["/tmp/a".to_string()]).await.unwrap();
        assert!(catalog.list_discarded(150).await.unwrap().is_empty());
        assert_eq!(catalog.list_discarded(i64::MAX).await.unwrap().len(), 1);
    }
}
