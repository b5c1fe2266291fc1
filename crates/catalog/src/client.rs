/*
 * The abstract catalog operation set.
 *
 * Every method is a single catalog round-trip. Implementations decide the
 * transport; the in-memory catalog in this crate is the embedded reference.
 * Authorization, when deployed, is enforced behind these calls.
 */

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use lakestate_common::{ConflictKind, Result};

use crate::model::{
    CommitId, CommitOp, DataCommitInfo, DiscardedFile, PartitionDesc, PartitionInfo, TableId,
    TableInfo, TableSchema,
};

/// A multi-partition commit payload submitted to the catalog as one atomic
/// transaction.
#[derive(Debug, Clone)]
pub struct CommitEnvelope {
    /// The writer's view of table metadata at the time it staged the commit.
    pub table_info: TableInfo,
    pub commit_type: CommitOp,
    /// Commit bodies, created `committed=false`; the catalog flips them.
    pub data_commits: Vec<DataCommitInfo>,
    /// One new head per touched partition. `version` and `timestamp` are
    /// assigned catalog-side; `read_files` is the writer's proposed merge
    /// order.
    pub new_partitions: Vec<PartitionInfo>,
    /// The partition versions the writer based its computation on.
    pub read_partitions: Vec<PartitionInfo>,
}

impl CommitEnvelope {
    /// The read version for a descriptor, -1 when the writer saw no
    /// partition head at all.
    pub fn read_version(&self, desc: &PartitionDesc) -> i64 {
        self.read_partitions
            .iter()
            .find(|p| &p.partition_desc == desc)
            .map(|p| p.version)
            .unwrap_or(-1)
    }
}

/// Catalog answer to a commit submission.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// All partitions linked; returns the new heads in envelope order.
    Committed { partitions: Vec<PartitionInfo> },
    /// Refused. `current` carries the partition head the catalog holds now,
    /// so an append can rebase without another round-trip.
    Conflict {
        kind: ConflictKind,
        partition_desc: PartitionDesc,
        current: Option<PartitionInfo>,
    },
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed { .. })
    }
}

/// Catalog operations. Each method is one catalog round-trip.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Registers a new table. The id and path must both be unused.
    async fn create_table(&self, info: TableInfo) -> Result<()>;

    async fn get_table_info_by_id(&self, table_id: &TableId) -> Result<TableInfo>;

    async fn get_table_info_by_path(&self, path: &str) -> Result<TableInfo>;

    /// Latest head of every partition of the table, tombstones included.
    async fn list_partitions(&self, table_id: &TableId) -> Result<Vec<PartitionInfo>>;

    /// A specific version of one partition; `version <= 0` means latest.
    async fn get_single_partition(
        &self,
        table_id: &TableId,
        desc: &PartitionDesc,
        version: i64,
    ) -> Result<Option<PartitionInfo>>;

    /// Latest heads whose descriptor satisfies every `column = value` pair.
    async fn get_partitions_by_eq(
        &self,
        table_id: &TableId,
        query: &[(String, String)],
    ) -> Result<Vec<PartitionInfo>>;

    /// Greatest version of the partition with timestamp <= `ts`, or -1.
    async fn version_upto_ts(
        &self,
        table_id: &TableId,
        desc: &PartitionDesc,
        ts: i64,
    ) -> Result<i64>;

    /// Batched commit lookup. Every id must resolve.
    async fn get_commits(
        &self,
        table_id: &TableId,
        commit_ids: &[CommitId],
    ) -> Result<Vec<DataCommitInfo>>;

    /// Atomic multi-partition commit with conflict detection.
    async fn commit(&self, envelope: CommitEnvelope) -> Result<CommitOutcome>;

    /// Merges the given keys into the table's properties.
    async fn update_properties(
        &self,
        table_id: &TableId,
        props: HashMap<String, String>,
    ) -> Result<()>;

    /// Replaces the table schema (additive evolution has already been
    /// validated by the caller).
    async fn update_schema(&self, table_id: &TableId, schema: TableSchema) -> Result<()>;

    /// Appends to the discard log. Best-effort from callers' perspective.
    async fn record_discard(&self, files: Vec<DiscardedFile>) -> Result<()>;

    /// Discard-log entries recorded at or before `older_than_ts`.
    async fn list_discarded(&self, older_than_ts: i64) -> Result<Vec<DiscardedFile>>;

    /// Acknowledges physical deletion of discard-log entries.
    async fn delete_discarded(&self, paths: &[String]) -> Result<()>;
}

pub type CatalogClientRef = Arc<dyn CatalogClient>;
