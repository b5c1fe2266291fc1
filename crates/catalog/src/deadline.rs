/*
 * Deadline enforcement for catalog calls.
 *
 * Wraps any CatalogClient and fails each round-trip that outlives the
 * configured deadline with CatalogUnavailable. A commit that times out is
 * indeterminate: the caller must re-read partition state before deciding
 * whether it landed.
 */

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use lakestate_common::{LakeStateError, Result};

use crate::client::{CatalogClient, CatalogClientRef, CommitEnvelope, CommitOutcome};
use crate::model::{
    CommitId, DataCommitInfo, DiscardedFile, PartitionDesc, PartitionInfo, TableId, TableInfo,
    TableSchema,
};

pub struct DeadlineCatalog {
    inner: CatalogClientRef,
    deadline: Duration,
}

impl DeadlineCatalog {
    pub fn new(inner: CatalogClientRef, deadline: Duration) -> Self {
        Self { inner, deadline }
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(LakeStateError::CatalogUnavailable(format!(
                "{op} exceeded deadline of {:?}",
                self.deadline
            ))),
        }
    }
}

#[async_trait]
impl CatalogClient for DeadlineCatalog {
    async fn create_table(&self, info: TableInfo) -> Result<()> {
        self.bounded("create_table", self.inner.create_table(info)).await
    }

    async fn get_table_info_by_id(&self, table_id: &TableId) -> Result<TableInfo> {
        self.bounded("get_table_info", self.inner.get_table_info_by_id(table_id))
            .await
    }

    async fn get_table_info_by_path(&self, path: &str) -> Result<TableInfo> {
        self.bounded("get_table_info", self.inner.get_table_info_by_path(path))
            .await
    }

    async fn list_partitions(&self, table_id: &TableId) -> Result<Vec<PartitionInfo>> {
        self.bounded("list_partitions", self.inner.list_partitions(table_id))
            .await
    }

    async fn get_single_partition(
        &self,
        table_id: &TableId,
        desc: &PartitionDesc,
        version: i64,
    ) -> Result<Option<PartitionInfo>> {
        self.bounded(
            "get_single_partition",
            self.inner.get_single_partition(table_id, desc, version),
        )
        .await
    }

    async fn get_partitions_by_eq(
        &self,
        table_id: &TableId,
        query: &[(String, String)],
    ) -> Result<Vec<PartitionInfo>> {
        self.bounded(
            "get_partitions_by_eq",
            self.inner.get_partitions_by_eq(table_id, query),
        )
        .await
    }

    async fn version_upto_ts(
        &self,
        table_id: &TableId,
        desc: &PartitionDesc,
        ts: i64,
    ) -> Result<i64> {
        self.bounded("version_upto_ts", self.inner.version_upto_ts(table_id, desc, ts))
            .await
    }

    async fn get_commits(
        &self,
        table_id: &TableId,
        commit_ids: &[CommitId],
    ) -> Result<Vec<DataCommitInfo>> {
        self.bounded("get_commits", self.inner.get_commits(table_id, commit_ids))
            .await
    }

    async fn commit(&self, envelope: CommitEnvelope) -> Result<CommitOutcome> {
        self.bounded("commit", self.inner.commit(envelope)).await
    }

    async fn update_properties(
        &self,
        table_id: &TableId,
        props: HashMap<String, String>,
    ) -> Result<()> {
        self.bounded(
            "update_properties",
            self.inner.update_properties(table_id, props),
        )
        .await
    }

    async fn update_schema(&self, table_id: &TableId, schema: TableSchema) -> Result<()> {
        self.bounded("update_schema", self.inner.update_schema(table_id, schema))
            .await
    }

    async fn record_discard(&self, files: Vec<DiscardedFile>) -> Result<()> {
        self.bounded("record_discard", self.inner.record_discard(files))
            .await
    }

    async fn list_discarded(&self, older_than_ts: i64) -> Result<Vec<DiscardedFile>> {
        self.bounded("list_discarded", self.inner.list_discarded(older_than_ts))
            .await
    }

    async fn delete_discarded(&self, paths: &[String]) -> Result<()> {
        self.bounded("delete_discarded", self.inner.delete_discarded(paths))
            .await
    }
}
