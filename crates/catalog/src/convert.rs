/*
 * Conversions between the domain model and the wire entities.
 */

use lakestate_common::{LakeStateError, Result};
use lakestate_proto as pb;

use crate::model::{
    CommitOp, DataCommitInfo, DataFileOp, FileOp, PartitionDesc, PartitionInfo, TableInfo,
    TableSchema,
};

impl From<CommitOp> for pb::CommitOp {
    fn from(op: CommitOp) -> Self {
        match op {
            CommitOp::Append => pb::CommitOp::AppendCommit,
            CommitOp::Compaction => pb::CommitOp::CompactionCommit,
            CommitOp::Update => pb::CommitOp::UpdateCommit,
            CommitOp::Delete => pb::CommitOp::DeleteCommit,
            CommitOp::Merge => pb::CommitOp::MergeCommit,
        }
    }
}

impl From<pb::CommitOp> for CommitOp {
    fn from(op: pb::CommitOp) -> Self {
        match op {
            pb::CommitOp::AppendCommit => CommitOp::Append,
            pb::CommitOp::CompactionCommit => CommitOp::Compaction,
            pb::CommitOp::UpdateCommit => CommitOp::Update,
            pb::CommitOp::DeleteCommit => CommitOp::Delete,
            pb::CommitOp::MergeCommit => CommitOp::Merge,
        }
    }
}

impl From<FileOp> for pb::FileOp {
    fn from(op: FileOp) -> Self {
        match op {
            FileOp::Add => pb::FileOp::Add,
            FileOp::Del => pb::FileOp::Del,
        }
    }
}

impl From<pb::FileOp> for FileOp {
    fn from(op: pb::FileOp) -> Self {
        match op {
            pb::FileOp::Add => FileOp::Add,
            pb::FileOp::Del => FileOp::Del,
        }
    }
}

impl From<&DataFileOp> for pb::DataFileOp {
    fn from(op: &DataFileOp) -> Self {
        pb::DataFileOp {
            path: op.path.clone(),
            file_op: pb::FileOp::from(op.op) as i32,
            size: op.size as i64,
            file_exist_cols: op.file_exist_cols.clone(),
        }
    }
}

impl From<&pb::DataFileOp> for DataFileOp {
    fn from(op: &pb::DataFileOp) -> Self {
        DataFileOp {
            path: op.path.clone(),
            op: op.file_op().into(),
            size: op.size.max(0) as u64,
            file_exist_cols: op.file_exist_cols.clone(),
        }
    }
}

impl From<&DataCommitInfo> for pb::DataCommitInfo {
    fn from(commit: &DataCommitInfo) -> Self {
        pb::DataCommitInfo {
            commit_id: Some(commit.commit_id.into()),
            table_id: Some(commit.table_id.into()),
            partition_desc: commit.partition_desc.as_str().to_string(),
            commit_op: pb::CommitOp::from(commit.commit_op) as i32,
            file_ops: commit.file_ops.iter().map(Into::into).collect(),
            timestamp: commit.timestamp,
            committed: commit.committed,
        }
    }
}

impl TryFrom<&pb::DataCommitInfo> for DataCommitInfo {
    type Error = LakeStateError;

    fn try_from(commit: &pb::DataCommitInfo) -> Result<Self> {
        Ok(DataCommitInfo {
            commit_id: required_uuid(commit.commit_id, "DataCommitInfo.commit_id")?,
            table_id: required_uuid(commit.table_id, "DataCommitInfo.table_id")?,
            partition_desc: PartitionDesc::from(commit.partition_desc.as_str()),
            commit_op: commit.commit_op().into(),
            file_ops: commit.file_ops.iter().map(Into::into).collect(),
            timestamp: commit.timestamp,
            committed: commit.committed,
        })
    }
}

impl From<&PartitionInfo> for pb::PartitionInfo {
    fn from(info: &PartitionInfo) -> Self {
        pb::PartitionInfo {
            table_id: Some(info.table_id.into()),
            partition_desc: info.partition_desc.as_str().to_string(),
            version: info.version,
            read_files: info.read_files.iter().map(|id| (*id).into()).collect(),
            commit_op: pb::CommitOp::from(info.commit_op) as i32,
            expression: info.expression.clone(),
            timestamp: info.timestamp,
        }
    }
}

impl TryFrom<&pb::PartitionInfo> for PartitionInfo {
    type Error = LakeStateError;

    fn try_from(info: &pb::PartitionInfo) -> Result<Self> {
        Ok(PartitionInfo {
            table_id: required_uuid(info.table_id, "PartitionInfo.table_id")?,
            partition_desc: PartitionDesc::from(info.partition_desc.as_str()),
            version: info.version,
            read_files: info.read_files.iter().map(|id| (*id).into()).collect(),
            commit_op: info.commit_op().into(),
            expression: info.expression.clone(),
            timestamp: info.timestamp,
        })
    }
}

impl TryFrom<&TableInfo> for pb::TableInfo {
    type Error = LakeStateError;

    fn try_from(info: &TableInfo) -> Result<Self> {
        Ok(pb::TableInfo {
            table_id: Some(info.table_id.into()),
            table_namespace: info.namespace.clone(),
            table_name: info.table_name.clone(),
            table_path: info.table_path.clone(),
            table_schema: serde_json::to_string(&info.schema)
                .map_err(|e| LakeStateError::Serialization(e.to_string()))?,
            range_partitions: info.range_partitions.clone(),
            hash_partitions: info.hash_partitions.clone(),
            hash_bucket_num: info.hash_bucket_num as i32,
            properties: info.properties.clone(),
            cdc_column: info.cdc_column.clone(),
        })
    }
}

impl TryFrom<&pb::TableInfo> for TableInfo {
    type Error = LakeStateError;

    fn try_from(info: &pb::TableInfo) -> Result<Self> {
        let schema: TableSchema = serde_json::from_str(&info.table_schema)
            .map_err(|e| LakeStateError::Serialization(e.to_string()))?;
        Ok(TableInfo {
            table_id: required_uuid(info.table_id, "TableInfo.table_id")?,
            namespace: info.table_namespace.clone(),
            table_name: info.table_name.clone(),
            table_path: info.table_path.clone(),
            schema,
            range_partitions: info.range_partitions.clone(),
            hash_partitions: info.hash_partitions.clone(),
            hash_bucket_num: info.hash_bucket_num.max(0) as usize,
            properties: info.properties.clone(),
            cdc_column: info.cdc_column.clone(),
        })
    }
}

fn required_uuid(id: Option<pb::Uuid>, field: &str) -> Result<uuid::Uuid> {
    id.map(Into::into)
        .ok_or_else(|| LakeStateError::Serialization(format!("missing {field}")))
}
