/*
 * Catalog wire messages.
 *
 * Timestamps are milliseconds since epoch. UUIDs travel as two i64 halves.
 */

/// 128-bit identifier split into two signed halves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct Uuid {
    #[prost(int64, tag = "1")]
    pub high: i64,
    #[prost(int64, tag = "2")]
    pub low: i64,
}

impl From<::uuid::Uuid> for Uuid {
    fn from(id: ::uuid::Uuid) -> Self {
        let (high, low) = id.as_u64_pair();
        Self {
            high: high as i64,
            low: low as i64,
        }
    }
}

impl From<Uuid> for ::uuid::Uuid {
    fn from(id: Uuid) -> Self {
        ::uuid::Uuid::from_u64_pair(id.high as u64, id.low as u64)
    }
}

/// File-operation kind within a commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FileOp {
    Add = 0,
    Del = 1,
}

/// Commit operation kind on a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CommitOp {
    AppendCommit = 0,
    CompactionCommit = 1,
    UpdateCommit = 2,
    DeleteCommit = 3,
    MergeCommit = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableInfo {
    #[prost(message, optional, tag = "1")]
    pub table_id: Option<Uuid>,
    #[prost(string, tag = "2")]
    pub table_namespace: String,
    #[prost(string, optional, tag = "3")]
    pub table_name: Option<String>,
    #[prost(string, tag = "4")]
    pub table_path: String,
    /// Schema serialized as JSON.
    #[prost(string, tag = "5")]
    pub table_schema: String,
    #[prost(string, repeated, tag = "6")]
    pub range_partitions: Vec<String>,
    #[prost(string, repeated, tag = "7")]
    pub hash_partitions: Vec<String>,
    #[prost(int32, tag = "8")]
    pub hash_bucket_num: i32,
    #[prost(map = "string, string", tag = "9")]
    pub properties: std::collections::HashMap<String, String>,
    #[prost(string, optional, tag = "10")]
    pub cdc_column: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionInfo {
    #[prost(message, optional, tag = "1")]
    pub table_id: Option<Uuid>,
    #[prost(string, tag = "2")]
    pub partition_desc: String,
    #[prost(int64, tag = "3")]
    pub version: i64,
    /// Commits this version incorporates, in merge order.
    #[prost(message, repeated, tag = "4")]
    pub read_files: Vec<Uuid>,
    #[prost(enumeration = "CommitOp", tag = "5")]
    pub commit_op: i32,
    #[prost(string, optional, tag = "6")]
    pub expression: Option<String>,
    #[prost(int64, tag = "7")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataFileOp {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(enumeration = "FileOp", tag = "2")]
    pub file_op: i32,
    #[prost(int64, tag = "3")]
    pub size: i64,
    /// Comma-separated column list present in the file.
    #[prost(string, tag = "4")]
    pub file_exist_cols: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataCommitInfo {
    #[prost(message, optional, tag = "1")]
    pub commit_id: Option<Uuid>,
    #[prost(message, optional, tag = "2")]
    pub table_id: Option<Uuid>,
    #[prost(string, tag = "3")]
    pub partition_desc: String,
    #[prost(enumeration = "CommitOp", tag = "4")]
    pub commit_op: i32,
    #[prost(message, repeated, tag = "5")]
    pub file_ops: Vec<DataFileOp>,
    #[prost(int64, tag = "6")]
    pub timestamp: i64,
    #[prost(bool, tag = "7")]
    pub committed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_uuid_round_trip() {
        let id = ::uuid::Uuid::from_u128(0x0123_4567_89ab_cdef_fedc_ba98_7654_3210);
        let wire: Uuid = id.into();
        let back: ::uuid::Uuid = wire.into();
        assert_eq!(id, back);
    }

    #[test]
    fn test_partition_info_encode_decode() {
        let info = PartitionInfo {
            table_id: Some(::uuid::Uuid::nil().into()),
            partition_desc: "region=us,dt=2024-01-01".to_string(),
            version: 3,
            read_files: vec![::uuid::Uuid::nil().into()],
            commit_op: CommitOp::CompactionCommit as i32,
            expression: None,
            timestamp: 1_700_000_000_000,
        };

        let bytes = info.encode_to_vec();
        let decoded = PartitionInfo::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, info);
        assert_eq!(decoded.commit_op(), CommitOp::CompactionCommit);
    }

    #[test]
    fn test_unknown_enum_value_defaults() {
        let op = DataFileOp {
            path: "part-x-bucket0.parquet".to_string(),
            file_op: 99,
            size: 10,
            file_exist_cols: String::new(),
        };
        assert_eq!(op.file_op(), FileOp::Add);
    }
}
