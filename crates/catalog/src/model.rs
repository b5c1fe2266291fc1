/*
 * Domain model: tables, partitions, commits, and file records.
 *
 * The catalog owns the authoritative version chain; everything here is a
 * value type that crosses the client boundary.
 */

use std::collections::HashMap;
use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

use lakestate_common::{LakeStateError, Result};

pub type TableId = uuid::Uuid;
pub type CommitId = uuid::Uuid;

/// Partition descriptor under which compaction inputs and other superseded
/// files are recorded for async deletion.
pub const DISCARD_FILE_LIST: &str = "DISCARD_FILE_LIST";

/// Current wall-clock time in milliseconds since epoch.
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Characters that must not appear raw inside a descriptor value.
const DESC_VALUE_ESCAPE: &AsciiSet = &CONTROLS.add(b',').add(b'=').add(b'%');
// Characters escaped when a descriptor becomes a path segment.
const DESC_PATH_ESCAPE: &AsciiSet = &CONTROLS.add(b'/').add(b'%').add(b' ').add(b'#').add(b'?');

/// Canonical partition descriptor: `col1=v1,col2=v2` in declared range-column
/// order. The empty string is the unpartitioned singleton.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionDesc(String);

impl PartitionDesc {
    pub fn unpartitioned() -> Self {
        Self(String::new())
    }

    /// Builds a descriptor from `(column, value)` pairs already in declared
    /// range-column order. `,` and `=` inside values are percent-escaped.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let desc = pairs
            .into_iter()
            .map(|(col, value)| {
                format!("{col}={}", utf8_percent_encode(value, DESC_VALUE_ESCAPE))
            })
            .collect::<Vec<_>>()
            .join(",");
        Self(desc)
    }

    /// Parses back into ordered `(column, value)` pairs.
    pub fn parse(&self) -> Result<Vec<(String, String)>> {
        if self.0.is_empty() {
            return Ok(Vec::new());
        }
        self.0
            .split(',')
            .map(|segment| {
                let (col, value) = segment.split_once('=').ok_or_else(|| {
                    LakeStateError::InvalidState(format!(
                        "malformed partition descriptor segment '{segment}'"
                    ))
                })?;
                let value = percent_decode_str(value)
                    .decode_utf8()
                    .map_err(|e| {
                        LakeStateError::InvalidState(format!(
                            "partition descriptor value is not UTF-8: {e}"
                        ))
                    })?
                    .into_owned();
                Ok((col.to_string(), value))
            })
            .collect()
    }

    /// Column -> value map for predicate evaluation.
    pub fn values(&self) -> Result<HashMap<String, String>> {
        Ok(self.parse()?.into_iter().collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unpartitioned(&self) -> bool {
        self.0.is_empty()
    }

    /// The descriptor as a single URL-encoded path segment. Empty for the
    /// unpartitioned singleton, so files sit directly under the table path.
    pub fn path_segment(&self) -> String {
        utf8_percent_encode(&self.0, DESC_PATH_ESCAPE).to_string()
    }
}

impl From<String> for PartitionDesc {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PartitionDesc {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for PartitionDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Commit operation kind on a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitOp {
    Append,
    Compaction,
    Update,
    Delete,
    Merge,
}

impl fmt::Display for CommitOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommitOp::Append => "AppendCommit",
            CommitOp::Compaction => "CompactionCommit",
            CommitOp::Update => "UpdateCommit",
            CommitOp::Delete => "DeleteCommit",
            CommitOp::Merge => "MergeCommit",
        };
        f.write_str(s)
    }
}

/// One field of a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
        }
    }
}

/// Ordered field list. Partition columns must be present.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub fields: Vec<SchemaField>,
}

impl TableSchema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Additive merge: existing fields must keep their type, new fields are
    /// appended. Anything else is an incompatible change.
    pub fn merge_additive(&self, incoming: &TableSchema) -> Result<TableSchema> {
        let mut merged = self.clone();
        for field in &incoming.fields {
            match self.fields.iter().find(|f| f.name == field.name) {
                Some(existing) if existing.data_type != field.data_type => {
                    return Err(LakeStateError::SchemaIncompatible(format!(
                        "field '{}' changes type from {} to {}",
                        field.name, existing.data_type, field.data_type
                    )));
                }
                Some(_) => {}
                None => merged.fields.push(field.clone()),
            }
        }
        Ok(merged)
    }
}

/// Table metadata as held by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table_id: TableId,
    pub namespace: String,
    pub table_name: Option<String>,
    pub table_path: String,
    pub schema: TableSchema,
    /// Range partition columns, in declared order.
    pub range_partitions: Vec<String>,
    /// Hash partition columns, in declared order. Empty = unhashed.
    pub hash_partitions: Vec<String>,
    pub hash_bucket_num: usize,
    pub properties: HashMap<String, String>,
    pub cdc_column: Option<String>,
}

impl TableInfo {
    /// Checks the structural invariants of table metadata.
    pub fn validate(&self) -> Result<()> {
        if self.hash_bucket_num < 1 {
            return Err(LakeStateError::InvalidState(format!(
                "table {}: hash_bucket_num must be >= 1",
                self.table_id
            )));
        }
        for col in self.range_partitions.iter().chain(&self.hash_partitions) {
            if !self.schema.contains(col) {
                return Err(LakeStateError::InvalidState(format!(
                    "table {}: partition column '{col}' missing from schema",
                    self.table_id
                )));
            }
        }
        Ok(())
    }

    pub fn is_range_partitioned(&self) -> bool {
        !self.range_partitions.is_empty()
    }

    pub fn is_hash_partitioned(&self) -> bool {
        !self.hash_partitions.is_empty()
    }
}

/// File-operation kind within a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileOp {
    Add,
    Del,
}

/// One file addition or tombstone inside a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFileOp {
    /// Absolute URI.
    pub path: String,
    pub op: FileOp,
    pub size: u64,
    /// Comma-separated columns present in the file, for schema evolution.
    pub file_exist_cols: String,
}

impl DataFileOp {
    pub fn add(path: impl Into<String>, size: u64, file_exist_cols: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: FileOp::Add,
            size,
            file_exist_cols: file_exist_cols.into(),
        }
    }

    pub fn del(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: FileOp::Del,
            size: 0,
            file_exist_cols: String::new(),
        }
    }
}

/// An atomic set of file operations scoped to one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataCommitInfo {
    pub commit_id: CommitId,
    pub table_id: TableId,
    pub partition_desc: PartitionDesc,
    pub commit_op: CommitOp,
    pub file_ops: Vec<DataFileOp>,
    pub timestamp: i64,
    /// Flipped to true atomically with the PartitionInfo append.
    pub committed: bool,
}

/// The immutable head of a partition at one point in its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub table_id: TableId,
    pub partition_desc: PartitionDesc,
    /// Monotonic, gap-free, starting at 0.
    pub version: i64,
    /// Commits this version incorporates, in read-time merge order.
    pub read_files: Vec<CommitId>,
    pub commit_op: CommitOp,
    pub expression: Option<String>,
    pub timestamp: i64,
}

/// Role of a resolved file in the merge-on-read plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileRole {
    /// Delta file, overlaid in commit order.
    Add,
    /// Compacted base, read first within its bucket.
    Compacted,
}

/// Resolver output: one live data file with its merge position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFileInfo {
    pub path: String,
    pub partition_desc: PartitionDesc,
    pub role: FileRole,
    pub size: u64,
    pub modification_time: i64,
    pub file_exist_cols: String,
    /// Derived from the filename; 0 for unhashed tables.
    pub bucket_id: u32,
}

/// A logically superseded file awaiting physical deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscardedFile {
    pub path: String,
    pub table_path: String,
    pub partition_desc: String,
    pub timestamp: i64,
}

impl DiscardedFile {
    pub fn new(path: impl Into<String>, table_path: impl Into<String>, timestamp: i64) -> Self {
        Self {
            path: path.into(),
            table_path: table_path.into(),
            partition_desc: DISCARD_FILE_LIST.to_string(),
            timestamp,
        }
    }
}

/// `part-<commit_id>-bucket<id>.parquet`
pub fn data_file_name(commit_id: &CommitId, bucket_id: u32) -> String {
    format!("part-{commit_id}-bucket{bucket_id}.parquet")
}

/// `compact-<commit_id>-bucket<id>.parquet`
pub fn compacted_file_name(commit_id: &CommitId, bucket_id: u32) -> String {
    format!("compact-{commit_id}-bucket{bucket_id}.parquet")
}

/// Joins table path, descriptor segment, and file name into an absolute URI.
pub fn data_file_path(table_path: &str, desc: &PartitionDesc, file_name: &str) -> String {
    let base = table_path.trim_end_matches('/');
    if desc.is_unpartitioned() {
        format!("{base}/{file_name}")
    } else {
        format!("{base}/{}/{file_name}", desc.path_segment())
    }
}

/// Extracts the bucket id from a data-file name, per the
/// `...-bucket<id>.parquet` convention.
pub fn parse_bucket_id(path: &str) -> Option<u32> {
    let name = path.rsplit('/').next()?;
    let idx = name.rfind("-bucket")?;
    let digits = &name[idx + "-bucket".len()..];
    let digits = digits.strip_suffix(".parquet").unwrap_or(digits);
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_round_trip() {
        let desc = PartitionDesc::from_pairs([("region", "us"), ("dt", "2024-01-01")]);
        assert_eq!(desc.as_str(), "region=us,dt=2024-01-01");

        let pairs = desc.parse().unwrap();
        assert_eq!(
            pairs,
            vec![
                ("region".to_string(), "us".to_string()),
                ("dt".to_string(), "2024-01-01".to_string())
            ]
        );
    }

    #[test]
    fn test_desc_escaping() {
        let desc = PartitionDesc::from_pairs([("k", "a,b=c")]);
        assert_eq!(desc.as_str(), "k=a%2Cb%3Dc");
        assert_eq!(desc.parse().unwrap(), vec![("k".to_string(), "a,b=c".to_string())]);
    }

    #[test]
    fn test_unpartitioned_singleton() {
        let desc = PartitionDesc::unpartitioned();
        assert!(desc.is_unpartitioned());
        assert!(desc.parse().unwrap().is_empty());
        assert_eq!(
            data_file_path("s3://b/t", &desc, "part-x-bucket0.parquet"),
            "s3://b/t/part-x-bucket0.parquet"
        );
    }

    #[test]
    fn test_bucket_id_parsing() {
        let id = uuid::Uuid::nil();
        let name = data_file_name(&id, 7);
        assert_eq!(parse_bucket_id(&name), Some(7));

        let name = compacted_file_name(&id, 12);
        assert_eq!(parse_bucket_id(&format!("s3://b/t/d=1/{name}")), Some(12));

        assert_eq!(parse_bucket_id("s3://b/t/whatever.parquet"), None);
    }

    #[test]
    fn test_schema_merge_additive() {
        let base = TableSchema::new(vec![
            SchemaField::new("k", "string", false),
            SchemaField::new("v", "bigint", true),
        ]);
        let incoming = TableSchema::new(vec![
            SchemaField::new("k", "string", false),
            SchemaField::new("extra", "double", true),
        ]);

        let merged = base.merge_additive(&incoming).unwrap();
        assert_eq!(merged.field_names(), vec!["k", "v", "extra"]);
    }

    #[test]
    fn test_schema_merge_rejects_type_change() {
        let base = TableSchema::new(vec![SchemaField::new("k", "string", false)]);
        let incoming = TableSchema::new(vec![SchemaField::new("k", "bigint", false)]);
        assert!(matches!(
            base.merge_additive(&incoming),
            Err(LakeStateError::SchemaIncompatible(_))
        ));
    }

    #[test]
    fn test_table_validate() {
        let mut info = TableInfo {
            table_id: uuid::Uuid::nil(),
            namespace: "default".to_string(),
            table_name: Some("events".to_string()),
            table_path: "/tmp/events".to_string(),
            schema: TableSchema::new(vec![SchemaField::new("dt", "string", false)]),
            range_partitions: vec!["dt".to_string()],
            hash_partitions: vec![],
            hash_bucket_num: 1,
            properties: HashMap::new(),
            cdc_column: None,
        };
        assert!(info.validate().is_ok());

        info.range_partitions.push("missing".to_string());
        assert!(info.validate().is_err());
    }
}
