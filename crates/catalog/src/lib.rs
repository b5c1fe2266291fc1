/*
 * LakeState - Catalog
 *
 * The domain model for tables, partition version chains, and commits; the
 * abstract catalog operation set; and an embedded in-memory catalog that
 * implements the commit transaction with conflict detection.
 */

pub mod client;
pub mod convert;
pub mod deadline;
pub mod mem;
pub mod model;

pub use client::{CatalogClient, CatalogClientRef, CommitEnvelope, CommitOutcome};
pub use deadline::DeadlineCatalog;
pub use mem::{MemCatalog, PROP_HASH_BUCKET_NUM};
pub use model::{
    compacted_file_name, current_timestamp_ms, data_file_name, data_file_path, parse_bucket_id,
    CommitId, CommitOp, DataCommitInfo, DataFileInfo, DataFileOp, DiscardedFile, FileOp, FileRole,
    PartitionDesc, PartitionInfo, SchemaField, TableId, TableInfo, TableSchema, DISCARD_FILE_LIST,
};
