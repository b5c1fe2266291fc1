/*
 * Error types for the table-state engine.
 */

use std::fmt;

use thiserror::Error;

/// The typed outcome of a commit the catalog refused.
///
/// Conflicts are not transport failures: the catalog answered, the answer was
/// "no". Only the commit engine decides whether a conflict is recoverable
/// (append rebasing) or must surface to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConflictKind {
    /// The writer's read version is no longer the partition head.
    StalePartition,
    /// A compaction barrier (or, for a compaction commit, any commit)
    /// landed on the partition after the writer's read.
    CompactionRaced,
    /// A delete-all tombstone landed on the partition after the writer's read.
    TombstoneRaced,
    /// The table schema changed between the writer's read and the commit.
    SchemaChanged,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictKind::StalePartition => "stale partition",
            ConflictKind::CompactionRaced => "compaction raced",
            ConflictKind::TombstoneRaced => "tombstone raced",
            ConflictKind::SchemaChanged => "schema changed",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum LakeStateError {
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("partition '{partition_desc}' not found in table {table_id}")]
    PartitionNotFound {
        table_id: String,
        partition_desc: String,
    },

    #[error("commit not found: {0}")]
    CommitNotFound(String),

    #[error("commit conflict ({kind}) on partition '{partition_desc}'")]
    Conflict {
        kind: ConflictKind,
        partition_desc: String,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("incompatible schema change: {0}")]
    SchemaIncompatible(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl LakeStateError {
    /// Shorthand for a typed commit conflict.
    pub fn conflict(kind: ConflictKind, partition_desc: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            partition_desc: partition_desc.into(),
        }
    }

    /// Whether the generic retry helper may re-run the failed operation.
    ///
    /// Conflicts are deliberately excluded: retrying a conflicted commit
    /// without rebasing would just re-submit the same stale envelope.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LakeStateError::CatalogUnavailable(_) | LakeStateError::Storage(_)
        )
    }

    /// The conflict kind, if this error is a commit conflict.
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            LakeStateError::Conflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LakeStateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LakeStateError::CatalogUnavailable("down".into()).is_retryable());
        assert!(LakeStateError::Storage("timeout".into()).is_retryable());
        assert!(!LakeStateError::TableNotFound("t".into()).is_retryable());
        assert!(!LakeStateError::conflict(ConflictKind::StalePartition, "d=1").is_retryable());
        assert!(!LakeStateError::InvalidState("bad".into()).is_retryable());
    }

    #[test]
    fn test_conflict_kind_accessor() {
        let err = LakeStateError::conflict(ConflictKind::CompactionRaced, "d=1");
        assert_eq!(err.conflict_kind(), Some(ConflictKind::CompactionRaced));
        assert_eq!(LakeStateError::Unexpected("x".into()).conflict_kind(), None);
    }
}
