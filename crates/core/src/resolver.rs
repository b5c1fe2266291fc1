/*
 * File-set resolution.
 *
 * Walks a partition version's commit list and produces the ordered live file
 * set. The most recent CompactionCommit in the walk is the barrier: files
 * added before it were consumed by the compaction, and the compaction's own
 * adds become the base of each bucket. Within a bucket the output order is
 * the merge order the reader must honor: compacted base first, then deltas
 * in commit order.
 */

use std::collections::BTreeMap;
use std::collections::HashMap;

use tracing::debug;

use lakestate_catalog::{
    parse_bucket_id, CommitOp, DataCommitInfo, DataFileInfo, FileOp, FileRole, PartitionInfo,
    TableInfo,
};
use lakestate_common::{LakeStateError, Result};

/// Commit-timestamp bounds `(start, end]` for incremental and snapshot-at
/// reads. `None` on a side means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeBounds {
    pub start_ts: Option<i64>,
    pub end_ts: Option<i64>,
}

impl TimeBounds {
    pub fn upto(end_ts: i64) -> Self {
        Self {
            start_ts: None,
            end_ts: Some(end_ts),
        }
    }

    pub fn between(start_ts: i64, end_ts: i64) -> Self {
        Self {
            start_ts: Some(start_ts),
            end_ts: Some(end_ts),
        }
    }

    fn contains(&self, ts: i64) -> bool {
        self.start_ts.map(|s| ts > s).unwrap_or(true) && self.end_ts.map(|e| ts <= e).unwrap_or(true)
    }
}

struct LiveFile {
    role: FileRole,
    size: u64,
    modification_time: i64,
    file_exist_cols: String,
    /// Insertion sequence, to keep commit order stable within a bucket.
    seq: usize,
}

/// Resolves the visible file set of one partition version.
///
/// `commits` must contain every id in `partition.read_files`; order is taken
/// from the version, not from the slice.
pub fn resolve_files(
    table: &TableInfo,
    partition: &PartitionInfo,
    commits: &[DataCommitInfo],
    bounds: TimeBounds,
) -> Result<Vec<DataFileInfo>> {
    let by_id: HashMap<_, _> = commits.iter().map(|c| (c.commit_id, c)).collect();

    let mut ordered = Vec::with_capacity(partition.read_files.len());
    for id in &partition.read_files {
        let commit = by_id
            .get(id)
            .ok_or_else(|| LakeStateError::CommitNotFound(id.to_string()))?;
        if !commit.committed {
            return Err(LakeStateError::InvalidState(format!(
                "partition '{}' version {} references uncommitted {}",
                partition.partition_desc, partition.version, id
            )));
        }
        if bounds.contains(commit.timestamp) {
            ordered.push(*commit);
        }
    }

    // The barrier is the last in-range compaction; everything before it has
    // been consumed by that compaction's outputs.
    let barrier = ordered
        .iter()
        .rposition(|c| c.commit_op == CommitOp::Compaction)
        .unwrap_or(0);

    let mut live: BTreeMap<String, LiveFile> = BTreeMap::new();
    let mut seq = 0usize;
    for commit in &ordered[barrier..] {
        let role = if commit.commit_op == CommitOp::Compaction {
            FileRole::Compacted
        } else {
            FileRole::Add
        };
        for op in &commit.file_ops {
            match op.op {
                FileOp::Add => {
                    live.insert(
                        op.path.clone(),
                        LiveFile {
                            role,
                            size: op.size,
                            modification_time: commit.timestamp,
                            file_exist_cols: op.file_exist_cols.clone(),
                            seq,
                        },
                    );
                    seq += 1;
                }
                FileOp::Del => {
                    live.remove(&op.path);
                }
            }
        }
    }

    let mut sortable: Vec<(u32, bool, usize, DataFileInfo)> = live
        .into_iter()
        .map(|(path, f)| {
            let bucket_id = if table.is_hash_partitioned() {
                parse_bucket_id(&path).unwrap_or(0)
            } else {
                0
            };
            let info = DataFileInfo {
                path,
                partition_desc: partition.partition_desc.clone(),
                role: f.role,
                size: f.size,
                modification_time: f.modification_time,
                file_exist_cols: f.file_exist_cols,
                bucket_id,
            };
            (bucket_id, f.role != FileRole::Compacted, f.seq, info)
        })
        .collect();

    // Merge order: bucket, then compacted base, then deltas in commit order.
    sortable.sort_by_key(|(bucket, is_delta, seq, _)| (*bucket, *is_delta, *seq));
    let files: Vec<DataFileInfo> = sortable.into_iter().map(|(_, _, _, f)| f).collect();

    debug!(
        "resolved {} file(s) for partition '{}' v{}",
        files.len(),
        partition.partition_desc,
        partition.version
    );
    Ok(files)
}

/// Groups resolved files per bucket, preserving merge order.
pub fn group_by_bucket(files: &[DataFileInfo]) -> BTreeMap<u32, Vec<DataFileInfo>> {
    let mut buckets: BTreeMap<u32, Vec<DataFileInfo>> = BTreeMap::new();
    for f in files {
        buckets.entry(f.bucket_id).or_default().push(f.clone());
    }
    buckets
}
