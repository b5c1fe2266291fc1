/*
 * Configuration for the table-state engine.
 *
 * Every recognized option can come from a table or session properties map
 * (string -> string); unknown keys are ignored so table properties may carry
 * engine-private entries alongside ours.
 */

use std::collections::HashMap;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::{LakeStateError, Result};

/// Recognized property keys.
pub mod keys {
    pub const SCHEMA_AUTO_MERGE: &str = "schema.autoMerge.enabled";
    pub const NATIVE_IO_ENABLE: &str = "native.io.enable";
    pub const COMPACTION_LEVEL1_FILE_NUMBER_LIMIT: &str = "compaction.level1.file.number.limit";
    pub const COMPACTION_LEVEL1_MERGE_SIZE_LIMIT: &str = "compaction.level1.merge.size.limit";
    pub const COMPACTION_LEVEL1_MERGE_NUM_LIMIT: &str = "compaction.level1.merge.num.limit";
    pub const COMPACTION_LEVEL_MAX_FILE_SIZE: &str = "compaction.level.max.file.size";
    pub const COMPACT_RENAME: &str = "lakesoul.compact.rename";
    pub const ONLY_SAVE_ONCE_COMPACTION: &str = "only_save_once_compaction";
    pub const SCAN_FILE_NUMBER_LIMIT: &str = "scan.file.number.limit";
    pub const SNAPSHOT_CACHE_EXPIRE_SECONDS: &str = "snapshot.cache.expire.seconds";
    pub const PARTITION_TTL_DAYS: &str = "partition.ttl.days";
    pub const COMPACTION_TTL_DAYS: &str = "compaction.ttl.days";
}

/// Read-path configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[builder(setter(into), default)]
pub struct ScanConfig {
    /// Cap on files per scan group for progressive reads (None = unbounded).
    pub file_number_limit: Option<usize>,

    /// Use the native columnar IO path.
    pub native_io_enable: bool,

    /// How long a cached snapshot stays valid without refresh.
    pub snapshot_cache_expire: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            file_number_limit: None,
            native_io_enable: true,
            snapshot_cache_expire: Duration::from_secs(1),
        }
    }
}

/// Compaction planning and execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[builder(setter(into), default)]
pub struct CompactionConfig {
    /// A bucket becomes a candidate at this many files.
    pub level1_file_number_limit: usize,

    /// A bucket becomes a candidate at this many total bytes.
    pub level1_merge_size_limit: u64,

    /// Maximum bucket merges in flight per compaction pass.
    pub level1_merge_num_limit: usize,

    /// Maximum bytes per compacted output file.
    pub max_file_size: u64,

    /// Name compaction outputs like ordinary part files.
    pub rename_compacted: bool,

    /// Refuse to re-compact a bucket that is already a bare compacted base.
    pub only_save_once: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            level1_file_number_limit: 20,
            level1_merge_size_limit: 1024 * 1024 * 1024, // 1GiB
            level1_merge_num_limit: 5,
            max_file_size: 5 * 1024 * 1024 * 1024, // 5GiB
            rename_compacted: false,
            only_save_once: false,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Builder)]
#[builder(setter(into), default)]
pub struct TableStoreConfig {
    /// Allow additive schema merges on append.
    pub schema_auto_merge: bool,

    pub scan: ScanConfig,

    pub compaction: CompactionConfig,

    /// Partitions older than this are tombstoned by the TTL sweep.
    pub partition_ttl_days: Option<u32>,

    /// Pre-barrier files older than this are eligible for physical deletion.
    pub compaction_ttl_days: Option<u32>,
}

impl TableStoreConfig {
    /// Builds a config from a properties map, starting from defaults.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        config.apply_properties(props)?;
        Ok(config)
    }

    /// Overlays recognized keys from a properties map onto this config.
    pub fn apply_properties(&mut self, props: &HashMap<String, String>) -> Result<()> {
        if let Some(v) = props.get(keys::SCHEMA_AUTO_MERGE) {
            self.schema_auto_merge = parse_bool(keys::SCHEMA_AUTO_MERGE, v)?;
        }
        if let Some(v) = props.get(keys::NATIVE_IO_ENABLE) {
            self.scan.native_io_enable = parse_bool(keys::NATIVE_IO_ENABLE, v)?;
        }
        if let Some(v) = props.get(keys::SCAN_FILE_NUMBER_LIMIT) {
            self.scan.file_number_limit =
                Some(parse_int(keys::SCAN_FILE_NUMBER_LIMIT, v)? as usize);
        }
        if let Some(v) = props.get(keys::SNAPSHOT_CACHE_EXPIRE_SECONDS) {
            self.scan.snapshot_cache_expire =
                Duration::from_secs(parse_int(keys::SNAPSHOT_CACHE_EXPIRE_SECONDS, v)?);
        }
        if let Some(v) = props.get(keys::COMPACTION_LEVEL1_FILE_NUMBER_LIMIT) {
            self.compaction.level1_file_number_limit =
                parse_int(keys::COMPACTION_LEVEL1_FILE_NUMBER_LIMIT, v)? as usize;
        }
        if let Some(v) = props.get(keys::COMPACTION_LEVEL1_MERGE_SIZE_LIMIT) {
            self.compaction.level1_merge_size_limit =
                parse_size(keys::COMPACTION_LEVEL1_MERGE_SIZE_LIMIT, v)?;
        }
        if let Some(v) = props.get(keys::COMPACTION_LEVEL1_MERGE_NUM_LIMIT) {
            self.compaction.level1_merge_num_limit =
                parse_int(keys::COMPACTION_LEVEL1_MERGE_NUM_LIMIT, v)? as usize;
        }
        if let Some(v) = props.get(keys::COMPACTION_LEVEL_MAX_FILE_SIZE) {
            self.compaction.max_file_size = parse_size(keys::COMPACTION_LEVEL_MAX_FILE_SIZE, v)?;
        }
        if let Some(v) = props.get(keys::COMPACT_RENAME) {
            self.compaction.rename_compacted = parse_bool(keys::COMPACT_RENAME, v)?;
        }
        if let Some(v) = props.get(keys::ONLY_SAVE_ONCE_COMPACTION) {
            self.compaction.only_save_once = parse_bool(keys::ONLY_SAVE_ONCE_COMPACTION, v)?;
        }
        // An empty TTL value is an explicit clear.
        if let Some(v) = props.get(keys::PARTITION_TTL_DAYS) {
            self.partition_ttl_days = if v.is_empty() {
                None
            } else {
                Some(parse_int(keys::PARTITION_TTL_DAYS, v)? as u32)
            };
        }
        if let Some(v) = props.get(keys::COMPACTION_TTL_DAYS) {
            self.compaction_ttl_days = if v.is_empty() {
                None
            } else {
                Some(parse_int(keys::COMPACTION_TTL_DAYS, v)? as u32)
            };
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(LakeStateError::InvalidState(format!(
            "property {key}: expected boolean, got '{other}'"
        ))),
    }
}

fn parse_int(key: &str, value: &str) -> Result<u64> {
    value.trim().parse::<u64>().map_err(|_| {
        LakeStateError::InvalidState(format!("property {key}: expected integer, got '{value}'"))
    })
}

/// Parses a byte size: plain bytes, or a KB/MB/GB (decimal) or KiB/MiB/GiB
/// (binary) suffix.
fn parse_size(key: &str, value: &str) -> Result<u64> {
    let v = value.trim();
    let (digits, multiplier) = match v {
        _ if v.ends_with("KiB") => (&v[..v.len() - 3], 1024),
        _ if v.ends_with("MiB") => (&v[..v.len() - 3], 1024 * 1024),
        _ if v.ends_with("GiB") => (&v[..v.len() - 3], 1024 * 1024 * 1024),
        _ if v.ends_with("KB") => (&v[..v.len() - 2], 1000),
        _ if v.ends_with("MB") => (&v[..v.len() - 2], 1000 * 1000),
        _ if v.ends_with("GB") => (&v[..v.len() - 2], 1000 * 1000 * 1000),
        _ => (v, 1),
    };
    let n = digits.trim().parse::<u64>().map_err(|_| {
        LakeStateError::InvalidState(format!("property {key}: expected size, got '{value}'"))
    })?;
    Ok(n * multiplier)
}
