/*
 * Physical cleanup of discard-log entries.
 *
 * The discard log is the authoritative list of superseded files. The cleaner
 * deletes entries past the compaction TTL through an opendal operator and
 * acknowledges the log only for files that were actually removed; anything
 * that fails deletion stays in the log for the next run.
 */

use std::sync::Arc;

use opendal::Operator;
use tracing::{debug, info, warn};

use lakestate_catalog::{CatalogClient, CatalogClientRef, TableInfo};
use lakestate_common::{
    build_operator, retry_async, LakeStateError, Result, RetryConfig, StorageBackend,
    StorageConfig, TableStoreConfig, TableStoreMetrics,
};

use crate::ttl::MS_PER_DAY;

/// Outcome of one cleaner pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Deletes discarded files from object storage.
pub struct DiscardCleaner {
    catalog: CatalogClientRef,
    operator: Operator,
    /// URI prefix mapping absolute paths onto the operator's root.
    strip_prefix: String,
    metrics: Arc<TableStoreMetrics>,
}

impl DiscardCleaner {
    pub fn new(
        catalog: CatalogClientRef,
        operator: Operator,
        strip_prefix: impl Into<String>,
        metrics: Arc<TableStoreMetrics>,
    ) -> Self {
        Self {
            catalog,
            operator,
            strip_prefix: strip_prefix.into(),
            metrics,
        }
    }

    /// Builds a cleaner for a table's storage location.
    pub fn for_table(
        catalog: CatalogClientRef,
        table: &TableInfo,
        metrics: Arc<TableStoreMetrics>,
    ) -> Result<Self> {
        let config = StorageConfig::from_table_path(&table.table_path);
        let strip_prefix = match config.backend {
            StorageBackend::S3 => format!("s3://{}", config.root),
            StorageBackend::Gcs => format!("gs://{}", config.root),
            StorageBackend::Azure => format!("az://{}", config.root),
            StorageBackend::Local => config.root.clone(),
        };
        let operator = build_operator(&config)?;
        Ok(Self::new(catalog, operator, strip_prefix, metrics))
    }

    /// Deletes every discard-log entry recorded at or before
    /// `older_than_ms`. Per-file failures are retried next pass.
    pub async fn clean(&self, older_than_ms: i64) -> Result<CleanupReport> {
        let entries = retry_async(&RetryConfig::for_catalog(), || {
            self.catalog.list_discarded(older_than_ms)
        })
        .await?;
        if entries.is_empty() {
            return Ok(CleanupReport::default());
        }

        let mut report = CleanupReport::default();
        let mut acked = Vec::new();
        for entry in &entries {
            let key = self.object_key(&entry.path);
            let result = retry_async(&RetryConfig::for_storage(), || {
                let operator = self.operator.clone();
                let key = key.clone();
                async move {
                    operator
                        .delete(&key)
                        .await
                        .map_err(|e| LakeStateError::Storage(format!("delete '{key}': {e}")))
                }
            })
            .await;

            match result {
                Ok(()) => {
                    debug!("deleted discarded file {}", entry.path);
                    report.deleted += 1;
                    acked.push(entry.path.clone());
                }
                Err(e) => {
                    warn!("leaving '{}' in discard log: {e}", entry.path);
                    report.failed += 1;
                }
            }
        }

        if !acked.is_empty() {
            self.catalog.delete_discarded(&acked).await?;
            self.metrics.record_files_cleaned(acked.len() as u64);
        }
        info!(
            "discard cleanup: {} deleted, {} deferred",
            report.deleted, report.failed
        );
        Ok(report)
    }

    /// Applies the compaction TTL from table properties (falling back to the
    /// engine config) and cleans everything older.
    pub async fn clean_expired(
        &self,
        table: &TableInfo,
        config: &TableStoreConfig,
        now_ms: i64,
    ) -> Result<CleanupReport> {
        let mut effective = config.clone();
        effective.apply_properties(&table.properties)?;
        let Some(days) = effective.compaction_ttl_days else {
            return Ok(CleanupReport::default());
        };
        self.clean(now_ms - days as i64 * MS_PER_DAY).await
    }

    fn object_key(&self, path: &str) -> String {
        path.strip_prefix(&self.strip_prefix)
            .unwrap_or(path)
            .trim_start_matches('/')
            .to_string()
    }
}
