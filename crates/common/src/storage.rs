/*
 * Storage access via opendal.
 *
 * The engine itself never reads or writes data-file contents; the columnar IO
 * layer owns that. The operator built here serves the lifecycle paths only:
 * physically deleting discard-log entries and renaming compacted outputs.
 */

use std::collections::HashMap;

use opendal::Operator;

use crate::{LakeStateError, Result};

/// Storage backend type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Gcs,
    Azure,
    Local,
}

/// Configuration for building a storage operator.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Bucket/container name, or root directory for local storage.
    pub root: String,
    /// Endpoint override for S3-compatible services.
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// Provider-specific options (credentials, etc.).
    pub options: HashMap<String, String>,
}

impl StorageConfig {
    pub fn local(root: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::Local,
            root: root.into(),
            endpoint: None,
            region: None,
            options: HashMap::new(),
        }
    }

    pub fn s3(bucket: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::S3,
            root: bucket.into(),
            endpoint: None,
            region: None,
            options: HashMap::new(),
        }
    }

    pub fn gcs(bucket: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::Gcs,
            root: bucket.into(),
            endpoint: None,
            region: None,
            options: HashMap::new(),
        }
    }

    pub fn azure(container: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::Azure,
            root: container.into(),
            endpoint: None,
            region: None,
            options: HashMap::new(),
        }
    }

    /// Infers a config from a table path URI. Plain paths and `file://` map
    /// to local storage.
    pub fn from_table_path(path: &str) -> Self {
        if let Some(rest) = path.strip_prefix("s3://") {
            let bucket = rest.split('/').next().unwrap_or_default();
            Self::s3(bucket)
        } else if let Some(rest) = path.strip_prefix("gs://") {
            let bucket = rest.split('/').next().unwrap_or_default();
            Self::gcs(bucket)
        } else if let Some(rest) = path.strip_prefix("az://") {
            let container = rest.split('/').next().unwrap_or_default();
            Self::azure(container)
        } else {
            Self::local(path.strip_prefix("file://").unwrap_or(path))
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_aws_credentials(
        self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        let mut config = self
            .with_option("access_key_id", access_key_id)
            .with_option("secret_access_key", secret_access_key);
        if let Some(token) = session_token {
            config = config.with_option("session_token", token);
        }
        config
    }
}

/// Builds an opendal operator from storage configuration.
pub fn build_operator(config: &StorageConfig) -> Result<Operator> {
    match config.backend {
        StorageBackend::S3 => build_s3_operator(config),
        StorageBackend::Gcs => build_gcs_operator(config),
        StorageBackend::Azure => build_azure_operator(config),
        StorageBackend::Local => build_local_operator(config),
    }
}

fn build_s3_operator(config: &StorageConfig) -> Result<Operator> {
    let mut builder = opendal::services::S3::default();

    builder = builder.bucket(&config.root);

    if let Some(endpoint) = &config.endpoint {
        builder = builder.endpoint(endpoint);
    }
    if let Some(region) = &config.region {
        builder = builder.region(region);
    }
    if let Some(access_key) = config.options.get("access_key_id") {
        builder = builder.access_key_id(access_key);
    }
    if let Some(secret_key) = config.options.get("secret_access_key") {
        builder = builder.secret_access_key(secret_key);
    }
    if let Some(session_token) = config.options.get("session_token") {
        builder = builder.session_token(session_token);
    }

    Operator::new(builder)
        .map(|op| op.finish())
        .map_err(|e| LakeStateError::Storage(format!("failed to build S3 operator: {e}")))
}

fn build_gcs_operator(config: &StorageConfig) -> Result<Operator> {
    let mut builder = opendal::services::Gcs::default();

    builder = builder.bucket(&config.root);

    if let Some(endpoint) = &config.endpoint {
        builder = builder.endpoint(endpoint);
    }
    if let Some(credential) = config.options.get("credential") {
        builder = builder.credential(credential);
    }

    Operator::new(builder)
        .map(|op| op.finish())
        .map_err(|e| LakeStateError::Storage(format!("failed to build GCS operator: {e}")))
}

fn build_azure_operator(config: &StorageConfig) -> Result<Operator> {
    let mut builder = opendal::services::Azblob::default();

    builder = builder.container(&config.root);

    if let Some(endpoint) = &config.endpoint {
        builder = builder.endpoint(endpoint);
    }
    if let Some(account_name) = config.options.get("account_name") {
        builder = builder.account_name(account_name);
    }
    if let Some(account_key) = config.options.get("account_key") {
        builder = builder.account_key(account_key);
    }

    Operator::new(builder)
        .map(|op| op.finish())
        .map_err(|e| LakeStateError::Storage(format!("failed to build Azure operator: {e}")))
}

fn build_local_operator(config: &StorageConfig) -> Result<Operator> {
    let mut builder = opendal::services::Fs::default();

    builder = builder.root(&config.root);

    Operator::new(builder)
        .map(|op| op.finish())
        .map_err(|e| LakeStateError::Storage(format!("failed to build local operator: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_table_path() {
        let config = StorageConfig::from_table_path("s3://warehouse/db/events");
        assert_eq!(config.backend, StorageBackend::S3);
        assert_eq!(config.root, "warehouse");

        let config = StorageConfig::from_table_path("file:///data/warehouse/events");
        assert_eq!(config.backend, StorageBackend::Local);
        assert_eq!(config.root, "/data/warehouse/events");

        let config = StorageConfig::from_table_path("/data/warehouse/events");
        assert_eq!(config.backend, StorageBackend::Local);
    }

    #[test]
    fn test_s3_credentials() {
        let config = StorageConfig::s3("bucket")
            .with_region("us-west-2")
            .with_aws_credentials("AKID", "SECRET", Some("TOKEN".to_string()));

        assert_eq!(config.region, Some("us-west-2".to_string()));
        assert_eq!(config.options.get("access_key_id"), Some(&"AKID".to_string()));
        assert_eq!(config.options.get("session_token"), Some(&"TOKEN".to_string()));
    }

    #[test]
    fn test_build_local_operator() {
        let config = StorageConfig::local("/tmp");
        assert!(build_operator(&config).is_ok());
    }
}
