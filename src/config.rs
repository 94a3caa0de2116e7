//! WolfStore Configuration
//!
//! This module provides configuration structures for the WolfStore
//! object storage gateway.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::{LifecycleRule, StorageClass, MIN_PART_SIZE};

/// Longest validity S3 accepts for a presigned URL (7 days)
pub const MAX_PRESIGN_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;

/// Main WolfStore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfStoreConfig {
    /// Storage backend configuration
    pub storage: StorageConfig,

    /// Multipart upload configuration
    #[serde(default)]
    pub upload: UploadConfig,

    /// Presigned URL configuration
    #[serde(default)]
    pub presign: PresignConfig,

    /// Lifecycle rule applied by the lifecycle endpoint
    #[serde(default)]
    pub lifecycle: LifecyclePolicyConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which storage backend the gateway forwards to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// S3-compatible service over HTTP
    #[default]
    S3,
    /// In-process store, for local development
    Memory,
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend kind
    #[serde(default)]
    pub backend: BackendKind,

    /// Endpoint URL (empty = AWS endpoint for the region)
    #[serde(default)]
    pub endpoint: String,

    /// Region used for request signing
    #[serde(default = "default_region")]
    pub region: String,

    /// Default bucket for object operations
    pub bucket: String,

    /// Access key ID
    #[serde(default)]
    pub access_key: Option<String>,

    /// Secret access key
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Use path-style addressing (bucket in the path, not the host)
    #[serde(default = "default_true")]
    pub path_style: bool,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Multipart upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Size of every part except the last
    #[serde(default = "default_part_size")]
    pub part_size_bytes: u64,

    /// Maximum parts in flight per upload
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retries per part for transient failures (0 = no retry)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between retries in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Timeout for each individual backend call in seconds (0 = none)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Timeout for a whole upload in seconds (0 = none)
    #[serde(default)]
    pub upload_timeout_secs: u64,
}

/// Presigned URL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignConfig {
    /// Validity window in seconds
    #[serde(default = "default_presign_expiry")]
    pub expiry_secs: u64,
}

/// Lifecycle rule template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecyclePolicyConfig {
    /// Rule identifier
    #[serde(default = "default_rule_id")]
    pub rule_id: String,

    /// Key prefix the rule applies to
    #[serde(default = "default_rule_prefix")]
    pub prefix: String,

    /// Days after creation before transition
    #[serde(default = "default_transition_days")]
    pub transition_days: u32,

    /// Target storage class
    #[serde(default = "default_storage_class")]
    pub storage_class: StorageClass,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,

    /// Largest accepted request body in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    300
}

fn default_part_size() -> u64 {
    MIN_PART_SIZE
}

fn default_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_call_timeout() -> u64 {
    120
}

fn default_presign_expiry() -> u64 {
    600
}

fn default_rule_id() -> String {
    "MoveToGlacierAfter30Days".to_string()
}

fn default_rule_prefix() -> String {
    "temp/".to_string()
}

fn default_transition_days() -> u32 {
    30
}

fn default_storage_class() -> StorageClass {
    StorageClass::Glacier
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    512 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size_bytes: default_part_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            call_timeout_secs: default_call_timeout(),
            upload_timeout_secs: 0,
        }
    }
}

impl Default for PresignConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_presign_expiry(),
        }
    }
}

impl Default for LifecyclePolicyConfig {
    fn default() -> Self {
        Self {
            rule_id: default_rule_id(),
            prefix: default_rule_prefix(),
            transition_days: default_transition_days(),
            storage_class: default_storage_class(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfStoreConfig {
    /// Load configuration from a TOML file
    ///
    /// `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY` override the file's
    /// credentials when both are set.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: WolfStoreConfig = toml::from_str(&content)?;
        config.apply_credentials(
            std::env::var("AWS_ACCESS_KEY_ID").ok(),
            std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
        );
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfStoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the file credentials with a complete pair; a lone key or secret is ignored
    fn apply_credentials(&mut self, access_key: Option<String>, secret_key: Option<String>) {
        let access_key = access_key.filter(|k| !k.is_empty());
        let secret_key = secret_key.filter(|s| !s.is_empty());
        match (access_key, secret_key) {
            (Some(key), Some(secret)) => {
                self.storage.access_key = Some(key);
                self.storage.secret_key = Some(secret);
            }
            (None, None) => {}
            _ => tracing::warn!(
                "Ignoring AWS credentials from the environment: access key and secret must both be set"
            ),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.storage.bucket.is_empty() {
            return Err(crate::Error::Config("storage.bucket cannot be empty".into()));
        }

        if self.storage.region.is_empty() {
            return Err(crate::Error::Config("storage.region cannot be empty".into()));
        }

        if self.storage.access_key.is_some() != self.storage.secret_key.is_some() {
            return Err(crate::Error::Config(
                "storage.access_key and storage.secret_key must be set together".into(),
            ));
        }

        if self.upload.part_size_bytes < MIN_PART_SIZE {
            return Err(crate::Error::Config(format!(
                "upload.part_size_bytes must be at least {} bytes",
                MIN_PART_SIZE
            )));
        }

        if self.upload.concurrency == 0 {
            return Err(crate::Error::Config("upload.concurrency must be at least 1".into()));
        }

        if self.presign.expiry_secs == 0 || self.presign.expiry_secs > MAX_PRESIGN_EXPIRY_SECS {
            return Err(crate::Error::Config(format!(
                "presign.expiry_secs must be between 1 and {}",
                MAX_PRESIGN_EXPIRY_SECS
            )));
        }

        if self.lifecycle.rule_id.is_empty() {
            return Err(crate::Error::Config("lifecycle.rule_id cannot be empty".into()));
        }

        Ok(())
    }

    /// Get the backend endpoint, falling back to the AWS regional endpoint
    pub fn endpoint(&self) -> String {
        if self.storage.endpoint.is_empty() {
            format!("https://s3.{}.amazonaws.com", self.storage.region)
        } else {
            self.storage.endpoint.trim_end_matches('/').to_string()
        }
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.storage.connect_timeout_secs)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.storage.request_timeout_secs)
    }

    /// Get presigned URL validity as Duration
    pub fn presign_expiry(&self) -> Duration {
        Duration::from_secs(self.presign.expiry_secs)
    }

    /// Build the lifecycle rule described by the `[lifecycle]` section
    pub fn lifecycle_rule(&self) -> LifecycleRule {
        LifecycleRule {
            id: self.lifecycle.rule_id.clone(),
            prefix: self.lifecycle.prefix.clone(),
            enabled: true,
            transition_days: self.lifecycle.transition_days,
            storage_class: self.lifecycle.storage_class,
        }
    }
}

impl UploadConfig {
    /// Per-call timeout, if enabled
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs))
    }

    /// Whole-upload timeout, if enabled
    pub fn upload_timeout(&self) -> Option<Duration> {
        (self.upload_timeout_secs > 0).then(|| Duration::from_secs(self.upload_timeout_secs))
    }

    /// Base retry backoff as Duration
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Default config file location used by the binaries
pub fn default_config_path() -> PathBuf {
    PathBuf::from("wolfstore.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[storage]
endpoint = "http://localhost:9000/"
region = "eu-west-1"
bucket = "media"
access_key = "minio"
secret_key = "minio123"

[upload]
part_size_bytes = 8388608
concurrency = 2

[presign]
expiry_secs = 300
"#;

        let config = WolfStoreConfig::from_str(toml).unwrap();
        assert_eq!(config.storage.bucket, "media");
        assert_eq!(config.storage.backend, BackendKind::S3);
        assert_eq!(config.endpoint(), "http://localhost:9000");
        assert_eq!(config.upload.part_size_bytes, 8 * 1024 * 1024);
        assert_eq!(config.upload.concurrency, 2);
        assert_eq!(config.presign_expiry(), Duration::from_secs(300));
        assert!(config.storage.path_style);
    }

    #[test]
    fn test_defaults_follow_original_service() {
        let config = WolfStoreConfig::from_str("[storage]\nbucket = \"b\"\nbackend = \"memory\"\n").unwrap();
        assert_eq!(config.storage.backend, BackendKind::Memory);
        assert_eq!(config.upload.part_size_bytes, 5 * 1024 * 1024);
        assert_eq!(config.presign.expiry_secs, 600);
        assert_eq!(config.endpoint(), "https://s3.us-east-1.amazonaws.com");

        let rule = config.lifecycle_rule();
        assert_eq!(rule.id, "MoveToGlacierAfter30Days");
        assert_eq!(rule.prefix, "temp/");
        assert_eq!(rule.transition_days, 30);
        assert_eq!(rule.storage_class, StorageClass::Glacier);
    }

    #[test]
    fn test_rejects_small_part_size() {
        let toml = "[storage]\nbucket = \"b\"\n[upload]\npart_size_bytes = 1024\n";
        assert!(matches!(
            WolfStoreConfig::from_str(toml),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_rejects_empty_bucket_and_bad_expiry() {
        assert!(WolfStoreConfig::from_str("[storage]\nbucket = \"\"\n").is_err());
        let toml = "[storage]\nbucket = \"b\"\n[presign]\nexpiry_secs = 0\n";
        assert!(WolfStoreConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_credentials_apply_only_as_a_pair() {
        let mut config = WolfStoreConfig::from_str("[storage]\nbackend = \"memory\"\nbucket = \"b\"\n").unwrap();

        config.apply_credentials(Some("AKIDONLY".into()), None);
        assert!(config.storage.access_key.is_none());
        assert!(config.storage.secret_key.is_none());
        assert!(config.validate().is_ok());

        config.apply_credentials(Some("AKID".into()), Some("".into()));
        assert!(config.storage.access_key.is_none());

        config.apply_credentials(Some("AKID".into()), Some("secret".into()));
        assert_eq!(config.storage.access_key.as_deref(), Some("AKID"));
        assert_eq!(config.storage.secret_key.as_deref(), Some("secret"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_keeps_file_credentials() {
        let toml = "[storage]\nbucket = \"b\"\naccess_key = \"file-key\"\nsecret_key = \"file-secret\"\n";
        let config = WolfStoreConfig::from_str(toml).unwrap();
        assert_eq!(config.storage.access_key.as_deref(), Some("file-key"));
        assert_eq!(config.storage.secret_key.as_deref(), Some("file-secret"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage]\nbucket = \"uploads\"\nbackend = \"memory\"").unwrap();

        let config = WolfStoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.storage.bucket, "uploads");
        assert_eq!(config.upload.call_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.upload.upload_timeout(), None);
    }
}
