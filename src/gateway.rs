//! Object Gateway
//!
//! Service facade over an [`ObjectStore`]. Object operations target the
//! configured default bucket; bucket operations name their bucket
//! explicitly. Everything except multipart upload is a single forwarded call.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{BackendKind, WolfStoreConfig};
use crate::error::{Error, Result};
use crate::storage::{
    LifecycleRule, MemoryStore, ObjectStore, ObjectVersion, PresignMethod, PutOptions, S3Client,
    ServerSideEncryption, Tag,
};
use crate::upload::{MultipartUploader, UploadOptions, UploadOutcome};

/// Gateway over one storage backend and default bucket
#[derive(Clone)]
pub struct ObjectGateway {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    uploader: MultipartUploader<dyn ObjectStore>,
    presign_expiry: Duration,
    lifecycle_rule: LifecycleRule,
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidRequest(format!("{} cannot be empty", what)));
    }
    Ok(())
}

impl ObjectGateway {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        upload_options: UploadOptions,
        presign_expiry: Duration,
        lifecycle_rule: LifecycleRule,
    ) -> Self {
        let bucket = bucket.into();
        let uploader = MultipartUploader::new(Arc::clone(&store), bucket.clone(), upload_options);
        Self {
            store,
            bucket,
            uploader,
            presign_expiry,
            lifecycle_rule,
        }
    }

    /// Build the configured backend and wrap it
    pub async fn from_config(config: &WolfStoreConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.storage.backend {
            BackendKind::S3 => {
                info!("Using S3 backend at {}", config.endpoint());
                Arc::new(S3Client::new(config)?)
            }
            BackendKind::Memory => {
                info!("Using in-memory backend with bucket {}", config.storage.bucket);
                Arc::new(MemoryStore::with_buckets(&[config.storage.bucket.as_str()]).await?)
            }
        };

        Ok(Self::new(
            store,
            config.storage.bucket.clone(),
            UploadOptions::from(&config.upload),
            config.presign_expiry(),
            config.lifecycle_rule(),
        ))
    }

    /// Default bucket for object operations
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    // --- Buckets ---

    pub async fn create_bucket(&self, name: &str) -> Result<()> {
        require(name, "bucket name")?;
        self.store.create_bucket(name).await?;
        info!("Created bucket {}", name);
        Ok(())
    }

    pub async fn list_buckets(&self) -> Result<Vec<String>> {
        self.store.list_buckets().await
    }

    pub async fn delete_bucket(&self, name: &str) -> Result<()> {
        require(name, "bucket name")?;
        self.store.delete_bucket(name).await?;
        info!("Deleted bucket {}", name);
        Ok(())
    }

    // --- Objects ---

    /// Single-shot upload, returning the object's ETag
    pub async fn upload_object(&self, key: &str, data: Bytes, content_type: Option<String>) -> Result<String> {
        require(key, "object key")?;
        let size = data.len();
        let options = PutOptions {
            content_type,
            encryption: None,
        };
        let etag = self.store.put_object(&self.bucket, key, data, options).await?;
        info!("Uploaded {}/{} ({} bytes)", self.bucket, key, size);
        Ok(etag)
    }

    pub async fn download_object(&self, key: &str) -> Result<Bytes> {
        require(key, "object key")?;
        self.store.get_object(&self.bucket, key).await
    }

    pub async fn list_objects(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        self.store.list_objects(&self.bucket, prefix).await
    }

    pub async fn delete_object(&self, key: &str) -> Result<()> {
        require(key, "object key")?;
        self.store.delete_object(&self.bucket, key).await?;
        info!("Deleted {}/{}", self.bucket, key);
        Ok(())
    }

    /// Single-shot upload with SSE-S3 (AES256) requested
    pub async fn upload_with_encryption(&self, key: &str, data: Bytes) -> Result<String> {
        require(key, "object key")?;
        let options = PutOptions {
            content_type: None,
            encryption: Some(ServerSideEncryption::Aes256),
        };
        let etag = self.store.put_object(&self.bucket, key, data, options).await?;
        info!("Uploaded {}/{} with SSE-S3", self.bucket, key);
        Ok(etag)
    }

    // --- Multipart ---

    pub async fn multipart_upload(&self, key: &str, data: Bytes) -> UploadOutcome {
        self.uploader.upload(key, data).await
    }

    pub async fn multipart_upload_with_cancel(
        &self,
        key: &str,
        data: Bytes,
        cancel: CancellationToken,
    ) -> UploadOutcome {
        self.uploader.upload_with_cancel(key, data, cancel).await
    }

    // --- Versioning, lifecycle, tagging ---

    pub async fn enable_versioning(&self, bucket: &str) -> Result<()> {
        require(bucket, "bucket name")?;
        self.store.enable_versioning(bucket).await?;
        info!("Enabled versioning on {}", bucket);
        Ok(())
    }

    /// Versions of every object whose key starts with `key`
    pub async fn list_object_versions(&self, key: &str) -> Result<Vec<ObjectVersion>> {
        require(key, "object key")?;
        self.store.list_object_versions(&self.bucket, key).await
    }

    /// Apply the configured lifecycle rule to `bucket`
    pub async fn set_lifecycle_configuration(&self, bucket: &str) -> Result<()> {
        require(bucket, "bucket name")?;
        self.store.put_lifecycle_rule(bucket, &self.lifecycle_rule).await?;
        info!(
            "Applied lifecycle rule {} to {} ({} after {} days)",
            self.lifecycle_rule.id,
            bucket,
            self.lifecycle_rule.storage_class,
            self.lifecycle_rule.transition_days
        );
        Ok(())
    }

    /// Replace the object's tag set with a single tag
    pub async fn tag_object(&self, key: &str, tag_key: &str, tag_value: &str) -> Result<()> {
        require(key, "object key")?;
        require(tag_key, "tag key")?;
        let tags = [Tag {
            key: tag_key.to_string(),
            value: tag_value.to_string(),
        }];
        self.store.put_object_tags(&self.bucket, key, &tags).await?;
        info!("Tagged {}/{} with {}={}", self.bucket, key, tag_key, tag_value);
        Ok(())
    }

    // --- Presigned URLs ---

    pub async fn presigned_download_url(&self, key: &str) -> Result<String> {
        require(key, "object key")?;
        self.store
            .presign(&self.bucket, key, PresignMethod::Get, self.presign_expiry)
            .await
    }

    pub async fn presigned_upload_url(&self, key: &str) -> Result<String> {
        require(key, "object key")?;
        self.store
            .presign(&self.bucket, key, PresignMethod::Put, self.presign_expiry)
            .await
    }
}
