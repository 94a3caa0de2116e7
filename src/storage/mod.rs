//! Storage Backend Module
//!
//! The narrow interface the gateway uses to reach object storage, plus the
//! S3-compatible HTTP client and an in-process store.

pub mod memory;
pub mod s3;
pub mod sigv4;
pub mod xml;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::MemoryStore;
pub use s3::S3Client;

/// Smallest part S3 accepts for any part but the last (5 MiB)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Highest part number S3 accepts
pub const MAX_PARTS: u64 = 10_000;

/// A part as listed in a complete-upload request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Server-side encryption mode requested on write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerSideEncryption {
    /// SSE-S3, keys managed by the storage service
    #[serde(rename = "AES256")]
    Aes256,
    /// SSE-KMS with the service default key
    #[serde(rename = "aws:kms")]
    AwsKms,
}

impl ServerSideEncryption {
    /// Header value for `x-amz-server-side-encryption`
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerSideEncryption::Aes256 => "AES256",
            ServerSideEncryption::AwsKms => "aws:kms",
        }
    }
}

/// Options for a single-shot put
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub encryption: Option<ServerSideEncryption>,
}

/// Storage classes usable as lifecycle transition targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageClass {
    StandardIa,
    OnezoneIa,
    IntelligentTiering,
    Glacier,
    GlacierIr,
    DeepArchive,
}

impl StorageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::StandardIa => "STANDARD_IA",
            StorageClass::OnezoneIa => "ONEZONE_IA",
            StorageClass::IntelligentTiering => "INTELLIGENT_TIERING",
            StorageClass::Glacier => "GLACIER",
            StorageClass::GlacierIr => "GLACIER_IR",
            StorageClass::DeepArchive => "DEEP_ARCHIVE",
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single prefix-filtered transition rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRule {
    pub id: String,
    pub prefix: String,
    pub enabled: bool,
    pub transition_days: u32,
    pub storage_class: StorageClass,
}

/// Object tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// One entry of a version listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVersion {
    pub key: String,
    pub version_id: String,
    pub is_latest: bool,
    pub is_delete_marker: bool,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// HTTP method a presigned URL grants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresignMethod {
    Get,
    Put,
}

impl PresignMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresignMethod::Get => "GET",
            PresignMethod::Put => "PUT",
        }
    }
}

/// The remote operations multipart orchestration depends on
#[async_trait]
pub trait MultipartStore: Send + Sync {
    /// Start a multipart upload and return the backend upload ID
    async fn initiate_upload(&self, bucket: &str, key: &str) -> Result<String>;

    /// Upload one part and return its integrity token (ETag)
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String>;

    /// Finalize an upload from its parts, sorted by part number
    async fn complete_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;

    /// Discard an upload and every part uploaded under it
    async fn abort_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;

    /// Store an object in one request and return its ETag
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes, options: PutOptions) -> Result<String>;

    /// Smallest size the backend accepts for a non-final part
    fn min_part_size(&self) -> u64 {
        MIN_PART_SIZE
    }
}

/// Full set of backend operations exposed by the gateway
#[async_trait]
pub trait ObjectStore: MultipartStore {
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    async fn list_buckets(&self) -> Result<Vec<String>>;

    async fn delete_bucket(&self, bucket: &str) -> Result<()>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    async fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>>;

    async fn enable_versioning(&self, bucket: &str) -> Result<()>;

    async fn list_object_versions(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectVersion>>;

    /// Replace the bucket lifecycle configuration with a single rule
    async fn put_lifecycle_rule(&self, bucket: &str, rule: &LifecycleRule) -> Result<()>;

    /// Replace the object's tag set
    async fn put_object_tags(&self, bucket: &str, key: &str, tags: &[Tag]) -> Result<()>;

    /// Issue a time-bounded URL for one operation on one object
    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        method: PresignMethod,
        expires: Duration,
    ) -> Result<String>;
}
