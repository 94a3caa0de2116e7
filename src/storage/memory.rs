//! In-process object store
//!
//! Behaves like an S3 bucket set closely enough for local development and
//! for tests: multipart validation, versioning with delete markers, tags and
//! lifecycle rules are all kept in memory.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use md5::{Digest, Md5};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{
    CompletedPart, LifecycleRule, MultipartStore, ObjectStore, ObjectVersion, PresignMethod,
    PutOptions, Tag, MIN_PART_SIZE,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredVersion {
    version_id: String,
    /// None marks a delete marker
    data: Option<Bytes>,
    etag: String,
    last_modified: String,
}

#[derive(Debug, Default)]
struct Bucket {
    versioning: bool,
    /// Oldest version first
    objects: BTreeMap<String, Vec<StoredVersion>>,
    tags: HashMap<String, Vec<Tag>>,
    lifecycle: Option<LifecycleRule>,
}

impl Bucket {
    fn current(&self, key: &str) -> Option<&StoredVersion> {
        self.objects.get(key).and_then(|versions| versions.last())
    }

    fn write(&mut self, key: &str, version: StoredVersion) {
        let versions = self.objects.entry(key.to_string()).or_default();
        if !self.versioning {
            versions.clear();
        }
        versions.push(version);
    }
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: BTreeMap<String, Bucket>,
    uploads: HashMap<String, PendingUpload>,
}

/// Thread-safe in-memory store
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    min_part_size: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn etag_of(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(data)))
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn no_such_bucket(bucket: &str) -> Error {
    Error::NotFound(format!("bucket {}", bucket))
}

fn no_such_upload(upload_id: &str) -> Error {
    Error::Backend {
        status: 404,
        code: "NoSuchUpload".to_string(),
        message: format!("upload {} does not exist", upload_id),
    }
}

fn invalid_part(message: String) -> Error {
    Error::Backend {
        status: 400,
        code: "InvalidPart".to_string(),
        message,
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            min_part_size: MIN_PART_SIZE,
        }
    }

    /// Store with a smaller non-final part minimum, so tests can use tiny parts
    pub fn with_min_part_size(min_part_size: u64) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            min_part_size,
        }
    }

    /// Store with the given buckets already created
    pub async fn with_buckets(buckets: &[&str]) -> Result<Self> {
        let store = Self::new();
        for bucket in buckets {
            store.create_bucket(bucket).await?;
        }
        Ok(store)
    }

    /// Number of multipart uploads initiated but neither completed nor aborted
    pub async fn pending_uploads(&self) -> usize {
        self.inner.read().await.uploads.len()
    }

    /// Tags currently set on an object
    pub async fn object_tags(&self, bucket: &str, key: &str) -> Result<Vec<Tag>> {
        let inner = self.inner.read().await;
        let bucket_state = inner.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        Ok(bucket_state.tags.get(key).cloned().unwrap_or_default())
    }

    /// Lifecycle rule currently applied to a bucket
    pub async fn lifecycle_rule(&self, bucket: &str) -> Result<Option<LifecycleRule>> {
        let inner = self.inner.read().await;
        let bucket_state = inner.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        Ok(bucket_state.lifecycle.clone())
    }
}

#[async_trait]
impl MultipartStore for MemoryStore {
    async fn initiate_upload(&self, bucket: &str, key: &str) -> Result<String> {
        let mut inner = self.inner.write().await;
        if !inner.buckets.contains_key(bucket) {
            return Err(no_such_bucket(bucket));
        }

        let upload_id = Uuid::new_v4().to_string();
        inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        if part_number == 0 || u64::from(part_number) > super::MAX_PARTS {
            return Err(Error::InvalidRequest(format!("part number {} out of range", part_number)));
        }

        let mut inner = self.inner.write().await;
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| no_such_upload(upload_id))?;

        let etag = etag_of(&data);
        // Re-uploading a part number replaces the earlier data
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let upload = inner
            .uploads
            .get(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| no_such_upload(upload_id))?;

        if parts.is_empty() {
            return Err(Error::Backend {
                status: 400,
                code: "MalformedXML".to_string(),
                message: "at least one part is required".to_string(),
            });
        }

        if let Some(pair) = parts.windows(2).find(|pair| pair[1].part_number <= pair[0].part_number) {
            return Err(Error::Backend {
                status: 400,
                code: "InvalidPartOrder".to_string(),
                message: format!("part {} listed out of order", pair[1].part_number),
            });
        }

        let mut body = BytesMut::new();
        for (index, part) in parts.iter().enumerate() {
            let (etag, data) = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| invalid_part(format!("part {} was never uploaded", part.part_number)))?;
            if *etag != part.etag {
                return Err(invalid_part(format!("ETag mismatch for part {}", part.part_number)));
            }

            let is_last = index + 1 == parts.len();
            if !is_last && (data.len() as u64) < self.min_part_size {
                return Err(Error::Backend {
                    status: 400,
                    code: "EntityTooSmall".to_string(),
                    message: format!(
                        "part {} is {} bytes, below the minimum of {}",
                        part.part_number,
                        data.len(),
                        self.min_part_size
                    ),
                });
            }
            body.extend_from_slice(data);
        }

        inner.uploads.remove(upload_id);
        let data = body.freeze();
        let version = StoredVersion {
            version_id: Uuid::new_v4().to_string(),
            etag: format!("\"{}-{}\"", hex::encode(Md5::digest(&data)), parts.len()),
            data: Some(data),
            last_modified: now(),
        };
        inner
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket(bucket))?
            .write(key, version);

        debug!("Completed in-memory multipart upload {} for {}/{}", upload_id, bucket, key);
        Ok(())
    }

    async fn abort_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let owned = inner
            .uploads
            .get(upload_id)
            .map_or(false, |u| u.bucket == bucket && u.key == key);
        if !owned {
            return Err(no_such_upload(upload_id));
        }
        inner.uploads.remove(upload_id);
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes, _options: PutOptions) -> Result<String> {
        let mut inner = self.inner.write().await;
        let bucket_state = inner.buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;

        let etag = etag_of(&data);
        bucket_state.write(
            key,
            StoredVersion {
                version_id: Uuid::new_v4().to_string(),
                data: Some(data),
                etag: etag.clone(),
                last_modified: now(),
            },
        );
        Ok(etag)
    }

    fn min_part_size(&self) -> u64 {
        self.min_part_size
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.buckets.contains_key(bucket) {
            return Err(Error::Backend {
                status: 409,
                code: "BucketAlreadyOwnedByYou".to_string(),
                message: format!("bucket {} already exists", bucket),
            });
        }
        inner.buckets.insert(bucket.to_string(), Bucket::default());
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().await.buckets.keys().cloned().collect())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let bucket_state = inner.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        if !bucket_state.objects.is_empty() {
            return Err(Error::Backend {
                status: 409,
                code: "BucketNotEmpty".to_string(),
                message: format!("bucket {} is not empty", bucket),
            });
        }
        inner.buckets.remove(bucket);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let inner = self.inner.read().await;
        let bucket_state = inner.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        bucket_state
            .current(key)
            .and_then(|v| v.data.clone())
            .ok_or_else(|| Error::NotFound(format!("{}/{}", bucket, key)))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let bucket_state = inner.buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;

        if bucket_state.versioning {
            bucket_state.write(
                key,
                StoredVersion {
                    version_id: Uuid::new_v4().to_string(),
                    data: None,
                    etag: String::new(),
                    last_modified: now(),
                },
            );
        } else {
            bucket_state.objects.remove(key);
            bucket_state.tags.remove(key);
        }
        // Deleting a missing key is not an error
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let bucket_state = inner.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        Ok(bucket_state
            .objects
            .iter()
            .filter(|(key, _)| prefix.map_or(true, |p| key.starts_with(p)))
            .filter(|(_, versions)| versions.last().map_or(false, |v| v.data.is_some()))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn enable_versioning(&self, bucket: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket(bucket))?
            .versioning = true;
        Ok(())
    }

    async fn list_object_versions(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectVersion>> {
        let inner = self.inner.read().await;
        let bucket_state = inner.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;

        let mut listing = Vec::new();
        for (key, versions) in bucket_state.objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            // Newest first, as S3 lists them
            for (index, version) in versions.iter().enumerate().rev() {
                listing.push(ObjectVersion {
                    key: key.clone(),
                    version_id: if bucket_state.versioning {
                        version.version_id.clone()
                    } else {
                        "null".to_string()
                    },
                    is_latest: index + 1 == versions.len(),
                    is_delete_marker: version.data.is_none(),
                    size: version.data.as_ref().map_or(0, |d| d.len() as u64),
                    etag: version.data.as_ref().map(|_| version.etag.clone()),
                    last_modified: Some(version.last_modified.clone()),
                });
            }
        }
        Ok(listing)
    }

    async fn put_lifecycle_rule(&self, bucket: &str, rule: &LifecycleRule) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket(bucket))?
            .lifecycle = Some(rule.clone());
        Ok(())
    }

    async fn put_object_tags(&self, bucket: &str, key: &str, tags: &[Tag]) -> Result<()> {
        let mut inner = self.inner.write().await;
        let bucket_state = inner.buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        if bucket_state.current(key).and_then(|v| v.data.as_ref()).is_none() {
            return Err(Error::NotFound(format!("{}/{}", bucket, key)));
        }
        bucket_state.tags.insert(key.to_string(), tags.to_vec());
        Ok(())
    }

    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        method: PresignMethod,
        expires: Duration,
    ) -> Result<String> {
        let inner = self.inner.read().await;
        if !inner.buckets.contains_key(bucket) {
            return Err(no_such_bucket(bucket));
        }

        let expires_at = Utc::now() + chrono::Duration::seconds(expires.as_secs() as i64);
        Ok(format!(
            "memory://{}/{}?method={}&expires={}&token={}",
            bucket,
            key,
            method.as_str(),
            expires_at.timestamp(),
            Uuid::new_v4().simple()
        ))
    }
}
