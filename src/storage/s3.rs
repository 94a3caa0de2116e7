//! S3-compatible storage client
//!
//! Async client over reqwest with SigV4 header signing. Works against AWS
//! and against path-style services such as MinIO or LocalStack.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use chrono::Utc;
use md5::{Digest, Md5};
use reqwest::{Client, Method, Response, StatusCode};
use tracing::{debug, warn};

use super::sigv4::{self, Credentials, SignableRequest, Signer};
use super::xml;
use super::{
    CompletedPart, LifecycleRule, MultipartStore, ObjectStore, ObjectVersion, PresignMethod,
    PutOptions, Tag,
};
use crate::config::WolfStoreConfig;
use crate::error::{Error, Result};

/// Where a request is addressed
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    /// `scheme://host[:port]` the request goes to
    base: String,
    host: String,
    /// Unencoded absolute path
    path: String,
}

/// S3-compatible storage client
pub struct S3Client {
    http: Client,
    endpoint: String,
    region: String,
    path_style: bool,
    signer: Option<Signer>,
}

impl S3Client {
    /// Create a client from the `[storage]` section
    pub fn new(config: &WolfStoreConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Network(format!("failed to create HTTP client: {}", e)))?;

        let signer = match (&config.storage.access_key, &config.storage.secret_key) {
            (Some(access_key), Some(secret_key)) => Some(Signer::new(
                Credentials {
                    access_key: access_key.clone(),
                    secret_key: secret_key.clone(),
                },
                config.storage.region.clone(),
            )),
            _ => {
                warn!("No storage credentials configured, requests will be sent unsigned");
                None
            }
        };

        let endpoint = config.endpoint();
        // Fail early on an unusable endpoint
        sigv4::extract_host(&endpoint)?;

        Ok(Self {
            http,
            endpoint,
            region: config.storage.region.clone(),
            path_style: config.storage.path_style,
            signer,
        })
    }

    fn service_target(&self) -> Result<Target> {
        Ok(Target {
            base: self.endpoint.clone(),
            host: sigv4::extract_host(&self.endpoint)?,
            path: "/".to_string(),
        })
    }

    fn bucket_target(&self, bucket: &str) -> Result<Target> {
        self.target(bucket, None)
    }

    fn object_target(&self, bucket: &str, key: &str) -> Result<Target> {
        self.target(bucket, Some(key))
    }

    fn target(&self, bucket: &str, key: Option<&str>) -> Result<Target> {
        let host = sigv4::extract_host(&self.endpoint)?;

        if self.path_style {
            let path = match key {
                Some(key) => format!("/{}/{}", bucket, key),
                None => format!("/{}", bucket),
            };
            return Ok(Target {
                base: self.endpoint.clone(),
                host,
                path,
            });
        }

        let scheme = if self.endpoint.starts_with("http://") {
            "http"
        } else {
            "https"
        };
        let host = format!("{}.{}", bucket, host);
        Ok(Target {
            base: format!("{}://{}", scheme, host),
            host,
            path: format!("/{}", key.unwrap_or("")),
        })
    }

    /// Sign and send one request, mapping non-2xx responses to errors
    async fn send(
        &self,
        method: Method,
        target: &Target,
        query: &[(String, String)],
        headers: Vec<(String, String)>,
        body: Bytes,
    ) -> Result<Response> {
        let mut url = format!("{}{}", target.base, sigv4::uri_encode(&target.path, false));
        if !query.is_empty() {
            url.push('?');
            url.push_str(&sigv4::canonical_query_string(query));
        }

        let payload_hash = sigv4::hex_sha256(&body);
        let mut all_headers = headers.clone();
        if let Some(signer) = &self.signer {
            let request = SignableRequest {
                method: method.as_str(),
                host: &target.host,
                path: &target.path,
                query,
                headers: &headers,
                payload_hash: &payload_hash,
            };
            all_headers.extend(signer.sign(&request, Utc::now())?);
        }

        let mut builder = self.http.request(method.clone(), &url);
        for (name, value) in &all_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        debug!("{} {}", method, url);
        let response = builder.body(body).send().await.map_err(map_reqwest_error)?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Err(backend_error(status, &text, &target.path))
    }

    async fn read_text(response: Response) -> Result<String> {
        response.text().await.map_err(map_reqwest_error)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Network(e.to_string())
    }
}

/// Translate a failed response into an error, using the S3 error document when present
fn backend_error(status: StatusCode, body: &str, resource: &str) -> Error {
    let (code, message) = xml::parse_error(body);

    if status == StatusCode::NOT_FOUND {
        let reason = code.unwrap_or_else(|| "NotFound".to_string());
        return Error::NotFound(format!("{} ({})", resource.trim_start_matches('/'), reason));
    }

    Error::Backend {
        status: status.as_u16(),
        code: code.unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string()),
        message: message.unwrap_or_default(),
    }
}

fn content_md5(body: &[u8]) -> String {
    BASE64.encode(Md5::digest(body))
}

fn etag_header(response: &Response) -> Option<String> {
    response
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[async_trait]
impl MultipartStore for S3Client {
    async fn initiate_upload(&self, bucket: &str, key: &str) -> Result<String> {
        let target = self.object_target(bucket, key)?;
        let response = self
            .send(Method::POST, &target, &query(&[("uploads", "")]), Vec::new(), Bytes::new())
            .await?;

        let upload_id = xml::parse_upload_id(&Self::read_text(response).await?)?;
        debug!("Initiated multipart upload {} for {}/{}", upload_id, bucket, key);
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
        let target = self.object_target(bucket, key)?;
        let part = part_number.to_string();
        let response = self
            .send(
                Method::PUT,
                &target,
                &query(&[("partNumber", part.as_str()), ("uploadId", upload_id)]),
                Vec::new(),
                data,
            )
            .await?;

        etag_header(&response).ok_or_else(|| {
            Error::MalformedResponse(format!("no ETag returned for part {} of {}", part_number, key))
        })
    }

    async fn complete_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let target = self.object_target(bucket, key)?;
        let body = xml::complete_multipart_upload(parts);
        let response = self
            .send(
                Method::POST,
                &target,
                &query(&[("uploadId", upload_id)]),
                vec![("content-type".to_string(), "application/xml".to_string())],
                Bytes::from(body),
            )
            .await?;

        // CompleteMultipartUpload can fail after a 200 status line
        let text = Self::read_text(response).await?;
        if text.contains("<Error>") {
            let (code, message) = xml::parse_error(&text);
            return Err(Error::Backend {
                status: 200,
                code: code.unwrap_or_else(|| "InternalError".to_string()),
                message: message.unwrap_or_default(),
            });
        }

        debug!("Completed multipart upload {} for {}/{}", upload_id, bucket, key);
        Ok(())
    }

    async fn abort_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let target = self.object_target(bucket, key)?;
        self.send(
            Method::DELETE,
            &target,
            &query(&[("uploadId", upload_id)]),
            Vec::new(),
            Bytes::new(),
        )
        .await?;

        debug!("Aborted multipart upload {} for {}/{}", upload_id, bucket, key);
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes, options: PutOptions) -> Result<String> {
        let target = self.object_target(bucket, key)?;
        let mut headers = Vec::new();
        if let Some(content_type) = &options.content_type {
            headers.push(("content-type".to_string(), content_type.clone()));
        }
        if let Some(encryption) = options.encryption {
            headers.push((
                "x-amz-server-side-encryption".to_string(),
                encryption.as_str().to_string(),
            ));
        }

        let size = data.len();
        let response = self.send(Method::PUT, &target, &[], headers, data).await?;
        let etag = etag_header(&response).unwrap_or_default();

        debug!("Put {}/{} ({} bytes), etag={}", bucket, key, size, etag);
        Ok(etag)
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let target = self.bucket_target(bucket)?;
        // us-east-1 rejects an explicit location constraint
        let body = if self.region == "us-east-1" {
            Bytes::new()
        } else {
            Bytes::from(xml::create_bucket_configuration(&self.region))
        };

        self.send(Method::PUT, &target, &[], Vec::new(), body).await?;
        debug!("Created bucket {}", bucket);
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<String>> {
        let target = self.service_target()?;
        let response = self
            .send(Method::GET, &target, &[], Vec::new(), Bytes::new())
            .await?;
        xml::parse_bucket_names(&Self::read_text(response).await?)
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let target = self.bucket_target(bucket)?;
        self.send(Method::DELETE, &target, &[], Vec::new(), Bytes::new())
            .await?;
        debug!("Deleted bucket {}", bucket);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let target = self.object_target(bucket, key)?;
        let response = self
            .send(Method::GET, &target, &[], Vec::new(), Bytes::new())
            .await?;
        response.bytes().await.map_err(map_reqwest_error)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let target = self.object_target(bucket, key)?;
        self.send(Method::DELETE, &target, &[], Vec::new(), Bytes::new())
            .await?;
        debug!("Deleted {}/{}", bucket, key);
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        let target = self.bucket_target(bucket)?;
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut params = query(&[("list-type", "2")]);
            if let Some(prefix) = prefix {
                params.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(token) = &continuation {
                params.push(("continuation-token".to_string(), token.clone()));
            }

            let response = self
                .send(Method::GET, &target, &params, Vec::new(), Bytes::new())
                .await?;
            let page = xml::parse_object_list(&Self::read_text(response).await?)?;
            keys.extend(page.keys);

            match page.next_continuation_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        Ok(keys)
    }

    async fn enable_versioning(&self, bucket: &str) -> Result<()> {
        let target = self.bucket_target(bucket)?;
        let body = xml::versioning_configuration(true);
        self.send(
            Method::PUT,
            &target,
            &query(&[("versioning", "")]),
            vec![("content-md5".to_string(), content_md5(body.as_bytes()))],
            Bytes::from(body),
        )
        .await?;
        debug!("Enabled versioning on {}", bucket);
        Ok(())
    }

    async fn list_object_versions(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectVersion>> {
        let target = self.bucket_target(bucket)?;
        let mut versions = Vec::new();
        let mut markers: Option<(String, Option<String>)> = None;

        loop {
            let mut params = query(&[("versions", ""), ("prefix", prefix)]);
            if let Some((key_marker, version_marker)) = &markers {
                params.push(("key-marker".to_string(), key_marker.clone()));
                if let Some(version_marker) = version_marker {
                    params.push(("version-id-marker".to_string(), version_marker.clone()));
                }
            }

            let response = self
                .send(Method::GET, &target, &params, Vec::new(), Bytes::new())
                .await?;
            let page = xml::parse_version_list(&Self::read_text(response).await?)?;
            versions.extend(page.versions);

            match page.next_key_marker {
                Some(key_marker) => markers = Some((key_marker, page.next_version_id_marker)),
                None => break,
            }
        }

        Ok(versions)
    }

    async fn put_lifecycle_rule(&self, bucket: &str, rule: &LifecycleRule) -> Result<()> {
        let target = self.bucket_target(bucket)?;
        let body = xml::lifecycle_configuration(rule);
        self.send(
            Method::PUT,
            &target,
            &query(&[("lifecycle", "")]),
            vec![("content-md5".to_string(), content_md5(body.as_bytes()))],
            Bytes::from(body),
        )
        .await?;
        debug!("Applied lifecycle rule {} to {}", rule.id, bucket);
        Ok(())
    }

    async fn put_object_tags(&self, bucket: &str, key: &str, tags: &[Tag]) -> Result<()> {
        let target = self.object_target(bucket, key)?;
        let body = xml::tagging(tags);
        self.send(
            Method::PUT,
            &target,
            &query(&[("tagging", "")]),
            vec![("content-md5".to_string(), content_md5(body.as_bytes()))],
            Bytes::from(body),
        )
        .await?;
        debug!("Tagged {}/{} with {} tag(s)", bucket, key, tags.len());
        Ok(())
    }

    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        method: PresignMethod,
        expires: Duration,
    ) -> Result<String> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| Error::Config("presigned URLs require storage credentials".into()))?;
        let target = self.object_target(bucket, key)?;
        signer.presign_url(
            method.as_str(),
            &target.base,
            &target.path,
            expires.as_secs(),
            Utc::now(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(toml: &str) -> S3Client {
        let config = WolfStoreConfig::from_str(toml).unwrap();
        S3Client::new(&config).unwrap()
    }

    #[test]
    fn test_path_style_targets() {
        let s3 = client(
            "[storage]\nendpoint = \"http://localhost:4566\"\nbucket = \"media\"\n\
             access_key = \"test\"\nsecret_key = \"test\"\n",
        );
        let target = s3.object_target("media", "videos/clip 1.mp4").unwrap();
        assert_eq!(target.base, "http://localhost:4566");
        assert_eq!(target.host, "localhost:4566");
        assert_eq!(target.path, "/media/videos/clip 1.mp4");
        assert_eq!(s3.bucket_target("media").unwrap().path, "/media");
    }

    #[test]
    fn test_virtual_hosted_targets() {
        let s3 = client(
            "[storage]\nbucket = \"media\"\npath_style = false\nregion = \"eu-west-1\"\n\
             access_key = \"test\"\nsecret_key = \"test\"\n",
        );
        let target = s3.object_target("media", "a.txt").unwrap();
        assert_eq!(target.base, "https://media.s3.eu-west-1.amazonaws.com");
        assert_eq!(target.host, "media.s3.eu-west-1.amazonaws.com");
        assert_eq!(target.path, "/a.txt");
    }

    #[test]
    fn test_backend_error_mapping() {
        let body = "<Error><Code>NoSuchKey</Code><Message>gone</Message></Error>";
        assert!(matches!(
            backend_error(StatusCode::NOT_FOUND, body, "/media/a.txt"),
            Error::NotFound(msg) if msg == "media/a.txt (NoSuchKey)"
        ));

        let body = "<Error><Code>SlowDown</Code><Message>Please reduce your request rate.</Message></Error>";
        let err = backend_error(StatusCode::SERVICE_UNAVAILABLE, body, "/media/a.txt");
        assert!(err.is_retryable());
        assert!(matches!(err, Error::Backend { status: 503, ref code, .. } if code == "SlowDown"));

        let err = backend_error(StatusCode::FORBIDDEN, "", "/media");
        assert!(matches!(err, Error::Backend { status: 403, ref code, .. } if code == "Forbidden"));
    }

    #[test]
    fn test_content_md5() {
        // RFC 1864 style base64 of the raw digest
        assert_eq!(content_md5(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[tokio::test]
    async fn test_presign_requires_credentials() {
        let s3 = client("[storage]\nendpoint = \"http://localhost:9000\"\nbucket = \"media\"\n");
        let result = s3
            .presign("media", "a.txt", PresignMethod::Get, Duration::from_secs(600))
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_presign_url_shape() {
        let s3 = client(
            "[storage]\nendpoint = \"http://localhost:9000\"\nbucket = \"media\"\n\
             access_key = \"minio\"\nsecret_key = \"minio123\"\n",
        );
        let url = s3
            .presign("media", "reports/q1.pdf", PresignMethod::Put, Duration::from_secs(600))
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost:9000/media/reports/q1.pdf?X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains("X-Amz-Expires=600"));
        assert!(url.contains("X-Amz-Signature="));
    }

    /// Runs against a live S3-compatible service, e.g. `localstack` or `minio`.
    /// Configure with WOLFSTORE_TEST_ENDPOINT / WOLFSTORE_TEST_BUCKET.
    #[cfg(feature = "integration")]
    #[tokio::test]
    async fn test_multipart_against_live_service() {
        let endpoint = std::env::var("WOLFSTORE_TEST_ENDPOINT")
            .unwrap_or_else(|_| "http://localhost:4566".to_string());
        let bucket =
            std::env::var("WOLFSTORE_TEST_BUCKET").unwrap_or_else(|_| "wolfstore-test".to_string());
        let s3 = client(&format!(
            "[storage]\nendpoint = \"{}\"\nbucket = \"{}\"\naccess_key = \"test\"\nsecret_key = \"test\"\n",
            endpoint, bucket
        ));

        let _ = s3.create_bucket(&bucket).await;
        let key = format!("it/{}", uuid::Uuid::new_v4());
        let part = Bytes::from(vec![7u8; crate::storage::MIN_PART_SIZE as usize]);

        let upload_id = s3.initiate_upload(&bucket, &key).await.unwrap();
        let e1 = s3.upload_part(&bucket, &key, &upload_id, 1, part.clone()).await.unwrap();
        let e2 = s3.upload_part(&bucket, &key, &upload_id, 2, Bytes::from_static(b"tail")).await.unwrap();
        s3.complete_upload(
            &bucket,
            &key,
            &upload_id,
            &[
                CompletedPart { part_number: 1, etag: e1 },
                CompletedPart { part_number: 2, etag: e2 },
            ],
        )
        .await
        .unwrap();

        let data = s3.get_object(&bucket, &key).await.unwrap();
        assert_eq!(data.len(), part.len() + 4);
        s3.delete_object(&bucket, &key).await.unwrap();
    }
}
