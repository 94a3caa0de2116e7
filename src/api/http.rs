//! HTTP API Server
//!
//! REST API for bucket and object operations under `/api/s3`.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::gateway::ObjectGateway;
use crate::storage::ObjectVersion;
use crate::upload::{Cleanup, UploadFailure};

/// Shared application state
pub struct AppState {
    pub gateway: ObjectGateway,
    pub started_at: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, gateway: ObjectGateway) -> Self {
        let state = Arc::new(AppState {
            gateway,
            started_at: Instant::now(),
        });
        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Build the router with all middleware applied
    pub fn router(&self) -> Router {
        let mut router = Self::create_router(Arc::clone(&self.state))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(TraceLayer::new_for_http());
        if self.config.cors_enabled {
            router = router.layer(CorsLayer::permissive());
        }
        router
    }

    /// Create the router
    fn create_router(state: Arc<AppState>) -> Router {
        let s3 = Router::new()
            // Buckets
            .route("/buckets", get(handle_list_buckets))
            .route("/buckets/:name", post(handle_create_bucket).delete(handle_delete_bucket))
            // Objects
            .route("/upload", post(handle_upload))
            .route("/upload-encrypted", post(handle_upload_encrypted))
            .route("/multipart", post(handle_multipart))
            .route("/download/*key", get(handle_download))
            .route("/objects", get(handle_list_objects))
            .route("/objects/*key", delete(handle_delete_object))
            // Presigned URLs
            .route("/presigned-download/*key", get(handle_presigned_download))
            .route("/presigned-upload/*key", get(handle_presigned_upload))
            // Bucket configuration
            .route("/versioning/:bucket", post(handle_enable_versioning))
            .route("/versions/*key", get(handle_list_versions))
            .route("/lifecycle/:bucket", post(handle_set_lifecycle))
            .route("/tag", post(handle_tag));

        Router::new()
            .nest("/api/s3", s3)
            .route("/health", get(handle_health))
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        self.start_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server, stopping when `shutdown` resolves
    pub async fn start_with_shutdown<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub upload_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cleanup: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cleanup_error: Option<String>,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub bucket: String,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct ListObjectsQuery {
    pub prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagQuery {
    pub key: String,
    pub tag_key: String,
    pub tag_value: String,
}

/// `key` and `file` fields of an upload form
struct UploadForm {
    key: String,
    data: Bytes,
    content_type: Option<String>,
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::InvalidRequest(_) | Error::InvalidPartSize { .. } | Error::TooManyParts { .. } => {
            StatusCode::BAD_REQUEST
        }
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        Error::Backend { .. }
        | Error::MalformedResponse(_)
        | Error::Signing(_)
        | Error::Network(_)
        | Error::Initiation { .. }
        | Error::PartUpload { .. }
        | Error::Completion { .. }
        | Error::Abort { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: self.code().to_string(),
                upload_id: None,
                cleanup: None,
                cleanup_error: None,
            }),
        )
            .into_response()
    }
}

impl IntoResponse for UploadFailure {
    fn into_response(self) -> Response {
        let status = status_for(&self.cause);
        let cleanup_error = match &self.cleanup {
            Cleanup::AbortFailed(e) => Some(e.to_string()),
            _ => None,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.cause.to_string(),
                code: self.cause.code().to_string(),
                upload_id: self.upload_id.clone(),
                cleanup: Some(self.cleanup.as_str().to_string()),
                cleanup_error,
            }),
        )
            .into_response()
    }
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm> {
    let mut key = None;
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidRequest(format!("malformed form: {}", e)))?
    {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("key") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| Error::InvalidRequest(format!("invalid key field: {}", e)))?;
                key = Some(text);
            }
            Some("file") => {
                let content_type = field.content_type().map(|c| c.to_string());
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::InvalidRequest(format!("invalid file field: {}", e)))?;
                file = Some((data, content_type));
            }
            _ => {}
        }
    }

    let key = key.ok_or_else(|| Error::InvalidRequest("missing form field: key".into()))?;
    let (data, content_type) =
        file.ok_or_else(|| Error::InvalidRequest("missing form field: file".into()))?;
    Ok(UploadForm {
        key,
        data,
        content_type,
    })
}

// ============ Handlers ============

async fn handle_create_bucket(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<String> {
    state.gateway.create_bucket(&name).await?;
    Ok(format!("Bucket created: {}", name))
}

async fn handle_list_buckets(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>> {
    Ok(Json(state.gateway.list_buckets().await?))
}

async fn handle_delete_bucket(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<String> {
    state.gateway.delete_bucket(&name).await?;
    Ok(format!("Bucket deleted: {}", name))
}

async fn handle_upload(State(state): State<Arc<AppState>>, multipart: Multipart) -> Result<String> {
    let form = read_upload_form(multipart).await?;
    state
        .gateway
        .upload_object(&form.key, form.data, form.content_type)
        .await?;
    Ok(format!("File uploaded successfully: {}", form.key))
}

async fn handle_upload_encrypted(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<String> {
    let form = read_upload_form(multipart).await?;
    state
        .gateway
        .upload_with_encryption(&form.key, form.data)
        .await?;
    Ok(format!("File uploaded with SSE-S3: {}", form.key))
}

async fn handle_multipart(State(state): State<Arc<AppState>>, multipart: Multipart) -> Response {
    let form = match read_upload_form(multipart).await {
        Ok(form) => form,
        Err(e) => return e.into_response(),
    };

    match state.gateway.multipart_upload(&form.key, form.data).await {
        Ok(_) => "Multipart upload complete".into_response(),
        Err(failure) => failure.into_response(),
    }
}

async fn handle_download(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response> {
    let data = state.gateway.download_object(&key).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response())
}

async fn handle_list_objects(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListObjectsQuery>,
) -> Result<Json<Vec<String>>> {
    let keys = state.gateway.list_objects(query.prefix.as_deref()).await?;
    Ok(Json(keys))
}

async fn handle_delete_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<String> {
    state.gateway.delete_object(&key).await?;
    Ok(format!("Object deleted: {}", key))
}

async fn handle_presigned_download(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<String> {
    state.gateway.presigned_download_url(&key).await
}

async fn handle_presigned_upload(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<String> {
    state.gateway.presigned_upload_url(&key).await
}

async fn handle_enable_versioning(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Result<String> {
    state.gateway.enable_versioning(&bucket).await?;
    Ok(format!("Versioning enabled for {}", bucket))
}

async fn handle_list_versions(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Vec<ObjectVersion>>> {
    Ok(Json(state.gateway.list_object_versions(&key).await?))
}

async fn handle_set_lifecycle(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Result<String> {
    state.gateway.set_lifecycle_configuration(&bucket).await?;
    Ok(format!("Lifecycle configuration set for {}", bucket))
}

async fn handle_tag(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TagQuery>,
) -> Result<String> {
    state
        .gateway
        .tag_object(&query.key, &query.tag_key, &query.tag_value)
        .await?;
    Ok(format!("Tag added to {}", query.key))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        bucket: state.gateway.bucket().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WolfStoreConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const BOUNDARY: &str = "wolfstore-test-boundary";

    async fn server() -> HttpServer {
        let config = WolfStoreConfig::from_str("[storage]\nbackend = \"memory\"\nbucket = \"media\"\n").unwrap();
        let gateway = ObjectGateway::from_config(&config).await.unwrap();
        HttpServer::new(config.api.clone(), gateway)
    }

    fn form(key: &str, file: &[u8]) -> Body {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"key\"\r\n\r\n{key}\r\n\
                 --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"f.bin\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                b = BOUNDARY,
                key = key
            )
            .as_bytes(),
        );
        body.extend_from_slice(file);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        Body::from(body)
    }

    fn post_form(uri: &str, key: &str, file: &[u8]) -> Request<Body> {
        Request::post(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(form(key, file))
            .unwrap()
    }

    async fn send(server: &HttpServer, request: Request<Body>) -> (StatusCode, Bytes) {
        let response = server.router().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_upload_download_delete() {
        let server = server().await;

        let (status, body) = send(&server, post_form("/api/s3/upload", "docs/a.txt", b"hello")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"File uploaded successfully: docs/a.txt");

        let (status, body) = send(&server, get("/api/s3/download/docs/a.txt")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"hello");

        let (_, body) = send(&server, get("/api/s3/objects?prefix=docs/")).await;
        let keys: Vec<String> = serde_json::from_slice(&body).unwrap();
        assert_eq!(keys, vec!["docs/a.txt"]);

        let request = Request::delete("/api/s3/objects/docs/a.txt").body(Body::empty()).unwrap();
        let (status, body) = send(&server, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"Object deleted: docs/a.txt");

        let (status, body) = send(&server, get("/api/s3/download/docs/a.txt")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code, "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_multipart_route() {
        let server = server().await;
        let payload = vec![42u8; 6 * 1024 * 1024];

        let (status, body) = send(&server, post_form("/api/s3/multipart", "big.bin", &payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"Multipart upload complete");

        let (_, body) = send(&server, get("/api/s3/download/big.bin")).await;
        assert_eq!(body.len(), payload.len());
    }

    #[tokio::test]
    async fn test_multipart_to_missing_bucket_reports_initiation_failure() {
        let server = server().await;
        let request = Request::delete("/api/s3/buckets/media").body(Body::empty()).unwrap();
        assert_eq!(send(&server, request).await.0, StatusCode::OK);

        let (status, body) = send(&server, post_form("/api/s3/multipart", "a.bin", b"abc")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code, "INITIATION_FAILED");
        assert_eq!(error.cleanup.as_deref(), Some("not_required"));
    }

    #[tokio::test]
    async fn test_missing_form_field_is_bad_request() {
        let server = server().await;
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"key\"\r\n\r\nk\r\n--{b}--\r\n",
            b = BOUNDARY
        );
        let request = Request::post("/api/s3/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();

        let (status, body) = send(&server, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code, "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_bucket_and_configuration_routes() {
        let server = server().await;

        let request = Request::post("/api/s3/buckets/archive").body(Body::empty()).unwrap();
        let (status, body) = send(&server, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"Bucket created: archive");

        let (_, body) = send(&server, get("/api/s3/buckets")).await;
        let buckets: Vec<String> = serde_json::from_slice(&body).unwrap();
        assert_eq!(buckets, vec!["archive", "media"]);

        let request = Request::post("/api/s3/versioning/media").body(Body::empty()).unwrap();
        let (_, body) = send(&server, request).await;
        assert_eq!(&body[..], b"Versioning enabled for media");

        let request = Request::post("/api/s3/lifecycle/media").body(Body::empty()).unwrap();
        let (_, body) = send(&server, request).await;
        assert_eq!(&body[..], b"Lifecycle configuration set for media");

        send(&server, post_form("/api/s3/upload-encrypted", "secret.txt", b"s1")).await;
        send(&server, post_form("/api/s3/upload-encrypted", "secret.txt", b"s2")).await;
        let (_, body) = send(&server, get("/api/s3/versions/secret.txt")).await;
        let versions: Vec<ObjectVersion> = serde_json::from_slice(&body).unwrap();
        assert_eq!(versions.len(), 2);

        let request = Request::post("/api/s3/tag?key=secret.txt&tagKey=env&tagValue=prod")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&server, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"Tag added to secret.txt");
    }

    #[tokio::test]
    async fn test_presigned_and_health() {
        let server = server().await;
        let (status, body) = send(&server, get("/api/s3/presigned-upload/in/box.txt")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("in/box.txt"));

        let (status, body) = send(&server, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert!(health.healthy);
        assert_eq!(health.bucket, "media");
    }
}
