//! WolfStore - Object Storage Gateway
//!
//! A Rust-based gateway that exposes bucket and object operations over HTTP
//! and forwards them to an S3-compatible object storage service.
//!
//! # Architecture
//!
//! Requests enter through the HTTP API, pass through the [`gateway`]
//! facade, and reach the backend through the [`storage`] traits. Large
//! payloads go through the [`upload`] orchestrator, which splits them into
//! parts and guarantees that a failed multipart upload is always aborted.
//!
//! # Features
//!
//! - Multipart uploads with bounded part concurrency, retries and timeouts
//! - Abort-on-failure, including client disconnects and cancellation
//! - Bucket CRUD, object put/get/delete/list
//! - Versioning, lifecycle rules, tagging and SSE-S3 writes
//! - SigV4 presigned GET/PUT URLs
//! - In-memory backend for local development

pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod storage;
pub mod upload;

pub use config::WolfStoreConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfStoreConfig;
    pub use crate::error::{Error, Result};
    pub use crate::gateway::ObjectGateway;
    pub use crate::storage::{MemoryStore, MultipartStore, ObjectStore, S3Client};
    pub use crate::upload::{Cleanup, CompletedUpload, MultipartUploader, UploadFailure, UploadOptions};
}
