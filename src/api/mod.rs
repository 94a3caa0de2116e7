//! HTTP API Module
//!
//! Provides the REST API for bucket, object and multipart operations.

mod http;

pub use http::{AppState, ErrorResponse, HealthResponse, HttpServer};
