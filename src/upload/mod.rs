//! Multipart Upload Module
//!
//! Chunk planning, the per-upload session state machine, and the
//! orchestrator that drives a payload through initiate, part upload and
//! complete (or abort).

pub mod orchestrator;
pub mod planner;
pub mod session;

pub use orchestrator::{
    Cleanup, CompletedUpload, MultipartUploader, UploadFailure, UploadMethod, UploadOptions,
    UploadOutcome,
};
pub use planner::{Chunk, ChunkPlan};
pub use session::{PartResult, SessionState, UploadSession};
