//! Upload session state machine
//!
//! ```text
//! Initiated ──> Uploading ──> Completed
//!     │             │
//!     └──> Failed <─┘
//!            │
//!            └──> Aborted   (also reachable from Initiated / Uploading)
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::CompletedPart;

/// Lifecycle of one multipart upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Initiated,
    Uploading,
    Completed,
    Failed,
    Aborted,
}

impl SessionState {
    /// Completed and Aborted are the only states a session may end in
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Initiated => "Initiated",
            SessionState::Uploading => "Uploading",
            SessionState::Completed => "Completed",
            SessionState::Failed => "Failed",
            SessionState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// A successfully uploaded part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartResult {
    pub part_number: u32,
    /// Backend integrity token (ETag)
    pub etag: String,
    pub size: u64,
}

/// In-memory record of one in-flight multipart upload
#[derive(Debug)]
pub struct UploadSession {
    key: String,
    upload_id: String,
    planned_parts: u32,
    parts: BTreeMap<u32, PartResult>,
    state: SessionState,
}

impl UploadSession {
    pub fn new(key: impl Into<String>, upload_id: impl Into<String>, planned_parts: u32) -> Self {
        Self {
            key: key.into(),
            upload_id: upload_id.into(),
            planned_parts,
            parts: BTreeMap::new(),
            state: SessionState::Initiated,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn planned_parts(&self) -> u32 {
        self.planned_parts
    }

    /// Recorded parts in part-number order
    pub fn parts(&self) -> impl Iterator<Item = &PartResult> {
        self.parts.values()
    }

    pub fn recorded_bytes(&self) -> u64 {
        self.parts.values().map(|p| p.size).sum()
    }

    fn transition(&mut self, allowed: &[SessionState], to: SessionState) -> Result<()> {
        if !allowed.contains(&self.state) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn begin_uploading(&mut self) -> Result<()> {
        self.transition(&[SessionState::Initiated], SessionState::Uploading)
    }

    /// Record a finished part. Results are immutable once recorded.
    pub fn record_part(&mut self, part: PartResult) -> Result<()> {
        if self.state != SessionState::Uploading {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: SessionState::Uploading.to_string(),
            });
        }
        if part.part_number == 0 || part.part_number > self.planned_parts {
            return Err(Error::InvalidRequest(format!(
                "part {} is outside the plan of {} parts",
                part.part_number, self.planned_parts
            )));
        }
        if self.parts.contains_key(&part.part_number) {
            return Err(Error::DuplicatePart(part.part_number));
        }

        self.parts.insert(part.part_number, part);
        Ok(())
    }

    /// Part list for the complete call, sorted by part number.
    /// Fails unless every planned part has been recorded.
    pub fn completion_manifest(&self) -> Result<Vec<CompletedPart>> {
        let missing: Vec<u32> = (1..=self.planned_parts)
            .filter(|n| !self.parts.contains_key(n))
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingParts(missing));
        }

        Ok(self
            .parts
            .values()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect())
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        self.completion_manifest()?;
        self.transition(&[SessionState::Uploading], SessionState::Completed)
    }

    pub fn mark_failed(&mut self) -> Result<()> {
        self.transition(
            &[SessionState::Initiated, SessionState::Uploading],
            SessionState::Failed,
        )
    }

    pub fn mark_aborted(&mut self) -> Result<()> {
        self.transition(
            &[
                SessionState::Initiated,
                SessionState::Uploading,
                SessionState::Failed,
            ],
            SessionState::Aborted,
        )
    }
}
