//! Multipart upload orchestration
//!
//! Drives initiate → upload parts → complete, and takes the abort path on
//! any failure after initiation: part errors, completion errors, timeouts,
//! cancellation, or the caller dropping the upload future.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::planner::ChunkPlan;
use super::session::{PartResult, UploadSession};
use crate::config::UploadConfig;
use crate::error::{Error, Result};
use crate::storage::{MultipartStore, PutOptions};

/// Tuning for one uploader
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Size of every part except the last
    pub part_size: u64,
    /// Parts in flight at once
    pub concurrency: usize,
    /// Extra attempts per part for retryable errors
    pub max_retries: u32,
    /// Base delay, doubled per attempt
    pub retry_backoff: Duration,
    /// Bound on each backend call
    pub call_timeout: Option<Duration>,
    /// Bound on uploading all parts plus completion
    pub upload_timeout: Option<Duration>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for UploadOptions {
    fn from(config: &UploadConfig) -> Self {
        Self {
            part_size: config.part_size_bytes,
            concurrency: config.concurrency,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
            call_timeout: config.call_timeout(),
            upload_timeout: config.upload_timeout(),
        }
    }
}

/// How the payload reached the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMethod {
    Multipart,
    /// Empty payloads are stored with a plain put
    SingleShot,
}

/// A finished upload
#[derive(Debug, Clone, Serialize)]
pub struct CompletedUpload {
    pub bucket: String,
    pub key: String,
    pub upload_id: Option<String>,
    pub parts: Vec<PartResult>,
    pub total_bytes: u64,
    pub method: UploadMethod,
}

/// What happened to the remote upload after a failure
#[derive(Debug)]
pub enum Cleanup {
    /// No upload was open
    NotRequired,
    /// The upload was aborted
    Aborted,
    /// The abort call itself failed; the upload may be left on the backend
    AbortFailed(Error),
}

impl Cleanup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cleanup::NotRequired => "not_required",
            Cleanup::Aborted => "aborted",
            Cleanup::AbortFailed(_) => "abort_failed",
        }
    }
}

/// A failed upload. `cause` is always the triggering failure; the cleanup
/// result is advisory.
#[derive(Debug)]
pub struct UploadFailure {
    pub cause: Error,
    pub upload_id: Option<String>,
    pub cleanup: Cleanup,
}

impl UploadFailure {
    fn before_initiation(cause: Error) -> Self {
        Self {
            cause,
            upload_id: None,
            cleanup: Cleanup::NotRequired,
        }
    }

    pub fn into_error(self) -> Error {
        self.cause
    }
}

impl fmt::Display for UploadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)?;
        if let Cleanup::AbortFailed(e) = &self.cleanup {
            write!(f, " (cleanup failed: {})", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for UploadFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

pub type UploadOutcome = std::result::Result<CompletedUpload, UploadFailure>;

/// Uploads payloads to one bucket through a [`MultipartStore`]
pub struct MultipartUploader<S: MultipartStore + ?Sized> {
    store: Arc<S>,
    bucket: String,
    options: UploadOptions,
}

impl<S: MultipartStore + ?Sized> Clone for MultipartUploader<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            bucket: self.bucket.clone(),
            options: self.options.clone(),
        }
    }
}

impl<S: MultipartStore + ?Sized + 'static> MultipartUploader<S> {
    pub fn new(store: Arc<S>, bucket: impl Into<String>, options: UploadOptions) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            options,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// Upload `payload` to `key`
    pub async fn upload(&self, key: &str, payload: Bytes) -> UploadOutcome {
        self.upload_with_cancel(key, payload, CancellationToken::new()).await
    }

    /// Upload `payload` to `key`, aborting if `cancel` fires first
    pub async fn upload_with_cancel(
        &self,
        key: &str,
        payload: Bytes,
        cancel: CancellationToken,
    ) -> UploadOutcome {
        if key.is_empty() {
            return Err(UploadFailure::before_initiation(Error::InvalidRequest(
                "object key cannot be empty".into(),
            )));
        }

        let minimum = self.store.min_part_size();
        if self.options.part_size < minimum {
            return Err(UploadFailure::before_initiation(Error::InvalidPartSize {
                part_size: self.options.part_size,
                minimum,
            }));
        }

        let plan = ChunkPlan::new(payload.len() as u64, self.options.part_size)
            .map_err(UploadFailure::before_initiation)?;

        if plan.is_empty() {
            return self.put_empty(key, payload, &cancel).await;
        }

        let upload_id = match self.initiate(key, &cancel).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to initiate multipart upload for {}: {}", key, e);
                return Err(UploadFailure::before_initiation(Error::Initiation {
                    key: key.to_string(),
                    source: Box::new(e),
                }));
            }
        };
        info!(
            "Initiated multipart upload {} for {}/{} ({} bytes in {} parts)",
            upload_id,
            self.bucket,
            key,
            plan.payload_len(),
            plan.len()
        );

        let mut guard = AbortOnDrop::new(
            Arc::clone(&self.store),
            &self.bucket,
            key,
            &upload_id,
            self.options.call_timeout,
        );
        let mut session = UploadSession::new(key, upload_id.as_str(), plan.len() as u32);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.run_session(&mut session, &plan, &payload) => result,
        };

        match result {
            Ok(()) => {
                guard.disarm();
                info!(
                    "Completed multipart upload {} for {}/{} ({} parts)",
                    upload_id,
                    self.bucket,
                    key,
                    session.planned_parts()
                );
                Ok(CompletedUpload {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                    upload_id: Some(upload_id),
                    parts: session.parts().cloned().collect(),
                    total_bytes: plan.payload_len(),
                    method: UploadMethod::Multipart,
                })
            }
            Err(cause) => {
                error!("Multipart upload {} for {} failed: {}", upload_id, key, cause);
                if let Err(e) = session.mark_failed() {
                    debug!("Session {} not marked failed: {}", upload_id, e);
                }

                // Spawned so the abort outlives a dropped caller
                guard.disarm();
                let abort = tokio::spawn(abort_upload(
                    Arc::clone(&self.store),
                    self.bucket.clone(),
                    key.to_string(),
                    upload_id.clone(),
                    self.options.call_timeout,
                ));
                let aborted = match abort.await {
                    Ok(result) => result,
                    Err(e) => Err(Error::Internal(format!("abort task failed: {}", e))),
                };

                let cleanup = match aborted {
                    Ok(()) => Cleanup::Aborted,
                    Err(e) => {
                        warn!("Failed to abort multipart upload {} for {}: {}", upload_id, key, e);
                        Cleanup::AbortFailed(Error::Abort {
                            key: key.to_string(),
                            upload_id: upload_id.clone(),
                            source: Box::new(e),
                        })
                    }
                };
                // Abort was attempted either way
                if let Err(e) = session.mark_aborted() {
                    debug!("Session {} not marked aborted: {}", upload_id, e);
                }

                Err(UploadFailure {
                    cause,
                    upload_id: Some(upload_id),
                    cleanup,
                })
            }
        }
    }

    async fn put_empty(&self, key: &str, payload: Bytes, cancel: &CancellationToken) -> UploadOutcome {
        let put = with_timeout(
            self.options.call_timeout,
            self.store
                .put_object(&self.bucket, key, payload, PutOptions::default()),
            || format!("put of empty object {}", key),
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = put => result,
        };

        match result {
            Ok(_) => {
                info!("Stored empty object {}/{} with a single put", self.bucket, key);
                Ok(CompletedUpload {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                    upload_id: None,
                    parts: Vec::new(),
                    total_bytes: 0,
                    method: UploadMethod::SingleShot,
                })
            }
            Err(e) => Err(UploadFailure::before_initiation(e)),
        }
    }

    async fn initiate(&self, key: &str, cancel: &CancellationToken) -> Result<String> {
        let call = with_timeout(
            self.options.call_timeout,
            self.store.initiate_upload(&self.bucket, key),
            || format!("initiate multipart upload for {}", key),
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = call => result,
        }
    }

    /// Upload every part, then complete, under the optional upload deadline
    async fn run_session(
        &self,
        session: &mut UploadSession,
        plan: &ChunkPlan,
        payload: &Bytes,
    ) -> Result<()> {
        let key = session.key().to_string();
        let work = async {
            self.upload_parts(session, plan, payload).await?;
            self.complete(session).await
        };

        match self.options.upload_timeout {
            Some(limit) => timeout(limit, work)
                .await
                .map_err(|_| Error::Timeout(format!("upload of {} exceeded {:?}", key, limit)))?,
            None => work.await,
        }
    }

    async fn upload_parts(
        &self,
        session: &mut UploadSession,
        plan: &ChunkPlan,
        payload: &Bytes,
    ) -> Result<()> {
        session.begin_uploading()?;
        let key = session.key().to_string();
        let upload_id = session.upload_id().to_string();

        let requests: Vec<(u32, Bytes)> = plan
            .parts()
            .iter()
            .map(|chunk| {
                let data = payload.slice(chunk.range.start as usize..chunk.range.end as usize);
                (chunk.part_number, data)
            })
            .collect();

        // Owned items keep the stream future Send
        let key_ref = key.as_str();
        let upload_id_ref = upload_id.as_str();
        let in_flight = stream::iter(requests)
            .map(move |(part_number, data)| self.upload_part(key_ref, upload_id_ref, part_number, data))
            .buffer_unordered(self.options.concurrency.max(1));
        let mut in_flight = std::pin::pin!(in_flight);

        // First failure drops the stream, cancelling the parts still in flight
        while let Some(result) = in_flight.next().await {
            session.record_part(result?)?;
        }
        Ok(())
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<PartResult> {
        let size = data.len() as u64;
        let mut attempt = 0u32;

        loop {
            let call = self
                .store
                .upload_part(&self.bucket, key, upload_id, part_number, data.clone());
            let result = with_timeout(self.options.call_timeout, call, || {
                format!("upload of part {} of {}", part_number, key)
            })
            .await;

            match result {
                Ok(etag) => {
                    debug!("Uploaded part {} of {} ({} bytes)", part_number, key, size);
                    return Ok(PartResult {
                        part_number,
                        etag,
                        size,
                    });
                }
                Err(e) if e.is_retryable() && attempt < self.options.max_retries => {
                    let delay = backoff_delay(self.options.retry_backoff, attempt);
                    attempt += 1;
                    warn!(
                        "Part {} of {} failed (attempt {}/{}), retrying in {:?}: {}",
                        part_number,
                        key,
                        attempt,
                        self.options.max_retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(Error::PartUpload {
                        key: key.to_string(),
                        part_number,
                        source: Box::new(e),
                    })
                }
            }
        }
    }

    async fn complete(&self, session: &mut UploadSession) -> Result<()> {
        let manifest = session.completion_manifest()?;
        let key = session.key().to_string();
        let upload_id = session.upload_id().to_string();

        let call = self
            .store
            .complete_upload(&self.bucket, &key, &upload_id, &manifest);
        with_timeout(self.options.call_timeout, call, || {
            format!("completion of multipart upload {}", upload_id)
        })
        .await
        .map_err(|e| Error::Completion {
            key: key.clone(),
            upload_id: upload_id.clone(),
            source: Box::new(e),
        })?;

        session.mark_completed()
    }

}

async fn abort_upload<S: MultipartStore + ?Sized>(
    store: Arc<S>,
    bucket: String,
    key: String,
    upload_id: String,
    call_timeout: Option<Duration>,
) -> Result<()> {
    let result = with_timeout(
        call_timeout,
        store.abort_upload(&bucket, &key, &upload_id),
        || format!("abort of multipart upload {}", upload_id),
    )
    .await;
    if result.is_ok() {
        info!("Aborted multipart upload {} for {}/{}", upload_id, bucket, key);
    }
    result
}

async fn with_timeout<T, F>(limit: Option<Duration>, fut: F, what: impl FnOnce() -> String) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => match timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(what())),
        },
        None => fut.await,
    }
}

/// `base * 2^attempt` plus up to half of `base` in jitter
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponential = base.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let jitter_ms = (base.as_millis() as u64) / 2;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    } else {
        Duration::ZERO
    };
    exponential + jitter
}

/// Spawns a best-effort abort if dropped while armed, so a cancelled
/// request future does not leave the upload open on the backend.
struct AbortOnDrop<S: MultipartStore + ?Sized + 'static> {
    store: Arc<S>,
    bucket: String,
    key: String,
    upload_id: String,
    call_timeout: Option<Duration>,
    armed: bool,
}

impl<S: MultipartStore + ?Sized + 'static> AbortOnDrop<S> {
    fn new(store: Arc<S>, bucket: &str, key: &str, upload_id: &str, call_timeout: Option<Duration>) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            call_timeout,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<S: MultipartStore + ?Sized + 'static> Drop for AbortOnDrop<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    "Multipart upload {} for {} dropped outside a runtime, left open",
                    self.upload_id, self.key
                );
                return;
            }
        };

        let store = Arc::clone(&self.store);
        let bucket = std::mem::take(&mut self.bucket);
        let key = std::mem::take(&mut self.key);
        let upload_id = std::mem::take(&mut self.upload_id);
        warn!("Multipart upload {} for {} dropped, aborting", upload_id, key);

        let call_timeout = self.call_timeout;
        handle.spawn(async move {
            let abandoned = upload_id.clone();
            if let Err(e) = abort_upload(store, bucket, key, upload_id, call_timeout).await {
                warn!("Failed to abort abandoned upload {}: {}", abandoned, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CompletedPart, MemoryStore, ObjectStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const P: u64 = 8;
    const BUCKET: &str = "media";

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Initiate,
        Part(u32),
        Complete(String, Vec<u32>),
        Abort(String, String),
        Put,
    }

    /// MemoryStore wrapper that records calls and injects failures
    #[derive(Default)]
    struct FaultyStore {
        inner: Arc<MemoryStore>,
        fail_initiate: bool,
        fail_part: Option<u32>,
        /// part number -> remaining retryable failures
        transient: Mutex<HashMap<u32, u32>>,
        fail_complete: bool,
        fail_abort: bool,
        part_delay: Option<Duration>,
        abort_delay: Option<Duration>,
        calls: Mutex<Vec<Call>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FaultyStore {
        async fn new() -> Self {
            let inner = MemoryStore::with_min_part_size(P);
            inner.create_bucket(BUCKET).await.unwrap();
            Self {
                inner: Arc::new(inner),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn aborts(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|c| matches!(c, Call::Abort(..)))
                .collect()
        }

        fn completes(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|c| matches!(c, Call::Complete(..)))
                .collect()
        }
    }

    fn permanent(what: &str) -> Error {
        Error::Backend {
            status: 400,
            code: "InvalidArgument".into(),
            message: what.into(),
        }
    }

    #[async_trait]
    impl MultipartStore for FaultyStore {
        async fn initiate_upload(&self, bucket: &str, key: &str) -> Result<String> {
            self.record(Call::Initiate);
            if self.fail_initiate {
                return Err(permanent("initiate"));
            }
            self.inner.initiate_upload(bucket, key).await
        }

        async fn upload_part(
            &self,
            bucket: &str,
            key: &str,
            upload_id: &str,
            part_number: u32,
            data: Bytes,
        ) -> Result<String> {
            self.record(Call::Part(part_number));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.part_delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_part == Some(part_number) {
                return Err(permanent("part"));
            }
            {
                let mut transient = self.transient.lock().unwrap();
                if let Some(remaining) = transient.get_mut(&part_number) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(Error::Network("connection reset by peer".into()));
                    }
                }
            }
            self.inner
                .upload_part(bucket, key, upload_id, part_number, data)
                .await
        }

        async fn complete_upload(
            &self,
            bucket: &str,
            key: &str,
            upload_id: &str,
            parts: &[CompletedPart],
        ) -> Result<()> {
            self.record(Call::Complete(
                upload_id.to_string(),
                parts.iter().map(|p| p.part_number).collect(),
            ));
            if self.fail_complete {
                return Err(permanent("complete"));
            }
            self.inner.complete_upload(bucket, key, upload_id, parts).await
        }

        async fn abort_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
            self.record(Call::Abort(key.to_string(), upload_id.to_string()));
            if let Some(delay) = self.abort_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_abort {
                return Err(Error::Network("abort failed".into()));
            }
            self.inner.abort_upload(bucket, key, upload_id).await
        }

        async fn put_object(&self, bucket: &str, key: &str, data: Bytes, options: PutOptions) -> Result<String> {
            self.record(Call::Put);
            self.inner.put_object(bucket, key, data, options).await
        }

        fn min_part_size(&self) -> u64 {
            self.inner.min_part_size()
        }
    }

    fn options() -> UploadOptions {
        UploadOptions {
            part_size: P,
            concurrency: 1,
            max_retries: 0,
            retry_backoff: Duration::from_millis(1),
            call_timeout: None,
            upload_timeout: None,
        }
    }

    fn uploader(store: &Arc<FaultyStore>, options: UploadOptions) -> MultipartUploader<FaultyStore> {
        MultipartUploader::new(Arc::clone(store), BUCKET, options)
    }

    fn payload(len: u64) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[tokio::test]
    async fn test_two_full_parts() {
        let store = Arc::new(FaultyStore::new().await);
        let done = uploader(&store, options()).upload("clip", payload(2 * P)).await.unwrap();

        assert_eq!(done.method, UploadMethod::Multipart);
        assert_eq!(done.parts.len(), 2);
        assert!(done.parts.iter().all(|p| p.size == P));
        let upload_id = done.upload_id.clone().unwrap();
        assert_eq!(store.completes(), vec![Call::Complete(upload_id, vec![1, 2])]);
        assert!(store.aborts().is_empty());
    }

    #[tokio::test]
    async fn test_payload_smaller_than_part_uses_one_part() {
        let store = Arc::new(FaultyStore::new().await);
        let done = uploader(&store, options()).upload("small", payload(P - 1)).await.unwrap();

        assert_eq!(done.parts.len(), 1);
        assert_eq!(done.parts[0].size, P - 1);
        assert_eq!(store.calls()[0], Call::Initiate);
        assert_eq!(store.calls()[1], Call::Part(1));
        assert!(matches!(store.calls()[2], Call::Complete(_, ref parts) if parts == &vec![1]));
    }

    #[tokio::test]
    async fn test_round_trip_through_get_object() {
        let store = Arc::new(FaultyStore::new().await);
        let data = payload(5 * P + 3);
        uploader(&store, UploadOptions { concurrency: 3, ..options() })
            .upload("big", data.clone())
            .await
            .unwrap();

        assert_eq!(store.inner.get_object(BUCKET, "big").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_part_failure_aborts_once() {
        let store = Arc::new(FaultyStore {
            fail_part: Some(2),
            ..FaultyStore::new().await
        });
        let failure = uploader(&store, options())
            .upload("clip", payload(3 * P))
            .await
            .unwrap_err();

        let upload_id = failure.upload_id.clone().unwrap();
        assert!(matches!(failure.cause, Error::PartUpload { part_number: 2, .. }));
        assert!(matches!(failure.cleanup, Cleanup::Aborted));
        assert_eq!(store.aborts(), vec![Call::Abort("clip".into(), upload_id)]);
        assert!(store.completes().is_empty());
        // Sequential upload stops at the failing part
        assert!(!store.calls().contains(&Call::Part(3)));
        assert_eq!(store.inner.pending_uploads().await, 0);
    }

    #[tokio::test]
    async fn test_completion_failure_is_not_masked_by_abort_failure() {
        let store = Arc::new(FaultyStore {
            fail_complete: true,
            fail_abort: true,
            ..FaultyStore::new().await
        });
        let failure = uploader(&store, options())
            .upload("clip", payload(2 * P))
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::Completion { .. }));
        assert!(matches!(failure.cleanup, Cleanup::AbortFailed(Error::Abort { .. })));
        assert_eq!(store.aborts().len(), 1);
        assert!(failure.to_string().contains("cleanup failed"));
    }

    #[tokio::test]
    async fn test_completion_failure_aborts() {
        let store = Arc::new(FaultyStore {
            fail_complete: true,
            ..FaultyStore::new().await
        });
        let failure = uploader(&store, options())
            .upload("clip", payload(P))
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::Completion { .. }));
        assert!(matches!(failure.cleanup, Cleanup::Aborted));
        assert_eq!(store.inner.pending_uploads().await, 0);
    }

    #[tokio::test]
    async fn test_initiation_failure_needs_no_abort() {
        let store = Arc::new(FaultyStore {
            fail_initiate: true,
            ..FaultyStore::new().await
        });
        let failure = uploader(&store, options())
            .upload("clip", payload(P))
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::Initiation { .. }));
        assert!(matches!(failure.cleanup, Cleanup::NotRequired));
        assert!(failure.upload_id.is_none());
        assert_eq!(store.calls(), vec![Call::Initiate]);
    }

    #[tokio::test]
    async fn test_concurrent_parts_complete_sorted() {
        let store = Arc::new(FaultyStore {
            part_delay: Some(Duration::from_millis(5)),
            ..FaultyStore::new().await
        });
        let done = uploader(&store, UploadOptions { concurrency: 4, ..options() })
            .upload("clip", payload(10 * P))
            .await
            .unwrap();

        let numbers: Vec<u32> = done.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, (1..=10).collect::<Vec<u32>>());
        assert!(matches!(
            &store.completes()[0],
            Call::Complete(_, parts) if parts == &(1..=10).collect::<Vec<u32>>()
        ));
        let peak = store.max_in_flight.load(Ordering::SeqCst);
        assert!(peak > 1 && peak <= 4, "peak in flight was {}", peak);
    }

    #[tokio::test]
    async fn test_transient_part_failures_are_retried() {
        let store = Arc::new(FaultyStore::new().await);
        store.transient.lock().unwrap().insert(2, 2);

        uploader(&store, UploadOptions { max_retries: 2, ..options() })
            .upload("clip", payload(3 * P))
            .await
            .unwrap();

        let attempts = store.calls().iter().filter(|c| **c == Call::Part(2)).count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_part() {
        let store = Arc::new(FaultyStore::new().await);
        store.transient.lock().unwrap().insert(1, 5);

        let failure = uploader(&store, UploadOptions { max_retries: 1, ..options() })
            .upload("clip", payload(P))
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::PartUpload { part_number: 1, .. }));
        assert_eq!(store.calls().iter().filter(|c| **c == Call::Part(1)).count(), 2);
        assert_eq!(store.aborts().len(), 1);
    }

    #[tokio::test]
    async fn test_call_timeout_takes_abort_path() {
        let store = Arc::new(FaultyStore {
            part_delay: Some(Duration::from_millis(200)),
            ..FaultyStore::new().await
        });
        let failure = uploader(
            &store,
            UploadOptions {
                call_timeout: Some(Duration::from_millis(20)),
                ..options()
            },
        )
        .upload("clip", payload(P))
        .await
        .unwrap_err();

        match failure.cause {
            Error::PartUpload { source, .. } => assert!(matches!(*source, Error::Timeout(_))),
            other => panic!("unexpected cause: {}", other),
        }
        assert!(matches!(failure.cleanup, Cleanup::Aborted));
    }

    #[tokio::test]
    async fn test_cancellation_aborts() {
        let store = Arc::new(FaultyStore {
            part_delay: Some(Duration::from_millis(200)),
            ..FaultyStore::new().await
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let failure = uploader(&store, options())
            .upload_with_cancel("clip", payload(2 * P), cancel)
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::Cancelled));
        assert_eq!(store.aborts().len(), 1);
        assert!(store.completes().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_upload_is_aborted() {
        let store = Arc::new(FaultyStore {
            part_delay: Some(Duration::from_millis(500)),
            ..FaultyStore::new().await
        });
        let up = uploader(&store, options());
        let task = tokio::spawn(async move { up.upload("clip", payload(2 * P)).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.aborts().len(), 1);
        assert_eq!(store.inner.pending_uploads().await, 0);
    }

    #[tokio::test]
    async fn test_drop_during_abort_does_not_abort_twice() {
        let store = Arc::new(FaultyStore {
            fail_part: Some(1),
            abort_delay: Some(Duration::from_millis(200)),
            ..FaultyStore::new().await
        });
        let up = uploader(&store, options());
        let task = tokio::spawn(async move { up.upload("clip", payload(2 * P)).await });

        // Part 1 fails at once; the caller goes away while the abort is pending
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.aborts().len(), 1);
        assert_eq!(store.inner.pending_uploads().await, 0);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_upload_future_is_send() {
        let store = Arc::new(FaultyStore::new().await);
        let up = uploader(&store, UploadOptions { concurrency: 2, ..options() });
        let upload = up.upload("clip", payload(3 * P));
        assert_send(&upload);
        upload.await.unwrap();

        let shared: Arc<dyn MultipartStore> = store.clone();
        let dyn_up = MultipartUploader::new(shared, BUCKET, options());
        let upload = dyn_up.upload("clip", payload(P));
        assert_send(&upload);
        upload.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_payload_uses_single_put() {
        let store = Arc::new(FaultyStore::new().await);
        let done = uploader(&store, options()).upload("empty", Bytes::new()).await.unwrap();

        assert_eq!(done.method, UploadMethod::SingleShot);
        assert!(done.upload_id.is_none());
        assert_eq!(store.calls(), vec![Call::Put]);
        assert!(store.inner.get_object(BUCKET, "empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_part_size_below_backend_minimum() {
        let store = Arc::new(FaultyStore::new().await);
        let failure = uploader(&store, UploadOptions { part_size: P - 1, ..options() })
            .upload("clip", payload(P))
            .await
            .unwrap_err();

        assert!(matches!(failure.cause, Error::InvalidPartSize { .. }));
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let base = Duration::from_millis(100);
        let first = backoff_delay(base, 0);
        let third = backoff_delay(base, 2);
        assert!(first >= base && first <= base + base / 2);
        assert!(third >= base * 4 && third <= base * 4 + base / 2);
    }
}
