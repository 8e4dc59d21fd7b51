use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::cache::{CacheEntry, CacheStore, EngineStats, EntryStatus, VariantResolver};
use crate::error::CaptureError;
use crate::metrics;
use crate::policy::PolicyModule;
use crate::request::{RequestInfo, ResponseHead};

/// Everything a filter needs to decide and commit; shared per engine.
#[derive(Clone)]
pub struct CaptureContext {
    pub store: CacheStore,
    pub policy: Arc<PolicyModule>,
    pub resolver: VariantResolver,
    pub negative_ttl: Duration,
    pub stats: Arc<EngineStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Tested { should_record: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Committed { key: String, bytes: usize },
    RecordedFailure { key: String },
    Declined { key: String },
    Aborted,
}

impl CaptureOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CaptureOutcome::Committed { .. } => "committed",
            CaptureOutcome::RecordedFailure { .. } => "failed",
            CaptureOutcome::Declined { .. } => "declined",
            CaptureOutcome::Aborted => "aborted",
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            CaptureOutcome::Committed { key, .. }
            | CaptureOutcome::RecordedFailure { key }
            | CaptureOutcome::Declined { key } => Some(key),
            CaptureOutcome::Aborted => None,
        }
    }
}

/// Marks a filter failed from another task. Only sets a flag.
#[derive(Debug, Clone, Default)]
pub struct FailHandle(Arc<AtomicBool>);

impl FailHandle {
    pub fn fail(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Sits in a response's outgoing byte path. Decides on the first non-empty
/// write whether to record; recorded bytes are withheld from the sink until
/// [`close`](Self::close), pass-through bytes go straight out.
pub struct CaptureFilter<W> {
    sink: W,
    ctx: CaptureContext,
    request: RequestInfo,
    ttl: Duration,
    state: CaptureState,
    buffer: BytesMut,
    headers: HeaderMap,
    commit_key: Option<String>,
    failed: FailHandle,
    closed: bool,
    passed_through: usize,
    status: Option<StatusCode>,
}

impl<W> CaptureFilter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// `ttl` is the request-time policy TTL used if the response commits.
    pub fn new(sink: W, ctx: CaptureContext, request: RequestInfo, ttl: Duration) -> Self {
        Self {
            sink,
            ctx,
            request,
            ttl,
            state: CaptureState::Idle,
            buffer: BytesMut::new(),
            headers: HeaderMap::new(),
            commit_key: None,
            failed: FailHandle::default(),
            closed: false,
            passed_through: 0,
            status: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn fail_handle(&self) -> FailHandle {
        self.failed.clone()
    }

    pub fn fail(&self) {
        self.failed.fail();
    }

    pub fn fail_with(&self, cause: &CaptureError) {
        debug!(url = %self.request.url, error = %cause, "capture marked failed");
        self.failed.fail();
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    /// Status of the response seen on the first write, if any.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn bytes_seen(&self) -> usize {
        self.buffer.len() + self.passed_through
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    pub fn into_sink(self) -> W {
        self.sink
    }

    fn test(&mut self, head: &ResponseHead) -> bool {
        let cacheable = self.ctx.policy.decide_response(&self.request, head);
        let should_record = cacheable && head.status == StatusCode::OK;
        self.status = Some(head.status);
        self.commit_key = Some(
            self.ctx
                .resolver
                .commit_key(head.content_encoding(), &self.request.url),
        );
        if should_record {
            self.headers = head.headers.clone();
        }
        trace!(
            url = %self.request.url,
            status = head.status.as_u16(),
            cacheable,
            should_record,
            "capture tested response"
        );
        self.state = CaptureState::Tested { should_record };
        should_record
    }

    /// Forwards or buffers one body chunk.
    pub async fn write(&mut self, head: &ResponseHead, chunk: &[u8]) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let should_record = match self.state {
            CaptureState::Idle => self.test(head),
            CaptureState::Tested { should_record } => should_record,
        };
        if should_record {
            self.buffer.extend_from_slice(chunk);
            return Ok(());
        }
        self.passed_through += chunk.len();
        self.sink.write_all(chunk).await
    }

    /// Delivers withheld bytes and shuts the sink down. Idempotent. A sink
    /// error marks the capture failed.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.flush_and_shutdown().await;
        if let Err(err) = &result {
            warn!(url = %self.request.url, error = %err, "response sink failed during close");
            self.failed.fail();
        }
        result
    }

    async fn flush_and_shutdown(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            self.sink.write_all(&self.buffer).await?;
        }
        self.sink.flush().await?;
        self.sink.shutdown().await
    }

    /// Ends the capture and writes its outcome to the store. Closes first if
    /// the host has not.
    pub async fn finalize(mut self) -> (CaptureOutcome, W) {
        if !self.closed {
            let _ = self.close().await;
        }
        let outcome = self.commit().await;
        (outcome, self.sink)
    }

    async fn commit(&mut self) -> CaptureOutcome {
        let CaptureState::Tested { should_record } = self.state else {
            self.ctx.stats.aborted.incr();
            metrics::record_cache_store("aborted");
            trace!(url = %self.request.url, "capture aborted before any body byte");
            return CaptureOutcome::Aborted;
        };
        let Some(key) = self.commit_key.take() else {
            self.ctx.stats.aborted.incr();
            metrics::record_cache_store("aborted");
            return CaptureOutcome::Aborted;
        };
        let store = &self.ctx.store;
        let outcome = match (should_record, self.failed.is_failed()) {
            (true, false) => {
                let body: Bytes = std::mem::take(&mut self.buffer).freeze();
                let bytes = body.len();
                let entry = CacheEntry::fresh(&self.headers, body);
                store.put(key.clone(), entry, self.ttl).await;
                self.ctx.stats.committed.incr();
                CaptureOutcome::Committed { key, bytes }
            }
            (true, true) => {
                let entry = CacheEntry::negative(EntryStatus::RecordedFailure501);
                store.put(key.clone(), entry, self.ctx.negative_ttl).await;
                self.ctx.stats.recorded_failures.incr();
                CaptureOutcome::RecordedFailure { key }
            }
            (false, _) => {
                let entry = CacheEntry::negative(EntryStatus::DeclinedUncacheable502);
                store.put(key.clone(), entry, self.ctx.negative_ttl).await;
                self.ctx.stats.declined.incr();
                CaptureOutcome::Declined { key }
            }
        };
        metrics::record_cache_store(outcome.label());
        debug!(url = %self.request.url, outcome = outcome.label(), key = ?outcome.key(), "capture finalized");
        outcome
    }
}
