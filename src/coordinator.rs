use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::header::ACCEPT_ENCODING;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tokio::io::AsyncWrite;
use tracing::{debug, trace};

use crate::cache::{EntryStatus, MAX_TTL};
use crate::capture::{CaptureContext, CaptureFilter, CaptureOutcome, FailHandle};
use crate::error::CaptureError;
use crate::logging::CacheLogBuilder;
use crate::metrics;
use crate::request::{RequestInfo, X_AGE, X_CACHE};

/// A response answered from cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Hit,
    Miss,
    /// A recent failed or declined capture is remembered for this URL.
    Negative,
    /// Background refresh; lookup skipped.
    Refresh,
    Bypass(BypassReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Method,
    Conditional,
    Ineligible,
}

impl Lookup {
    pub fn label(&self) -> &'static str {
        match self {
            Lookup::Hit => "hit",
            Lookup::Miss => "miss",
            Lookup::Negative => "negative",
            Lookup::Refresh => "refresh",
            Lookup::Bypass(_) => "bypass",
        }
    }
}

pub enum RequestStart {
    /// Serve this and skip the handler. The scope still goes to
    /// [`Coordinator::on_request_end`], which logs the hit.
    Complete(CachedResponse, RequestScope),
    /// Run the handler; keep the scope for the remaining hooks.
    Continue(RequestScope),
}

/// Per-request state carried between the host hooks.
#[derive(Debug)]
pub struct RequestScope {
    request: RequestInfo,
    started: Instant,
    lookup: Lookup,
    ttl: Option<Duration>,
    fail: Option<FailHandle>,
    /// Body length of a response served from cache.
    served_bytes: Option<usize>,
}

impl RequestScope {
    pub fn lookup(&self) -> Lookup {
        self.lookup
    }

    /// Whether a capture filter will be attached for this request.
    pub fn is_capturing(&self) -> bool {
        self.ttl.is_some()
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }
}

/// Orchestrates lookup, capture, and finalize for each request. Holds no
/// per-request state of its own.
#[derive(Clone)]
pub struct Coordinator {
    ctx: CaptureContext,
}

impl Coordinator {
    pub fn new(ctx: CaptureContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &CaptureContext {
        &self.ctx
    }

    /// Answers from cache or lets the request proceed.
    pub async fn on_request_start(&self, request: RequestInfo) -> RequestStart {
        let started = Instant::now();
        let background = request.is_background();

        let bypass = if request.method != Method::GET {
            Some(BypassReason::Method)
        } else if request.is_conditional() {
            Some(BypassReason::Conditional)
        } else {
            None
        };
        if let Some(reason) = bypass {
            trace!(url = %request.url, ?reason, "cache bypassed");
            metrics::record_cache_lookup("bypass");
            return RequestStart::Continue(RequestScope {
                request,
                started,
                lookup: Lookup::Bypass(reason),
                ttl: None,
                fail: None,
                served_bytes: None,
            });
        }

        let ttl = self.ctx.policy.decide_request(&request);
        if ttl <= 0 {
            metrics::record_cache_lookup("bypass");
            return RequestStart::Continue(RequestScope {
                request,
                started,
                lookup: Lookup::Bypass(BypassReason::Ineligible),
                ttl: None,
                fail: None,
                served_bytes: None,
            });
        }
        let ttl = Duration::from_secs(ttl as u64).min(MAX_TTL);

        if background {
            debug!(url = %request.url, "background refresh request; skipping lookup");
            metrics::record_cache_lookup("refresh");
            return RequestStart::Continue(RequestScope {
                request,
                started,
                lookup: Lookup::Refresh,
                ttl: Some(ttl),
                fail: None,
                served_bytes: None,
            });
        }

        let accept = request.header_str(&ACCEPT_ENCODING);
        for key in self.ctx.resolver.candidates(accept, &request.url) {
            let Some(entry) = self.ctx.store.get(&key).await else {
                continue;
            };
            if entry.status() != EntryStatus::Fresh200 {
                trace!(key, status = ?entry.status(), "negative cache entry; not capturing");
                metrics::record_cache_lookup("negative");
                self.ctx.stats.misses.incr();
                return RequestStart::Continue(RequestScope {
                    request,
                    started,
                    lookup: Lookup::Negative,
                    ttl: None,
                    fail: None,
                    served_bytes: None,
                });
            }

            self.ctx.stats.hits.incr();
            metrics::record_cache_lookup("hit");
            let response = hit_response(&entry, SystemTime::now());
            let scope = RequestScope {
                request,
                started,
                lookup: Lookup::Hit,
                ttl: None,
                fail: None,
                served_bytes: Some(response.body.len()),
            };
            return RequestStart::Complete(response, scope);
        }

        self.ctx.stats.misses.incr();
        metrics::record_cache_lookup("miss");
        RequestStart::Continue(RequestScope {
            request,
            started,
            lookup: Lookup::Miss,
            ttl: Some(ttl),
            fail: None,
            served_bytes: None,
        })
    }

    /// Wraps the response sink in a capture filter when the request is
    /// capturing; otherwise hands the sink back untouched.
    pub fn attach_response_filter<W>(
        &self,
        scope: &mut RequestScope,
        sink: W,
    ) -> Result<CaptureFilter<W>, W>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(ttl) = scope.ttl else {
            return Err(sink);
        };
        let filter = CaptureFilter::new(sink, self.ctx.clone(), scope.request.clone(), ttl);
        scope.fail = Some(filter.fail_handle());
        Ok(filter)
    }

    /// Marks the attached filter failed. Safe to call while a write is in
    /// progress on another task.
    pub fn on_error(&self, scope: &RequestScope, cause: &CaptureError) {
        debug!(url = %scope.request.url, error = %cause, "request failed mid-response");
        if let Some(fail) = &scope.fail {
            fail.fail();
        }
    }

    /// Finalizes the filter, if one was attached, and logs the request. Called
    /// once per request, hits included.
    pub async fn on_request_end<W>(
        &self,
        scope: RequestScope,
        filter: Option<CaptureFilter<W>>,
    ) -> Option<(CaptureOutcome, W)>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let RequestScope {
            request,
            started,
            lookup,
            served_bytes,
            ..
        } = scope;
        let mut log = CacheLogBuilder::new(request.method.as_str(), request.url.as_str())
            .lookup(lookup.label())
            .background(request.is_background());

        let finished = match filter {
            Some(filter) => {
                let status = filter.response_status();
                let bytes = filter.bytes_seen();
                let (outcome, sink) = filter.finalize().await;
                log = log.store(outcome.label()).bytes(bytes as u64);
                if let Some(status) = status {
                    log = log.status(status.as_u16());
                }
                Some((outcome, sink))
            }
            None => {
                if let Some(bytes) = served_bytes {
                    log = log.status(StatusCode::OK.as_u16()).bytes(bytes as u64);
                }
                None
            }
        };

        log.elapsed(started.elapsed()).log();
        finished
    }
}

/// Adds `X-Cache: MISS` to a response that is being captured.
pub fn mark_miss(headers: &mut HeaderMap) {
    headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
}

fn hit_response(entry: &crate::cache::CacheEntry, now: SystemTime) -> CachedResponse {
    let mut headers = entry.headers().clone();
    let age = entry.age(now);
    let age_secs = (age.as_millis() + 500) / 1000;
    headers.insert(X_CACHE, HeaderValue::from_static("HIT"));
    headers.insert(X_AGE, HeaderValue::from(age_secs as u64));
    CachedResponse {
        status: StatusCode::OK,
        headers,
        body: entry.body().cloned().unwrap_or_default(),
    }
}
