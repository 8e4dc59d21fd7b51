use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use http::header::ACCEPT_ENCODING;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::cache::{EngineStats, NO_ENCODING, split_variant_key};
use crate::metrics;
use crate::request::{BACKGROUND_HEADER, RequestInfo};

/// Issues a request into the host pipeline. Background fetches carry
/// [`BACKGROUND_HEADER`] so the coordinator skips lookup and captures afresh.
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    async fn fetch(&self, request: RequestInfo) -> Result<()>;
}

/// Deduplicating FIFO of keys awaiting a background refetch.
#[derive(Clone)]
pub struct RefreshQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    pending: Mutex<HashSet<String>>,
    tx: mpsc::UnboundedSender<String>,
    stats: Arc<EngineStats>,
}

/// Receiving half, consumed by [`RefreshQueue::spawn_worker`].
pub struct RefreshReceiver {
    rx: mpsc::UnboundedReceiver<String>,
}

impl RefreshQueue {
    pub fn new(stats: Arc<EngineStats>) -> (Self, RefreshReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(HashSet::new()),
                tx,
                stats,
            }),
        };
        (queue, RefreshReceiver { rx })
    }

    /// Returns `false` if `key` is already waiting or being fetched.
    pub fn enqueue(&self, key: &str) -> bool {
        {
            let mut pending = self.inner.pending.lock();
            if !pending.insert(key.to_string()) {
                self.inner.stats.refresh_deduplicated.incr();
                metrics::record_refresh("deduplicated");
                return false;
            }
        }
        if self.inner.tx.send(key.to_string()).is_err() {
            self.inner.pending.lock().remove(key);
            warn!(key, "refresh worker is gone; dropping refresh request");
            return false;
        }
        self.inner.stats.refresh_enqueued.incr();
        metrics::record_refresh("enqueued");
        true
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.pending.lock().contains(key)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn complete(&self, key: &str) {
        self.inner.pending.lock().remove(key);
    }

    /// Starts the single worker. It waits at most `poll` for work between
    /// shutdown checks and exits once `shutdown` reads `true`.
    pub fn spawn_worker(
        &self,
        receiver: RefreshReceiver,
        fetcher: Arc<dyn OriginFetcher>,
        poll: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        let mut rx = receiver.rx;
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }
                let key = match timeout(poll, rx.recv()).await {
                    Ok(Some(key)) => key,
                    Ok(None) => break,
                    Err(_) => continue,
                };
                queue.run_one(&key, fetcher.as_ref()).await;
            }
            debug!("refresh worker stopped");
        })
    }

    async fn run_one(&self, key: &str, fetcher: &dyn OriginFetcher) {
        let stats = &self.inner.stats;
        match refresh_request(key) {
            Some(request) => {
                trace!(key, url = %request.url, "refreshing cache entry");
                match fetcher.fetch(request).await {
                    Ok(()) => {
                        stats.refresh_completed.incr();
                        metrics::record_refresh("completed");
                    }
                    Err(err) => {
                        stats.refresh_failed.incr();
                        metrics::record_refresh("failed");
                        warn!(key, error = %err, "background refresh failed");
                    }
                }
            }
            None => {
                stats.refresh_failed.incr();
                metrics::record_refresh("failed");
                warn!(key, "refresh key is not a variant key");
            }
        }
        self.complete(key);
    }
}

/// The synthetic GET that re-populates `key`.
pub fn refresh_request(key: &str) -> Option<RequestInfo> {
    let (encoding, url) = split_variant_key(key)?;
    let accept = if encoding == NO_ENCODING {
        "identity"
    } else {
        encoding
    };
    Some(
        RequestInfo::get(url)
            .with_header(ACCEPT_ENCODING, accept)
            .with_header(BACKGROUND_HEADER, "1"),
    )
}
