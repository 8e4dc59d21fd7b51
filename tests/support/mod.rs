#![allow(clippy::type_complexity)]
#![allow(dead_code)]

mod logging;

pub use logging::LogCapture;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration as StdDuration, Instant};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, StatusCode};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use cachegate::{
    CacheEngine, EngineHooks,
    cache::{MemoryRemote, RemoteBackend, RemoteConnector},
    capture::CaptureOutcome,
    cli::LogFormat,
    coordinator::{Coordinator, Lookup, RequestStart, mark_miss},
    error::CaptureError,
    logging::RecentLog,
    refresh::OriginFetcher,
    request::{RequestInfo, ResponseHead},
    settings::Settings,
};

pub struct TestDirs {
    _temp: TempDir,
    pub policy_path: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let policy_path = temp.path().join("policy.toml");
        Ok(Self {
            _temp: temp,
            policy_path,
        })
    }

    pub fn write_policy(&self, text: &str) -> Result<()> {
        std::fs::write(&self.policy_path, text)
            .with_context(|| format!("failed to write {}", self.policy_path.display()))
    }
}

pub fn default_test_settings(dirs: &TestDirs) -> Settings {
    let mut settings = Settings::with_policy(&dirs.policy_path);
    settings.log = LogFormat::Text;
    settings.cache_max_entries = 64;
    settings.refresh_poll_interval_ms = 20;
    settings.reload_debounce_ms = 20;
    settings.policy_poll_interval_ms = 0;
    settings
}

/// What the simulated origin sends back for one request.
#[derive(Clone)]
pub struct OriginResponse {
    pub head: ResponseHead,
    pub chunks: Vec<Bytes>,
    /// Report a host error after the body has been written.
    pub reset: bool,
}

impl OriginResponse {
    pub fn new(status: StatusCode, content_type: &str, body: &str) -> Self {
        let body = Bytes::copy_from_slice(body.as_bytes());
        let mid = body.len() / 2;
        Self {
            head: ResponseHead::new(status).with_header(CONTENT_TYPE, content_type),
            chunks: vec![body.slice(..mid), body.slice(mid..)],
            reset: false,
        }
    }

    pub fn html(body: &str) -> Self {
        Self::new(StatusCode::OK, "text/html; charset=utf-8", body)
    }

    pub fn header(mut self, name: HeaderName, value: &str) -> Self {
        self.head = self.head.with_header(name, value);
        self
    }

    pub fn encoded(self, encoding: &str) -> Self {
        self.header(CONTENT_ENCODING, encoding)
    }

    pub fn reset_after_body(mut self) -> Self {
        self.reset = true;
        self
    }
}

/// Simulated upstream; records every request it answers.
pub struct Origin {
    requests: Mutex<Vec<RequestInfo>>,
    handler: Box<dyn Fn(&RequestInfo) -> OriginResponse + Send + Sync>,
}

impl Origin {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&RequestInfo) -> OriginResponse + Send + Sync + 'static,
    {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        })
    }

    /// Answers every URL with a page naming the URL and the request count.
    pub fn pages() -> Arc<Self> {
        let counter = AtomicUsize::new(0);
        Self::new(move |request| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            OriginResponse::html(&format!("<p>{} #{n}</p>", request.url))
        })
    }

    fn respond(&self, request: &RequestInfo) -> OriginResponse {
        self.requests
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(request.clone());
        (self.handler)(request)
    }

    pub fn hits(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    pub fn requests(&self) -> Vec<RequestInfo> {
        self.requests
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }
}

#[derive(Debug)]
pub struct Served {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub lookup: Lookup,
    pub outcome: Option<CaptureOutcome>,
}

impl Served {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Drives one request through every coordinator hook the way a host would.
pub async fn serve(
    coordinator: &Coordinator,
    request: RequestInfo,
    origin: &Origin,
) -> Result<Served> {
    let mut scope = match coordinator.on_request_start(request).await {
        RequestStart::Complete(response, scope) => {
            coordinator.on_request_end::<Vec<u8>>(scope, None).await;
            return Ok(Served {
                status: response.status,
                headers: response.headers,
                body: response.body.to_vec(),
                lookup: Lookup::Hit,
                outcome: None,
            });
        }
        RequestStart::Continue(scope) => scope,
    };
    let lookup = scope.lookup();
    let response = origin.respond(scope.request());
    let mut headers = response.head.headers.clone();

    match coordinator.attach_response_filter(&mut scope, Vec::new()) {
        Ok(mut filter) => {
            mark_miss(&mut headers);
            for chunk in &response.chunks {
                filter.write(&response.head, chunk).await?;
            }
            if response.reset {
                coordinator.on_error(&scope, &CaptureError::Host("origin reset".into()));
            }
            let (outcome, body) = coordinator
                .on_request_end(scope, Some(filter))
                .await
                .context("capture filter was not finalized")?;
            Ok(Served {
                status: response.head.status,
                headers,
                body,
                lookup,
                outcome: Some(outcome),
            })
        }
        Err(mut body) => {
            for chunk in &response.chunks {
                body.extend_from_slice(chunk);
            }
            coordinator.on_request_end::<Vec<u8>>(scope, None).await;
            Ok(Served {
                status: response.head.status,
                headers,
                body,
                lookup,
                outcome: None,
            })
        }
    }
}

/// Background fetcher that replays refresh requests through the engine's
/// own coordinator against the test origin.
pub struct RefreshFetcher {
    origin: Arc<Origin>,
    coordinator: OnceLock<Coordinator>,
    gate: Semaphore,
}

impl RefreshFetcher {
    fn new(origin: Arc<Origin>, held: bool) -> Self {
        let permits = if held { 0 } else { Semaphore::MAX_PERMITS };
        Self {
            origin,
            coordinator: OnceLock::new(),
            gate: Semaphore::new(permits),
        }
    }

    /// Lets `count` held fetches proceed.
    pub fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }
}

#[async_trait]
impl OriginFetcher for RefreshFetcher {
    async fn fetch(&self, request: RequestInfo) -> Result<()> {
        let permit = self.gate.acquire().await?;
        permit.forget();
        let coordinator = self
            .coordinator
            .get()
            .ok_or_else(|| anyhow!("refresh fetcher used before the engine started"))?;
        let served = serve(coordinator, request, &self.origin).await?;
        anyhow::ensure!(
            served.status == StatusCode::OK,
            "origin answered {}",
            served.status
        );
        Ok(())
    }
}

pub struct EngineHarness {
    pub dirs: TestDirs,
    pub engine: CacheEngine,
    pub origin: Arc<Origin>,
    pub fetcher: Arc<RefreshFetcher>,
}

impl EngineHarness {
    pub async fn get(&self, url: &str) -> Result<Served> {
        self.request(RequestInfo::get(url)).await
    }

    pub async fn request(&self, request: RequestInfo) -> Result<Served> {
        serve(self.engine.coordinator(), request, &self.origin).await
    }

    pub async fn shutdown(self) {
        self.engine.shutdown().await;
    }
}

pub struct EngineHarnessBuilder {
    dirs: TestDirs,
    policy: String,
    origin: Option<Arc<Origin>>,
    hold_refresh: bool,
    remote: Option<Arc<MemoryRemote>>,
    recent_log: Option<RecentLog>,
    settings_override: Option<Box<dyn FnOnce(&mut Settings) + Send>>,
}

impl EngineHarnessBuilder {
    pub fn new(policy: &str) -> Result<Self> {
        Ok(Self {
            dirs: TestDirs::new()?,
            policy: policy.to_string(),
            origin: None,
            hold_refresh: false,
            remote: None,
            recent_log: None,
            settings_override: None,
        })
    }

    pub fn with_origin(mut self, origin: Arc<Origin>) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Background fetches wait for [`RefreshFetcher::release`].
    pub fn hold_refresh(mut self) -> Self {
        self.hold_refresh = true;
        self
    }

    pub fn with_remote(mut self, remote: Arc<MemoryRemote>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_recent_log(mut self, recent: RecentLog) -> Self {
        self.recent_log = Some(recent);
        self
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.settings_override = Some(Box::new(func));
        self
    }

    pub fn start(mut self) -> Result<EngineHarness> {
        self.dirs.write_policy(&self.policy)?;
        let mut settings = default_test_settings(&self.dirs);
        if let Some(override_fn) = self.settings_override.take() {
            override_fn(&mut settings);
        }

        let origin = self.origin.take().unwrap_or_else(Origin::pages);
        let fetcher = Arc::new(RefreshFetcher::new(origin.clone(), self.hold_refresh));
        let remote_connector = self.remote.take().map(|remote| {
            Box::new(move |_servers: &[String]| {
                Ok::<_, anyhow::Error>(remote as Arc<dyn RemoteBackend>)
            }) as RemoteConnector
        });
        let hooks = EngineHooks {
            fetcher: Some(fetcher.clone()),
            remote_connector,
            recent_log: self.recent_log.take(),
        };
        let engine = CacheEngine::start(&settings, hooks)?;
        let _ = fetcher.coordinator.set(engine.coordinator().clone());

        Ok(EngineHarness {
            dirs: self.dirs,
            engine,
            origin,
            fetcher,
        })
    }
}

/// Polls `check` until it holds or three seconds pass.
pub async fn wait_for<F>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + StdDuration::from_secs(3);
    while !check() {
        if Instant::now() >= deadline {
            return Err(anyhow!("timed out waiting for {what}"));
        }
        sleep(StdDuration::from_millis(20)).await;
    }
    Ok(())
}
