pub mod cache;
pub mod capture;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod refresh;
pub mod request;
pub mod settings;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    cache::{CacheStore, EngineStats, RemoteBackend, RemoteConnector, StatsSnapshot, VariantResolver},
    capture::CaptureContext,
    config::{EngineConfiguration, MAX_LRU_ITEMS},
    coordinator::Coordinator,
    logging::RecentLog,
    policy::{PolicyModule, PolicyReloader, ReloadOptions, reload::reload_once},
    refresh::{OriginFetcher, RefreshQueue},
    settings::Settings,
};

/// Collaborators supplied by the host.
#[derive(Default)]
pub struct EngineHooks {
    /// Issues background refresh requests; without it entries are never
    /// refreshed ahead of expiry.
    pub fetcher: Option<Arc<dyn OriginFetcher>>,
    /// Connects to `remote_servers` from the policy configuration.
    pub remote_connector: Option<RemoteConnector>,
    /// Log tail returned by [`CacheEngine::get_recent_log`]; defaults to the
    /// ring fed by [`logging::init_logger`].
    pub recent_log: Option<RecentLog>,
}

/// One running cache engine: store, policy, reloader, and refresh worker.
pub struct CacheEngine {
    coordinator: Coordinator,
    store: CacheStore,
    policy: Arc<PolicyModule>,
    stats: Arc<EngineStats>,
    refresh: Option<RefreshQueue>,
    reloader: PolicyReloader,
    recent_log: RecentLog,
    shutdown: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
}

impl CacheEngine {
    /// Loads the policy, sizes the store from its configuration, and starts
    /// the background tasks. Must be called inside a tokio runtime. A policy
    /// that fails to load leaves the engine running with every request
    /// ineligible until a reload succeeds.
    pub fn start(settings: &Settings, hooks: EngineHooks) -> Result<Self> {
        settings.validate()?;
        let stats = Arc::new(EngineStats::default());
        let policy = Arc::new(PolicyModule::new(stats.clone()));
        if !reload_once(&policy, &settings.policy) {
            error!(path = %settings.policy.display(), "no usable cache policy at startup; caching disabled until reload");
        }

        let configuration = policy.configuration().unwrap_or_default();
        let capacity = store_capacity(&configuration, settings.cache_max_entries);
        let remote = connect_remote(&configuration.remote_servers, hooks.remote_connector);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut builder = CacheStore::builder(capacity, stats.clone());
        if let Some(remote) = remote {
            builder = builder.remote(remote);
        }
        let (refresh, worker) = match hooks.fetcher {
            Some(fetcher) => {
                let (queue, receiver) = RefreshQueue::new(stats.clone());
                let worker = queue.spawn_worker(
                    receiver,
                    fetcher,
                    settings.refresh_poll_interval(),
                    shutdown_rx.clone(),
                );
                builder = builder.refresh(queue.clone(), settings.refresh_low_water());
                (Some(queue), Some(worker))
            }
            None => (None, None),
        };
        let store = builder.build()?;

        let ctx = CaptureContext {
            store: store.clone(),
            policy: policy.clone(),
            resolver: VariantResolver::new(&settings.preferred_encodings),
            negative_ttl: settings.negative_ttl(),
            stats: stats.clone(),
        };

        let reloader = PolicyReloader::spawn(
            policy.clone(),
            settings.policy.clone(),
            ReloadOptions {
                debounce: settings.reload_debounce(),
                poll_interval: settings.policy_poll_interval(),
                sighup: true,
            },
            shutdown_rx,
        );

        info!(
            capacity,
            remote = store.has_remote(),
            refresh = refresh.is_some(),
            "cache engine started"
        );

        Ok(Self {
            coordinator: Coordinator::new(ctx),
            store,
            policy,
            stats,
            refresh,
            reloader,
            recent_log: hooks.recent_log.unwrap_or_else(logging::recent_log),
            shutdown,
            worker,
        })
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn policy(&self) -> &Arc<PolicyModule> {
        &self.policy
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn refresh_queue(&self) -> Option<&RefreshQueue> {
        self.refresh.as_ref()
    }

    /// Schedules a debounced policy reload, as a file watcher would.
    pub fn notify_policy_change(&self) {
        self.reloader.notify_change();
    }

    pub async fn purge_all(&self) {
        self.store.purge_all().await;
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.store.len())
    }

    pub fn get_recent_log(&self) -> String {
        self.recent_log.render()
    }

    /// Stops the background tasks and waits for the refresh worker.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        self.reloader.abort();
        if let Some(worker) = self.worker.take()
            && let Err(err) = worker.await
        {
            warn!(error = %err, "refresh worker ended abnormally");
        }
    }
}

/// `lru_max_items` from the policy, or `fallback` when it is unset or out of
/// range.
fn store_capacity(configuration: &EngineConfiguration, fallback: usize) -> usize {
    match configuration.lru_max_items {
        Some(items) if (1..=MAX_LRU_ITEMS).contains(&items) => items,
        Some(items) => {
            warn!(
                lru_max_items = items,
                fallback, "policy store size out of range; using configured default"
            );
            fallback
        }
        None => fallback,
    }
}

fn connect_remote(
    servers: &[String],
    connector: Option<RemoteConnector>,
) -> Option<Arc<dyn RemoteBackend>> {
    if servers.is_empty() {
        return None;
    }
    let Some(connector) = connector else {
        warn!(
            servers = servers.len(),
            "policy names remote servers but no remote connector was supplied"
        );
        return None;
    };
    match connector(servers) {
        Ok(remote) => Some(remote),
        Err(err) => {
            warn!(error = ?err, "failed to connect remote cache tier; continuing in-process only");
            None
        }
    }
}
