use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

use super::PolicyModule;
use crate::config::read_policy_source;

#[derive(Debug, Clone)]
pub struct ReloadOptions {
    /// Quiet period after the last change notification before reloading.
    pub debounce: Duration,
    /// Poll the policy file's mtime at this interval; `None` disables polling.
    pub poll_interval: Option<Duration>,
    /// Reload on SIGHUP (unix only).
    pub sighup: bool,
}

impl Default for ReloadOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            poll_interval: Some(Duration::from_secs(1)),
            sighup: true,
        }
    }
}

/// Background reload of a policy file into a [`PolicyModule`].
pub struct PolicyReloader {
    trigger: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl PolicyReloader {
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        module: Arc<PolicyModule>,
        path: PathBuf,
        options: ReloadOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let trigger = Arc::new(Notify::new());
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(reload_loop(
            module,
            path.clone(),
            options.debounce,
            trigger.clone(),
            shutdown.clone(),
        )));
        if options.sighup
            && let Some(task) = spawn_sighup_task(trigger.clone(), shutdown.clone())
        {
            tasks.push(task);
        }
        if let Some(period) = options.poll_interval {
            tasks.push(tokio::spawn(poll_mtime(
                path,
                period,
                trigger.clone(),
                shutdown,
            )));
        }

        Self { trigger, tasks }
    }

    /// Schedules a reload after the debounce period.
    pub fn notify_change(&self) {
        self.trigger.notify_one();
    }

    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for PolicyReloader {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Reads and compiles `path` into `module`. Failures are logged and leave the
/// previous policy active.
pub fn reload_once(module: &PolicyModule, path: &Path) -> bool {
    let text = match read_policy_source(path) {
        Ok(text) => text,
        Err(err) => {
            module.record_reload_failure();
            warn!(error = %err, "cache policy reload skipped; keeping previous policy");
            return false;
        }
    };
    match module.reload_from_text(&text) {
        Ok(()) => {
            info!(path = %path.display(), "cache policy reloaded");
            true
        }
        Err(err) => {
            error!(path = %path.display(), error = %err, "cache policy reload failed; keeping previous policy");
            false
        }
    }
}

async fn reload_loop(
    module: Arc<PolicyModule>,
    path: PathBuf,
    debounce: Duration,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = trigger.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        while timeout(debounce, trigger.notified()).await.is_ok() {
            debug!("policy change notification coalesced");
        }
        let module = module.clone();
        let path = path.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || reload_once(&module, &path)).await {
            error!(error = %err, "cache policy reload task panicked");
        }
    }
    debug!("policy reload loop stopped");
}

async fn poll_mtime(
    path: PathBuf,
    period: Duration,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = modified_at(&path).await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        let current = modified_at(&path).await;
        if current.is_some() && current != last_seen {
            debug!(path = %path.display(), "policy file modification detected");
            trigger.notify_one();
        }
        last_seen = current;
    }
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .and_then(|meta| meta.modified())
        .ok()
}

#[cfg(unix)]
fn spawn_sighup_task(
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hup = match signal(SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(err) => {
            error!(error = %err, "failed to install SIGHUP handler");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                received = hup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("received SIGHUP; reloading cache policy");
                    trigger.notify_one();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_sighup_task(
    _trigger: Arc<Notify>,
    _shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    info!("SIGHUP reload is not supported on this platform");
    None
}
