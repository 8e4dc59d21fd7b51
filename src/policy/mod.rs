use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::EngineStats;
use crate::config::EngineConfiguration;
use crate::error::PolicyError;
use crate::metrics;
use crate::request::{RequestInfo, ResponseHead};

pub mod compile;
pub mod model;
pub mod reload;

pub use compile::{compile_policy, compile_policy_text};
pub use model::CompiledPolicy;
pub use reload::{PolicyReloader, ReloadOptions};

/// Cacheability decisions. `decide_request` returns a TTL in seconds where
/// anything `<= 0` means ineligible; `decide_response` says whether the
/// response may be stored.
pub trait CachePolicy: Send + Sync {
    fn decide_request(&self, request: &RequestInfo) -> Result<i64, PolicyError>;

    fn decide_response(
        &self,
        request: &RequestInfo,
        response: &ResponseHead,
    ) -> Result<bool, PolicyError>;

    fn configuration(&self) -> Option<EngineConfiguration> {
        None
    }
}

impl CachePolicy for CompiledPolicy {
    fn decide_request(&self, request: &RequestInfo) -> Result<i64, PolicyError> {
        for rule in self.request_rules.iter() {
            if !rule.methods.allows(&request.method) || !rule.url.matches(&request.url) {
                continue;
            }
            debug!(rule = %rule.id, url = %request.url, "request rule matched");
            return Ok(if rule.negative { 0 } else { rule.ttl });
        }
        Ok(0)
    }

    fn decide_response(
        &self,
        _request: &RequestInfo,
        response: &ResponseHead,
    ) -> Result<bool, PolicyError> {
        let content_type = response.content_type();
        Ok(self
            .response_rules
            .iter()
            .find(|rule| rule.matches(response.status, content_type))
            .map(|rule| rule.cacheable)
            .unwrap_or(false))
    }

    fn configuration(&self) -> Option<EngineConfiguration> {
        Some(self.configuration.clone())
    }
}

/// Holds the active policy. Invocations and swaps serialize on one mutex, so
/// no decision ever sees two versions. Until a first policy is installed
/// every request is ineligible.
pub struct PolicyModule {
    current: Mutex<Option<Arc<dyn CachePolicy>>>,
    stats: Arc<EngineStats>,
}

impl PolicyModule {
    pub fn new(stats: Arc<EngineStats>) -> Self {
        Self {
            current: Mutex::new(None),
            stats,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn install(&self, policy: Arc<dyn CachePolicy>) {
        *self.current.lock() = Some(policy);
    }

    /// Compiles `text` and swaps it in. On failure the previous policy stays
    /// active and the error is returned for logging.
    pub fn reload_from_text(&self, text: &str) -> Result<(), PolicyError> {
        match compile_policy_text(text) {
            Ok(compiled) => {
                let request_rules = compiled.request_rules.len();
                let response_rules = compiled.response_rules.len();
                self.install(Arc::new(compiled));
                self.stats.reloads.incr();
                metrics::record_policy_reload(true);
                info!(request_rules, response_rules, "cache policy loaded");
                Ok(())
            }
            Err(err) => {
                self.record_reload_failure();
                Err(err)
            }
        }
    }

    pub(crate) fn record_reload_failure(&self) {
        self.stats.reload_failures.incr();
        metrics::record_policy_reload(false);
    }

    pub fn configuration(&self) -> Option<EngineConfiguration> {
        let guard = self.current.lock();
        guard.as_ref().and_then(|policy| policy.configuration())
    }

    /// TTL in seconds; `0` when ineligible, unloaded, or the policy failed.
    pub fn decide_request(&self, request: &RequestInfo) -> i64 {
        let guard = self.current.lock();
        let outcome = match guard.as_ref() {
            Some(policy) => catch_unwind(AssertUnwindSafe(|| policy.decide_request(request)))
                .unwrap_or(Err(PolicyError::Panicked("decide_request"))),
            None => Err(PolicyError::NotLoaded),
        };
        drop(guard);
        match outcome {
            Ok(ttl) => ttl,
            Err(err) => {
                self.record_error("request", &request.url, &err);
                0
            }
        }
    }

    pub fn decide_response(&self, request: &RequestInfo, response: &ResponseHead) -> bool {
        let guard = self.current.lock();
        let outcome = match guard.as_ref() {
            Some(policy) => {
                catch_unwind(AssertUnwindSafe(|| policy.decide_response(request, response)))
                    .unwrap_or(Err(PolicyError::Panicked("decide_response")))
            }
            None => Err(PolicyError::NotLoaded),
        };
        drop(guard);
        match outcome {
            Ok(cacheable) => cacheable,
            Err(err) => {
                self.record_error("response", &request.url, &err);
                false
            }
        }
    }

    fn record_error(&self, entry: &'static str, url: &str, err: &PolicyError) {
        if matches!(err, PolicyError::NotLoaded) {
            debug!(entry, url, "no cache policy loaded");
            return;
        }
        self.stats.policy_errors.incr();
        metrics::record_policy_error(entry);
        warn!(entry, url, error = %err, "cache policy evaluation failed");
    }
}
