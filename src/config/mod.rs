mod loader;
pub mod model;

use std::collections::HashSet;
use std::ops::Deref;

use anyhow::{Result, bail, ensure};

pub use loader::{parse_policy_source, read_policy_source};
pub use model::{
    EngineConfiguration, MaskKind, MethodMatch, PolicySource, RequestRule, ResponseRule, UrlMask,
};

use crate::cache::MAX_TTL;

/// Upper bound for `configuration.lru_max_items`.
pub const MAX_LRU_ITEMS: usize = 10_000_000;

/// Ensures request rules are unambiguous: exact masks may appear once, TTLs of
/// positive rules must be positive and bounded, and masks are never empty.
pub fn validate_request_rules(rules: &[RequestRule]) -> Result<()> {
    let mut exact_seen: HashSet<&str> = HashSet::new();
    for rule in rules {
        ensure!(
            !rule.url.mask.trim().is_empty(),
            "request rule '{}' has an empty url mask",
            rule.id
        );
        if rule.url.kind == MaskKind::Exact && !exact_seen.insert(rule.url.mask.as_ref()) {
            bail!(
                "request rule '{}' repeats exact url '{}' already claimed by an earlier rule",
                rule.id,
                rule.url.mask
            );
        }
        if !rule.negative && rule.ttl <= 0 {
            bail!(
                "request rule '{}' must set a positive ttl or negative = true (got {})",
                rule.id,
                rule.ttl
            );
        }
        ensure!(
            rule.ttl <= MAX_TTL.as_secs() as i64,
            "request rule '{}' ttl {} exceeds the maximum of {} seconds",
            rule.id,
            rule.ttl,
            MAX_TTL.as_secs()
        );
    }
    Ok(())
}

pub fn validate_configuration(configuration: &EngineConfiguration) -> Result<()> {
    if let Some(items) = configuration.lru_max_items {
        ensure!(items > 0, "configuration.lru_max_items must be greater than 0");
        ensure!(
            items <= MAX_LRU_ITEMS,
            "configuration.lru_max_items must be at most {MAX_LRU_ITEMS} (got {items})"
        );
    }
    for server in &configuration.remote_servers {
        ensure!(
            !server.trim().is_empty(),
            "configuration.remote_servers must not contain empty endpoints"
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ValidatedSource {
    inner: PolicySource,
}

impl ValidatedSource {
    pub fn new(source: PolicySource) -> Result<Self> {
        validate_request_rules(&source.request_rules)?;
        validate_configuration(&source.configuration)?;
        Ok(Self { inner: source })
    }

    pub fn into_inner(self) -> PolicySource {
        self.inner
    }
}

impl AsRef<PolicySource> for ValidatedSource {
    fn as_ref(&self) -> &PolicySource {
        &self.inner
    }
}

impl Deref for ValidatedSource {
    type Target = PolicySource;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn rule(id: &str, url: &str, ttl: i64, negative: bool) -> RequestRule {
        RequestRule {
            id: Arc::from(id),
            url: UrlMask::new(url),
            methods: MethodMatch::Any,
            ttl,
            negative,
        }
    }

    #[test]
    fn rejects_duplicate_exact_masks() {
        let rules = vec![
            rule("a", "http://example.com/a.html", 30, false),
            rule("b", "http://example.com/a.html", 60, false),
        ];
        let err = validate_request_rules(&rules).unwrap_err();
        assert!(err.to_string().contains("already claimed"));
    }

    #[test]
    fn wildcard_masks_may_repeat() {
        let rules = vec![
            rule("a", "http://example.com/*", 30, false),
            rule("b", "http://example.com/*", 60, false),
        ];
        assert!(validate_request_rules(&rules).is_ok());
    }

    #[test]
    fn negative_rules_need_no_ttl() {
        let rules = vec![rule("a", "http://example.com/admin/*", 0, true)];
        assert!(validate_request_rules(&rules).is_ok());
        let rules = vec![rule("a", "http://example.com/admin/*", 0, false)];
        assert!(validate_request_rules(&rules).is_err());
    }

    #[test]
    fn zero_lru_size_is_rejected() {
        let source = PolicySource {
            configuration: EngineConfiguration {
                lru_max_items: Some(0),
                remote_servers: Vec::new(),
            },
            ..Default::default()
        };
        assert!(ValidatedSource::new(source).is_err());
    }

    #[test]
    fn oversized_lru_size_is_rejected() {
        let source = PolicySource {
            configuration: EngineConfiguration {
                lru_max_items: Some(usize::MAX),
                remote_servers: Vec::new(),
            },
            ..Default::default()
        };
        let err = ValidatedSource::new(source).unwrap_err();
        assert!(err.to_string().contains("at most"));
    }

    #[test]
    fn unbounded_ttl_is_rejected() {
        let rules = vec![rule("a", "http://example.com/*", i64::MAX, false)];
        let err = validate_request_rules(&rules).unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum"));
        let ceiling = MAX_TTL.as_secs() as i64;
        let rules = vec![rule("a", "http://example.com/*", ceiling, false)];
        assert!(validate_request_rules(&rules).is_ok());
    }
}
