use std::sync::Arc;

use http::{Method, StatusCode};
use regex::Regex;

use crate::config::EngineConfiguration;

/// A rule document compiled for evaluation. Immutable once built; a reload
/// produces a fresh instance that replaces this one wholesale.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub configuration: EngineConfiguration,
    pub request_rules: Arc<[CompiledRequestRule]>,
    pub response_rules: Arc<[CompiledResponseRule]>,
}

#[derive(Debug, Clone)]
pub struct CompiledRequestRule {
    pub id: Arc<str>,
    pub url: UrlMatcher,
    pub methods: MethodMask,
    pub ttl: i64,
    pub negative: bool,
}

#[derive(Debug, Clone)]
pub struct CompiledResponseRule {
    pub id: Arc<str>,
    pub content_type: Option<Arc<str>>,
    pub statuses: Option<Arc<[StatusCode]>>,
    pub cacheable: bool,
}

impl CompiledResponseRule {
    pub fn matches(&self, status: StatusCode, content_type: Option<&str>) -> bool {
        if let Some(statuses) = &self.statuses
            && !statuses.contains(&status)
        {
            return false;
        }
        match &self.content_type {
            None => true,
            Some(needle) => content_type
                .map(|value| value.to_ascii_lowercase().contains(needle.as_ref()))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MethodMask {
    allow_any: bool,
    mask: u32,
    extras: Arc<[Method]>,
}

impl MethodMask {
    pub fn any() -> Self {
        Self {
            allow_any: true,
            mask: 0,
            extras: Arc::from([]),
        }
    }

    pub fn from_methods(methods: &[Method]) -> Self {
        let mut mask = 0u32;
        let mut extras = Vec::new();
        for method in methods {
            if let Some(bit) = method_bit(method) {
                mask |= bit;
            } else if !extras.iter().any(|m: &Method| m == method) {
                extras.push(method.clone());
            }
        }
        Self {
            allow_any: false,
            mask,
            extras: Arc::from(extras.into_boxed_slice()),
        }
    }

    pub fn allows(&self, method: &Method) -> bool {
        if self.allow_any {
            return true;
        }
        if let Some(bit) = method_bit(method) {
            return (self.mask & bit) != 0;
        }
        self.extras.iter().any(|m| m == method)
    }
}

fn method_bit(method: &Method) -> Option<u32> {
    match method.as_str() {
        "GET" => Some(1 << 0),
        "POST" => Some(1 << 1),
        "PUT" => Some(1 << 2),
        "PATCH" => Some(1 << 3),
        "DELETE" => Some(1 << 4),
        "HEAD" => Some(1 << 5),
        "OPTIONS" => Some(1 << 6),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub enum UrlMatcher {
    Exact(Arc<str>),
    Wildcard { regex: Regex, original: Arc<str> },
}

impl UrlMatcher {
    pub fn matches(&self, url: &str) -> bool {
        match self {
            UrlMatcher::Exact(expected) => expected.as_ref() == url,
            UrlMatcher::Wildcard { regex, .. } => regex.is_match(url),
        }
    }

    pub fn original(&self) -> &Arc<str> {
        match self {
            UrlMatcher::Exact(original) => original,
            UrlMatcher::Wildcard { original, .. } => original,
        }
    }
}
