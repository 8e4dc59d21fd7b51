use std::sync::Arc;

use http::{Method, StatusCode};

#[derive(Debug, Clone, Default)]
pub struct PolicySource {
    pub configuration: EngineConfiguration,
    pub request_rules: Vec<RequestRule>,
    pub response_rules: Vec<ResponseRule>,
}

/// Store sizing and remote endpoints. Consulted once, at engine startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfiguration {
    pub lru_max_items: Option<usize>,
    pub remote_servers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RequestRule {
    pub id: Arc<str>,
    pub url: UrlMask,
    pub methods: MethodMatch,
    pub ttl: i64,
    pub negative: bool,
}

#[derive(Debug, Clone)]
pub struct UrlMask {
    pub mask: Arc<str>,
    pub kind: MaskKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskKind {
    Exact,
    Wildcard,
}

impl UrlMask {
    pub fn new(mask: &str) -> Self {
        let kind = if mask.contains('*') || mask.contains('?') {
            MaskKind::Wildcard
        } else {
            MaskKind::Exact
        };
        Self {
            mask: Arc::from(mask),
            kind,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MethodMatch {
    Any,
    List(Vec<Method>),
}

#[derive(Debug, Clone)]
pub struct ResponseRule {
    pub id: Arc<str>,
    pub content_type: Option<Arc<str>>,
    pub statuses: Option<Vec<StatusCode>>,
    pub cacheable: bool,
}

impl ResponseRule {
    /// Built-in rule used when a policy declares no `[[response]]` tables.
    pub fn html_default() -> Self {
        Self {
            id: Arc::from("default#html"),
            content_type: Some(Arc::from("text/html")),
            statuses: None,
            cacheable: true,
        }
    }
}
