use http::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderName, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::{HeaderMap, HeaderValue, Method, StatusCode};

/// Marks requests issued by the refresh worker. Stripped before anything
/// reaches the origin in a real host; here it only steers the coordinator.
pub const BACKGROUND_HEADER: HeaderName = HeaderName::from_static("x-cachegate-background");
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_AGE: HeaderName = HeaderName::from_static("x-age");

/// The parts of an incoming request the engine looks at.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

impl RequestInfo {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn is_background(&self) -> bool {
        self.headers.contains_key(&BACKGROUND_HEADER)
    }

    pub fn is_conditional(&self) -> bool {
        self.headers.contains_key(IF_MODIFIED_SINCE) || self.headers.contains_key(IF_NONE_MATCH)
    }
}

/// Status and headers of a response, observed before the body streams.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
    }
}
