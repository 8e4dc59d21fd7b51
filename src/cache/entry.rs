use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Longest lifetime an entry is given; larger TTLs saturate here.
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Response headers never stored with an entry.
pub const DENIED_HEADERS: [&str; 6] = [
    "last-modified",
    "etag",
    "authorization",
    "cookie",
    "set-cookie",
    "set-cookie2",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Fresh200,
    RecordedFailure501,
    DeclinedUncacheable502,
}

impl EntryStatus {
    pub fn status_code(self) -> StatusCode {
        match self {
            EntryStatus::Fresh200 => StatusCode::OK,
            EntryStatus::RecordedFailure501 => StatusCode::NOT_IMPLEMENTED,
            EntryStatus::DeclinedUncacheable502 => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn is_negative(self) -> bool {
        !matches!(self, EntryStatus::Fresh200)
    }
}

/// A stored response. Replaced whole, never patched in place.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    status: EntryStatus,
    body: Option<Bytes>,
    headers: HeaderMap,
    created_at: SystemTime,
    expires_at: SystemTime,
}

impl CacheEntry {
    /// A servable 200 entry. Denied headers are dropped here.
    pub fn fresh(headers: &HeaderMap, body: Bytes) -> Self {
        let now = SystemTime::now();
        Self {
            status: EntryStatus::Fresh200,
            body: Some(body),
            headers: strip_denied_headers(headers),
            created_at: now,
            expires_at: now,
        }
    }

    /// A negative entry: no body and no headers.
    pub fn negative(status: EntryStatus) -> Self {
        let now = SystemTime::now();
        let body = if status.is_negative() {
            None
        } else {
            Some(Bytes::new())
        };
        Self {
            status,
            body,
            headers: HeaderMap::new(),
            created_at: now,
            expires_at: now,
        }
    }

    pub(super) fn stamp_expiry(&mut self, ttl: Duration) {
        self.expires_at = self
            .created_at
            .checked_add(ttl.min(MAX_TTL))
            .unwrap_or(self.created_at);
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_ttl(&self, now: SystemTime) -> Duration {
        self.expires_at.duration_since(now).unwrap_or_default()
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.created_at).unwrap_or_default()
    }

    pub fn body_len(&self) -> usize {
        self.body.as_ref().map(Bytes::len).unwrap_or(0)
    }

    pub(super) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let persisted = PersistedEntry {
            status: self.status,
            headers: headermap_to_vec(&self.headers),
            body: self.body.as_ref().map(|body| body.to_vec()),
            created_at_ms: to_millis(self.created_at),
            expires_at_ms: to_millis(self.expires_at),
        };
        serde_json::to_vec(&persisted).map_err(StoreError::Encode)
    }

    pub(super) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let persisted: PersistedEntry =
            serde_json::from_slice(bytes).map_err(StoreError::Decode)?;
        let body = match persisted.status {
            EntryStatus::Fresh200 => Some(Bytes::from(persisted.body.unwrap_or_default())),
            _ => None,
        };
        Ok(Self {
            status: persisted.status,
            body,
            headers: vec_to_headermap(&persisted.headers),
            created_at: from_millis(persisted.created_at_ms),
            expires_at: from_millis(persisted.expires_at_ms),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    status: EntryStatus,
    headers: Vec<(String, String)>,
    #[serde(default)]
    body: Option<Vec<u8>>,
    created_at_ms: u64,
    expires_at_ms: u64,
}

pub fn strip_denied_headers(headers: &HeaderMap) -> HeaderMap {
    let mut kept = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if DENIED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        kept.append(name.clone(), value.clone());
    }
    kept
}

fn headermap_to_vec(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn vec_to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn from_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONTENT_TYPE, ETAG, SET_COOKIE};

    #[test]
    fn fresh_entry_strips_denied_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.insert(ETAG, HeaderValue::from_static("\"v1\""));
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        let entry = CacheEntry::fresh(&headers, Bytes::from_static(b"hi"));
        assert_eq!(entry.headers().len(), 1);
        assert!(entry.headers().contains_key(CONTENT_TYPE));
    }

    #[test]
    fn negative_entries_have_no_body() {
        let entry = CacheEntry::negative(EntryStatus::DeclinedUncacheable502);
        assert!(entry.body().is_none());
        assert_eq!(entry.status().status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn expiry_follows_stamped_ttl() {
        let mut entry = CacheEntry::fresh(&HeaderMap::new(), Bytes::from_static(b"x"));
        entry.stamp_expiry(Duration::from_secs(10));
        let created = entry.created_at();
        assert!(!entry.is_expired_at(created + Duration::from_secs(9)));
        assert!(entry.is_expired_at(created + Duration::from_secs(10)));
        assert_eq!(
            entry.remaining_ttl(created + Duration::from_secs(4)),
            Duration::from_secs(6)
        );
    }

    #[test]
    fn oversized_ttl_saturates() {
        let mut entry = CacheEntry::fresh(&HeaderMap::new(), Bytes::from_static(b"x"));
        entry.stamp_expiry(Duration::MAX);
        assert_eq!(entry.expires_at(), entry.created_at() + MAX_TTL);
        assert!(!entry.is_expired_at(SystemTime::now()));
        let decoded = CacheEntry::decode(&entry.encode().unwrap()).unwrap();
        assert_eq!(to_millis(decoded.expires_at()), to_millis(entry.expires_at()));
    }

    #[test]
    fn persisted_form_preserves_header_order_and_body() {
        let mut headers = HeaderMap::new();
        headers.append("x-a", HeaderValue::from_static("1"));
        headers.append("x-a", HeaderValue::from_static("2"));
        let mut entry = CacheEntry::fresh(&headers, Bytes::from_static(b"payload"));
        entry.stamp_expiry(Duration::from_secs(30));
        let decoded = CacheEntry::decode(&entry.encode().unwrap()).unwrap();
        let values: Vec<_> = decoded.headers().get_all("x-a").iter().collect();
        assert_eq!(values, vec!["1", "2"]);
        assert_eq!(decoded.body().unwrap().as_ref(), b"payload");
        assert_eq!(to_millis(decoded.expires_at()), to_millis(entry.expires_at()));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            CacheEntry::decode(b"not json"),
            Err(StoreError::Decode(_))
        ));
    }
}
