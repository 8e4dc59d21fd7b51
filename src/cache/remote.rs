use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::entry::MAX_TTL;
use crate::error::StoreError;

/// Key-value protocol of the optional second tier.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;
    async fn flush(&self) -> Result<(), StoreError>;
}

/// Builds a backend from the `remote_servers` endpoints of the policy
/// configuration. Supplied by the host; called once at startup.
pub type RemoteConnector =
    Box<dyn FnOnce(&[String]) -> Result<Arc<dyn RemoteBackend>> + Send + 'static>;

/// Process-local backend honouring TTLs. Lets several engines in one process
/// share a second tier, and stands in for a network store in tests.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    items: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.items
            .lock()
            .values()
            .filter(|(_, deadline)| *deadline > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RemoteBackend for MemoryRemote {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut items = self.items.lock();
        match items.get(key) {
            Some((value, deadline)) if *deadline > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                items.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let deadline = now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now);
        self.items.lock().insert(key.to_string(), (value, deadline));
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.items.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_remote_honours_ttl() {
        let remote = MemoryRemote::new();
        remote
            .set("k", b"v".to_vec(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(remote.get("k").await.unwrap(), Some(b"v".to_vec()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(remote.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_remote_accepts_unbounded_ttl() {
        let remote = MemoryRemote::new();
        remote.set("k", b"v".to_vec(), Duration::MAX).await.unwrap();
        assert_eq!(remote.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn memory_remote_flush_clears_everything() {
        let remote = MemoryRemote::new();
        remote
            .set("a", vec![1], Duration::from_secs(60))
            .await
            .unwrap();
        remote.flush().await.unwrap();
        assert!(remote.is_empty());
    }
}
