use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::DecisionError;

/// Key of the single global rate-limit marker.
pub const RATE_LIMIT_KEY: &str = "decision:rate_limit";

/// Key/value store with per-entry expiry, plus the rate-limit marker.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Returns the live value for `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, DecisionError>;

    /// Stores `value` until `ttl` elapses.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DecisionError>;

    /// Returns `true` and arms the marker for `interval` when no marker is
    /// live; returns `false` while one is.
    async fn check_and_advise_rate_limit(&self, interval: Duration) -> Result<bool, DecisionError>;

    /// Whether the backend is reachable.
    fn is_connected(&self) -> bool;
}

#[derive(Debug)]
struct Entry {
    value: String,
    /// `None` when the TTL runs past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: impl Into<String>, now: Instant, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: now.checked_add(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => at > now,
            None => true,
        }
    }
}

/// In-process TTL store.
#[derive(Debug)]
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, Entry>>,
    connected: AtomicBool,
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheBackend {
    /// Creates an empty, connected store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Marks the store reachable or not. A disconnected store is bypassed by
    /// callers.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Number of unexpired entries, the rate-limit marker included.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        purge(&mut entries, Instant::now());
        entries.len()
    }

    /// Whether no unexpired entries remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn purge(entries: &mut HashMap<String, Entry>, now: Instant) {
    entries.retain(|_, entry| entry.is_live(now));
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, DecisionError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DecisionError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        purge(&mut entries, now);
        entries.insert(key.to_string(), Entry::new(value, now, ttl));
        Ok(())
    }

    async fn check_and_advise_rate_limit(&self, interval: Duration) -> Result<bool, DecisionError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries
            .get(RATE_LIMIT_KEY)
            .is_some_and(|marker| marker.is_live(now))
        {
            return Ok(false);
        }
        entries.insert(RATE_LIMIT_KEY.to_string(), Entry::new("1", now, interval));
        Ok(true)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_expire_after_ttl() {
        let cache = MemoryCacheBackend::new();
        cache
            .set("decision:write:/data/a.txt", "analyze", Duration::from_millis(40))
            .await
            .unwrap();
        assert_eq!(
            cache.get("decision:write:/data/a.txt").await.unwrap().as_deref(),
            Some("analyze")
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get("decision:write:/data/a.txt").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn rate_limit_marker_is_global_and_expires() {
        let cache = MemoryCacheBackend::new();
        let window = Duration::from_millis(40);
        assert!(cache.check_and_advise_rate_limit(window).await.unwrap());
        assert!(!cache.check_and_advise_rate_limit(window).await.unwrap());
        assert_eq!(cache.len(), 1);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.check_and_advise_rate_limit(window).await.unwrap());
    }

    #[tokio::test]
    async fn oversized_ttl_never_expires() {
        let cache = MemoryCacheBackend::new();
        cache
            .set("decision:create:/data/b.md", "notify", Duration::MAX)
            .await
            .unwrap();
        assert!(cache.check_and_advise_rate_limit(Duration::MAX).await.unwrap());
        assert!(!cache.check_and_advise_rate_limit(Duration::MAX).await.unwrap());
        assert_eq!(
            cache.get("decision:create:/data/b.md").await.unwrap().as_deref(),
            Some("notify")
        );
        assert_eq!(cache.len(), 2);
    }
}
