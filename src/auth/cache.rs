//! Token cache keyed by backend identity.
//!
//! The cache is an explicit, injectable store rather than ambient global
//! state: a [`TokenCache`] is owned (or shared) by each [`crate::Server`].
//! Entries expire early — 10% of the granted lifetime is given up so a token
//! is refreshed before the backend would reject it — and a stale read purges
//! the entry rather than leaving it for a later reader.
//!
//! Invalidation is lazy: a 401/403 observed on an authenticated call clears
//! the entry so the *next* acquisition performs a fresh grant. The clear
//! compares issue timestamps so it cannot race away a token that another
//! caller refreshed after the failing call was issued.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

/// Escapes a backend identity (base URL) into a cache key.
pub(crate) fn cache_key(base_url: &str) -> String {
    urlencoding::encode(base_url).into_owned()
}

/// Refresh deadline for a token issued at `issued_at` with a lifetime of
/// `expires_in` seconds: `issued_at + expires_in - floor(expires_in * 0.1)`.
pub(crate) fn early_refresh_deadline(issued_at: Instant, expires_in: u64) -> Instant {
    issued_at + Duration::from_secs(expires_in - expires_in / 10)
}

/// A bearer token together with its issue and refresh times.
#[derive(Debug, Clone)]
pub struct CachedToken {
    /// The opaque bearer token.
    pub access_token: String,
    pub(crate) issued_at: Instant,
    pub(crate) expires_at: Instant,
}

/// Concurrency-safe store mapping backend identities to cached tokens.
pub struct TokenCache {
    entries: RwLock<HashMap<String, CachedToken>>,
    /// Per-key acquisition locks: at most one in-flight grant per backend.
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TokenCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a live token. A stale entry is purged and reported as absent.
    pub async fn get(&self, key: &str) -> Option<CachedToken> {
        let stale = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if Instant::now() < entry.expires_at => return Some(entry.clone()),
                Some(_) => true,
                None => false,
            }
        };
        if stale {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get(key) {
                if Instant::now() >= entry.expires_at {
                    entries.remove(key);
                }
            }
        }
        None
    }

    /// Store a freshly granted token, overwriting any previous entry and
    /// recomputing the early-refresh deadline.
    pub async fn set(&self, key: &str, access_token: &str, expires_in: u64) -> CachedToken {
        let issued_at = Instant::now();
        let entry = CachedToken {
            access_token: access_token.to_owned(),
            issued_at,
            expires_at: early_refresh_deadline(issued_at, expires_in),
        };
        let mut entries = self.entries.write().await;
        entries.insert(key.to_owned(), entry.clone());
        entry
    }

    /// Unconditionally remove an entry.
    pub async fn clear(&self, key: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
    }

    /// Remove an entry only if it was issued at or before `issued_at`.
    ///
    /// Used by the dispatcher when an authenticated call comes back 401/403:
    /// if another caller's grant already refreshed the entry, the failing
    /// call observed an old token and the clear is a no-op.
    pub async fn clear_if_issued_at_or_before(&self, key: &str, issued_at: Instant) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.issued_at <= issued_at {
                entries.remove(key);
            }
        }
    }

    /// Hand out the acquisition lock for a key. Callers hold the lock across
    /// the whole miss → grant → set sequence so concurrent misses collapse
    /// into a single grant request.
    pub(crate) async fn acquisition_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        flights
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_deadline_gives_up_ten_percent_floored() {
        let issued = Instant::now();
        assert_eq!(
            early_refresh_deadline(issued, 100),
            issued + Duration::from_secs(90)
        );
        // floor(99 * 0.1) == 9
        assert_eq!(
            early_refresh_deadline(issued, 99),
            issued + Duration::from_secs(90)
        );
        assert_eq!(early_refresh_deadline(issued, 0), issued);
    }

    #[tokio::test]
    async fn set_then_get_returns_the_token() {
        let cache = TokenCache::new();
        cache.set("k", "tok", 600).await;
        let entry = cache.get("k").await;
        assert_eq!(entry.map(|e| e.access_token).as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn stale_read_purges_the_entry() {
        let cache = TokenCache::new();
        // expires_in of zero puts the deadline at the issue instant.
        cache.set("k", "tok", 0).await;
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.len().await, 0);
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn clear_removes_the_entry() {
        let cache = TokenCache::new();
        cache.set("k", "tok", 600).await;
        cache.clear("k").await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn compare_and_clear_skips_refreshed_entries() {
        let cache = TokenCache::new();
        let old = cache.set("k", "old", 600).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.set("k", "new", 600).await;

        // A 401 observed on the old token must not evict the new one.
        cache.clear_if_issued_at_or_before("k", old.issued_at).await;
        let entry = cache.get("k").await;
        assert_eq!(entry.map(|e| e.access_token).as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn compare_and_clear_evicts_the_observed_entry() {
        let cache = TokenCache::new();
        let tok = cache.set("k", "tok", 600).await;
        cache.clear_if_issued_at_or_before("k", tok.issued_at).await;
        assert!(cache.get("k").await.is_none());
    }

    #[test]
    fn keys_are_url_escaped() {
        assert_eq!(
            cache_key("https://example.secretservercloud.com/"),
            "https%3A%2F%2Fexample.secretservercloud.com%2F"
        );
    }
}
