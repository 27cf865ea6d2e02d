//! Deduplication of concurrent token refreshes

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

use crate::token::Claims;

/// Refresh slots keyed by the stale token string
///
/// Every request bearing the same expired token receives the same slot; the
/// first one to initialize it performs the refresh and the rest reuse its
/// result.
pub trait RefreshCache: Send + Sync {
    fn slot(&self, token: &str) -> Arc<OnceCell<Claims>>;
}

struct Slot {
    cell: Arc<OnceCell<Claims>>,
    created: Instant,
}

impl Slot {
    fn new(now: Instant) -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            created: now,
        }
    }
}

/// In-memory refresh cache with per-entry TTL
pub struct MemoryRefreshCache {
    entries: DashMap<String, Slot>,
    ttl: Duration,
    max_entries: usize,
}

impl MemoryRefreshCache {
    /// Create a cache whose entries live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: 10_000,
        }
    }

    /// Cap after which expired entries are swept
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries
    pub fn purge(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, slot| now.duration_since(slot.created) <= self.ttl);
    }
}

impl RefreshCache for MemoryRefreshCache {
    fn slot(&self, token: &str) -> Arc<OnceCell<Claims>> {
        let now = Instant::now();
        let cell = {
            let mut slot = self
                .entries
                .entry(token.to_string())
                .or_insert_with(|| Slot::new(now));
            if now.duration_since(slot.created) > self.ttl {
                *slot = Slot::new(now);
            }
            slot.cell.clone()
        };

        if self.entries.len() > self.max_entries {
            self.purge();
        }
        cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_token_shares_slot() {
        let cache = MemoryRefreshCache::new(Duration::from_secs(60));
        let a = cache.slot("stale");
        let b = cache.slot("stale");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &cache.slot("other")));

        a.set(Claims {
            jti: "fresh".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(b.get().unwrap().jti, "fresh");
    }

    #[tokio::test]
    async fn test_expired_slot_is_replaced() {
        let cache = MemoryRefreshCache::new(Duration::from_millis(10));
        let first = cache.slot("stale");
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = cache.slot("stale");
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_purge_over_capacity() {
        let cache = MemoryRefreshCache::new(Duration::from_millis(10)).with_max_entries(2);
        cache.slot("a");
        cache.slot("b");
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.slot("c");
        assert_eq!(cache.len(), 1);
    }
}
