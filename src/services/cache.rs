//! TTL cache used for lookups that are expensive to repeat on every
//! trigger (user preferences, user roles).
//!
//! Each component that needs caching owns (or is handed) an instance; there is
//! no process-wide cache. Interested parties subscribe to [`CacheEvent`]s
//! through the cache itself.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use moka::notification::RemovalCause;
use tokio::sync::broadcast;

/// Upper bound on live entries per cache.
const MAX_ENTRIES: u64 = 10_000;

/// Change notifications emitted by a [`TtlCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent<K> {
    Inserted(K),
    Invalidated(K),
    Expired(K),
}

pub struct TtlCache<K, V> {
    entries: Cache<K, V>,
    events: broadcast::Sender<CacheEvent<K>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        let listener = events.clone();
        let entries = Cache::builder()
            .max_capacity(MAX_ENTRIES)
            .time_to_live(ttl)
            .eviction_listener(move |key: Arc<K>, _value: V, cause: RemovalCause| {
                let event = match cause {
                    RemovalCause::Expired => CacheEvent::Expired((*key).clone()),
                    RemovalCause::Explicit => CacheEvent::Invalidated((*key).clone()),
                    _ => return,
                };
                // No subscribers is fine.
                let _ = listener.send(event);
            })
            .build();
        Self { entries, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent<K>> {
        self.events.subscribe()
    }

    /// Cached value for `key`, or `None` if missing or expired.
    pub async fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).await
    }

    pub async fn insert(&self, key: K, value: V) {
        self.entries.insert(key.clone(), value).await;
        let _ = self.events.send(CacheEvent::Inserted(key));
    }

    pub async fn invalidate(&self, key: &K) -> bool {
        self.entries.remove(key).await.is_some()
    }

    /// Live entries once pending expirations have been applied.
    #[cfg(test)]
    pub(crate) async fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}
