use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::{
    sync::RwLock,
    time::Instant,
};

use crate::executor::{CodeExecutor, ExecResult, OutputSink, TeeSink};

struct CacheEntry {
    result: Bytes,
    last_access: Instant,
    access_count: u64,
}

type CacheMap = HashMap<String, CacheEntry>;

/// Content-addressed LRU+TTL cache around another executor. A hit replays
/// the exact captured bytes (truncation marker included) without touching a
/// subprocess; only successful runs are stored. `max_entries == 0` disables
/// caching entirely.
pub struct CachedExecutor {
    inner: Arc<dyn CodeExecutor>,
    cache: Arc<RwLock<CacheMap>>,
    max_entries: usize,
    ttl: Duration,
}

impl CachedExecutor {
    pub fn new(inner: Arc<dyn CodeExecutor>, max_entries: usize, ttl: Duration) -> Self {
        let cache = Arc::new(RwLock::new(HashMap::new()));
        if max_entries > 0 {
            spawn_cleaner(Arc::downgrade(&cache), ttl);
        }
        Self {
            inner,
            cache,
            max_entries,
            ttl,
        }
    }

    fn cache_key(source: &str) -> String {
        hex::encode(Sha256::digest(source.as_bytes()))
    }

    /// Replays a live entry to the sink, or returns `None` on a miss.
    async fn replay(&self, key: &str, sink: &mut dyn OutputSink) -> Option<ExecResult<()>> {
        let cached = {
            let cache = self.cache.read().await;
            cache.get(key).and_then(|entry| {
                (entry.last_access.elapsed() <= self.ttl).then(|| entry.result.clone())
            })
        };
        let bytes = cached?;

        // Stats update happens off the read path.
        self.touch(key.to_string());
        Some(sink.write_chunk(&bytes).await)
    }

    fn touch(&self, key: String) {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            let mut cache = cache.write().await;
            if let Some(entry) = cache.get_mut(&key) {
                entry.last_access = Instant::now();
                entry.access_count += 1;
            }
        });
    }

    #[cfg(test)]
    pub(crate) async fn access_count(&self, source: &str) -> Option<u64> {
        let cache = self.cache.read().await;
        cache
            .get(&Self::cache_key(source))
            .map(|entry| entry.access_count)
    }

    async fn store(&self, key: String, result: Bytes) {
        let mut cache = self.cache.write().await;
        if cache.len() >= self.max_entries {
            evict_least_recent(&mut cache);
        }
        cache.insert(
            key,
            CacheEntry {
                result,
                last_access: Instant::now(),
                access_count: 1,
            },
        );
    }
}

#[async_trait]
impl CodeExecutor for CachedExecutor {
    async fn execute(
        &self,
        source: &str,
        deadline: Instant,
        sink: &mut dyn OutputSink,
    ) -> ExecResult<()> {
        if self.max_entries == 0 {
            return self.inner.execute(source, deadline, sink).await;
        }

        let key = Self::cache_key(source);
        if let Some(result) = self.replay(&key, sink).await {
            return result;
        }

        // Concurrent identical misses race to fill; the last writer wins the
        // slot.
        let mut tee = TeeSink::new(sink);
        self.inner.execute(source, deadline, &mut tee).await?;
        let captured = tee.into_captured();
        self.store(key, captured).await;
        Ok(())
    }
}

fn evict_least_recent(cache: &mut CacheMap) {
    // MaxCacheSize is small; a linear scan beats maintaining a heap.
    let oldest = cache
        .iter()
        .min_by_key(|(_, entry)| entry.last_access)
        .map(|(key, _)| key.clone());
    if let Some(key) = oldest {
        cache.remove(&key);
    }
}

fn purge_expired(cache: &mut CacheMap, ttl: Duration) {
    cache.retain(|_, entry| entry.last_access.elapsed() <= ttl);
}

fn spawn_cleaner(cache: Weak<RwLock<CacheMap>>, ttl: Duration) {
    let period = (ttl / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(cache) = cache.upgrade() else { break };
            purge_expired(&mut *cache.write().await, ttl);
        }
    });
}
