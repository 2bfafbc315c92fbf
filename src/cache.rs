//! Read-through calendar cache.
//!
//! Entries are keyed by `(resource, range)` with millisecond-precise range
//! bounds, so two queries share an entry only when they ask for exactly the
//! same window. Invalidation is resource-scoped: any booking change on a
//! resource drops every cached range of that resource.
//!
//! Each entry carries the resource's invalidation generation at the time it
//! was computed. A read that finds an older generation treats the entry as a
//! miss, so a slow write racing an invalidation can't resurrect a stale view.
//!
//! The cache is advisory. Backend failures fall back to the repository on
//! read and are only logged on write; conflict checks never consult it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::{OccupancyView, Span};
use crate::observability::{CACHE_ERRORS_TOTAL, CACHE_REQUESTS_TOTAL};
use crate::repository::{Repository, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub resource_id: Ulid,
    pub range: Span,
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "calendar:{}:{}:{}",
            self.resource_id, self.range.start, self.range.end
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    Unavailable(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Unavailable(e) => write!(f, "cache unavailable: {e}"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Byte-level key/value store with expiry and resource-wide deletion.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set_ex(&self, key: CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Drop every entry of a resource. Returns how many were removed.
    async fn delete_resource(&self, resource_id: Ulid) -> Result<usize, CacheError>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process backend. Entries are bucketed per resource so a resource-wide
/// delete is a single map removal.
#[derive(Default)]
pub struct MemoryBackend {
    buckets: DashMap<Ulid, HashMap<Span, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let Some(mut bucket) = self.buckets.get_mut(&key.resource_id) else {
            return Ok(None);
        };
        if let Some(entry) = bucket.get(&key.range)
            && entry.expires_at > Instant::now()
        {
            return Ok(Some(entry.value.clone()));
        }
        bucket.remove(&key.range);
        Ok(None)
    }

    async fn set_ex(&self, key: CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.buckets
            .entry(key.resource_id)
            .or_default()
            .insert(key.range, entry);
        Ok(())
    }

    async fn delete_resource(&self, resource_id: Ulid) -> Result<usize, CacheError> {
        Ok(self
            .buckets
            .remove(&resource_id)
            .map_or(0, |(_, bucket)| bucket.len()))
    }
}

pub struct CalendarCache {
    repo: Arc<dyn Repository>,
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    /// Bumped on every invalidation. Entries stamped with an older
    /// generation are ignored on read.
    generations: DashMap<Ulid, u64>,
}

impl CalendarCache {
    pub fn new(repo: Arc<dyn Repository>, backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            repo,
            backend,
            ttl,
            generations: DashMap::new(),
        }
    }

    fn generation(&self, resource_id: Ulid) -> u64 {
        self.generations.get(&resource_id).map_or(0, |g| *g.value())
    }

    async fn compute(&self, resource_id: Ulid, range: Span) -> Result<OccupancyView, StoreError> {
        let bookings = self.repo.find_active_bookings(resource_id, range).await?;
        Ok(OccupancyView::from_bookings(resource_id, range, &bookings))
    }

    pub async fn get_occupancy(
        &self,
        resource_id: Ulid,
        range: Span,
    ) -> Result<OccupancyView, StoreError> {
        let key = CacheKey { resource_id, range };

        match self.backend.get(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<(u64, OccupancyView)>(&bytes) {
                Ok((stamped, view)) if stamped == self.generation(resource_id) => {
                    metrics::counter!(CACHE_REQUESTS_TOTAL, "outcome" => "hit").increment(1);
                    return Ok(view);
                }
                Ok((stamped, _)) => debug!(%key, stamped, "ignoring entry from an older generation"),
                Err(e) => warn!(%key, "discarding undecodable cache entry: {e}"),
            },
            Ok(None) => {}
            Err(e) => {
                warn!(%key, "cache read failed, reading store directly: {e}");
                metrics::counter!(CACHE_REQUESTS_TOTAL, "outcome" => "fallback").increment(1);
                return self.compute(resource_id, range).await;
            }
        }

        metrics::counter!(CACHE_REQUESTS_TOTAL, "outcome" => "miss").increment(1);
        let generation = self.generation(resource_id);
        let view = self.compute(resource_id, range).await?;

        if self.generation(resource_id) != generation {
            debug!(%key, "invalidated while computing, not caching");
            return Ok(view);
        }
        match serde_json::to_vec(&(generation, &view)) {
            Ok(bytes) => {
                if let Err(e) = self.backend.set_ex(key, bytes, self.ttl).await {
                    warn!(%key, "cache write failed: {e}");
                    metrics::counter!(CACHE_ERRORS_TOTAL).increment(1);
                }
            }
            Err(e) => warn!(%key, "occupancy view not serializable: {e}"),
        }
        Ok(view)
    }

    /// Drop every cached range of a resource.
    pub async fn invalidate(&self, resource_id: Ulid) {
        *self.generations.entry(resource_id).or_insert(0) += 1;
        match self.backend.delete_resource(resource_id).await {
            Ok(removed) => debug!(resource = %resource_id, removed, "calendar cache invalidated"),
            Err(e) => {
                warn!(resource = %resource_id, "cache invalidation failed, entries expire by TTL: {e}");
                metrics::counter!(CACHE_ERRORS_TOTAL).increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Booking, BookingStatus, HOUR_MS, Resource};
    use crate::notify::NotifyHub;
    use crate::store::WalStore;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    const TTL: Duration = Duration::from_secs(300);

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reserva_test_cache");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn store_with_resource(name: &str) -> (Arc<WalStore>, Ulid) {
        let store = Arc::new(WalStore::open(&test_wal_path(name), Arc::new(NotifyHub::new()), 1000).unwrap());
        let rid = Ulid::new();
        store
            .create_resource(Resource {
                id: rid,
                name: "Room".into(),
                capacity: 1,
                active: true,
                created_at: 0,
            })
            .await
            .unwrap();
        (store, rid)
    }

    async fn book(store: &WalStore, rid: Ulid, start: i64, end: i64) -> Booking {
        store
            .insert(Booking {
                id: Ulid::new(),
                resource_id: rid,
                user_id: Ulid::new(),
                span: Span::new(start, end),
                status: BookingStatus::Pending,
                notes: None,
                created_at: 0,
                updated_at: 0,
                reminded_at: None,
            })
            .await
            .unwrap()
    }

    /// Memory backend that can be switched to fail every call.
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        failing: AtomicBool,
    }

    impl FlakyBackend {
        fn check(&self) -> Result<(), CacheError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(CacheError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
            self.check()?;
            self.inner.get(key).await
        }

        async fn set_ex(&self, key: CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
            self.check()?;
            self.inner.set_ex(key, value, ttl).await
        }

        async fn delete_resource(&self, resource_id: Ulid) -> Result<usize, CacheError> {
            self.check()?;
            self.inner.delete_resource(resource_id).await
        }
    }

    /// Memory backend whose next write parks until released, leaving a
    /// window between the generation check and the store.
    #[derive(Default)]
    struct ParkingBackend {
        inner: MemoryBackend,
        armed: AtomicBool,
        parked: Notify,
        release: Notify,
    }

    #[async_trait]
    impl CacheBackend for ParkingBackend {
        async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
            self.inner.get(key).await
        }

        async fn set_ex(&self, key: CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.parked.notify_one();
                self.release.notified().await;
            }
            self.inner.set_ex(key, value, ttl).await
        }

        async fn delete_resource(&self, resource_id: Ulid) -> Result<usize, CacheError> {
            self.inner.delete_resource(resource_id).await
        }
    }

    #[test]
    fn key_display() {
        let rid = Ulid::nil();
        let key = CacheKey {
            resource_id: rid,
            range: Span::new(10, 20),
        };
        assert_eq!(key.to_string(), format!("calendar:{rid}:10:20"));
    }

    #[tokio::test(start_paused = true)]
    async fn memory_backend_expires_entries() {
        let backend = MemoryBackend::new();
        let key = CacheKey {
            resource_id: Ulid::new(),
            range: Span::new(0, 10),
        };
        backend.set_ex(key, b"x".to_vec(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(backend.get(&key).await.unwrap(), Some(b"x".to_vec()));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(backend.get(&key).await.unwrap(), None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn memory_backend_deletes_whole_resource() {
        let backend = MemoryBackend::new();
        let rid = Ulid::new();
        let other = Ulid::new();
        for range in [Span::new(0, 10), Span::new(0, 20), Span::new(5, 30)] {
            backend
                .set_ex(CacheKey { resource_id: rid, range }, vec![1], TTL)
                .await
                .unwrap();
        }
        backend
            .set_ex(CacheKey { resource_id: other, range: Span::new(0, 10) }, vec![1], TTL)
            .await
            .unwrap();

        assert_eq!(backend.delete_resource(rid).await.unwrap(), 3);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let (store, rid) = store_with_resource("cache_hit.wal").await;
        book(&store, rid, 10 * HOUR_MS, 11 * HOUR_MS).await;

        let backend = Arc::new(FlakyBackend::default());
        let cache = CalendarCache::new(store.clone(), backend.clone(), TTL);
        let range = Span::new(0, 24 * HOUR_MS);

        let first = cache.get_occupancy(rid, range).await.unwrap();
        assert_eq!(first.bookings.len(), 1);
        assert_eq!(backend.inner.len(), 1);

        // A booking written behind the cache's back stays invisible until invalidated.
        book(&store, rid, 12 * HOUR_MS, 13 * HOUR_MS).await;
        let cached = cache.get_occupancy(rid, range).await.unwrap();
        assert_eq!(cached, first);

        cache.invalidate(rid).await;
        let fresh = cache.get_occupancy(rid, range).await.unwrap();
        assert_eq!(fresh.bookings.len(), 2);
    }

    #[tokio::test]
    async fn invalidation_covers_every_range() {
        let (store, rid) = store_with_resource("cache_wildcard.wal").await;
        let backend = Arc::new(MemoryBackend::new());
        let cache = CalendarCache::new(store.clone(), backend.clone(), TTL);

        cache.get_occupancy(rid, Span::new(0, HOUR_MS)).await.unwrap();
        cache.get_occupancy(rid, Span::new(0, 2 * HOUR_MS)).await.unwrap();
        cache.get_occupancy(rid, Span::new(HOUR_MS, 3 * HOUR_MS)).await.unwrap();
        assert_eq!(backend.len(), 3);

        cache.invalidate(rid).await;
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn slow_write_racing_invalidation_is_not_served() {
        let (store, rid) = store_with_resource("cache_race.wal").await;
        let backend = Arc::new(ParkingBackend::default());
        backend.armed.store(true, Ordering::SeqCst);
        let cache = Arc::new(CalendarCache::new(store.clone(), backend.clone(), TTL));
        let range = Span::new(0, 24 * HOUR_MS);

        let miss = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get_occupancy(rid, range).await }
        });
        // The empty view is computed and its write is in flight.
        backend.parked.notified().await;
        book(&store, rid, 10 * HOUR_MS, 11 * HOUR_MS).await;
        cache.invalidate(rid).await;
        backend.release.notify_one();
        assert!(miss.await.unwrap().unwrap().bookings.is_empty());

        // The late write landed, but under the old generation.
        assert_eq!(backend.inner.len(), 1);
        let view = cache.get_occupancy(rid, range).await.unwrap();
        assert_eq!(view.bookings.len(), 1);
        let again = cache.get_occupancy(rid, range).await.unwrap();
        assert_eq!(again, view);
    }

    #[tokio::test]
    async fn backend_failure_falls_back_to_store() {
        let (store, rid) = store_with_resource("cache_fallback.wal").await;
        book(&store, rid, 0, HOUR_MS).await;

        let backend = Arc::new(FlakyBackend::default());
        backend.failing.store(true, Ordering::SeqCst);
        let cache = CalendarCache::new(store.clone(), backend.clone(), TTL);

        let view = cache.get_occupancy(rid, Span::new(0, HOUR_MS)).await.unwrap();
        assert_eq!(view.bookings.len(), 1);
        assert!(backend.inner.is_empty());

        // Failed invalidation is swallowed.
        cache.invalidate(rid).await;
    }

    #[tokio::test]
    async fn undecodable_entry_is_recomputed() {
        let (store, rid) = store_with_resource("cache_garbage.wal").await;
        let backend = Arc::new(MemoryBackend::new());
        let range = Span::new(0, HOUR_MS);
        backend
            .set_ex(CacheKey { resource_id: rid, range }, b"not json".to_vec(), TTL)
            .await
            .unwrap();

        let cache = CalendarCache::new(store.clone(), backend.clone(), TTL);
        let view = cache.get_occupancy(rid, range).await.unwrap();
        assert_eq!(view.resource_id, rid);
        assert!(view.bookings.is_empty());
    }

    #[tokio::test]
    async fn unknown_resource_is_not_found() {
        let (store, _) = store_with_resource("cache_unknown.wal").await;
        let cache = CalendarCache::new(store, Arc::new(MemoryBackend::new()), TTL);
        let missing = Ulid::new();
        let result = cache.get_occupancy(missing, Span::new(0, 10)).await;
        assert_eq!(result, Err(StoreError::NotFound(missing)));
    }
}
