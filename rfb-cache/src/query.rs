//! Cache query adapters.
//!
//! The tiling layer asks one question per tile: what does the cache know
//! about this rectangle's content for the current connection? [`CacheQuery`]
//! is that single-method capability; the two adapters answer it from
//! session-only or persistent cache state.
//!
//! Both adapters share the classification rules: rects below the minimum
//! area, unreadable rects, and degenerate hashes are NotCacheable; an id the
//! connection has been told is a Hit; anything else is an InitCandidate.

use crate::hash::RectHasher;
use crate::index::{PersistentIndex, SessionIndex};
use crate::tiling::TileCacheState;
use parking_lot::Mutex;
use rfb_common::Rect;
use rfb_pixelbuffer::PixelBuffer;
use std::collections::HashSet;
use std::sync::Arc;

/// The single-method capability consumed by the tile classifier.
pub trait CacheQuery {
    fn classify_tile(&mut self, rect: Rect, pb: &dyn PixelBuffer) -> TileCacheState;
}

/// Per-connection record of cache ids the client has been told about.
#[derive(Debug, Default)]
pub struct ClientKnownIds {
    ids: HashSet<u64>,
}

impl ClientKnownIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the client now holds this id (an init was sent).
    pub fn mark_known(&mut self, cache_id: u64) {
        self.ids.insert(cache_id);
    }

    pub fn knows(&self, cache_id: u64) -> bool {
        self.ids.contains(&cache_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Adapter for the session-only cache.
///
/// Ids live in a session-scoped index seeded on first sight; the
/// per-connection known set gates Hit vs InitCandidate.
pub struct SessionCacheQuery {
    hasher: Arc<dyn RectHasher + Send + Sync>,
    index: Arc<Mutex<SessionIndex>>,
    known: Arc<Mutex<ClientKnownIds>>,
    min_rect_area: u64,
}

impl SessionCacheQuery {
    pub fn new(
        hasher: Arc<dyn RectHasher + Send + Sync>,
        index: Arc<Mutex<SessionIndex>>,
        known: Arc<Mutex<ClientKnownIds>>,
        min_rect_area: u64,
    ) -> Self {
        Self {
            hasher,
            index,
            known,
            min_rect_area,
        }
    }
}

impl CacheQuery for SessionCacheQuery {
    fn classify_tile(&mut self, rect: Rect, pb: &dyn PixelBuffer) -> TileCacheState {
        if rect.is_empty() || rect.area() < self.min_rect_area {
            return TileCacheState::NotCacheable;
        }
        let Some(hash) = self.hasher.hash_rect(rect, pb) else {
            return TileCacheState::NotCacheable;
        };
        if hash.is_degenerate() {
            return TileCacheState::NotCacheable;
        }
        let cache_id = hash.cache_id();

        let newly_seen = self.index.lock().observe(cache_id);
        if newly_seen {
            tracing::trace!(cache_id, ?rect, "seeded session cache id");
        }

        if self.known.lock().knows(cache_id) {
            TileCacheState::Hit
        } else {
            TileCacheState::InitCandidate
        }
    }
}

/// Adapter for the persistent cache.
///
/// Lookups hit the persistent index shared across connections (and across
/// viewer processes when coordinated); the connection-local known set still
/// gates Hit.
pub struct PersistentCacheQuery {
    hasher: Arc<dyn RectHasher + Send + Sync>,
    index: Arc<Mutex<PersistentIndex>>,
    known: Arc<Mutex<ClientKnownIds>>,
    min_rect_area: u64,
}

impl PersistentCacheQuery {
    pub fn new(
        hasher: Arc<dyn RectHasher + Send + Sync>,
        index: Arc<Mutex<PersistentIndex>>,
        known: Arc<Mutex<ClientKnownIds>>,
        min_rect_area: u64,
    ) -> Self {
        Self {
            hasher,
            index,
            known,
            min_rect_area,
        }
    }
}

impl CacheQuery for PersistentCacheQuery {
    fn classify_tile(&mut self, rect: Rect, pb: &dyn PixelBuffer) -> TileCacheState {
        if rect.is_empty() || rect.area() < self.min_rect_area {
            return TileCacheState::NotCacheable;
        }
        let Some(hash) = self.hasher.hash_rect(rect, pb) else {
            return TileCacheState::NotCacheable;
        };
        if hash.is_degenerate() {
            return TileCacheState::NotCacheable;
        }
        let cache_id = hash.cache_id();

        if self.known.lock().knows(cache_id) {
            return TileCacheState::Hit;
        }
        if self.index.lock().contains(cache_id) {
            tracing::trace!(cache_id, ?rect, "persistent entry known, client not told");
        }
        TileCacheState::InitCandidate
    }
}
