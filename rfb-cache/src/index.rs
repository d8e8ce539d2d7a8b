//! Server-side cache indices and the wire index entry record.
//!
//! Two indices back the cache query adapters: a session-scoped id set that
//! lives and dies with one RFB session, and the persistent index shared
//! across connections (and, via the coordinator, across viewer processes).
//! The persistent index is a map from cache id to [`WireIndexEntry`], the
//! fixed-size record that also travels inside coordinator messages.

use bytes::{Buf, BufMut};
use std::collections::{BTreeMap, HashSet};

/// Fixed-size record describing one persistent cache entry.
///
/// # Wire Format (32 bytes, big-endian)
///
/// - 8 bytes: cache_id (u64)
/// - 4 bytes: shard identifier (u32)
/// - 8 bytes: payload offset within the shard (u64)
/// - 4 bytes: payload length (u32)
/// - 2 bytes: pixel width (u16)
/// - 2 bytes: pixel height (u16)
/// - 4 bytes: encoding discriminator (i32)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireIndexEntry {
    pub cache_id: u64,
    pub shard: u32,
    pub offset: u64,
    pub length: u32,
    pub width: u16,
    pub height: u16,
    pub encoding: i32,
}

/// Encoded size of a [`WireIndexEntry`].
pub const WIRE_INDEX_ENTRY_BYTES: usize = 32;

impl WireIndexEntry {
    /// Append the 32-byte encoding to `buf`.
    pub fn encode_to(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.cache_id);
        buf.put_u32(self.shard);
        buf.put_u64(self.offset);
        buf.put_u32(self.length);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
    }

    /// Decode one entry, consuming 32 bytes from `buf`.
    ///
    /// Returns `None` if fewer than 32 bytes remain (nothing is consumed in
    /// that case).
    pub fn decode_from(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < WIRE_INDEX_ENTRY_BYTES {
            return None;
        }
        Some(Self {
            cache_id: buf.get_u64(),
            shard: buf.get_u32(),
            offset: buf.get_u64(),
            length: buf.get_u32(),
            width: buf.get_u16(),
            height: buf.get_u16(),
            encoding: buf.get_i32(),
        })
    }
}

impl PartialOrd for WireIndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WireIndexEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.cache_id.cmp(&other.cache_id)
    }
}

/// Session-scoped cache index: the set of ids this session has seen.
///
/// The session adapter seeds ids on first sight, so "exists server-side"
/// and "has been observed this session" coincide.
#[derive(Debug, Default)]
pub struct SessionIndex {
    ids: HashSet<u64>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an id; returns true if it was not previously present.
    pub fn observe(&mut self, cache_id: u64) -> bool {
        self.ids.insert(cache_id)
    }

    pub fn contains(&self, cache_id: u64) -> bool {
        self.ids.contains(&cache_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Persistent cache index shared across connections.
///
/// Ordered by cache id so snapshots are deterministic. The current shard id
/// tracks where new payloads are being appended; the coordinator hands it to
/// slaves inside WELCOME.
#[derive(Debug, Default)]
pub struct PersistentIndex {
    entries: BTreeMap<u64, WireIndexEntry>,
    current_shard: u32,
}

impl PersistentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry, keyed by its cache id.
    pub fn insert(&mut self, entry: WireIndexEntry) {
        if entry.shard > self.current_shard {
            self.current_shard = entry.shard;
        }
        self.entries.insert(entry.cache_id, entry);
    }

    /// Apply a batch of entries (WELCOME snapshot or INDEX_UPDATE).
    pub fn apply(&mut self, entries: &[WireIndexEntry]) {
        for entry in entries {
            self.insert(*entry);
        }
    }

    pub fn get(&self, cache_id: u64) -> Option<&WireIndexEntry> {
        self.entries.get(&cache_id)
    }

    pub fn contains(&self, cache_id: u64) -> bool {
        self.entries.contains_key(&cache_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in cache-id order.
    pub fn snapshot(&self) -> Vec<WireIndexEntry> {
        self.entries.values().copied().collect()
    }

    pub fn current_shard(&self) -> u32 {
        self.current_shard
    }

    pub fn set_current_shard(&mut self, shard: u32) {
        self.current_shard = shard;
    }
}
