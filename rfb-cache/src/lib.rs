//! Shared cache subsystem for the RFB server/viewer stack.
//!
//! This crate eliminates redundant transmission of pixel content across an
//! RFB session (and, with the persistent cache, across sessions and viewer
//! processes) by assigning stable identifiers to pixel rectangles, tracking
//! client knowledge of those identifiers, and substituting short reference
//! messages for re-encoded pixels whenever both endpoints already agree on
//! the content.
//!
//! # Modules
//!
//! - [`hash`] - content-hash seam and 64-bit cache ids
//! - [`index`] - session and persistent cache indices, wire index entries
//! - [`stats`] - byte-exact bandwidth accounting for both cache protocols
//! - [`tiling`] - tile grid classification over an update region
//! - [`maxrect`] - largest all-Hit rectangle extraction
//! - [`query`] - cache query adapters bridging tiling to cache state
//! - [`coord`] - multi-viewer coordinator (master election, write RPC,
//!   index-update broadcast)

pub mod coord;
pub mod hash;
pub mod index;
pub mod maxrect;
pub mod query;
pub mod stats;
pub mod tiling;

pub use hash::{ContentHash, RectHasher};
pub use index::{PersistentIndex, SessionIndex, WireIndexEntry};
pub use maxrect::{find_largest_hit_rectangle, MaxRect};
pub use query::{CacheQuery, ClientKnownIds, PersistentCacheQuery, SessionCacheQuery};
pub use stats::CacheProtocolStats;
pub use tiling::{
    analyze_update, build_tiling_grid, TileCacheState, TileGrid, TileInfo, TilingAnalysis,
    TilingConfig,
};
