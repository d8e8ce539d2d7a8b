//! RFB rectangle-stream message types.
//!
//! - [`types`] - rectangle header and encoding constants
//! - [`cache`] - the four cache-aware rectangle variants

pub mod cache;
pub mod types;

#[cfg(test)]
mod proptest_framing;

pub use cache::{CachedRect, CachedRectInit, PersistentCachedRect, PersistentCachedRectInit};
pub use types::Rectangle;
