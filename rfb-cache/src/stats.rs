//! Cache protocol bandwidth statistics.
//!
//! Byte-exact counters of reference, init, and baseline costs, uniform
//! across both cache protocols. The baseline is deliberately modelled as
//! **uncompressed pixel bytes plus a 16-byte rect header**: the reported
//! reduction reflects the maximum potential saving of caching and is
//! independent of any particular encoder's compression ratio. This is a
//! presentational choice.

use rfb_common::Rect;
use rfb_pixelbuffer::PixelFormat;
use rfb_protocol::messages::cache::{CACHE_INIT_OVERHEAD_BYTES, CACHE_REF_WIRE_BYTES};

/// Baseline per-rectangle header cost used for the alternative estimate.
const BASELINE_HEADER_BYTES: u64 = 16;

/// Aggregate bandwidth statistics for a single cache protocol.
///
/// Counters are monotonically non-decreasing over a session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheProtocolStats {
    /// Bytes actually sent on the wire for reference messages
    /// (CachedRect / PersistentCachedRect).
    pub cached_rect_bytes: u64,
    pub cached_rect_count: u32,

    /// Bytes actually sent on the wire for init messages
    /// (CachedRectInit / PersistentCachedRectInit), header plus payload.
    pub cached_rect_init_bytes: u64,
    pub cached_rect_init_count: u32,

    /// Estimated bytes that would have been sent without the cache.
    pub alternative_bytes: u64,
}

impl CacheProtocolStats {
    /// Estimated bytes saved compared to the alternative baseline.
    pub fn bandwidth_saved(&self) -> u64 {
        let used = self.cached_rect_bytes + self.cached_rect_init_bytes;
        self.alternative_bytes.saturating_sub(used)
    }

    /// Estimated reduction percentage vs the alternative baseline.
    ///
    /// Zero when nothing was tracked or the cache cost more than it saved;
    /// always within [0, 100].
    pub fn reduction_percentage(&self) -> f64 {
        let used = self.cached_rect_bytes + self.cached_rect_init_bytes;
        if self.alternative_bytes == 0 || used >= self.alternative_bytes {
            0.0
        } else {
            100.0 * (self.alternative_bytes - used) as f64 / self.alternative_bytes as f64
        }
    }

    /// Format a one-line human-readable summary, e.g.
    /// `"Cache: 2.3 MiB bandwidth saving (87.5% reduction)"`.
    pub fn format_summary(&self, label: &str) -> String {
        format!(
            "{}: {} bandwidth saving ({:.1}% reduction)",
            label,
            human_bytes(self.bandwidth_saved()),
            self.reduction_percentage(),
        )
    }
}

/// Uncompressed pixel byte count for a rectangle under a pixel format.
fn uncompressed_bytes(rect: &Rect, pf: &PixelFormat) -> u64 {
    rect.area() * pf.bits_per_pixel as u64 / 8
}

/// Track a session-cache reference (CachedRect).
///
/// Wire cost: 20 bytes (12-byte rect header + 8-byte cache id). Baseline:
/// 16-byte header plus uncompressed pixels.
pub fn track_content_cache_ref(stats: &mut CacheProtocolStats, rect: &Rect, pf: &PixelFormat) {
    let alt = BASELINE_HEADER_BYTES + uncompressed_bytes(rect, pf);
    stats.cached_rect_bytes = stats.cached_rect_bytes.saturating_add(CACHE_REF_WIRE_BYTES);
    stats.alternative_bytes = stats.alternative_bytes.saturating_add(alt);
    stats.cached_rect_count = stats.cached_rect_count.saturating_add(1);
}

/// Track a session-cache init (CachedRectInit).
///
/// `compressed_bytes` is the size of the encoded payload, excluding the
/// 24-byte cache-init overhead.
pub fn track_content_cache_init(stats: &mut CacheProtocolStats, compressed_bytes: u64) {
    stats.cached_rect_init_bytes = stats
        .cached_rect_init_bytes
        .saturating_add(CACHE_INIT_OVERHEAD_BYTES + compressed_bytes);
    stats.alternative_bytes = stats
        .alternative_bytes
        .saturating_add(BASELINE_HEADER_BYTES + compressed_bytes);
    stats.cached_rect_init_count = stats.cached_rect_init_count.saturating_add(1);
}

/// Track a persistent-cache reference (PersistentCachedRect).
///
/// The persistent protocol uses the same 20-byte reference framing as the
/// session protocol, so the accounting is identical.
pub fn track_persistent_cache_ref(
    stats: &mut CacheProtocolStats,
    rect: &Rect,
    pf: &PixelFormat,
) {
    track_content_cache_ref(stats, rect, pf);
}

/// Track a persistent-cache init (PersistentCachedRectInit).
pub fn track_persistent_cache_init(stats: &mut CacheProtocolStats, compressed_bytes: u64) {
    track_content_cache_init(stats, compressed_bytes);
}

/// IEC-style byte formatter (B, KiB, MiB, GiB).
fn human_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

    let b = bytes as f64;
    if b >= GIB {
        format!("{:.1} GiB", b / GIB)
    } else if b >= MIB {
        format!("{:.1} MiB", b / MIB)
    } else if b >= KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{} B", bytes)
    }
}
