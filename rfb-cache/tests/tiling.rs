//! End-to-end tiling flow: classify an update region against the persistent
//! cache, extract the largest Hit rectangle, and account for the bandwidth
//! the substitution would save.

use parking_lot::Mutex;
use rfb_cache::hash::{ContentHash, RectHasher};
use rfb_cache::index::PersistentIndex;
use rfb_cache::query::{ClientKnownIds, PersistentCacheQuery};
use rfb_cache::stats::{
    track_persistent_cache_init, track_persistent_cache_ref, CacheProtocolStats,
};
use rfb_cache::tiling::{analyze_update, TileCacheState, TilingConfig};
use rfb_common::Rect;
use rfb_pixelbuffer::{ManagedPixelBuffer, PixelBuffer, PixelFormat};
use std::sync::Arc;

/// FNV-1a over the rect's geometry and pixel rows. Deterministic, and good
/// enough to stand in for the real content digest in tests.
struct FnvHasher;

impl RectHasher for FnvHasher {
    fn hash_rect(&self, rect: Rect, pb: &dyn PixelBuffer) -> Option<ContentHash> {
        let mut stride = 0;
        let data = pb.get_buffer(rect, &mut stride)?;
        let bpp = pb.pixel_format().bytes_per_pixel() as usize;

        let mut h: u64 = 0xcbf29ce484222325;
        let mut step = |byte: u8| {
            h ^= byte as u64;
            h = h.wrapping_mul(0x100000001b3);
        };
        for b in rect.width().to_be_bytes() {
            step(b);
        }
        for b in rect.height().to_be_bytes() {
            step(b);
        }
        for row in 0..rect.height() as usize {
            let start = row * stride * bpp;
            let end = start + rect.width() as usize * bpp;
            for &b in &data[start..end] {
                step(b);
            }
        }

        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&h.to_be_bytes());
        bytes[8..].copy_from_slice(&h.rotate_left(31).to_be_bytes());
        Some(ContentHash::from_bytes(bytes))
    }
}

/// A 256x256 buffer whose four 128-pixel quadrants carry distinct content,
/// so each tile of the default grid hashes to its own cache id.
fn quadrant_buffer() -> ManagedPixelBuffer {
    let mut pb = ManagedPixelBuffer::new(PixelFormat::rgb888(), 256, 256);
    let colors: [[u8; 4]; 4] = [
        [0x20, 0x40, 0x60, 0x00],
        [0x80, 0x10, 0x10, 0x00],
        [0x10, 0x80, 0x10, 0x00],
        [0x10, 0x10, 0x80, 0x00],
    ];
    for (i, color) in colors.iter().enumerate() {
        let x = (i % 2) as i32 * 128;
        let y = (i / 2) as i32 * 128;
        let tile: Vec<u8> = color.iter().copied().cycle().take(128 * 128 * 4).collect();
        pb.write_rect(Rect::new(x, y, x + 128, y + 128), &tile, 128)
            .unwrap();
    }
    pb
}

fn query_for(
    index: &Arc<Mutex<PersistentIndex>>,
    known: &Arc<Mutex<ClientKnownIds>>,
) -> PersistentCacheQuery {
    PersistentCacheQuery::new(Arc::new(FnvHasher), index.clone(), known.clone(), 4096)
}

#[test]
fn test_cold_then_warm_analysis() {
    let pb = quadrant_buffer();
    let bounds = Rect::new(0, 0, 256, 256);
    let index = Arc::new(Mutex::new(PersistentIndex::new()));
    let known = Arc::new(Mutex::new(ClientKnownIds::new()));
    let config = TilingConfig {
        min_tiles: 1,
        ..TilingConfig::default()
    };

    // Cold pass: nothing has been told to the client, every tile is an
    // init candidate and no Hit rectangle exists.
    let mut query = query_for(&index, &known);
    let cold = analyze_update(bounds, Some(&pb), &mut query, &config);
    assert_eq!(cold.grid.tiles_x, 2);
    assert_eq!(cold.grid.tiles_y, 2);
    assert!(cold
        .grid
        .tiles
        .iter()
        .all(|t| t.state == TileCacheState::InitCandidate));
    assert!(cold.max_rect.is_none());

    // The encoder sends inits for every candidate and records what the
    // client now knows.
    let mut stats = CacheProtocolStats::default();
    for tile in &cold.grid.tiles {
        let id = FnvHasher.hash_rect(tile.rect, &pb).unwrap().cache_id();
        known.lock().mark_known(id);
        track_persistent_cache_init(&mut stats, 1000);
    }
    assert_eq!(stats.cached_rect_init_count, 4);

    // Warm pass: identical content is now entirely Hit, and the largest
    // rectangle covers the whole update.
    let mut query = query_for(&index, &known);
    let warm = analyze_update(bounds, Some(&pb), &mut query, &config);
    assert!(warm
        .grid
        .tiles
        .iter()
        .all(|t| t.state == TileCacheState::Hit));
    let max = warm.max_rect.expect("warm pass yields a hit rectangle");
    assert_eq!(max.rect, bounds);
    assert_eq!((max.tiles_wide, max.tiles_high), (2, 2));
    assert!(warm.should_emit_refs(&config));

    // References replace re-encoded pixels; the accounting shows the win.
    let pf = PixelFormat::rgb888();
    for tile in &warm.grid.tiles {
        track_persistent_cache_ref(&mut stats, &tile.rect, &pf);
    }
    assert_eq!(stats.cached_rect_count, 4);
    assert!(stats.bandwidth_saved() > 0);
    let pct = stats.reduction_percentage();
    assert!(pct > 90.0 && pct <= 100.0, "reduction was {}", pct);
}

#[test]
fn test_content_change_invalidates_hits() {
    let mut pb = quadrant_buffer();
    let bounds = Rect::new(0, 0, 256, 256);
    let index = Arc::new(Mutex::new(PersistentIndex::new()));
    let known = Arc::new(Mutex::new(ClientKnownIds::new()));
    let config = TilingConfig {
        min_tiles: 1,
        ..TilingConfig::default()
    };

    // Warm the client on the current content.
    let mut query = query_for(&index, &known);
    let grid = analyze_update(bounds, Some(&pb), &mut query, &config).grid;
    for tile in &grid.tiles {
        let id = FnvHasher.hash_rect(tile.rect, &pb).unwrap().cache_id();
        known.lock().mark_known(id);
    }

    // Repaint the top-left tile: its hash changes, so it drops back to
    // init candidate while the rest stay Hit.
    let patch: Vec<u8> = [0xFF, 0x00, 0x00, 0x00]
        .iter()
        .copied()
        .cycle()
        .take(128 * 128 * 4)
        .collect();
    pb.write_rect(Rect::new(0, 0, 128, 128), &patch, 128).unwrap();

    let mut query = query_for(&index, &known);
    let analysis = analyze_update(bounds, Some(&pb), &mut query, &config);
    let states: Vec<TileCacheState> = analysis.grid.tiles.iter().map(|t| t.state).collect();
    assert_eq!(states[0], TileCacheState::InitCandidate);
    assert!(states[1..]
        .iter()
        .all(|&s| s == TileCacheState::Hit));

    // Three Hit tiles remain; the best rectangle is the right column or
    // bottom row of two tiles.
    let max = analysis.max_rect.unwrap();
    assert_eq!(max.tiles_wide * max.tiles_high, 2);
}

#[test]
fn test_min_tiles_gate_suppresses_small_wins() {
    let pb = quadrant_buffer();
    let bounds = Rect::new(0, 0, 256, 256);
    let index = Arc::new(Mutex::new(PersistentIndex::new()));
    let known = Arc::new(Mutex::new(ClientKnownIds::new()));

    let mut query = query_for(&index, &known);
    let grid = analyze_update(bounds, Some(&pb), &mut query, &TilingConfig::default()).grid;
    // Tell the client about a single tile only.
    let id = FnvHasher
        .hash_rect(grid.tiles[0].rect, &pb)
        .unwrap()
        .cache_id();
    known.lock().mark_known(id);

    // With the default 4-tile minimum, one Hit tile is not worth a
    // reference rectangle.
    let mut query = query_for(&index, &known);
    let analysis = analyze_update(bounds, Some(&pb), &mut query, &TilingConfig::default());
    assert!(analysis.max_rect.is_none());
}
