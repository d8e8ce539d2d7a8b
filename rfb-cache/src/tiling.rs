//! Tile grid classification over a framebuffer update region.
//!
//! Before encoding an update rectangle, the region is cut into fixed-size
//! tiles and each tile is classified against cache state: can it be served
//! as a reference, does it need an init, or is it not cacheable at all. The
//! grid feeds [`crate::maxrect`], which extracts the largest contiguous Hit
//! region worth substituting for re-encoded pixels.
//!
//! The grid is aligned to the bounding rect's top-left corner, not to an
//! absolute framebuffer origin, keeping the analysis entirely local to the
//! current update region.

use crate::maxrect::{find_largest_hit_rectangle, MaxRect};
use crate::query::CacheQuery;
use once_cell::sync::Lazy;
use rfb_common::Rect;
use rfb_pixelbuffer::PixelBuffer;

/// Default tile edge in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 128;

/// Default minimum area, in tiles, for a Hit rectangle to be worth emitting.
pub const DEFAULT_MIN_TILES: usize = 4;

/// Default minimum rectangle area, in pixels, below which tiles are not
/// hashed at all.
pub const DEFAULT_MIN_RECT_AREA: u64 = 4096;

/// Environment variable enabling log-only tiling analysis.
pub const ENV_TILE_DEBUG: &str = "RFB_CACHE_TILE_DEBUG";

/// Environment variable overriding the tile edge (positive integer, pixels).
pub const ENV_TILE_SIZE: &str = "RFB_CACHE_TILE_SIZE";

/// Per-tile cache classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileCacheState {
    /// Empty, sub-threshold, or degenerate: never served from cache.
    NotCacheable,
    /// This connection has been told about a cache entry covering the tile.
    Hit,
    /// An entry exists (or could be seeded) server-side but has not been
    /// sent to this connection yet.
    InitCandidate,
}

/// One tile: its pixel rectangle and classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileInfo {
    pub rect: Rect,
    pub state: TileCacheState,
}

/// Row-major tile grid covering an update region.
///
/// The tile at grid position `(tx, ty)` lives at index `ty * tiles_x + tx`.
#[derive(Debug, Default)]
pub struct TileGrid {
    pub tiles: Vec<TileInfo>,
    pub tiles_x: usize,
    pub tiles_y: usize,
}

impl TileGrid {
    /// The empty grid.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Borrow the tile at grid position `(tx, ty)`.
    pub fn tile(&self, tx: usize, ty: usize) -> Option<&TileInfo> {
        if tx < self.tiles_x && ty < self.tiles_y {
            self.tiles.get(ty * self.tiles_x + tx)
        } else {
            None
        }
    }
}

/// Tiling tunables, normally read once from the environment.
#[derive(Debug, Clone)]
pub struct TilingConfig {
    /// Log the analysis outcome without letting it steer the encoder.
    pub debug_log_only: bool,
    /// Tile edge in pixels.
    pub tile_size: u32,
    /// Minimum Hit-rectangle area in tiles.
    pub min_tiles: usize,
    /// Minimum rect area in pixels before hashing is attempted.
    pub min_rect_area: u64,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            debug_log_only: false,
            tile_size: DEFAULT_TILE_SIZE,
            min_tiles: DEFAULT_MIN_TILES,
            min_rect_area: DEFAULT_MIN_RECT_AREA,
        }
    }
}

impl TilingConfig {
    /// Build a config from the process environment.
    ///
    /// `RFB_CACHE_TILE_DEBUG` (set and non-zero) enables log-only analysis;
    /// `RFB_CACHE_TILE_SIZE` overrides the tile edge. Invalid or
    /// non-positive overrides fall back to the default.
    pub fn from_env() -> Self {
        let debug_log_only = std::env::var(ENV_TILE_DEBUG)
            .map(|v| !v.is_empty() && v != "0")
            .unwrap_or(false);
        let tile_size = std::env::var(ENV_TILE_SIZE)
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|&size| size > 0)
            .unwrap_or(DEFAULT_TILE_SIZE);
        Self {
            debug_log_only,
            tile_size,
            ..Self::default()
        }
    }

    /// The process-wide config, read from the environment once.
    pub fn global() -> &'static TilingConfig {
        static CONFIG: Lazy<TilingConfig> = Lazy::new(TilingConfig::from_env);
        &CONFIG
    }
}

/// Classify the tiles covering `bounds` into a row-major grid.
///
/// Tiles have edge `tile_size`; boundary tiles at the right and bottom are
/// clipped to `bounds`. With no pixel buffer, an empty bounds, or a
/// non-positive tile size, the result is the empty grid and the query is
/// never invoked. Otherwise `query.classify_tile` is called exactly once per
/// tile.
pub fn build_tiling_grid(
    bounds: Rect,
    tile_size: u32,
    pb: Option<&dyn PixelBuffer>,
    query: &mut dyn CacheQuery,
) -> TileGrid {
    let Some(pb) = pb else {
        return TileGrid::empty();
    };
    if bounds.is_empty() || tile_size == 0 {
        return TileGrid::empty();
    }

    let tiles_x = bounds.width().div_ceil(tile_size) as usize;
    let tiles_y = bounds.height().div_ceil(tile_size) as usize;
    let mut tiles = Vec::with_capacity(tiles_x * tiles_y);

    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x1 = bounds.tl.x + (tx as i32) * tile_size as i32;
            let y1 = bounds.tl.y + (ty as i32) * tile_size as i32;
            let x2 = (x1 + tile_size as i32).min(bounds.br.x);
            let y2 = (y1 + tile_size as i32).min(bounds.br.y);
            let rect = Rect::new(x1, y1, x2, y2);
            let state = query.classify_tile(rect, pb);
            tiles.push(TileInfo { rect, state });
        }
    }

    TileGrid {
        tiles,
        tiles_x,
        tiles_y,
    }
}

/// Outcome of one pre-encoding tiling pass.
#[derive(Debug)]
pub struct TilingAnalysis {
    pub grid: TileGrid,
    pub max_rect: Option<MaxRect>,
}

impl TilingAnalysis {
    /// True when the encoder should substitute cache references for the
    /// extracted rectangle. Always false in log-only mode.
    pub fn should_emit_refs(&self, config: &TilingConfig) -> bool {
        !config.debug_log_only && self.max_rect.is_some()
    }
}

/// Run the full pre-encoding analysis for one update rectangle: classify
/// tiles, then extract the largest Hit rectangle meeting the area threshold.
pub fn analyze_update(
    bounds: Rect,
    pb: Option<&dyn PixelBuffer>,
    query: &mut dyn CacheQuery,
    config: &TilingConfig,
) -> TilingAnalysis {
    let grid = build_tiling_grid(bounds, config.tile_size, pb, query);
    let max_rect =
        find_largest_hit_rectangle(&grid.tiles, grid.tiles_x, grid.tiles_y, config.min_tiles);

    if config.debug_log_only {
        let hits = grid
            .tiles
            .iter()
            .filter(|t| t.state == TileCacheState::Hit)
            .count();
        tracing::debug!(
            tiles_x = grid.tiles_x,
            tiles_y = grid.tiles_y,
            hits,
            max_rect = ?max_rect,
            "tiling analysis (log-only)"
        );
    }

    TilingAnalysis { grid, max_rect }
}
