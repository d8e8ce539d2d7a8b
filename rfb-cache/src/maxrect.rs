//! Largest all-Hit rectangle extraction.
//!
//! Classic O(tiles_x * tiles_y) largest-rectangle-in-a-binary-matrix: each
//! row maintains a histogram of consecutive Hit tiles reaching upward,
//! collapsed to zero at every non-Hit tile; a monotonic stack then yields
//! the largest rectangle ending at that row. The running maximum over all
//! rows is the answer, with the first maximum encountered winning ties.

use crate::tiling::{TileCacheState, TileInfo};
use rfb_common::Rect;

/// The largest rectangle of Hit tiles, in pixel space plus tile extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxRect {
    /// Pixel rectangle spanned, from the top-left tile's `tl` to the
    /// bottom-right tile's `br`.
    pub rect: Rect,
    pub tiles_wide: usize,
    pub tiles_high: usize,
}

/// Find the largest axis-aligned rectangle of Hit tiles with area of at
/// least `max(1, min_tiles)` tiles.
///
/// `tiles` is row-major with dimensions `tiles_x` by `tiles_y`. Returns
/// `None` for empty input, inconsistent dimensions, or when no qualifying
/// rectangle exists.
pub fn find_largest_hit_rectangle(
    tiles: &[TileInfo],
    tiles_x: usize,
    tiles_y: usize,
    min_tiles: usize,
) -> Option<MaxRect> {
    if tiles_x == 0 || tiles_y == 0 || tiles.len() != tiles_x * tiles_y {
        return None;
    }
    let min_tiles = min_tiles.max(1);

    // (area, x0, y0, x1, y1) in tile coordinates, corners inclusive.
    let mut best: Option<(usize, usize, usize, usize, usize)> = None;
    let mut heights = vec![0usize; tiles_x];

    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            heights[tx] = if tiles[ty * tiles_x + tx].state == TileCacheState::Hit {
                heights[tx] + 1
            } else {
                0
            };
        }

        // Monotonic stack over the histogram, with a zero-height sentinel
        // pass at i == tiles_x to flush remaining bars.
        let mut stack: Vec<usize> = Vec::new();
        for i in 0..=tiles_x {
            let h = if i < tiles_x { heights[i] } else { 0 };
            while let Some(&top) = stack.last() {
                if heights[top] <= h {
                    break;
                }
                stack.pop();
                let height = heights[top];
                let left = stack.last().map_or(0, |&below| below + 1);
                let area = height * (i - left);
                if best.map_or(true, |(best_area, ..)| area > best_area) {
                    best = Some((area, left, ty + 1 - height, i - 1, ty));
                }
            }
            stack.push(i);
        }
    }

    let (area, x0, y0, x1, y1) = best?;
    if area < min_tiles {
        return None;
    }

    let tl = tiles[y0 * tiles_x + x0].rect.tl;
    let br = tiles[y1 * tiles_x + x1].rect.br;
    Some(MaxRect {
        rect: Rect { tl, br },
        tiles_wide: x1 - x0 + 1,
        tiles_high: y1 - y0 + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TILE: i32 = 64;

    /// Build a row-major grid from a bitmap of Hit flags.
    fn grid(hits: &[&[bool]]) -> (Vec<TileInfo>, usize, usize) {
        let tiles_y = hits.len();
        let tiles_x = if tiles_y > 0 { hits[0].len() } else { 0 };
        let mut tiles = Vec::with_capacity(tiles_x * tiles_y);
        for (ty, row) in hits.iter().enumerate() {
            assert_eq!(row.len(), tiles_x);
            for (tx, &hit) in row.iter().enumerate() {
                let x1 = tx as i32 * TILE;
                let y1 = ty as i32 * TILE;
                tiles.push(TileInfo {
                    rect: Rect::new(x1, y1, x1 + TILE, y1 + TILE),
                    state: if hit {
                        TileCacheState::Hit
                    } else {
                        TileCacheState::NotCacheable
                    },
                });
            }
        }
        (tiles, tiles_x, tiles_y)
    }

    /// Exact maximum over all axis-aligned all-Hit sub-rectangles.
    fn brute_force_max_area(hits: &[Vec<bool>]) -> usize {
        let tiles_y = hits.len();
        let tiles_x = if tiles_y > 0 { hits[0].len() } else { 0 };
        let mut best = 0;
        for y0 in 0..tiles_y {
            for y1 in y0..tiles_y {
                for x0 in 0..tiles_x {
                    'corner: for x1 in x0..tiles_x {
                        for row in hits.iter().take(y1 + 1).skip(y0) {
                            for &hit in row.iter().take(x1 + 1).skip(x0) {
                                if !hit {
                                    continue 'corner;
                                }
                            }
                        }
                        best = best.max((y1 - y0 + 1) * (x1 - x0 + 1));
                    }
                }
            }
        }
        best
    }

    #[test]
    fn test_empty_input() {
        assert!(find_largest_hit_rectangle(&[], 0, 0, 1).is_none());
    }

    #[test]
    fn test_no_hits() {
        let (tiles, tx, ty) = grid(&[&[false, false], &[false, false]]);
        assert!(find_largest_hit_rectangle(&tiles, tx, ty, 1).is_none());
    }

    #[test]
    fn test_all_hits_covers_grid() {
        let (tiles, tx, ty) = grid(&[&[true, true], &[true, true]]);
        let max = find_largest_hit_rectangle(&tiles, tx, ty, 1).unwrap();
        assert_eq!(max.rect, Rect::new(0, 0, 2 * TILE, 2 * TILE));
        assert_eq!((max.tiles_wide, max.tiles_high), (2, 2));
    }

    #[test]
    fn test_four_by_four_with_hole() {
        // 4x4 all Hit except (1,1): the maximum is 12 tiles, either 4x3
        // below the hole or 3x4 to its right.
        let (tiles, tx, ty) = grid(&[
            &[true, true, true, true],
            &[true, false, true, true],
            &[true, true, true, true],
            &[true, true, true, true],
        ]);
        let max = find_largest_hit_rectangle(&tiles, tx, ty, 1).unwrap();
        assert_eq!(max.tiles_wide * max.tiles_high, 12);
        assert!(
            (max.tiles_wide, max.tiles_high) == (4, 3)
                || (max.tiles_wide, max.tiles_high) == (3, 4),
            "unexpected extent {:?}",
            (max.tiles_wide, max.tiles_high)
        );
    }

    #[test]
    fn test_min_tiles_threshold() {
        let (tiles, tx, ty) = grid(&[&[true, false], &[false, false]]);
        // A single Hit tile qualifies at min_tiles 1 but not 2.
        let max = find_largest_hit_rectangle(&tiles, tx, ty, 1).unwrap();
        assert_eq!((max.tiles_wide, max.tiles_high), (1, 1));
        assert!(find_largest_hit_rectangle(&tiles, tx, ty, 2).is_none());
    }

    #[test]
    fn test_min_tiles_zero_coerced_to_one() {
        let (tiles, tx, ty) = grid(&[&[true]]);
        assert!(find_largest_hit_rectangle(&tiles, tx, ty, 0).is_some());
    }

    #[test]
    fn test_tall_and_wide_bands() {
        let (tiles, tx, ty) = grid(&[
            &[true, false, true],
            &[true, false, true],
            &[true, true, true],
        ]);
        // Columns of height 3 beat the bottom row of width 3.
        let max = find_largest_hit_rectangle(&tiles, tx, ty, 1).unwrap();
        assert_eq!(max.tiles_wide * max.tiles_high, 3);
        // First maximum encountered: the left column.
        assert_eq!(max.rect.tl, rfb_common::Point::new(0, 0));
    }

    #[test]
    fn test_pixel_rect_spans_clipped_tiles() {
        // Bottom-right tile clipped narrower/shorter, as at region edges.
        let mut tiles = vec![
            TileInfo {
                rect: Rect::new(0, 0, 64, 64),
                state: TileCacheState::Hit,
            },
            TileInfo {
                rect: Rect::new(64, 0, 100, 64),
                state: TileCacheState::Hit,
            },
            TileInfo {
                rect: Rect::new(0, 64, 64, 80),
                state: TileCacheState::Hit,
            },
            TileInfo {
                rect: Rect::new(64, 64, 100, 80),
                state: TileCacheState::Hit,
            },
        ];
        let max = find_largest_hit_rectangle(&tiles, 2, 2, 1).unwrap();
        assert_eq!(max.rect, Rect::new(0, 0, 100, 80));

        tiles[3].state = TileCacheState::InitCandidate;
        let max = find_largest_hit_rectangle(&tiles, 2, 2, 1).unwrap();
        assert_eq!(max.tiles_wide * max.tiles_high, 2);
    }

    proptest! {
        /// The stack algorithm matches the O(n^2 m^2) brute force.
        #[test]
        fn test_matches_brute_force(
            rows in prop::collection::vec(
                prop::collection::vec(prop::bool::ANY, 1..8),
                1..8,
            ),
            min_tiles in 0usize..4,
        ) {
            let tiles_x = rows.iter().map(Vec::len).min().unwrap();
            let hits: Vec<Vec<bool>> =
                rows.iter().map(|r| r[..tiles_x].to_vec()).collect();
            let refs: Vec<&[bool]> = hits.iter().map(|r| r.as_slice()).collect();
            let (tiles, tx, ty) = grid(&refs);

            let expected = brute_force_max_area(&hits);
            let result = find_largest_hit_rectangle(&tiles, tx, ty, min_tiles);

            match result {
                Some(max) => {
                    prop_assert_eq!(max.tiles_wide * max.tiles_high, expected);
                    prop_assert!(max.tiles_wide >= 1 && max.tiles_high >= 1);
                    prop_assert!(expected >= min_tiles.max(1));
                    // Pixel extent matches the tile extent.
                    prop_assert_eq!(
                        max.rect.width() as usize,
                        max.tiles_wide * TILE as usize
                    );
                    prop_assert_eq!(
                        max.rect.height() as usize,
                        max.tiles_high * TILE as usize
                    );
                }
                None => prop_assert!(expected < min_tiles.max(1)),
            }
        }
    }
}
