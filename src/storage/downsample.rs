//! 2x2 box-filter downsampling.
//!
//! Each source tile maps onto one quadrant of a destination tile at the
//! next resolution level. Every 2x2 block of source pixels collapses into
//! one destination pixel by averaging; blocks that hang off the right or
//! bottom edge of the source average the 1 or 2 samples that exist (edge
//! truncation, never wraparound).

use crate::storage::image::{write_sample, PixelBuffer};

/// Fold a source tile into one quadrant of a destination tile buffer.
///
/// `dst` is laid out like the source (same byte depth and components) with
/// `tile_width x tile_height` pixels. `quadrant_col`/`quadrant_row` select
/// which half of the destination receives the data (0 = left/top). At the
/// transition from full resolution, `src_offset_x`/`src_offset_y` skip the
/// overlap margin baked into level-0 tiles; deeper levels pass 0.
pub fn fold_quadrant(
    src: &PixelBuffer,
    dst: &mut [u8],
    tile_width: u32,
    tile_height: u32,
    quadrant_col: u32,
    quadrant_row: u32,
    src_offset_x: u32,
    src_offset_y: u32,
) {
    let components = src.components();
    let byte_depth = src.byte_depth();
    let src_w = src.width();
    let src_h = src.height();

    let mut y = 0;
    while y < tile_height {
        let mut x = 0;
        while x < tile_width {
            let px = x + src_offset_x;
            let py = y + src_offset_y;
            for comp in 0..components {
                let mut sum = src.sample(px, py, comp) as u32;
                let mut count = 1u32;
                if x < src_w - 1 && y < src_h - 1 {
                    sum += src.sample(px + 1, py, comp) as u32
                        + src.sample(px, py + 1, comp) as u32
                        + src.sample(px + 1, py + 1, comp) as u32;
                    count += 3;
                } else if x < src_w - 1 {
                    sum += src.sample(px + 1, py, comp) as u32;
                    count += 1;
                } else if y < src_h - 1 {
                    sum += src.sample(px, py + 1, comp) as u32;
                    count += 1;
                }

                let dst_x = (x + quadrant_col * tile_width) / 2;
                let dst_y = (y + quadrant_row * tile_height) / 2;
                let sample_index =
                    ((dst_y * tile_width + dst_x) * components + comp) as usize;
                write_sample(dst, sample_index, byte_depth, (sum / count) as u16);
            }
            x += 2;
        }
        y += 2;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn buffer_from(values: &[u8], width: u32, height: u32) -> PixelBuffer {
        PixelBuffer::new(Bytes::from(values.to_vec()), width, height, 1, false)
    }

    #[test]
    fn test_interior_blocks_average_four() {
        let src = buffer_from(&[10, 20, 30, 40, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12], 4, 4);
        let mut dst = vec![0u8; 16];
        fold_quadrant(&src, &mut dst, 4, 4, 0, 0, 0, 0);

        // Top-left quadrant of dst holds the 2x2 averages
        assert_eq!(dst[0], (10 + 20 + 1 + 2) / 4);
        assert_eq!(dst[1], (30 + 40 + 3 + 4) / 4);
        assert_eq!(dst[4], (5 + 6 + 9 + 10) / 4);
        assert_eq!(dst[5], (7 + 8 + 11 + 12) / 4);
        // Other quadrants untouched
        assert_eq!(dst[2], 0);
        assert_eq!(dst[8], 0);
    }

    #[test]
    fn test_quadrant_placement() {
        let src = buffer_from(&[100; 16], 4, 4);
        let mut dst = vec![0u8; 16];

        fold_quadrant(&src, &mut dst, 4, 4, 1, 0, 0, 0);
        assert_eq!(dst[0], 0);
        assert_eq!(dst[2], 100);
        assert_eq!(dst[3], 100);

        let mut dst = vec![0u8; 16];
        fold_quadrant(&src, &mut dst, 4, 4, 1, 1, 0, 0);
        assert_eq!(dst[10], 100);
        assert_eq!(dst[15], 100);
        assert_eq!(dst[0], 0);
    }

    #[test]
    fn test_edge_truncation_odd_tile() {
        // 3x3 tile: right column and bottom row blocks truncate
        let src = buffer_from(&[8, 16, 24, 32, 40, 48, 56, 64, 72], 3, 3);
        let mut dst = vec![0u8; 9];
        fold_quadrant(&src, &mut dst, 3, 3, 0, 0, 0, 0);

        assert_eq!(dst[0], (8 + 16 + 32 + 40) / 4); // interior: 4 samples
        assert_eq!(dst[1], (24 + 48) / 2); // right edge: 2 samples
        assert_eq!(dst[3], (56 + 64) / 2); // bottom edge: 2 samples
        assert_eq!(dst[4], 72); // corner: 1 sample
    }

    #[test]
    fn test_overlap_offset_skips_margin() {
        // 6x6 source with a 1-pixel margin on every side; the payload is
        // the inner 4x4 filled with 60
        let mut values = vec![0u8; 36];
        for y in 1..5 {
            for x in 1..5 {
                values[y * 6 + x] = 60;
            }
        }
        let src = buffer_from(&values, 6, 6);
        let mut dst = vec![0u8; 16];
        fold_quadrant(&src, &mut dst, 4, 4, 0, 0, 1, 1);

        assert_eq!(dst[0], 60);
        assert_eq!(dst[1], 60);
        assert_eq!(dst[4], 60);
        assert_eq!(dst[5], 60);
    }

    #[test]
    fn test_order_independence() {
        // Four sibling tiles folded into one destination in any order
        // produce identical bytes
        let tiles: Vec<(u32, u32, PixelBuffer)> = vec![
            (0, 0, buffer_from(&[10; 16], 4, 4)),
            (1, 0, buffer_from(&[20; 16], 4, 4)),
            (0, 1, buffer_from(&[30; 16], 4, 4)),
            (1, 1, buffer_from(&[40; 16], 4, 4)),
        ];

        let fold_all = |order: &[usize]| {
            let mut dst = vec![0u8; 16];
            for &i in order {
                let (qc, qr, ref src) = tiles[i];
                fold_quadrant(src, &mut dst, 4, 4, qc, qr, 0, 0);
            }
            dst
        };

        let reference = fold_all(&[0, 1, 2, 3]);
        assert_eq!(fold_all(&[3, 2, 1, 0]), reference);
        assert_eq!(fold_all(&[2, 0, 3, 1]), reference);
        assert_eq!(fold_all(&[1, 3, 0, 2]), reference);
    }

    #[test]
    fn test_sixteen_bit_samples() {
        let mut bytes = Vec::new();
        for v in [1000u16, 2000, 3000, 4000] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let src = PixelBuffer::new(Bytes::from(bytes), 2, 2, 2, false);
        let mut dst = vec![0u8; 2 * 2 * 2];
        fold_quadrant(&src, &mut dst, 2, 2, 0, 0, 0, 0);

        let folded = u16::from_le_bytes([dst[0], dst[1]]);
        assert_eq!(folded, (1000 + 2000 + 3000 + 4000) / 4);
    }

    #[test]
    fn test_rgb_components_fold_independently() {
        // 2x2 RGB tile, distinct ramps per component
        let mut values = Vec::new();
        for i in 0..4u8 {
            values.extend_from_slice(&[i * 10, i * 10 + 1, i * 10 + 2]);
        }
        let src = PixelBuffer::new(Bytes::from(values), 2, 2, 1, true);
        let mut dst = vec![0u8; 2 * 2 * 3];
        fold_quadrant(&src, &mut dst, 2, 2, 0, 0, 0, 0);

        assert_eq!(dst[0], (0 + 10 + 20 + 30) / 4);
        assert_eq!(dst[1], (1 + 11 + 21 + 31) / 4);
        assert_eq!(dst[2], (2 + 12 + 22 + 32) / 4);
    }
}
