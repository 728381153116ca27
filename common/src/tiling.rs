//! Split a frame into a grid of overlapping tiles so small or distant
//! objects get a larger share of the classifier input.
//!
//! The grid has `floor(sqrt(n))` rows and `ceil(n / rows)` columns laid over
//! the active region (the frame minus the region-of-interest offsets).
//! Interior boundaries are pushed outwards by `overlap` times the average
//! cell size.  Tiles come out row-major and the list is truncated at `n`.

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Tile bounds in original-frame pixels, half-open: rows `y1..y2`,
/// columns `x1..x2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileBox {
    pub y1: u32,
    pub y2: u32,
    pub x1: u32,
    pub x2: u32,
}

impl TileBox {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }
}

/// Tiling parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileSpec {
    pub count: usize,
    /// Clamped to `[0, 0.5]`.
    pub overlap: f64,
    /// Fraction of the height to skip at the top, clamped to `[0, 0.99]`.
    pub offset_top: f64,
    /// Fraction of the width to skip at the left, clamped to `[0, 0.99]`.
    pub offset_left: f64,
}

impl TileSpec {
    pub fn new(count: usize, overlap: f64) -> Self {
        Self {
            count,
            overlap,
            offset_top: 0.0,
            offset_left: 0.0,
        }
    }

    pub fn with_offsets(mut self, top: f64, left: f64) -> Self {
        self.offset_top = top;
        self.offset_left = left;
        self
    }
}

/// Compute tile bounds for a `width` × `height` frame.
pub fn tile_boxes(width: u32, height: u32, spec: &TileSpec) -> Vec<TileBox> {
    if spec.count == 0 {
        return vec![];
    }
    let overlap = clamp_or_zero(spec.overlap, 0.5);
    let off_x = ((clamp_or_zero(spec.offset_left, 0.99) * width as f64).round() as u32).min(width);
    let off_y = ((clamp_or_zero(spec.offset_top, 0.99) * height as f64).round() as u32).min(height);

    let rows = ((spec.count as f64).sqrt().floor() as usize).max(1);
    let cols = spec.count.div_ceil(rows);

    let xs = boundaries(off_x, width, cols);
    let ys = boundaries(off_y, height, rows);
    let grow_x = (overlap * (width - off_x) as f64 / cols as f64).round() as u32;
    let grow_y = (overlap * (height - off_y) as f64 / rows as f64).round() as u32;

    let mut out = Vec::with_capacity(spec.count);
    for j in 0..rows {
        for i in 0..cols {
            let mut b = TileBox {
                y1: ys[j],
                y2: ys[j + 1],
                x1: xs[i],
                x2: xs[i + 1],
            };
            if i > 0 {
                b.x1 = b.x1.saturating_sub(grow_x).max(off_x);
            }
            if i + 1 < cols {
                b.x2 = (b.x2 + grow_x).min(width);
            }
            if j > 0 {
                b.y1 = b.y1.saturating_sub(grow_y).max(off_y);
            }
            if j + 1 < rows {
                b.y2 = (b.y2 + grow_y).min(height);
            }
            out.push(b);
            if out.len() >= spec.count {
                return out;
            }
        }
    }
    out
}

/// Crop `img` into tiles.  Returns each tile with its bounds.
pub fn split_into_tiles(img: &RgbImage, spec: &TileSpec) -> Vec<(RgbImage, TileBox)> {
    tile_boxes(img.width(), img.height(), spec)
        .into_iter()
        .map(|b| {
            let tile = image::imageops::crop_imm(img, b.x1, b.y1, b.width(), b.height()).to_image();
            (tile, b)
        })
        .collect()
}

/// `parts + 1` boundaries linearly interpolated over `start..end`.
fn boundaries(start: u32, end: u32, parts: usize) -> Vec<u32> {
    let span = (end - start) as f64;
    let mut v: Vec<u32> = (0..parts)
        .map(|k| start + (k as f64 * span / parts as f64).round() as u32)
        .collect();
    v.push(end);
    v
}

fn clamp_or_zero(v: f64, max: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_count_matches_request() {
        for n in 1..=20 {
            for &(w, h) in &[(640, 480), (1920, 1080), (7, 5), (100, 100)] {
                let boxes = tile_boxes(w, h, &TileSpec::new(n, 0.05));
                assert_eq!(boxes.len(), n, "n={n} w={w} h={h}");
                for b in &boxes {
                    assert!(b.x1 <= b.x2 && b.x2 <= w);
                    assert!(b.y1 <= b.y2 && b.y2 <= h);
                }
            }
        }
    }

    #[test]
    fn test_zero_tiles() {
        assert!(tile_boxes(100, 100, &TileSpec::new(0, 0.1)).is_empty());
    }

    #[test]
    fn test_single_tile_is_whole_frame() {
        let boxes = tile_boxes(320, 240, &TileSpec::new(1, 0.3));
        assert_eq!(
            boxes,
            vec![TileBox {
                y1: 0,
                y2: 240,
                x1: 0,
                x2: 320
            }]
        );
    }

    #[test]
    fn test_quad_grid_with_overlap() {
        let boxes = tile_boxes(100, 100, &TileSpec::new(4, 0.05));
        // grow = round(0.05 * 100 / 2) = 3
        assert_eq!(boxes[0], TileBox { y1: 0, y2: 53, x1: 0, x2: 53 });
        assert_eq!(boxes[1], TileBox { y1: 0, y2: 53, x1: 47, x2: 100 });
        assert_eq!(boxes[2], TileBox { y1: 47, y2: 100, x1: 0, x2: 53 });
        assert_eq!(boxes[3], TileBox { y1: 47, y2: 100, x1: 47, x2: 100 });
    }

    #[test]
    fn test_neighbours_share_overlap() {
        let (w, h) = (1280, 720);
        let spec = TileSpec::new(6, 0.1);
        let boxes = tile_boxes(w, h, &spec);
        // 2 rows x 3 cols
        let grow_x = (0.1 * w as f64 / 3.0).round() as u32;
        let grow_y = (0.1 * h as f64 / 2.0).round() as u32;
        for row in 0..2 {
            for col in 0..2 {
                let a = boxes[row * 3 + col];
                let b = boxes[row * 3 + col + 1];
                assert!(a.x2 - b.x1 >= grow_x);
            }
        }
        for col in 0..3 {
            let a = boxes[col];
            let b = boxes[3 + col];
            assert!(a.y2 - b.y1 >= grow_y);
        }
    }

    #[test]
    fn test_truncates_instead_of_reshaping() {
        // 5 tiles -> 2 rows x 3 cols, last cell dropped
        let boxes = tile_boxes(300, 200, &TileSpec::new(5, 0.0));
        assert_eq!(boxes.len(), 5);
        assert_eq!(boxes[3], TileBox { y1: 100, y2: 200, x1: 0, x2: 100 });
        assert_eq!(boxes[4], TileBox { y1: 100, y2: 200, x1: 100, x2: 200 });
    }

    #[test]
    fn test_offsets_restrict_region() {
        let spec = TileSpec::new(2, 0.1).with_offsets(0.0, 0.5);
        let boxes = tile_boxes(200, 100, &spec);
        // active width 100, grow = round(0.1 * 100 / 2) = 5
        assert_eq!(boxes[0], TileBox { y1: 0, y2: 100, x1: 100, x2: 155 });
        assert_eq!(boxes[1], TileBox { y1: 0, y2: 100, x1: 145, x2: 200 });
    }

    #[test]
    fn test_offsets_and_overlap_are_clamped() {
        let spec = TileSpec::new(1, 9.0).with_offsets(-1.0, 5.0);
        let boxes = tile_boxes(200, 100, &spec);
        assert_eq!(boxes[0], TileBox { y1: 0, y2: 100, x1: 198, x2: 200 });
    }

    #[test]
    fn test_split_crops_pixels() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(3, 1, image::Rgb([9, 9, 9]));
        let tiles = split_into_tiles(&img, &TileSpec::new(2, 0.0));
        assert_eq!(tiles.len(), 2);
        let (right, b) = &tiles[1];
        assert_eq!((b.x1, b.x2), (2, 4));
        assert_eq!(right.dimensions(), (2, 2));
        assert_eq!(right.get_pixel(1, 1), &image::Rgb([9, 9, 9]));
    }

    #[test]
    fn test_deterministic() {
        let spec = TileSpec::new(7, 0.2).with_offsets(0.1, 0.2);
        assert_eq!(tile_boxes(1000, 800, &spec), tile_boxes(1000, 800, &spec));
    }
}
