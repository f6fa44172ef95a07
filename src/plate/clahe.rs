//! Contrast-limited adaptive histogram equalization.
//!
//! The image is split into a grid of tiles; each tile gets a clipped,
//! redistributed histogram turned into a lookup table, and every pixel is
//! mapped through a bilinear blend of the four nearest tile tables.

use image::{GrayImage, Luma};

/// CLAHE parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Clahe {
    /// Histogram clip limit, relative to a flat histogram.
    pub clip_limit: f32,
    /// Tiles per axis.
    pub tiles: u32,
}

impl Default for Clahe {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tiles: 8,
        }
    }
}

/// Half-open pixel range covered by tile `index` of `count` over `extent`.
fn tile_span(index: u32, count: u32, extent: u32) -> (u32, u32) {
    let start = (index as u64 * extent as u64 / count as u64) as u32;
    let end = ((index as u64 + 1) * extent as u64 / count as u64) as u32;
    (start, end)
}

impl Clahe {
    pub fn apply(&self, image: &GrayImage) -> GrayImage {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return image.clone();
        }
        let tiles_x = self.tiles.clamp(1, width);
        let tiles_y = self.tiles.clamp(1, height);

        let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
        for ty in 0..tiles_y {
            let (y0, y1) = tile_span(ty, tiles_y, height);
            for tx in 0..tiles_x {
                let (x0, x1) = tile_span(tx, tiles_x, width);
                luts.push(self.tile_lut(image, x0, x1, y0, y1));
            }
        }

        let tile_w = width as f32 / tiles_x as f32;
        let tile_h = height as f32 / tiles_y as f32;
        let neighbours = |pos: u32, tile: f32, count: u32| -> (usize, usize, f32) {
            let f = (pos as f32 + 0.5) / tile - 0.5;
            let lower = f.floor().clamp(0.0, (count - 1) as f32);
            let upper = (lower + 1.0).min((count - 1) as f32);
            let weight = (f - lower).clamp(0.0, 1.0);
            (lower as usize, upper as usize, weight)
        };

        let mut out = GrayImage::new(width, height);
        for y in 0..height {
            let (ty0, ty1, wy) = neighbours(y, tile_h, tiles_y);
            for x in 0..width {
                let (tx0, tx1, wx) = neighbours(x, tile_w, tiles_x);
                let v = image.get_pixel(x, y)[0] as usize;
                let lut = |tx: usize, ty: usize| luts[ty * tiles_x as usize + tx][v] as f32;
                let top = lut(tx0, ty0) * (1.0 - wx) + lut(tx1, ty0) * wx;
                let bottom = lut(tx0, ty1) * (1.0 - wx) + lut(tx1, ty1) * wx;
                let value = top * (1.0 - wy) + bottom * wy;
                out.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
            }
        }
        out
    }

    fn tile_lut(&self, image: &GrayImage, x0: u32, x1: u32, y0: u32, y1: u32) -> [u8; 256] {
        let mut hist = [0u32; 256];
        for y in y0..y1 {
            for x in x0..x1 {
                hist[image.get_pixel(x, y)[0] as usize] += 1;
            }
        }
        let total = ((x1 - x0) * (y1 - y0)).max(1);

        let limit = ((self.clip_limit * total as f32 / 256.0) as u32).max(1);
        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > limit {
                excess += *bin - limit;
                *bin = limit;
            }
        }
        let share = excess / 256;
        for bin in hist.iter_mut() {
            *bin += share;
        }
        let mut remainder = excess % 256;
        if remainder > 0 {
            let step = (256 / remainder).max(1) as usize;
            for bin in hist.iter_mut().step_by(step) {
                if remainder == 0 {
                    break;
                }
                *bin += 1;
                remainder -= 1;
            }
        }

        let scale = 255.0 / total as f32;
        let mut lut = [0u8; 256];
        let mut cumulative = 0u32;
        for (i, bin) in hist.iter().enumerate() {
            cumulative += bin;
            lut[i] = (cumulative as f32 * scale).round().clamp(0.0, 255.0) as u8;
        }
        lut
    }
}
