use image::GrayImage;

/// Contrast-limited adaptive histogram equalization.
///
/// The image is split into at most `tiles` x `tiles` regions. Each region gets
/// its own equalization table, with histogram bins clipped at `clip_limit`
/// times the mean bin height and the excess spread over all bins. Pixels are
/// mapped by bilinear blending of the four nearest region tables, which keeps
/// region borders invisible.
pub fn clahe(img: &GrayImage, tiles: u32, clip_limit: f32) -> GrayImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img.clone();
    }

    let tile_w = width.div_ceil(tiles.clamp(1, width));
    let tile_h = height.div_ceil(tiles.clamp(1, height));
    let tiles_x = width.div_ceil(tile_w);
    let tiles_y = height.div_ceil(tile_h);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);
            luts.push(tile_lut(img, x0, y0, x1, y1, clip_limit));
        }
    }

    let lut_at = |tx: u32, ty: u32| &luts[(ty * tiles_x + tx) as usize];

    GrayImage::from_fn(width, height, |x, y| {
        let (tx0, tx1, ax) = neighbours(x, tile_w, tiles_x);
        let (ty0, ty1, ay) = neighbours(y, tile_h, tiles_y);
        let v = img.get_pixel(x, y)[0] as usize;

        let top = lut_at(tx0, ty0)[v] * (1.0 - ax) + lut_at(tx1, ty0)[v] * ax;
        let bottom = lut_at(tx0, ty1)[v] * (1.0 - ax) + lut_at(tx1, ty1)[v] * ax;
        let blended = top * (1.0 - ay) + bottom * ay;
        image::Luma([blended.round().clamp(0.0, 255.0) as u8])
    })
}

// Indices of the two tile centres surrounding `pos` and the blend weight of the second.
fn neighbours(pos: u32, tile: u32, count: u32) -> (u32, u32, f32) {
    let f = (pos as f32 + 0.5) / tile as f32 - 0.5;
    if f <= 0.0 {
        return (0, 0, 0.0);
    }
    let i0 = (f.floor() as u32).min(count - 1);
    let i1 = (i0 + 1).min(count - 1);
    let a = if i0 == i1 { 0.0 } else { f - i0 as f32 };
    (i0, i1, a)
}

fn tile_lut(img: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32, clip_limit: f32) -> [f32; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[img.get_pixel(x, y)[0] as usize] += 1;
        }
    }

    let area = (x1 - x0) * (y1 - y0);
    let limit = ((clip_limit * area as f32 / 256.0).ceil() as u32).max(1);

    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let share = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from(i < remainder);
    }

    let mut lut = [0f32; 256];
    let mut cdf = 0u32;
    for (i, count) in hist.iter().enumerate() {
        cdf += count;
        lut[i] = cdf as f32 * 255.0 / area as f32;
    }
    lut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spread(img: &GrayImage) -> u8 {
        let min = img.pixels().map(|p| p[0]).min().unwrap();
        let max = img.pixels().map(|p| p[0]).max().unwrap();
        max - min
    }

    #[test]
    fn stretches_low_contrast_regions() {
        let img = GrayImage::from_fn(128, 128, |x, _| image::Luma([100 + (x % 20) as u8]));
        let out = clahe(&img, 2, 4.0);
        assert_eq!(out.dimensions(), img.dimensions());
        assert!(spread(&out) > spread(&img));
    }

    #[test]
    fn tolerates_more_tiles_than_pixels() {
        let img = GrayImage::from_fn(5, 3, |x, y| image::Luma([(x * 40 + y * 10) as u8]));
        let out = clahe(&img, 8, 2.0);
        assert_eq!(out.dimensions(), (5, 3));
    }

    #[test]
    fn preserves_intensity_order_within_a_tile() {
        let img = GrayImage::from_fn(16, 16, |x, _| image::Luma([(x * 8) as u8]));
        let out = clahe(&img, 1, 2.0);
        for x in 1..16 {
            assert!(out.get_pixel(x, 0)[0] >= out.get_pixel(x - 1, 0)[0]);
        }
    }
}
