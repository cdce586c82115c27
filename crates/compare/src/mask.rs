//! Ignore-region masking

use image::{Rgba, RgbaImage};
use vrt_common::IgnoreRegion;

const MASKED: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Zero all four channels of every pixel covered by a region.
///
/// A region covers the pixels between its first corner `(x, y)` and its last
/// corner `(x + width - 1, y + height - 1)`. Both corners are clamped into the
/// image, so out-of-range coordinates snap to the nearest edge pixel instead
/// of failing. A region with a zero or negative size masks nothing.
pub fn apply_ignore_regions(image: &mut RgbaImage, regions: &[IgnoreRegion]) {
    if image.width() == 0 || image.height() == 0 {
        return;
    }
    let max_x = image.width() as i64 - 1;
    let max_y = image.height() as i64 - 1;

    for region in regions {
        if region.width <= 0 || region.height <= 0 {
            continue;
        }

        let left = region.x.clamp(0, max_x);
        let top = region.y.clamp(0, max_y);
        let right = region.x.saturating_add(region.width - 1).clamp(0, max_x);
        let bottom = region.y.saturating_add(region.height - 1).clamp(0, max_y);

        for y in top..=bottom {
            for x in left..=right {
                image.put_pixel(x as u32, y as u32, MASKED);
            }
        }
    }
}

/// Effective regions for a run: persistent ones followed by temporary ones
pub fn merge_regions(persistent: &[IgnoreRegion], temporary: &[IgnoreRegion]) -> Vec<IgnoreRegion> {
    let mut merged = Vec::with_capacity(persistent.len() + temporary.len());
    for region in persistent.iter().chain(temporary) {
        if !merged.contains(region) {
            merged.push(*region);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn white(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]))
    }

    fn masked_pixels(image: &RgbaImage) -> Vec<(u32, u32)> {
        image
            .enumerate_pixels()
            .filter(|(_, _, p)| **p == MASKED)
            .map(|(x, y, _)| (x, y))
            .collect()
    }

    #[test]
    fn test_negative_origin_snaps_to_corner() {
        let mut image = white(3, 3);
        apply_ignore_regions(&mut image, &[IgnoreRegion::new(-3, -3, 3, 3)]);
        assert_eq!(masked_pixels(&image), vec![(0, 0)]);
    }

    #[test]
    fn test_region_inside_masks_exact_area() {
        let mut image = white(4, 4);
        apply_ignore_regions(&mut image, &[IgnoreRegion::new(1, 1, 2, 1)]);
        assert_eq!(masked_pixels(&image), vec![(1, 1), (2, 1)]);
    }

    #[test_case(IgnoreRegion::new(1, 1, 0, 5) ; "zero width")]
    #[test_case(IgnoreRegion::new(1, 1, 5, -2) ; "negative height")]
    fn test_empty_regions_mask_nothing(region: IgnoreRegion) {
        let mut image = white(4, 4);
        apply_ignore_regions(&mut image, &[region]);
        assert_eq!(image, white(4, 4));
    }

    #[test]
    fn test_huge_region_does_not_overflow() {
        let mut image = white(2, 2);
        apply_ignore_regions(&mut image, &[IgnoreRegion::new(i64::MAX - 1, 0, i64::MAX, 1)]);
        assert_eq!(masked_pixels(&image), vec![(1, 0)]);
    }

    #[test]
    fn test_region_past_edge_is_clipped() {
        let mut image = white(4, 4);
        apply_ignore_regions(&mut image, &[IgnoreRegion::new(2, 3, 100, 100)]);
        assert_eq!(masked_pixels(&image), vec![(2, 3), (3, 3)]);
    }

    #[test]
    fn test_masking_is_idempotent() {
        let regions = [IgnoreRegion::new(0, 0, 2, 2), IgnoreRegion::new(1, 1, 3, 1)];
        let mut once = white(5, 5);
        apply_ignore_regions(&mut once, &regions);
        let mut twice = once.clone();
        apply_ignore_regions(&mut twice, &regions);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_keeps_order_and_drops_duplicates() {
        let a = IgnoreRegion::new(0, 0, 1, 1);
        let b = IgnoreRegion::new(5, 5, 1, 1);
        assert_eq!(merge_regions(&[a], &[b, a]), vec![a, b]);
        assert!(merge_regions(&[], &[]).is_empty());
    }
}
