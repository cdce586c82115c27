//! Image fingerprints and canvas padding

use image::{imageops, RgbaImage};
use sha2::{Digest, Sha256};

/// SHA-256 over the dimensions and raw RGBA pixels
pub fn fingerprint(image: &RgbaImage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.width().to_le_bytes());
    hasher.update(image.height().to_le_bytes());
    hasher.update(image.as_raw());
    hex::encode(hasher.finalize())
}

/// Place `image` at the top-left of a transparent canvas of the given size
pub fn pad_to(image: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    let mut canvas = RgbaImage::new(width, height);
    imageops::replace(&mut canvas, image, 0, 0);
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_fingerprint_tracks_pixels_and_shape() {
        let a = RgbaImage::from_pixel(2, 3, Rgba([1, 2, 3, 4]));
        let b = RgbaImage::from_pixel(3, 2, Rgba([1, 2, 3, 4]));
        assert_eq!(fingerprint(&a), fingerprint(&a.clone()));
        // Same bytes, different shape
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_pad_keeps_origin_and_fills_transparent() {
        let image = RgbaImage::from_pixel(2, 2, Rgba([9, 9, 9, 255]));
        let padded = pad_to(&image, 3, 4);
        assert_eq!(padded.dimensions(), (3, 4));
        assert_eq!(*padded.get_pixel(1, 1), Rgba([9, 9, 9, 255]));
        assert_eq!(*padded.get_pixel(2, 3), Rgba([0, 0, 0, 0]));
    }
}
