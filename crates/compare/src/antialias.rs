//! YIQ colour distance and anti-aliasing detection shared by the pixel strategies

use image::{Rgba, RgbaImage};

/// Largest possible YIQ delta between two colours
pub const MAX_YIQ_DELTA: f64 = 35215.0;

fn blend(channel: f64, alpha: f64) -> f64 {
    255.0 + (channel - 255.0) * alpha
}

fn rgb2y(r: f64, g: f64, b: f64) -> f64 {
    r * 0.29889531 + g * 0.58662247 + b * 0.11448223
}

fn rgb2i(r: f64, g: f64, b: f64) -> f64 {
    r * 0.59597799 - g * 0.27417610 - b * 0.32180189
}

fn rgb2q(r: f64, g: f64, b: f64) -> f64 {
    r * 0.21147017 - g * 0.52261711 + b * 0.31114694
}

/// Colour composited onto white
fn composited(pixel: &Rgba<u8>) -> (f64, f64, f64) {
    let [r, g, b, a] = pixel.0;
    let (r, g, b) = (r as f64, g as f64, b as f64);
    if a < 255 {
        let alpha = a as f64 / 255.0;
        (blend(r, alpha), blend(g, alpha), blend(b, alpha))
    } else {
        (r, g, b)
    }
}

/// Luminance of a pixel composited onto white
pub fn brightness(pixel: &Rgba<u8>) -> f64 {
    let (r, g, b) = composited(pixel);
    rgb2y(r, g, b)
}

/// Signed perceptual distance in YIQ space.
///
/// Negative when the first pixel is brighter. With `y_only` only the
/// luminance difference is returned.
pub fn color_delta(a: &Rgba<u8>, b: &Rgba<u8>, y_only: bool) -> f64 {
    if a == b {
        return 0.0;
    }

    let (r1, g1, b1) = composited(a);
    let (r2, g2, b2) = composited(b);

    let y1 = rgb2y(r1, g1, b1);
    let y2 = rgb2y(r2, g2, b2);
    let y = y1 - y2;

    if y_only {
        return y;
    }

    let i = rgb2i(r1, g1, b1) - rgb2i(r2, g2, b2);
    let q = rgb2q(r1, g1, b1) - rgb2q(r2, g2, b2);
    let delta = 0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q;

    if y1 > y2 {
        -delta
    } else {
        delta
    }
}

/// Neighbourhood of `(x, y)` clamped to the image, and whether the pixel sits on an edge
fn neighbourhood(image: &RgbaImage, x: u32, y: u32) -> (u32, u32, u32, u32, bool) {
    let x0 = x.saturating_sub(1);
    let y0 = y.saturating_sub(1);
    let x2 = (x + 1).min(image.width() - 1);
    let y2 = (y + 1).min(image.height() - 1);
    let on_edge = x == x0 || x == x2 || y == y0 || y == y2;
    (x0, y0, x2, y2, on_edge)
}

/// More than two neighbours share the exact colour of `(x, y)`
fn has_many_siblings(image: &RgbaImage, x: u32, y: u32) -> bool {
    let (x0, y0, x2, y2, on_edge) = neighbourhood(image, x, y);
    let mut zeroes = u32::from(on_edge);
    let center = image.get_pixel(x, y);

    for ny in y0..=y2 {
        for nx in x0..=x2 {
            if nx == x && ny == y {
                continue;
            }
            if image.get_pixel(nx, ny) == center {
                zeroes += 1;
            }
            if zeroes > 2 {
                return true;
            }
        }
    }
    false
}

/// Whether `(x, y)` in `image` looks like an anti-aliased edge pixel.
///
/// The pixel must sit between a darker and a brighter neighbour, and one of
/// those extremes must be part of a flat area in both images. Luminance
/// steps within `tolerance` count as no change.
pub fn is_antialiased(image: &RgbaImage, x: u32, y: u32, other: &RgbaImage, tolerance: f64) -> bool {
    let (x0, y0, x2, y2, on_edge) = neighbourhood(image, x, y);
    let mut zeroes = u32::from(on_edge);
    let center = image.get_pixel(x, y);

    let mut min = 0.0;
    let mut max = 0.0;
    let mut min_at = (0, 0);
    let mut max_at = (0, 0);

    for ny in y0..=y2 {
        for nx in x0..=x2 {
            if nx == x && ny == y {
                continue;
            }

            let delta = color_delta(center, image.get_pixel(nx, ny), true);

            if delta.abs() <= tolerance {
                zeroes += 1;
                // Flat areas are not anti-aliasing
                if zeroes > 2 {
                    return false;
                }
            } else if delta < min {
                min = delta;
                min_at = (nx, ny);
            } else if delta > max {
                max = delta;
                max_at = (nx, ny);
            }
        }
    }

    if min == 0.0 || max == 0.0 {
        return false;
    }

    let in_bounds = |(px, py): (u32, u32)| px < other.width() && py < other.height();

    (in_bounds(min_at)
        && has_many_siblings(image, min_at.0, min_at.1)
        && has_many_siblings(other, min_at.0, min_at.1))
        || (in_bounds(max_at)
            && has_many_siblings(image, max_at.0, max_at.1)
            && has_many_siblings(other, max_at.0, max_at.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
    const GREY: Rgba<u8> = Rgba([128, 128, 128, 255]);

    #[test]
    fn test_delta_sign_follows_brightness() {
        assert_eq!(color_delta(&WHITE, &WHITE, false), 0.0);
        assert!(color_delta(&WHITE, &BLACK, false) < 0.0);
        assert!(color_delta(&BLACK, &WHITE, false) > 0.0);
        let full = color_delta(&BLACK, &WHITE, false);
        assert!(full > 30000.0 && full <= MAX_YIQ_DELTA);
    }

    #[test]
    fn test_transparent_blends_to_white() {
        let clear = Rgba([0, 0, 0, 0]);
        assert!(color_delta(&clear, &WHITE, false).abs() < 1e-9);
        assert!((brightness(&clear) - brightness(&WHITE)).abs() < 1e-9);
    }

    #[test]
    fn test_grey_step_between_flat_areas_is_antialiased() {
        // Left half black, right half white, a grey column in between
        let image = RgbaImage::from_fn(5, 5, |x, _| match x {
            0 | 1 => BLACK,
            2 => GREY,
            _ => WHITE,
        });
        assert!(is_antialiased(&image, 2, 2, &image, 0.0));
        assert!(!is_antialiased(&image, 0, 2, &image, 0.0));
    }

    #[test]
    fn test_isolated_dot_is_not_antialiased() {
        let mut image = RgbaImage::from_pixel(5, 5, WHITE);
        image.put_pixel(2, 2, BLACK);
        assert!(!is_antialiased(&image, 2, 2, &image, 0.0));
    }
}
