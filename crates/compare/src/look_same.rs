//! Perceptual comparison using the CIEDE2000 colour difference
//!
//! Pixels are composited onto white, converted to CIE Lab (D65) and counted
//! as different when their distance reaches the configured tolerance.
//! Anti-aliasing noise and a lone blinking caret can be ignored, and the
//! remaining differences can be grouped into bounding-box clusters.

use crate::antialias::is_antialiased;
use crate::config::LookSameConfig;
use crate::engine::{run_blocking, DiffEngine, EngineOutput};
use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use tracing::debug;
use vrt_common::{DiffCluster, Result};

const HIGHLIGHT: Rgba<u8> = Rgba([255, 0, 255, 255]);

pub struct LookSameEngine {
    config: LookSameConfig,
}

impl LookSameEngine {
    pub fn new(config: LookSameConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DiffEngine for LookSameEngine {
    fn name(&self) -> &'static str {
        "lookSame"
    }

    fn allow_diff_dimensions(&self) -> bool {
        self.config.allow_diff_dimensions
    }

    async fn compare(&self, image: RgbaImage, baseline: RgbaImage) -> Result<EngineOutput> {
        let config = self.config.clone();
        run_blocking(move || {
            let outcome = look_same(&image, &baseline, &config);
            EngineOutput::Pixels {
                mismatch: outcome.points.len() as u64,
                diff: Some(outcome.diff),
                clusters: outcome.clusters,
            }
        })
        .await
    }
}

pub struct LookSameOutcome {
    /// Differing pixel coordinates in row-major order
    pub points: Vec<(u32, u32)>,
    pub diff: RgbaImage,
    pub clusters: Vec<DiffCluster>,
}

/// Compare two images of equal size
pub fn look_same(image: &RgbaImage, baseline: &RgbaImage, config: &LookSameConfig) -> LookSameOutcome {
    let mut points = Vec::new();

    for (x, y, actual) in image.enumerate_pixels() {
        let expected = baseline.get_pixel(x, y);
        if actual == expected {
            continue;
        }

        let differs = config.strict || delta_e(&Lab::from_pixel(actual), &Lab::from_pixel(expected)) >= config.tolerance;
        if !differs {
            continue;
        }

        if !config.strict
            && config.ignore_antialiasing
            && (is_antialiased(image, x, y, baseline, config.antialiasing_tolerance)
                || is_antialiased(baseline, x, y, image, config.antialiasing_tolerance))
        {
            continue;
        }

        points.push((x, y));
    }

    if config.ignore_caret && is_caret(&points) {
        debug!("lookSame: ignoring caret of {} pixels", points.len());
        points.clear();
    }

    let mut diff = image.clone();
    for &(x, y) in &points {
        diff.put_pixel(x, y, HIGHLIGHT);
    }

    let clusters = if config.should_cluster {
        cluster(&points, config.clusters_size)
    } else {
        Vec::new()
    };

    LookSameOutcome {
        points,
        diff,
        clusters,
    }
}

/// A single uninterrupted vertical line one pixel wide
fn is_caret(points: &[(u32, u32)]) -> bool {
    let Some(&(column, first_row)) = points.first() else {
        return false;
    };
    if points.len() < 2 {
        return false;
    }
    points
        .iter()
        .enumerate()
        .all(|(i, &(x, y))| x == column && y == first_row + i as u32)
}

fn near(cluster: &DiffCluster, x: u32, y: u32, radius: u32) -> bool {
    x.saturating_add(radius) >= cluster.left
        && x <= cluster.right.saturating_add(radius)
        && y.saturating_add(radius) >= cluster.top
        && y <= cluster.bottom.saturating_add(radius)
}

fn overlaps(a: &DiffCluster, b: &DiffCluster, radius: u32) -> bool {
    a.left <= b.right.saturating_add(radius)
        && b.left <= a.right.saturating_add(radius)
        && a.top <= b.bottom.saturating_add(radius)
        && b.top <= a.bottom.saturating_add(radius)
}

fn union(a: &DiffCluster, b: &DiffCluster) -> DiffCluster {
    DiffCluster {
        left: a.left.min(b.left),
        top: a.top.min(b.top),
        right: a.right.max(b.right),
        bottom: a.bottom.max(b.bottom),
    }
}

/// Group differing pixels whose distance is within `radius`
pub fn cluster(points: &[(u32, u32)], radius: u32) -> Vec<DiffCluster> {
    let mut clusters: Vec<DiffCluster> = Vec::new();

    for &(x, y) in points {
        match clusters.iter_mut().find(|c| near(c, x, y, radius)) {
            Some(c) => {
                c.left = c.left.min(x);
                c.top = c.top.min(y);
                c.right = c.right.max(x);
                c.bottom = c.bottom.max(y);
            }
            None => clusters.push(DiffCluster {
                left: x,
                top: y,
                right: x,
                bottom: y,
            }),
        }
    }

    // Growing boxes can come within reach of each other
    loop {
        let mut merged = None;
        'search: for i in 0..clusters.len() {
            for j in (i + 1)..clusters.len() {
                if overlaps(&clusters[i], &clusters[j], radius) {
                    merged = Some((i, j));
                    break 'search;
                }
            }
        }
        let Some((i, j)) = merged else {
            break;
        };
        let absorbed = clusters.remove(j);
        clusters[i] = union(&clusters[i], &absorbed);
    }

    clusters
}

/// CIE L*a*b* colour (D65 white point)
#[derive(Debug, Clone, Copy)]
struct Lab {
    l: f64,
    a: f64,
    b: f64,
}

impl Lab {
    fn from_pixel(pixel: &Rgba<u8>) -> Self {
        let [r, g, b, a] = pixel.0;
        let alpha = a as f64 / 255.0;
        // Composite onto white
        let over_white = |c: u8| (255.0 + (c as f64 - 255.0) * alpha) / 255.0;

        let r = srgb_to_linear(over_white(r));
        let g = srgb_to_linear(over_white(g));
        let b = srgb_to_linear(over_white(b));

        let x = r * 0.4124564 + g * 0.3575761 + b * 0.1804375;
        let y = r * 0.2126729 + g * 0.7151522 + b * 0.0721750;
        let z = r * 0.0193339 + g * 0.1191920 + b * 0.9503041;

        let fx = f_xyz(x / 0.95047);
        let fy = f_xyz(y);
        let fz = f_xyz(z / 1.08883);

        Self {
            l: 116.0 * fy - 16.0,
            a: 500.0 * (fx - fy),
            b: 200.0 * (fy - fz),
        }
    }
}

fn srgb_to_linear(c: f64) -> f64 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn f_xyz(t: f64) -> f64 {
    let delta: f64 = 6.0 / 29.0;
    if t > delta.powi(3) {
        t.cbrt()
    } else {
        t / (3.0 * delta.powi(2)) + 4.0 / 29.0
    }
}

/// CIEDE2000 distance with unit weights
fn delta_e(lab1: &Lab, lab2: &Lab) -> f64 {
    let c1 = lab1.a.hypot(lab1.b);
    let c2 = lab2.a.hypot(lab2.b);
    let c_avg_7 = ((c1 + c2) / 2.0).powi(7);
    let g = 0.5 * (1.0 - (c_avg_7 / (c_avg_7 + 25f64.powi(7))).sqrt());

    let a1 = lab1.a * (1.0 + g);
    let a2 = lab2.a * (1.0 + g);
    let c1p = a1.hypot(lab1.b);
    let c2p = a2.hypot(lab2.b);

    let hue = |b: f64, a: f64| {
        if a == 0.0 && b == 0.0 {
            0.0
        } else {
            b.atan2(a).to_degrees().rem_euclid(360.0)
        }
    };
    let h1p = hue(lab1.b, a1);
    let h2p = hue(lab2.b, a2);

    let dl = lab2.l - lab1.l;
    let dc = c2p - c1p;

    let chroma_product = c1p * c2p;
    let dh_deg = if chroma_product == 0.0 {
        0.0
    } else {
        let dh = h2p - h1p;
        if dh > 180.0 {
            dh - 360.0
        } else if dh < -180.0 {
            dh + 360.0
        } else {
            dh
        }
    };
    let dh = 2.0 * chroma_product.sqrt() * (dh_deg.to_radians() / 2.0).sin();

    let l_avg = (lab1.l + lab2.l) / 2.0;
    let c_avg_p = (c1p + c2p) / 2.0;
    let h_avg = if chroma_product == 0.0 {
        h1p + h2p
    } else if (h1p - h2p).abs() <= 180.0 {
        (h1p + h2p) / 2.0
    } else if h1p + h2p < 360.0 {
        (h1p + h2p + 360.0) / 2.0
    } else {
        (h1p + h2p - 360.0) / 2.0
    };

    let t = 1.0 - 0.17 * (h_avg - 30.0).to_radians().cos()
        + 0.24 * (2.0 * h_avg).to_radians().cos()
        + 0.32 * (3.0 * h_avg + 6.0).to_radians().cos()
        - 0.20 * (4.0 * h_avg - 63.0).to_radians().cos();
    let d_theta = 30.0 * (-((h_avg - 275.0) / 25.0).powi(2)).exp();
    let c_avg_p_7 = c_avg_p.powi(7);
    let rc = 2.0 * (c_avg_p_7 / (c_avg_p_7 + 25f64.powi(7))).sqrt();
    let l_50 = (l_avg - 50.0).powi(2);
    let sl = 1.0 + 0.015 * l_50 / (20.0 + l_50).sqrt();
    let sc = 1.0 + 0.045 * c_avg_p;
    let sh = 1.0 + 0.015 * c_avg_p * t;
    let rt = -(2.0 * d_theta).to_radians().sin() * rc;

    let l_term = dl / sl;
    let c_term = dc / sc;
    let h_term = dh / sh;
    (l_term * l_term + c_term * c_term + h_term * h_term + rt * c_term * h_term).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
    const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

    fn white(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_pixel(width, height, WHITE)
    }

    #[test]
    fn test_delta_e_reference_pair() {
        // Sharma et al. test data, pair 1
        let a = Lab { l: 50.0, a: 2.6772, b: -79.7751 };
        let b = Lab { l: 50.0, a: 0.0, b: -82.7485 };
        assert!((delta_e(&a, &b) - 2.0425).abs() < 1e-3);
        assert_eq!(delta_e(&a, &a), 0.0);
    }

    #[test]
    fn test_imperceptible_change_is_tolerated() {
        let baseline = white(6, 6);
        let mut image = baseline.clone();
        image.put_pixel(3, 3, Rgba([254, 254, 254, 255]));

        let outcome = look_same(&image, &baseline, &LookSameConfig::default());
        assert!(outcome.points.is_empty());

        let strict = LookSameConfig {
            strict: true,
            ..Default::default()
        };
        assert_eq!(look_same(&image, &baseline, &strict).points, vec![(3, 3)]);
    }

    #[test]
    fn test_caret_is_ignored_only_when_configured() {
        let baseline = white(8, 8);
        let mut image = baseline.clone();
        for y in 2..6 {
            image.put_pixel(4, y, BLACK);
        }

        assert!(look_same(&image, &baseline, &LookSameConfig::default()).points.is_empty());

        let keep_caret = LookSameConfig {
            ignore_caret: false,
            ..Default::default()
        };
        assert_eq!(look_same(&image, &baseline, &keep_caret).points.len(), 4);
    }

    #[test]
    fn test_clusters_group_nearby_points() {
        let points = [(0, 0), (2, 1), (50, 50), (1, 3)];
        let clusters = cluster(&points, 5);
        assert_eq!(clusters.len(), 2);
        assert_eq!(
            clusters[0],
            DiffCluster { left: 0, top: 0, right: 2, bottom: 3 }
        );
        assert_eq!(
            clusters[1],
            DiffCluster { left: 50, top: 50, right: 50, bottom: 50 }
        );
    }

    #[test]
    fn test_clusters_merge_when_boxes_grow_together() {
        // The third point bridges the first two boxes
        let clusters = cluster(&[(0, 0), (10, 0), (5, 0)], 5);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].width(), 11);
    }
}
