//! Per-pixel YIQ threshold comparison

use crate::antialias::{brightness, color_delta, is_antialiased, MAX_YIQ_DELTA};
use crate::config::PixelmatchConfig;
use crate::engine::{run_blocking, DiffEngine, EngineOutput};
use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use tracing::debug;
use vrt_common::Result;

const DIFF_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const AA_COLOR: Rgba<u8> = Rgba([255, 255, 0, 255]);
const FADE: f64 = 0.1;

pub struct PixelmatchEngine {
    config: PixelmatchConfig,
}

impl PixelmatchEngine {
    pub fn new(config: PixelmatchConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DiffEngine for PixelmatchEngine {
    fn name(&self) -> &'static str {
        "pixelmatch"
    }

    fn allow_diff_dimensions(&self) -> bool {
        self.config.allow_diff_dimensions
    }

    async fn compare(&self, image: RgbaImage, baseline: RgbaImage) -> Result<EngineOutput> {
        let config = self.config.clone();
        run_blocking(move || {
            let (mismatch, diff) = pixelmatch(&image, &baseline, &config);
            EngineOutput::Pixels {
                mismatch,
                diff: Some(diff),
                clusters: Vec::new(),
            }
        })
        .await
    }
}

/// Faded grey rendering of an unchanged pixel
fn faded(pixel: &Rgba<u8>) -> Rgba<u8> {
    let alpha = FADE * pixel.0[3] as f64 / 255.0;
    let value = (255.0 + (brightness(pixel) - 255.0) * alpha).clamp(0.0, 255.0) as u8;
    Rgba([value, value, value, 255])
}

/// Count differing pixels and render a diff image.
///
/// Both images must have the same dimensions.
pub fn pixelmatch(image: &RgbaImage, baseline: &RgbaImage, config: &PixelmatchConfig) -> (u64, RgbaImage) {
    let (width, height) = image.dimensions();
    let threshold = config.threshold.clamp(0.0, 1.0);
    let max_delta = MAX_YIQ_DELTA * threshold * threshold;

    let mut diff = RgbaImage::new(width, height);
    let mut mismatch = 0u64;
    let mut antialiased = 0u64;

    for (x, y, actual) in image.enumerate_pixels() {
        let expected = baseline.get_pixel(x, y);

        let delta = color_delta(actual, expected, false);
        if delta.abs() <= max_delta {
            diff.put_pixel(x, y, faded(actual));
            continue;
        }

        if config.ignore_antialiasing
            && (is_antialiased(image, x, y, baseline, 0.0) || is_antialiased(baseline, x, y, image, 0.0))
        {
            antialiased += 1;
            diff.put_pixel(x, y, AA_COLOR);
        } else {
            mismatch += 1;
            diff.put_pixel(x, y, DIFF_COLOR);
        }
    }

    debug!(
        "pixelmatch: {} differing, {} anti-aliased of {} pixels",
        mismatch,
        antialiased,
        width as u64 * height as u64
    );
    (mismatch, diff)
}
