//! VRT screenshot comparison
//!
//! [`ImageComparator`] applies one policy to every diff strategy:
//! 1. no baseline yields an indeterminate verdict
//! 2. identical pixels are `ok` without running a strategy
//! 3. differing dimensions are `unresolved` unless the strategy allows
//!    padding both images onto a common canvas
//! 4. ignore regions are masked out of both images
//! 5. the strategy's mismatch count becomes a percentage of the canvas, and
//!    anything above the tolerance is `unresolved`
//!
//! Strategies live behind [`DiffEngine`] and are picked from the project
//! settings by [`engine_for`].

pub mod antialias;
pub mod canvas;
pub mod config;
pub mod engine;
pub mod look_same;
pub mod mask;
pub mod odiff;
pub mod pixelmatch;

pub use config::{LookSameConfig, OdiffConfig, PixelmatchConfig};
pub use engine::{engine_for, DiffEngine, EngineOutput};
pub use mask::{apply_ignore_regions, merge_regions};

use canvas::{fingerprint, pad_to};
use image::RgbaImage;
use std::sync::Arc;
use tracing::{debug, info};
use vrt_common::{DiffResult, IgnoreRegion, ImageKind, ImageStore, Project, Result, TestStatus};

/// Everything a single comparison needs
#[derive(Debug, Clone, Copy)]
pub struct DiffInput<'a> {
    pub image: &'a RgbaImage,
    pub baseline: Option<&'a RgbaImage>,
    pub ignore_regions: &'a [IgnoreRegion],
    /// Highest diff percentage still reported as `ok`
    pub tolerance_percent: f64,
    /// Persist the diff image when the verdict is `unresolved`
    pub save_diff: bool,
}

/// Computes verdicts and stores diff images
#[derive(Clone)]
pub struct ImageComparator {
    images: Arc<dyn ImageStore>,
}

impl ImageComparator {
    pub fn new(images: Arc<dyn ImageStore>) -> Self {
        Self { images }
    }

    /// Compare with the strategy configured on the project
    pub async fn get_diff(&self, project: &Project, input: DiffInput<'_>) -> Result<DiffResult> {
        let engine = engine_for(project);
        self.get_diff_with(engine.as_ref(), input).await
    }

    pub async fn get_diff_with(&self, engine: &dyn DiffEngine, input: DiffInput<'_>) -> Result<DiffResult> {
        let Some(baseline) = input.baseline else {
            return Ok(DiffResult::no_baseline());
        };
        let image = input.image;

        if image.dimensions() == baseline.dimensions() && fingerprint(image) == fingerprint(baseline) {
            debug!("Screenshots match exactly (same hash)");
            return Ok(DiffResult::identical());
        }

        let same_dimension = image.dimensions() == baseline.dimensions();
        let (mut image, mut baseline) = if same_dimension {
            (image.clone(), baseline.clone())
        } else if engine.allow_diff_dimensions() {
            let width = image.width().max(baseline.width());
            let height = image.height().max(baseline.height());
            (pad_to(image, width, height), pad_to(baseline, width, height))
        } else {
            info!(
                "Screenshot dimensions differ: image {:?} vs baseline {:?}",
                image.dimensions(),
                baseline.dimensions()
            );
            return Ok(DiffResult::dimension_mismatch());
        };

        apply_ignore_regions(&mut image, input.ignore_regions);
        apply_ignore_regions(&mut baseline, input.ignore_regions);

        let total_pixels = image.width() as u64 * image.height() as u64;

        let (mismatch, diff, clusters) = match engine.compare(image, baseline).await? {
            EngineOutput::LayoutDiff => return Ok(DiffResult::dimension_mismatch()),
            EngineOutput::Pixels {
                mismatch,
                diff,
                clusters,
            } => (mismatch, diff, clusters),
        };

        let diff_percent = if total_pixels == 0 {
            0.0
        } else {
            mismatch as f64 * 100.0 / total_pixels as f64
        };

        if diff_percent <= input.tolerance_percent {
            debug!(
                "{}: {:.3}% differ, within tolerance {:.3}%",
                engine.name(),
                diff_percent,
                input.tolerance_percent
            );
            return Ok(DiffResult {
                status: Some(TestStatus::Ok),
                diff_name: None,
                pixel_mismatch_count: Some(mismatch),
                diff_percent: Some(diff_percent),
                same_dimension: Some(same_dimension),
                diff_clusters: clusters,
            });
        }

        let diff_name = match diff {
            Some(diff) if input.save_diff => Some(self.images.save_rgba(ImageKind::Diff, &diff).await?),
            _ => None,
        };

        info!(
            "{}: {:.3}% differ ({} pixels), above tolerance {:.3}%",
            engine.name(),
            diff_percent,
            mismatch,
            input.tolerance_percent
        );

        Ok(DiffResult {
            status: Some(TestStatus::Unresolved),
            diff_name,
            pixel_mismatch_count: Some(mismatch),
            diff_percent: Some(diff_percent),
            same_dimension: Some(same_dimension),
            diff_clusters: clusters,
        })
    }
}
