//! Strategy seam between the comparison policy and the diff algorithms

use crate::config::parse_config;
use crate::look_same::LookSameEngine;
use crate::odiff::OdiffEngine;
use crate::pixelmatch::PixelmatchEngine;
use async_trait::async_trait;
use image::RgbaImage;
use vrt_common::{DiffCluster, Error, ImageComparison, Project, Result};

/// What a strategy found after masking
#[derive(Debug, Clone)]
pub enum EngineOutput {
    Pixels {
        mismatch: u64,
        diff: Option<RgbaImage>,
        clusters: Vec<DiffCluster>,
    },
    /// The images cannot be laid over each other
    LayoutDiff,
}

/// A diff algorithm. Receives two masked images of equal size.
#[async_trait]
pub trait DiffEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pad differently sized images instead of failing fast
    fn allow_diff_dimensions(&self) -> bool;

    async fn compare(&self, image: RgbaImage, baseline: RgbaImage) -> Result<EngineOutput>;
}

/// Build the strategy a project is configured for
pub fn engine_for(project: &Project) -> Box<dyn DiffEngine> {
    let raw = project.image_comparison_config.as_str();
    match project.image_comparison {
        ImageComparison::Pixelmatch => Box::new(PixelmatchEngine::new(parse_config(
            raw,
            ImageComparison::Pixelmatch,
        ))),
        ImageComparison::LookSame => Box::new(LookSameEngine::new(parse_config(
            raw,
            ImageComparison::LookSame,
        ))),
        ImageComparison::Odiff => Box::new(OdiffEngine::new(parse_config(raw, ImageComparison::Odiff))),
    }
}

/// Run a CPU-bound comparison off the async workers
pub(crate) async fn run_blocking<F>(f: F) -> Result<EngineOutput>
where
    F: FnOnce() -> EngineOutput + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Comparison(format!("diff task failed: {}", e)))
}
