//! Comparison through the external `odiff` binary

use crate::config::OdiffConfig;
use crate::engine::{DiffEngine, EngineOutput};
use async_trait::async_trait;
use image::RgbaImage;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;
use vrt_common::storage::{decode_png, encode_png};
use vrt_common::{Error, Result};

const EXIT_MATCH: i32 = 0;
const EXIT_LAYOUT_DIFF: i32 = 21;
const EXIT_PIXEL_DIFF: i32 = 22;

pub struct OdiffEngine {
    config: OdiffConfig,
}

impl OdiffEngine {
    pub fn new(config: OdiffConfig) -> Self {
        Self { config }
    }

    fn args(&self, base: &Path, compare: &Path, diff: &Path) -> Vec<String> {
        let mut args = vec![
            base.to_string_lossy().into_owned(),
            compare.to_string_lossy().into_owned(),
            diff.to_string_lossy().into_owned(),
            format!("--threshold={}", self.config.threshold),
            "--parsable-stdout".to_string(),
        ];
        if self.config.antialiasing {
            args.push("--antialiasing".to_string());
        }
        if self.config.fail_on_layout_diff {
            args.push("--fail-on-layout".to_string());
        }
        if self.config.output_diff_mask {
            args.push("--diff-mask".to_string());
        }
        args
    }
}

/// Differing pixel count from `--parsable-stdout` output (`count;percent`)
fn parse_mismatch(stdout: &str) -> Result<u64> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| Error::Comparison("odiff reported a diff without statistics".to_string()))?;

    let count = line.split(';').next().unwrap_or_default().trim();
    count
        .parse::<f64>()
        .map(|c| c.max(0.0).round() as u64)
        .map_err(|e| Error::Comparison(format!("unexpected odiff output {:?}: {}", line, e)))
}

#[async_trait]
impl DiffEngine for OdiffEngine {
    fn name(&self) -> &'static str {
        "odiff"
    }

    fn allow_diff_dimensions(&self) -> bool {
        self.config.allow_diff_dimensions()
    }

    async fn compare(&self, image: RgbaImage, baseline: RgbaImage) -> Result<EngineOutput> {
        let scratch = tempfile::tempdir()?;
        let base_path = scratch.path().join("baseline.png");
        let compare_path = scratch.path().join("image.png");
        let diff_path = scratch.path().join("diff.png");

        tokio::fs::write(&base_path, encode_png(&baseline)?).await?;
        tokio::fs::write(&compare_path, encode_png(&image)?).await?;

        let output = Command::new(&self.config.binary_path)
            .args(self.args(&base_path, &compare_path, &diff_path))
            .output()
            .await
            .map_err(|e| Error::Comparison(format!("failed to run {}: {}", self.config.binary_path, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match output.status.code() {
            Some(EXIT_MATCH) => Ok(EngineOutput::Pixels {
                mismatch: 0,
                diff: None,
                clusters: Vec::new(),
            }),
            Some(EXIT_LAYOUT_DIFF) => {
                debug!("odiff reported a layout difference");
                Ok(EngineOutput::LayoutDiff)
            }
            Some(EXIT_PIXEL_DIFF) => {
                let mismatch = parse_mismatch(&stdout)?;
                let diff = match tokio::fs::read(&diff_path).await {
                    Ok(data) => Some(decode_png(&data)?),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                    Err(e) => return Err(e.into()),
                };
                Ok(EngineOutput::Pixels {
                    mismatch,
                    diff,
                    clusters: Vec::new(),
                })
            }
            code => Err(Error::Comparison(format!(
                "odiff exited with {:?}: {}",
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}
