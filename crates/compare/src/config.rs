//! Per-algorithm comparison settings
//!
//! Projects store these as free-form JSON. Parsing never fails: missing
//! fields take their defaults and an unreadable document falls back to the
//! full default with a warning.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;
use vrt_common::ImageComparison;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PixelmatchConfig {
    /// Matching threshold in 0..=1, smaller is more sensitive
    pub threshold: f64,
    /// Do not count pixels detected as anti-aliasing
    pub ignore_antialiasing: bool,
    pub allow_diff_dimensions: bool,
}

impl Default for PixelmatchConfig {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            ignore_antialiasing: true,
            allow_diff_dimensions: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LookSameConfig {
    /// Exact channel equality instead of a perceptual distance
    pub strict: bool,
    /// CIEDE2000 distance at which two colours count as different
    pub tolerance: f64,
    pub antialiasing_tolerance: f64,
    pub ignore_antialiasing: bool,
    /// Ignore a diff that is only a blinking text caret
    pub ignore_caret: bool,
    pub allow_diff_dimensions: bool,
    /// Merge radius in pixels when grouping diff clusters
    pub clusters_size: u32,
    pub should_cluster: bool,
}

impl Default for LookSameConfig {
    fn default() -> Self {
        Self {
            strict: false,
            tolerance: 2.3,
            antialiasing_tolerance: 0.0,
            ignore_antialiasing: true,
            ignore_caret: true,
            allow_diff_dimensions: false,
            clusters_size: 10,
            should_cluster: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OdiffConfig {
    pub binary_path: String,
    pub threshold: f64,
    pub antialiasing: bool,
    pub fail_on_layout_diff: bool,
    pub output_diff_mask: bool,
}

impl Default for OdiffConfig {
    fn default() -> Self {
        Self {
            binary_path: "odiff".to_string(),
            threshold: 0.1,
            antialiasing: true,
            fail_on_layout_diff: true,
            output_diff_mask: true,
        }
    }
}

impl OdiffConfig {
    pub fn allow_diff_dimensions(&self) -> bool {
        !self.fail_on_layout_diff
    }
}

/// Parse an algorithm config, falling back to its default on any problem
pub fn parse_config<T>(raw: &str, algorithm: ImageComparison) -> T
where
    T: DeserializeOwned + Default,
{
    if raw.trim().is_empty() {
        warn!("No {} config set, using defaults", algorithm);
        return T::default();
    }

    match serde_json::from_str(raw) {
        Ok(config) => config,
        Err(e) => {
            warn!("Invalid {} config {:?}: {}; using defaults", algorithm, raw, e);
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("" ; "empty")]
    #[test_case("   " ; "blank")]
    #[test_case("{not json" ; "malformed")]
    #[test_case("[1, 2, 3]" ; "wrong shape")]
    fn test_pixelmatch_falls_back_to_default(raw: &str) {
        let config: PixelmatchConfig = parse_config(raw, ImageComparison::Pixelmatch);
        assert_eq!(config, PixelmatchConfig::default());
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let config: LookSameConfig =
            parse_config(r#"{"tolerance": 5.0, "shouldCluster": true}"#, ImageComparison::LookSame);
        assert_eq!(config.tolerance, 5.0);
        assert!(config.should_cluster);
        assert!(config.ignore_caret);
        assert_eq!(config.clusters_size, 10);
    }

    #[test]
    fn test_odiff_layout_flag_drives_dimensions() {
        let config: OdiffConfig =
            parse_config(r#"{"failOnLayoutDiff": false}"#, ImageComparison::Odiff);
        assert!(config.allow_diff_dimensions());
        assert_eq!(config.binary_path, "odiff");
        assert!(!OdiffConfig::default().allow_diff_dimensions());
    }
}
