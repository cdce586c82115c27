//! Core types for VRT

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current time truncated to millisecond precision, the resolution the store keeps.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Diff algorithm selected per project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageComparison {
    Pixelmatch,
    LookSame,
    Odiff,
}

impl Default for ImageComparison {
    fn default() -> Self {
        Self::Pixelmatch
    }
}

impl std::fmt::Display for ImageComparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pixelmatch => write!(f, "pixelmatch"),
            Self::LookSame => write!(f, "lookSame"),
            Self::Odiff => write!(f, "odiff"),
        }
    }
}

impl std::str::FromStr for ImageComparison {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pixelmatch" => Ok(Self::Pixelmatch),
            "lookSame" => Ok(Self::LookSame),
            "odiff" => Ok(Self::Odiff),
            _ => Err(format!("unknown image comparison: {}", s)),
        }
    }
}

/// Test run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStatus {
    New,
    Unresolved,
    Ok,
    Failed,
    Approved,
    AutoApproved,
}

impl Default for TestStatus {
    fn default() -> Self {
        Self::New
    }
}

impl TestStatus {
    /// Approved by a person or by the auto-approve heuristics
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved | Self::AutoApproved)
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Unresolved => write!(f, "unresolved"),
            Self::Ok => write!(f, "ok"),
            Self::Failed => write!(f, "failed"),
            Self::Approved => write!(f, "approved"),
            Self::AutoApproved => write!(f, "autoApproved"),
        }
    }
}

impl std::str::FromStr for TestStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "unresolved" => Ok(Self::Unresolved),
            "ok" => Ok(Self::Ok),
            "failed" => Ok(Self::Failed),
            "approved" => Ok(Self::Approved),
            "autoApproved" => Ok(Self::AutoApproved),
            _ => Err(format!("unknown test status: {}", s)),
        }
    }
}

/// Rectangle excluded from comparison.
///
/// Coordinates and sizes may be negative or zero; masking clips them to the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IgnoreRegion {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl IgnoreRegion {
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self { x, y, width, height }
    }
}

/// Project settings that drive comparison and retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub main_branch_name: String,
    pub auto_approve_feature: bool,
    pub image_comparison: ImageComparison,
    /// Algorithm-specific JSON, read by the comparator, falling back to defaults
    pub image_comparison_config: String,
    pub max_build_allowed: u32,
    /// Days a non-main branch variation may stay untouched before the sweep removes it
    pub max_branch_lifetime: u32,
    pub builds_counter: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            main_branch_name: "master".to_string(),
            auto_approve_feature: false,
            image_comparison: ImageComparison::Pixelmatch,
            image_comparison_config: String::new(),
            max_build_allowed: 100,
            max_branch_lifetime: 30,
            builds_counter: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_main_branch(mut self, branch: impl Into<String>) -> Self {
        self.main_branch_name = branch.into();
        self
    }

    pub fn with_auto_approve(mut self, enabled: bool) -> Self {
        self.auto_approve_feature = enabled;
        self
    }

    pub fn with_comparison(mut self, kind: ImageComparison, config: impl Into<String>) -> Self {
        self.image_comparison = kind;
        self.image_comparison_config = config.into();
        self
    }

    pub fn with_max_builds(mut self, max: u32) -> Self {
        self.max_build_allowed = max;
        self
    }

    pub fn with_branch_lifetime(mut self, days: u32) -> Self {
        self.max_branch_lifetime = days;
        self
    }
}

/// A CI build grouping test runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub project_id: Uuid,
    /// External CI identifier, unique per project when present
    pub ci_build_id: Option<String>,
    pub branch_name: String,
    pub is_running: bool,
    /// Sequential per-project number, assigned exactly once
    pub number: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Build {
    pub fn new(project_id: Uuid, branch_name: impl Into<String>, ci_build_id: Option<String>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            project_id,
            ci_build_id,
            branch_name: branch_name.into(),
            is_running: true,
            number: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Name and environment attributes of a logical test case, without the branch
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestIdentity {
    pub name: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub browser: String,
    #[serde(default)]
    pub viewport: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub custom_tags: String,
}

impl TestIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = os.into();
        self
    }

    pub fn with_browser(mut self, browser: impl Into<String>) -> Self {
        self.browser = browser.into();
        self
    }

    pub fn with_viewport(mut self, viewport: impl Into<String>) -> Self {
        self.viewport = viewport.into();
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_custom_tags(mut self, tags: impl Into<String>) -> Self {
        self.custom_tags = tags.into();
        self
    }
}

impl std::fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}|{}|{}|{}|{}]",
            self.name, self.os, self.browser, self.viewport, self.device, self.custom_tags
        )
    }
}

/// A logical test case on one branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestVariation {
    pub id: Uuid,
    pub project_id: Uuid,
    #[serde(flatten)]
    pub identity: TestIdentity,
    pub branch_name: String,
    /// Current baseline image
    pub baseline_name: Option<String>,
    #[serde(default)]
    pub ignore_regions: Vec<IgnoreRegion>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TestVariation {
    pub fn new(project_id: Uuid, identity: TestIdentity, branch_name: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            project_id,
            identity,
            branch_name: branch_name.into(),
            baseline_name: None,
            ignore_regions: Vec::new(),
            comment: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Immutable record of an approved image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub id: Uuid,
    pub test_variation_id: Uuid,
    pub baseline_name: String,
    pub test_run_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Baseline {
    pub fn new(
        test_variation_id: Uuid,
        baseline_name: impl Into<String>,
        test_run_id: Option<Uuid>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            test_variation_id,
            baseline_name: baseline_name.into(),
            test_run_id,
            user_id,
            created_at: now_millis(),
        }
    }
}

/// One comparison attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub id: Uuid,
    pub build_id: Uuid,
    pub test_variation_id: Option<Uuid>,
    #[serde(flatten)]
    pub identity: TestIdentity,
    pub image_name: String,
    pub baseline_name: Option<String>,
    pub diff_name: Option<String>,
    pub diff_tolerance_percent: f64,
    pub pixel_mismatch_count: Option<u64>,
    pub diff_percent: Option<f64>,
    pub same_dimension: Option<bool>,
    pub status: TestStatus,
    /// Persistent regions captured from the variation
    #[serde(default)]
    pub ignore_regions: Vec<IgnoreRegion>,
    /// Regions supplied with this submission only
    #[serde(default)]
    pub temp_ignore_regions: Vec<IgnoreRegion>,
    pub comment: Option<String>,
    pub branch_name: String,
    pub baseline_branch_name: Option<String>,
    pub merge: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one image comparison
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    /// `None` when there was nothing to compare against
    pub status: Option<TestStatus>,
    pub diff_name: Option<String>,
    pub pixel_mismatch_count: Option<u64>,
    pub diff_percent: Option<f64>,
    pub same_dimension: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff_clusters: Vec<DiffCluster>,
}

impl DiffResult {
    /// First observation: no baseline exists yet
    pub fn no_baseline() -> Self {
        Self::default()
    }

    pub fn identical() -> Self {
        Self {
            status: Some(TestStatus::Ok),
            diff_name: None,
            pixel_mismatch_count: Some(0),
            diff_percent: Some(0.0),
            same_dimension: Some(true),
            diff_clusters: Vec::new(),
        }
    }

    pub fn dimension_mismatch() -> Self {
        Self {
            status: Some(TestStatus::Unresolved),
            same_dimension: Some(false),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Some(TestStatus::Ok)
    }
}

/// Bounding box of a group of neighbouring differing pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffCluster {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl DiffCluster {
    pub fn width(&self) -> u32 {
        self.right - self.left + 1
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            TestStatus::New,
            TestStatus::Unresolved,
            TestStatus::Ok,
            TestStatus::Failed,
            TestStatus::Approved,
            TestStatus::AutoApproved,
        ] {
            assert_eq!(status.to_string().parse::<TestStatus>().unwrap(), status);
        }
        assert!("rejected".parse::<TestStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let json = serde_json::to_string(&TestStatus::AutoApproved).unwrap();
        assert_eq!(json, "\"autoApproved\"");
    }

    #[test]
    fn test_identity_defaults_to_empty_attributes() {
        let identity = TestIdentity::new("login page").with_browser("chrome");
        assert_eq!(identity.os, "");
        assert_eq!(identity.browser, "chrome");
    }

    #[test]
    fn test_diff_cluster_size() {
        let cluster = DiffCluster { left: 2, top: 3, right: 2, bottom: 9 };
        assert_eq!(cluster.width(), 1);
        assert_eq!(cluster.height(), 7);
    }
}
