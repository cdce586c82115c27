//! Automatic approval of explainable diffs
//!
//! Two heuristics look for an already-approved image the new screenshot
//! matches:
//! - past baselines: a branch that has not caught up with main may still
//!   match one of main's older baselines
//! - new baselines: another branch may already have approved the same change
//!
//! Both stop at the first match and approve with `auto = true`.

use crate::state::AppState;
use crate::test_runs::{is_missing_run, TestRunService};
use tracing::{debug, info, warn};
use vrt_common::store::*;
use vrt_common::{Error, Project, Result, TestRun, TestStatus};

pub struct AutoApproveEngine {
    state: AppState,
}

impl AutoApproveEngine {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Try both heuristics in order; returns the run as it stands afterwards
    pub async fn apply(&self, project: &Project, run: TestRun) -> Result<TestRun> {
        if !project.auto_approve_feature {
            return Ok(run);
        }

        let run = self.by_past_baselines(project, run).await?;
        self.by_new_baselines(project, run).await
    }

    fn applicable(run: &TestRun) -> bool {
        !matches!(
            run.status,
            TestStatus::Ok | TestStatus::Approved | TestStatus::AutoApproved | TestStatus::Failed
        )
    }

    /// Compare against the owning variation's older baselines
    pub async fn by_past_baselines(&self, project: &Project, run: TestRun) -> Result<TestRun> {
        if !Self::applicable(&run) {
            return Ok(run);
        }
        let Some(variation_id) = run.test_variation_id else {
            return Ok(run);
        };
        if run.baseline_branch_name.as_deref() == Some(run.branch_name.as_str()) {
            return Ok(run);
        }

        // The newest entry is the baseline the main flow already compared against
        let history = self.state.store().list_baselines(variation_id)?;
        for baseline in history.iter().skip(1) {
            if self.matches(project, &run, &baseline.baseline_name).await? {
                info!(
                    "Test run {} matches past baseline {}, auto-approving",
                    run.id, baseline.baseline_name
                );
                return self.approve(run).await;
            }
        }
        Ok(run)
    }

    /// Compare against the current baselines of variations whose runs with the
    /// same starting point were already approved
    pub async fn by_new_baselines(&self, project: &Project, run: TestRun) -> Result<TestRun> {
        if !Self::applicable(&run) {
            return Ok(run);
        }
        let Some(baseline_name) = run.baseline_name.clone() else {
            return Ok(run);
        };

        let approved = self
            .state
            .store()
            .find_approved_test_runs(project.id, &run.identity, &baseline_name)?;

        for other in approved {
            if other.id == run.id {
                continue;
            }
            let Some(variation_id) = other.test_variation_id else {
                continue;
            };
            let Some(newest) = self.state.store().list_baselines(variation_id)?.into_iter().next() else {
                continue;
            };
            if newest.baseline_name == baseline_name {
                continue;
            }

            if self.matches(project, &run, &newest.baseline_name).await? {
                info!(
                    "Test run {} matches baseline {} approved in run {}, auto-approving",
                    run.id, newest.baseline_name, other.id
                );
                return self.approve(run).await;
            }
        }
        Ok(run)
    }

    async fn matches(&self, project: &Project, run: &TestRun, baseline_name: &str) -> Result<bool> {
        let service = TestRunService::new(self.state.clone());
        match service
            .compare_with_baseline(project, run, Some(baseline_name), false)
            .await
        {
            Ok(result) => Ok(result.is_ok()),
            Err(e @ (Error::Comparison(_) | Error::Integrity(_) | Error::Image(_))) => {
                warn!("Skipping baseline {} for test run {}: {}", baseline_name, run.id, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn approve(&self, run: TestRun) -> Result<TestRun> {
        debug!("Auto-approving test run {}", run.id);
        match TestRunService::new(self.state.clone())
            .approve(run.id, false, true, None)
            .await
        {
            Err(e) if is_missing_run(&e) => {
                debug!("Test run {} was superseded, leaving it as {}", run.id, run.status);
                Ok(run)
            }
            result => result,
        }
    }
}
