//! Test variations and their baseline history

use crate::builds::BuildCounter;
use crate::resolver::BaselineResolver;
use crate::state::AppState;
use crate::test_runs::{TestRunRequest, TestRunService};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vrt_common::store::*;
use vrt_common::{Baseline, Build, Error, Project, Result, TestIdentity, TestVariation};

pub struct VariationService {
    state: AppState,
}

impl VariationService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Variation a submission on `branch_name` compares against, created
    /// without a baseline when none applies.
    ///
    /// Concurrent callers converge on one row.
    pub fn find_or_create(&self, project: &Project, identity: &TestIdentity, branch_name: &str) -> Result<TestVariation> {
        if let Some(found) = BaselineResolver::new(self.state.store()).resolve(project, identity, branch_name)? {
            return Ok(found);
        }
        self.find_or_create_exact(project.id, identity, branch_name)
    }

    /// Variation for exactly this branch, ignoring the main-branch fallback
    pub fn find_or_create_exact(
        &self,
        project_id: Uuid,
        identity: &TestIdentity,
        branch_name: &str,
    ) -> Result<TestVariation> {
        if let Some(found) = self.state.store().find_variation(project_id, identity, branch_name)? {
            return Ok(found);
        }

        let variation = TestVariation::new(project_id, identity.clone(), branch_name);
        match self.state.store().insert_variation_or_conflict(&variation)? {
            InsertOutcome::Inserted(created) => {
                debug!("Created test variation {} for {} on {}", created.id, identity, branch_name);
                Ok(created)
            }
            InsertOutcome::Conflict => self
                .state
                .store()
                .find_variation(project_id, identity, branch_name)?
                .ok_or_else(|| {
                    Error::Integrity(format!(
                        "test variation for {} on {} conflicted but cannot be read",
                        identity, branch_name
                    ))
                }),
        }
    }

    /// Branch-owned copy of `source` carrying its regions and comment
    pub fn fork(&self, project: &Project, source: &TestVariation, branch_name: &str) -> Result<TestVariation> {
        let mut forked = self.find_or_create_exact(project.id, &source.identity, branch_name)?;
        if forked.id == source.id {
            return Ok(forked);
        }

        if forked.ignore_regions.is_empty() && forked.comment.is_none() {
            forked.ignore_regions = source.ignore_regions.clone();
            forked.comment = source.comment.clone();
            forked = self.state.store().update_variation(&forked)?;
        }
        info!(
            "Forked test variation {} from {} onto {}",
            forked.id, source.branch_name, branch_name
        );
        Ok(forked)
    }

    /// Record `baseline_name` as the variation's current baseline
    pub fn add_baseline(
        &self,
        variation_id: Uuid,
        baseline_name: &str,
        test_run_id: Option<Uuid>,
        user_id: Option<String>,
    ) -> Result<TestVariation> {
        let baseline = Baseline::new(variation_id, baseline_name, test_run_id, user_id);
        let variation = self.state.store().add_baseline(&baseline)?;
        info!("Test variation {} baseline is now {}", variation.id, baseline_name);
        Ok(variation)
    }

    /// Replay every baselined variation of `from_branch` onto `to_branch`.
    ///
    /// Runs land in a fresh build, stopped once all are submitted.
    pub async fn merge(&self, project: &Project, from_branch: &str, to_branch: &str) -> Result<Build> {
        let builds = BuildCounter::new(self.state.clone());
        let build = builds.find_or_create(project.id, to_branch, None).await?;
        let runs = TestRunService::new(self.state.clone());

        let variations = self.state.store().list_variations(project.id, Some(from_branch))?;
        let mut replayed = 0usize;
        for variation in variations {
            let Some(baseline_name) = &variation.baseline_name else {
                continue;
            };
            let Some(image) = self.state.images().read_image(baseline_name).await? else {
                warn!("Baseline {} of variation {} is missing, skipping", baseline_name, variation.id);
                continue;
            };

            let mut request = TestRunRequest::new(project.id, build.id, variation.identity.clone(), to_branch, image);
            request.merge = true;
            runs.post_test_run(request).await?;
            replayed += 1;
        }

        info!(
            "Merged {} variations of {} into {} in build {}",
            replayed, from_branch, to_branch, build.id
        );
        builds.stop(build.id)
    }

    /// Remove a variation with its runs, baseline history and images
    pub async fn delete_variation(&self, variation_id: Uuid) -> Result<bool> {
        let Some(variation) = self.state.store().get_variation(variation_id)? else {
            return Ok(false);
        };

        let runs = TestRunService::new(self.state.clone());
        for run in self.state.store().list_test_runs_by_variation(variation.id)? {
            runs.delete_test_run(run.id).await?;
        }

        for baseline in self.state.store().delete_baselines(variation.id)? {
            self.state.images().delete_image(&baseline.baseline_name).await?;
        }

        let deleted = self.state.store().delete_variation(variation.id)?;
        debug!("Deleted test variation {} ({})", variation.id, variation.identity);
        Ok(deleted)
    }

    /// Delete feature-branch variations older than each project's branch lifetime
    pub async fn sweep_stale_variations(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for project in self.state.store().list_projects()? {
            let before = now - Duration::days(i64::from(project.max_branch_lifetime));
            let stale = self
                .state
                .store()
                .list_stale_variations(project.id, &project.main_branch_name, before)?;

            for variation in stale {
                if self.delete_variation(variation.id).await? {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!("Swept {} stale test variations", removed);
        }
        Ok(removed)
    }
}
