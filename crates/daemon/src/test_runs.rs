//! Test run lifecycle
//!
//! ```text
//! new ──compare──▶ ok | unresolved | failed
//! unresolved ──approve──▶ approved | autoApproved
//! unresolved ──reject──▶ (deleted)
//! ```
//!
//! A submission supersedes every non-approved run of the same build, test
//! identity and branch. Images are stored before the row that references
//! them, so a committed run never points at a missing screenshot.

use crate::auto_approve::AutoApproveEngine;
use crate::state::AppState;
use crate::variations::VariationService;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vrt_common::store::*;
use vrt_common::{
    now_millis, DiffResult, Error, Event, IgnoreRegion, ImageKind, Project, Result, TestIdentity, TestRun,
    TestStatus, TestVariation,
};
use vrt_compare::{merge_regions, DiffInput};

/// One screenshot submission
#[derive(Debug, Clone)]
pub struct TestRunRequest {
    pub project_id: Uuid,
    pub build_id: Uuid,
    pub identity: TestIdentity,
    pub branch_name: String,
    /// PNG bytes
    pub image: Vec<u8>,
    pub diff_tolerance_percent: f64,
    /// Regions ignored for this submission only
    pub temp_ignore_regions: Vec<IgnoreRegion>,
    pub comment: Option<String>,
    /// Produced by replaying one branch onto another
    pub merge: bool,
}

impl TestRunRequest {
    pub fn new(
        project_id: Uuid,
        build_id: Uuid,
        identity: TestIdentity,
        branch_name: impl Into<String>,
        image: Vec<u8>,
    ) -> Self {
        Self {
            project_id,
            build_id,
            identity,
            branch_name: branch_name.into(),
            image,
            diff_tolerance_percent: 0.0,
            temp_ignore_regions: Vec::new(),
            comment: None,
            merge: false,
        }
    }
}

/// Outcome of persisting a verdict
enum Verdict {
    Stored(TestRun),
    /// The row was replaced by a newer submission before the verdict landed
    Superseded(TestRun),
}

/// The run row is gone, typically because a newer submission replaced it
pub(crate) fn is_missing_run(error: &Error) -> bool {
    matches!(error, Error::NotFound { kind, .. } if kind == "test run")
}

pub struct TestRunService {
    state: AppState,
}

impl TestRunService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Submit a screenshot and compute its verdict
    pub async fn post_test_run(&self, request: TestRunRequest) -> Result<TestRun> {
        let project = self.state.project(request.project_id)?;
        let build = self
            .state
            .store()
            .get_build(request.build_id)?
            .ok_or_else(|| Error::not_found("build", request.build_id))?;
        if build.project_id != project.id {
            return Err(Error::Integrity(format!(
                "build {} does not belong to project {}",
                build.id, project.id
            )));
        }

        let variation = VariationService::new(self.state.clone())
            .find_or_create(&project, &request.identity, &request.branch_name)?;

        let run = self.create_test_run(&variation, request).await?;
        match self.store_verdict(&project, run).await? {
            Verdict::Stored(run) if project.auto_approve_feature => {
                AutoApproveEngine::new(self.state.clone())
                    .apply(&project, run)
                    .await
            }
            Verdict::Stored(run) | Verdict::Superseded(run) => Ok(run),
        }
    }

    /// Store the screenshot and insert a `new` run against the variation's
    /// current baseline, replacing any pending run for the same build,
    /// identity and branch
    pub async fn create_test_run(&self, variation: &TestVariation, request: TestRunRequest) -> Result<TestRun> {
        let image_name = self
            .state
            .images()
            .save_image(ImageKind::Screenshot, &request.image)
            .await?;

        let now = now_millis();
        let run = TestRun {
            id: Uuid::new_v4(),
            build_id: request.build_id,
            test_variation_id: Some(variation.id),
            identity: request.identity,
            image_name,
            baseline_name: variation.baseline_name.clone(),
            diff_name: None,
            diff_tolerance_percent: request.diff_tolerance_percent,
            pixel_mismatch_count: None,
            diff_percent: None,
            same_dimension: None,
            status: TestStatus::New,
            ignore_regions: variation.ignore_regions.clone(),
            temp_ignore_regions: request.temp_ignore_regions,
            comment: request.comment.or_else(|| variation.comment.clone()),
            branch_name: request.branch_name,
            baseline_branch_name: Some(variation.branch_name.clone()),
            merge: request.merge,
            created_at: now,
            updated_at: now,
        };

        let superseded = match self.state.store().insert_test_run_superseding(&run) {
            Ok(superseded) => superseded,
            Err(e) => {
                // Leave no orphaned screenshot behind
                if let Err(cleanup) = self.state.images().delete_image(&run.image_name).await {
                    warn!("Failed to remove screenshot {}: {}", run.image_name, cleanup);
                }
                return Err(e);
            }
        };

        for previous in superseded {
            debug!("Test run {} superseded by {}", previous.id, run.id);
            self.remove_images(&previous).await?;
            self.state.notifier().publish(Event::TestRunDeleted {
                id: previous.id,
                build_id: previous.build_id,
            });
        }

        info!(
            "Created test run {} for {} on {} (baseline {:?})",
            run.id, run.identity, run.branch_name, run.baseline_name
        );
        self.state.notifier().publish(Event::TestRunCreated(run.clone()));
        Ok(run)
    }

    /// Compare a run's screenshot against a baseline image with the run's
    /// effective ignore regions and tolerance
    pub async fn compare_with_baseline(
        &self,
        project: &Project,
        run: &TestRun,
        baseline_name: Option<&str>,
        save_diff: bool,
    ) -> Result<DiffResult> {
        let image = self
            .state
            .images()
            .get_image(&run.image_name)
            .await?
            .ok_or_else(|| Error::Integrity(format!("screenshot {} is missing", run.image_name)))?;

        let baseline = match baseline_name {
            Some(name) => Some(
                self.state
                    .images()
                    .get_image(name)
                    .await?
                    .ok_or_else(|| Error::Integrity(format!("baseline {} is missing", name)))?,
            ),
            None => None,
        };

        let regions = merge_regions(&run.ignore_regions, &run.temp_ignore_regions);
        self.state
            .comparator()
            .get_diff(
                project,
                DiffInput {
                    image: &image,
                    baseline: baseline.as_ref(),
                    ignore_regions: &regions,
                    tolerance_percent: run.diff_tolerance_percent,
                    save_diff,
                },
            )
            .await
    }

    /// Compute and persist the verdict for a run.
    ///
    /// Comparison failures mark the run `failed`; storage failures propagate.
    /// A run superseded meanwhile is returned with its verdict but not stored.
    pub async fn calculate_diff(&self, project: &Project, run: TestRun) -> Result<TestRun> {
        match self.store_verdict(project, run).await? {
            Verdict::Stored(run) | Verdict::Superseded(run) => Ok(run),
        }
    }

    async fn store_verdict(&self, project: &Project, mut run: TestRun) -> Result<Verdict> {
        let previous_diff = run.diff_name.take();

        match self
            .compare_with_baseline(project, &run, run.baseline_name.as_deref(), true)
            .await
        {
            Ok(result) => {
                run.status = result.status.unwrap_or(TestStatus::New);
                run.diff_name = result.diff_name;
                run.pixel_mismatch_count = result.pixel_mismatch_count;
                run.diff_percent = result.diff_percent;
                run.same_dimension = result.same_dimension;
            }
            Err(e @ (Error::Comparison(_) | Error::Integrity(_) | Error::Image(_))) => {
                error!("Comparison failed for test run {}: {}", run.id, e);
                run.status = TestStatus::Failed;
                run.pixel_mismatch_count = None;
                run.diff_percent = None;
                run.same_dimension = None;
            }
            Err(e) => return Err(e),
        }

        let updated = match self.state.store().update_test_run(&run) {
            Ok(updated) => updated,
            Err(e) if is_missing_run(&e) => {
                // Whoever deleted the row removed the images it knew about
                debug!("Test run {} was superseded before its verdict was stored", run.id);
                if let Some(diff) = &run.diff_name {
                    self.state.images().delete_image(diff).await?;
                }
                run.diff_name = None;
                return Ok(Verdict::Superseded(run));
            }
            Err(e) => return Err(e),
        };

        if let Some(name) = previous_diff {
            self.state.images().delete_image(&name).await?;
        }

        debug!("Test run {} is {}", updated.id, updated.status);
        self.state.notifier().publish(Event::TestRunUpdated(updated.clone()));
        Ok(Verdict::Stored(updated))
    }

    /// Re-run the comparison from the stored inputs
    pub async fn recalculate_diff(&self, run_id: Uuid) -> Result<TestRun> {
        let run = self.state.test_run(run_id)?;
        let project = self.state.project_for_run(&run)?;
        self.calculate_diff(&project, run).await
    }

    /// Accept the run's screenshot as the new baseline.
    ///
    /// A manual approval on a branch other than the baseline's first forks a
    /// variation for that branch, leaving the other branch untouched. An
    /// automatic approval across branches only records the status.
    pub async fn approve(&self, run_id: Uuid, merge: bool, auto: bool, user_id: Option<String>) -> Result<TestRun> {
        let mut run = self.state.test_run(run_id)?;
        let variation_id = run
            .test_variation_id
            .ok_or_else(|| Error::Integrity(format!("test run {} has no test variation", run.id)))?;
        let variation = self
            .state
            .store()
            .get_variation(variation_id)?
            .ok_or_else(|| {
                Error::Integrity(format!(
                    "test run {} references missing test variation {}",
                    run.id, variation_id
                ))
            })?;

        let cross_branch = run.branch_name != variation.branch_name;

        if auto && cross_branch {
            debug!(
                "Auto-approving test run {} without touching the {} baseline",
                run.id, variation.branch_name
            );
        } else {
            let owner = if cross_branch && !merge && !auto {
                let project = self.state.project(variation.project_id)?;
                VariationService::new(self.state.clone()).fork(&project, &variation, &run.branch_name)?
            } else {
                variation
            };

            let data = self
                .state
                .images()
                .read_image(&run.image_name)
                .await?
                .ok_or_else(|| Error::Integrity(format!("screenshot {} is missing", run.image_name)))?;
            let baseline_name = self.state.images().save_image(ImageKind::Baseline, &data).await?;

            let owner = match VariationService::new(self.state.clone()).add_baseline(
                owner.id,
                &baseline_name,
                Some(run.id),
                user_id,
            ) {
                Ok(owner) => owner,
                Err(e) => {
                    if let Err(cleanup) = self.state.images().delete_image(&baseline_name).await {
                        warn!("Failed to remove baseline {}: {}", baseline_name, cleanup);
                    }
                    return Err(e);
                }
            };
            run.test_variation_id = Some(owner.id);
        }

        run.status = if auto {
            TestStatus::AutoApproved
        } else {
            TestStatus::Approved
        };
        let updated = self.state.store().update_test_run(&run)?;

        info!("Test run {} {}", updated.id, updated.status);
        self.state.notifier().publish(Event::TestRunUpdated(updated.clone()));
        Ok(updated)
    }

    /// Discard a run; baselines are never touched
    pub async fn reject(&self, run_id: Uuid) -> Result<bool> {
        self.delete_test_run(run_id).await
    }

    /// Remove a run with its screenshot and diff image. Missing runs are not an error.
    pub async fn delete_test_run(&self, run_id: Uuid) -> Result<bool> {
        let Some(run) = self.state.store().get_test_run(run_id)? else {
            return Ok(false);
        };

        if !self.state.store().delete_test_run(run.id)? {
            return Ok(false);
        }

        self.remove_images(&run).await?;

        debug!("Deleted test run {}", run.id);
        self.state.notifier().publish(Event::TestRunDeleted {
            id: run.id,
            build_id: run.build_id,
        });
        Ok(true)
    }

    async fn remove_images(&self, run: &TestRun) -> Result<()> {
        self.state.images().delete_image(&run.image_name).await?;
        if let Some(diff) = &run.diff_name {
            self.state.images().delete_image(diff).await?;
        }
        Ok(())
    }

    /// Replace the persistent regions on the run and its variation, then recompare
    pub async fn update_ignore_regions(&self, run_id: Uuid, regions: Vec<IgnoreRegion>) -> Result<TestRun> {
        let mut run = self.state.test_run(run_id)?;

        if let Some(variation_id) = run.test_variation_id {
            if let Some(mut variation) = self.state.store().get_variation(variation_id)? {
                variation.ignore_regions = regions.clone();
                self.state.store().update_variation(&variation)?;
            }
        }

        run.ignore_regions = regions;
        let run = self.state.store().update_test_run(&run)?;
        let project = self.state.project_for_run(&run)?;
        self.calculate_diff(&project, run).await
    }

    /// Replace the regions ignored for this run only, then recompare
    pub async fn update_temp_ignore_regions(&self, run_id: Uuid, regions: Vec<IgnoreRegion>) -> Result<TestRun> {
        let mut run = self.state.test_run(run_id)?;
        run.temp_ignore_regions = regions;
        let run = self.state.store().update_test_run(&run)?;
        let project = self.state.project_for_run(&run)?;
        self.calculate_diff(&project, run).await
    }

    /// Set the comment on the run and its variation
    pub async fn update_comment(&self, run_id: Uuid, comment: Option<String>) -> Result<TestRun> {
        let mut run = self.state.test_run(run_id)?;

        if let Some(variation_id) = run.test_variation_id {
            if let Some(mut variation) = self.state.store().get_variation(variation_id)? {
                variation.comment = comment.clone();
                self.state.store().update_variation(&variation)?;
            }
        }

        run.comment = comment;
        let updated = self.state.store().update_test_run(&run)?;
        self.state.notifier().publish(Event::TestRunUpdated(updated.clone()));
        Ok(updated)
    }
}
