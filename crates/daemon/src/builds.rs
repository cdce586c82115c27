//! Build creation and numbering
//!
//! Builds are keyed by `(project, ci_build_id)` when the CI supplies an id, so
//! parallel shards of one CI job share a build. The number is claimed in a
//! separate atomic step that only ever fires once per build.

use crate::state::AppState;
use crate::test_runs::TestRunService;
use tracing::{debug, info};
use uuid::Uuid;
use vrt_common::store::*;
use vrt_common::{Build, Error, Event, Result};

pub struct BuildCounter {
    state: AppState,
}

impl BuildCounter {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Running, numbered build for this CI id, or a fresh one when none is given
    pub async fn find_or_create(&self, project_id: Uuid, branch_name: &str, ci_build_id: Option<&str>) -> Result<Build> {
        let project = self.state.project(project_id)?;

        let known = match ci_build_id {
            Some(ci) => self.state.store().find_build_by_ci_id(project.id, ci)?.is_some(),
            None => false,
        };
        if !known {
            self.evict_old_builds(project.id, project.max_build_allowed).await?;
        }

        let candidate = Build::new(project.id, branch_name, ci_build_id.map(str::to_string));
        let (id, created) = match self.state.store().insert_build_or_conflict(&candidate)? {
            InsertOutcome::Inserted(build) => (build.id, true),
            InsertOutcome::Conflict => {
                let ci = ci_build_id.unwrap_or_default();
                let existing = self
                    .state
                    .store()
                    .mark_build_running_by_ci_id(project.id, ci)?
                    .ok_or_else(|| {
                        Error::Integrity(format!("build {} conflicted but cannot be read", ci))
                    })?;
                (existing.id, false)
            }
        };

        let build = self
            .state
            .store()
            .claim_build_number(id)?
            .ok_or_else(|| Error::not_found("build", id))?;

        if created {
            info!(
                "Created build #{} for project {} on {}",
                build.number.unwrap_or_default(),
                project.name,
                build.branch_name
            );
            self.state.notifier().publish(Event::BuildCreated(build.clone()));
        } else {
            debug!("Joined build #{} ({})", build.number.unwrap_or_default(), build.id);
            self.state.notifier().publish(Event::BuildUpdated(build.clone()));
        }
        Ok(build)
    }

    pub fn get_build(&self, id: Uuid) -> Result<Option<Build>> {
        self.state.store().get_build(id)
    }

    /// Mark a build as finished
    pub fn stop(&self, id: Uuid) -> Result<Build> {
        let build = self
            .state
            .store()
            .set_build_running(id, false)?
            .ok_or_else(|| Error::not_found("build", id))?;
        debug!("Stopped build {}", build.id);
        self.state.notifier().publish(Event::BuildUpdated(build.clone()));
        Ok(build)
    }

    /// Remove a build with its runs and their images. Missing builds are not an error.
    pub async fn delete_build(&self, id: Uuid) -> Result<bool> {
        let Some(build) = self.state.store().get_build(id)? else {
            return Ok(false);
        };

        let runs = TestRunService::new(self.state.clone());
        for run in self.state.store().list_test_runs_by_build(build.id)? {
            runs.delete_test_run(run.id).await?;
        }

        if !self.state.store().delete_build(build.id)? {
            return Ok(false);
        }

        info!("Deleted build {}", build.id);
        self.state.notifier().publish(Event::BuildDeleted {
            id: build.id,
            project_id: build.project_id,
        });
        Ok(true)
    }

    /// Keep room for one more build under `max_build_allowed`
    pub async fn evict_old_builds(&self, project_id: Uuid, max_build_allowed: u32) -> Result<usize> {
        let keep = max_build_allowed.saturating_sub(1).max(1) as usize;
        let builds = self.state.store().list_builds(project_id)?;

        let mut evicted = 0;
        for build in builds.into_iter().skip(keep) {
            if self.delete_build(build.id).await? {
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!("Evicted {} old builds of project {}", evicted, project_id);
        }
        Ok(evicted)
    }
}
