//! Repository interfaces, one per aggregate.
//!
//! Every call is individually atomic. Absence is reported with `Option` or
//! `false`, never as an error. Inserts that can race on a natural key return
//! [`InsertOutcome::Conflict`] instead of failing, so callers can fall back to
//! reading or updating the row another writer created.

use crate::types::*;
use crate::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Result of a compare-and-swap style insert
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T> {
    Inserted(T),
    /// A row with the same unique key already exists
    Conflict,
}

impl<T> InsertOutcome<T> {
    pub fn inserted(self) -> Option<T> {
        match self {
            Self::Inserted(value) => Some(value),
            Self::Conflict => None,
        }
    }
}

pub trait ProjectRepository {
    fn insert_project(&self, project: &Project) -> Result<()>;
    fn get_project(&self, id: Uuid) -> Result<Option<Project>>;
    fn list_projects(&self) -> Result<Vec<Project>>;
    fn update_project(&self, project: &Project) -> Result<()>;
}

pub trait BuildRepository {
    /// Insert unless `(project_id, ci_build_id)` is already taken
    fn insert_build_or_conflict(&self, build: &Build) -> Result<InsertOutcome<Build>>;
    fn get_build(&self, id: Uuid) -> Result<Option<Build>>;
    fn find_build_by_ci_id(&self, project_id: Uuid, ci_build_id: &str) -> Result<Option<Build>>;
    /// Update-by-key fallback after a lost insert race
    fn mark_build_running_by_ci_id(&self, project_id: Uuid, ci_build_id: &str) -> Result<Option<Build>>;
    fn set_build_running(&self, id: Uuid, running: bool) -> Result<Option<Build>>;
    /// Atomically increment the project counter and store it as the build
    /// number, unless the build already has one. Returns the build as stored.
    fn claim_build_number(&self, id: Uuid) -> Result<Option<Build>>;
    /// Newest first
    fn list_builds(&self, project_id: Uuid) -> Result<Vec<Build>>;
    fn delete_build(&self, id: Uuid) -> Result<bool>;
}

pub trait TestVariationRepository {
    /// Insert unless the natural key is already taken
    fn insert_variation_or_conflict(&self, variation: &TestVariation) -> Result<InsertOutcome<TestVariation>>;
    fn get_variation(&self, id: Uuid) -> Result<Option<TestVariation>>;
    fn find_variation(
        &self,
        project_id: Uuid,
        identity: &TestIdentity,
        branch_name: &str,
    ) -> Result<Option<TestVariation>>;
    /// Persist mutable fields and bump `updated_at`
    fn update_variation(&self, variation: &TestVariation) -> Result<TestVariation>;
    fn list_variations(&self, project_id: Uuid, branch_name: Option<&str>) -> Result<Vec<TestVariation>>;
    /// Non-main-branch variations untouched since `before`
    fn list_stale_variations(
        &self,
        project_id: Uuid,
        main_branch_name: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<TestVariation>>;
    fn delete_variation(&self, id: Uuid) -> Result<bool>;
}

pub trait BaselineRepository {
    /// Append to the history and make it the variation's current baseline in one step
    fn add_baseline(&self, baseline: &Baseline) -> Result<TestVariation>;
    /// Newest first
    fn list_baselines(&self, test_variation_id: Uuid) -> Result<Vec<Baseline>>;
    /// Remove the whole history, returning what was removed
    fn delete_baselines(&self, test_variation_id: Uuid) -> Result<Vec<Baseline>>;
}

pub trait TestRunRepository {
    fn insert_test_run(&self, run: &TestRun) -> Result<()>;
    /// Delete the pending runs for the same build, identity and branch and
    /// insert `run`, in one step. Returns the deleted rows.
    fn insert_test_run_superseding(&self, run: &TestRun) -> Result<Vec<TestRun>>;
    fn get_test_run(&self, id: Uuid) -> Result<Option<TestRun>>;
    /// Persist mutable fields and bump `updated_at`
    fn update_test_run(&self, run: &TestRun) -> Result<TestRun>;
    fn delete_test_run(&self, id: Uuid) -> Result<bool>;
    /// Runs for the same build, identity and branch that are not approved
    fn find_pending_test_runs(
        &self,
        build_id: Uuid,
        identity: &TestIdentity,
        branch_name: &str,
    ) -> Result<Vec<TestRun>>;
    /// Approved runs in a project with the given environment identity and baseline image
    fn find_approved_test_runs(
        &self,
        project_id: Uuid,
        identity: &TestIdentity,
        baseline_name: &str,
    ) -> Result<Vec<TestRun>>;
    fn list_test_runs_by_build(&self, build_id: Uuid) -> Result<Vec<TestRun>>;
    fn list_test_runs_by_variation(&self, test_variation_id: Uuid) -> Result<Vec<TestRun>>;
}

/// Everything the core needs from persistence
pub trait Store:
    ProjectRepository
    + BuildRepository
    + TestVariationRepository
    + BaselineRepository
    + TestRunRepository
    + Send
    + Sync
{
}

impl<T> Store for T where
    T: ProjectRepository
        + BuildRepository
        + TestVariationRepository
        + BaselineRepository
        + TestRunRepository
        + Send
        + Sync
{
}
