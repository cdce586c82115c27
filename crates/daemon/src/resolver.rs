//! Branch-aware baseline lookup
//!
//! A branch that never approved anything of its own compares against the
//! main branch. Once both exist, whichever variation changed last wins: a
//! feature branch keeps its own baseline until main moves past it.

use std::cmp::Ordering;
use tracing::debug;
use vrt_common::store::*;
use vrt_common::{Project, Result, TestIdentity, TestVariation};

pub struct BaselineResolver<'a> {
    store: &'a dyn Store,
}

impl<'a> BaselineResolver<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Variation whose baseline applies to `identity` on `branch`, if any
    pub fn resolve(
        &self,
        project: &Project,
        identity: &TestIdentity,
        branch_name: &str,
    ) -> Result<Option<TestVariation>> {
        let on_branch = self.store.find_variation(project.id, identity, branch_name)?;

        let on_main = if branch_name == project.main_branch_name {
            None
        } else {
            self.store
                .find_variation(project.id, identity, &project.main_branch_name)?
        };

        let resolved = pick(on_branch, on_main);
        if let Some(variation) = &resolved {
            debug!(
                "Resolved {} on {} to variation {} of branch {}",
                identity, branch_name, variation.id, variation.branch_name
            );
        }
        Ok(resolved)
    }
}

/// Newer `updated_at` wins; ties favour the branch variation
pub fn pick(on_branch: Option<TestVariation>, on_main: Option<TestVariation>) -> Option<TestVariation> {
    match (on_branch, on_main) {
        (Some(branch), Some(main)) => match main.updated_at.cmp(&branch.updated_at) {
            Ordering::Greater => Some(main),
            Ordering::Less | Ordering::Equal => Some(branch),
        },
        (Some(branch), None) => Some(branch),
        (None, main) => main,
    }
}
