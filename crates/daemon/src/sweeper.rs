//! Periodic cleanup
//!
//! Deletes feature-branch variations that outlived their project's branch
//! lifetime, then garbage-collects image files no row references.

use crate::config::SweepConfig;
use crate::state::AppState;
use crate::variations::VariationService;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};
use vrt_common::storage::GcStats;
use vrt_common::store::*;
use vrt_common::{now_millis, FsImageStore, Result};

/// Outcome of one sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub variations_removed: usize,
    pub gc: Option<GcStats>,
}

pub struct Sweeper {
    state: AppState,
    images: Arc<FsImageStore>,
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(state: AppState, images: Arc<FsImageStore>, config: SweepConfig) -> Self {
        Self { state, images, config }
    }

    /// Sweep forever at the configured interval
    pub async fn run(&self) {
        info!("Sweeper started, interval {:?}", self.config.interval());

        loop {
            if let Err(e) = self.sweep_once().await {
                error!("Sweep error: {}", e);
            }

            tokio::time::sleep(self.config.interval()).await;
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let variations_removed = VariationService::new(self.state.clone())
            .sweep_stale_variations(now_millis())
            .await?;

        let gc = if self.config.image_gc {
            let referenced = self.referenced_images()?;
            let stats = self
                .images
                .gc(&referenced, self.config.image_gc_min_age())
                .await?;
            debug!(
                "Image GC: {} of {} images removed, {} bytes freed",
                stats.deleted_images, stats.total_images, stats.deleted_bytes
            );
            Some(stats)
        } else {
            None
        };

        Ok(SweepReport { variations_removed, gc })
    }

    /// Every image name a run, variation or baseline row points at
    pub fn referenced_images(&self) -> Result<HashSet<String>> {
        let store = self.state.store();
        let mut names = HashSet::new();

        for project in store.list_projects()? {
            for build in store.list_builds(project.id)? {
                for run in store.list_test_runs_by_build(build.id)? {
                    names.insert(run.image_name);
                    names.extend(run.baseline_name);
                    names.extend(run.diff_name);
                }
            }

            for variation in store.list_variations(project.id, None)? {
                for baseline in store.list_baselines(variation.id)? {
                    names.insert(baseline.baseline_name);
                }
                names.extend(variation.baseline_name);
            }
        }

        Ok(names)
    }
}
