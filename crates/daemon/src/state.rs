//! Shared handles for the daemon services

use crate::config::DaemonConfig;
use std::sync::Arc;
use tracing::info;
use vrt_common::store::*;
use vrt_common::{
    BroadcastNotifier, Database, Error, FsImageStore, ImageStore, LogNotifier, Notifier, Project, Result, TestRun,
};
use vrt_compare::ImageComparator;

/// Persistence, image storage, notifications and the comparator.
///
/// Cheap to clone; every service holds one.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn Store>,
    images: Arc<dyn ImageStore>,
    notifier: Arc<dyn Notifier>,
    comparator: ImageComparator,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, images: Arc<dyn ImageStore>, notifier: Arc<dyn Notifier>) -> Self {
        let comparator = ImageComparator::new(images.clone());
        Self {
            store,
            images,
            notifier,
            comparator,
        }
    }

    /// Open the on-disk database and image store described by the config.
    ///
    /// Returns the concrete image store too, for garbage collection.
    pub async fn open(config: &DaemonConfig) -> Result<(Self, Arc<FsImageStore>, Option<BroadcastNotifier>)> {
        let db = Database::open(config.db_path())?;
        let images = Arc::new(FsImageStore::new(config.images_path()).await?);

        let (notifier, broadcast): (Arc<dyn Notifier>, _) = if config.events.log_only {
            (Arc::new(LogNotifier), None)
        } else {
            let broadcast = BroadcastNotifier::new(config.events.capacity);
            (Arc::new(broadcast.clone()), Some(broadcast))
        };

        info!("State opened at {:?}", config.store_path);

        Ok((Self::new(Arc::new(db), images.clone(), notifier), images, broadcast))
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn images(&self) -> &dyn ImageStore {
        self.images.as_ref()
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    pub fn comparator(&self) -> &ImageComparator {
        &self.comparator
    }

    pub fn project(&self, id: uuid::Uuid) -> Result<Project> {
        self.store
            .get_project(id)?
            .ok_or_else(|| Error::not_found("project", id))
    }

    pub fn test_run(&self, id: uuid::Uuid) -> Result<TestRun> {
        self.store
            .get_test_run(id)?
            .ok_or_else(|| Error::not_found("test run", id))
    }

    /// Project owning the build a run belongs to
    pub fn project_for_run(&self, run: &TestRun) -> Result<Project> {
        let build = self
            .store
            .get_build(run.build_id)?
            .ok_or_else(|| Error::not_found("build", run.build_id))?;
        self.project(build.project_id)
    }
}
