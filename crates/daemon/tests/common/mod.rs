//! Shared fixtures for daemon integration tests

#![allow(dead_code)]

use image::{Rgba, RgbaImage};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;
use uuid::Uuid;
use vrt_common::storage::encode_png;
use vrt_common::store::*;
use vrt_common::{BroadcastNotifier, Database, Event, FsImageStore, Project, TestIdentity};
use vrt_daemon::{AppState, BuildCounter, TestRunRequest};

pub const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
pub const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
pub const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

pub struct Harness {
    pub state: AppState,
    pub db: Arc<Database>,
    pub images: Arc<FsImageStore>,
    pub events: BroadcastNotifier,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open_memory().unwrap());
        let images = Arc::new(FsImageStore::new(dir.path()).await.unwrap());
        let events = BroadcastNotifier::new(1024);
        let state = AppState::new(db.clone(), images.clone(), Arc::new(events.clone()));
        Self {
            state,
            db,
            images,
            events,
            _dir: dir,
        }
    }

    pub fn project(&self, project: Project) -> Project {
        self.db.insert_project(&project).unwrap();
        project
    }

    pub async fn build(&self, project: &Project, branch: &str) -> Uuid {
        BuildCounter::new(self.state.clone())
            .find_or_create(project.id, branch, None)
            .await
            .unwrap()
            .id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn image_exists(&self, name: &str) -> bool {
        self.images.images_dir().join(name).exists()
    }
}

pub fn identity() -> TestIdentity {
    TestIdentity::new("home page").with_browser("firefox").with_viewport("1280x720")
}

pub fn solid(color: Rgba<u8>) -> Vec<u8> {
    encode_png(&RgbaImage::from_pixel(10, 10, color)).unwrap()
}

/// White image with a 2x2 black square in the top-left corner
pub fn white_with_corner() -> Vec<u8> {
    let mut image = RgbaImage::from_pixel(10, 10, WHITE);
    for y in 0..2 {
        for x in 0..2 {
            image.put_pixel(x, y, BLACK);
        }
    }
    encode_png(&image).unwrap()
}

pub fn request(project: &Project, build_id: Uuid, branch: &str, image: Vec<u8>) -> TestRunRequest {
    TestRunRequest::new(project.id, build_id, identity(), branch, image)
}

/// Drain every event published so far
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
