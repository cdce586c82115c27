//! VRT Common Library
//!
//! Data model, persistence, image storage and change notifications shared by
//! the comparison engine and the daemon.

pub mod db;
pub mod error;
pub mod events;
pub mod storage;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, Result};
pub use events::{BroadcastNotifier, Event, LogNotifier, Notifier};
pub use storage::{FsImageStore, ImageKind, ImageStore};
pub use store::*;
pub use types::*;

/// VRT version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".vrt")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
