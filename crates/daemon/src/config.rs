//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Background cleanup
    pub sweep: SweepConfig,

    /// Change notifications
    pub events: EventsConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: vrt_common::default_store_path(),
            sweep: SweepConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

/// Stale-variation sweep and image garbage collection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Seconds between sweeps
    pub interval_secs: u64,

    /// Delete image files no row references
    pub image_gc: bool,

    /// Unreferenced images younger than this are kept
    pub image_gc_min_age_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 24 * 60 * 60,
            image_gc: true,
            image_gc_min_age_secs: 60 * 60,
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn image_gc_min_age(&self) -> Duration {
        Duration::from_secs(self.image_gc_min_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast buffer per subscriber
    pub capacity: usize,

    /// Log events instead of broadcasting them
    pub log_only: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            log_only: false,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Get the image store path
    pub fn images_path(&self) -> PathBuf {
        self.store_path.join("store")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = DaemonConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.sweep.interval_secs, 86400);
        assert!(config.sweep.image_gc);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let mut config = DaemonConfig {
            store_path: tmp.path().join("store"),
            ..Default::default()
        };
        config.sweep.interval_secs = 60;
        config.events.log_only = true;
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.store_path, tmp.path().join("store"));
        assert_eq!(loaded.sweep.interval(), Duration::from_secs(60));
        assert!(loaded.events.log_only);
        assert_eq!(loaded.db_path(), tmp.path().join("store").join("state.db"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[sweep]\ninterval_secs = 5\n").unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.sweep.interval_secs, 5);
        assert_eq!(config.sweep.image_gc_min_age_secs, 3600);
        assert_eq!(config.events.capacity, 1024);
    }
}
