//! Storage layer for persistent data (settings only)

use crate::error::DownloadError;
use batchdl_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const SETTINGS_FILE: &str = "settings.json";

/// Storage manager for batchdl data
#[derive(Clone, Debug)]
pub struct Storage {
    /// Data directory
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance
    pub async fn new(data_dir: PathBuf) -> Result<Self, DownloadError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    /// Load settings, falling back to defaults if the file is missing or
    /// unreadable
    pub async fn load_settings(&self) -> Settings {
        let path = self.settings_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {:?}, using defaults", path);
                return Settings::default();
            }
            Err(e) => {
                warn!("Failed to read {:?}: {} - using defaults", path, e);
                return Settings::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Invalid settings in {:?}: {} - using defaults", path, e);
                Settings::default()
            }
        }
    }

    /// Save settings to storage
    pub async fn save_settings(&self, settings: &Settings) -> Result<(), DownloadError> {
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| DownloadError::Serialization(e.to_string()))?;
        fs::write(self.settings_path(), content).await?;
        Ok(())
    }

    /// Delete saved settings so the next load yields defaults
    pub async fn reset_settings(&self) -> Result<(), DownloadError> {
        match fs::remove_file(self.settings_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
