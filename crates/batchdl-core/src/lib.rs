//! batchdl Core - Download Engine
//!
//! This crate provides the core download functionality for batchdl.
//! It handles single and chunked transfers, multi-file batches,
//! pause/resume/cancel and a single-slot admission queue.

mod download;
pub mod engine;
mod error;
mod queue;
mod storage;

pub use download::*;
pub use engine::{DownloadManager, EngineContext, ProbeResult};
pub use error::*;
pub use queue::*;
pub use storage::*;

use batchdl_types::{CoreEvent, DownloadSnapshot, Job, Settings};
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of the event channel; slow subscribers see `Lagged`
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// The main batchdl core instance
pub struct BatchCore {
    /// Settings persistence
    storage: Storage,
    /// Download manager
    manager: DownloadManager,
    /// Event broadcaster
    event_tx: broadcast::Sender<CoreEvent>,
}

impl BatchCore {
    /// Create a new BatchCore instance with settings loaded from `data_dir`
    pub async fn new(data_dir: PathBuf) -> Result<Self, DownloadError> {
        let storage = Storage::new(data_dir).await?;
        let settings = storage.load_settings().await;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = DownloadManager::new(settings, event_tx.clone())?;

        Ok(Self {
            storage,
            manager,
            event_tx,
        })
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    // ========================================================================
    // Download Operations
    // ========================================================================

    /// Submit a batch of jobs as one download
    pub fn submit(&self, jobs: Vec<Job>) -> Result<Uuid, DownloadError> {
        self.manager.submit(jobs)
    }

    pub async fn pause(&self, id: Uuid) {
        self.manager.pause(id).await
    }

    pub async fn resume(&self, id: Uuid) {
        self.manager.resume(id).await
    }

    pub async fn cancel(&self, id: Uuid) {
        self.manager.cancel(id).await
    }

    pub fn get_download(&self, id: Uuid) -> Option<DownloadSnapshot> {
        self.manager.get(id)
    }

    pub fn list_downloads(&self) -> Vec<DownloadSnapshot> {
        self.manager.list()
    }

    /// Probe a URL for size and range support
    pub async fn probe(&self, url: &str) -> Result<ProbeResult, DownloadError> {
        self.manager.probe(url).await
    }

    // ========================================================================
    // Settings Operations
    // ========================================================================

    pub fn get_settings(&self) -> Settings {
        self.manager.settings()
    }

    /// Apply and persist new settings
    pub async fn update_settings(&self, settings: Settings) -> Result<(), DownloadError> {
        self.storage.save_settings(&settings).await?;
        self.manager.update_settings(settings).await;
        Ok(())
    }

    /// Forget saved settings and go back to the defaults
    pub async fn reset_settings(&self) -> Result<(), DownloadError> {
        self.storage.reset_settings().await?;
        self.manager.update_settings(Settings::default()).await;
        Ok(())
    }

    /// Change the chunk count for the running session, restarting the
    /// processing download
    pub async fn set_chunk_count(&self, chunk_count: u32) {
        self.manager.set_chunk_count(chunk_count).await
    }
}
