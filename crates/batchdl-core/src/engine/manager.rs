//! Download Manager - owns every live download
//!
//! This is the top-level coordinator that:
//! - Validates and submits batches
//! - Routes pause/resume/cancel to the right download
//! - Shares the HTTP client, settings and admission queue

use crate::download::Download;
use crate::engine::probe::{probe, ProbeResult};
use crate::error::DownloadError;
use crate::queue::AdmissionQueue;
use batchdl_types::{CoreEvent, DownloadSnapshot, DownloadStatus, Job, Settings};
use parking_lot::RwLock;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// Live downloads by id. Terminal downloads remove themselves.
#[derive(Clone, Default)]
pub struct DownloadRegistry {
    inner: Arc<RwLock<HashMap<Uuid, Arc<Download>>>>,
}

impl DownloadRegistry {
    pub fn insert(&self, download: Arc<Download>) {
        self.inner.write().insert(download.id(), download);
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Download>> {
        self.inner.read().get(id).cloned()
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<Download>> {
        self.inner.write().remove(id)
    }

    pub fn all(&self) -> Vec<Arc<Download>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a download needs from its environment
#[derive(Clone)]
pub struct EngineContext {
    pub client: Client,
    pub settings: Arc<RwLock<Settings>>,
    pub events: broadcast::Sender<CoreEvent>,
    pub queue: Arc<AdmissionQueue<Arc<Download>>>,
    pub registry: DownloadRegistry,
}

impl EngineContext {
    pub fn emit(&self, event: CoreEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }
}

/// Download manager that coordinates all downloads
pub struct DownloadManager {
    ctx: EngineContext,
}

impl DownloadManager {
    /// Create a new download manager
    pub fn new(settings: Settings, events: broadcast::Sender<CoreEvent>) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            ctx: EngineContext {
                client,
                settings: Arc::new(RwLock::new(settings)),
                events,
                queue: Arc::new(AdmissionQueue::new()),
                registry: DownloadRegistry::default(),
            },
        })
    }

    /// Submit a batch. It is queued behind whatever is already processing.
    pub fn submit(&self, jobs: Vec<Job>) -> Result<Uuid, DownloadError> {
        if jobs.is_empty() {
            return Err(DownloadError::InvalidOperation("batch has no jobs".to_string()));
        }
        for job in &jobs {
            validate_url(&job.url)?;
            if job.destination.as_os_str().is_empty() {
                return Err(DownloadError::InvalidOperation(format!(
                    "no destination for {}",
                    job.url
                )));
            }
        }

        let download = Download::new(jobs, self.ctx.clone());
        let id = download.id();
        self.ctx.registry.insert(Arc::clone(&download));
        if let Err(e) = download.start() {
            self.ctx.registry.remove(&id);
            return Err(e);
        }

        info!("Submitted download {} ({} jobs)", id, download.jobs().len());
        Ok(id)
    }

    pub async fn pause(&self, id: Uuid) {
        match self.ctx.registry.get(&id) {
            Some(download) => download.pause().await,
            None => debug!("Pause ignored for unknown download {}", id),
        }
    }

    pub async fn resume(&self, id: Uuid) {
        match self.ctx.registry.get(&id) {
            Some(download) => download.resume().await,
            None => debug!("Resume ignored for unknown download {}", id),
        }
    }

    pub async fn cancel(&self, id: Uuid) {
        match self.ctx.registry.get(&id) {
            Some(download) => download.cancel().await,
            None => debug!("Cancel ignored for unknown download {}", id),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<DownloadSnapshot> {
        self.ctx.registry.get(&id).map(|download| download.snapshot())
    }

    /// Live downloads, oldest first
    pub fn list(&self) -> Vec<DownloadSnapshot> {
        let mut snapshots: Vec<_> = self
            .ctx
            .registry
            .all()
            .iter()
            .map(|download| download.snapshot())
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.created_at);
        snapshots
    }

    pub fn settings(&self) -> Settings {
        self.ctx.settings()
    }

    /// Change the chunk count; the processing download restarts with the
    /// new layout
    pub async fn set_chunk_count(&self, chunk_count: u32) {
        let chunk_count = chunk_count.max(1);
        let changed = {
            let mut settings = self.ctx.settings.write();
            let changed = settings.chunk_count != chunk_count;
            settings.chunk_count = chunk_count;
            changed
        };
        if changed {
            info!("Chunk count set to {}", chunk_count);
            self.restart_processing().await;
        }
    }

    pub async fn update_settings(&self, settings: Settings) {
        let chunk_count_changed = {
            let mut current = self.ctx.settings.write();
            let changed = current.chunk_count != settings.chunk_count;
            *current = settings;
            changed
        };
        if chunk_count_changed {
            self.restart_processing().await;
        }
    }

    /// Probe a URL without downloading it
    pub async fn probe(&self, url: &str) -> Result<ProbeResult, DownloadError> {
        validate_url(url)?;
        let timeout = Duration::from_secs(self.ctx.settings.read().probe_timeout_secs.max(1));
        Ok(probe(&self.ctx.client, &Job::new(url, ""), timeout).await)
    }

    async fn restart_processing(&self) {
        let Some(download) = self.ctx.queue.processing_item() else {
            return;
        };
        if download.status() == DownloadStatus::Downloading {
            download.restart().await;
        }
    }
}

fn validate_url(raw: &str) -> Result<(), DownloadError> {
    let parsed = url::Url::parse(raw).map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", raw, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(DownloadError::InvalidUrl(format!(
            "{}: unsupported scheme {}",
            raw, scheme
        ))),
    }
}
