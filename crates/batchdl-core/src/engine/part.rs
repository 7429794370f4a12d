//! Part - one job of a download, with its own strategy and retries

use crate::engine::chunked::{self, ChunkedTransfer};
use crate::engine::http;
use crate::engine::probe::{probe, ProbeResult};
use crate::engine::progress::FileProgress;
use crate::engine::retry::RetryPolicy;
use crate::engine::stream::StreamTransfer;
use crate::error::DownloadError;
use batchdl_types::{Job, PartState, PartStatus, Settings};
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How a job's bytes get fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPlan {
    Standard,
    Chunked { size: u64, chunk_count: u32 },
}

impl TransferPlan {
    /// Units of the part concurrency budget this plan occupies
    pub fn weight(&self, budget: u32) -> u32 {
        match self {
            TransferPlan::Standard => 1,
            TransferPlan::Chunked { .. } => budget.max(1),
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, TransferPlan::Chunked { .. })
    }
}

/// Pick a strategy from what the probe learned
pub fn plan_transfer(job: &Job, probe: &ProbeResult, settings: &Settings) -> TransferPlan {
    if job.forces_single_stream() || settings.chunk_count <= 1 || !probe.accepts_ranges {
        return TransferPlan::Standard;
    }
    match probe.size {
        Some(size) if size > settings.parallel_threshold_bytes => TransferPlan::Chunked {
            size,
            chunk_count: u64::from(settings.chunk_count).min(size) as u32,
        },
        _ => TransferPlan::Standard,
    }
}

/// Shared state of one part; outlives the runs that drive it
#[derive(Debug)]
pub struct PartSlot {
    pub index: u32,
    pub job: Arc<Job>,
    pub progress: Arc<FileProgress>,
    status: Mutex<PartStatus>,
    plan: Mutex<Option<TransferPlan>>,
    suspicious_retries: AtomicU32,
}

impl PartSlot {
    pub fn new(index: u32, job: Job) -> Self {
        Self {
            index,
            job: Arc::new(job),
            progress: Arc::new(FileProgress::new()),
            status: Mutex::new(PartStatus::Pending),
            plan: Mutex::new(None),
            suspicious_retries: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> PartStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: PartStatus) {
        *self.status.lock() = status;
    }

    pub fn plan(&self) -> Option<TransferPlan> {
        *self.plan.lock()
    }

    pub fn set_plan(&self, plan: Option<TransferPlan>) {
        *self.plan.lock() = plan;
    }

    pub fn snapshot(&self) -> PartState {
        PartState {
            index: self.index,
            job: (*self.job).clone(),
            status: self.status(),
            bytes_downloaded: self.progress.downloaded(),
            total_bytes: self.progress.total(),
            chunks: self.progress.chunk_states(),
            uses_chunking: self.plan().is_some_and(|plan| plan.is_chunked()),
        }
    }
}

/// Drives one [`PartSlot`] to completion
pub struct PartRunner {
    client: Client,
    settings: Settings,
    slot: Arc<PartSlot>,
}

impl PartRunner {
    pub fn new(client: Client, settings: Settings, slot: Arc<PartSlot>) -> Self {
        Self {
            client,
            settings,
            slot,
        }
    }

    pub fn slot(&self) -> &Arc<PartSlot> {
        &self.slot
    }

    /// The part's plan, probing the server the first time
    pub async fn resolve_plan(&self) -> TransferPlan {
        if let Some(plan) = self.slot.plan() {
            return plan;
        }

        let job = &self.slot.job;
        let plan = if job.forces_single_stream() || self.settings.chunk_count <= 1 {
            TransferPlan::Standard
        } else {
            let timeout = Duration::from_secs(self.settings.probe_timeout_secs.max(1));
            let probed = probe(&self.client, job, timeout).await;
            if probed.size.is_some() {
                self.slot.progress.set_total(probed.size);
            }
            plan_transfer(job, &probed, &self.settings)
        };

        info!("Part {} of {} planned as {:?}", self.slot.index, job.url, plan);
        self.slot.set_plan(Some(plan));
        plan
    }

    /// Download the part. Completed parts return immediately.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), DownloadError> {
        if self.slot.status() == PartStatus::Completed {
            return Ok(());
        }

        self.slot.set_status(PartStatus::Downloading);
        let result = self.transfer(cancel).await;
        self.slot.set_status(match &result {
            Ok(()) => PartStatus::Completed,
            Err(DownloadError::Cancelled) => PartStatus::Pending,
            Err(_) => PartStatus::Failed,
        });
        result
    }

    async fn transfer(&self, cancel: &CancellationToken) -> Result<(), DownloadError> {
        let destination = &self.slot.job.destination;
        loop {
            let plan = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                plan = self.resolve_plan() => plan,
            };
            match plan {
                TransferPlan::Chunked { size, chunk_count } => {
                    match self.run_chunked(size, chunk_count, cancel).await {
                        Ok(()) => {}
                        Err(e) if e.triggers_fallback() => {
                            warn!(
                                "Part {}: {} - falling back to a single stream",
                                self.slot.index, e
                            );
                            chunked::remove_side_files(destination).await?;
                            self.slot.progress.clear_chunks();
                            self.slot.set_plan(Some(TransferPlan::Standard));
                            self.run_standard(cancel).await?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                TransferPlan::Standard => self.run_standard(cancel).await?,
            }

            let size = http::file_len(destination).await?;
            let used = self.slot.suspicious_retries.load(Ordering::Acquire);
            if !self.settings.suspicious_size.should_retry(size, used) {
                return Ok(());
            }

            warn!(
                "Part {}: {} finished with only {} bytes, downloading again",
                self.slot.index, self.slot.job.url, size
            );
            self.slot.suspicious_retries.fetch_add(1, Ordering::AcqRel);
            http::remove_if_exists(destination).await?;
            self.slot.progress.reset();
            self.slot.set_plan(None);
        }
    }

    async fn run_standard(&self, cancel: &CancellationToken) -> Result<(), DownloadError> {
        StreamTransfer::new(
            self.client.clone(),
            Arc::clone(&self.slot.job),
            RetryPolicy::from_settings(&self.settings),
            Arc::clone(&self.slot.progress),
        )
        .run(cancel)
        .await
    }

    /// Repeat chunked attempts until success, fallback, or retries run out.
    /// Chunks resume from their side-files on every attempt.
    async fn run_chunked(&self, size: u64, chunk_count: u32, cancel: &CancellationToken) -> Result<(), DownloadError> {
        let transfer = ChunkedTransfer::new(
            self.client.clone(),
            Arc::clone(&self.slot.job),
            size,
            chunk_count,
            Arc::clone(&self.slot.progress),
        );
        let retry = RetryPolicy::from_settings(&self.settings);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match transfer.run(cancel).await {
                Ok(()) => return Ok(()),
                Err(e) if e.triggers_fallback() => return Err(e),
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(e) if retry.should_retry(attempt, &e) => {
                    warn!(
                        "Part {}: chunked attempt {}/{} failed: {}. Will retry.",
                        self.slot.index, attempt, retry.max_attempts, e
                    );
                    retry.backoff(attempt, cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
