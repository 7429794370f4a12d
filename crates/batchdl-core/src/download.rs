//! Download - the aggregate state machine for one submitted batch
//!
//! Key principles:
//! - A download owns one [`PartSlot`] per job; all byte counters live there
//! - One cancellation token per run, fanned out to parts and chunks
//! - Resume state is whatever is on disk, never an in-memory offset
//! - Terminal states release the queue slot and leave the registry
//!
//! ```text
//! queued -> downloading <-> paused -> completed | failed | cancelled
//! ```

use crate::engine::chunked;
use crate::engine::http;
use crate::engine::part::{PartRunner, PartSlot};
use crate::engine::progress::{ProgressReporter, ProgressSource};
use crate::engine::EngineContext;
use crate::error::DownloadError;
use crate::queue::QueueOutcome;
use batchdl_types::{
    CoreEvent, DownloadSnapshot, DownloadStatus, Job, PartStatus, ProgressSnapshot, Settings,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct DownloadState {
    status: DownloadStatus,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    error: Option<String>,
}

pub struct Download {
    id: Uuid,
    jobs: Vec<Job>,
    parts: Vec<Arc<PartSlot>>,
    created_at: DateTime<Utc>,
    ctx: EngineContext,
    state: Mutex<DownloadState>,
    // Serializes pause/resume/cancel/restart
    control: tokio::sync::Mutex<()>,
    queue_position: AtomicU32,
}

impl Download {
    pub fn new(jobs: Vec<Job>, ctx: EngineContext) -> Arc<Self> {
        let parts = jobs
            .iter()
            .enumerate()
            .map(|(index, job)| Arc::new(PartSlot::new(index as u32, job.clone())))
            .collect();

        Arc::new(Self {
            id: Uuid::new_v4(),
            jobs,
            parts,
            created_at: Utc::now(),
            ctx,
            state: Mutex::new(DownloadState {
                status: DownloadStatus::Queued,
                cancel: CancellationToken::new(),
                task: None,
                error: None,
            }),
            control: tokio::sync::Mutex::new(()),
            queue_position: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn status(&self) -> DownloadStatus {
        self.state.lock().status
    }

    fn is_multi_part(&self) -> bool {
        self.parts.len() > 1
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Join the admission queue and run once this download reaches the slot
    pub fn start(self: &Arc<Self>) -> Result<(), DownloadError> {
        let mut ticket = self.ctx.queue.enqueue(self.id, Arc::clone(self))?;
        let position = ticket.initial_position();
        self.queue_position.store(position, Ordering::Release);
        self.ctx.emit(CoreEvent::Queued {
            id: self.id,
            position,
        });
        info!("Download {} queued at position {}", self.id, position);

        let id = self.id;
        ticket.cancel_handler(move || debug!("Download {} left the queue before starting", id));

        // Hold the state lock so the handle is stored before the task can
        // observe its own status change
        let mut state = self.state.lock();
        let this = Arc::clone(self);
        state.task = Some(tokio::spawn(async move {
            let outcome = ticket.wait(|position| this.on_queue_position(position)).await;
            match outcome {
                QueueOutcome::Fulfilled => this.begin().await,
                QueueOutcome::Cancelled => debug!("Download {} will not start", this.id),
            }
        }));
        Ok(())
    }

    fn on_queue_position(&self, position: u32) {
        let previous = self.queue_position.swap(position, Ordering::AcqRel);
        if previous != position {
            debug!("Download {} moved to queue position {}", self.id, position);
            self.ctx.emit(CoreEvent::QueuePositionChanged {
                id: self.id,
                position,
            });
        }
    }

    async fn begin(self: Arc<Self>) {
        let cancel = {
            let mut state = self.state.lock();
            if state.status != DownloadStatus::Queued {
                return;
            }
            state.status = DownloadStatus::Downloading;
            state.cancel.clone()
        };

        info!("Download {} started ({} jobs)", self.id, self.jobs.len());
        self.ctx.emit(CoreEvent::Started { id: self.id });
        self.run(cancel).await;
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let settings = self.ctx.settings();
        let sampler = ProgressReporter::spawn(
            Duration::from_millis(settings.progress_interval_ms),
            Arc::clone(&self) as Arc<dyn ProgressSource>,
            self.ctx.events.clone(),
        );

        let result = if self.is_multi_part() {
            self.run_parts(&settings, &cancel).await
        } else {
            self.run_single(&settings, &cancel).await
        };
        sampler.stop();

        match result {
            Ok(()) => self.complete(),
            Err(e) if cancel.is_cancelled() => {
                debug!("Download {} stopped: {}", self.id, e);
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn run_single(&self, settings: &Settings, cancel: &CancellationToken) -> Result<(), DownloadError> {
        let Some(slot) = self.parts.first() else {
            return Ok(());
        };
        PartRunner::new(self.ctx.client.clone(), settings.clone(), Arc::clone(slot))
            .run(&cancel.child_token())
            .await
    }

    /// Run parts with bounded concurrency.
    ///
    /// Admission is FIFO. The head part is planned before admission so its
    /// weight is known: standard parts cost 1, chunked parts cost the whole
    /// budget.
    async fn run_parts(&self, settings: &Settings, cancel: &CancellationToken) -> Result<(), DownloadError> {
        let budget = settings.chunk_count.max(1);
        let parts_token = cancel.child_token();
        let mut pending: VecDeque<Arc<PartSlot>> = self
            .parts
            .iter()
            .filter(|part| part.status() != PartStatus::Completed)
            .cloned()
            .collect();

        let mut in_use = 0u32;
        let mut running: JoinSet<(u32, u32, Result<(), DownloadError>)> = JoinSet::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(settings.part_poll_interval_ms.max(1)));
        let mut failure: Option<DownloadError> = None;

        loop {
            // Admit as many head parts as the budget allows
            while failure.is_none() && !parts_token.is_cancelled() {
                let Some(head) = pending.front().cloned() else {
                    break;
                };
                let runner = PartRunner::new(self.ctx.client.clone(), settings.clone(), head);
                let plan = tokio::select! {
                    _ = parts_token.cancelled() => break,
                    plan = runner.resolve_plan() => plan,
                };
                let weight = plan.weight(budget);
                if in_use + weight > budget {
                    break;
                }

                pending.pop_front();
                in_use += weight;
                let index = runner.slot().index;
                let token = parts_token.child_token();
                debug!(
                    "Download {}: admitting part {} (weight {}, {}/{} in use)",
                    self.id, index, weight, in_use, budget
                );
                running.spawn(async move { (index, weight, runner.run(&token).await) });
            }

            if running.is_empty() && (pending.is_empty() || failure.is_some() || parts_token.is_cancelled()) {
                break;
            }

            tokio::select! {
                joined = running.join_next(), if !running.is_empty() => match joined {
                    Some(Ok((index, weight, result))) => {
                        in_use = in_use.saturating_sub(weight);
                        match result {
                            Ok(()) => info!("Download {}: part {} complete", self.id, index),
                            Err(DownloadError::Cancelled) => debug!("Download {}: part {} stopped", self.id, index),
                            Err(e) => {
                                if failure.is_none() {
                                    error!("Download {}: part {} failed: {}", self.id, index, e);
                                    failure = Some(DownloadError::PartFailed {
                                        index,
                                        source: Box::new(e),
                                    });
                                    parts_token.cancel();
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("Download {}: part task panicked: {}", self.id, e);
                        if failure.is_none() {
                            failure = Some(DownloadError::Unknown(format!("Part task panicked: {}", e)));
                            parts_token.cancel();
                        }
                    }
                    None => {}
                },
                _ = ticker.tick() => {}
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        Ok(())
    }

    fn complete(&self) {
        {
            let mut state = self.state.lock();
            if !matches!(state.status, DownloadStatus::Downloading | DownloadStatus::Paused) {
                return;
            }
            state.status = DownloadStatus::Completed;
        }

        info!("Download {} completed", self.id);
        self.ctx.emit(CoreEvent::Progress(self.snapshot_progress(0)));
        self.ctx.emit(CoreEvent::Completed { id: self.id });
        self.notify("Download complete", self.describe());
        self.release();
    }

    async fn fail(&self, error: DownloadError) {
        let reason = error.to_string();
        {
            let mut state = self.state.lock();
            if state.status != DownloadStatus::Downloading {
                return;
            }
            state.status = DownloadStatus::Failed;
            state.error = Some(reason.clone());
        }

        error!("Download {} failed: {}", self.id, reason);
        self.remove_artifacts().await;
        self.ctx.emit(CoreEvent::Error {
            id: self.id,
            reason: reason.clone(),
        });
        self.notify("Download failed", format!("{}: {}", self.describe(), reason));
        self.release();
    }

    fn release(&self) {
        self.ctx.queue.finish(&self.id);
        self.ctx.registry.remove(&self.id);
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Stop every stream and keep partial files. Only valid while downloading.
    pub async fn pause(&self) {
        let _control = self.control.lock().await;
        let task = {
            let mut state = self.state.lock();
            if state.status != DownloadStatus::Downloading {
                debug!("Pause ignored for download {} ({:?})", self.id, state.status);
                return;
            }
            state.status = DownloadStatus::Paused;
            state.cancel.cancel();
            state.task.take()
        };

        // Every file handle is flushed and closed once the task is gone
        if let Some(task) = task {
            let _ = task.await;
        }

        if self.status() == DownloadStatus::Paused {
            info!("Download {} paused at {} bytes", self.id, self.downloaded());
            self.ctx.emit(CoreEvent::Paused { id: self.id });
            self.notify("Download paused", self.describe());
        }
    }

    /// Continue a paused download from what is on disk
    pub async fn resume(self: &Arc<Self>) {
        let _control = self.control.lock().await;
        let mut state = self.state.lock();
        if state.status != DownloadStatus::Paused {
            debug!("Resume ignored for download {} ({:?})", self.id, state.status);
            return;
        }

        let cancel = CancellationToken::new();
        state.status = DownloadStatus::Downloading;
        state.cancel = cancel.clone();
        info!("Download {} resumed", self.id);
        self.ctx.emit(CoreEvent::Resumed { id: self.id });

        let this = Arc::clone(self);
        state.task = Some(tokio::spawn(async move { this.run(cancel).await }));
    }

    /// Abort and delete everything. Idempotent; valid from any live state.
    pub async fn cancel(&self) {
        let _control = self.control.lock().await;
        let task = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return;
            }
            state.status = DownloadStatus::Cancelled;
            state.cancel.cancel();
            state.task.take()
        };

        // Resolves a still-waiting ticket
        self.ctx.queue.remove(&self.id);
        if let Some(task) = task {
            let _ = task.await;
        }

        self.remove_artifacts().await;
        info!("Download {} cancelled", self.id);
        self.ctx.emit(CoreEvent::Cancelled { id: self.id });
        self.notify("Download cancelled", self.describe());
        self.release();
    }

    /// Abort in-flight work and start over with the current settings.
    ///
    /// Side-files laid out for the old chunk count are deleted and cached
    /// plans of unfinished parts dropped; completed parts are kept.
    pub async fn restart(self: &Arc<Self>) {
        let _control = self.control.lock().await;
        let task = {
            let mut state = self.state.lock();
            if state.status != DownloadStatus::Downloading {
                return;
            }
            state.cancel.cancel();
            state.task.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }

        if self.status() != DownloadStatus::Downloading {
            return;
        }

        info!("Download {} restarting with new settings", self.id);
        for part in &self.parts {
            if part.status() == PartStatus::Completed {
                continue;
            }
            if part.plan().is_some_and(|plan| plan.is_chunked()) {
                if let Err(e) = chunked::remove_side_files(&part.job.destination).await {
                    warn!("Failed to remove side-files of part {}: {}", part.index, e);
                }
                part.progress.reset();
            }
            part.set_plan(None);
        }

        let mut state = self.state.lock();
        if state.status != DownloadStatus::Downloading {
            return;
        }
        let cancel = CancellationToken::new();
        state.cancel = cancel.clone();
        let this = Arc::clone(self);
        state.task = Some(tokio::spawn(async move { this.run(cancel).await }));
    }

    /// Delete destinations and side-files of every part
    async fn remove_artifacts(&self) {
        for part in &self.parts {
            let destination = &part.job.destination;
            if let Err(e) = chunked::remove_side_files(destination).await {
                warn!("Failed to remove side-files of {:?}: {}", destination, e);
            }
            if let Err(e) = http::remove_if_exists(destination).await {
                warn!("Failed to remove {:?}: {}", destination, e);
            }
            part.progress.reset();
        }
    }

    // ========================================================================
    // Read models
    // ========================================================================

    pub fn snapshot(&self) -> DownloadSnapshot {
        let (status, error) = {
            let state = self.state.lock();
            (state.status, state.error.clone())
        };
        let first = self.parts.first();

        DownloadSnapshot {
            id: self.id,
            status,
            jobs: self.jobs.clone(),
            parts: if self.is_multi_part() {
                self.parts.iter().map(|part| part.snapshot()).collect()
            } else {
                Vec::new()
            },
            current_bytes: self.downloaded(),
            total_size: first.filter(|_| !self.is_multi_part()).and_then(|part| part.progress.total()),
            start_byte: first
                .filter(|_| !self.is_multi_part())
                .map(|part| part.progress.start_byte())
                .unwrap_or(0),
            total_bytes: self.total_bytes(),
            queue_position: self.queue_position.load(Ordering::Acquire),
            error,
            created_at: self.created_at,
        }
    }

    /// Sum of all part sizes, once every one is known
    fn total_bytes(&self) -> Option<u64> {
        self.parts.iter().map(|part| part.progress.total()).sum()
    }

    fn snapshot_progress(&self, speed: u64) -> ProgressSnapshot {
        let downloaded = self.downloaded();
        let total = self.total_bytes();
        let completed_parts = self
            .parts
            .iter()
            .filter(|part| part.status() == PartStatus::Completed)
            .count();

        let progress = if self.status() == DownloadStatus::Completed {
            1.0
        } else {
            match total {
                Some(total) if total > 0 => (downloaded as f64 / total as f64).min(1.0),
                _ if self.is_multi_part() => completed_parts as f64 / self.parts.len() as f64,
                _ => 0.0,
            }
        };

        let (current_part_index, total_parts) = if self.is_multi_part() {
            let current = self
                .parts
                .iter()
                .find(|part| part.status() == PartStatus::Downloading)
                .map(|part| part.index);
            (current, Some(self.parts.len() as u32))
        } else {
            (None, None)
        };

        ProgressSnapshot {
            id: self.id,
            progress,
            download_speed: speed,
            file_size: total.unwrap_or(0),
            downloaded,
            current_part_index,
            total_parts,
            queue_position: self.queue_position.load(Ordering::Acquire),
        }
    }

    fn describe(&self) -> String {
        match self.jobs.as_slice() {
            [job] => job
                .destination
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| job.url.clone()),
            jobs => format!("{} files", jobs.len()),
        }
    }

    fn notify(&self, title: &str, message: String) {
        self.ctx.emit(CoreEvent::Notification {
            id: self.id,
            title: title.to_string(),
            message,
        });
    }
}

impl ProgressSource for Download {
    fn downloaded(&self) -> u64 {
        self.parts.iter().map(|part| part.progress.downloaded()).sum()
    }

    fn snapshot(&self, speed: u64) -> ProgressSnapshot {
        self.snapshot_progress(speed)
    }
}
