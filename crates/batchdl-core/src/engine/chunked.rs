//! Chunked transfer - one file split into byte ranges downloaded in parallel
//!
//! Every chunk writes its own side-file; once all of them are complete they
//! are concatenated in index order into the destination.

use crate::engine::chunk_worker::ChunkWorker;
use crate::engine::http;
use crate::engine::progress::{ChunkProgress, FileProgress};
use crate::error::DownloadError;
use batchdl_types::{chunk_path, ChunkState, Job};
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Split `[0, size)` into `count` contiguous ranges.
///
/// The count is clamped to `size` so no range is empty; the last range
/// absorbs the remainder.
pub fn plan_chunks(size: u64, count: u32) -> Vec<ChunkState> {
    if size == 0 {
        return Vec::new();
    }
    let count = u64::from(count.max(1)).min(size);
    let chunk_size = size / count;

    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = if i == count - 1 {
                size - 1
            } else {
                start + chunk_size - 1
            };
            ChunkState::new(i as u32, start, end)
        })
        .collect()
}

pub struct ChunkedTransfer {
    client: Client,
    job: Arc<Job>,
    size: u64,
    chunk_count: u32,
    progress: Arc<FileProgress>,
}

impl ChunkedTransfer {
    pub fn new(
        client: Client,
        job: Arc<Job>,
        size: u64,
        chunk_count: u32,
        progress: Arc<FileProgress>,
    ) -> Self {
        Self {
            client,
            job,
            size,
            chunk_count,
            progress,
        }
    }

    /// One chunked attempt: fan out, wait for every chunk, merge.
    ///
    /// A failing chunk cancels its siblings. Errors that mean the server
    /// won't cooperate with parallel ranges take priority, so the caller
    /// can fall back to a single stream.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), DownloadError> {
        let destination = &self.job.destination;
        http::ensure_parent_dir(destination).await?;
        self.progress.set_total(Some(self.size));

        if self.already_merged().await? {
            info!("{} already assembled", destination.display());
            self.progress.set_written(self.size);
            return Ok(());
        }

        let chunks: Vec<Arc<ChunkProgress>> = plan_chunks(self.size, self.chunk_count)
            .into_iter()
            .map(|c| Arc::new(ChunkProgress::new(c.index, c.start, c.end)))
            .collect();
        self.progress.set_chunks(chunks.clone());

        info!(
            "Downloading {} in {} chunks ({} bytes)",
            self.job.url,
            chunks.len(),
            self.size
        );

        let token = cancel.child_token();
        let mut join_set = JoinSet::new();
        for chunk in &chunks {
            let worker = ChunkWorker::new(self.client.clone(), Arc::clone(&self.job), Arc::clone(chunk));
            let index = chunk.index;
            let token = token.clone();
            join_set.spawn(async move { (index, worker.run(token).await) });
        }

        let mut failure: Option<DownloadError> = None;
        while let Some(joined) = join_set.join_next().await {
            let (index, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Chunk task panicked: {}", e);
                    token.cancel();
                    failure = Some(DownloadError::Unknown(format!("Chunk task panicked: {}", e)));
                    continue;
                }
            };
            match result {
                Ok(()) => debug!("Chunk {} finished", index),
                Err(DownloadError::Cancelled) => {}
                Err(e) => {
                    warn!("Chunk {} of {} failed: {}", index, self.job.url, e);
                    token.cancel();
                    let keep_existing = failure
                        .as_ref()
                        .is_some_and(|existing| existing.triggers_fallback() || !e.triggers_fallback());
                    if !keep_existing {
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        merge_chunks(destination, &chunks).await?;
        self.progress.clear_chunks();
        self.progress.set_written(self.size);
        Ok(())
    }

    /// A previous run may have merged and cleaned up right before stopping
    async fn already_merged(&self) -> Result<bool, DownloadError> {
        if http::file_len(&self.job.destination).await? != self.size {
            return Ok(false);
        }
        Ok(side_files(&self.job.destination).await?.is_empty())
    }
}

/// Concatenate chunk side-files in index order, verify, then delete them
pub async fn merge_chunks(destination: &Path, chunks: &[Arc<ChunkProgress>]) -> Result<(), DownloadError> {
    info!("Merging {} chunks into {:?}", chunks.len(), destination);

    // Verify every side-file before touching the destination
    let mut expected_total = 0;
    for chunk in chunks {
        let path = chunk_path(destination, chunk.index);
        let actual = http::file_len(&path).await?;
        if actual != chunk.size() {
            error!(
                "Chunk {} side-file {:?} has {} bytes, expected {}",
                chunk.index,
                path,
                actual,
                chunk.size()
            );
            return Err(DownloadError::Incomplete {
                expected: chunk.size(),
                actual,
            });
        }
        expected_total += actual;
    }

    let mut output = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(destination)
        .await?;

    let mut buffer = vec![0u8; 1024 * 1024];
    for chunk in chunks {
        let path = chunk_path(destination, chunk.index);
        let mut input = File::open(&path).await?;
        loop {
            let n = input.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            output.write_all(&buffer[..n]).await?;
        }
    }

    output.flush().await?;
    output.sync_all().await?;

    let actual = output.metadata().await?.len();
    if actual != expected_total {
        return Err(DownloadError::Incomplete {
            expected: expected_total,
            actual,
        });
    }

    for chunk in chunks {
        let path = chunk_path(destination, chunk.index);
        if let Err(e) = http::remove_if_exists(&path).await {
            warn!("Failed to remove side-file {:?}: {}", path, e);
        }
    }

    info!("Merge complete: {:?} ({} bytes)", destination, actual);
    Ok(())
}

/// Every `<destination>.chunk<N>` currently on disk, whatever chunk count
/// produced it
pub async fn side_files(destination: &Path) -> Result<Vec<std::path::PathBuf>, DownloadError> {
    let Some(name) = destination.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{}.chunk", name);
    let dir = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let is_side_file = file_name
            .strip_prefix(&prefix)
            .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()));
        if is_side_file {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Delete all chunk side-files of `destination`
pub async fn remove_side_files(destination: &Path) -> Result<(), DownloadError> {
    for path in side_files(destination).await? {
        debug!("Removing side-file {:?}", path);
        http::remove_if_exists(&path).await?;
    }
    Ok(())
}
