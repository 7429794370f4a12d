//! Single-stream transfer - one GET writing straight into the destination
//!
//! Resumes from whatever is already on disk by asking for
//! `Range: bytes=<len>-`, and reconciles whatever the server actually
//! answers with the local file before writing a single byte.

use crate::engine::http;
use crate::engine::progress::FileProgress;
use crate::engine::retry::RetryPolicy;
use crate::error::DownloadError;
use batchdl_types::Job;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a response body goes relative to the local file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Nothing left to fetch
    Complete,
    WriteFrom(u64),
    /// Local bytes were discarded; ask again from byte 0
    Restart,
}

pub struct StreamTransfer {
    client: Client,
    job: Arc<Job>,
    retry: RetryPolicy,
    progress: Arc<FileProgress>,
}

impl StreamTransfer {
    pub fn new(client: Client, job: Arc<Job>, retry: RetryPolicy, progress: Arc<FileProgress>) -> Self {
        Self {
            client,
            job,
            retry,
            progress,
        }
    }

    /// Download the whole file, retrying transient failures with backoff
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), DownloadError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(cancel).await {
                Ok(()) => return Ok(()),
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(e) if self.retry.should_retry(attempt, &e) => {
                    warn!(
                        "Transfer of {} failed (attempt {}/{}): {}. Will retry.",
                        self.job.url, attempt, self.retry.max_attempts, e
                    );
                    self.retry.backoff(attempt, cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, cancel: &CancellationToken) -> Result<(), DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let destination = &self.job.destination;
        http::ensure_parent_dir(destination).await?;

        // At most one restart: after truncating, the offset is 0
        let (response, write_from) = loop {
            let offset = http::file_len(destination).await?;
            let request = if offset > 0 {
                info!("Resuming {} from byte {}", self.job.url, offset);
                http::get_range(&self.client, &self.job, &format!("bytes={}-", offset))
            } else {
                http::get(&self.client, &self.job)
            };

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                response = request.send() => response?,
            };

            match self.reconcile(&response, offset).await? {
                Placement::Complete => {
                    info!("{} is already complete ({} bytes)", self.job.url, offset);
                    self.progress.begin_at(offset);
                    self.progress.set_total(Some(offset));
                    return Ok(());
                }
                Placement::WriteFrom(write_from) => break (response, write_from),
                Placement::Restart => continue,
            }
        };

        let total = http::content_length(response.headers())
            .map(|len| write_from + len)
            .or_else(|| http::content_range(response.headers()).and_then(|range| range.total));
        self.progress.set_total(total);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(destination)
            .await?;
        file.set_len(write_from).await?;
        file.seek(SeekFrom::Start(write_from)).await?;
        self.progress.begin_at(write_from);

        debug!(
            "Writing {} from byte {} (total {:?})",
            destination.display(),
            write_from,
            total
        );

        let mut written = write_from;
        let mut stream = response.bytes_stream();
        let result = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(DownloadError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    if let Err(e) = file.write_all(&bytes).await {
                        break Err(e.into());
                    }
                    written += bytes.len() as u64;
                    self.progress.add(bytes.len() as u64);
                }
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            }
        };

        // Always leave the file consistent with what was counted
        file.flush().await?;
        result?;

        if let Some(expected) = total {
            if written < expected {
                return Err(DownloadError::Incomplete {
                    expected,
                    actual: written,
                });
            }
        }
        file.sync_all().await?;

        info!("Finished {} ({} bytes)", destination.display(), written);
        Ok(())
    }

    /// Decide where the body belongs in the local file
    async fn reconcile(&self, response: &Response, offset: u64) -> Result<Placement, DownloadError> {
        let status = response.status();
        match status {
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(Placement::Complete),
            StatusCode::NOT_FOUND => Err(DownloadError::RemoteNotFound(self.job.url.clone())),
            StatusCode::TOO_MANY_REQUESTS => Err(DownloadError::RateLimited),
            StatusCode::PARTIAL_CONTENT => match http::content_range(response.headers()) {
                Some(range) if range.start > offset && offset > 0 => {
                    warn!(
                        "Server resumed {} at byte {} but we have {}; restarting from 0",
                        self.job.url, range.start, offset
                    );
                    self.truncate(0).await?;
                    Ok(Placement::Restart)
                }
                Some(range) if range.start > offset => Err(DownloadError::UnexpectedRange(format!(
                    "bytes {}-{} requested from {}",
                    range.start, range.end, offset
                ))),
                Some(range) if range.start < offset => {
                    debug!(
                        "Server resumed {} early at byte {}, dropping {} local bytes",
                        self.job.url,
                        range.start,
                        offset - range.start
                    );
                    Ok(Placement::WriteFrom(range.start))
                }
                _ => Ok(Placement::WriteFrom(offset)),
            },
            status if status.is_success() => {
                if offset > 0 {
                    info!(
                        "Server ignored Range for {}, discarding {} local bytes",
                        self.job.url, offset
                    );
                }
                Ok(Placement::WriteFrom(0))
            }
            status => Err(DownloadError::ServerError {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown").to_string(),
            }),
        }
    }

    async fn truncate(&self, len: u64) -> Result<(), DownloadError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.job.destination)
            .await?;
        file.set_len(len).await?;
        file.sync_all().await?;
        self.progress.begin_at(len);
        Ok(())
    }
}
