//! Chunk worker - downloads a single byte range into its side-file
//!
//! Each worker is independent and owns `<destination>.chunk<index>`. A
//! restarted worker resumes from the side-file's current length.

use crate::engine::http;
use crate::engine::progress::ChunkProgress;
use crate::error::DownloadError;
use batchdl_types::Job;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct ChunkWorker {
    client: Client,
    job: Arc<Job>,
    chunk: Arc<ChunkProgress>,
    path: PathBuf,
}

impl ChunkWorker {
    pub fn new(client: Client, job: Arc<Job>, chunk: Arc<ChunkProgress>) -> Self {
        let path = job.chunk_path(chunk.index);
        Self {
            client,
            job,
            chunk,
            path,
        }
    }

    /// Run the chunk download
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DownloadError> {
        if self.chunk.is_completed() {
            return Ok(());
        }

        let size = self.chunk.size();
        let mut have = http::file_len(&self.path).await?;
        if have > size {
            warn!(
                "Chunk {} side-file is {} bytes, larger than the chunk ({}); starting over",
                self.chunk.index, have, size
            );
            have = 0;
        }
        self.chunk.set_written(have);

        if have == size {
            debug!("Chunk {} already complete on disk", self.chunk.index);
            self.chunk.mark_completed();
            return Ok(());
        }

        // A mismatch on a resumed request discards the side-file and asks
        // for the whole chunk once more
        let (response, write_from) = loop {
            let from = self.chunk.start + have;
            let range = format!("bytes={}-{}", from, self.chunk.end);
            debug!("Chunk {} requesting range: {}", self.chunk.index, range);

            let request = http::get_range(&self.client, &self.job, &range);
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                response = request.send() => response?,
            };

            match response.status() {
                StatusCode::PARTIAL_CONTENT => {}
                StatusCode::RANGE_NOT_SATISFIABLE if have > 0 => {
                    warn!(
                        "Chunk {} resume at {} was rejected (416); starting the chunk over",
                        self.chunk.index, from
                    );
                    self.truncate_side_file().await?;
                    have = 0;
                    continue;
                }
                StatusCode::TOO_MANY_REQUESTS => return Err(DownloadError::RateLimited),
                StatusCode::OK => return Err(DownloadError::RangeNotSupported),
                StatusCode::NOT_FOUND => return Err(DownloadError::RemoteNotFound(self.job.url.clone())),
                status => {
                    return Err(DownloadError::ServerError {
                        status: status.as_u16(),
                        message: format!("Failed to download chunk {} ({})", self.chunk.index, range),
                    })
                }
            }

            // Realign if the server started somewhere other than where we asked
            let Some(content_range) = http::content_range(response.headers()) else {
                break (response, have);
            };
            if content_range.start == from {
                break (response, have);
            }
            if content_range.start >= self.chunk.start && content_range.start < from {
                break (response, content_range.start - self.chunk.start);
            }
            if have == 0 {
                return Err(DownloadError::UnexpectedRange(format!(
                    "chunk {} asked for {} got {}-{}",
                    self.chunk.index, range, content_range.start, content_range.end
                )));
            }
            warn!(
                "Chunk {} asked for {} but got {}-{}; starting the chunk over",
                self.chunk.index, range, content_range.start, content_range.end
            );
            self.truncate_side_file().await?;
            have = 0;
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .await?;
        file.set_len(write_from).await?;
        file.seek(SeekFrom::Start(write_from)).await?;
        self.chunk.set_written(write_from);

        let mut remaining = size - write_from;
        let mut stream = response.bytes_stream();
        let result = loop {
            if remaining == 0 {
                break Ok(());
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(DownloadError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    // Never write past the chunk end, whatever the server sends
                    let take = (bytes.len() as u64).min(remaining) as usize;
                    if let Err(e) = file.write_all(&bytes[..take]).await {
                        break Err(e.into());
                    }
                    remaining -= take as u64;
                    self.chunk.add(take as u64);
                }
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            }
        };

        file.flush().await?;
        result?;

        if remaining > 0 {
            return Err(DownloadError::Incomplete {
                expected: size,
                actual: size - remaining,
            });
        }
        file.sync_all().await?;

        self.chunk.mark_completed();
        debug!(
            "Chunk {} complete ({} bytes, {}-{})",
            self.chunk.index, size, self.chunk.start, self.chunk.end
        );
        Ok(())
    }

    async fn truncate_side_file(&self) -> Result<(), DownloadError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        file.set_len(0).await?;
        self.chunk.set_written(0);
        Ok(())
    }
}
