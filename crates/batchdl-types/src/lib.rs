//! Shared types for batchdl
//!
//! This crate contains the data structures shared between the download
//! engine and its front-ends (CLI, embedding applications).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Request header that forces a job onto the single-stream path.
///
/// The engine consumes it locally; it is never sent to the server.
pub const SINGLE_STREAM_HEADER: &str = "x-batchdl-single-stream";

// ============================================================================
// Job Types
// ============================================================================

/// One file to download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub url: String,
    pub destination: PathBuf,
    /// Opaque request headers (credentials, cookies, referer...)
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Job {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Whether the caller opted this job out of chunked transfer
    pub fn forces_single_stream(&self) -> bool {
        self.headers
            .keys()
            .any(|name| name.eq_ignore_ascii_case(SINGLE_STREAM_HEADER))
    }

    /// Headers that should actually go on the wire
    pub fn request_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case(SINGLE_STREAM_HEADER))
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Side-file used by chunk `index` of this job
    pub fn chunk_path(&self, index: u32) -> PathBuf {
        chunk_path(&self.destination, index)
    }
}

/// `<destination>.chunk<index>`
pub fn chunk_path(destination: &Path, index: u32) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(format!(".chunk{}", index));
    PathBuf::from(name)
}

// ============================================================================
// Download Types
// ============================================================================

/// Status of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

/// Status of one part (job) inside a download
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartStatus {
    #[default]
    Pending,
    Downloading,
    Completed,
    Failed,
}

/// A byte range of a chunked download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkState {
    pub index: u32,
    pub start: u64,
    /// Inclusive
    pub end: u64,
    pub bytes_written: u64,
    pub completed: bool,
}

impl ChunkState {
    pub fn new(index: u32, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            bytes_written: 0,
            completed: false,
        }
    }

    /// Get the total size of this chunk in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// State of one job inside a download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartState {
    pub index: u32,
    pub job: Job,
    pub status: PartStatus,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub chunks: Vec<ChunkState>,
    pub uses_chunking: bool,
}

/// Point-in-time view of a download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub id: Uuid,
    pub status: DownloadStatus,
    pub jobs: Vec<Job>,
    /// One entry per job for multi-file downloads, empty otherwise
    pub parts: Vec<PartState>,
    pub current_bytes: u64,
    pub total_size: Option<u64>,
    pub start_byte: u64,
    pub total_bytes: Option<u64>,
    pub queue_position: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Periodic progress sample for an active download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub id: Uuid,
    /// Fraction in `[0, 1]`
    pub progress: f64,
    pub download_speed: u64,
    pub file_size: u64,
    pub downloaded: u64,
    pub current_part_index: Option<u32>,
    pub total_parts: Option<u32>,
    pub queue_position: u32,
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to its front-ends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Queued { id: Uuid, position: u32 },
    QueuePositionChanged { id: Uuid, position: u32 },
    Started { id: Uuid },
    Progress(ProgressSnapshot),
    Paused { id: Uuid },
    Resumed { id: Uuid },
    Completed { id: Uuid },
    Error { id: Uuid, reason: String },
    Cancelled { id: Uuid },
    /// Human-readable message for the user
    Notification { id: Uuid, title: String, message: String },
}

impl CoreEvent {
    pub fn id(&self) -> Uuid {
        match self {
            CoreEvent::Queued { id, .. }
            | CoreEvent::QueuePositionChanged { id, .. }
            | CoreEvent::Started { id }
            | CoreEvent::Paused { id }
            | CoreEvent::Resumed { id }
            | CoreEvent::Completed { id }
            | CoreEvent::Error { id, .. }
            | CoreEvent::Cancelled { id }
            | CoreEvent::Notification { id, .. } => *id,
            CoreEvent::Progress(progress) => progress.id,
        }
    }

    /// Whether this event ends the download's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoreEvent::Completed { .. } | CoreEvent::Error { .. } | CoreEvent::Cancelled { .. }
        )
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub default_download_path: PathBuf,
    /// Chunks per file, and the part concurrency budget of multi-file downloads
    pub chunk_count: u32,
    /// Files larger than this are split into chunks
    pub parallel_threshold_bytes: u64,
    /// Maximum number of attempts per transfer
    pub max_retries: u32,
    /// Backoff is `retry_base_delay_ms * attempt`
    pub retry_base_delay_ms: u64,
    pub probe_timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub part_poll_interval_ms: u64,
    pub user_agent: String,
    pub suspicious_size: SuspiciousSizePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_download_path: dirs::download_dir()
                .map(|p| p.join("batchdl"))
                .unwrap_or_else(|| PathBuf::from(".")),
            chunk_count: 8,
            parallel_threshold_bytes: 100 * 1024 * 1024,
            max_retries: 5,
            retry_base_delay_ms: 1000,
            probe_timeout_secs: 10,
            progress_interval_ms: 500,
            part_poll_interval_ms: 250,
            user_agent: format!("batchdl/{}", env!("CARGO_PKG_VERSION")),
            suspicious_size: SuspiciousSizePolicy::default(),
        }
    }
}

/// Re-download completed files that are implausibly small.
///
/// Some hosts answer with a tiny error page and a 200 status; this policy
/// lets callers retry those instead of reporting success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspiciousSizePolicy {
    pub enabled: bool,
    pub min_bytes: u64,
    pub max_retries: u32,
}

impl Default for SuspiciousSizePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            min_bytes: 1024 * 1024,
            max_retries: 1,
        }
    }
}

impl SuspiciousSizePolicy {
    /// Whether a finished file of `size` bytes should be downloaded again
    pub fn should_retry(&self, size: u64, retries_used: u32) -> bool {
        self.enabled && size < self.min_bytes && retries_used < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_path_appends_index() {
        let job = Job::new("http://example.com/a.bin", "/tmp/out/a.bin");
        assert_eq!(job.chunk_path(3), PathBuf::from("/tmp/out/a.bin.chunk3"));
    }

    #[test]
    fn single_stream_header_is_not_forwarded() {
        let job = Job::new("http://example.com/a.bin", "a.bin")
            .with_header("Authorization", "Bearer x")
            .with_header("X-Batchdl-Single-Stream", "1");

        assert!(job.forces_single_stream());
        let sent: Vec<_> = job.request_headers().collect();
        assert_eq!(sent, vec![("Authorization", "Bearer x")]);
    }

    #[test]
    fn settings_fill_missing_fields_with_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"chunk_count": 4}"#).unwrap();
        assert_eq!(settings.chunk_count, 4);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.parallel_threshold_bytes, 100 * 1024 * 1024);
        assert!(!settings.suspicious_size.enabled);
    }

    #[test]
    fn suspicious_size_policy_is_bounded() {
        let policy = SuspiciousSizePolicy {
            enabled: true,
            ..Default::default()
        };
        assert!(policy.should_retry(512, 0));
        assert!(!policy.should_retry(512, 1));
        assert!(!policy.should_retry(2 * 1024 * 1024, 0));
        assert!(!SuspiciousSizePolicy::default().should_retry(512, 0));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let id = Uuid::nil();
        let json = serde_json::to_value(CoreEvent::Error {
            id,
            reason: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "Error");
        assert_eq!(json["payload"]["reason"], "boom");
    }
}
