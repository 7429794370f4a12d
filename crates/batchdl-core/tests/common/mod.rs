//! Shared fixtures: a range-aware HTTP responder and event helpers

#![allow(dead_code)]

use batchdl_core::DownloadManager;
use batchdl_types::{CoreEvent, Settings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;
use wiremock::{Request, Respond, ResponseTemplate};

/// Deterministic, non-repeating-ish test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 251) as u8).collect()
}

/// Settings with short delays and a small chunking threshold
pub fn fast_settings() -> Settings {
    Settings {
        chunk_count: 4,
        parallel_threshold_bytes: 1000,
        max_retries: 3,
        retry_base_delay_ms: 10,
        probe_timeout_secs: 5,
        progress_interval_ms: 20,
        part_poll_interval_ms: 10,
        ..Default::default()
    }
}

pub fn manager(settings: Settings) -> (DownloadManager, broadcast::Receiver<CoreEvent>) {
    let (tx, rx) = broadcast::channel(1000);
    let manager = DownloadManager::new(settings, tx).expect("client builds");
    (manager, rx)
}

/// How the responder treats `Range` requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMode {
    /// Honour ranges with 206
    Honour,
    /// Always answer 200 with the full body
    Ignore,
    /// 429 for every bounded range except the `bytes=0-0` probe
    RateLimitChunks,
    /// Resume requests (`bytes=N-`) are answered from `N - overlap`
    Overlap(usize),
    /// Resume requests (`bytes=N-`) are answered from `N + skip`
    Skip(usize),
}

/// Serves `body` with byte-range support; HEAD is rejected so probing goes
/// through the partial GET
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    mode: RangeMode,
    delay: Duration,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            mode: RangeMode::Honour,
            delay: Duration::ZERO,
        }
    }

    pub fn mode(mut self, mode: RangeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn full(&self) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_bytes(self.body.as_slice().to_vec())
    }

    fn partial(&self, start: usize, end: usize) -> ResponseTemplate {
        let len = self.body.len();
        if start >= len {
            return ResponseTemplate::new(416)
                .insert_header("content-range", format!("bytes */{}", len));
        }
        let end = end.min(len - 1);
        ResponseTemplate::new(206)
            .insert_header("content-range", format!("bytes {}-{}/{}", start, end, len))
            .set_body_bytes(self.body[start..=end].to_vec())
    }
}

/// `bytes=a-b` or `bytes=a-`
pub fn parse_range(value: &str) -> Option<(usize, Option<usize>)> {
    let bytes = value.strip_prefix("bytes=")?;
    let (start, end) = bytes.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if request.method.as_str() == "HEAD" {
            return ResponseTemplate::new(405).set_delay(self.delay);
        }

        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        let response = match (self.mode, range) {
            (_, None) | (RangeMode::Ignore, _) => self.full(),
            (RangeMode::RateLimitChunks, Some((start, Some(end)))) if !(start == 0 && end == 0) => {
                ResponseTemplate::new(429)
            }
            (RangeMode::Overlap(overlap), Some((start, None))) if start > 0 => {
                self.partial(start.saturating_sub(overlap), usize::MAX)
            }
            (RangeMode::Skip(skip), Some((start, None))) if start > 0 => {
                self.partial(start + skip, usize::MAX)
            }
            (_, Some((start, end))) => self.partial(start, end.unwrap_or(usize::MAX)),
        };
        response.set_delay(self.delay)
    }
}

/// `Range` headers of every GET the server saw, in arrival order
pub async fn ranges_seen(server: &wiremock::MockServer) -> Vec<Option<String>> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.method.as_str() == "GET")
        .map(|request| {
            request
                .headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .collect()
}

/// Collect events for `id` until one satisfies `stop`
pub async fn events_until(
    rx: &mut broadcast::Receiver<CoreEvent>,
    id: Uuid,
    stop: impl Fn(&CoreEvent) -> bool,
) -> Vec<CoreEvent> {
    let collect = async {
        let mut seen = Vec::new();
        loop {
            match rx.recv().await {
                Ok(event) if event.id() == id => {
                    let done = stop(&event);
                    seen.push(event);
                    if done {
                        return seen;
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(15), collect)
        .await
        .expect("timed out waiting for events")
}

/// Collect events for `id` through its terminal event
pub async fn run_to_end(rx: &mut broadcast::Receiver<CoreEvent>, id: Uuid) -> Vec<CoreEvent> {
    events_until(rx, id, CoreEvent::is_terminal).await
}
