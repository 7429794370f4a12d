//! Remote file probing
//!
//! Determines size and byte-range support before a transfer strategy is
//! chosen. Probing never fails: errors and timeouts yield "unknown size,
//! no ranges", which keeps the file on the single-stream path.

use crate::engine::http;
use crate::error::DownloadError;
use batchdl_types::Job;
use reqwest::header::ACCEPT_RANGES;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub size: Option<u64>,
    pub accepts_ranges: bool,
}

/// Probe `job`, bounded by `timeout`
pub async fn probe(client: &Client, job: &Job, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, probe_inner(client, job, timeout)).await {
        Ok(Ok(result)) => {
            debug!(
                "Probed {}: size={:?}, ranges={}",
                job.url, result.size, result.accepts_ranges
            );
            result
        }
        Ok(Err(e)) => {
            warn!("Probe of {} failed: {} - not parallelizing", job.url, e);
            ProbeResult::default()
        }
        Err(_) => {
            warn!("Probe of {} timed out after {:?} - not parallelizing", job.url, timeout);
            ProbeResult::default()
        }
    }
}

/// Uses HEAD first, then falls back to a one-byte ranged GET for servers
/// that omit Content-Length on HEAD or reject HEAD altogether
async fn probe_inner(client: &Client, job: &Job, timeout: Duration) -> Result<ProbeResult, DownloadError> {
    let response = http::head(client, job).timeout(timeout).send().await?;

    let mut result = ProbeResult::default();
    if response.status().is_success() {
        result.accepts_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        result.size = http::content_length(response.headers()).filter(|size| *size > 0);
    }

    if result.size.is_some() {
        return Ok(result);
    }

    info!("HEAD didn't return a size for {}, trying partial GET", job.url);
    let response = http::get_range(client, job, "bytes=0-0")
        .timeout(timeout)
        .send()
        .await?;

    match response.status() {
        StatusCode::PARTIAL_CONTENT => {
            result.accepts_ranges = true;
            result.size = http::content_range(response.headers()).and_then(|range| range.total);
        }
        StatusCode::OK => {
            // Server ignored the range and is sending the whole body
            result.accepts_ranges = false;
            result.size = http::content_length(response.headers());
        }
        status => debug!("Partial GET probe of {} returned {}", job.url, status),
    }

    Ok(result)
}
