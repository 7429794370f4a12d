//! Request building and response header parsing shared by the transfers

use batchdl_types::Job;
use reqwest::header::{HeaderMap, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, RequestBuilder};
use std::path::Path;

/// Parsed `Content-Range: bytes <start>-<end>/<total>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` when the server sent `*`
    pub total: Option<u64>,
}

/// GET for `job` carrying its pass-through headers
pub fn get(client: &Client, job: &Job) -> RequestBuilder {
    with_job_headers(client.get(&job.url), job)
}

/// HEAD for `job` carrying its pass-through headers
pub fn head(client: &Client, job: &Job) -> RequestBuilder {
    with_job_headers(client.head(&job.url), job)
}

/// Ranged GET; compression is disabled so byte offsets stay meaningful
pub fn get_range(client: &Client, job: &Job, range: &str) -> RequestBuilder {
    get(client, job)
        .header(RANGE, range)
        .header(ACCEPT_ENCODING, "identity")
}

fn with_job_headers(mut request: RequestBuilder, job: &Job) -> RequestBuilder {
    for (name, value) in job.request_headers() {
        request = request.header(name, value);
    }
    request
}

pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

pub fn content_range(headers: &HeaderMap) -> Option<ContentRange> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
}

pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let value = value.trim();
    let rest = value.strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        total => Some(total.parse().ok()?),
    };
    Some(ContentRange { start, end, total })
}

/// Length of the file at `path`, or 0 if it does not exist
pub async fn file_len(path: &Path) -> std::io::Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

pub async fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent).await,
        _ => Ok(()),
    }
}

/// Remove a file, treating "already gone" as success
pub async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_range() {
        assert_eq!(
            parse_content_range("bytes 100-199/1000"),
            Some(ContentRange {
                start: 100,
                end: 199,
                total: Some(1000)
            })
        );
        assert_eq!(
            parse_content_range("bytes 0-0/*"),
            Some(ContentRange {
                start: 0,
                end: 0,
                total: None
            })
        );
    }

    #[test]
    fn rejects_malformed_content_range() {
        assert_eq!(parse_content_range("bytes */1000"), None);
        assert_eq!(parse_content_range("items 0-5/10"), None);
        assert_eq!(parse_content_range("bytes 9-5/10"), None);
        assert_eq!(parse_content_range(""), None);
    }

    #[tokio::test]
    async fn file_len_of_missing_file_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(file_len(&dir.path().join("nope")).await.unwrap(), 0);
        assert!(remove_if_exists(&dir.path().join("nope")).await.is_ok());
    }
}
