//! End-to-end transfers against a local HTTP server

mod common;

use batchdl_types::{chunk_path, CoreEvent, Job, SINGLE_STREAM_HEADER};
use common::{fast_settings, manager, payload, ranges_seen, run_to_end, RangeMode, RangeResponder};
use wiremock::matchers::{header, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve(server: &MockServer, route: &str, responder: RangeResponder) {
    Mock::given(path(route))
        .respond_with(responder)
        .mount(server)
        .await;
}

fn last_completed(events: &[CoreEvent]) -> bool {
    matches!(events.last(), Some(CoreEvent::Completed { .. }))
}

#[tokio::test]
async fn small_file_downloads_in_one_stream() {
    let server = MockServer::start().await;
    let body = payload(600);
    serve(&server, "/small.bin", RangeResponder::new(body.clone())).await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("small.bin");
    let (manager, mut rx) = manager(fast_settings());

    let id = manager
        .submit(vec![Job::new(format!("{}/small.bin", server.uri()), &destination)])
        .unwrap();
    let events = run_to_end(&mut rx, id).await;

    assert!(last_completed(&events), "events: {:?}", events);
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
    // Probe, then one plain GET
    assert_eq!(ranges_seen(&server).await, vec![Some("bytes=0-0".to_string()), None]);
    assert!(manager.get(id).is_none());
}

#[tokio::test]
async fn large_file_is_split_into_chunks_and_merged_in_order() {
    let server = MockServer::start().await;
    let body = payload(4000);
    serve(&server, "/big.bin", RangeResponder::new(body.clone())).await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("big.bin");
    let (manager, mut rx) = manager(fast_settings());

    let id = manager
        .submit(vec![Job::new(format!("{}/big.bin", server.uri()), &destination)])
        .unwrap();
    let events = run_to_end(&mut rx, id).await;

    assert!(last_completed(&events), "events: {:?}", events);
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);

    let mut ranges: Vec<String> = ranges_seen(&server).await.into_iter().flatten().collect();
    ranges.sort();
    assert_eq!(
        ranges,
        vec![
            "bytes=0-0",
            "bytes=0-999",
            "bytes=1000-1999",
            "bytes=2000-2999",
            "bytes=3000-3999"
        ]
    );
    for index in 0..4 {
        assert!(!chunk_path(&destination, index).exists());
    }
}

#[tokio::test]
async fn chunks_resume_from_their_side_files() {
    let server = MockServer::start().await;
    let body = payload(4000);
    serve(&server, "/big.bin", RangeResponder::new(body.clone())).await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("big.bin");
    tokio::fs::write(chunk_path(&destination, 0), &body[..500]).await.unwrap();
    tokio::fs::write(chunk_path(&destination, 2), &body[2000..3000]).await.unwrap();

    let (manager, mut rx) = manager(fast_settings());
    let id = manager
        .submit(vec![Job::new(format!("{}/big.bin", server.uri()), &destination)])
        .unwrap();
    let events = run_to_end(&mut rx, id).await;

    assert!(last_completed(&events), "events: {:?}", events);
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);

    let ranges: Vec<String> = ranges_seen(&server).await.into_iter().flatten().collect();
    assert!(ranges.contains(&"bytes=500-999".to_string()), "{:?}", ranges);
    assert!(!ranges.iter().any(|r| r.starts_with("bytes=2000")), "{:?}", ranges);
}

#[tokio::test]
async fn rate_limited_chunks_fall_back_to_a_single_stream() {
    let server = MockServer::start().await;
    let body = payload(4000);
    serve(
        &server,
        "/busy.bin",
        RangeResponder::new(body.clone()).mode(RangeMode::RateLimitChunks),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("busy.bin");
    let (manager, mut rx) = manager(fast_settings());

    let id = manager
        .submit(vec![Job::new(format!("{}/busy.bin", server.uri()), &destination)])
        .unwrap();
    let events = run_to_end(&mut rx, id).await;

    assert!(last_completed(&events), "events: {:?}", events);
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
    assert_eq!(ranges_seen(&server).await.last(), Some(&None));
    for index in 0..4 {
        assert!(!chunk_path(&destination, index).exists());
    }
}

#[tokio::test]
async fn resume_asks_for_the_remaining_bytes() {
    let server = MockServer::start().await;
    let body = payload(100);
    serve(&server, "/file.bin", RangeResponder::new(body.clone())).await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("file.bin");
    // What a pause at 40 of 100 bytes leaves behind
    tokio::fs::write(&destination, &body[..40]).await.unwrap();

    let (manager, mut rx) = manager(fast_settings());
    let id = manager
        .submit(vec![Job::new(format!("{}/file.bin", server.uri()), &destination)
            .with_header(SINGLE_STREAM_HEADER, "1")])
        .unwrap();
    let events = run_to_end(&mut rx, id).await;

    assert!(last_completed(&events), "events: {:?}", events);
    assert_eq!(ranges_seen(&server).await, vec![Some("bytes=40-".to_string())]);
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
}

#[tokio::test]
async fn early_content_range_does_not_duplicate_bytes() {
    let server = MockServer::start().await;
    let body = payload(100);
    serve(
        &server,
        "/file.bin",
        RangeResponder::new(body.clone()).mode(RangeMode::Overlap(10)),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("file.bin");
    tokio::fs::write(&destination, &body[..60]).await.unwrap();

    let (manager, mut rx) = manager(fast_settings());
    let id = manager
        .submit(vec![Job::new(format!("{}/file.bin", server.uri()), &destination)])
        .unwrap();
    let events = run_to_end(&mut rx, id).await;

    assert!(last_completed(&events), "events: {:?}", events);
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
}

#[tokio::test]
async fn late_content_range_restarts_from_zero_without_spending_a_retry() {
    let server = MockServer::start().await;
    let body = payload(100);
    serve(
        &server,
        "/file.bin",
        RangeResponder::new(body.clone()).mode(RangeMode::Skip(10)),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("file.bin");
    tokio::fs::write(&destination, &body[..40]).await.unwrap();

    let mut settings = fast_settings();
    settings.max_retries = 1;
    let (manager, mut rx) = manager(settings);
    let id = manager
        .submit(vec![Job::new(format!("{}/file.bin", server.uri()), &destination)
            .with_header(SINGLE_STREAM_HEADER, "1")])
        .unwrap();
    let events = run_to_end(&mut rx, id).await;

    assert!(last_completed(&events), "events: {:?}", events);
    assert_eq!(ranges_seen(&server).await, vec![Some("bytes=40-".to_string()), None]);
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
}

#[tokio::test]
async fn misplaced_chunk_resume_starts_the_chunk_over() {
    let server = MockServer::start().await;
    let body = payload(4000);
    Mock::given(path("/big.bin"))
        .and(header("range", "bytes=1500-1999"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 1600-1999/4000")
                .set_body_bytes(body[1600..2000].to_vec()),
        )
        .with_priority(1)
        .up_to_n_times(1)
        .mount(&server)
        .await;
    serve(&server, "/big.bin", RangeResponder::new(body.clone())).await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("big.bin");
    tokio::fs::write(chunk_path(&destination, 1), &body[1000..1500]).await.unwrap();

    let mut settings = fast_settings();
    settings.max_retries = 1;
    let (manager, mut rx) = manager(settings);
    let id = manager
        .submit(vec![Job::new(format!("{}/big.bin", server.uri()), &destination)])
        .unwrap();
    let events = run_to_end(&mut rx, id).await;

    assert!(last_completed(&events), "events: {:?}", events);
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
    let ranges: Vec<String> = ranges_seen(&server).await.into_iter().flatten().collect();
    assert!(ranges.contains(&"bytes=1500-1999".to_string()), "{:?}", ranges);
    assert!(ranges.contains(&"bytes=1000-1999".to_string()), "{:?}", ranges);
}

#[tokio::test]
async fn rejected_chunk_resume_downloads_the_whole_chunk() {
    let server = MockServer::start().await;
    let body = payload(4000);
    Mock::given(path("/big.bin"))
        .and(header("range", "bytes=500-999"))
        .respond_with(ResponseTemplate::new(416).insert_header("content-range", "bytes */4000"))
        .with_priority(1)
        .up_to_n_times(1)
        .mount(&server)
        .await;
    serve(&server, "/big.bin", RangeResponder::new(body.clone())).await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("big.bin");
    tokio::fs::write(chunk_path(&destination, 0), &body[..500]).await.unwrap();

    let mut settings = fast_settings();
    settings.max_retries = 1;
    let (manager, mut rx) = manager(settings);
    let id = manager
        .submit(vec![Job::new(format!("{}/big.bin", server.uri()), &destination)])
        .unwrap();
    let events = run_to_end(&mut rx, id).await;

    assert!(last_completed(&events), "events: {:?}", events);
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
    let ranges: Vec<String> = ranges_seen(&server).await.into_iter().flatten().collect();
    assert!(ranges.contains(&"bytes=0-999".to_string()), "{:?}", ranges);
}

#[tokio::test]
async fn server_ignoring_range_rewrites_from_zero() {
    let server = MockServer::start().await;
    let body = payload(100);
    serve(
        &server,
        "/file.bin",
        RangeResponder::new(body.clone()).mode(RangeMode::Ignore),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("file.bin");
    tokio::fs::write(&destination, vec![0xAA; 40]).await.unwrap();

    let (manager, mut rx) = manager(fast_settings());
    let id = manager
        .submit(vec![Job::new(format!("{}/file.bin", server.uri()), &destination)])
        .unwrap();
    let events = run_to_end(&mut rx, id).await;

    assert!(last_completed(&events), "events: {:?}", events);
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
}

#[tokio::test]
async fn range_not_satisfiable_means_already_complete() {
    let server = MockServer::start().await;
    let body = payload(100);
    serve(&server, "/file.bin", RangeResponder::new(body.clone())).await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("file.bin");
    tokio::fs::write(&destination, &body).await.unwrap();

    let (manager, mut rx) = manager(fast_settings());
    let id = manager
        .submit(vec![Job::new(format!("{}/file.bin", server.uri()), &destination)
            .with_header(SINGLE_STREAM_HEADER, "1")])
        .unwrap();
    let events = run_to_end(&mut rx, id).await;

    assert!(last_completed(&events), "events: {:?}", events);
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
}

#[tokio::test]
async fn missing_remote_file_fails_without_retrying() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("gone.bin");

    let (manager, mut rx) = manager(fast_settings());
    let id = manager
        .submit(vec![Job::new(format!("{}/gone.bin", server.uri()), &destination)
            .with_header(SINGLE_STREAM_HEADER, "1")])
        .unwrap();
    let events = run_to_end(&mut rx, id).await;

    assert!(
        matches!(events.last(), Some(CoreEvent::Error { reason, .. }) if reason.contains("not found")),
        "events: {:?}",
        events
    );
    assert_eq!(ranges_seen(&server).await.len(), 1);
    assert!(!destination.exists());
}

#[tokio::test]
async fn server_errors_are_retried_then_surfaced() {
    let server = MockServer::start().await;
    Mock::given(path("/flaky.bin"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("flaky.bin");
    let (manager, mut rx) = manager(fast_settings());

    let id = manager
        .submit(vec![Job::new(format!("{}/flaky.bin", server.uri()), &destination)
            .with_header(SINGLE_STREAM_HEADER, "1")])
        .unwrap();
    let events = run_to_end(&mut rx, id).await;

    assert!(matches!(events.last(), Some(CoreEvent::Error { .. })), "events: {:?}", events);
    // max_retries attempts in total
    assert_eq!(ranges_seen(&server).await.len(), 3);
    assert!(!destination.exists());
}

#[tokio::test]
async fn pass_through_headers_reach_the_server_but_the_flag_does_not() {
    let server = MockServer::start().await;
    let body = payload(50);
    serve(&server, "/auth.bin", RangeResponder::new(body.clone())).await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("auth.bin");
    let (manager, mut rx) = manager(fast_settings());

    let id = manager
        .submit(vec![Job::new(format!("{}/auth.bin", server.uri()), &destination)
            .with_header("Authorization", "Bearer secret")
            .with_header(SINGLE_STREAM_HEADER, "1")])
        .unwrap();
    run_to_end(&mut rx, id).await;

    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].headers.get("authorization").and_then(|v| v.to_str().ok()),
        Some("Bearer secret")
    );
    assert!(requests[0].headers.get(SINGLE_STREAM_HEADER).is_none());
}

#[tokio::test]
async fn suspiciously_small_files_are_downloaded_again() {
    let server = MockServer::start().await;
    let body = payload(100);
    serve(&server, "/tiny.bin", RangeResponder::new(body.clone())).await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("tiny.bin");
    let mut settings = fast_settings();
    settings.suspicious_size.enabled = true;
    settings.suspicious_size.min_bytes = 1000;
    settings.suspicious_size.max_retries = 1;
    let (manager, mut rx) = manager(settings);

    let id = manager
        .submit(vec![Job::new(format!("{}/tiny.bin", server.uri()), &destination)
            .with_header(SINGLE_STREAM_HEADER, "1")])
        .unwrap();
    let events = run_to_end(&mut rx, id).await;

    assert!(last_completed(&events), "events: {:?}", events);
    assert_eq!(ranges_seen(&server).await, vec![None, None]);
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
}
