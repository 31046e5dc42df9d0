//! Integration tests for the engine boundary: enqueue, dedup, structural
//! rejection, admission control, observe queries, and lifecycle. Everything
//! here runs offline against temp directories.

use std::time::Duration;

use scrivener_common::ScrivenerError;
use scrivener_engine::{
    Collaborators, Engine, EngineConfig, EnqueueOutcome, EnqueueRequest, ReferenceKind,
    RejectReason, Stage,
};

fn config(dir: &tempfile::TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.index.path = dir.path().join("index.db");
    config.storage.root = dir.path().join("archive");
    config.scheduler.workers = 2;
    config.scheduler.poll_interval = Duration::from_millis(50);
    config
}

async fn engine(dir: &tempfile::TempDir) -> Engine {
    Engine::new(config(dir), Collaborators::default())
        .await
        .expect("engine construction")
}

#[tokio::test]
async fn enqueue_new_then_canonical_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir).await;
    let handle = engine.handle();

    let (first_id, outcome) = handle
        .enqueue(EnqueueRequest::new("https://example.com/a", ReferenceKind::Article))
        .await
        .unwrap();
    assert_eq!(outcome, EnqueueOutcome::EnqueuedNew);

    let observed = handle.get(&first_id).await.unwrap().unwrap();
    assert_eq!(observed.reference.stage, Stage::ContentReceived);
    assert_eq!(observed.reference.canonical_url, "https://example.com/a");

    // Same document through a messier spelling.
    let (_, outcome) = handle
        .enqueue(EnqueueRequest::new(
            "HTTP://Example.COM/a/?utm_source=newsletter",
            ReferenceKind::Article,
        ))
        .await
        .unwrap();
    assert_eq!(outcome, EnqueueOutcome::DuplicateOf(first_id));
}

#[tokio::test]
async fn concurrent_enqueues_yield_one_new() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir).await;
    let handle = engine.handle();

    let mut joins = Vec::new();
    for _ in 0..8 {
        let handle = handle.clone();
        joins.push(tokio::spawn(async move {
            handle
                .enqueue(EnqueueRequest::new("https://example.com/races", ReferenceKind::Article))
                .await
                .unwrap()
        }));
    }

    let mut new = 0;
    let mut duplicate = 0;
    for join in joins {
        match join.await.unwrap().1 {
            EnqueueOutcome::EnqueuedNew => new += 1,
            EnqueueOutcome::DuplicateOf(_) => duplicate += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(new, 1, "exactly one submission wins");
    assert_eq!(duplicate, 7);
}

#[tokio::test]
async fn structural_rejection_never_enters_queue() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir).await;
    let handle = engine.handle();

    let (id, outcome) = handle
        .enqueue(EnqueueRequest::new("file:///etc/passwd", ReferenceKind::Document))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        EnqueueOutcome::Rejected(RejectReason::DisallowedScheme)
    );
    assert!(handle.get(&id).await.unwrap().is_none());
    assert_eq!(handle.queue_depth().await.unwrap(), 0);

    let (_, outcome) = handle
        .enqueue(EnqueueRequest::new("not a url at all", ReferenceKind::Article))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        EnqueueOutcome::Rejected(RejectReason::UnfetchableHost)
    );
}

#[tokio::test]
async fn backpressure_rejects_over_high_water() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.scheduler.high_water = 2;
    config.scheduler.low_water = 1;
    let engine = Engine::new(config, Collaborators::default()).await.unwrap();
    let handle = engine.handle();

    for i in 0..2 {
        let (_, outcome) = handle
            .enqueue(EnqueueRequest::new(
                format!("https://example.com/{i}"),
                ReferenceKind::Article,
            ))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::EnqueuedNew);
    }

    let (_, outcome) = handle
        .enqueue(EnqueueRequest::new("https://example.com/overflow", ReferenceKind::Article))
        .await
        .unwrap();
    assert_eq!(outcome, EnqueueOutcome::Rejected(RejectReason::Backpressure));
}

#[tokio::test]
async fn ready_queue_orders_by_priority() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir).await;
    let handle = engine.handle();

    handle
        .enqueue(EnqueueRequest::new("https://example.com/low", ReferenceKind::Article))
        .await
        .unwrap();
    let (urgent_id, _) = handle
        .enqueue(
            EnqueueRequest::new("https://example.com/urgent", ReferenceKind::Article)
                .with_priority(10),
        )
        .await
        .unwrap();

    let ready = handle.query_ready(10).await.unwrap();
    assert_eq!(ready.len(), 2);
    assert_eq!(ready[0].id, urgent_id);
}

#[tokio::test]
async fn second_process_is_refused_while_lock_is_held() {
    let dir = tempfile::tempdir().unwrap();
    let first = engine(&dir).await;

    let second = Engine::new(config(&dir), Collaborators::default()).await;
    assert!(matches!(second, Err(ScrivenerError::LockConflict)));

    // A clean shutdown releases the lock for the next process.
    first.shutdown(Duration::from_secs(1)).await;
    let third = Engine::new(config(&dir), Collaborators::default()).await;
    assert!(third.is_ok());
}

#[tokio::test]
async fn ssrf_blocked_reference_is_dead_lettered_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir).await;
    let handle = engine.handle();
    engine.start().await;

    // Document kind keeps the chain to origin-only, so no archive-service
    // traffic happens; the loopback target is rejected before any packet.
    let (id, outcome) = handle
        .enqueue(EnqueueRequest::new("http://127.0.0.1/internal.pdf", ReferenceKind::Document))
        .await
        .unwrap();
    assert_eq!(outcome, EnqueueOutcome::EnqueuedNew);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let parked = loop {
        if let Some(observed) = handle.get(&id).await.unwrap() {
            if observed.reference.stage == Stage::PermanentError {
                break observed;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "reference never reached dead-letter"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    assert_eq!(
        parked.reference.failure_reason,
        Some(scrivener_common::FailureReason::SsrfBlocked)
    );
    assert!(!parked.attempts.is_empty(), "diagnostics retained for forensics");

    let dead = handle.list_dead_letter(10).await.unwrap();
    assert_eq!(dead.len(), 1);

    engine.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn resurrect_requires_dead_letter() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir).await;
    let handle = engine.handle();

    let (id, _) = handle
        .enqueue(EnqueueRequest::new("https://example.com/alive", ReferenceKind::Article))
        .await
        .unwrap();
    assert!(!handle.resurrect(&id).await.unwrap(), "active references stay put");
}

#[tokio::test]
async fn start_and_shutdown_are_clean_with_empty_queue() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir).await;
    engine.start().await;
    // Idempotent start.
    engine.start().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.shutdown(Duration::from_secs(2)).await;
}

// ---------------------------------------------------------------------------
// Loopback end-to-end: a canned HTTP server on 127.0.0.1 drives the whole
// pipeline without touching the network.
// ---------------------------------------------------------------------------

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Serve the scripted responses in order, repeating the last one. Returns the
/// base URL.
async fn canned_server(responses: Vec<String>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut served = 0usize;
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let response = responses[served.min(responses.len() - 1)].clone();
            served += 1;
            tokio::spawn(async move {
                // Drain the request head before answering.
                let mut buffer = [0u8; 4096];
                let mut head = Vec::new();
                loop {
                    match socket.read(&mut buffer).await {
                        Ok(0) => break,
                        Ok(n) => {
                            head.extend_from_slice(&buffer[..n]);
                            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://127.0.0.1:{}", addr.port())
}

fn http_response(status: &str, headers: &[(&str, String)], body: &str) -> String {
    let mut response = format!("HTTP/1.1 {status}\r\n");
    for (name, value) in headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    ));
    response
}

fn html_page(paragraphs: usize) -> String {
    let mut body = String::from("<!DOCTYPE html><html><head><title>Archive Drill</title></head><body><article>");
    for i in 0..paragraphs {
        body.push_str(&format!(
            "<p>Paragraph {i}: the municipal archive board voted to retain every \
             submitted record for the standard period, citing the preservation \
             statute and the published retention schedule in detail.</p>"
        ));
    }
    body.push_str("</article></body></html>");
    body
}

/// Test config for loopback targets: keep http (no TLS on the canned server)
/// and allow private addresses through the pre-flight.
fn loopback_config(dir: &tempfile::TempDir) -> EngineConfig {
    let mut config = config(dir);
    config.ssrf.allow_private = true;
    config.canonical.https_exempt_hosts.insert("127.0.0.1".to_string());
    config
}

async fn wait_for_stage(
    handle: &scrivener_engine::EngineHandle,
    id: &scrivener_engine::ReferenceId,
    stage: Stage,
) -> scrivener_engine::ObservedReference {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if let Some(observed) = handle.get(id).await.unwrap() {
            if observed.reference.stage == stage {
                return observed;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "reference never reached stage {stage:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn archives_a_served_page_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let page = html_page(20);
    let base = canned_server(vec![http_response(
        "200 OK",
        &[("Content-Type", "text/html; charset=utf-8".to_string())],
        &page,
    )])
    .await;

    let engine = Engine::new(loopback_config(&dir), Collaborators::default())
        .await
        .unwrap();
    let handle = engine.handle();
    let mut committed = handle.subscribe();
    engine.start().await;

    let (id, outcome) = handle
        .enqueue(EnqueueRequest::new(
            format!("{base}/records/annual-report"),
            ReferenceKind::Document,
        ))
        .await
        .unwrap();
    assert_eq!(outcome, EnqueueOutcome::EnqueuedNew);

    let done = wait_for_stage(&handle, &id, Stage::Finalized).await;
    let artifact = done.artifact.expect("artifact metadata recorded");
    assert_eq!(artifact.quality, scrivener_engine::Quality::Good);
    assert!(artifact.word_count > 100);
    assert!(done.reference.content_hash.is_some());

    // Bytes are on disk under the committed sentinel, and the recorded hash
    // matches what is stored.
    assert!(artifact.content_path.join(".committed").exists());
    let stored = std::fs::read(artifact.content_path.join("content.md")).unwrap();
    assert_eq!(
        scrivener_common::content_hash(&stored),
        artifact.content_hash
    );

    // The change stream carried the commit.
    let event = tokio::time::timeout(Duration::from_secs(2), committed.recv())
        .await
        .expect("change stream event")
        .unwrap();
    assert_eq!(event.reference_id, id);
    assert_eq!(event.content_hash, artifact.content_hash);

    engine.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn missing_page_is_dead_lettered_with_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let base = canned_server(vec![http_response(
        "404 Not Found",
        &[("Content-Type", "text/html".to_string())],
        "<html><body>gone</body></html>",
    )])
    .await;

    let engine = Engine::new(loopback_config(&dir), Collaborators::default())
        .await
        .unwrap();
    let handle = engine.handle();
    engine.start().await;

    let (id, _) = handle
        .enqueue(EnqueueRequest::new(
            format!("{base}/never-existed"),
            ReferenceKind::Document,
        ))
        .await
        .unwrap();

    let parked = wait_for_stage(&handle, &id, Stage::PermanentError).await;
    assert_eq!(
        parked.reference.failure_reason,
        Some(scrivener_common::FailureReason::NotFound)
    );
    assert!(parked
        .attempts
        .iter()
        .any(|a| a.transport.as_deref() == Some("direct_http")));

    engine.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn rate_limit_retries_on_server_clock_without_spending_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let page = html_page(20);
    let base = canned_server(vec![
        http_response("429 Too Many Requests", &[("Retry-After", "1".to_string())], ""),
        http_response(
            "200 OK",
            &[("Content-Type", "text/html".to_string())],
            &page,
        ),
    ])
    .await;

    let engine = Engine::new(loopback_config(&dir), Collaborators::default())
        .await
        .unwrap();
    let handle = engine.handle();
    engine.start().await;

    let (id, _) = handle
        .enqueue(EnqueueRequest::new(
            format!("{base}/throttled"),
            ReferenceKind::Document,
        ))
        .await
        .unwrap();

    let done = wait_for_stage(&handle, &id, Stage::Finalized).await;
    // The throttled round was budget, not a fault: only the successful pass
    // counts as an attempt.
    assert_eq!(done.reference.attempts, 1);
    assert!(done
        .attempts
        .iter()
        .any(|a| a.status == "rate_limited"));

    engine.shutdown(Duration::from_secs(2)).await;
}
