// Worker pool: lease batches, walk each reference through the stage machine,
// and report the outcome back to the scheduler exactly once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use futures::FutureExt;
use tracing::{error, info, warn};

use scrivener_archive::providers::EnrichOutcome;
use scrivener_archive::{
    readability, AttemptNote, BoundedHttp, CancelToken, FetchOutcome, ResolveCtx, Verdict,
};
use scrivener_common::{
    ArtifactMeta, AttemptDiagnostic, CommittedArtifact, FailureReason, Locator, Quality,
    Reference, Result, ScrivenerError, Stage,
};

use crate::engine::EngineInner;
use crate::scheduler::backoff_delay;

/// Slack between the processing deadline and the lease expiry, so acks land
/// before the lease is reclaimed.
const LEASE_SAFETY_SECS: i64 = 5;

/// Host waits shorter than this are absorbed inline by the fetcher; longer
/// ones hand the item back to the queue.
const INLINE_HOST_WAIT_SECS: i64 = 1;

pub(crate) async fn worker_loop(inner: Arc<EngineInner>, worker_id: String, cancel: CancelToken) {
    info!(worker = %worker_id, "worker started");
    let poll = inner.config.scheduler.poll_interval;
    let batch_size = inner.config.scheduler.lease_batch_size;
    let ttl = inner.config.scheduler.lease_ttl;
    let mut cancel_wait = cancel.clone();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let batch = match inner.index.lease(batch_size, &worker_id, ttl, Utc::now()).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(worker = %worker_id, error = %e, "lease failed");
                tokio::time::sleep(poll).await;
                continue;
            }
        };

        if batch.is_empty() {
            tokio::select! {
                _ = cancel_wait.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
            continue;
        }

        for reference in batch {
            if cancel.is_cancelled() {
                // Clean unwind: untouched items go straight back to ready.
                let now = Utc::now();
                if let Err(e) = inner.index.release(&reference.id, now, now).await {
                    warn!(reference = %reference.id, error = %e, "release on cancel failed");
                }
                continue;
            }

            let id = reference.id.clone();
            let run = std::panic::AssertUnwindSafe(process_one(&inner, reference, &cancel))
                .catch_unwind()
                .await;
            if run.is_err() {
                // A panic must not poison the queue: the lease expires and
                // the maintenance loop reclaims the item.
                error!(worker = %worker_id, reference = %id, "processing panicked; lease left to expire");
            }
        }
    }

    info!(worker = %worker_id, "worker stopped");
}

/// Periodic queue upkeep: move due retries back to ready, reclaim lost
/// leases, keep the advisory lock heartbeat fresh.
pub(crate) async fn maintenance_loop(inner: Arc<EngineInner>, cancel: CancelToken) {
    let mut cancel_wait = cancel.clone();
    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel_wait.cancelled() => break,
            _ = tokio::time::sleep(inner.config.scheduler.poll_interval) => {}
        }
        ticks += 1;
        let now = Utc::now();
        if let Err(e) = inner.index.promote_due(now).await {
            warn!(error = %e, "retry promotion failed");
        }
        if let Err(e) = inner.index.reclaim_expired(now).await {
            warn!(error = %e, "lease reclaim failed");
        }
        if ticks % 30 == 0 {
            if let Err(e) = inner.index.heartbeat(now).await {
                warn!(error = %e, "lock heartbeat failed");
            }
        }
    }
}

async fn process_one(inner: &Arc<EngineInner>, reference: Reference, cancel: &CancelToken) {
    let id = reference.id.clone();
    if let Err(e) = run_pipeline(inner, reference, cancel).await {
        // Internal fault: log with the reference for correlation, release the
        // lease, leave the record untouched for a safe retry.
        warn!(reference = %id, error = %e, "internal fault; releasing lease");
        let retry_at = Utc::now()
            + ChronoDuration::from_std(inner.config.scheduler.backoff_base)
                .unwrap_or_else(|_| ChronoDuration::seconds(30));
        if let Err(e) = inner.index.release(&id, retry_at, Utc::now()).await {
            error!(reference = %id, error = %e, "release after internal fault failed");
        }
    }
}

async fn run_pipeline(
    inner: &Arc<EngineInner>,
    reference: Reference,
    cancel: &CancelToken,
) -> Result<()> {
    let started = Instant::now();
    let scheduler = &inner.config.scheduler;
    let now = Utc::now();

    // Attempt budget exhausted: park without another fetch.
    if reference.attempts >= scheduler.max_attempts {
        let last = reference
            .last_attempt_outcome
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        inner
            .index
            .mark_dead_letter(
                &reference.id,
                FailureReason::MaxAttempts,
                &format!("{} attempts exhausted", reference.attempts),
                &last,
                false,
                diagnostic(reference.attempts, None, "max_attempts"),
                0,
                now,
            )
            .await?;
        info!(reference = %reference.id, attempts = reference.attempts, "dead-lettered: attempt budget");
        return Ok(());
    }

    // Per-reference wall-clock budget summed across attempts.
    if reference.spent_ms >= scheduler.time_budget.as_millis() as i64 {
        inner
            .index
            .mark_dead_letter(
                &reference.id,
                FailureReason::TimeBudget,
                &format!("{} ms spent across attempts", reference.spent_ms),
                "time_budget",
                false,
                diagnostic(reference.attempts, None, "time_budget"),
                0,
                now,
            )
            .await?;
        return Ok(());
    }

    // Tie-break: a host with no budget for a while gets its items back in the
    // queue at the earliest eligible instant instead of a sleeping worker.
    if let Some(eta) = inner.governor.next_available(&reference.host_key, now) {
        if (eta - now) > ChronoDuration::seconds(INLINE_HOST_WAIT_SECS) {
            inner.index.release(&reference.id, eta, now).await?;
            return Ok(());
        }
    }

    let lease_ttl = ChronoDuration::from_std(scheduler.lease_ttl)
        .unwrap_or_else(|_| ChronoDuration::seconds(120));
    let deadline = reference
        .lease_expires_at
        .unwrap_or(now + lease_ttl)
        - ChronoDuration::seconds(LEASE_SAFETY_SECS);

    let ctx = ResolveCtx {
        http: BoundedHttp::new(inner.fetcher.client(), inner.governor.clone()),
        search: inner.search.clone(),
        credentials: inner.credentials.clone(),
        cancel: cancel.clone(),
    };

    let mut stage = reference.stage;
    let mut locators: Vec<Locator> = inner.chain.resolve(&reference, &ctx).await;
    let mut bad_verdict: Option<Verdict> = None;

    loop {
        if cancel.is_cancelled() {
            let now = Utc::now();
            inner.index.release(&reference.id, now, now).await?;
            return Ok(());
        }

        let (outcome, notes) = inner
            .fetcher
            .fetch(&reference, &locators, cancel, deadline)
            .await;
        // The most recent attempt that actually observed something; trailing
        // "no snapshot held" notes are not the story.
        let note = notes
            .iter()
            .rev()
            .find(|n| n.status != "no_content")
            .or(notes.last())
            .cloned();
        let spent = started.elapsed().as_millis() as i64;
        let now = Utc::now();

        match outcome {
            FetchOutcome::Success(doc) => {
                advance(inner, &reference, &mut stage, Stage::Fetched).await?;

                let markdown = {
                    let bytes = doc.bytes.clone();
                    let content_type = doc.content_type.clone();
                    let final_url = doc.final_url.clone();
                    tokio::task::spawn_blocking(move || {
                        readability::extract_markdown(&bytes, content_type.as_deref(), &final_url)
                    })
                    .await
                    .map_err(|e| ScrivenerError::Storage(format!("markdown task: {e}")))?
                };

                advance(inner, &reference, &mut stage, Stage::Acquired).await?;

                let canonical_len = markdown
                    .as_ref()
                    .map(|m| m.len() as u64)
                    .unwrap_or(doc.bytes.len() as u64);
                let verdict = inner.verifier.verify(
                    reference.kind,
                    &reference.host_key,
                    markdown.as_deref(),
                    canonical_len,
                );

                if verdict.quality == Quality::Bad {
                    warn!(
                        reference = %reference.id,
                        locator = %doc.locator_url,
                        reasons = ?verdict.reasons,
                        "artifact failed verification; trying remaining transports"
                    );
                    locators.retain(|l| {
                        !(l.url == doc.locator_url && l.transport_hint == doc.locator_hint)
                    });
                    bad_verdict = Some(verdict);
                    continue;
                }

                advance(inner, &reference, &mut stage, Stage::Verified).await?;

                let committed = {
                    let content = inner.content.clone();
                    let reference_c = reference.clone();
                    let doc_c = doc.clone();
                    let markdown_c = markdown.clone();
                    let verdict_c = verdict.clone();
                    tokio::task::spawn_blocking(move || {
                        content.commit(&reference_c, &doc_c, markdown_c.as_deref(), &verdict_c, Utc::now())
                    })
                    .await
                    .map_err(|e| ScrivenerError::Storage(format!("commit task: {e}")))?
                    .map_err(|e| ScrivenerError::Storage(e.to_string()))?
                };

                advance(inner, &reference, &mut stage, Stage::Stored).await?;

                let mut final_hash = committed.content_hash.clone();
                let mut final_bytes = committed.byte_count;
                let mut final_words = verdict.word_count;
                let mut final_quality = verdict.quality;
                let mut final_reasons = verdict.reasons.clone();

                match inner.enrichment.enrich(&reference, &committed.path).await {
                    Ok(EnrichOutcome::Unchanged) => {}
                    Ok(EnrichOutcome::Replaced { markdown: replacement }) => {
                        let re_verdict = inner.verifier.verify(
                            reference.kind,
                            &reference.host_key,
                            Some(&replacement),
                            replacement.len() as u64,
                        );
                        if re_verdict.quality == Quality::Bad {
                            inner
                                .index
                                .mark_dead_letter(
                                    &reference.id,
                                    FailureReason::VerifierBad,
                                    &format!(
                                        "enriched content failed verification: {:?}",
                                        re_verdict.reasons
                                    ),
                                    FailureReason::VerifierBad.as_str(),
                                    true,
                                    diagnostic(reference.attempts + 1, note.as_ref(), "verifier_bad"),
                                    spent,
                                    now,
                                )
                                .await?;
                            return Ok(());
                        }
                        final_hash = {
                            let content = inner.content.clone();
                            let path = committed.path.clone();
                            let replacement_c = replacement.clone();
                            tokio::task::spawn_blocking(move || {
                                content.replace_markdown(&path, &replacement_c)
                            })
                            .await
                            .map_err(|e| ScrivenerError::Storage(format!("replace task: {e}")))?
                            .map_err(|e| ScrivenerError::Storage(e.to_string()))?
                        };
                        final_bytes = replacement.len() as u64;
                        final_words = re_verdict.word_count;
                        final_quality = re_verdict.quality;
                        final_reasons = re_verdict.reasons;
                    }
                    Ok(EnrichOutcome::Deferred) => {
                        info!(reference = %reference.id, "enrichment continuing out-of-band");
                        inner.index.clear_lease(&reference.id, now).await?;
                        return Ok(());
                    }
                    Err(e) => {
                        let delay = backoff_delay(scheduler, reference.attempts);
                        inner
                            .index
                            .mark_retry(
                                &reference.id,
                                stage.failure_mark(),
                                now + chrono_delay(delay),
                                true,
                                FailureReason::Internal,
                                &format!("enrichment hook failed: {e}"),
                                diagnostic(reference.attempts + 1, note.as_ref(), "enrich_failed"),
                                spent,
                                now,
                            )
                            .await?;
                        return Ok(());
                    }
                }

                advance(inner, &reference, &mut stage, Stage::Enriched).await?;

                let meta = ArtifactMeta {
                    reference_id: reference.id.clone(),
                    content_hash: final_hash,
                    byte_count: final_bytes,
                    word_count: final_words,
                    quality: final_quality,
                    quality_reasons: final_reasons,
                    obtained_via: doc.transport,
                    obtained_from: doc.obtained_from,
                    source_resolver: doc.source_resolver.clone(),
                    final_url: doc.final_url.clone(),
                    content_path: committed.path.clone(),
                    fetched_at: now,
                };

                if !inner.index.commit_artifact(&reference.id, &meta, spent, now).await? {
                    return Err(ScrivenerError::Database(format!(
                        "index refused commit for {}",
                        reference.id
                    )));
                }

                let _ = inner.committed_tx.send(CommittedArtifact {
                    reference_id: reference.id.clone(),
                    content_path: meta.content_path.clone(),
                    content_hash: meta.content_hash.clone(),
                });

                info!(
                    reference = %reference.id,
                    quality = final_quality.as_str(),
                    via = doc.transport.as_str(),
                    words = final_words,
                    "reference archived"
                );
                return Ok(());
            }
            FetchOutcome::Deferred { until } => {
                inner.index.release(&reference.id, until, now).await?;
                return Ok(());
            }
            FetchOutcome::RateLimited { retry_after } => {
                // A budget signal, not a fault: schedule exactly, no attempt.
                inner
                    .index
                    .mark_retry(
                        &reference.id,
                        Stage::RateLimited,
                        now + chrono_delay(retry_after),
                        false,
                        FailureReason::RateLimited,
                        &format!("server retry-after {}s", retry_after.as_secs()),
                        diagnostic(reference.attempts, note.as_ref(), "rate_limited"),
                        spent,
                        now,
                    )
                    .await?;
                return Ok(());
            }
            FetchOutcome::Transient { reason, detail } => {
                let delay = backoff_delay(scheduler, reference.attempts);
                inner
                    .index
                    .mark_retry(
                        &reference.id,
                        stage.failure_mark(),
                        now + chrono_delay(delay),
                        true,
                        reason,
                        &detail,
                        diagnostic(reference.attempts + 1, note.as_ref(), reason.as_str()),
                        spent,
                        now,
                    )
                    .await?;
                return Ok(());
            }
            FetchOutcome::Permanent { reason, detail } => {
                let (reason, detail) = match &bad_verdict {
                    Some(v) => (
                        FailureReason::VerifierBad,
                        format!("content failed verification on every transport: {:?}", v.reasons),
                    ),
                    None => (reason, detail),
                };
                inner
                    .index
                    .mark_dead_letter(
                        &reference.id,
                        reason,
                        &detail,
                        reason.as_str(),
                        true,
                        diagnostic(reference.attempts + 1, note.as_ref(), reason.as_str()),
                        spent,
                        now,
                    )
                    .await?;
                return Ok(());
            }
        }
    }
}

async fn advance(
    inner: &Arc<EngineInner>,
    reference: &Reference,
    stage: &mut Stage,
    to: Stage,
) -> Result<()> {
    // Re-entry after a verification retry can already be past this point.
    if stage.code() >= to.code() {
        return Ok(());
    }
    if !inner.index.transition(&reference.id, *stage, to, Utc::now()).await? {
        return Err(ScrivenerError::Database(format!(
            "lost stage transition {} -> {} for {}",
            stage, to, reference.id
        )));
    }
    *stage = to;
    Ok(())
}

fn diagnostic(attempt: i64, note: Option<&AttemptNote>, status: &str) -> AttemptDiagnostic {
    AttemptDiagnostic {
        attempt,
        resolver: note.map(|n| n.resolver.clone()),
        transport: note.map(|n| n.transport.as_str().to_string()),
        status: status.to_string(),
        at: Utc::now(),
    }
}

fn chrono_delay(delay: Duration) -> ChronoDuration {
    ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(60))
}
