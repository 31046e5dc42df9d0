// Engine construction, lifecycle, and the operational boundary handed to
// collaborators: enqueue, observe, the change stream, and shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use headless_client::HeadlessClient;
use scrivener_archive::{
    default_resolvers, CancelToken, ContentStore, CredentialProvider, EnrichmentHook,
    NoCredentials, NoEnrichment, NoSearch, QualityVerifier, Resolver, ResolverChain,
    RobustFetcher, SearchProvider,
};
use scrivener_common::{
    canonical, AdmissionPolicy, ArtifactMeta, AttemptDiagnostic, CommittedArtifact, EngineConfig,
    EnqueueOutcome, EnqueueRequest, FailureReason, ObtainedFrom, Quality, Reference, ReferenceId,
    RejectReason, Result, ScrivenerError, Stage, Transport,
};
use scrivener_governor::Governor;
use scrivener_index::{IndexStore, NewReference, UpsertOutcome};

use crate::worker::{maintenance_loop, worker_loop};

/// Pause between admission re-checks while enqueue blocks on backpressure.
const ADMISSION_POLL: Duration = Duration::from_millis(100);

/// External collaborators wired in at construction. Defaults are inert, so a
/// bare engine archives plain pages without any of them.
pub struct Collaborators {
    /// Extra resolvers merged into the stock chain.
    pub resolvers: Vec<Arc<dyn Resolver>>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub search: Arc<dyn SearchProvider>,
    pub enrichment: Arc<dyn EnrichmentHook>,
    pub renderer: Option<HeadlessClient>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            resolvers: Vec::new(),
            credentials: Arc::new(NoCredentials),
            search: Arc::new(NoSearch),
            enrichment: Arc::new(NoEnrichment),
            renderer: None,
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) index: IndexStore,
    pub(crate) content: ContentStore,
    pub(crate) governor: Arc<Governor>,
    pub(crate) fetcher: RobustFetcher,
    pub(crate) chain: ResolverChain,
    pub(crate) verifier: Arc<QualityVerifier>,
    pub(crate) enrichment: Arc<dyn EnrichmentHook>,
    pub(crate) search: Arc<dyn SearchProvider>,
    pub(crate) credentials: Arc<dyn CredentialProvider>,
    pub(crate) committed_tx: broadcast::Sender<CommittedArtifact>,
}

pub struct Engine {
    inner: Arc<EngineInner>,
    cancel_tx: watch::Sender<bool>,
    cancel_token: CancelToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Open stores, run crash recovery, and wire the components together.
    /// Refuses to start if another process holds the index advisory lock.
    pub async fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Engine> {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let owner = format!("scrivener-{}-{nonce:x}", std::process::id());
        let lock_stale = config.scheduler.lease_ttl * 2;
        let index = IndexStore::open(&config.index, owner, lock_stale).await?;

        let content = ContentStore::new(&config.storage.root)
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        // Crash recovery: delete artifact directories that never reached the
        // sentinel, then return orphaned in-flight references to ready.
        let swept = content
            .recover()
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;
        let recovered = index.recover_orphans(Utc::now()).await?;
        if swept > 0 || recovered > 0 {
            info!(swept, recovered, "crash recovery complete");
        }

        let governor = Arc::new(Governor::new(config.governor.clone()));
        let verifier = Arc::new(QualityVerifier::new(&config.quality));
        let fetcher = RobustFetcher::new(
            config.fetcher.clone(),
            config.ssrf.clone(),
            governor.clone(),
            collaborators.credentials.clone(),
            collaborators.renderer,
            verifier.clone(),
        );
        let chain = ResolverChain::new(
            default_resolvers(&config.resolver, collaborators.resolvers),
            config.fetcher.locator_cap,
        );
        let (committed_tx, _) = broadcast::channel(256);
        let (cancel_tx, cancel_token) = CancelToken::new();

        let inner = Arc::new(EngineInner {
            config,
            index,
            content,
            governor,
            fetcher,
            chain,
            verifier,
            enrichment: collaborators.enrichment,
            search: collaborators.search,
            credentials: collaborators.credentials,
            committed_tx,
        });

        Ok(Engine {
            inner,
            cancel_tx,
            cancel_token,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the maintenance task and the worker pool. Idempotent.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(maintenance_loop(
            self.inner.clone(),
            self.cancel_token.clone(),
        )));
        for i in 0..self.inner.config.scheduler.workers {
            tasks.push(tokio::spawn(worker_loop(
                self.inner.clone(),
                format!("worker-{i}"),
                self.cancel_token.clone(),
            )));
        }
        info!(workers = self.inner.config.scheduler.workers, "engine started");
    }

    /// Signal cancellation, wait up to `grace` for workers to unwind, then
    /// abort stragglers (their leases are reclaimed by TTL) and drop the
    /// advisory lock.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.cancel_tx.send(true);

        let mut tasks = self.tasks.lock().await;
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let drain = futures::future::join_all(tasks.drain(..));
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("grace period elapsed; aborting workers, leases reclaim by TTL");
            for abort in aborts {
                abort.abort();
            }
        }

        if let Err(e) = self.inner.index.release_lock().await {
            warn!(error = %e, "failed to release advisory lock");
        }
        info!("engine stopped");
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            inner: self.inner.clone(),
        }
    }
}

/// A reference plus everything the observe interface exposes about it. Never
/// carries raw bytes; artifact content is reachable through `content_path`.
#[derive(Debug, Clone)]
pub struct ObservedReference {
    pub reference: Reference,
    pub artifact: Option<ArtifactMeta>,
    pub attempts: Vec<AttemptDiagnostic>,
}

#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<EngineInner>,
}

impl EngineHandle {
    /// Submit a reference. Structural rejects never enter the queue.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<(ReferenceId, EnqueueOutcome)> {
        let trimmed = request.source_url.trim();
        let kind = request.kind;

        match url::Url::parse(trimmed) {
            Ok(parsed) if !matches!(parsed.scheme(), "http" | "https") => {
                return Ok((
                    ReferenceId::derive(kind, trimmed),
                    EnqueueOutcome::Rejected(RejectReason::DisallowedScheme),
                ));
            }
            Ok(parsed) if parsed.host_str().is_none() => {
                return Ok((
                    ReferenceId::derive(kind, trimmed),
                    EnqueueOutcome::Rejected(RejectReason::UnfetchableHost),
                ));
            }
            Ok(_) => {}
            Err(_) => {
                return Ok((
                    ReferenceId::derive(kind, trimmed),
                    EnqueueOutcome::Rejected(RejectReason::UnfetchableHost),
                ));
            }
        }

        let canonical_url = canonical::canonicalize(trimmed, &self.inner.config.canonical)?;
        let host_key = canonical::host_key(&canonical_url);
        let id = ReferenceId::derive(kind, &canonical_url);

        // Admission control.
        let scheduler = &self.inner.config.scheduler;
        let depth = self.inner.index.queue_depth().await?;
        if depth >= scheduler.high_water {
            match scheduler.admission {
                AdmissionPolicy::Reject => {
                    return Ok((id, EnqueueOutcome::Rejected(RejectReason::Backpressure)));
                }
                AdmissionPolicy::Block => loop {
                    tokio::time::sleep(ADMISSION_POLL).await;
                    if self.inner.index.queue_depth().await? <= scheduler.low_water {
                        break;
                    }
                },
            }
        }

        let outcome = self
            .inner
            .index
            .upsert_new(
                NewReference {
                    id: id.clone(),
                    kind,
                    source_url: trimmed.to_string(),
                    canonical_url,
                    host_key,
                    priority: request.priority,
                    metadata: request.metadata,
                },
                Utc::now(),
            )
            .await?;

        let outcome = match outcome {
            UpsertOutcome::Inserted => EnqueueOutcome::EnqueuedNew,
            UpsertOutcome::Rearmed => EnqueueOutcome::EnqueuedRetry,
            UpsertOutcome::Duplicate(existing) => EnqueueOutcome::DuplicateOf(existing),
        };
        Ok((id, outcome))
    }

    pub async fn get(&self, id: &ReferenceId) -> Result<Option<ObservedReference>> {
        let reference = match self.inner.index.get(id).await? {
            Some(r) => r,
            None => return Ok(None),
        };
        let artifact = self.inner.index.artifact_meta(id).await?;
        let attempts = self.inner.index.attempt_log(id).await?;
        Ok(Some(ObservedReference {
            reference,
            artifact,
            attempts,
        }))
    }

    pub async fn list_by_stage(&self, stage: Stage, limit: i64) -> Result<Vec<Reference>> {
        self.inner.index.list_by_stage(stage, limit).await
    }

    pub async fn list_by_host(&self, host_key: &str, limit: i64) -> Result<Vec<Reference>> {
        self.inner.index.list_by_host(host_key, limit).await
    }

    /// Dead-letter entries with their attempt diagnostics for forensic replay.
    pub async fn list_dead_letter(&self, limit: i64) -> Result<Vec<ObservedReference>> {
        let parked = self.inner.index.list_dead_letter(limit).await?;
        let mut out = Vec::with_capacity(parked.len());
        for reference in parked {
            let attempts = self.inner.index.attempt_log(&reference.id).await?;
            out.push(ObservedReference {
                reference,
                artifact: None,
                attempts,
            });
        }
        Ok(out)
    }

    pub async fn query_ready(&self, limit: i64) -> Result<Vec<Reference>> {
        self.inner.index.query_ready(limit, Utc::now()).await
    }

    pub async fn queue_depth(&self) -> Result<i64> {
        self.inner.index.queue_depth().await
    }

    /// Operator action: move a dead-letter reference back to pending.
    pub async fn resurrect(&self, id: &ReferenceId) -> Result<bool> {
        self.inner.index.resurrect(id, Utc::now()).await
    }

    /// Change stream of terminal-good commits. Replay-tolerant: consumers
    /// must be idempotent by content hash.
    pub fn subscribe(&self) -> broadcast::Receiver<CommittedArtifact> {
        self.inner.committed_tx.subscribe()
    }

    /// Completion event from an asynchronous enrichment hook. Verifies the
    /// (possibly replaced) content, records the hash, and finalizes.
    pub async fn complete_enrichment(
        &self,
        id: &ReferenceId,
        artifact_dir: &Path,
        markdown: Option<String>,
    ) -> Result<bool> {
        let reference = match self.inner.index.get(id).await? {
            Some(r) => r,
            None => return Ok(false),
        };
        if reference.stage != Stage::Stored {
            warn!(reference = %id, stage = %reference.stage, "enrichment completion for wrong stage");
            return Ok(false);
        }

        if let Some(md) = &markdown {
            let content = self.inner.content.clone();
            let path = artifact_dir.to_path_buf();
            let md = md.clone();
            tokio::task::spawn_blocking(move || content.replace_markdown(&path, &md))
                .await
                .map_err(|e| ScrivenerError::Storage(format!("replace task: {e}")))?
                .map_err(|e| ScrivenerError::Storage(e.to_string()))?;
        }

        let content = self.inner.content.clone();
        let path = artifact_dir.to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || content.canonical_bytes(&path))
            .await
            .map_err(|e| ScrivenerError::Storage(format!("read task: {e}")))?
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        let text = String::from_utf8_lossy(&bytes).into_owned();
        let verdict = self.inner.verifier.verify(
            reference.kind,
            &reference.host_key,
            Some(&text),
            bytes.len() as u64,
        );
        let now = Utc::now();

        if verdict.quality == Quality::Bad {
            self.inner
                .index
                .mark_dead_letter(
                    id,
                    FailureReason::VerifierBad,
                    &format!("enriched content failed verification: {:?}", verdict.reasons),
                    FailureReason::VerifierBad.as_str(),
                    true,
                    AttemptDiagnostic {
                        attempt: reference.attempts + 1,
                        resolver: None,
                        transport: None,
                        status: "verifier_bad".to_string(),
                        at: now,
                    },
                    0,
                    now,
                )
                .await?;
            return Ok(false);
        }

        // The sidecar holds how the bytes were obtained.
        let sidecar_path = artifact_dir.join("metadata.json");
        let sidecar: serde_json::Value = tokio::task::spawn_blocking(move || {
            std::fs::read_to_string(sidecar_path)
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default()
        })
        .await
        .map_err(|e| ScrivenerError::Storage(format!("sidecar task: {e}")))?;

        if !self.inner.index.transition(id, Stage::Stored, Stage::Enriched, now).await? {
            return Ok(false);
        }

        let meta = ArtifactMeta {
            reference_id: id.clone(),
            content_hash: scrivener_common::content_hash(&bytes),
            byte_count: bytes.len() as u64,
            word_count: verdict.word_count,
            quality: verdict.quality,
            quality_reasons: verdict.reasons,
            obtained_via: sidecar
                .get("obtained_via")
                .and_then(|v| v.as_str())
                .and_then(Transport::parse)
                .unwrap_or(Transport::DirectHttp),
            obtained_from: sidecar
                .get("obtained_from")
                .and_then(|v| v.as_str())
                .and_then(ObtainedFrom::parse)
                .unwrap_or(ObtainedFrom::Origin),
            source_resolver: sidecar
                .get("source_resolver")
                .and_then(|v| v.as_str())
                .unwrap_or("origin")
                .to_string(),
            final_url: sidecar
                .get("final_url")
                .and_then(|v| v.as_str())
                .unwrap_or(reference.canonical_url.as_str())
                .to_string(),
            content_path: artifact_dir.to_path_buf(),
            fetched_at: now,
        };

        if !self.inner.index.commit_artifact(id, &meta, 0, now).await? {
            return Ok(false);
        }

        let _ = self.inner.committed_tx.send(CommittedArtifact {
            reference_id: id.clone(),
            content_path: meta.content_path.clone(),
            content_hash: meta.content_hash.clone(),
        });
        info!(reference = %id, "enrichment completed and finalized");
        Ok(true)
    }
}
