// Collaborator seams. The engine treats all of these opaquely; defaults are
// no-ops so a bare engine still runs.

use async_trait::async_trait;

use scrivener_common::Reference;

/// Per-host cookies and request-header overlays, supplied by an external
/// credential provider. Must be thread-safe; refresh is the provider's
/// problem.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn overlay_for(&self, host_key: &str) -> Option<RequestOverlay>;
}

#[derive(Debug, Clone, Default)]
pub struct RequestOverlay {
    pub cookie: Option<String>,
    pub headers: Vec<(String, String)>,
}

pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn overlay_for(&self, _host_key: &str) -> Option<RequestOverlay> {
        None
    }
}

/// Web search collaborator used by the resurrection resolver.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<SearchHit>>;
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub url: String,
    pub title: Option<String>,
}

pub struct NoSearch;

#[async_trait]
impl SearchProvider for NoSearch {
    async fn search(&self, _query: &str, _limit: usize) -> anyhow::Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }
}

/// Post-acquisition enrichment (audio -> transcript and the like). Invoked
/// after storage commit, before finalization records the content hash.
#[async_trait]
pub trait EnrichmentHook: Send + Sync {
    async fn enrich(
        &self,
        reference: &Reference,
        artifact_dir: &std::path::Path,
    ) -> anyhow::Result<EnrichOutcome>;
}

#[derive(Debug, Clone)]
pub enum EnrichOutcome {
    /// Nothing to do for this kind.
    Unchanged,
    /// Replace the cleaned markdown before the hash is recorded.
    Replaced { markdown: String },
    /// The hook runs out-of-band and will resubmit a completion event.
    Deferred,
}

pub struct NoEnrichment;

#[async_trait]
impl EnrichmentHook for NoEnrichment {
    async fn enrich(
        &self,
        _reference: &Reference,
        _artifact_dir: &std::path::Path,
    ) -> anyhow::Result<EnrichOutcome> {
        Ok(EnrichOutcome::Unchanged)
    }
}
