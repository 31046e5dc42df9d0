// The resolver chain: pluggable strategies that propose locators for a
// reference. Resolver faults are isolated here and never propagate.

pub mod aggregator;
pub mod alternates;
pub mod feed_link;
pub mod known_source;
pub mod origin;
pub mod resurrect;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, warn};

use scrivener_common::{canonical, Locator, Reference, ReferenceKind};
use scrivener_governor::{Acquire, Governor, Observed};

use crate::cancel::CancelToken;
use crate::providers::{CredentialProvider, SearchProvider};

/// Registered strategy metadata. Lower priority runs earlier; name breaks
/// ties so chain order is stable.
#[derive(Debug, Clone)]
pub struct ResolverDescriptor {
    pub name: &'static str,
    pub priority: i32,
    pub auth_required: bool,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    fn descriptor(&self) -> ResolverDescriptor;
    fn applicable(&self, kind: ReferenceKind, host: &str) -> bool;
    async fn locate(&self, reference: &Reference, ctx: &ResolveCtx) -> ResolveOutcome;
}

pub enum ResolveOutcome {
    Located(Vec<Locator>),
    NotApplicable,
    Transient(String),
    Permanent(String),
}

/// Everything a resolver may touch. Side effects only through here.
pub struct ResolveCtx {
    pub http: BoundedHttp,
    pub search: Arc<dyn SearchProvider>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub cancel: CancelToken,
}

/// Small governor-honoring GET helper for resolvers. Short waits are slept
/// through; anything longer means no budget for this resolver right now.
#[derive(Clone)]
pub struct BoundedHttp {
    client: reqwest::Client,
    governor: Arc<Governor>,
}

/// Budget waits under this are slept inline; longer ones abort the call.
const INLINE_WAIT_CAP: Duration = Duration::from_secs(2);

impl BoundedHttp {
    pub fn new(client: reqwest::Client, governor: Arc<Governor>) -> Self {
        Self { client, governor }
    }

    /// GET a URL as text. Returns None when the host has no budget.
    pub async fn get_text(&self, url: &str) -> anyhow::Result<Option<String>> {
        let host = canonical::host_key(url);
        let permit = match self.governor.acquire(&host, Utc::now()) {
            Acquire::Proceed(p) => p,
            Acquire::WaitUntil(t) => {
                let wait = (t - Utc::now()).to_std().unwrap_or_default();
                if wait > INLINE_WAIT_CAP {
                    return Ok(None);
                }
                tokio::time::sleep(wait).await;
                match self.governor.acquire(&host, Utc::now()) {
                    Acquire::Proceed(p) => p,
                    _ => return Ok(None),
                }
            }
            Acquire::Blocked { .. } => return Ok(None),
        };

        let result = self.client.get(url).send().await;
        let outcome = match &result {
            Ok(resp) if resp.status().is_success() => Observed::Success,
            _ => Observed::Failure,
        };
        self.governor.report(&host, outcome, Utc::now());
        drop(permit);

        let resp = result?;
        if !resp.status().is_success() {
            anyhow::bail!("{url}: status {}", resp.status());
        }
        Ok(Some(resp.text().await?))
    }
}

/// Ordered resolver chain with merge/dedup/cap semantics.
pub struct ResolverChain {
    resolvers: Vec<Arc<dyn Resolver>>,
    locator_cap: usize,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<Arc<dyn Resolver>>, locator_cap: usize) -> Self {
        Self {
            resolvers,
            locator_cap,
        }
    }

    /// Run every applicable resolver in (priority, name) order and merge
    /// their locators, first-seen wins, capped. Resolver panics and errors
    /// are logged and treated as transient: the chain continues.
    pub async fn resolve(&self, reference: &Reference, ctx: &ResolveCtx) -> Vec<Locator> {
        let host = reference.host_key.as_str();

        let mut eligible: Vec<&Arc<dyn Resolver>> = self
            .resolvers
            .iter()
            .filter(|r| r.applicable(reference.kind, host))
            .collect();
        eligible.sort_by(|a, b| {
            let da = a.descriptor();
            let db = b.descriptor();
            da.priority.cmp(&db.priority).then(da.name.cmp(db.name))
        });

        let mut seen = HashSet::new();
        let mut merged = Vec::new();

        for resolver in eligible {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let name = resolver.descriptor().name;

            let outcome = std::panic::AssertUnwindSafe(resolver.locate(reference, ctx))
                .catch_unwind()
                .await;

            match outcome {
                Ok(ResolveOutcome::Located(locators)) => {
                    debug!(resolver = name, count = locators.len(), "resolver yielded locators");
                    for locator in locators {
                        // Archive-hint locators reuse the origin URL, so the
                        // dedup key is the (url, transport) pair.
                        if seen.insert((locator.url.clone(), locator.transport_hint)) {
                            merged.push(locator);
                        }
                    }
                }
                Ok(ResolveOutcome::NotApplicable) => {}
                Ok(ResolveOutcome::Transient(detail)) => {
                    warn!(resolver = name, detail, "resolver transient failure, continuing");
                }
                Ok(ResolveOutcome::Permanent(detail)) => {
                    warn!(resolver = name, detail, "resolver permanent failure, continuing");
                }
                Err(_) => {
                    warn!(resolver = name, "resolver panicked; treated as transient");
                }
            }

            if merged.len() >= self.locator_cap {
                break;
            }
        }

        merged.truncate(self.locator_cap);
        merged
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use scrivener_common::{GovernorConfig, Stage};

    pub fn reference(kind: ReferenceKind, url: &str) -> Reference {
        let now = Utc::now();
        Reference {
            id: scrivener_common::ReferenceId::derive(kind, url),
            kind,
            source_url: url.to_string(),
            canonical_url: url.to_string(),
            host_key: canonical::host_key(url),
            content_hash: None,
            stage: Stage::Leased,
            processable: true,
            failure_reason: None,
            failure_detail: None,
            priority: 0,
            attempts: 0,
            spent_ms: 0,
            ready_at: now,
            last_attempt_outcome: None,
            lease_owner: None,
            lease_expires_at: None,
            duplicate_of: None,
            created_at: now,
            updated_at: now,
            metadata: None,
        }
    }

    pub fn ctx() -> ResolveCtx {
        ResolveCtx {
            http: BoundedHttp::new(
                reqwest::Client::new(),
                Arc::new(Governor::new(GovernorConfig::default())),
            ),
            search: Arc::new(crate::providers::NoSearch),
            credentials: Arc::new(crate::providers::NoCredentials),
            cancel: CancelToken::never(),
        }
    }
}
