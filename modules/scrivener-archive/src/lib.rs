pub mod cancel;
pub mod content_store;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod providers;
pub mod readability;
pub mod resolve;
pub mod verify;

pub use cancel::CancelToken;
pub use content_store::{CommittedDir, ContentStore};
pub use error::{ArchiveError, Result};
pub use fetch::{AttemptNote, FetchOutcome, FetchedDocument, RobustFetcher};
pub use providers::{
    CredentialProvider, EnrichOutcome, EnrichmentHook, NoCredentials, NoEnrichment, NoSearch,
    RequestOverlay, SearchHit, SearchProvider,
};
pub use resolve::{
    BoundedHttp, ResolveCtx, ResolveOutcome, Resolver, ResolverChain, ResolverDescriptor,
};
pub use verify::{QualityVerifier, Verdict};

use std::sync::Arc;

use scrivener_common::ResolverConfig;

/// Build the stock resolver chain: origin, known-source rewrites, feed links,
/// aggregators, archive alternates, and search resurrection, in that order.
/// Caller-supplied resolvers are merged in and sorted by their own priority.
pub fn default_resolvers(
    config: &ResolverConfig,
    extra: Vec<Arc<dyn Resolver>>,
) -> Vec<Arc<dyn Resolver>> {
    let mut resolvers: Vec<Arc<dyn Resolver>> = vec![
        Arc::new(resolve::origin::OriginResolver),
        Arc::new(resolve::known_source::KnownSourceResolver::new(
            config.known_hosts.clone(),
        )),
        Arc::new(resolve::feed_link::FeedLinkResolver),
        Arc::new(resolve::aggregator::AggregatorResolver::new(
            config.aggregator_templates.clone(),
        )),
        Arc::new(resolve::alternates::TransportAlternatesResolver),
        Arc::new(resolve::resurrect::ResurrectResolver),
    ];
    resolvers.extend(extra);
    resolvers
}
