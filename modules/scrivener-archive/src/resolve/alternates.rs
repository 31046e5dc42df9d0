// Transport alternates: point the fetcher at archive services for URLs the
// origin refuses to serve (paywalls, takedowns, rot).

use async_trait::async_trait;

use scrivener_common::{Locator, Reference, ReferenceKind, TransportHint};

use super::{ResolveCtx, ResolveOutcome, Resolver, ResolverDescriptor};

pub struct TransportAlternatesResolver;

#[async_trait]
impl Resolver for TransportAlternatesResolver {
    fn descriptor(&self) -> ResolverDescriptor {
        ResolverDescriptor {
            name: "transport_alternates",
            priority: 50,
            auth_required: false,
        }
    }

    fn applicable(&self, kind: ReferenceKind, _host: &str) -> bool {
        // Archive services only hold page snapshots; raw documents and
        // enclosures are not there.
        !matches!(kind, ReferenceKind::Document)
    }

    async fn locate(&self, reference: &Reference, _ctx: &ResolveCtx) -> ResolveOutcome {
        // The locator carries the original URL; the archive transports derive
        // their own snapshot lookups from it.
        ResolveOutcome::Located(vec![Locator {
            url: reference.canonical_url.clone(),
            transport_hint: TransportHint::Archive,
            source_resolver: "transport_alternates".to_string(),
            confidence: 0.5,
            auth_context: None,
        }])
    }
}
