// The canonical URL itself is always the first candidate.

use async_trait::async_trait;

use scrivener_common::{Locator, Reference, ReferenceKind, TransportHint};

use super::{ResolveCtx, ResolveOutcome, Resolver, ResolverDescriptor};

pub struct OriginResolver;

#[async_trait]
impl Resolver for OriginResolver {
    fn descriptor(&self) -> ResolverDescriptor {
        ResolverDescriptor {
            name: "origin",
            priority: 0,
            auth_required: false,
        }
    }

    fn applicable(&self, _kind: ReferenceKind, _host: &str) -> bool {
        true
    }

    async fn locate(&self, reference: &Reference, _ctx: &ResolveCtx) -> ResolveOutcome {
        ResolveOutcome::Located(vec![Locator {
            url: reference.canonical_url.clone(),
            transport_hint: TransportHint::Direct,
            source_resolver: "origin".to_string(),
            confidence: 1.0,
            auth_context: None,
        }])
    }
}
