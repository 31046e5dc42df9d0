// Per-host rule table yielding a direct content URL (text-only mirrors,
// print endpoints, and other known rewrites).

use std::collections::HashMap;

use async_trait::async_trait;
use url::Url;

use scrivener_common::{Locator, Reference, ReferenceKind, TransportHint};

use super::{ResolveCtx, ResolveOutcome, Resolver, ResolverDescriptor};

pub struct KnownSourceResolver {
    /// host -> URL template; `{path}` expands to the canonical URL's path.
    rules: HashMap<String, String>,
}

impl KnownSourceResolver {
    pub fn new(rules: HashMap<String, String>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl Resolver for KnownSourceResolver {
    fn descriptor(&self) -> ResolverDescriptor {
        ResolverDescriptor {
            name: "known_source",
            priority: 5,
            auth_required: false,
        }
    }

    fn applicable(&self, _kind: ReferenceKind, host: &str) -> bool {
        self.rules.contains_key(host)
    }

    async fn locate(&self, reference: &Reference, _ctx: &ResolveCtx) -> ResolveOutcome {
        let template = match self.rules.get(&reference.host_key) {
            Some(t) => t,
            None => return ResolveOutcome::NotApplicable,
        };
        let path = match Url::parse(&reference.canonical_url) {
            Ok(u) => u.path().to_string(),
            Err(e) => return ResolveOutcome::Permanent(format!("unparseable canonical: {e}")),
        };

        ResolveOutcome::Located(vec![Locator {
            url: template.replace("{path}", &path),
            transport_hint: TransportHint::Direct,
            source_resolver: "known_source".to_string(),
            confidence: 0.9,
            auth_context: None,
        }])
    }
}
