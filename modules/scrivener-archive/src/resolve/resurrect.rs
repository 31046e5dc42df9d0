// URL resurrection: derive a title from the dead URL's slug and ask the web
// search collaborator for living copies.

use async_trait::async_trait;
use url::Url;

use scrivener_common::{Locator, Reference, ReferenceKind, TransportHint};

use super::{ResolveCtx, ResolveOutcome, Resolver, ResolverDescriptor};

const MAX_CANDIDATES: usize = 3;

/// Slug segments shorter than this carry no searchable signal.
const MIN_QUERY_WORDS: usize = 3;

pub struct ResurrectResolver;

#[async_trait]
impl Resolver for ResurrectResolver {
    fn descriptor(&self) -> ResolverDescriptor {
        ResolverDescriptor {
            name: "resurrect",
            priority: 90,
            auth_required: false,
        }
    }

    fn applicable(&self, kind: ReferenceKind, _host: &str) -> bool {
        !matches!(kind, ReferenceKind::Document)
    }

    async fn locate(&self, reference: &Reference, ctx: &ResolveCtx) -> ResolveOutcome {
        let query = match query_from_url(&reference.canonical_url) {
            Some(q) => q,
            None => return ResolveOutcome::NotApplicable,
        };

        let hits = match ctx.search.search(&query, MAX_CANDIDATES).await {
            Ok(hits) => hits,
            Err(e) => return ResolveOutcome::Transient(format!("search failed: {e}")),
        };

        let locators: Vec<Locator> = hits
            .into_iter()
            .filter(|h| h.url != reference.canonical_url)
            .take(MAX_CANDIDATES)
            .map(|h| Locator {
                url: h.url,
                transport_hint: TransportHint::Direct,
                source_resolver: "resurrect".to_string(),
                confidence: 0.3,
                auth_context: None,
            })
            .collect();

        if locators.is_empty() {
            ResolveOutcome::NotApplicable
        } else {
            ResolveOutcome::Located(locators)
        }
    }
}

/// "https://example.com/2026/05/the-housing-vote-explained" ->
/// "the housing vote explained"
fn query_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let slug = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()?;
    let words: Vec<&str> = slug
        .trim_end_matches(".html")
        .split(|c: char| c == '-' || c == '_')
        .filter(|w| !w.is_empty() && w.chars().any(|c| c.is_alphabetic()))
        .collect();
    if words.len() < MIN_QUERY_WORDS {
        return None;
    }
    Some(words.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{SearchHit, SearchProvider};
    use crate::resolve::tests_support::{ctx, reference};
    use std::sync::Arc;

    struct FixedSearch(Vec<&'static str>);

    #[async_trait]
    impl SearchProvider for FixedSearch {
        async fn search(&self, _query: &str, _limit: usize) -> anyhow::Result<Vec<SearchHit>> {
            Ok(self
                .0
                .iter()
                .map(|u| SearchHit {
                    url: u.to_string(),
                    title: None,
                })
                .collect())
        }
    }

    #[test]
    fn derives_query_from_slug() {
        assert_eq!(
            query_from_url("https://example.com/2026/05/the-housing-vote-explained"),
            Some("the housing vote explained".to_string())
        );
        // Numeric-only or short slugs have nothing to search for.
        assert_eq!(query_from_url("https://example.com/p/48211"), None);
        assert_eq!(query_from_url("https://example.com/about"), None);
    }

    #[tokio::test]
    async fn yields_alternate_candidates() {
        let mut context = ctx();
        context.search = Arc::new(FixedSearch(vec![
            "https://mirror.test/the-housing-vote-explained",
            "https://example.com/2026/05/the-housing-vote-explained",
        ]));

        let r = reference(
            ReferenceKind::Article,
            "https://example.com/2026/05/the-housing-vote-explained",
        );
        match ResurrectResolver.locate(&r, &context).await {
            ResolveOutcome::Located(locators) => {
                // The original URL is filtered out of its own resurrection.
                assert_eq!(locators.len(), 1);
                assert_eq!(locators[0].url, "https://mirror.test/the-housing-vote-explained");
            }
            _ => panic!("expected Located"),
        }
    }

    #[tokio::test]
    async fn search_error_is_transient() {
        struct FailingSearch;
        #[async_trait]
        impl SearchProvider for FailingSearch {
            async fn search(&self, _q: &str, _l: usize) -> anyhow::Result<Vec<SearchHit>> {
                anyhow::bail!("search quota exhausted")
            }
        }

        let mut context = ctx();
        context.search = Arc::new(FailingSearch);
        let r = reference(
            ReferenceKind::Article,
            "https://example.com/some-long-story-title",
        );
        assert!(matches!(
            ResurrectResolver.locate(&r, &context).await,
            ResolveOutcome::Transient(_)
        ));
    }
}
