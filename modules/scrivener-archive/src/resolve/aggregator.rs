// Mirror/aggregator lookup: transcript aggregators address episodes by show
// and episode slug.

use async_trait::async_trait;

use scrivener_common::{slugify, Locator, Reference, ReferenceKind, TransportHint};

use super::{ResolveCtx, ResolveOutcome, Resolver, ResolverDescriptor};

pub struct AggregatorResolver {
    /// URL templates with `{show}` and `{episode}` slots.
    templates: Vec<String>,
}

impl AggregatorResolver {
    pub fn new(templates: Vec<String>) -> Self {
        Self { templates }
    }
}

#[async_trait]
impl Resolver for AggregatorResolver {
    fn descriptor(&self) -> ResolverDescriptor {
        ResolverDescriptor {
            name: "aggregator",
            priority: 20,
            auth_required: false,
        }
    }

    fn applicable(&self, kind: ReferenceKind, _host: &str) -> bool {
        !self.templates.is_empty() && matches!(kind, ReferenceKind::PodcastEpisode)
    }

    async fn locate(&self, reference: &Reference, _ctx: &ResolveCtx) -> ResolveOutcome {
        let metadata = match &reference.metadata {
            Some(m) => m,
            None => return ResolveOutcome::NotApplicable,
        };
        let show = metadata.get("podcast_name").and_then(|v| v.as_str());
        let episode = metadata.get("episode_title").and_then(|v| v.as_str());
        let (show, episode) = match (show, episode) {
            (Some(s), Some(e)) => (slugify(s), slugify(e)),
            _ => return ResolveOutcome::NotApplicable,
        };
        if show.is_empty() || episode.is_empty() {
            return ResolveOutcome::NotApplicable;
        }

        let locators = self
            .templates
            .iter()
            .map(|t| Locator {
                url: t.replace("{show}", &show).replace("{episode}", &episode),
                transport_hint: TransportHint::Mirror,
                source_resolver: "aggregator".to_string(),
                confidence: 0.4,
                auth_context: None,
            })
            .collect();
        ResolveOutcome::Located(locators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::tests_support::{ctx, reference};
    use serde_json::json;

    #[tokio::test]
    async fn builds_aggregator_urls_from_slugs() {
        let resolver = AggregatorResolver::new(vec![
            "https://transcripts.test/{show}/{episode}".to_string(),
        ]);
        let mut r = reference(ReferenceKind::PodcastEpisode, "https://pod.test/ep/9");
        r.metadata = Some(json!({
            "podcast_name": "The Daily Brief",
            "episode_title": "Episode 9: Housing, Explained!",
        }));

        match resolver.locate(&r, &ctx()).await {
            ResolveOutcome::Located(locators) => {
                assert_eq!(
                    locators[0].url,
                    "https://transcripts.test/the-daily-brief/episode-9-housing-explained"
                );
                assert_eq!(locators[0].transport_hint, TransportHint::Mirror);
            }
            _ => panic!("expected Located"),
        }
    }

    #[tokio::test]
    async fn missing_episode_identity_is_not_applicable() {
        let resolver = AggregatorResolver::new(vec!["https://t.test/{show}/{episode}".into()]);
        let mut r = reference(ReferenceKind::PodcastEpisode, "https://pod.test/ep/9");
        r.metadata = Some(json!({ "podcast_name": "Only The Show" }));
        assert!(matches!(
            resolver.locate(&r, &ctx()).await,
            ResolveOutcome::NotApplicable
        ));
    }
}
