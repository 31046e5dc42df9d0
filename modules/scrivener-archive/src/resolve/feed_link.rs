// Feed-associated links: a podcast episode's transcript page is often linked
// from the feed's description or show notes.

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

use scrivener_common::{Locator, Reference, ReferenceKind, TransportHint};

use super::{ResolveCtx, ResolveOutcome, Resolver, ResolverDescriptor};

static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href\s*=\s*["']([^"']+)["']"#).expect("valid href regex"));

/// Show-notes links worth trying must look transcript-ish.
const LINK_MARKERS: &[&str] = &["transcript", "show-notes", "shownotes", "episode"];

const MAX_LINKS: usize = 3;

pub struct FeedLinkResolver;

#[async_trait]
impl Resolver for FeedLinkResolver {
    fn descriptor(&self) -> ResolverDescriptor {
        ResolverDescriptor {
            name: "feed_link",
            priority: 10,
            auth_required: false,
        }
    }

    fn applicable(&self, kind: ReferenceKind, _host: &str) -> bool {
        matches!(kind, ReferenceKind::PodcastEpisode)
    }

    async fn locate(&self, reference: &Reference, _ctx: &ResolveCtx) -> ResolveOutcome {
        let metadata = match &reference.metadata {
            Some(m) => m,
            None => return ResolveOutcome::NotApplicable,
        };

        let mut locators = Vec::new();

        // An explicit transcript URL from the feed wins outright.
        if let Some(url) = metadata.get("transcript_url").and_then(|v| v.as_str()) {
            locators.push(locator(url, 0.9));
        }

        for field in ["show_notes_html", "feed_description"] {
            let html = match metadata.get(field).and_then(|v| v.as_str()) {
                Some(h) => h,
                None => continue,
            };
            for cap in HREF_RE.captures_iter(html) {
                let href = &cap[1];
                if !href.starts_with("http") {
                    continue;
                }
                let lower = href.to_lowercase();
                if LINK_MARKERS.iter().any(|m| lower.contains(m)) {
                    locators.push(locator(href, 0.7));
                    if locators.len() >= MAX_LINKS {
                        break;
                    }
                }
            }
        }

        if locators.is_empty() {
            ResolveOutcome::NotApplicable
        } else {
            ResolveOutcome::Located(locators)
        }
    }
}

fn locator(url: &str, confidence: f64) -> Locator {
    Locator {
        url: url.to_string(),
        transport_hint: TransportHint::Direct,
        source_resolver: "feed_link".to_string(),
        confidence,
        auth_context: None,
    }
}
