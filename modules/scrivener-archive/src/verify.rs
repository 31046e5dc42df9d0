// Deterministic artifact quality classification.

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use tracing::warn;

use scrivener_common::{word_count, Quality, QualityConfig, QualityReason, ReferenceKind};

/// A paragraph must reach this many characters to count as non-trivial.
const PARAGRAPH_FLOOR: usize = 80;

/// Below this word count a global soft-404 pattern match is trusted.
const SOFT404_WORD_CEILING: u64 = 100;

#[derive(Debug, Clone)]
pub struct Verdict {
    pub quality: Quality,
    pub reasons: Vec<QualityReason>,
    pub word_count: u64,
    pub byte_count: u64,
}

pub struct QualityVerifier {
    min_bytes: u64,
    min_words_article: u64,
    min_words_transcript: u64,
    js_block_word_exemption: u64,
    paywall: Vec<Regex>,
    js_block: Vec<Regex>,
    soft404_global: Vec<Regex>,
    soft404_host: HashMap<String, Vec<Regex>>,
}

impl QualityVerifier {
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            min_bytes: config.min_bytes,
            min_words_article: config.min_words_article,
            min_words_transcript: config.min_words_transcript,
            js_block_word_exemption: config.js_block_word_exemption,
            paywall: compile(&config.paywall_patterns),
            js_block: compile(&config.js_block_patterns),
            soft404_global: compile(&config.soft404_patterns),
            soft404_host: config
                .soft404_host_patterns
                .iter()
                .map(|(host, patterns)| (host.clone(), compile(patterns)))
                .collect(),
        }
    }

    /// Classify an artifact. `markdown` is the cleaned text rendition when one
    /// exists; raw-only artifacts (binary documents) are judged on size alone.
    pub fn verify(
        &self,
        kind: ReferenceKind,
        host: &str,
        markdown: Option<&str>,
        byte_count: u64,
    ) -> Verdict {
        let mut reasons = Vec::new();
        let words = markdown.map(word_count).unwrap_or(0);

        if byte_count < self.min_bytes {
            reasons.push(QualityReason::TooSmall);
        }

        if let Some(text) = markdown {
            let floor = self.word_floor(kind);
            if words < floor {
                reasons.push(QualityReason::Thin);
            }

            let paywall_hits = self.paywall.iter().filter(|re| re.is_match(text)).count();
            if paywall_hits >= 2 {
                reasons.push(QualityReason::Paywall);
            } else if paywall_hits == 1 {
                reasons.push(QualityReason::PaywallHint);
            }

            if let Some(host_patterns) = self.soft404_host.get(host) {
                if host_patterns.iter().any(|re| re.is_match(text)) {
                    reasons.push(QualityReason::Soft404);
                }
            }

            if words <= self.js_block_word_exemption
                && self.js_block.iter().any(|re| re.is_match(text))
            {
                reasons.push(QualityReason::JsBlocked);
            }

            if !text
                .split("\n\n")
                .any(|p| p.trim().chars().count() >= PARAGRAPH_FLOOR)
            {
                reasons.push(QualityReason::NoParagraphs);
            }
        }

        let quality = if reasons.iter().any(|r| {
            matches!(
                r,
                QualityReason::TooSmall
                    | QualityReason::Thin
                    | QualityReason::Paywall
                    | QualityReason::Soft404
                    | QualityReason::JsBlocked
                    | QualityReason::NoParagraphs
            )
        }) {
            Quality::Bad
        } else if reasons.contains(&QualityReason::PaywallHint) {
            Quality::Marginal
        } else {
            Quality::Good
        };

        Verdict {
            quality,
            reasons,
            word_count: words,
            byte_count,
        }
    }

    /// Fetch-side heuristic for 200 responses that are really a placeholder:
    /// a host-specific pattern, or a global pattern on a near-empty body.
    pub fn looks_like_soft404(&self, host: &str, text: &str) -> bool {
        if let Some(host_patterns) = self.soft404_host.get(host) {
            if host_patterns.iter().any(|re| re.is_match(text)) {
                return true;
            }
        }
        word_count(text) < SOFT404_WORD_CEILING
            && self.soft404_global.iter().any(|re| re.is_match(text))
    }

    fn word_floor(&self, kind: ReferenceKind) -> u64 {
        match kind {
            ReferenceKind::PodcastEpisode => self.min_words_transcript,
            ReferenceKind::Article | ReferenceKind::Newsletter | ReferenceKind::GenericUrl => {
                self.min_words_article
            }
            ReferenceKind::Document => 0,
        }
    }
}

fn compile(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| {
            match RegexBuilder::new(p).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "skipping invalid quality pattern");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> QualityVerifier {
        QualityVerifier::new(&QualityConfig::default())
    }

    fn body(words: usize) -> String {
        let mut text = String::new();
        for i in 0..words {
            text.push_str("word ");
            if i % 60 == 59 {
                text.push_str("\n\n");
            }
        }
        text
    }

    #[test]
    fn clean_article_is_good() {
        let v = verifier().verify(
            ReferenceKind::Article,
            "example.com",
            Some(&body(1800)),
            12_000,
        );
        assert_eq!(v.quality, Quality::Good);
        assert!(v.reasons.is_empty());
        assert_eq!(v.word_count, 1800);
    }

    #[test]
    fn below_byte_floor_is_too_small() {
        let v = verifier().verify(ReferenceKind::Article, "example.com", Some(&body(150)), 300);
        assert_eq!(v.quality, Quality::Bad);
        assert!(v.reasons.contains(&QualityReason::TooSmall));
    }

    #[test]
    fn thin_article_rejected() {
        let v = verifier().verify(ReferenceKind::Article, "example.com", Some(&body(50)), 2_000);
        assert_eq!(v.quality, Quality::Bad);
        assert!(v.reasons.contains(&QualityReason::Thin));
    }

    #[test]
    fn transcript_floor_is_higher() {
        let text = body(300);
        let as_article = verifier().verify(ReferenceKind::Article, "x.test", Some(&text), 5_000);
        assert_eq!(as_article.quality, Quality::Good);
        let as_transcript =
            verifier().verify(ReferenceKind::PodcastEpisode, "x.test", Some(&text), 5_000);
        assert_eq!(as_transcript.quality, Quality::Bad);
        assert!(as_transcript.reasons.contains(&QualityReason::Thin));
    }

    #[test]
    fn one_paywall_signal_degrades_to_marginal() {
        let text = format!("{}\n\nSubscribe to continue reading our coverage.", body(400));
        let v = verifier().verify(ReferenceKind::Article, "paywalled.test", Some(&text), 4_000);
        assert_eq!(v.quality, Quality::Marginal);
        assert_eq!(v.reasons, vec![QualityReason::PaywallHint]);
    }

    #[test]
    fn two_paywall_signals_are_bad() {
        let text = format!(
            "{}\n\nSubscribe to continue. Already a subscriber? Sign in.",
            body(400)
        );
        let v = verifier().verify(ReferenceKind::Article, "paywalled.test", Some(&text), 4_000);
        assert_eq!(v.quality, Quality::Bad);
        assert!(v.reasons.contains(&QualityReason::Paywall));
    }

    #[test]
    fn js_block_boundary_at_exemption() {
        let signature = "\n\nPlease enable JavaScript to view this site.";

        let below = format!("{}{signature}", body(4_970));
        let v = verifier().verify(ReferenceKind::Article, "app.test", Some(&below), 60_000);
        assert_eq!(v.quality, Quality::Bad, "short js-gated body is bad");
        assert!(v.reasons.contains(&QualityReason::JsBlocked));

        let above = format!("{}{signature}", body(5_100));
        let v = verifier().verify(ReferenceKind::Article, "app.test", Some(&above), 60_000);
        assert_eq!(v.quality, Quality::Good, "large body is exempt from the js rule");
    }

    #[test]
    fn host_specific_soft404() {
        let mut config = QualityConfig::default();
        config
            .soft404_host_patterns
            .insert("cdn.test".into(), vec!["content unavailable".into()]);
        let verifier = QualityVerifier::new(&config);

        let text = format!("{}\n\nContent unavailable in your region.", body(400));
        let v = verifier.verify(ReferenceKind::Article, "cdn.test", Some(&text), 4_000);
        assert_eq!(v.quality, Quality::Bad);
        assert!(v.reasons.contains(&QualityReason::Soft404));

        // Same body on another host is fine.
        let v = verifier.verify(ReferenceKind::Article, "other.test", Some(&text), 4_000);
        assert_eq!(v.quality, Quality::Good);
    }

    #[test]
    fn soft404_heuristic_needs_low_word_count_for_global_patterns() {
        let v = verifier();
        assert!(v.looks_like_soft404("any.test", "Page not found."));
        let long = format!("{} page not found", body(400));
        assert!(!v.looks_like_soft404("any.test", &long));
    }

    #[test]
    fn wall_of_fragments_fails_paragraph_check() {
        let fragments = "one\n\ntwo\n\nthree\n\nfour".to_string();
        let mut config = QualityConfig::default();
        config.min_bytes = 0;
        config.min_words_article = 0;
        let v = QualityVerifier::new(&config).verify(
            ReferenceKind::Article,
            "x.test",
            Some(&fragments),
            1_000,
        );
        assert_eq!(v.quality, Quality::Bad);
        assert!(v.reasons.contains(&QualityReason::NoParagraphs));
    }

    #[test]
    fn raw_only_document_judged_on_size() {
        let v = verifier().verify(ReferenceKind::Document, "x.test", None, 100_000);
        assert_eq!(v.quality, Quality::Good);
        let v = verifier().verify(ReferenceKind::Document, "x.test", None, 100);
        assert_eq!(v.quality, Quality::Bad);
    }
}
