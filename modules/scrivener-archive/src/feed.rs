// Feed parsing helper: maps RSS/Atom documents to enqueueable submissions.
// Collaborators poll the feeds; the engine only turns entries into work.

use chrono::{DateTime, Utc};
use serde_json::json;

use scrivener_common::{EnqueueRequest, ReferenceKind};

use crate::error::{ArchiveError, Result};

const FEED_MAX_ITEMS: usize = 50;

/// One feed entry mapped to a submission.
#[derive(Debug, Clone)]
pub struct FeedEntry {
    pub url: String,
    pub title: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Audio/media enclosure, when the feed carries one.
    pub enclosure_url: Option<String>,
    pub description_html: Option<String>,
}

impl FeedEntry {
    /// Turn this entry into an enqueue request of the given kind, carrying
    /// the feed context the resolvers read.
    pub fn into_request(self, kind: ReferenceKind, feed_title: Option<&str>) -> EnqueueRequest {
        let mut request = EnqueueRequest::new(self.url, kind);
        let mut metadata = serde_json::Map::new();
        if let Some(title) = &self.title {
            metadata.insert("episode_title".into(), json!(title));
        }
        if let Some(show) = feed_title {
            metadata.insert("podcast_name".into(), json!(show));
        }
        if let Some(enclosure) = &self.enclosure_url {
            metadata.insert("enclosure_url".into(), json!(enclosure));
        }
        if let Some(description) = &self.description_html {
            metadata.insert("feed_description".into(), json!(description));
        }
        if let Some(published) = self.published_at {
            metadata.insert("published_at".into(), json!(published.to_rfc3339()));
        }
        if !metadata.is_empty() {
            request.metadata = Some(serde_json::Value::Object(metadata));
        }
        request
    }
}

#[derive(Debug)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub entries: Vec<FeedEntry>,
}

/// Parse an RSS/Atom/JSON feed document. Entries are newest-first, capped.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed> {
    let feed = feed_rs::parser::parse(bytes).map_err(|e| ArchiveError::Feed(e.to_string()))?;

    let mut entries: Vec<FeedEntry> = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let url = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))?;

            let enclosure_url = entry
                .media
                .iter()
                .flat_map(|m| m.content.iter())
                .find_map(|c| c.url.as_ref().map(|u| u.to_string()));

            Some(FeedEntry {
                url,
                title: entry.title.map(|t| t.content),
                published_at: entry
                    .published
                    .or(entry.updated)
                    .map(|dt| dt.with_timezone(&Utc)),
                enclosure_url,
                description_html: entry.summary.map(|s| s.content),
            })
        })
        .collect();

    entries.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    entries.truncate(FEED_MAX_ITEMS);

    Ok(ParsedFeed {
        title: feed.title.map(|t| t.content),
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
        <rss version="2.0">
          <channel>
            <title>The Daily Brief</title>
            <item>
              <title>Episode 2: Housing</title>
              <link>https://pod.test/ep/2</link>
              <pubDate>Tue, 02 Jun 2026 08:00:00 GMT</pubDate>
              <description>&lt;a href="https://pod.test/ep/2/transcript"&gt;Transcript&lt;/a&gt;</description>
              <enclosure url="https://cdn.pod.test/ep2.mp3" type="audio/mpeg" length="1000"/>
            </item>
            <item>
              <title>Episode 1: Transit</title>
              <link>https://pod.test/ep/1</link>
              <pubDate>Mon, 01 Jun 2026 08:00:00 GMT</pubDate>
            </item>
          </channel>
        </rss>"#;

    #[test]
    fn parses_rss_newest_first() {
        let parsed = parse_feed(RSS.as_bytes()).unwrap();
        assert_eq!(parsed.title.as_deref(), Some("The Daily Brief"));
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].url, "https://pod.test/ep/2");
        assert_eq!(
            parsed.entries[0].enclosure_url.as_deref(),
            Some("https://cdn.pod.test/ep2.mp3")
        );
    }

    #[test]
    fn entry_becomes_enqueue_request_with_context() {
        let parsed = parse_feed(RSS.as_bytes()).unwrap();
        let show = parsed.title.clone();
        let request = parsed.entries[0]
            .clone()
            .into_request(ReferenceKind::PodcastEpisode, show.as_deref());

        assert_eq!(request.source_url, "https://pod.test/ep/2");
        let metadata = request.metadata.unwrap();
        assert_eq!(metadata["podcast_name"], "The Daily Brief");
        assert_eq!(metadata["episode_title"], "Episode 2: Housing");
        assert!(metadata["feed_description"]
            .as_str()
            .unwrap()
            .contains("transcript"));
    }

    #[test]
    fn garbage_is_a_feed_error() {
        assert!(matches!(
            parse_feed(b"not xml at all"),
            Err(ArchiveError::Feed(_))
        ));
    }
}
