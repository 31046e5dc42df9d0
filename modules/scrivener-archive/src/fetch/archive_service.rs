// Archive transports: archive.today's newest-snapshot endpoint and the
// Wayback Machine availability API.

use scrivener_common::{FailureReason, FetcherConfig};

use super::direct::{classify_response, classify_send_error};
use super::AttemptOutcome;

pub(crate) const ARCHIVE_IS_HOST: &str = "archive.ph";
pub(crate) const WAYBACK_HOST: &str = "web.archive.org";

/// Fetch the newest archive.today snapshot of a URL, if one exists.
pub(crate) async fn fetch_archive_is(
    client: &reqwest::Client,
    config: &FetcherConfig,
    url: &str,
) -> AttemptOutcome {
    let endpoint = format!("https://{ARCHIVE_IS_HOST}/newest/{url}");
    let response = match client.get(&endpoint).send().await {
        Ok(r) => r,
        Err(e) => return classify_send_error(&e),
    };

    if response.status().as_u16() == 404 {
        // No snapshot held. Not a fault; the cascade moves on.
        return AttemptOutcome::NoContent {
            detail: format!("no archive.today snapshot for {url}"),
        };
    }

    classify_response(config, &endpoint, response).await
}

/// Look up the most recent usable Wayback snapshot and fetch it.
pub(crate) async fn fetch_wayback(
    client: &reqwest::Client,
    config: &FetcherConfig,
    url: &str,
) -> AttemptOutcome {
    let availability = format!(
        "https://archive.org/wayback/available?url={}",
        urlencode(url)
    );

    let response = match client.get(&availability).send().await {
        Ok(r) => r,
        Err(e) => return classify_send_error(&e),
    };
    if !response.status().is_success() {
        return AttemptOutcome::Transient {
            reason: FailureReason::ServerError,
            detail: format!("wayback availability: {}", response.status()),
        };
    }

    let body: serde_json::Value = match response.json().await {
        Ok(v) => v,
        Err(e) => {
            return AttemptOutcome::Transient {
                reason: FailureReason::ServerError,
                detail: format!("wayback availability parse: {e}"),
            }
        }
    };

    let snapshot = body
        .pointer("/archived_snapshots/closest")
        .filter(|c| c.get("available").and_then(|a| a.as_bool()).unwrap_or(false))
        .and_then(|c| c.get("url"))
        .and_then(|u| u.as_str())
        .map(|u| u.replacen("http://", "https://", 1));

    let snapshot_url = match snapshot {
        Some(u) => u,
        None => {
            return AttemptOutcome::NoContent {
                detail: format!("no wayback snapshot for {url}"),
            }
        }
    };

    let response = match client.get(&snapshot_url).send().await {
        Ok(r) => r,
        Err(e) => return classify_send_error(&e),
    };
    classify_response(config, &snapshot_url, response).await
}

fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_query_separators() {
        assert_eq!(
            urlencode("https://example.com/a?b=1&c=2"),
            "https%3A%2F%2Fexample.com%2Fa%3Fb%3D1%26c%3D2"
        );
    }
}
