pub mod error;

pub use error::{HeadlessError, Result};

use std::time::Duration;

use serde_json::json;
use tracing::debug;

/// Options for one render call.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Milliseconds to let the page settle after load before the DOM is read.
    pub wait_for_ms: Option<u64>,
    /// Block image/media requests to speed up text-only renders.
    pub block_media: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            wait_for_ms: Some(1_500),
            block_media: true,
        }
    }
}

/// Client for a Browserless-compatible `/content` endpoint: POST a URL, get
/// the fully rendered HTML back.
pub struct HeadlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HeadlessClient {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction only fails on TLS misconfiguration");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        }
    }

    /// Render a URL and return the settled DOM as HTML.
    pub async fn render(&self, url: &str, options: &RenderOptions) -> Result<String> {
        let mut endpoint = format!("{}/content", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }

        let mut body = json!({
            "url": url,
            "blockMedia": options.block_media,
        });
        if let Some(wait) = options.wait_for_ms {
            body["waitFor"] = json!(wait);
        }

        debug!(url, "requesting headless render");

        let resp = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(HeadlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.text().await?)
    }
}
