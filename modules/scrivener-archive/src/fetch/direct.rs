// Direct HTTP transport: plain GET with redirect, size, and time caps.

use std::time::Duration;

use scrivener_common::{FailureReason, FetcherConfig};

use crate::providers::RequestOverlay;

use super::AttemptOutcome;

/// Fallback when a 429 carries no usable Retry-After.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

pub(crate) fn build_client(config: &FetcherConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .timeout(config.total_timeout)
        .redirect(reqwest::redirect::Policy::limited(config.redirect_cap))
        .build()
        .expect("reqwest client construction only fails on TLS misconfiguration")
}

pub(crate) async fn fetch_direct(
    client: &reqwest::Client,
    config: &FetcherConfig,
    url: &str,
    overlay: Option<&RequestOverlay>,
) -> AttemptOutcome {
    let mut request = client.get(url);
    if let Some(overlay) = overlay {
        if let Some(cookie) = &overlay.cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }
        for (name, value) in &overlay.headers {
            request = request.header(name, value);
        }
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => return classify_send_error(&e),
    };

    classify_response(config, url, response).await
}

pub(crate) async fn classify_response(
    config: &FetcherConfig,
    url: &str,
    response: reqwest::Response,
) -> AttemptOutcome {
    let status = response.status();

    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER);
        return AttemptOutcome::RateLimited { retry_after };
    }

    match status.as_u16() {
        200..=299 => read_body(config, url, response).await,
        404 => AttemptOutcome::Permanent {
            reason: FailureReason::NotFound,
            detail: format!("{url}: 404"),
        },
        410 => AttemptOutcome::Permanent {
            reason: FailureReason::Gone,
            detail: format!("{url}: 410"),
        },
        451 => AttemptOutcome::Permanent {
            reason: FailureReason::LegalBlock,
            detail: format!("{url}: 451"),
        },
        500..=599 => AttemptOutcome::Transient {
            reason: FailureReason::ServerError,
            detail: format!("{url}: {status}"),
        },
        // Auth walls and bot blocks often clear through another transport;
        // let the retry clock decide.
        _ => AttemptOutcome::Transient {
            reason: FailureReason::ServerError,
            detail: format!("{url}: {status}"),
        },
    }
}

async fn read_body(
    config: &FetcherConfig,
    url: &str,
    mut response: reqwest::Response,
) -> AttemptOutcome {
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let final_url = response.url().to_string();

    // Trust an honest Content-Length over the cap before reading anything.
    if let Some(len) = response.content_length() {
        if len > config.size_cap {
            return AttemptOutcome::Permanent {
                reason: FailureReason::SizeCap,
                detail: format!("{url}: content-length {len} over cap {}", config.size_cap),
            };
        }
    }

    let mut bytes: Vec<u8> = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if bytes.len() as u64 + chunk.len() as u64 > config.size_cap {
                    return AttemptOutcome::Permanent {
                        reason: FailureReason::SizeCap,
                        detail: format!("{url}: body exceeds cap {}", config.size_cap),
                    };
                }
                bytes.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => {
                return AttemptOutcome::Transient {
                    reason: FailureReason::Timeout,
                    detail: format!("{url}: body read failed: {e}"),
                }
            }
        }
    }

    AttemptOutcome::Success {
        bytes,
        final_url,
        content_type,
    }
}

pub(crate) fn classify_send_error(e: &reqwest::Error) -> AttemptOutcome {
    if e.is_redirect() {
        return AttemptOutcome::Permanent {
            reason: FailureReason::RedirectCap,
            detail: e.to_string(),
        };
    }
    if e.is_timeout() {
        return AttemptOutcome::Transient {
            reason: FailureReason::Timeout,
            detail: e.to_string(),
        };
    }
    if e.is_connect() {
        return AttemptOutcome::Transient {
            reason: FailureReason::DnsSoftFail,
            detail: e.to_string(),
        };
    }
    AttemptOutcome::Transient {
        reason: FailureReason::ServerError,
        detail: e.to_string(),
    }
}
