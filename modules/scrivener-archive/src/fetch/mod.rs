// The robust fetcher: cascading transports per locator, governed per host,
// with SSRF pre-flight and typed outcome classification.

pub(crate) mod archive_service;
pub(crate) mod direct;
pub(crate) mod ssrf;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use headless_client::{HeadlessClient, RenderOptions};
use scrivener_common::{
    canonical, FailureReason, FetcherConfig, Locator, ObtainedFrom, Reference, SsrfConfig,
    Transport, TransportHint,
};
use scrivener_governor::{Acquire, Governor, Observed};

use crate::cancel::CancelToken;
use crate::providers::CredentialProvider;
use crate::verify::QualityVerifier;

/// Bytes produced by a successful transport attempt.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub bytes: Vec<u8>,
    pub final_url: String,
    /// The locator that produced these bytes, so a caller can drop it and
    /// retry the rest when the content fails verification.
    pub locator_url: String,
    pub locator_hint: TransportHint,
    pub transport: Transport,
    pub obtained_from: ObtainedFrom,
    pub source_resolver: String,
    pub content_type: Option<String>,
}

impl FetchedDocument {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("text/html") || ct.contains("application/xhtml"))
            .unwrap_or(false)
    }
}

/// Final classification for one reference's fetch pass.
#[derive(Debug)]
pub enum FetchOutcome {
    Success(FetchedDocument),
    /// No budget anywhere; the worker should release the lease and let the
    /// scheduler re-enqueue at this instant.
    Deferred { until: DateTime<Utc> },
    RateLimited { retry_after: Duration },
    Transient { reason: FailureReason, detail: String },
    Permanent { reason: FailureReason, detail: String },
}

/// One attempt's note, kept for dead-letter forensics.
#[derive(Debug, Clone)]
pub struct AttemptNote {
    pub resolver: String,
    pub transport: Transport,
    pub status: String,
}

pub(crate) enum AttemptOutcome {
    Success {
        bytes: Vec<u8>,
        final_url: String,
        content_type: Option<String>,
    },
    /// The service answered but holds nothing for this URL.
    NoContent { detail: String },
    Transient {
        reason: FailureReason,
        detail: String,
    },
    RateLimited { retry_after: Duration },
    Permanent {
        reason: FailureReason,
        detail: String,
    },
}

pub struct RobustFetcher {
    config: FetcherConfig,
    ssrf: SsrfConfig,
    governor: Arc<Governor>,
    client: reqwest::Client,
    renderer: Option<HeadlessClient>,
    credentials: Arc<dyn CredentialProvider>,
    verifier: Arc<QualityVerifier>,
}

impl RobustFetcher {
    pub fn new(
        config: FetcherConfig,
        ssrf: SsrfConfig,
        governor: Arc<Governor>,
        credentials: Arc<dyn CredentialProvider>,
        renderer: Option<HeadlessClient>,
        verifier: Arc<QualityVerifier>,
    ) -> Self {
        let client = direct::build_client(&config);
        Self {
            config,
            ssrf,
            governor,
            client,
            renderer,
            credentials,
            verifier,
        }
    }

    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    /// Walk the locators in order, trying each transport the locator's hint
    /// allows, and classify the overall result. `deadline` bounds inline
    /// budget waits; anything later defers back to the scheduler.
    pub async fn fetch(
        &self,
        reference: &Reference,
        locators: &[Locator],
        cancel: &CancelToken,
        deadline: DateTime<Utc>,
    ) -> (FetchOutcome, Vec<AttemptNote>) {
        let mut notes: Vec<AttemptNote> = Vec::new();
        let mut min_wait: Option<DateTime<Utc>> = None;
        let mut min_retry_after: Option<Duration> = None;
        let mut transient: Option<(FailureReason, String)> = None;
        let mut permanent: Option<(FailureReason, String)> = None;

        'locators: for locator in locators {
            for transport in self.transports_for(locator.transport_hint) {
                if cancel.is_cancelled() {
                    break 'locators;
                }

                let governed_host = match transport {
                    Transport::ArchiveIs => archive_service::ARCHIVE_IS_HOST.to_string(),
                    Transport::Wayback => archive_service::WAYBACK_HOST.to_string(),
                    _ => canonical::host_key(&locator.url),
                };

                // SSRF pre-flight for transports that contact the target.
                if !matches!(transport, Transport::ArchiveIs | Transport::Wayback) {
                    match ssrf::preflight(&locator.url, &self.ssrf).await {
                        ssrf::Preflight::Allowed => {}
                        ssrf::Preflight::Blocked(detail) => {
                            warn!(url = %locator.url, detail, "ssrf pre-flight rejected locator");
                            notes.push(note(locator, transport, "ssrf_blocked"));
                            permanent.get_or_insert((FailureReason::SsrfBlocked, detail));
                            // The target itself is off-limits for every
                            // direct transport; skip to archive copies.
                            continue;
                        }
                        ssrf::Preflight::DnsFailed(detail) => {
                            notes.push(note(locator, transport, "dns_soft_fail"));
                            transient.get_or_insert((FailureReason::DnsSoftFail, detail));
                            continue;
                        }
                    }
                }

                // Governor budget, with inline waits bounded by the lease.
                let _permit = match self.governor.acquire(&governed_host, Utc::now()) {
                    Acquire::Proceed(p) => p,
                    Acquire::WaitUntil(t) if t <= deadline => {
                        let pause = (t - Utc::now()).to_std().unwrap_or_default();
                        tokio::time::sleep(pause).await;
                        match self.governor.acquire(&governed_host, Utc::now()) {
                            Acquire::Proceed(p) => p,
                            Acquire::WaitUntil(t) | Acquire::Blocked { until: t } => {
                                min_wait = Some(min_wait.map_or(t, |w| w.min(t)));
                                continue;
                            }
                        }
                    }
                    Acquire::WaitUntil(t) | Acquire::Blocked { until: t } => {
                        min_wait = Some(min_wait.map_or(t, |w| w.min(t)));
                        continue;
                    }
                };

                let outcome = self.attempt(transport, locator).await;
                self.governor
                    .report(&governed_host, observed_for(&outcome), Utc::now());

                match outcome {
                    AttemptOutcome::Success {
                        bytes,
                        final_url,
                        content_type,
                    } => {
                        // A 200 that is really a placeholder does not count.
                        let texty = content_type
                            .as_deref()
                            .map(|ct| ct.starts_with("text/") || ct.contains("html"))
                            .unwrap_or(true);
                        if texty {
                            let text = String::from_utf8_lossy(&bytes);
                            let origin_host = canonical::host_key(&locator.url);
                            if self.verifier.looks_like_soft404(&origin_host, &text) {
                                notes.push(note(locator, transport, "soft_404"));
                                permanent.get_or_insert((
                                    FailureReason::Soft404,
                                    format!("{}: placeholder body", locator.url),
                                ));
                                continue;
                            }
                        }

                        notes.push(note(locator, transport, "success"));
                        info!(
                            url = %locator.url,
                            transport = transport.as_str(),
                            bytes = bytes.len(),
                            "fetch succeeded"
                        );
                        let doc = FetchedDocument {
                            bytes,
                            final_url,
                            locator_url: locator.url.clone(),
                            locator_hint: locator.transport_hint,
                            transport,
                            obtained_from: obtained_from(reference, locator, transport),
                            source_resolver: locator.source_resolver.clone(),
                            content_type,
                        };
                        return (FetchOutcome::Success(doc), notes);
                    }
                    AttemptOutcome::NoContent { detail } => {
                        debug!(url = %locator.url, transport = transport.as_str(), detail,
                            "transport holds no content");
                        notes.push(note(locator, transport, "no_content"));
                    }
                    AttemptOutcome::Transient { reason, detail } => {
                        notes.push(note(locator, transport, reason.as_str()));
                        transient.get_or_insert((reason, detail));
                    }
                    AttemptOutcome::RateLimited { retry_after } => {
                        notes.push(note(locator, transport, "rate_limited"));
                        min_retry_after =
                            Some(min_retry_after.map_or(retry_after, |r| r.min(retry_after)));
                    }
                    AttemptOutcome::Permanent { reason, detail } => {
                        notes.push(note(locator, transport, reason.as_str()));
                        permanent.get_or_insert((reason, detail));
                    }
                }
            }
        }

        let outcome = if let Some(until) = min_wait {
            FetchOutcome::Deferred { until }
        } else if let Some(retry_after) = min_retry_after {
            FetchOutcome::RateLimited { retry_after }
        } else if let Some((reason, detail)) = transient {
            FetchOutcome::Transient { reason, detail }
        } else if let Some((reason, detail)) = permanent {
            FetchOutcome::Permanent { reason, detail }
        } else {
            FetchOutcome::Permanent {
                reason: FailureReason::NotFound,
                detail: "all transports exhausted with no content".to_string(),
            }
        };
        (outcome, notes)
    }

    fn transports_for(&self, hint: TransportHint) -> Vec<Transport> {
        let browser = self.renderer.is_some().then_some(Transport::Browser);
        match hint {
            TransportHint::Direct => [
                Some(Transport::DirectHttp),
                Some(Transport::DirectCookies),
                browser,
            ]
            .into_iter()
            .flatten()
            .collect(),
            TransportHint::Browser => browser.into_iter().collect(),
            TransportHint::Archive => vec![Transport::ArchiveIs, Transport::Wayback],
            TransportHint::Mirror => vec![Transport::DirectHttp],
            TransportHint::Any => [
                Some(Transport::DirectHttp),
                Some(Transport::DirectCookies),
                browser,
                Some(Transport::ArchiveIs),
                Some(Transport::Wayback),
            ]
            .into_iter()
            .flatten()
            .collect(),
        }
    }

    async fn attempt(&self, transport: Transport, locator: &Locator) -> AttemptOutcome {
        match transport {
            Transport::DirectHttp => {
                direct::fetch_direct(&self.client, &self.config, &locator.url, None).await
            }
            Transport::DirectCookies => {
                let host = canonical::host_key(&locator.url);
                let overlay = match self.credentials.overlay_for(&host).await {
                    Some(o) => o,
                    // No credentials for this host; nothing new to try.
                    None => {
                        return AttemptOutcome::NoContent {
                            detail: format!("no credentials for {host}"),
                        }
                    }
                };
                direct::fetch_direct(&self.client, &self.config, &locator.url, Some(&overlay))
                    .await
            }
            Transport::Browser => {
                let renderer = match &self.renderer {
                    Some(r) => r,
                    None => {
                        return AttemptOutcome::NoContent {
                            detail: "no renderer configured".to_string(),
                        }
                    }
                };
                match renderer.render(&locator.url, &RenderOptions::default()).await {
                    Ok(html) => AttemptOutcome::Success {
                        bytes: html.into_bytes(),
                        final_url: locator.url.clone(),
                        content_type: Some("text/html".to_string()),
                    },
                    Err(e) if e.is_transient() => AttemptOutcome::Transient {
                        reason: FailureReason::ServerError,
                        detail: format!("render: {e}"),
                    },
                    Err(e) => AttemptOutcome::NoContent {
                        detail: format!("render refused: {e}"),
                    },
                }
            }
            Transport::ArchiveIs => {
                archive_service::fetch_archive_is(&self.client, &self.config, &locator.url).await
            }
            Transport::Wayback => {
                archive_service::fetch_wayback(&self.client, &self.config, &locator.url).await
            }
        }
    }
}

fn note(locator: &Locator, transport: Transport, status: &str) -> AttemptNote {
    AttemptNote {
        resolver: locator.source_resolver.clone(),
        transport,
        status: status.to_string(),
    }
}

fn obtained_from(reference: &Reference, locator: &Locator, transport: Transport) -> ObtainedFrom {
    match transport {
        Transport::ArchiveIs => ObtainedFrom::ArchiveIs,
        Transport::Wayback => ObtainedFrom::Wayback,
        _ if locator.url == reference.canonical_url => ObtainedFrom::Origin,
        _ => ObtainedFrom::AlternateUrl,
    }
}

fn observed_for(outcome: &AttemptOutcome) -> Observed {
    match outcome {
        AttemptOutcome::Success { .. } | AttemptOutcome::NoContent { .. } => Observed::Success,
        AttemptOutcome::RateLimited { retry_after } => Observed::RateLimited {
            retry_after: *retry_after,
        },
        AttemptOutcome::Transient { .. } => Observed::Failure,
        // The host answered coherently; permanence describes the content.
        AttemptOutcome::Permanent { .. } => Observed::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::NoCredentials;
    use crate::resolve::tests_support::reference;
    use scrivener_common::{GovernorConfig, QualityConfig, ReferenceKind};

    fn fetcher(renderer: bool) -> RobustFetcher {
        let renderer = renderer.then(|| {
            HeadlessClient::new("http://render.test:3000", None, Duration::from_secs(30))
        });
        RobustFetcher::new(
            FetcherConfig::default(),
            SsrfConfig::default(),
            Arc::new(Governor::new(GovernorConfig::default())),
            Arc::new(NoCredentials),
            renderer,
            Arc::new(QualityVerifier::new(&QualityConfig::default())),
        )
    }

    fn locator(url: &str, hint: TransportHint) -> Locator {
        Locator {
            url: url.to_string(),
            transport_hint: hint,
            source_resolver: "origin".to_string(),
            confidence: 1.0,
            auth_context: None,
        }
    }

    #[test]
    fn transport_cascade_respects_hints() {
        let f = fetcher(true);
        assert_eq!(
            f.transports_for(TransportHint::Any),
            vec![
                Transport::DirectHttp,
                Transport::DirectCookies,
                Transport::Browser,
                Transport::ArchiveIs,
                Transport::Wayback,
            ]
        );
        assert_eq!(
            f.transports_for(TransportHint::Archive),
            vec![Transport::ArchiveIs, Transport::Wayback]
        );
        assert_eq!(f.transports_for(TransportHint::Mirror), vec![Transport::DirectHttp]);
    }

    #[test]
    fn browser_dropped_without_renderer() {
        let f = fetcher(false);
        assert!(!f
            .transports_for(TransportHint::Any)
            .contains(&Transport::Browser));
        assert!(f.transports_for(TransportHint::Browser).is_empty());
    }

    #[test]
    fn obtained_from_mapping() {
        let r = reference(ReferenceKind::Article, "https://example.com/a");
        let origin = locator("https://example.com/a", TransportHint::Direct);
        let alternate = locator("https://mirror.test/a", TransportHint::Direct);

        assert_eq!(
            obtained_from(&r, &origin, Transport::DirectHttp),
            ObtainedFrom::Origin
        );
        assert_eq!(
            obtained_from(&r, &alternate, Transport::DirectHttp),
            ObtainedFrom::AlternateUrl
        );
        assert_eq!(
            obtained_from(&r, &origin, Transport::ArchiveIs),
            ObtainedFrom::ArchiveIs
        );
        assert_eq!(
            obtained_from(&r, &origin, Transport::Wayback),
            ObtainedFrom::Wayback
        );
    }

    #[tokio::test]
    async fn ssrf_blocked_locator_yields_permanent_without_network() {
        let f = fetcher(false);
        let r = reference(ReferenceKind::Article, "http://127.0.0.1/secret");
        let locators = vec![locator("http://127.0.0.1/secret", TransportHint::Direct)];

        let (outcome, notes) = f
            .fetch(
                &r,
                &locators,
                &CancelToken::never(),
                Utc::now() + chrono::Duration::seconds(60),
            )
            .await;

        match outcome {
            FetchOutcome::Permanent { reason, .. } => {
                assert_eq!(reason, FailureReason::SsrfBlocked)
            }
            other => panic!("expected Permanent(ssrf), got {other:?}"),
        }
        assert!(notes.iter().all(|n| n.status == "ssrf_blocked"));
    }

    #[tokio::test]
    async fn empty_locator_list_is_permanent() {
        let f = fetcher(false);
        let r = reference(ReferenceKind::Article, "https://example.com/a");
        let (outcome, _) = f
            .fetch(&r, &[], &CancelToken::never(), Utc::now() + chrono::Duration::seconds(60))
            .await;
        assert!(matches!(
            outcome,
            FetchOutcome::Permanent {
                reason: FailureReason::NotFound,
                ..
            }
        ));
    }
}
