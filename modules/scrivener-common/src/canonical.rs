// URL canonicalization: the dedup identity for references and the host keys
// the governor budgets against.

use std::collections::HashSet;

use url::Url;

use crate::error::{Result, ScrivenerError};

/// Query parameters that never change what a page serves.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "mc_cid", "mc_eid", "igshid", "spm", "ref_src",
    "cmpid", "ncid",
];

const TRACKING_PREFIXES: &[&str] = &["utm_"];

/// Per-deployment canonicalization rules. Hosts listed in
/// `keep_trailing_slash_hosts` treat `/a` and `/a/` as distinct documents.
#[derive(Debug, Clone)]
pub struct CanonicalRules {
    /// Coerce http to https where the two are declared equivalent.
    pub force_https: bool,
    /// Hosts for which http and https are NOT equivalent.
    pub https_exempt_hosts: HashSet<String>,
    pub strip_www: bool,
    pub keep_trailing_slash_hosts: HashSet<String>,
    /// Deployment-specific additions to the tracking-param strip list.
    pub extra_tracking_params: Vec<String>,
}

impl Default for CanonicalRules {
    fn default() -> Self {
        Self {
            force_https: true,
            https_exempt_hosts: HashSet::new(),
            strip_www: true,
            keep_trailing_slash_hosts: HashSet::new(),
            extra_tracking_params: Vec::new(),
        }
    }
}

/// Whether a URL is structurally fetchable at all. Anything that fails here is
/// rejected at enqueue and never enters the queue.
pub fn is_fetchable(url_str: &str) -> bool {
    match Url::parse(url_str.trim()) {
        Ok(u) => matches!(u.scheme(), "http" | "https") && u.host_str().is_some(),
        Err(_) => false,
    }
}

/// Canonicalize a URL into its dedup identity.
///
/// Host is lowercased (the parser does this), `www.` stripped, tracking
/// params removed, remaining query params sorted for stability, fragment
/// dropped, scheme coerced to https where equivalent, trailing slash stripped
/// unless the host's rule keeps it. Idempotent: canonicalizing a canonical
/// URL is a no-op.
pub fn canonicalize(url_str: &str, rules: &CanonicalRules) -> Result<String> {
    let mut url = Url::parse(url_str.trim())
        .map_err(|e| ScrivenerError::InvalidUrl(format!("{url_str}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ScrivenerError::InvalidUrl(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| ScrivenerError::InvalidUrl(format!("{url_str}: no host")))?
        .to_string();

    let bare_host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if rules.strip_www && bare_host != host {
        url.set_host(Some(&bare_host))
            .map_err(|e| ScrivenerError::InvalidUrl(format!("{url_str}: {e}")))?;
    }

    if rules.force_https
        && url.scheme() == "http"
        && !rules.https_exempt_hosts.contains(&bare_host)
    {
        // Infallible for http -> https.
        let _ = url.set_scheme("https");
        if url.port() == Some(80) {
            let _ = url.set_port(None);
        }
    }

    url.set_fragment(None);

    // Filter tracking params, sort what survives.
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k, &rules.extra_tracking_params))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        let mut sorted = kept;
        sorted.sort();
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        serializer.extend_pairs(sorted);
        url.set_query(Some(&serializer.finish()));
    }

    if !rules.keep_trailing_slash_hosts.contains(&bare_host) {
        let path = url.path().to_string();
        if path.len() > 1 && path.ends_with('/') {
            url.set_path(path.trim_end_matches('/'));
        }
    }

    Ok(url.to_string())
}

fn is_tracking_param(key: &str, extra: &[String]) -> bool {
    TRACKING_PARAMS.contains(&key)
        || TRACKING_PREFIXES.iter().any(|p| key.starts_with(p))
        || extra.iter().any(|e| e == key)
}

/// The governor key for a URL: its host without `www.`. Hosts the parser
/// cannot see fall back to a shared bucket.
pub fn host_key(url_str: &str) -> String {
    Url::parse(url_str)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .map(|h| h.strip_prefix("www.").unwrap_or(&h).to_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(s: &str) -> String {
        canonicalize(s, &CanonicalRules::default()).unwrap()
    }

    #[test]
    fn host_is_case_insensitive() {
        assert_eq!(canon("HTTP://Example.COM/a/"), "https://example.com/a");
    }

    #[test]
    fn idempotent() {
        let once = canon("http://www.Example.com/Path/?utm_source=x&b=2&a=1");
        let twice = canonicalize(&once, &CanonicalRules::default()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn tracking_params_stripped_rest_sorted() {
        assert_eq!(
            canon("https://example.com/a?utm_source=nl&b=2&a=1&fbclid=xyz"),
            "https://example.com/a?a=1&b=2"
        );
    }

    #[test]
    fn fragment_dropped() {
        assert_eq!(canon("https://example.com/a#section"), "https://example.com/a");
    }

    #[test]
    fn trailing_slash_rule_per_host() {
        assert_eq!(canon("https://example.com/a/"), "https://example.com/a");

        let mut rules = CanonicalRules::default();
        rules.keep_trailing_slash_hosts.insert("example.com".into());
        assert_eq!(
            canonicalize("https://example.com/a/", &rules).unwrap(),
            "https://example.com/a/"
        );
    }

    #[test]
    fn root_path_keeps_its_slash() {
        assert_eq!(canon("https://example.com/"), "https://example.com/");
    }

    #[test]
    fn https_exempt_host_keeps_http() {
        let mut rules = CanonicalRules::default();
        rules.https_exempt_hosts.insert("legacy.test".into());
        assert_eq!(
            canonicalize("http://legacy.test/x", &rules).unwrap(),
            "http://legacy.test/x"
        );
    }

    #[test]
    fn unfetchable_schemes() {
        assert!(!is_fetchable("file:///etc/passwd"));
        assert!(!is_fetchable("ftp://example.com/x"));
        assert!(!is_fetchable("not a url"));
        assert!(is_fetchable("https://example.com/x"));
    }

    #[test]
    fn canonicalize_rejects_non_http() {
        assert!(canonicalize("file:///etc/passwd", &CanonicalRules::default()).is_err());
    }

    #[test]
    fn host_key_strips_www() {
        assert_eq!(host_key("https://www.example.com/a"), "example.com");
        assert_eq!(host_key("https://Example.com/a"), "example.com");
    }
}
