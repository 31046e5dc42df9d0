// SSRF pre-flight: resolve the target and refuse to touch loopback,
// link-local, or private ranges before any packet is sent.

use std::net::IpAddr;

use tokio::net::lookup_host;
use url::Url;

use scrivener_common::SsrfConfig;

pub(crate) enum Preflight {
    Allowed,
    /// Resolved into a disallowed range; permanent, no packet sent.
    Blocked(String),
    /// Could not resolve; the transport would fail the same way.
    DnsFailed(String),
}

pub(crate) async fn preflight(url: &str, config: &SsrfConfig) -> Preflight {
    if config.allow_private {
        return Preflight::Allowed;
    }

    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(e) => return Preflight::Blocked(format!("unparseable url: {e}")),
    };
    let host = match parsed.host_str() {
        Some(h) => h.to_string(),
        None => return Preflight::Blocked("url has no host".to_string()),
    };

    if config.allow_list.iter().any(|allowed| *allowed == host) {
        return Preflight::Allowed;
    }

    // IP literals never need DNS.
    if let Ok(ip) = host.trim_matches(&['[', ']'][..]).parse::<IpAddr>() {
        return if ip_disallowed(ip) {
            Preflight::Blocked(format!("{host} is a disallowed address"))
        } else {
            Preflight::Allowed
        };
    }

    let port = parsed.port_or_known_default().unwrap_or(443);
    let result = lookup_host((host.as_str(), port)).await;
    match result {
        Ok(addrs) => {
            for addr in addrs {
                if ip_disallowed(addr.ip()) {
                    return Preflight::Blocked(format!("{host} resolves to {}", addr.ip()));
                }
            }
            Preflight::Allowed
        }
        Err(e) => Preflight::DnsFailed(format!("{host}: {e}")),
    }
}

fn ip_disallowed(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return ip_disallowed(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique local fc00::/7
                || (segments[0] & 0xfe00) == 0xfc00
                // Link local fe80::/10
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}
