//! Selection of a corporate upstream proxy per target, honoring NO_PROXY.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::Regex;
use tracing::{debug, info};
use url::Url;

use crate::error::{ProxyError, Result};
use crate::proxy::agent::AgentOptions;
use crate::store::compile_wildcard;
use crate::target::TargetDescriptor;

const LOOPBACK_DISABLE: &str = "<-loopback>";

/// Upstream proxy endpoint an agent connects through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    pub host: String,
    pub port: u16,
    /// The proxy itself is reached over TLS.
    pub secure: bool,
}

#[derive(Debug)]
enum NoProxyRule {
    All,
    Host { pattern: Regex, port: Option<u16> },
}

impl NoProxyRule {
    fn parse(part: &str) -> Result<Self> {
        if part == "*" {
            return Ok(NoProxyRule::All);
        }
        let invalid = || {
            ProxyError::UpstreamProxy(format!(
                "Invalid NO_PROXY argument '{part}'. Entries must be hostnames, IP addresses or \
                 wildcard patterns, optionally followed by a port. Example: localhost,*.acme.com,10.0.0.1:8080"
            ))
        };

        let (host, port) = if let Some(rest) = part.strip_prefix('[') {
            // bracketed IPv6 literal
            let (addr, tail) = rest.split_once(']').ok_or_else(invalid)?;
            if addr.parse::<std::net::Ipv6Addr>().is_err() {
                return Err(invalid());
            }
            let port = match tail {
                "" => None,
                t => Some(t.strip_prefix(':').and_then(|p| p.parse::<u16>().ok()).ok_or_else(invalid)?),
            };
            (addr.to_string(), port)
        } else if part.parse::<IpAddr>().is_ok() {
            (part.to_string(), None)
        } else {
            let (host, port) = match part.rsplit_once(':') {
                Some((h, p)) => (h, Some(p.parse::<u16>().map_err(|_| invalid())?)),
                None => (part, None),
            };
            let valid = !host.is_empty()
                && host.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*'));
            if !valid {
                return Err(invalid());
            }
            (host.to_string(), port)
        };

        let pattern = compile_wildcard(&host).ok_or_else(invalid)?;
        Ok(NoProxyRule::Host { pattern, port })
    }

    fn matches(&self, target: &TargetDescriptor) -> bool {
        match self {
            NoProxyRule::All => true,
            NoProxyRule::Host { pattern, port } => {
                pattern.is_match(target.hostname()) && port.is_none_or(|p| p == target.port())
            }
        }
    }
}

#[derive(Debug, Default)]
struct UpstreamProxyConfig {
    http_proxy: Option<UpstreamProxy>,
    https_proxy: Option<UpstreamProxy>,
    no_proxy: Vec<NoProxyRule>,
}

impl UpstreamProxyConfig {
    fn excludes(&self, target: &TargetDescriptor) -> bool {
        self.no_proxy.iter().any(|rule| rule.matches(target))
    }
}

/// Decides whether traffic to a target goes through the configured upstream proxy.
///
/// Configuration is swapped atomically, readers never block.
#[derive(Default)]
pub struct UpstreamProxyManager {
    config: ArcSwap<UpstreamProxyConfig>,
}

pub(crate) fn parse_proxy_url(value: &str, parameter: &str) -> Result<UpstreamProxy> {
    let invalid = || {
        ProxyError::UpstreamProxy(format!(
            "Invalid {parameter} argument '{value}'. It must be a complete URL without path. \
             Example: http://proxy.acme.com:8080"
        ))
    };
    let url = Url::parse(value).map_err(|_| invalid())?;
    let secure = match url.scheme() {
        "http" => false,
        "https" => true,
        _ => return Err(invalid()),
    };
    if !has_explicit_port(value) || !matches!(url.path(), "" | "/") || url.query().is_some() {
        return Err(invalid());
    }
    let host = match url.host() {
        Some(url::Host::Ipv6(addr)) => addr.to_string(),
        Some(h) => h.to_string(),
        None => return Err(invalid()),
    };
    let port = url.port_or_known_default().ok_or_else(invalid)?;
    Ok(UpstreamProxy { host, port, secure })
}

/// `Url` hides default ports, so look at the authority as written.
pub(crate) fn has_explicit_port(value: &str) -> bool {
    let Some((_, rest)) = value.split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    match host_port.rsplit_once(':') {
        Some((host, port)) => {
            !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) && (!host.starts_with('[') || host.ends_with(']'))
        }
        None => false,
    }
}

impl UpstreamProxyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and install the upstream configuration. Nothing is changed when
    /// any of the inputs is invalid.
    pub fn init(&self, http_proxy: Option<&str>, https_proxy: Option<&str>, no_proxy: Option<&str>) -> Result<()> {
        let http_proxy = http_proxy
            .filter(|v| !v.trim().is_empty())
            .map(|v| parse_proxy_url(v.trim(), "HTTP_PROXY"))
            .transpose()?;
        let https_proxy = https_proxy
            .filter(|v| !v.trim().is_empty())
            .map(|v| parse_proxy_url(v.trim(), "HTTPS_PROXY"))
            .transpose()?;
        let no_proxy = no_proxy
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(NoProxyRule::parse)
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        if let Some(p) = &http_proxy {
            info!(host = %p.host, port = p.port, "Using HTTP upstream proxy");
        }
        if let Some(p) = &https_proxy {
            info!(host = %p.host, port = p.port, "Using HTTPS upstream proxy");
        }
        self.config.store(Arc::new(UpstreamProxyConfig { http_proxy, https_proxy, no_proxy }));
        Ok(())
    }

    /// Layer the upstream proxy for `target` into `options`. Returns false when
    /// the target goes direct.
    pub fn set_upstream_proxy_config(&self, target: &TargetDescriptor, is_ssl: bool, options: &mut AgentOptions) -> bool {
        let config = self.config.load();
        if config.excludes(target) {
            debug!(target = %target, "Target matches NO_PROXY");
            return false;
        }
        let proxy = if is_ssl { config.https_proxy.as_ref().or(config.http_proxy.as_ref()) } else { config.http_proxy.as_ref() };
        match proxy {
            Some(p) => {
                options.upstream = Some(p.clone());
                true
            }
            None => false,
        }
    }

    /// True when any upstream proxy is configured and `target` is not excluded.
    pub fn has_https_upstream_proxy(&self, target: &TargetDescriptor) -> bool {
        let config = self.config.load();
        (config.http_proxy.is_some() || config.https_proxy.is_some()) && !config.excludes(target)
    }

    pub fn reset(&self) {
        self.config.store(Arc::new(UpstreamProxyConfig::default()));
    }
}

/// Adjust NO_PROXY at startup: with an upstream proxy, loopback targets bypass
/// it unless the list carries the `<-loopback>` marker, which is removed.
pub fn apply_loopback_defaults(no_proxy: Option<&str>, has_upstream_proxy: bool) -> Option<String> {
    if !has_upstream_proxy {
        return no_proxy.map(str::to_string);
    }
    let mut parts: Vec<String> = no_proxy
        .map(|list| list.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();

    if parts.iter().any(|p| p == LOOPBACK_DISABLE) {
        debug!("NO_PROXY contains '{LOOPBACK_DISABLE}', loopback targets will use the upstream proxy");
        parts.retain(|p| p != LOOPBACK_DISABLE);
    } else {
        for loopback in ["localhost", "127.0.0.1"] {
            if !parts.iter().any(|p| p == loopback) {
                parts.push(loopback.to_string());
            }
        }
    }
    Some(parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str, ssl: bool) -> TargetDescriptor {
        TargetDescriptor::from_host_header(host, ssl).unwrap()
    }

    fn manager(no_proxy: Option<&str>) -> UpstreamProxyManager {
        let m = UpstreamProxyManager::new();
        m.init(Some("http://proxy.acme.com:8080"), None, no_proxy).unwrap();
        m
    }

    #[test]
    fn rejects_incomplete_proxy_urls() {
        let m = UpstreamProxyManager::new();
        for bad in ["proxy.acme.com:8080", "http://proxy.acme.com", "http://proxy.acme.com:8080/path"] {
            let err = m.init(Some(bad), None, None).unwrap_err().to_string();
            assert_eq!(
                err,
                format!(
                    "Invalid HTTP_PROXY argument '{bad}'. It must be a complete URL without path. \
                     Example: http://proxy.acme.com:8080"
                )
            );
        }
        assert!(m.init(None, Some("https://proxy.acme.com:443"), None).is_ok());
    }

    #[test]
    fn no_proxy_suppresses_localhost() {
        for rule in ["localhost", "*host", "local*", "*"] {
            let m = manager(Some(rule));
            let mut options = AgentOptions::default();
            assert!(!m.set_upstream_proxy_config(&target("localhost:5000", false), false, &mut options), "{rule}");
            assert!(options.upstream.is_none());
            assert!(!m.has_https_upstream_proxy(&target("localhost:5000", true)));
        }
    }

    #[test]
    fn non_matching_no_proxy_keeps_upstream() {
        let m = manager(Some("google.com"));
        let mut options = AgentOptions::default();
        assert!(m.set_upstream_proxy_config(&target("localhost:5000", false), false, &mut options));
        assert_eq!(
            options.upstream,
            Some(UpstreamProxy { host: "proxy.acme.com".into(), port: 8080, secure: false })
        );
        assert!(m.has_https_upstream_proxy(&target("localhost", true)));
    }

    #[test]
    fn https_proxy_preferred_for_tls_targets() {
        let m = UpstreamProxyManager::new();
        m.init(Some("http://plain.acme.com:8080"), Some("https://secure.acme.com:8443"), None).unwrap();

        let mut options = AgentOptions::default();
        assert!(m.set_upstream_proxy_config(&target("www.acme.com", true), true, &mut options));
        assert_eq!(options.upstream.as_ref().map(|p| p.host.as_str()), Some("secure.acme.com"));
        assert!(options.upstream.as_ref().is_some_and(|p| p.secure));

        let mut options = AgentOptions::default();
        assert!(m.set_upstream_proxy_config(&target("www.acme.com", false), false, &mut options));
        assert_eq!(options.upstream.map(|p| p.host), Some("plain.acme.com".into()));
    }

    #[test]
    fn https_proxy_alone_does_not_serve_plain_targets() {
        let m = UpstreamProxyManager::new();
        m.init(None, Some("http://secure.acme.com:8443"), None).unwrap();
        let mut options = AgentOptions::default();
        assert!(!m.set_upstream_proxy_config(&target("www.acme.com", false), false, &mut options));
        assert!(m.has_https_upstream_proxy(&target("www.acme.com", true)));
    }

    #[test]
    fn no_proxy_port_and_ipv6_rules() {
        let m = manager(Some("intranet.local:8080, [::1], 10.0.0.1"));
        let mut options = AgentOptions::default();
        assert!(!m.set_upstream_proxy_config(&target("intranet.local:8080", false), false, &mut options));
        assert!(m.set_upstream_proxy_config(&target("intranet.local:9090", false), false, &mut options));
        assert!(!m.has_https_upstream_proxy(&TargetDescriptor::from_authority("[::1]:443").unwrap()));
        assert!(!m.has_https_upstream_proxy(&target("10.0.0.1", true)));
    }

    #[test]
    fn rejects_malformed_no_proxy() {
        let m = UpstreamProxyManager::new();
        let err = m.init(None, None, Some("good.local, bad host")).unwrap_err().to_string();
        assert!(err.contains("'bad host'"), "{err}");
        assert!(m.init(None, None, Some("[::1")).is_err());
        assert!(m.init(None, None, Some("host:notaport")).is_err());
    }

    #[test]
    fn reset_clears_everything() {
        let m = manager(None);
        assert!(m.has_https_upstream_proxy(&target("www.acme.com", true)));
        m.reset();
        assert!(!m.has_https_upstream_proxy(&target("www.acme.com", true)));
    }

    #[test]
    fn loopback_defaults() {
        assert_eq!(apply_loopback_defaults(None, false), None);
        assert_eq!(apply_loopback_defaults(None, true).as_deref(), Some("localhost,127.0.0.1"));
        assert_eq!(
            apply_loopback_defaults(Some("acme.com, localhost"), true).as_deref(),
            Some("acme.com,localhost,127.0.0.1")
        );
        assert_eq!(apply_loopback_defaults(Some("acme.com,<-loopback>"), true).as_deref(), Some("acme.com"));
    }
}
