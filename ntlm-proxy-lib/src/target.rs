//! Normalized destination of a proxied request.

use std::fmt;

use url::{Host, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Destination of a request, built from a `Host` header or a CONNECT authority.
///
/// Two descriptors denote the same server when their [`href`](Self::href) is equal.
#[derive(Debug, Clone)]
pub struct TargetDescriptor {
    scheme: Scheme,
    hostname: String,
    port: u16,
    host: String,
    href: String,
}

impl TargetDescriptor {
    /// Parse a `Host` header value. Returns `None` when the value is not a
    /// bare `host[:port]`.
    pub fn from_host_header(host: &str, is_ssl: bool) -> Option<Self> {
        let scheme = if is_ssl { Scheme::Https } else { Scheme::Http };
        Self::parse(scheme, host)
    }

    /// Parse the authority of a CONNECT request, which always targets TLS.
    pub fn from_authority(authority: &str) -> Option<Self> {
        Self::parse(Scheme::Https, authority)
    }

    /// Parse a complete URL such as `http://proxy.acme.com:8080`.
    pub fn from_url(url: &Url) -> Option<Self> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return None,
        };
        let host = url.host()?;
        let hostname = match host {
            Host::Ipv6(addr) => addr.to_string(),
            Host::Ipv4(addr) => addr.to_string(),
            Host::Domain(d) => d.to_string(),
        };
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        let host_str = url.host_str()?;
        let host = match url.port() {
            Some(p) => format!("{host_str}:{p}"),
            None => host_str.to_string(),
        };
        let href = format!("{}://{}/", scheme.as_str(), host);
        Some(Self { scheme, hostname, port, host, href })
    }

    fn parse(scheme: Scheme, host: &str) -> Option<Self> {
        let host = host.trim();
        if host.is_empty() || host.contains(['/', '?', '#', '@', ' ']) {
            return None;
        }
        let url = Url::parse(&format!("{}://{host}", scheme.as_str())).ok()?;
        Self::from_url(&url)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn is_ssl(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// Hostname without port; IPv6 literals are returned without brackets.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `hostname[:port]`, the port is omitted when it is the scheme default.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Canonical form, e.g. `http://example.local:5000/`.
    pub fn href(&self) -> &str {
        &self.href
    }

    /// Authority with an explicit port, as used by CONNECT and absolute-form requests.
    pub fn authority(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }

    pub fn is_localhost(&self) -> bool {
        matches!(self.hostname.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

impl PartialEq for TargetDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.href == other.href
    }
}

impl Eq for TargetDescriptor {}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.href)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_header_with_port() {
        let t = TargetDescriptor::from_host_header("Example.local:5000", false).unwrap();
        assert_eq!(t.hostname(), "example.local");
        assert_eq!(t.port(), 5000);
        assert_eq!(t.host(), "example.local:5000");
        assert_eq!(t.href(), "http://example.local:5000/");
        assert!(!t.is_ssl());
    }

    #[test]
    fn default_port_is_omitted_from_href() {
        let t = TargetDescriptor::from_host_header("www.acme.com:443", true).unwrap();
        assert_eq!(t.port(), 443);
        assert_eq!(t.host(), "www.acme.com");
        assert_eq!(t.href(), "https://www.acme.com/");
    }

    #[test]
    fn ipv6_literal() {
        let t = TargetDescriptor::from_authority("[::1]:9002").unwrap();
        assert_eq!(t.hostname(), "::1");
        assert_eq!(t.port(), 9002);
        assert_eq!(t.authority(), "[::1]:9002");
        assert!(t.is_localhost());
    }

    #[test]
    fn rejects_paths_and_empty_hosts() {
        assert!(TargetDescriptor::from_host_header("", false).is_none());
        assert!(TargetDescriptor::from_host_header("host/path", false).is_none());
        assert!(TargetDescriptor::from_host_header("user@host", false).is_none());
    }

    #[test]
    fn equality_uses_href() {
        let a = TargetDescriptor::from_host_header("localhost:8080", false).unwrap();
        let b = TargetDescriptor::from_url(&Url::parse("http://LOCALHOST:8080/other").unwrap()).unwrap();
        assert_eq!(a, b);
        let c = TargetDescriptor::from_host_header("localhost:8080", true).unwrap();
        assert_ne!(a, c);
    }
}
