//! Side-channel certificate checks for HTTPS targets.
//!
//! Clients of the proxy usually run with certificate checks disabled, and
//! tunnelled connections are never inspected. To still surface a broken or
//! untrusted target certificate, the proxy opens its own verifying TLS
//! connection to the target and logs a warning when the handshake fails.
//! Requests are never blocked by these checks.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Mutex;

use ahash::AHashSet;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::proxy::agent::verify_certificate;
use crate::target::TargetDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpsValidationLevel {
    /// Check every tunnelled target. Intercepted requests are verified by
    /// the outbound agent itself.
    Strict,
    /// Check each target once, loopback targets excluded.
    #[default]
    Warn,
    /// No checks.
    Unsafe,
}

impl FromStr for HttpsValidationLevel {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "warn" => Ok(Self::Warn),
            "unsafe" => Ok(Self::Unsafe),
            _ => Err(ProxyError::Config(format!(
                "Invalid HTTPS validation level ({s}). Valid values are \"strict\", \"warn\" or \"unsafe\""
            ))),
        }
    }
}

impl fmt::Display for HttpsValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Strict => "strict",
            Self::Warn => "warn",
            Self::Unsafe => "unsafe",
        })
    }
}

pub struct HttpsValidation {
    level: HttpsValidationLevel,
    validated: Mutex<AHashSet<String>>,
}

impl HttpsValidation {
    /// Disabling `reject_unauthorized` turns every check off, whatever `level` says.
    pub fn new(level: HttpsValidationLevel, reject_unauthorized: bool) -> Self {
        let level = if reject_unauthorized {
            level
        } else {
            warn!("TLS certificate checks are disabled, this overrides any HTTPS validation level");
            HttpsValidationLevel::Unsafe
        };
        debug!(%level, "HTTPS validation");
        Self { level, validated: Mutex::new(AHashSet::new()) }
    }

    pub fn level(&self) -> HttpsValidationLevel {
        self.level
    }

    /// Check the target of an intercepted request.
    pub fn validate_request(&self, target: &TargetDescriptor) {
        if !target.is_ssl() || self.level == HttpsValidationLevel::Strict {
            return;
        }
        self.validate_peer_certificate(target);
    }

    /// Check the target of a tunnelled CONNECT.
    pub fn validate_connect(&self, target: &TargetDescriptor) {
        if !target.is_ssl() {
            return;
        }
        self.validate_peer_certificate(target);
    }

    fn validate_peer_certificate(&self, target: &TargetDescriptor) {
        if !self.should_check(target) {
            return;
        }
        let target = target.clone();
        tokio::spawn(async move {
            match verify_certificate(&target).await {
                Ok(()) => debug!(target = %target, "certificate validated"),
                Err(e) => warn!(host = target.host(), error = %e, "Certificate validation failed"),
            }
        });
    }

    /// Whether `target` needs a check now. On level warn the target is
    /// remembered so it is checked only once.
    fn should_check(&self, target: &TargetDescriptor) -> bool {
        match self.level {
            HttpsValidationLevel::Unsafe => return false,
            HttpsValidationLevel::Warn => {
                if target.is_localhost() {
                    return false;
                }
                let mut validated = self.validated.lock().unwrap_or_else(|p| p.into_inner());
                if !validated.insert(target.href().to_string()) {
                    return false;
                }
            }
            HttpsValidationLevel::Strict => {}
        }
        if target.hostname().parse::<IpAddr>().is_ok() {
            warn!(
                hostname = target.hostname(),
                "Target for HTTPS request is an IP address. Will not validate the certificate. Use hostnames for validation support."
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn https(authority: &str) -> TargetDescriptor {
        TargetDescriptor::from_authority(authority).unwrap()
    }

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!("STRICT".parse::<HttpsValidationLevel>().unwrap(), HttpsValidationLevel::Strict);
        assert_eq!(" warn ".parse::<HttpsValidationLevel>().unwrap(), HttpsValidationLevel::Warn);
        assert_eq!("unsafe".parse::<HttpsValidationLevel>().unwrap(), HttpsValidationLevel::Unsafe);
        let err = "loose".parse::<HttpsValidationLevel>().unwrap_err().to_string();
        assert!(err.contains("Valid values are"), "{err}");
    }

    #[test]
    fn warn_checks_each_target_once_and_skips_loopback() {
        let v = HttpsValidation::new(HttpsValidationLevel::Warn, true);
        assert!(v.should_check(&https("www.acme.com:443")));
        assert!(!v.should_check(&https("www.acme.com:443")));
        assert!(v.should_check(&https("www.acme.com:8443")));
        assert!(!v.should_check(&https("localhost:443")));
        assert!(!v.should_check(&https("10.0.0.1:443")));
    }

    #[test]
    fn strict_checks_every_time() {
        let v = HttpsValidation::new(HttpsValidationLevel::Strict, true);
        assert!(v.should_check(&https("www.acme.com:443")));
        assert!(v.should_check(&https("www.acme.com:443")));
        assert!(v.should_check(&https("localhost:443")));
        assert!(!v.should_check(&https("[::1]:443")));
    }

    #[test]
    fn disabled_certificate_checks_force_unsafe() {
        let v = HttpsValidation::new(HttpsValidationLevel::Strict, false);
        assert_eq!(v.level(), HttpsValidationLevel::Unsafe);
        assert!(!v.should_check(&https("www.acme.com:443")));
    }
}
