//! Seam to the operating system's single sign-on facility.
//!
//! Tokens are opaque `WWW-Authenticate`/`Authorization` header values. The
//! handle is released when the facade is dropped.

use std::fmt;

use rustls_pki_types::CertificateDer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SsoError {
    #[error("SSO is not supported on this platform. Only Windows OSs are supported.")]
    Unsupported,

    #[error("SSO facility failed: {0}")]
    Facility(String),
}

/// One SSO negotiation context, bound to a single connection.
pub trait SsoFacade: Send {
    /// Header value opening the exchange, e.g. `Negotiate <token>`.
    fn create_auth_request_header(&mut self) -> Result<String, SsoError>;

    /// Header value answering the challenge in `www_authenticate`. An empty
    /// string means the facility has nothing more to send.
    fn create_auth_response_header(&mut self, www_authenticate: &str) -> Result<String, SsoError>;
}

/// Mechanism an SSO context is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityPackage {
    Negotiate,
    Ntlm,
}

impl SecurityPackage {
    /// Scheme token used in `WWW-Authenticate` and `Authorization`.
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityPackage::Negotiate => "Negotiate",
            SecurityPackage::Ntlm => "NTLM",
        }
    }
}

impl fmt::Display for SecurityPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait SsoFacadeFactory: Send + Sync {
    fn is_supported(&self) -> bool;

    /// Create a context for `package` against `target_host`. For TLS targets
    /// `peer_certificate` is the certificate the target presented, which the
    /// facility hashes into the channel bindings.
    fn create(
        &self,
        package: SecurityPackage,
        target_host: &str,
        peer_certificate: Option<&CertificateDer<'_>>,
    ) -> Result<Box<dyn SsoFacade>, SsoError>;
}

/// Factory used on platforms without an SSO facility.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedSso;

impl SsoFacadeFactory for UnsupportedSso {
    fn is_supported(&self) -> bool {
        false
    }

    fn create(
        &self,
        _package: SecurityPackage,
        _target_host: &str,
        _peer_certificate: Option<&CertificateDer<'_>>,
    ) -> Result<Box<dyn SsoFacade>, SsoError> {
        Err(SsoError::Unsupported)
    }
}
