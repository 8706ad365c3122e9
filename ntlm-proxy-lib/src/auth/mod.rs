//! NTLM and Negotiate handshakes performed on behalf of proxied clients.

mod negotiate_manager;
mod ntlm_manager;
pub mod sso;
pub mod state;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONNECTION, COOKIE, HOST, WWW_AUTHENTICATE};
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Request};
use thiserror::Error;
use tracing::debug;

use crate::ntlm::NtlmError;
use crate::proxy::agent::{AgentError, ReqBody};
use crate::proxy::synthetic_response::full_body;

pub use negotiate_manager::NegotiateManager;
pub use ntlm_manager::NtlmManager;
pub use sso::{SecurityPackage, SsoError, SsoFacade, SsoFacadeFactory, UnsupportedSso};
pub use state::{step, AuthAction, AuthEvent, AuthState};

/// Anything that aborts a handshake. The caller falls back to passing the
/// original request through unauthenticated.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no credential configured for {0}")]
    MissingCredential(String),

    #[error("server did not answer with an NTLM challenge (status {0})")]
    NoChallenge(u16),

    #[error("server does not accept {package} authentication (status {status})")]
    MechanismNotAccepted { package: SecurityPackage, status: u16, offers_ntlm: bool },

    #[error("invalid challenge: {0}")]
    Codec(#[from] NtlmError),

    #[error("SSO facility: {0}")]
    Sso(#[from] SsoError),

    #[error("transport: {0}")]
    Transport(#[from] AgentError),

    #[error("request could not be rebuilt: {0}")]
    Request(String),

    #[error("unexpected state {0}")]
    ProtocolViolation(AuthState),
}

/// Environment switch that logs auth header values at debug level.
pub(crate) const DEBUG_HEADERS_ENV: &str = "NTLM_PROXY_DEBUG_HEADERS";

pub(crate) fn debug_headers_enabled() -> bool {
    std::env::var(DEBUG_HEADERS_ENV).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

pub(crate) fn debug_header(label: &str, value: &str) {
    if debug_headers_enabled() {
        debug!(header = %value, "{label}");
    }
}

fn header_value(value: &str) -> Result<HeaderValue, HandshakeError> {
    HeaderValue::from_str(value).map_err(|e| HandshakeError::Request(e.to_string()))
}

/// Bodiless copy of `original` carrying only the first token, the cookies and
/// keep-alive headers.
pub(crate) fn handshake_request(
    original: &Parts,
    authorization: &str,
    via_upstream: bool,
) -> Result<Request<ReqBody>, HandshakeError> {
    let mut req = Request::builder()
        .method(original.method.clone())
        .uri(original.uri.clone())
        .body(full_body(Bytes::new()))
        .map_err(|e| HandshakeError::Request(e.to_string()))?;
    let headers = req.headers_mut();
    if let Some(host) = original.headers.get(HOST) {
        headers.insert(HOST, host.clone());
    }
    headers.insert(AUTHORIZATION, header_value(authorization)?);
    for cookie in original.headers.get_all(COOKIE) {
        headers.append(COOKIE, cookie.clone());
    }
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    if via_upstream {
        headers.insert(HeaderName::from_static("proxy-connection"), HeaderValue::from_static("keep-alive"));
    }
    Ok(req)
}

/// Copy of `original` with `body`, optionally replacing `Authorization`.
pub(crate) fn replay_request(
    original: &Parts,
    body: Bytes,
    authorization: Option<&str>,
) -> Result<Request<ReqBody>, HandshakeError> {
    let mut req = Request::builder()
        .method(original.method.clone())
        .uri(original.uri.clone())
        .version(original.version)
        .body(full_body(body))
        .map_err(|e| HandshakeError::Request(e.to_string()))?;
    *req.headers_mut() = original.headers.clone();
    if let Some(token) = authorization {
        req.headers_mut().insert(AUTHORIZATION, header_value(token)?);
    }
    Ok(req)
}

fn www_authenticate_values(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers.get_all(WWW_AUTHENTICATE).iter().filter_map(|v| v.to_str().ok())
}

/// The comma separated list of any `WWW-Authenticate` header names `mechanism`
/// as a scheme token. Matching is case sensitive.
fn accepts_mechanism(headers: &HeaderMap, mechanism: &str) -> bool {
    www_authenticate_values(headers).any(|value| {
        value
            .split(',')
            .filter_map(|item| item.split_whitespace().next())
            .any(|scheme| scheme == mechanism)
    })
}

/// First `WWW-Authenticate` value carrying a `<mechanism> <token>` payload.
fn challenge_value<'a>(headers: &'a HeaderMap, mechanism: &str) -> Option<&'a str> {
    www_authenticate_values(headers).find(|value| {
        value.strip_prefix(mechanism).is_some_and(|rest| rest.starts_with(' '))
    })
}

pub fn accepts_ntlm_authentication(headers: &HeaderMap) -> bool {
    accepts_mechanism(headers, "NTLM")
}

pub fn can_handle_ntlm_authentication(status: u16, headers: &HeaderMap) -> bool {
    status == 401 && challenge_value(headers, "NTLM").is_some()
}

pub fn accepts_negotiate_authentication(headers: &HeaderMap) -> bool {
    accepts_mechanism(headers, "Negotiate")
}

pub(crate) fn ntlm_challenge(headers: &HeaderMap) -> Option<&str> {
    challenge_value(headers, "NTLM")
}

pub(crate) fn negotiate_challenge(headers: &HeaderMap) -> Option<&str> {
    challenge_value(headers, "Negotiate")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(values: &[&str]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for v in values {
            map.append(WWW_AUTHENTICATE, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn ntlm_token_must_match_exactly() {
        assert!(accepts_ntlm_authentication(&headers(&["NTLM"])));
        assert!(accepts_ntlm_authentication(&headers(&["Negotiate, NTLM"])));
        assert!(accepts_ntlm_authentication(&headers(&["Basic realm=\"x\"", "NTLM"])));
        assert!(!accepts_ntlm_authentication(&headers(&["ntlm"])));
        assert!(!accepts_ntlm_authentication(&headers(&["NTLMv2"])));
        assert!(!accepts_ntlm_authentication(&headers(&[])));
    }

    #[test]
    fn ntlm_challenge_needs_401_and_payload() {
        let challenge = headers(&["NTLM TlRMTVNTUAACAAAA"]);
        assert!(can_handle_ntlm_authentication(401, &challenge));
        assert!(!can_handle_ntlm_authentication(200, &challenge));
        assert!(!can_handle_ntlm_authentication(401, &headers(&["NTLM"])));
        assert_eq!(ntlm_challenge(&challenge), Some("NTLM TlRMTVNTUAACAAAA"));
    }

    #[test]
    fn negotiate_detection() {
        let advert = headers(&["Negotiate, NTLM"]);
        assert!(accepts_negotiate_authentication(&advert));
        assert!(negotiate_challenge(&advert).is_none());

        let token = headers(&["Negotiate YIIGhgYGKwYBBQUCoIIGejCCBnag"]);
        assert!(accepts_negotiate_authentication(&token));
        assert_eq!(negotiate_challenge(&token), Some("Negotiate YIIGhgYGKwYBBQUCoIIGejCCBnag"));
        assert!(!accepts_negotiate_authentication(&headers(&["NegotiateX"])));
    }

    #[test]
    #[serial_test::serial]
    fn debug_headers_switch() {
        std::env::remove_var(DEBUG_HEADERS_ENV);
        assert!(!debug_headers_enabled());
        std::env::set_var(DEBUG_HEADERS_ENV, "TRUE");
        assert!(debug_headers_enabled());
        std::env::set_var(DEBUG_HEADERS_ENV, "0");
        assert!(!debug_headers_enabled());
        std::env::remove_var(DEBUG_HEADERS_ENV);
    }
}
