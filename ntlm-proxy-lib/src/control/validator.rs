//! Validation of configuration posted to the control API. Error messages are
//! shown to users verbatim.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::auth::SsoFacadeFactory;
use crate::ntlm::NtlmVersion;
use crate::store::HostCredential;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

fn invalid(message: impl Into<String>) -> ValidationError {
    ValidationError(message.into())
}

static HOSTNAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$").ok()
});
static HOSTNAME_WITH_PORT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9]):\d{1,5}$").ok()
});

const USERNAME_FORBIDDEN: &[char] = &['"', '/', '\\', '[', ']', ':', ';', '|', '=', ',', '+', '*', '?', '<', '>'];
const DOMAIN_FORBIDDEN: &[char] = &['"', '/', '\\', ':', '|', '*', '?', '<', '>'];

/// Hostname or FQDN; `*` wildcards are accepted anywhere.
pub fn valid_hostname_or_fqdn(host: &str) -> bool {
    if host.contains('\n') {
        return false;
    }
    let without_wildcards = host.replace('*', "a");
    HOSTNAME.as_ref().is_some_and(|re| re.is_match(&without_wildcards))
}

/// `hostname:port`, without wildcards.
pub fn valid_hostname_or_fqdn_with_port(host: &str) -> bool {
    !host.contains('\n') && HOSTNAME_WITH_PORT.as_ref().is_some_and(|re| re.is_match(host))
}

pub fn escape_html(unsafe_text: &str) -> String {
    unsafe_text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#039;")
}

fn valid_username(username: &str) -> bool {
    username.chars().count() <= 104 && !username.contains(USERNAME_FORBIDDEN)
}

fn valid_domain_or_workstation(value: &str) -> bool {
    value.chars().count() <= 15 && !value.contains(DOMAIN_FORBIDDEN)
}

/// Body of `POST /ntlm-config`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NtlmConfigRequest {
    pub ntlm_host: Option<String>,
    pub ntlm_hosts: Option<Value>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub domain: Option<String>,
    pub workstation: Option<String>,
    pub ntlm_version: Option<Value>,
}

/// A validated `/ntlm-config` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmConfig {
    pub hosts: Vec<String>,
    pub credential: HostCredential,
}

/// Body of `POST /ntlm-sso`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NtlmSsoRequest {
    pub ntlm_hosts: Option<Value>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn hosts_array(value: &Value) -> Result<Vec<String>, ValidationError> {
    let not_array = || invalid("Invalid ntlmHosts, must be an array.");
    value
        .as_array()
        .ok_or_else(not_array)?
        .iter()
        .map(|h| h.as_str().map(str::to_string).ok_or_else(not_array))
        .collect()
}

pub fn validate_ntlm_config(req: &NtlmConfigRequest) -> Result<NtlmConfig, ValidationError> {
    let hosts = match (&req.ntlm_hosts, non_empty(&req.ntlm_host)) {
        (Some(hosts), _) => Some(hosts_array(hosts)?),
        (None, Some(legacy)) => Some(vec![convert_legacy(legacy)?]),
        (None, None) => None,
    };
    let version = req.ntlm_version.as_ref().filter(|v| !matches!(v, Value::Null) && v.as_u64() != Some(0));
    let (Some(hosts), Some(username), Some(password), Some(version)) =
        (hosts, non_empty(&req.username), non_empty(&req.password), version)
    else {
        return Err(invalid(
            "Incomplete configuration. ntlmHosts, username, password and ntlmVersion are required fields.",
        ));
    };

    if let Some(host) = hosts
        .iter()
        .find(|h| !valid_hostname_or_fqdn(h) && !valid_hostname_or_fqdn_with_port(h))
    {
        return Err(invalid(format!(
            "Invalid host [{}] in ntlmHosts, must be one of: \
             1) a hostname or FQDN, wildcards accepted. \
             2) hostname or FQDN with port, wildcards not accepted \
             (localhost:8080 or www.google.com or *.acme.com are ok, https://www.google.com:443/search is not ok).",
            escape_html(host)
        )));
    }

    if !valid_username(username) {
        return Err(invalid("Username contains invalid characters or is too long."));
    }
    let domain = non_empty(&req.domain);
    if domain.is_some_and(|d| !valid_domain_or_workstation(d)) {
        return Err(invalid("Domain contains invalid characters or is too long."));
    }
    let workstation = non_empty(&req.workstation);
    if workstation.is_some_and(|w| !valid_domain_or_workstation(w)) {
        return Err(invalid("Workstation contains invalid characters or is too long."));
    }
    let ntlm_version = match version.as_u64() {
        Some(1) => NtlmVersion::V1,
        Some(2) => NtlmVersion::V2,
        _ => return Err(invalid("Invalid ntlmVersion. Must be 1 or 2.")),
    };

    Ok(NtlmConfig {
        hosts,
        credential: HostCredential::new(username, password, domain, workstation, ntlm_version),
    })
}

/// Validate a legacy `ntlmHost` URL and reduce it to `host[:port]`.
pub fn convert_legacy(ntlm_host: &str) -> Result<String, ValidationError> {
    let url = Url::parse(ntlm_host)
        .ok()
        .filter(|u| u.has_host() && !u.cannot_be_a_base())
        .ok_or_else(|| invalid("Invalid ntlmHost, must be a valid URL (like https://www.google.com)"))?;
    if url.path() != "/" || url.query().is_some() {
        return Err(invalid(
            "Invalid ntlmHost, must not contain any path or query \
             (https://www.google.com is ok, https://www.google.com/search is not ok)",
        ));
    }
    let host = url.host_str().unwrap_or_default();
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

pub fn validate_sso_config(req: &NtlmSsoRequest, sso: &dyn SsoFacadeFactory) -> Result<Vec<String>, ValidationError> {
    if !sso.is_supported() {
        return Err(invalid("SSO is not supported on this platform. Only Windows OSs are supported."));
    }
    let Some(hosts) = &req.ntlm_hosts else {
        return Err(invalid("Incomplete configuration. ntlmHosts is an required field."));
    };
    let hosts = hosts_array(hosts)?;
    if let Some(host) = hosts.iter().find(|h| !valid_hostname_or_fqdn(h)) {
        return Err(invalid(format!(
            "Invalid host [{}] in ntlmHosts, must be only a hostname or FQDN \
             (localhost or www.google.com is ok, https://www.google.com:443/search is not ok). Wildcards are accepted.",
            escape_html(host)
        )));
    }
    Ok(hosts)
}
