//! Per-host credentials and SSO host patterns.

use std::sync::RwLock;

use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::ntlm::NtlmVersion;
use crate::target::TargetDescriptor;

/// Credentials injected for one configured host pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCredential {
    pub username: String,
    pub password: String,
    /// Upper-cased NetBIOS domain, empty when not supplied.
    pub domain: String,
    /// Upper-cased workstation; `None` falls back to the local hostname.
    pub workstation: Option<String>,
    pub ntlm_version: NtlmVersion,
}

impl HostCredential {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        domain: Option<&str>,
        workstation: Option<&str>,
        ntlm_version: NtlmVersion,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            domain: domain.map(str::to_uppercase).unwrap_or_default(),
            workstation: workstation.filter(|w| !w.is_empty()).map(str::to_uppercase),
            ntlm_version,
        }
    }
}

/// One configured host pattern: `host`, `host:port`, or a `*` wildcard
/// matched against the hostname only.
#[derive(Debug, Clone)]
pub struct HostPattern {
    pattern: String,
    wildcard: Option<Regex>,
}

impl HostPattern {
    /// Normalise `pattern`. Returns `None` for a wildcard that does not compile.
    pub fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim().to_ascii_lowercase();
        let wildcard = if pattern.contains('*') { Some(compile_wildcard(&pattern)?) } else { None };
        Some(Self { pattern, wildcard })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    fn is_exact(&self, key: &str) -> bool {
        self.wildcard.is_none() && self.pattern == key
    }

    /// Any of the keys a credential lookup would try for `target` hits this pattern.
    pub fn matches(&self, target: &TargetDescriptor) -> bool {
        match &self.wildcard {
            Some(re) => re.is_match(target.hostname()),
            None => {
                self.pattern == format!("{}:{}", target.hostname(), target.port())
                    || self.pattern == target.host()
                    || self.pattern == target.hostname()
            }
        }
    }
}

struct CredentialEntry {
    host: HostPattern,
    credential: HostCredential,
}

/// Hostnames eligible for Negotiate single sign-on.
#[derive(Default)]
pub struct SsoHostSet {
    exact: Vec<String>,
    wildcards: Vec<Regex>,
}

impl SsoHostSet {
    pub fn new(hosts: &[String]) -> Self {
        let mut set = Self::default();
        for host in hosts {
            if host.contains('*') {
                if let Some(re) = compile_wildcard(host) {
                    set.wildcards.push(re);
                }
            } else {
                set.exact.push(host.to_ascii_lowercase());
            }
        }
        set
    }

    fn matches(&self, target: &TargetDescriptor) -> bool {
        let with_port = format!("{}:{}", target.hostname(), target.port());
        if self.exact.iter().any(|h| *h == target.hostname() || *h == with_port) {
            return true;
        }
        self.wildcards.iter().any(|re| re.is_match(target.hostname()))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    // configuration order is kept so wildcard lookups pick the first match
    hosts: Vec<CredentialEntry>,
    sso: SsoHostSet,
}

/// Answers whether a target needs injected authentication, and with which credentials.
///
/// Explicit credentials always take precedence over SSO for the same host.
#[derive(Default)]
pub struct ConfigStore {
    inner: RwLock<Inner>,
}

/// Compile a `*` wildcard host pattern into an anchored, case-insensitive regex.
pub(crate) fn compile_wildcard(pattern: &str) -> Option<Regex> {
    let body = pattern.split('*').map(regex::escape).collect::<Vec<_>>().join(".*");
    match RegexBuilder::new(&format!("^{body}$")).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern, error = %e, "Ignoring host pattern that does not compile");
            None
        }
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `credential` for every pattern in `hosts`. An existing entry for the
    /// same pattern is replaced as a whole.
    pub fn update_config(&self, hosts: &[String], credential: HostCredential) {
        let Ok(mut inner) = self.inner.write() else {
            warn!("Config store lock poisoned, update dropped");
            return;
        };
        for host in hosts {
            let Some(host) = HostPattern::parse(host) else {
                continue;
            };
            let entry = CredentialEntry { host, credential: credential.clone() };
            match inner.hosts.iter_mut().find(|e| e.host.pattern == entry.host.pattern) {
                Some(existing) => *existing = entry,
                None => inner.hosts.push(entry),
            }
        }
    }

    pub fn get(&self, target: &TargetDescriptor) -> Option<HostCredential> {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Config store lock poisoned");
                return None;
            }
        };
        Self::lookup(&inner, target).map(|e| e.credential.clone())
    }

    fn lookup<'a>(inner: &'a Inner, target: &TargetDescriptor) -> Option<&'a CredentialEntry> {
        let with_port = format!("{}:{}", target.hostname(), target.port());
        let exact = |key: &str| inner.hosts.iter().find(|e| e.host.is_exact(key));

        exact(&with_port)
            .or_else(|| exact(target.host()))
            .or_else(|| exact(target.hostname()))
            .or_else(|| {
                inner.hosts.iter().find(|e| e.host.wildcard.is_some() && e.host.matches(target))
            })
    }

    pub fn exists(&self, target: &TargetDescriptor) -> bool {
        match self.inner.read() {
            Ok(inner) => Self::lookup(&inner, target).is_some(),
            Err(_) => false,
        }
    }

    /// Replace the SSO host set.
    pub fn set_sso_config(&self, hosts: &[String]) {
        match self.inner.write() {
            Ok(mut inner) => inner.sso = SsoHostSet::new(hosts),
            Err(_) => warn!("Config store lock poisoned, SSO update dropped"),
        }
    }

    pub fn exists_sso(&self, target: &TargetDescriptor) -> bool {
        match self.inner.read() {
            Ok(inner) => inner.sso.matches(target),
            Err(_) => false,
        }
    }

    /// True when the target matches an explicit credential or an SSO pattern.
    pub fn exists_or_use_sso(&self, target: &TargetDescriptor) -> bool {
        self.exists(target) || self.exists_sso(target)
    }

    /// True only when an SSO pattern matches and no explicit credential does.
    pub fn use_sso(&self, target: &TargetDescriptor) -> bool {
        self.exists_sso(target) && !self.exists(target)
    }

    pub fn clear(&self) {
        match self.inner.write() {
            Ok(mut inner) => *inner = Inner::default(),
            Err(_) => warn!("Config store lock poisoned, clear dropped"),
        }
    }
}
