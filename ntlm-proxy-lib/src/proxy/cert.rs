//! Certificates for intercepted CONNECT tunnels.
//!
//! A throwaway certificate authority is generated when the proxy starts, and
//! each intercepted host gets a leaf certificate signed by it. Acceptors are
//! cached per hostname for the life of the process.

use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::error::{ProxyError, Result};

const CA_COMMON_NAME: &str = "NTLM Proxy Interception CA";

pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_der: CertificateDer<'static>,
    acceptors: Mutex<AHashMap<String, TlsAcceptor>>,
}

fn tls_err(context: &str) -> impl FnOnce(rcgen::Error) -> ProxyError + '_ {
    move |e| ProxyError::Tls(format!("{context}: {e}"))
}

impl CertificateAuthority {
    pub fn generate() -> Result<Self> {
        let key = KeyPair::generate().map_err(tls_err("Failed to generate CA key"))?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(tls_err("Invalid CA parameters"))?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, CA_COMMON_NAME);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign, KeyUsagePurpose::DigitalSignature];
        let cert = params.self_signed(&key).map_err(tls_err("Failed to sign CA certificate"))?;
        Ok(Self {
            issuer: Issuer::new(params, key),
            ca_der: CertificateDer::from(cert.der().to_vec()),
            acceptors: Mutex::new(AHashMap::new()),
        })
    }

    /// DER of the CA certificate, for clients that want to trust it.
    pub fn ca_certificate(&self) -> &CertificateDer<'static> {
        &self.ca_der
    }

    /// Acceptor presenting a certificate for `hostname`.
    pub fn acceptor_for(&self, hostname: &str) -> Result<TlsAcceptor> {
        let mut cache = self.acceptors.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(acceptor) = cache.get(hostname) {
            return Ok(acceptor.clone());
        }
        let acceptor = self.issue(hostname)?;
        cache.insert(hostname.to_string(), acceptor.clone());
        debug!(hostname, "issued interception certificate");
        Ok(acceptor)
    }

    fn issue(&self, hostname: &str) -> Result<TlsAcceptor> {
        let key = KeyPair::generate().map_err(tls_err("Failed to generate host key"))?;
        let mut params = CertificateParams::new(vec![hostname.to_string()]).map_err(tls_err("Invalid host name"))?;
        params.distinguished_name.push(DnType::CommonName, hostname);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let cert = params.signed_by(&key, &self.issuer).map_err(tls_err("Failed to sign host certificate"))?;

        let chain = vec![CertificateDer::from(cert.der().to_vec()), self.ca_der.clone()];
        let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, private_key)
            .map_err(|e| ProxyError::Tls(format!("Failed to build TLS config: {e}")))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptors_are_cached_per_host() {
        let ca = CertificateAuthority::generate().unwrap();
        assert!(!ca.ca_certificate().is_empty());
        ca.acceptor_for("www.acme.com").unwrap();
        ca.acceptor_for("www.acme.com").unwrap();
        ca.acceptor_for("127.0.0.1").unwrap();
        assert_eq!(ca.acceptors.lock().unwrap().len(), 2);
    }
}
