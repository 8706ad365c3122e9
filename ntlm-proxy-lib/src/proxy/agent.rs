//! Outbound HTTP/1.1 connections used to reach target servers.
//!
//! An [`Agent`] owns its sockets. NTLM authenticates a connection rather than
//! a request, so managed contexts use an agent limited to one socket that is
//! kept alive between requests. Destroying an agent closes every socket it
//! opened and fails any request still waiting on it.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use http::header::HOST;
use http::uri::{Authority, PathAndQuery, Scheme as UriScheme};
use http::{HeaderValue, Request, Response, Uri};
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

use crate::target::TargetDescriptor;
use crate::upstream::UpstreamProxy;

pub type ReqBody = BoxBody<Bytes, hyper::Error>;

const MAX_CONNECT_RESPONSE: usize = 16 * 1024;
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);
const MAX_IDLE_PER_AGENT: usize = 32;

static NEXT_AGENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent was destroyed")]
    Destroyed,

    #[error("could not resolve {host}: {source}")]
    Lookup { host: String, source: io::Error },

    #[error("could not connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("TLS handshake with {host} failed: {source}")]
    Tls { host: String, source: io::Error },

    #[error("invalid TLS server name {0}")]
    ServerName(String),

    #[error("upstream proxy answered CONNECT {target} with status {status}")]
    ConnectRefused { target: String, status: u16 },

    #[error("upstream proxy sent a malformed CONNECT response: {0}")]
    ConnectResponse(String),

    #[error("invalid request: {0}")]
    Request(String),

    #[error(transparent)]
    Http(#[from] hyper::Error),
}

impl AgentError {
    /// The target hostname could not be resolved.
    pub fn is_dns_failure(&self) -> bool {
        matches!(self, AgentError::Lookup { .. })
    }

    pub fn is_connection_reset(&self) -> bool {
        let kind = match self {
            AgentError::Connect { source, .. } | AgentError::Tls { source, .. } => source.kind(),
            AgentError::Http(e) => {
                return std::error::Error::source(e)
                    .and_then(|s| s.downcast_ref::<io::Error>())
                    .is_some_and(|io| io.kind() == io::ErrorKind::ConnectionReset)
            }
            _ => return false,
        };
        kind == io::ErrorKind::ConnectionReset
    }
}

/// How an agent reaches its targets.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Keep sockets open between requests.
    pub keep_alive: bool,
    /// Upper bound on concurrently open sockets.
    pub max_sockets: Option<usize>,
    /// Verify the target's certificate chain.
    pub reject_unauthorized: bool,
    pub upstream: Option<UpstreamProxy>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self { keep_alive: true, max_sockets: None, reject_unauthorized: true, upstream: None }
    }
}

impl AgentOptions {
    /// Options for an NTLM managed context: one kept-alive socket.
    pub fn managed() -> Self {
        Self { max_sockets: Some(1), ..Self::default() }
    }

    /// Options for a throwaway agent that never reuses sockets.
    pub fn untracked() -> Self {
        Self { keep_alive: false, ..Self::default() }
    }
}

trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

type BoxedIo = Box<dyn Io>;

struct PooledConnection {
    key: String,
    sender: http1::SendRequest<ReqBody>,
}

pub struct Agent {
    id: u64,
    options: AgentOptions,
    idle: Mutex<Vec<PooledConnection>>,
    permits: Option<Arc<Semaphore>>,
    peer_certificate: Mutex<Option<CertificateDer<'static>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("destroyed", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Agent {
    pub fn new(options: AgentOptions) -> Self {
        let permits = options.max_sockets.map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            id: NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed),
            options,
            idle: Mutex::new(Vec::new()),
            permits,
            peer_certificate: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Requests are relayed through an upstream proxy.
    pub fn via_upstream(&self) -> bool {
        self.options.upstream.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Close every socket and refuse further requests.
    pub fn destroy(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
        if let Some(permits) = &self.permits {
            permits.close();
        }
        debug!(agent = self.id, "agent destroyed");
    }

    /// Certificate presented by the last target this agent completed a TLS
    /// handshake with.
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        self.peer_certificate.lock().ok().and_then(|cert| cert.clone())
    }

    async fn acquire_permit(&self) -> Result<Option<OwnedSemaphorePermit>, AgentError> {
        let Some(permits) = &self.permits else {
            return Ok(None);
        };
        let acquire = permits.clone().acquire_owned();
        tokio::select! {
            permit = acquire => Ok(Some(permit.map_err(|_| AgentError::Destroyed)?)),
            _ = self.cancel.cancelled() => Err(AgentError::Destroyed),
        }
    }

    /// Open a kept-alive socket to `target` ahead of the first request,
    /// unless one is already idle.
    pub async fn preconnect(&self, target: &TargetDescriptor) -> Result<(), AgentError> {
        if self.is_destroyed() {
            return Err(AgentError::Destroyed);
        }
        if !self.options.keep_alive {
            return Ok(());
        }
        let _permit = self.acquire_permit().await?;
        let key = target.href().to_string();
        let has_idle = self
            .idle
            .lock()
            .map(|idle| idle.iter().any(|c| c.key == key && !c.sender.is_closed()))
            .unwrap_or(false);
        if has_idle {
            return Ok(());
        }
        let sender = self.connect(target).await?;
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(PooledConnection { key, sender });
        }
        Ok(())
    }

    /// Send `req` to `target`, reusing a kept-alive socket when one is free.
    pub async fn send(&self, target: &TargetDescriptor, mut req: Request<ReqBody>) -> Result<Response<Incoming>, AgentError> {
        if self.is_destroyed() {
            return Err(AgentError::Destroyed);
        }
        self.prepare_request(target, &mut req)?;

        let _permit = self.acquire_permit().await?;

        let key = target.href().to_string();
        let mut sender = match self.take_idle(&key).await {
            Some(sender) => sender,
            None => self.connect(target).await?,
        };

        let response = tokio::select! {
            res = sender.send_request(req) => res?,
            _ = self.cancel.cancelled() => return Err(AgentError::Destroyed),
        };

        if self.options.keep_alive && !self.is_destroyed() {
            if let Ok(mut idle) = self.idle.lock() {
                idle.retain(|c| !c.sender.is_closed());
                if idle.len() < MAX_IDLE_PER_AGENT {
                    idle.push(PooledConnection { key, sender });
                }
            }
        }
        Ok(response)
    }

    async fn take_idle(&self, key: &str) -> Option<http1::SendRequest<ReqBody>> {
        let single_socket = self.options.max_sockets == Some(1);
        let mut sender = {
            let mut idle = self.idle.lock().ok()?;
            idle.retain(|c| !c.sender.is_closed());
            let pos = idle
                .iter()
                .position(|c| c.key == key && (single_socket || c.sender.is_ready()))?;
            idle.swap_remove(pos).sender
        };
        // the previous response body may still be streaming on the only socket
        if single_socket {
            tokio::select! {
                ready = sender.ready() => ready.ok()?,
                _ = self.cancel.cancelled() => return None,
            }
        }
        Some(sender)
    }

    /// Rewrite the URI to origin-form, or absolute-form for plain targets
    /// relayed through an upstream proxy, and make sure Host is present.
    fn prepare_request(&self, target: &TargetDescriptor, req: &mut Request<ReqBody>) -> Result<(), AgentError> {
        let path = req
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        let uri = if self.options.upstream.is_some() && !target.is_ssl() {
            let authority = Authority::try_from(target.authority()).map_err(|e| AgentError::Request(e.to_string()))?;
            Uri::builder()
                .scheme(UriScheme::HTTP)
                .authority(authority)
                .path_and_query(path)
                .build()
                .map_err(|e| AgentError::Request(e.to_string()))?
        } else {
            Uri::from(path)
        };
        *req.uri_mut() = uri;

        if !req.headers().contains_key(HOST) {
            let host = HeaderValue::from_str(target.host()).map_err(|e| AgentError::Request(e.to_string()))?;
            req.headers_mut().insert(HOST, host);
        }
        Ok(())
    }

    async fn connect(&self, target: &TargetDescriptor) -> Result<http1::SendRequest<ReqBody>, AgentError> {
        let io = tokio::select! {
            io = self.open_stream(target) => io?,
            _ = self.cancel.cancelled() => return Err(AgentError::Destroyed),
        };

        let (sender, conn) = http1::handshake(TokioIo::new(io)).await?;
        let cancel = self.cancel.clone();
        let agent = self.id;
        tokio::spawn(async move {
            tokio::select! {
                res = conn.with_upgrades() => {
                    if let Err(e) = res {
                        debug!(agent, error = %e, "outbound connection closed with error");
                    }
                }
                _ = cancel.cancelled() => trace!(agent, "outbound connection cancelled"),
            }
        });
        Ok(sender)
    }

    async fn open_stream(&self, target: &TargetDescriptor) -> Result<BoxedIo, AgentError> {
        match &self.options.upstream {
            None => {
                let tcp = self.connect_tcp(target.hostname(), target.port()).await?;
                if target.is_ssl() {
                    Ok(Box::new(self.tls_handshake(tcp, target.hostname()).await?))
                } else {
                    Ok(Box::new(tcp))
                }
            }
            Some(proxy) => {
                let tcp = self.connect_tcp(&proxy.host, proxy.port).await?;
                let mut proxy_io: BoxedIo = if proxy.secure {
                    // the proxy itself may use a private CA, as corporate proxies often do
                    Box::new(tls_connector(false).connect(server_name(&proxy.host)?, tcp).await.map_err(|source| {
                        AgentError::Tls { host: proxy.host.clone(), source }
                    })?)
                } else {
                    Box::new(tcp)
                };
                if !target.is_ssl() {
                    return Ok(proxy_io);
                }
                connect_through_proxy(&mut proxy_io, &target.authority()).await?;
                Ok(Box::new(self.tls_handshake(proxy_io, target.hostname()).await?))
            }
        }
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream, AgentError> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|source| AgentError::Lookup { host: host.to_string(), source })?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    if self.options.keep_alive {
                        let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE);
                        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
                            debug!(%addr, error = %e, "failed to enable TCP keepalive");
                        }
                    }
                    trace!(agent = self.id, %addr, "outbound socket connected");
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(AgentError::Connect {
            addr: format!("{host}:{port}"),
            source: last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")),
        })
    }

    async fn tls_handshake<S>(&self, io: S, host: &str) -> Result<tokio_rustls::client::TlsStream<S>, AgentError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = tls_connector(self.options.reject_unauthorized)
            .connect(server_name(host)?, io)
            .await
            .map_err(|source| AgentError::Tls { host: host.to_string(), source })?;
        let leaf = stream.get_ref().1.peer_certificates().and_then(|chain| chain.first()).map(|c| c.clone().into_owned());
        if let Ok(mut cert) = self.peer_certificate.lock() {
            *cert = leaf;
        }
        Ok(stream)
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        // a single-use connection outlives its agent until the response body is read
        if self.options.keep_alive {
            self.cancel.cancel();
        }
    }
}

/// Complete a verifying TLS handshake with `target` and close the socket.
pub(crate) async fn verify_certificate(target: &TargetDescriptor) -> Result<(), AgentError> {
    let agent = Agent::new(AgentOptions::untracked());
    let tcp = agent.connect_tcp(target.hostname(), target.port()).await?;
    let mut tls = agent.tls_handshake(tcp, target.hostname()).await?;
    let _ = tls.shutdown().await;
    Ok(())
}

fn server_name(host: &str) -> Result<ServerName<'static>, AgentError> {
    ServerName::try_from(host.to_string()).map_err(|_| AgentError::ServerName(host.to_string()))
}

/// Open a tunnel to `authority` through an HTTP proxy with a CONNECT request.
pub(crate) async fn connect_through_proxy<S>(stream: &mut S, authority: &str) -> Result<(), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let req = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: keep-alive\r\n\r\n");
    let io_err = |source| AgentError::Connect { addr: authority.to_string(), source };
    stream.write_all(req.as_bytes()).await.map_err(io_err)?;
    stream.flush().await.map_err(io_err)?;

    // byte by byte so nothing past the header block is consumed
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.map_err(io_err)?;
        buf.push(byte[0]);
        if buf.len() > MAX_CONNECT_RESPONSE {
            return Err(AgentError::ConnectResponse("header block too large".into()));
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| AgentError::ConnectResponse(status_line.to_string()))?;
    if !(200..300).contains(&status) {
        return Err(AgentError::ConnectRefused { target: authority.to_string(), status });
    }
    Ok(())
}

fn tls_connector(verify: bool) -> TlsConnector {
    static VERIFYING: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    static ACCEPT_ANY: OnceLock<Arc<ClientConfig>> = OnceLock::new();

    let config = if verify {
        VERIFYING.get_or_init(|| {
            let roots = RootCertStore { roots: webpki_roots::TLS_SERVER_ROOTS.to_vec() };
            let mut config = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
            config.alpn_protocols = vec![b"http/1.1".to_vec()];
            Arc::new(config)
        })
    } else {
        ACCEPT_ANY.get_or_init(|| {
            let mut config = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
                .with_no_client_auth();
            config.alpn_protocols = vec![b"http/1.1".to_vec()];
            Arc::new(config)
        })
    };
    TlsConnector::from(config.clone())
}

/// Certificate verifier for loopback targets that serve self-signed certificates.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
