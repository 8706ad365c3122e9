//! Shared helpers for proxy integration tests: mock target servers, a proxy
//! started on ephemeral ports and clients routed through it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use bytes::Bytes;
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use ntlm_proxy_lib::auth::{SecurityPackage, SsoError, SsoFacade, SsoFacadeFactory};
use ntlm_proxy_lib::ntlm::{
    create_type1_message, create_type3_message, decode_type2_message, NtlmMessage, NtlmVersion, Type3Input,
};
use ntlm_proxy_lib::proxy::CertificateAuthority;
use ntlm_proxy_lib::{CoreOptions, CoreServer, PortsFileService};
use rustls_pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const USERNAME: &str = "nisse";

/// Generate a temporary file path for testing
pub fn tmp_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos();
    std::env::temp_dir().join(format!("ntlm-proxy-test-{nanos}-{name}"))
}

/// Start a proxy on ephemeral ports with its ports file in a temp location.
pub async fn start_core(sso: Option<Arc<dyn SsoFacadeFactory>>) -> TestResult<CoreServer> {
    start_core_with(tmp_path("ports.json"), sso).await
}

pub async fn start_core_with(ports_path: PathBuf, sso: Option<Arc<dyn SsoFacadeFactory>>) -> TestResult<CoreServer> {
    start_core_with_options(ports_path, |options| {
        if let Some(sso) = sso {
            options.sso = sso;
        }
    })
    .await
}

/// Start a proxy on ephemeral ports after `customize` adjusted its options.
pub async fn start_core_with_options(
    ports_path: PathBuf,
    customize: impl FnOnce(&mut CoreOptions),
) -> TestResult<CoreServer> {
    let mut options = CoreOptions {
        proxy_listen: "127.0.0.1:0".parse()?,
        config_api_listen: "127.0.0.1:0".parse()?,
        allow_multiple_instances: true,
        ports_file: Some(PortsFileService::new(ports_path)),
        ..CoreOptions::default()
    };
    customize(&mut options);
    Ok(CoreServer::start(options).await?)
}

/// Client that sends everything through the proxy.
pub fn proxied_client(core: &CoreServer) -> TestResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(core.ntlm_proxy_url())?)
        .timeout(Duration::from_secs(10))
        .build()?)
}

/// Client that talks to the control API directly.
pub fn direct_client() -> TestResult<reqwest::Client> {
    Ok(reqwest::Client::builder().no_proxy().timeout(Duration::from_secs(10)).build()?)
}

pub async fn configure_ntlm_host(core: &CoreServer, host: &str) -> TestResult<reqwest::Response> {
    let body = serde_json::json!({
        "ntlmHosts": [host],
        "username": USERNAME,
        "password": "manpower",
        "domain": "mptst",
        "ntlmVersion": 2,
    });
    Ok(direct_client()?
        .post(format!("{}/ntlm-config", core.config_api_url()))
        .json(&body)
        .send()
        .await?)
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut res = Response::new(Full::new(Bytes::from(body)));
    *res.status_mut() = status;
    res
}

fn challenge(value: String) -> Response<Full<Bytes>> {
    let mut res = text(StatusCode::UNAUTHORIZED, String::new());
    if let Ok(v) = value.parse() {
        res.headers_mut().insert(WWW_AUTHENTICATE, v);
    }
    res
}

fn authorization(req: &Request<Incoming>) -> Option<String> {
    req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()).map(str::to_string)
}

async fn echo(req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = match req.into_body().collect().await {
        Ok(b) => String::from_utf8_lossy(&b.to_bytes()).into_owned(),
        Err(_) => String::new(),
    };
    text(StatusCode::OK, format!("{method} {path} {body}"))
}

fn utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn push_security_buffer(buf: &mut Vec<u8>, len: usize, offset: usize) {
    buf.extend_from_slice(&(len as u16).to_le_bytes());
    buf.extend_from_slice(&(len as u16).to_le_bytes());
    buf.extend_from_slice(&(offset as u32).to_le_bytes());
}

/// Unicode NTLMv2 challenge with a domain name in the target info.
pub fn type2_message(challenge: [u8; 8]) -> Vec<u8> {
    let target_name = utf16("MPTST");
    let mut target_info = Vec::new();
    target_info.extend_from_slice(&2u16.to_le_bytes());
    target_info.extend_from_slice(&(target_name.len() as u16).to_le_bytes());
    target_info.extend_from_slice(&target_name);
    target_info.extend_from_slice(&[0, 0, 0, 0]);

    let flags: u32 = 0x0000_0001 | 0x0000_0200 | 0x0008_0000 | 0x0080_0000;
    let header_len = 48;
    let mut msg = b"NTLMSSP\0".to_vec();
    msg.extend_from_slice(&2u32.to_le_bytes());
    push_security_buffer(&mut msg, target_name.len(), header_len);
    msg.extend_from_slice(&flags.to_le_bytes());
    msg.extend_from_slice(&challenge);
    msg.extend_from_slice(&[0u8; 8]);
    push_security_buffer(&mut msg, target_info.len(), header_len + target_name.len());
    msg.extend_from_slice(&target_name);
    msg.extend_from_slice(&target_info);
    msg
}

/// User name carried in a Unicode Type3 message.
pub fn type3_username(msg: &[u8]) -> Option<String> {
    let len = u16::from_le_bytes([*msg.get(36)?, *msg.get(37)?]) as usize;
    let offset = u32::from_le_bytes([*msg.get(40)?, *msg.get(41)?, *msg.get(42)?, *msg.get(43)?]) as usize;
    let raw = msg.get(offset..offset + len)?;
    let units: Vec<u16> = raw.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16(&units).ok()
}

async fn serve<F, Fut>(handler: F) -> TestResult<SocketAddr>
where
    F: Fn(Request<Incoming>, Arc<AtomicBool>) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    serve_with(None, handler).await
}

/// Like [`serve`], with every connection wrapped in TLS when `acceptor` is set.
async fn serve_with<F, Fut>(acceptor: Option<TlsAcceptor>, handler: F) -> TestResult<SocketAddr>
where
    F: Fn(Request<Incoming>, Arc<AtomicBool>) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                continue;
            };
            let handler = handler.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => {
                        if let Ok(tls) = acceptor.accept(stream).await {
                            serve_connection(tls, handler).await;
                        }
                    }
                    None => serve_connection(stream, handler).await,
                }
            });
        }
    });
    Ok(addr)
}

async fn serve_connection<I, F, Fut>(io: I, handler: F)
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: Fn(Request<Incoming>, Arc<AtomicBool>) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    // NTLM authenticates the connection, not the request.
    let authenticated = Arc::new(AtomicBool::new(false));
    let svc = service_fn(move |req| {
        let fut = handler(req, authenticated.clone());
        async move { Ok::<_, Infallible>(fut.await) }
    });
    let _ = ConnBuilder::new(TokioExecutor::new()).serve_connection(TokioIo::new(io), svc).await;
}

/// Target that requires NTLM for user [`USERNAME`]. Returns its address and
/// the number of completed handshakes.
///
/// `GET /logout` on an authenticated connection drops the authentication and
/// answers with a fresh challenge.
pub async fn spawn_ntlm_server() -> TestResult<(SocketAddr, Arc<AtomicUsize>)> {
    spawn_ntlm_target(None).await
}

/// [`spawn_ntlm_server`] behind TLS with a certificate for `localhost`.
pub async fn spawn_tls_ntlm_server() -> TestResult<(SocketAddr, Arc<AtomicUsize>)> {
    let acceptor = CertificateAuthority::generate()?.acceptor_for("localhost")?;
    spawn_ntlm_target(Some(acceptor)).await
}

async fn spawn_ntlm_target(acceptor: Option<TlsAcceptor>) -> TestResult<(SocketAddr, Arc<AtomicUsize>)> {
    let handshakes = Arc::new(AtomicUsize::new(0));
    let counter = handshakes.clone();
    let addr = serve_with(acceptor, move |req, authenticated| {
        let counter = counter.clone();
        async move {
            let token = authorization(&req)
                .and_then(|v| v.strip_prefix("NTLM ").map(str::to_string))
                .and_then(|t| B64.decode(t).ok());
            match token {
                Some(msg) if msg.get(8) == Some(&1) => {
                    authenticated.store(false, Ordering::SeqCst);
                    challenge(format!("NTLM {}", B64.encode(type2_message(*b"\x01\x23\x45\x67\x89\xab\xcd\xef"))))
                }
                Some(msg) if msg.get(8) == Some(&3) && type3_username(&msg).as_deref() == Some(USERNAME) => {
                    authenticated.store(true, Ordering::SeqCst);
                    counter.fetch_add(1, Ordering::SeqCst);
                    echo(req).await
                }
                Some(_) => challenge("NTLM".into()),
                None if authenticated.load(Ordering::SeqCst) && req.uri().path() == "/logout" => {
                    authenticated.store(false, Ordering::SeqCst);
                    challenge("NTLM".into())
                }
                None if authenticated.load(Ordering::SeqCst) => echo(req).await,
                None => challenge("NTLM".into()),
            }
        }
    })
    .await?;
    Ok((addr, handshakes))
}

/// Target without any authentication, echoing each request.
pub async fn spawn_open_server() -> TestResult<SocketAddr> {
    serve(|req, _| echo(req)).await
}

/// Target that refuses every request with a `len` byte body.
pub async fn spawn_refusing_server(len: usize) -> TestResult<SocketAddr> {
    serve(move |_, _| async move { text(StatusCode::FORBIDDEN, "x".repeat(len)) }).await
}

/// Upstream proxy answering every request itself with the request target it
/// received. Returns its address and the number of requests relayed.
pub async fn spawn_upstream_proxy() -> TestResult<(SocketAddr, Arc<AtomicUsize>)> {
    let relayed = Arc::new(AtomicUsize::new(0));
    let counter = relayed.clone();
    let addr = serve(move |req, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { text(StatusCode::OK, format!("via upstream {}", req.uri())) }
    })
    .await?;
    Ok((addr, relayed))
}

/// Target that requires Negotiate: `Negotiate abc` is answered with
/// `Negotiate srv1`, then `Negotiate resp1` is accepted with a final
/// `Negotiate srv2` token.
pub async fn spawn_negotiate_server() -> TestResult<SocketAddr> {
    serve(|req, authenticated| async move {
        match authorization(&req).as_deref() {
            Some("Negotiate abc") => challenge("Negotiate srv1".into()),
            Some("Negotiate resp1") => {
                authenticated.store(true, Ordering::SeqCst);
                let mut res = echo(req).await;
                res.headers_mut().insert(WWW_AUTHENTICATE, http::HeaderValue::from_static("Negotiate srv2"));
                res
            }
            None if authenticated.load(Ordering::SeqCst) => echo(req).await,
            _ => challenge("Negotiate".into()),
        }
    })
    .await
}

/// SSO facility replaying the tokens [`spawn_negotiate_server`] expects. Its
/// NTLM package authenticates as [`USERNAME`] against [`spawn_ntlm_server`].
#[derive(Default)]
pub struct ScriptedSso {
    pub created: AtomicUsize,
    /// Package of every context created, and whether it got a peer certificate.
    pub packages: Mutex<Vec<(SecurityPackage, bool)>>,
}

impl ScriptedSso {
    pub fn packages(&self) -> Vec<(SecurityPackage, bool)> {
        self.packages.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

struct ScriptedFacade;

impl SsoFacade for ScriptedFacade {
    fn create_auth_request_header(&mut self) -> Result<String, SsoError> {
        Ok("Negotiate abc".into())
    }

    fn create_auth_response_header(&mut self, www_authenticate: &str) -> Result<String, SsoError> {
        match www_authenticate {
            "Negotiate srv1" => Ok("Negotiate resp1".into()),
            "Negotiate srv2" => Ok(String::new()),
            other => Err(SsoError::Facility(format!("unexpected challenge {other}"))),
        }
    }
}

#[derive(Default)]
struct ScriptedNtlmFacade {
    type1: Option<NtlmMessage>,
}

impl SsoFacade for ScriptedNtlmFacade {
    fn create_auth_request_header(&mut self) -> Result<String, SsoError> {
        let type1 = create_type1_message(NtlmVersion::V2, "WS", "MPTST");
        let header = type1.header();
        self.type1 = Some(type1);
        Ok(header)
    }

    fn create_auth_response_header(&mut self, www_authenticate: &str) -> Result<String, SsoError> {
        let type1 = self.type1.as_ref().ok_or_else(|| SsoError::Facility("no Type1 sent".into()))?;
        let type2 = decode_type2_message(www_authenticate).map_err(|e| SsoError::Facility(e.to_string()))?;
        let input = Type3Input {
            username: USERNAME,
            password: "manpower",
            workstation: "WS",
            domain: "MPTST",
            ..Type3Input::default()
        };
        Ok(create_type3_message(type1, &type2, &input).header())
    }
}

impl SsoFacadeFactory for ScriptedSso {
    fn is_supported(&self) -> bool {
        true
    }

    fn create(
        &self,
        package: SecurityPackage,
        _target_host: &str,
        peer_certificate: Option<&CertificateDer<'_>>,
    ) -> Result<Box<dyn SsoFacade>, SsoError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut packages) = self.packages.lock() {
            packages.push((package, peer_certificate.is_some()));
        }
        Ok(match package {
            SecurityPackage::Negotiate => Box::new(ScriptedFacade),
            SecurityPackage::Ntlm => Box::new(ScriptedNtlmFacade::default()),
        })
    }
}

/// TCP server echoing every byte back.
pub async fn spawn_echo_server() -> TestResult<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        loop {
            let Ok((mut s, _)) = listener.accept().await else {
                continue;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match s.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if s.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    Ok(addr)
}
