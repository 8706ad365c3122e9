use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use http::{Method, StatusCode};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::proxy::cert::CertificateAuthority;
use crate::proxy::context_manager::{ClientConnection, ContextGuard, TunnelGuard};
use crate::proxy::dispatcher::{ConnectDecision, ProxyDispatcher};
use crate::proxy::synthetic_response::{empty_body, text_response, RespBody};
use crate::proxy::tunnel::{connect_target, log_tunnel_error, run_tunnel};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Guard to decrement active connections counter when dropped
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

struct ServerState {
    dispatcher: Arc<ProxyDispatcher>,
    ca: Arc<CertificateAuthority>,
    builder: ConnBuilder<TokioExecutor>,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
}

/// The forward proxy listener. Plain requests are handed to the dispatcher;
/// CONNECT requests are either intercepted with a locally issued certificate
/// or tunnelled.
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ProxyServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(ProxyError::Io)?;
        let local_addr = listener.local_addr().map_err(ProxyError::Io)?;
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept clients until `shutdown` fires, then wait briefly for open
    /// connections to wind down.
    pub async fn run(self, dispatcher: Arc<ProxyDispatcher>, ca: Arc<CertificateAuthority>, shutdown: CancellationToken) {
        let mut builder = ConnBuilder::new(TokioExecutor::new());
        builder.http1().preserve_header_case(true).title_case_headers(true);
        let state = Arc::new(ServerState {
            dispatcher,
            ca,
            builder: builder.http1_only(),
            shutdown: shutdown.clone(),
            active: Arc::new(AtomicUsize::new(0)),
        });

        info!(addr = %self.local_addr, "NTLM auth proxy listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "accept error");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let state = state.clone();
                    tokio::spawn(async move {
                        let _guard = ConnectionGuard::new(state.active.clone());
                        state.serve_client(stream, Some(peer), false).await;
                    });
                }
            }
        }

        let start = Instant::now();
        while state.active.load(Ordering::Relaxed) > 0 && start.elapsed() < SHUTDOWN_GRACE {
            sleep(Duration::from_millis(50)).await;
        }
        let active = state.active.load(Ordering::Relaxed);
        if active > 0 {
            debug!(active, "proxy listener stopped with connections still open");
        }
        info!("NTLM auth proxy stopped");
    }
}

impl ServerState {
    /// Serve one client connection, which is either a TCP connection or a TLS
    /// session intercepted inside a CONNECT tunnel. Boxed because intercepted
    /// sessions are served from within the connection future itself.
    fn serve_client<I>(self: Arc<Self>, io: I, peer: Option<SocketAddr>, is_ssl: bool) -> Pin<Box<dyn Future<Output = ()> + Send>>
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Box::pin(async move {
            let cancel = self.shutdown.child_token();
            let client = ClientConnection::new(peer, cancel.clone());
            let _context_guard = ContextGuard::new(self.dispatcher.contexts().clone(), client.id);
            debug!(client = %client.id, peer = ?peer, is_ssl, "client connected");

            let state = self.clone();
            let svc_client = client.clone();
            let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                let client = svc_client.clone();
                async move { Ok::<_, Infallible>(state.handle(&client, is_ssl, req).await) }
            });

            let conn = self.builder.serve_connection_with_upgrades(TokioIo::new(io), svc);
            tokio::pin!(conn);
            tokio::select! {
                res = conn.as_mut() => {
                    if let Err(e) = res {
                        debug!(client = %client.id, error = %e, "client connection ended with error");
                    }
                }
                _ = cancel.cancelled() => debug!(client = %client.id, "client connection closed by proxy"),
            }
            debug!(client = %client.id, "client disconnected");
        })
    }

    async fn handle(self: Arc<Self>, client: &ClientConnection, is_ssl: bool, req: Request<Incoming>) -> Response<RespBody> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(client, req).await;
        }
        self.dispatcher.on_request(client, is_ssl, req).await
    }

    async fn handle_connect(self: Arc<Self>, client: &ClientConnection, req: Request<Incoming>) -> Response<RespBody> {
        let authority = req.uri().authority().map(|a| a.to_string()).unwrap_or_default();
        match self.dispatcher.on_connect(&authority) {
            ConnectDecision::Reject => text_response(StatusCode::BAD_REQUEST, "Invalid CONNECT request", true),
            ConnectDecision::Intercept(target) => {
                let acceptor = match self.ca.acceptor_for(target.hostname()) {
                    Ok(acceptor) => acceptor,
                    Err(e) => {
                        warn!(target = %target, error = %e, "cannot issue interception certificate");
                        return bad_gateway();
                    }
                };
                let peer = client.addr;
                let state = self.clone();
                tokio::spawn(async move {
                    let _guard = ConnectionGuard::new(state.active.clone());
                    let upgraded = match hyper::upgrade::on(req).await {
                        Ok(upgraded) => upgraded,
                        Err(e) => {
                            debug!(target = %target, error = %e, "CONNECT upgrade failed");
                            return;
                        }
                    };
                    match acceptor.accept(TokioIo::new(upgraded)).await {
                        Ok(tls) => state.serve_client(tls, peer, true).await,
                        Err(e) => debug!(target = %target, error = %e, "TLS handshake with client failed"),
                    }
                });
                connect_established()
            }
            ConnectDecision::Tunnel(target) => {
                let server = match connect_target(&target).await {
                    Ok(server) => server,
                    Err(e) => {
                        log_tunnel_error(&target, &e);
                        return bad_gateway();
                    }
                };
                let close = self.shutdown.child_token();
                let guard = TunnelGuard::new(self.dispatcher.contexts().clone(), client.id, close.clone());
                tokio::spawn(async move {
                    let _guard = guard;
                    match hyper::upgrade::on(req).await {
                        Ok(upgraded) => run_tunnel(TokioIo::new(upgraded), server, &target, close).await,
                        Err(e) => debug!(target = %target, error = %e, "CONNECT upgrade failed"),
                    }
                });
                connect_established()
            }
        }
    }
}

fn connect_established() -> Response<RespBody> {
    Response::new(empty_body())
}

fn bad_gateway() -> Response<RespBody> {
    text_response(StatusCode::BAD_GATEWAY, "", true)
}
