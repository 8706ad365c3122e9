use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::SsoFacadeFactory;
use crate::control::validator::{validate_ntlm_config, validate_sso_config, NtlmConfigRequest, NtlmSsoRequest};
use crate::control::ControlEvent;
use crate::error::{ProxyError, Result};
use crate::proxy::context::DestroyReason;
use crate::proxy::context_manager::ConnectionContextManager;
use crate::proxy::synthetic_response::{synthetic_error_response, text_response, RespBody};
use crate::store::{ConfigStore, HostPattern};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuitRequest {
    #[serde(default)]
    keep_ports_file: bool,
}

/// Request handlers of the control API.
pub struct ControlApi {
    store: Arc<ConfigStore>,
    contexts: Arc<ConnectionContextManager>,
    sso: Arc<dyn SsoFacadeFactory>,
    events: mpsc::UnboundedSender<ControlEvent>,
}

impl ControlApi {
    pub fn new(
        store: Arc<ConfigStore>,
        contexts: Arc<ConnectionContextManager>,
        sso: Arc<dyn SsoFacadeFactory>,
        events: mpsc::UnboundedSender<ControlEvent>,
    ) -> Self {
        Self { store, contexts, sso, events }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<RespBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match (method, path.as_str()) {
            (Method::POST, "/ntlm-config") => self.ntlm_config(req).await,
            (Method::POST, "/ntlm-sso") => self.ntlm_sso(req).await,
            (Method::POST, "/reset") => self.reset(),
            (Method::GET, "/alive") => {
                debug!("received alive");
                ok()
            }
            (Method::POST, "/quit") => self.quit(req).await,
            (method, path) => {
                debug!(%method, path, "unknown control API route");
                synthetic_error_response(StatusCode::NOT_FOUND)
                    .unwrap_or_else(|_| text_response(StatusCode::NOT_FOUND, "Not Found", false))
            }
        }
    }

    async fn ntlm_config(&self, req: Request<Incoming>) -> Response<RespBody> {
        let config = match read_json::<NtlmConfigRequest>(req)
            .await
            .and_then(|body| validate_ntlm_config(&body).map_err(|e| e.0))
        {
            Ok(config) => config,
            Err(message) => {
                return text_response(StatusCode::BAD_REQUEST, format!("Config parse error. {message}"), false);
            }
        };
        info!(hosts = ?config.hosts, "received valid NTLM config update");
        self.store.update_config(&config.hosts, config.credential);
        for host in &config.hosts {
            // contexts authenticated under a re-configured pattern handshake again
            if let Some(pattern) = HostPattern::parse(host) {
                self.contexts.clear_authentication(&pattern);
            }
            self.publish(ControlEvent::ConfigUpdated(host.clone()));
        }
        ok()
    }

    async fn ntlm_sso(&self, req: Request<Incoming>) -> Response<RespBody> {
        let hosts = match read_json::<NtlmSsoRequest>(req)
            .await
            .and_then(|body| validate_sso_config(&body, self.sso.as_ref()).map_err(|e| e.0))
        {
            Ok(hosts) => hosts,
            Err(message) => {
                return text_response(StatusCode::BAD_REQUEST, format!("SSO config parse error. {message}"), false);
            }
        };
        info!(hosts = ?hosts, "received valid NTLM SSO config");
        self.store.set_sso_config(&hosts);
        ok()
    }

    fn reset(&self) -> Response<RespBody> {
        info!("received reset");
        self.store.clear();
        self.contexts.remove_all_connection_contexts(DestroyReason::Reset);
        self.publish(ControlEvent::Reset);
        ok()
    }

    async fn quit(&self, req: Request<Incoming>) -> Response<RespBody> {
        info!("received quit");
        let keep_ports_file = read_json::<QuitRequest>(req).await.map(|q| q.keep_ports_file).unwrap_or(false);
        self.publish(ControlEvent::Quit { keep_ports_file });
        text_response(StatusCode::OK, "Over and out!", false)
    }

    fn publish(&self, event: ControlEvent) {
        if self.events.send(event).is_err() {
            debug!("no listener for control events");
        }
    }
}

fn ok() -> Response<RespBody> {
    text_response(StatusCode::OK, "OK", false)
}

/// Parse a JSON body; an empty body reads as `{}`.
async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> std::result::Result<T, String> {
    let body: Bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| format!("Cannot read body: {e}"))?
        .to_bytes();
    let body = if body.iter().all(u8::is_ascii_whitespace) { Bytes::from_static(b"{}") } else { body };
    serde_json::from_slice(&body).map_err(|e| e.to_string())
}

/// HTTP listener for the control API.
pub struct ControlServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ControlServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(ProxyError::Io)?;
        let local_addr = listener.local_addr().map_err(ProxyError::Io)?;
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` fires. Requests already being answered are
    /// completed first, so the reply to `/quit` still goes out.
    pub async fn run(self, api: Arc<ControlApi>, shutdown: CancellationToken) {
        let builder = ConnBuilder::new(TokioExecutor::new());
        let active = Arc::new(AtomicUsize::new(0));
        info!(addr = %self.local_addr, "NTLM auth config API listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "config API accept error");
                            continue;
                        }
                    };
                    let api = api.clone();
                    let builder = builder.clone();
                    let active = active.clone();
                    let shutdown = shutdown.clone();
                    active.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(async move {
                        let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                            let api = api.clone();
                            async move { Ok::<_, Infallible>(api.handle(req).await) }
                        });
                        let conn = builder.serve_connection(TokioIo::new(stream), svc);
                        tokio::pin!(conn);
                        tokio::select! {
                            res = conn.as_mut() => {
                                if let Err(e) = res {
                                    debug!(?peer, error = %e, "config API connection error");
                                }
                            }
                            _ = shutdown.cancelled() => {
                                conn.as_mut().graceful_shutdown();
                                if let Err(e) = conn.as_mut().await {
                                    debug!(?peer, error = %e, "config API connection error during shutdown");
                                }
                            }
                        }
                        active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
            }
        }

        let start = Instant::now();
        while active.load(Ordering::Relaxed) > 0 && start.elapsed() < SHUTDOWN_GRACE {
            sleep(Duration::from_millis(20)).await;
        }
        info!("NTLM auth config API stopped");
    }
}
