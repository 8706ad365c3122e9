//! Per-request orchestration: picks the outbound agent for each request and
//! runs the NTLM or Negotiate handshake for configured hosts.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, CONNECTION, HOST, UPGRADE};
use http::request::Parts;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tracing::{debug, info, warn};

use crate::auth::{
    accepts_negotiate_authentication, accepts_ntlm_authentication, replay_request, AuthState, NegotiateManager,
    NtlmManager,
};
use crate::control::ports::PortsConfigStore;
use crate::proxy::agent::{Agent, AgentError, AgentOptions};
use crate::proxy::context::ConnectionContext;
use crate::proxy::context_manager::{ClientConnection, ConnectionContextManager};
use crate::proxy::http_result::{HttpError, HttpResult};
use crate::proxy::https_validation::HttpsValidation;
use crate::proxy::synthetic_response::{text_response, RespBody};
use crate::proxy::tunnel::splice_websocket;
use crate::store::ConfigStore;
use crate::target::TargetDescriptor;
use crate::upstream::UpstreamProxyManager;

const PROXY_CONNECTION: &str = "proxy-connection";

/// What the listener should do with a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Terminate TLS locally and serve the decrypted requests.
    Intercept(TargetDescriptor),
    /// Splice raw bytes to the target.
    Tunnel(TargetDescriptor),
    Reject,
}

/// What to do with the other leg when one WebSocket leg closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketCloseAction {
    Propagate,
    TerminateClient,
    TerminateServer,
}

/// The parts of a client request kept for error reporting.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: Method,
    pub path: String,
    pub host: Option<String>,
}

impl RequestMeta {
    fn from_request<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            path: req.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_else(|| "/".into()),
            host: req.headers().get(HOST).and_then(|h| h.to_str().ok()).map(str::to_string),
        }
    }
}

pub struct ProxyDispatcher {
    store: Arc<ConfigStore>,
    contexts: Arc<ConnectionContextManager>,
    upstream: Arc<UpstreamProxyManager>,
    ports: Arc<PortsConfigStore>,
    https: Arc<HttpsValidation>,
    ntlm: NtlmManager,
    negotiate: NegotiateManager,
}

impl ProxyDispatcher {
    pub fn new(
        store: Arc<ConfigStore>,
        contexts: Arc<ConnectionContextManager>,
        upstream: Arc<UpstreamProxyManager>,
        ports: Arc<PortsConfigStore>,
        https: Arc<HttpsValidation>,
        ntlm: NtlmManager,
        negotiate: NegotiateManager,
    ) -> Self {
        Self { store, contexts, upstream, ports, https, ntlm, negotiate }
    }

    pub fn contexts(&self) -> &Arc<ConnectionContextManager> {
        &self.contexts
    }

    /// Forward one client request and produce the response for the client.
    pub async fn on_request(&self, client: &ClientConnection, is_ssl: bool, req: Request<Incoming>) -> Response<RespBody> {
        let meta = RequestMeta::from_request(&req);
        match self.handle_request(client, is_ssl, req).await {
            Ok(res) => res,
            Err(e) => {
                self.on_error(&meta, &e);
                text_response(StatusCode::from(&e), e.to_string(), true)
            }
        }
    }

    async fn handle_request(
        &self,
        client: &ClientConnection,
        is_ssl: bool,
        mut req: Request<Incoming>,
    ) -> HttpResult<Response<RespBody>> {
        let target = self.target_host(req.headers(), is_ssl).ok_or(HttpError::InvalidHostInRequestHeader)?;
        let client_proxy_connection = req.headers_mut().remove(PROXY_CONNECTION).is_some();

        if self.is_config_api_request(&target) {
            debug!(target = %target, "request to config API");
            let context = self.contexts.get_or_create_context(client, is_ssl, &target, false);
            context.mark_config_api_connection();
            let agent = self.contexts.get_untracked_agent(&target);
            let res = send(&agent, &target, req.map(BodyExt::boxed)).await?;
            return Ok(finalize_response(res, client_proxy_connection));
        }

        self.https.validate_request(&target);

        if is_websocket_upgrade(req.headers()) {
            return self.forward_websocket(target, req).await;
        }

        let use_sso = self.store.use_sso(&target);
        let managed = use_sso || self.store.exists(&target);
        let context = self.contexts.get_or_create_context(client, is_ssl, &target, managed);

        if !managed {
            debug!(target = %target, "request to unmanaged host, pass on");
            let res = send(context.agent(), &target, req.map(BodyExt::boxed)).await?;
            return Ok(finalize_response(res, client_proxy_connection));
        }

        debug!(target = %target, sso = use_sso, "request to registered NTLM host");
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| HttpError::FailedToReadRequestBody(e.to_string()))?
            .to_bytes();

        let res = self.authenticated_exchange(&context, &target, &parts, body, use_sso).await?;
        Ok(finalize_response(res, client_proxy_connection))
    }

    async fn authenticated_exchange(
        &self,
        context: &ConnectionContext,
        target: &TargetDescriptor,
        parts: &Parts,
        body: Bytes,
        use_sso: bool,
    ) -> HttpResult<Response<Incoming>> {
        if context.get_state(target) == AuthState::Authenticated {
            let res = self.send_original(context, target, parts, body.clone(), None).await?;
            // SSO hosts may have fallen back to the NTLM package
            let challenged = res.status() == StatusCode::UNAUTHORIZED
                && (accepts_ntlm_authentication(res.headers())
                    || (use_sso && accepts_negotiate_authentication(res.headers())));
            if !challenged {
                return Ok(res);
            }
            info!(target = %target, "server challenged an authenticated connection, renewing handshake");
            res.into_body()
                .collect()
                .await
                .map_err(|e| HttpError::target(AgentError::from(e), context.agent().via_upstream()))?;
        }

        if use_sso {
            return match self.negotiate.handshake(context, target, parts, body.clone()).await {
                Ok(Some(res)) => Ok(res),
                Ok(None) => self.send_original(context, target, parts, body, None).await,
                Err(e) => {
                    warn!(target = %target, error = %e, "cannot perform Negotiate handshake, passing request through");
                    self.send_original(context, target, parts, body, None).await
                }
            };
        }

        let res = match self.ntlm.handshake(context, target, parts).await {
            Ok(type3) => {
                self.ntlm.mark_type3_sent(context, target);
                self.send_original(context, target, parts, body, Some(&type3)).await?
            }
            Err(e) => {
                warn!(target = %target, error = %e, "cannot perform NTLM handshake, passing request through");
                self.send_original(context, target, parts, body, None).await?
            }
        };
        self.on_response(context, target, res.status().as_u16());
        Ok(res)
    }

    async fn send_original(
        &self,
        context: &ConnectionContext,
        target: &TargetDescriptor,
        parts: &Parts,
        body: Bytes,
        authorization: Option<&str>,
    ) -> HttpResult<Response<Incoming>> {
        let req = replay_request(parts, body, authorization)
            .map_err(|e| HttpError::FailedToGenerateUpstreamRequest(e.to_string()))?;
        let res = send(context.agent(), target, req).await;
        if res.is_err() && authorization.is_some() {
            context.set_state(target, AuthState::NotAuthenticated);
        }
        res
    }

    /// Settle the handshake once the response to the original request is in.
    pub fn on_response(&self, context: &ConnectionContext, target: &TargetDescriptor, status: u16) {
        if context.get_state(target) == AuthState::Authenticated {
            return;
        }
        self.ntlm.handshake_response(context, target, status);
    }

    async fn forward_websocket(&self, target: TargetDescriptor, mut req: Request<Incoming>) -> HttpResult<Response<RespBody>> {
        let client_upgrade = hyper::upgrade::on(&mut req);
        let mut options = AgentOptions::untracked();
        options.reject_unauthorized = self.contexts.reject_unauthorized(&target);
        self.upstream.set_upstream_proxy_config(&target, target.is_ssl(), &mut options);
        let agent = Agent::new(options);

        let mut res = send(&agent, &target, req.map(BodyExt::boxed)).await?;
        if res.status() == StatusCode::SWITCHING_PROTOCOLS {
            let server_upgrade = hyper::upgrade::on(&mut res);
            debug!(target = %target, "websocket upgrade accepted");
            tokio::spawn(async move {
                match tokio::try_join!(client_upgrade, server_upgrade) {
                    Ok((client, server)) => splice_websocket(TokioIo::new(client), TokioIo::new(server), &target).await,
                    Err(e) => debug!(target = %target, error = %e, "websocket upgrade failed"),
                }
                drop(agent);
            });
        }
        let (parts, body) = res.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Decide how to serve a CONNECT to `authority`.
    pub fn on_connect(&self, authority: &str) -> ConnectDecision {
        let Some(target) = TargetDescriptor::from_authority(authority) else {
            debug!(authority, "invalid CONNECT request, cannot read target");
            return ConnectDecision::Reject;
        };
        if self.store.exists_or_use_sso(&target) || self.upstream.has_https_upstream_proxy(&target) {
            return ConnectDecision::Intercept(target);
        }
        self.https.validate_connect(&target);
        debug!(target = %target, "tunnel");
        ConnectDecision::Tunnel(target)
    }

    /// Log a failed request. Returns false when the failure was filtered as
    /// expected noise.
    pub fn on_error(&self, meta: &RequestMeta, error: &HttpError) -> bool {
        if is_browser_startup_probe(meta, error) {
            debug!(host = meta.host.as_deref().unwrap_or_default(), "browser startup HEAD request detected, ignoring connection error");
            return false;
        }
        let host = meta.host.as_deref().unwrap_or_default();
        match error {
            HttpError::FailedToGetResponseFromTarget { source, .. } if source.is_connection_reset() => {
                debug!(%host, path = %meta.path, error = %error, "connection reset by target");
            }
            HttpError::InvalidHostInRequestHeader => debug!(%host, error = %error, "rejected request"),
            _ => warn!(%host, path = %meta.path, method = %meta.method, error = %error, "request failed"),
        }
        true
    }

    /// 1005 and 1006 mean the leg went away without a close frame; the other
    /// leg is terminated instead of being left half open.
    pub fn on_websocket_close(code: u16, closed_by_server: bool) -> WebSocketCloseAction {
        match (code, closed_by_server) {
            (1005 | 1006, true) => WebSocketCloseAction::TerminateClient,
            (1005 | 1006, false) => WebSocketCloseAction::TerminateServer,
            _ => WebSocketCloseAction::Propagate,
        }
    }

    fn target_host(&self, headers: &HeaderMap, is_ssl: bool) -> Option<TargetDescriptor> {
        let host = headers.get(HOST).and_then(|h| h.to_str().ok())?;
        let target = TargetDescriptor::from_host_header(host, is_ssl)?;
        let own = self.ports.ntlm_proxy_url().and_then(|url| TargetDescriptor::from_url(&url));
        if own.is_some_and(|own| own.hostname() == target.hostname() && own.port() == target.port()) {
            debug!(host, "invalid request, host header refers to this proxy");
            return None;
        }
        Some(target)
    }

    fn is_config_api_request(&self, target: &TargetDescriptor) -> bool {
        self.ports
            .config_api_url()
            .and_then(|url| TargetDescriptor::from_url(&url))
            .is_some_and(|api| api.hostname() == target.hostname() && api.port() == target.port())
    }
}

async fn send(agent: &Agent, target: &TargetDescriptor, req: Request<crate::proxy::agent::ReqBody>) -> HttpResult<Response<Incoming>> {
    agent.send(target, req).await.map_err(|e| HttpError::target(e, agent.via_upstream()))
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
    upgrade && connection
}

fn is_browser_startup_probe(meta: &RequestMeta, error: &HttpError) -> bool {
    let HttpError::FailedToGetResponseFromTarget { source, .. } = error else {
        return false;
    };
    let Some(host) = meta.host.as_deref() else {
        return false;
    };
    meta.method == Method::HEAD
        && meta.path == "/"
        && !host.contains('.')
        && (!host.contains(':') || host.ends_with(":80"))
        && !host.contains('/')
        && source.is_dns_failure()
}

/// Strip pinning headers and restore keep-alive for clients that talk to us
/// as a proxy.
fn finalize_response(res: Response<Incoming>, client_proxy_connection: bool) -> Response<RespBody> {
    let (mut parts, body) = res.into_parts();
    filter_response_headers(&mut parts.headers);
    if client_proxy_connection {
        let keep_alive = HeaderValue::from_static("keep-alive");
        parts.headers.insert(HeaderName::from_static(PROXY_CONNECTION), keep_alive.clone());
        let connection = if parts.status == StatusCode::UNAUTHORIZED { HeaderValue::from_static("close") } else { keep_alive };
        parts.headers.insert(CONNECTION, connection);
    }
    Response::from_parts(parts, body.boxed())
}

pub(crate) fn filter_response_headers(headers: &mut HeaderMap) {
    let pins: Vec<HeaderName> = headers.keys().filter(|name| name.as_str().starts_with("public-key-pins")).cloned().collect();
    for name in pins {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(method: Method, path: &str, host: &str) -> RequestMeta {
        RequestMeta { method, path: path.into(), host: Some(host.into()) }
    }

    fn dns_failure() -> HttpError {
        HttpError::target(
            AgentError::Lookup { host: "x".into(), source: std::io::Error::other("not found") },
            false,
        )
    }

    #[test]
    fn browser_startup_request_is_recognised() {
        assert!(is_browser_startup_probe(&meta(Method::HEAD, "/", "abcdefgh"), &dns_failure()));
        assert!(is_browser_startup_probe(&meta(Method::HEAD, "/", "abcdefgh:80"), &dns_failure()));
        assert!(!is_browser_startup_probe(&meta(Method::HEAD, "/", "abcdefgh:8080"), &dns_failure()));
        assert!(!is_browser_startup_probe(&meta(Method::HEAD, "/", "www.acme.com"), &dns_failure()));
        assert!(!is_browser_startup_probe(&meta(Method::GET, "/", "abcdefgh"), &dns_failure()));
        assert!(!is_browser_startup_probe(&meta(Method::HEAD, "/x", "abcdefgh"), &dns_failure()));
        let refused = HttpError::target(
            AgentError::Connect { addr: "x".into(), source: std::io::ErrorKind::ConnectionRefused.into() },
            false,
        );
        assert!(!is_browser_startup_probe(&meta(Method::HEAD, "/", "abcdefgh"), &refused));
    }

    #[test]
    fn websocket_abnormal_close_terminates_other_leg() {
        assert_eq!(ProxyDispatcher::on_websocket_close(1006, true), WebSocketCloseAction::TerminateClient);
        assert_eq!(ProxyDispatcher::on_websocket_close(1005, false), WebSocketCloseAction::TerminateServer);
        assert_eq!(ProxyDispatcher::on_websocket_close(1000, true), WebSocketCloseAction::Propagate);
    }

    #[test]
    fn pinning_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert("public-key-pins", HeaderValue::from_static("pin-sha256=\"x\""));
        headers.insert("public-key-pins-report-only", HeaderValue::from_static("pin-sha256=\"x\""));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        filter_response_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn websocket_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_websocket_upgrade(&headers));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_websocket_upgrade(&headers));
    }
}
