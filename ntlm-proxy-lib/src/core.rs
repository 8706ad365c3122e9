//! Assembles every component and runs both listeners.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request};
use http_body_util::BodyExt;
use rustls_pki_types::CertificateDer;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{NegotiateManager, NtlmManager, SsoFacadeFactory, UnsupportedSso};
use crate::config::Config;
use crate::control::{ControlApi, ControlEvent, ControlServer, PortsConfigStore, PortsFile, PortsFileService};
use crate::error::{ProxyError, Result};
use crate::proxy::agent::{Agent, AgentOptions};
use crate::proxy::synthetic_response::full_body;
use crate::proxy::https_validation::{HttpsValidation, HttpsValidationLevel};
use crate::proxy::{CertificateAuthority, ConnectionContextManager, DestroyReason, ProxyDispatcher, ProxyServer};
use crate::store::ConfigStore;
use crate::target::TargetDescriptor;
use crate::upstream::{apply_loopback_defaults, UpstreamProxyManager};

const QUIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Startup parameters, usually derived from [`Config`] plus command line
/// overrides.
#[derive(Clone)]
pub struct CoreOptions {
    pub proxy_listen: SocketAddr,
    pub config_api_listen: SocketAddr,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub https_validation: HttpsValidationLevel,
    /// `false` disables certificate checks on every outbound TLS connection.
    pub tls_reject_unauthorized: bool,
    pub allow_multiple_instances: bool,
    /// `None` disables the ports file.
    pub ports_file: Option<PortsFileService>,
    pub sso: Arc<dyn SsoFacadeFactory>,
}

impl CoreOptions {
    pub fn from_config(config: &Config) -> Self {
        let ports_file = config.ports_file.enabled.then(|| match &config.ports_file.path {
            Some(path) => PortsFileService::new(path),
            None => PortsFileService::default(),
        });
        Self {
            proxy_listen: config.proxy_listen,
            config_api_listen: config.config_api_listen,
            http_proxy: config.upstream.http_proxy.clone(),
            https_proxy: config.upstream.https_proxy.clone(),
            no_proxy: config.upstream.no_proxy.clone(),
            https_validation: config.tls.https_validation,
            tls_reject_unauthorized: config.tls.reject_unauthorized,
            allow_multiple_instances: config.allow_multiple_instances,
            ports_file,
            sso: Arc::new(UnsupportedSso),
        }
    }
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A running proxy: control API, proxy listener and the state they share.
pub struct CoreServer {
    ports: PortsFile,
    store: Arc<ConfigStore>,
    contexts: Arc<ConnectionContextManager>,
    upstream: Arc<UpstreamProxyManager>,
    ports_store: Arc<PortsConfigStore>,
    ports_file: Option<PortsFileService>,
    ca: Arc<CertificateAuthority>,
    events: mpsc::UnboundedReceiver<ControlEvent>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

fn listener_url(addr: SocketAddr) -> Result<Url> {
    let ip = if addr.ip().is_unspecified() { IpAddr::V4(Ipv4Addr::LOCALHOST) } else { addr.ip() };
    Ok(Url::parse(&format!("http://{}", SocketAddr::new(ip, addr.port())))?)
}

impl CoreServer {
    pub async fn start(options: CoreOptions) -> Result<Self> {
        if let Some(ports_file) = &options.ports_file {
            stop_existing_instance(ports_file, options.allow_multiple_instances).await;
        }

        let upstream = Arc::new(UpstreamProxyManager::new());
        let has_upstream = options.http_proxy.as_deref().is_some_and(|p| !p.trim().is_empty())
            || options.https_proxy.as_deref().is_some_and(|p| !p.trim().is_empty());
        let no_proxy = apply_loopback_defaults(options.no_proxy.as_deref(), has_upstream);
        upstream.init(options.http_proxy.as_deref(), options.https_proxy.as_deref(), no_proxy.as_deref())?;

        let store = Arc::new(ConfigStore::new());
        let contexts = Arc::new(
            ConnectionContextManager::new(upstream.clone()).with_tls_reject_unauthorized(options.tls_reject_unauthorized),
        );
        let https = Arc::new(HttpsValidation::new(options.https_validation, options.tls_reject_unauthorized));
        let ports_store = Arc::new(PortsConfigStore::new());
        let ca = Arc::new(CertificateAuthority::generate()?);
        let (events_tx, events) = mpsc::unbounded_channel();

        let control = ControlServer::bind(options.config_api_listen).await?;
        let proxy = ProxyServer::bind(options.proxy_listen).await?;
        let config_api_url = listener_url(control.local_addr())?;
        let ntlm_proxy_url = listener_url(proxy.local_addr())?;
        ports_store.set_config_api_url(Some(config_api_url));
        ports_store.set_ntlm_proxy_url(Some(ntlm_proxy_url));
        let ports = ports_store
            .to_ports_file()
            .ok_or_else(|| ProxyError::Config("listener URLs are not set".into()))?;

        let api = Arc::new(ControlApi::new(store.clone(), contexts.clone(), options.sso.clone(), events_tx));
        let dispatcher = Arc::new(ProxyDispatcher::new(
            store.clone(),
            contexts.clone(),
            upstream.clone(),
            ports_store.clone(),
            https.clone(),
            NtlmManager::new(store.clone()),
            NegotiateManager::new(options.sso.clone()),
        ));

        let shutdown = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(control.run(api, shutdown.clone())),
            tokio::spawn(proxy.run(dispatcher, ca.clone(), shutdown.clone())),
        ];

        if let Some(ports_file) = &options.ports_file {
            if let Err(e) = ports_file.save(&ports).await {
                shutdown.cancel();
                return Err(e);
            }
            info!(path = %ports_file.full_path().display(), "ports file saved");
        }

        info!(
            config_api_url = %ports.config_api_url,
            ntlm_proxy_url = %ports.ntlm_proxy_url,
            https_validation = %https.level(),
            "NTLM auth proxy started"
        );
        Ok(Self {
            ports,
            store,
            contexts,
            upstream,
            ports_store,
            ports_file: options.ports_file,
            ca,
            events,
            shutdown,
            tasks,
        })
    }

    pub fn ports(&self) -> &PortsFile {
        &self.ports
    }

    pub fn config_api_url(&self) -> &str {
        &self.ports.config_api_url
    }

    pub fn ntlm_proxy_url(&self) -> &str {
        &self.ports.ntlm_proxy_url
    }

    pub fn contexts(&self) -> &Arc<ConnectionContextManager> {
        &self.contexts
    }

    /// CA that signs certificates for intercepted hosts. Clients of the proxy
    /// must trust it.
    pub fn ca_certificate(&self) -> &CertificateDer<'static> {
        self.ca.ca_certificate()
    }

    /// Wait for the next control event.
    pub async fn next_event(&mut self) -> Option<ControlEvent> {
        self.events.recv().await
    }

    /// Resolve once the control API asks the proxy to quit. Returns whether
    /// the ports file should be kept.
    pub async fn wait_for_quit(&mut self) -> bool {
        while let Some(event) = self.events.recv().await {
            match event {
                ControlEvent::Quit { keep_ports_file } => return keep_ports_file,
                other => debug!(event = ?other, "control event"),
            }
        }
        false
    }

    /// Delete the ports file unless asked to keep it, drop all state and stop
    /// both listeners.
    pub async fn stop(self, keep_ports_file: bool) -> Result<()> {
        info!("shutting down NTLM auth proxy");
        let mut result = Ok(());
        if let Some(ports_file) = &self.ports_file {
            if !keep_ports_file && ports_file.exists() {
                result = ports_file.delete().await;
            }
        }
        self.store.clear();
        self.contexts.remove_all_connection_contexts(DestroyReason::Shutdown);
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "listener task failed");
            }
        }
        self.upstream.reset();
        self.ports_store.set_config_api_url(None);
        self.ports_store.set_ntlm_proxy_url(None);
        result
    }
}

/// Ask an instance advertised by the ports file to quit, then remove the
/// file. Failures are logged and startup continues.
async fn stop_existing_instance(ports_file: &PortsFileService, allow_multiple_instances: bool) {
    if !ports_file.exists() {
        return;
    }
    if allow_multiple_instances {
        debug!("existing proxy instance found, leave it running since multiple instances are allowed");
        return;
    }
    debug!("existing proxy instance found, sending shutdown");
    match ports_file.parse() {
        Ok(ports) => {
            let quit = tokio::time::timeout(QUIT_TIMEOUT, send_quit(&ports.config_api_url)).await;
            match quit {
                Ok(Ok(())) => debug!("existing instance acknowledged quit"),
                Ok(Err(e)) => debug!(error = %e, "quit request failed, deleting the ports file"),
                Err(_) => debug!("quit request timed out, deleting the ports file"),
            }
        }
        Err(e) => debug!(error = %e, "cannot read ports file of existing instance"),
    }
    if let Err(e) = ports_file.delete().await {
        warn!(error = %e, "cannot delete stale ports file");
    }
}

async fn send_quit(config_api_url: &str) -> Result<()> {
    let url = Url::parse(config_api_url)?;
    let target = TargetDescriptor::from_url(&url)
        .ok_or_else(|| ProxyError::PortsFile(format!("Invalid configApiUrl {config_api_url}")))?;
    let req = Request::builder()
        .method(Method::POST)
        .uri("/quit")
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(full_body(r#"{"keepPortsFile":true}"#.into()))
        .map_err(|e| ProxyError::Http(e.to_string()))?;
    let agent = Agent::new(AgentOptions::untracked());
    let res = agent.send(&target, req).await.map_err(|e| ProxyError::Http(e.to_string()))?;
    let status = res.status();
    res.into_body().collect().await.map_err(|e| ProxyError::Http(e.to_string()))?;
    if !status.is_success() {
        return Err(ProxyError::Http(format!("quit answered with status {status}")));
    }
    Ok(())
}
