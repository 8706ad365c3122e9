use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use ahash::AHashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::proxy::agent::{Agent, AgentOptions};
use crate::proxy::context::{ClientId, ConnectionContext, DestroyReason};
use crate::store::HostPattern;
use crate::target::TargetDescriptor;
use crate::upstream::UpstreamProxyManager;

/// A client connection as seen by the proxy listener.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub id: ClientId,
    pub addr: Option<SocketAddr>,
    /// Cancelling closes the client connection.
    pub cancel: CancellationToken,
}

impl ClientConnection {
    pub fn new(addr: Option<SocketAddr>, cancel: CancellationToken) -> Self {
        Self { id: ClientId::next(), addr, cancel }
    }
}

struct TrackedContext {
    context: Arc<ConnectionContext>,
    managed: bool,
}

/// Owns every live [`ConnectionContext`] and CONNECT tunnel, keyed by client
/// connection.
pub struct ConnectionContextManager {
    contexts: Mutex<AHashMap<ClientId, TrackedContext>>,
    tunnels: Mutex<AHashMap<ClientId, CancellationToken>>,
    upstream: Arc<UpstreamProxyManager>,
    reject_unauthorized: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionContextManager {
    pub fn new(upstream: Arc<UpstreamProxyManager>) -> Self {
        Self {
            contexts: Mutex::new(AHashMap::new()),
            tunnels: Mutex::new(AHashMap::new()),
            upstream,
            reject_unauthorized: true,
        }
    }

    /// `false` accepts any target certificate, loopback or not.
    pub fn with_tls_reject_unauthorized(mut self, reject_unauthorized: bool) -> Self {
        self.reject_unauthorized = reject_unauthorized;
        self
    }

    /// Self-signed certificates are accepted on loopback targets.
    pub fn reject_unauthorized(&self, target: &TargetDescriptor) -> bool {
        self.reject_unauthorized && !target.is_localhost()
    }

    /// Context for `client`, replaced when it is bound to another target,
    /// another protocol, or was built for a different kind of target.
    pub fn get_or_create_context(
        &self,
        client: &ClientConnection,
        is_ssl: bool,
        target: &TargetDescriptor,
        managed: bool,
    ) -> Arc<ConnectionContext> {
        let mut contexts = lock(&self.contexts);
        if let Some(tracked) = contexts.get(&client.id) {
            if tracked.managed == managed && tracked.context.match_host_or_new(target, is_ssl) {
                return tracked.context.clone();
            }
            debug!(client = %client.id, target = %target, "client connection switched target, replacing context");
            tracked.context.destroy(DestroyReason::Reuse);
        }

        let agent = Arc::new(self.build_agent(target, is_ssl, managed));
        debug!(client = %client.id, agent = agent.id(), target = %target, managed, "created agent");
        let context = Arc::new(ConnectionContext::new(client.id, is_ssl, agent, client.cancel.clone()));
        contexts.insert(client.id, TrackedContext { context: context.clone(), managed });
        context
    }

    fn build_agent(&self, target: &TargetDescriptor, is_ssl: bool, managed: bool) -> Agent {
        let mut options = if managed { AgentOptions::managed() } else { AgentOptions::default() };
        options.reject_unauthorized = self.reject_unauthorized(target);
        self.upstream.set_upstream_proxy_config(target, is_ssl, &mut options);
        Agent::new(options)
    }

    /// Single-use agent that no context tracks and no reset destroys.
    pub fn get_untracked_agent(&self, target: &TargetDescriptor) -> Agent {
        let agent = Agent::new(AgentOptions::untracked());
        debug!(agent = agent.id(), target = %target, "created untracked agent");
        agent
    }

    /// Force a new handshake on every context whose bound host falls under `pattern`.
    pub fn clear_authentication(&self, pattern: &HostPattern) {
        let contexts = lock(&self.contexts);
        let cleared = contexts.values().filter(|t| t.context.clear_authentication(pattern)).count();
        debug!(pattern = pattern.as_str(), cleared, "cleared authentication");
    }

    pub fn remove_context(&self, client: ClientId, reason: DestroyReason) {
        let removed = lock(&self.contexts).remove(&client);
        if let Some(tracked) = removed {
            tracked.context.destroy(reason);
            debug!(%client, %reason, "removed connection context");
        }
    }

    /// Destroy every context and close every tunnel.
    pub fn remove_all_connection_contexts(&self, reason: DestroyReason) {
        let drained: Vec<TrackedContext> = lock(&self.contexts).drain().map(|(_, t)| t).collect();
        let count = drained.len();
        for tracked in drained {
            tracked.context.destroy(reason);
        }
        self.remove_and_close_all_tunnels(reason);
        debug!(%reason, count, "removed all connection contexts");
    }

    pub fn context_count(&self) -> usize {
        lock(&self.contexts).len()
    }

    pub fn add_tunnel(&self, client: ClientId, close: CancellationToken) {
        lock(&self.tunnels).insert(client, close);
    }

    pub fn remove_tunnel(&self, client: ClientId) {
        lock(&self.tunnels).remove(&client);
    }

    pub fn tunnel_count(&self) -> usize {
        lock(&self.tunnels).len()
    }

    fn remove_and_close_all_tunnels(&self, reason: DestroyReason) {
        let drained: Vec<CancellationToken> = lock(&self.tunnels).drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for close in drained {
            close.cancel();
        }
        if count > 0 {
            debug!(%reason, count, "closed all tunnels");
        }
    }
}

/// Removes the client's context when the connection ends.
pub struct ContextGuard {
    manager: Arc<ConnectionContextManager>,
    client: ClientId,
}

impl ContextGuard {
    pub fn new(manager: Arc<ConnectionContextManager>, client: ClientId) -> Self {
        Self { manager, client }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.manager.remove_context(self.client, DestroyReason::ClientClosed);
    }
}

/// Untracks a tunnel when it closes.
pub struct TunnelGuard {
    manager: Arc<ConnectionContextManager>,
    client: ClientId,
}

impl TunnelGuard {
    pub fn new(manager: Arc<ConnectionContextManager>, client: ClientId, close: CancellationToken) -> Self {
        manager.add_tunnel(client, close);
        Self { manager, client }
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.manager.remove_tunnel(self.client);
    }
}
