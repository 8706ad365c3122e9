use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::auth::{step, AuthAction, AuthEvent, AuthState, SsoFacade};
use crate::proxy::agent::Agent;
use crate::store::HostPattern;
use crate::target::TargetDescriptor;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one client connection: a TCP connection, or a TLS session
/// intercepted inside one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn next() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Why a context is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// Replaced by a context for another target on the same client connection.
    Reuse,
    ClientClosed,
    Reset,
    Shutdown,
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DestroyReason::Reuse => "reuse",
            DestroyReason::ClientClosed => "close",
            DestroyReason::Reset => "reset",
            DestroyReason::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Default)]
struct AuthBinding {
    host: Option<TargetDescriptor>,
    state: AuthState,
}

/// State kept for one client connection.
///
/// The auth state is bound to a single target at a time; asking about any
/// other target reads [`AuthState::NotAuthenticated`].
pub struct ConnectionContext {
    client: ClientId,
    is_ssl: bool,
    agent: Arc<Agent>,
    client_cancel: CancellationToken,
    config_api_connection: AtomicBool,
    auth: Mutex<AuthBinding>,
    sso: Mutex<Option<Box<dyn SsoFacade>>>,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("client", &self.client)
            .field("is_ssl", &self.is_ssl)
            .field("agent", &self.agent.id())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionContext {
    pub fn new(client: ClientId, is_ssl: bool, agent: Arc<Agent>, client_cancel: CancellationToken) -> Self {
        Self {
            client,
            is_ssl,
            agent,
            client_cancel,
            config_api_connection: AtomicBool::new(false),
            auth: Mutex::new(AuthBinding::default()),
            sso: Mutex::new(None),
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn is_ssl(&self) -> bool {
        self.is_ssl
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// The client connection carries requests to the control API.
    pub fn config_api_connection(&self) -> bool {
        self.config_api_connection.load(Ordering::Relaxed)
    }

    pub fn mark_config_api_connection(&self) {
        self.config_api_connection.store(true, Ordering::Relaxed);
    }

    /// The context is unbound, or bound to `target` over the same protocol.
    pub fn match_host_or_new(&self, target: &TargetDescriptor, is_ssl: bool) -> bool {
        let auth = lock(&self.auth);
        match &auth.host {
            None => true,
            Some(host) => host == target && self.is_ssl == is_ssl,
        }
    }

    pub fn get_state(&self, target: &TargetDescriptor) -> AuthState {
        let auth = lock(&self.auth);
        match &auth.host {
            Some(host) if host == target => auth.state,
            _ => AuthState::NotAuthenticated,
        }
    }

    /// Bind the context to `target` and record `state`.
    pub fn set_state(&self, target: &TargetDescriptor, state: AuthState) {
        let mut auth = lock(&self.auth);
        auth.host = Some(target.clone());
        auth.state = state;
    }

    /// Feed `event` to the handshake state machine for `target`.
    pub fn apply(&self, target: &TargetDescriptor, event: AuthEvent) -> AuthAction {
        let mut auth = lock(&self.auth);
        let current = match &auth.host {
            Some(host) if host == target => auth.state,
            _ => AuthState::NotAuthenticated,
        };
        let (next, action) = step(current, event);
        if next != current {
            debug!(client = %self.client, target = %target, from = %current, to = %next, "auth state");
        }
        auth.host = Some(target.clone());
        auth.state = next;
        action
    }

    /// Reset to `NotAuthenticated` when the bound host falls under `pattern`.
    pub fn clear_authentication(&self, pattern: &HostPattern) -> bool {
        let mut auth = lock(&self.auth);
        match &auth.host {
            Some(host) if pattern.matches(host) => {
                auth.state = AuthState::NotAuthenticated;
                true
            }
            _ => false,
        }
    }

    /// Install the SSO handle, releasing any previous one.
    pub fn set_sso(&self, facade: Box<dyn SsoFacade>) {
        *lock(&self.sso) = Some(facade);
    }

    /// Run `f` against the SSO handle, if one was created.
    pub fn with_sso<R>(&self, f: impl FnOnce(&mut dyn SsoFacade) -> R) -> Option<R> {
        let mut sso = lock(&self.sso);
        match sso.as_mut() {
            Some(facade) => Some(f(facade.as_mut())),
            None => None,
        }
    }

    /// Close outbound sockets, release the SSO handle, and close the client
    /// connection unless the context is only being replaced. Connections to
    /// the control API stay open so a reset can still be answered.
    pub fn destroy(&self, reason: DestroyReason) {
        self.agent.destroy();
        if reason != DestroyReason::Reuse && !self.config_api_connection() {
            self.client_cancel.cancel();
        }
        lock(&self.sso).take();
        debug!(client = %self.client, %reason, "connection context destroyed");
    }
}
