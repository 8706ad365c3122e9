pub mod agent;
pub mod cert;
pub mod context;
pub mod context_manager;
pub mod dispatcher;
pub mod http_result;
pub mod https_validation;
pub mod server;
pub mod synthetic_response;
pub mod tunnel;

pub use agent::{Agent, AgentError, AgentOptions};
pub use cert::CertificateAuthority;
pub use context::{ClientId, ConnectionContext, DestroyReason};
pub use context_manager::{ClientConnection, ConnectionContextManager};
pub use dispatcher::{ConnectDecision, ProxyDispatcher, WebSocketCloseAction};
pub use http_result::HttpError;
pub use server::ProxyServer;
