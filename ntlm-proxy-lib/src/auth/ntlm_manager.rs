use std::sync::Arc;

use http::request::Parts;
use http_body_util::BodyExt;
use tracing::{debug, info, warn};

use super::{can_handle_ntlm_authentication, debug_header, handshake_request, ntlm_challenge, HandshakeError};
use crate::auth::state::{AuthAction, AuthEvent, AuthState};
use crate::ntlm::{create_type1_message, create_type3_message, decode_type2_message, default_workstation, Type3Input};
use crate::proxy::agent::AgentError;
use crate::proxy::context::ConnectionContext;
use crate::store::ConfigStore;
use crate::target::TargetDescriptor;

/// Runs the NTLM Type1/Type2/Type3 exchange with explicitly configured
/// credentials.
pub struct NtlmManager {
    store: Arc<ConfigStore>,
}

impl NtlmManager {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Send Type1 on the context's socket and answer the challenge.
    ///
    /// Returns the Type3 `Authorization` value to attach to the original
    /// request. On failure the context is left `NotAuthenticated`.
    pub async fn handshake(
        &self,
        context: &ConnectionContext,
        target: &TargetDescriptor,
        original: &Parts,
    ) -> Result<String, HandshakeError> {
        context.set_state(target, AuthState::NotAuthenticated);
        match self.exchange(context, target, original).await {
            Ok(type3) => Ok(type3),
            Err(e) => {
                context.apply(target, AuthEvent::Failed);
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        context: &ConnectionContext,
        target: &TargetDescriptor,
        original: &Parts,
    ) -> Result<String, HandshakeError> {
        let credential = self
            .store
            .get(target)
            .ok_or_else(|| HandshakeError::MissingCredential(target.href().to_string()))?;
        let workstation = credential.workstation.clone().unwrap_or_else(default_workstation);

        let type1 = create_type1_message(credential.ntlm_version, &workstation, &credential.domain);
        let type1_header = type1.header();
        context.apply(target, AuthEvent::Begin);
        debug!(target = %target, "sending NTLM Type1");
        debug_header("NTLM Type1", &type1_header);

        let agent = context.agent();
        let req = handshake_request(original, &type1_header, agent.via_upstream())?;
        let res = agent.send(target, req).await?;
        let (parts, body) = res.into_parts();
        // drain so the socket is free for Type3
        body.collect().await.map_err(AgentError::from)?;

        let status = parts.status.as_u16();
        let challenge = match ntlm_challenge(&parts.headers) {
            Some(challenge) if can_handle_ntlm_authentication(status, &parts.headers) => challenge,
            _ => {
                warn!(target = %target, status, "NTLM authentication failed (www-authenticate with NTLM not found in server response)");
                return Err(HandshakeError::NoChallenge(status));
            }
        };
        debug_header("NTLM Type2", challenge);

        let type2 = decode_type2_message(challenge).inspect_err(|e| {
            warn!(target = %target, error = %e, "cannot parse NTLM Type2");
        })?;
        context.apply(target, AuthEvent::Challenge);
        debug!(target = %target, version = %type2.version, "received NTLM Type2");

        let type3 = create_type3_message(
            &type1,
            &type2,
            &Type3Input {
                username: &credential.username,
                password: &credential.password,
                workstation: &workstation,
                domain: &credential.domain,
                ..Type3Input::default()
            },
        );
        let header = type3.header();
        debug_header("NTLM Type3", &header);
        Ok(header)
    }

    /// Record that the Type3 answer went out with the original request.
    pub fn mark_type3_sent(&self, context: &ConnectionContext, target: &TargetDescriptor) {
        debug!(target = %target, "sending NTLM Type3 with the original request");
        if context.apply(target, AuthEvent::ResponseSent) == AuthAction::ProtocolViolation {
            warn!(target = %target, "Type3 sent in unexpected NTLM state, resetting");
        }
    }

    /// Final step once the response to the original request arrives.
    pub fn handshake_response(&self, context: &ConnectionContext, target: &TargetDescriptor, status: u16) -> AuthState {
        let before = context.get_state(target);
        match context.apply(target, AuthEvent::Completed { status }) {
            AuthAction::Finish if status == 401 => {
                warn!(target = %target, "NTLM authentication failed (invalid credentials)");
            }
            AuthAction::Finish => info!(target = %target, "NTLM authentication successful"),
            AuthAction::ProtocolViolation => {
                warn!(target = %target, state = %before, "response in unexpected NTLM state, resetting")
            }
            _ => {}
        }
        context.get_state(target)
    }
}
