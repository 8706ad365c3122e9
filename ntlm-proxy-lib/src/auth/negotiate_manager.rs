use std::sync::Arc;

use bytes::Bytes;
use http::request::Parts;
use http::{HeaderMap, Response};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tracing::{debug, info, warn};

use super::{
    accepts_mechanism, accepts_ntlm_authentication, debug_header, handshake_request, negotiate_challenge,
    ntlm_challenge, replay_request, HandshakeError, SecurityPackage, SsoError, SsoFacadeFactory,
};
use crate::auth::state::{AuthAction, AuthEvent, AuthState};
use crate::proxy::agent::AgentError;
use crate::proxy::context::ConnectionContext;
use crate::target::TargetDescriptor;

/// Runs single sign-on exchanges with tokens from the SSO facility.
///
/// Negotiate is tried first. A host that answers with an NTLM-only challenge
/// is retried with the facility's NTLM package. A Negotiate exchange may take
/// several rounds before the facility runs out of tokens.
pub struct NegotiateManager {
    sso: Arc<dyn SsoFacadeFactory>,
}

fn challenge_for(package: SecurityPackage, headers: &HeaderMap) -> Option<&str> {
    match package {
        SecurityPackage::Negotiate => negotiate_challenge(headers),
        SecurityPackage::Ntlm => ntlm_challenge(headers),
    }
}

impl NegotiateManager {
    pub fn new(sso: Arc<dyn SsoFacadeFactory>) -> Self {
        Self { sso }
    }

    /// Authenticate the context against `target`, replaying the original
    /// request with each response token.
    ///
    /// Returns the final response when the original request was already sent,
    /// or `None` when the caller still has to send it. On error the context is
    /// left `NotAuthenticated`.
    pub async fn handshake(
        &self,
        context: &ConnectionContext,
        target: &TargetDescriptor,
        original: &Parts,
        body: Bytes,
    ) -> Result<Option<Response<Incoming>>, HandshakeError> {
        context.set_state(target, AuthState::NotAuthenticated);
        let mut result = self.exchange(SecurityPackage::Negotiate, context, target, original, body.clone()).await;
        if let Err(HandshakeError::MechanismNotAccepted { offers_ntlm: true, .. }) = result {
            debug!(target = %target, "server only offers NTLM, retrying SSO with the NTLM package");
            result = self.exchange(SecurityPackage::Ntlm, context, target, original, body).await;
        }
        if result.is_err() {
            context.apply(target, AuthEvent::Failed);
        }
        result
    }

    async fn exchange(
        &self,
        package: SecurityPackage,
        context: &ConnectionContext,
        target: &TargetDescriptor,
        original: &Parts,
        body: Bytes,
    ) -> Result<Option<Response<Incoming>>, HandshakeError> {
        let agent = context.agent();
        let peer_certificate = if target.is_ssl() {
            // open the socket first so the facility can bind to its certificate
            agent.preconnect(target).await?;
            agent.peer_certificate()
        } else {
            None
        };
        if target.is_ssl() && peer_certificate.is_none() {
            debug!(target = %target, "could not retrieve peer certificate for channel binding");
        }
        context.set_sso(self.sso.create(package, target.hostname(), peer_certificate.as_ref())?);

        let request_token = context
            .with_sso(|sso| sso.create_auth_request_header())
            .unwrap_or_else(|| Err(SsoError::Facility("no SSO context".into())))?;

        context.apply(target, AuthEvent::Begin);
        debug!(target = %target, %package, "sending SSO request token");
        debug_header("SSO request token", &request_token);

        let mut res = agent.send(target, handshake_request(original, &request_token, agent.via_upstream())?).await?;
        // the first response answers a bodiless request and is never forwarded
        let mut replayed = false;

        loop {
            let status = res.status().as_u16();
            let Some(challenge) = challenge_for(package, res.headers()).map(str::to_string) else {
                if !replayed && !accepts_mechanism(res.headers(), package.as_str()) {
                    warn!(target = %target, status, "{package} authentication failed (www-authenticate with {package} not found in server response)");
                    let offers_ntlm = package == SecurityPackage::Negotiate
                        && status == 401
                        && accepts_ntlm_authentication(res.headers());
                    drain(res).await?;
                    return Err(HandshakeError::MechanismNotAccepted { package, status, offers_ntlm });
                }
                if package == SecurityPackage::Ntlm && replayed {
                    // NTLM ends with the server's answer to the Type3 request
                    context.apply(target, AuthEvent::Completed { status });
                    if status == 401 {
                        warn!(target = %target, "NTLM SSO authentication failed (invalid credentials)");
                    } else {
                        info!(target = %target, "NTLM SSO authentication successful");
                    }
                    return self.finish(res, replayed).await;
                }
                if status == 401 {
                    warn!(target = %target, "{package} authentication failed (invalid credentials)");
                } else {
                    warn!(target = %target, status, "{package} authentication failed (server responded without token)");
                }
                context.apply(target, AuthEvent::NoChallenge);
                return self.finish(res, replayed).await;
            };
            debug_header("SSO challenge", &challenge);

            let action = context.apply(target, AuthEvent::Challenge);
            if action == AuthAction::ProtocolViolation {
                drain(res).await?;
                return Err(HandshakeError::ProtocolViolation(context.get_state(target)));
            }

            let response_token = context
                .with_sso(|sso| sso.create_auth_response_header(&challenge))
                .unwrap_or_else(|| Err(SsoError::Facility("no SSO context".into())))?;

            if response_token.is_empty() {
                context.apply(target, AuthEvent::TokenExhausted { status });
                if status == 401 {
                    warn!(target = %target, "{package} authentication failed (invalid credentials)");
                } else {
                    info!(target = %target, "{package} authentication successful");
                }
                return self.finish(res, replayed).await;
            }

            if status != 401 && replayed {
                // the server accepted the request but the facility still has a token to offer
                context.set_state(target, AuthState::Authenticated);
                warn!(target = %target, status, "{package} produced a token after a successful response, forwarding the response");
                return Ok(Some(res));
            }

            drain(res).await?;
            debug!(target = %target, %package, "sending SSO response token with the original request");
            debug_header("SSO response token", &response_token);
            context.apply(target, AuthEvent::ResponseSent);
            res = agent.send(target, replay_request(original, body.clone(), Some(&response_token))?).await?;
            replayed = true;
        }
    }

    /// Hand the last response to the caller, unless it answers the bodiless
    /// opening request.
    async fn finish(&self, res: Response<Incoming>, replayed: bool) -> Result<Option<Response<Incoming>>, HandshakeError> {
        if replayed {
            Ok(Some(res))
        } else {
            drain(res).await?;
            Ok(None)
        }
    }
}

async fn drain(res: Response<Incoming>) -> Result<(), HandshakeError> {
    res.into_body().collect().await.map_err(AgentError::from)?;
    Ok(())
}
