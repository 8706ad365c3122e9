//! Handshake state machine shared by the NTLM and Negotiate managers.
//!
//! The managers perform the network I/O; every state change goes through
//! [`step`], which keeps the sequencing rules testable without sockets.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    NotAuthenticated,
    /// NTLM Type1 or the initial Negotiate token was sent.
    Type1Sent,
    /// A challenge was received from the server.
    Type2Received,
    /// The answer to the challenge was sent along with the original request.
    Type3Sent,
    Authenticated,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthState::NotAuthenticated => "NotAuthenticated",
            AuthState::Type1Sent => "Type1Sent",
            AuthState::Type2Received => "Type2Received",
            AuthState::Type3Sent => "Type3Sent",
            AuthState::Authenticated => "Authenticated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    /// Start a handshake from scratch, whatever the current state.
    Begin,
    /// The server answered with a usable challenge.
    Challenge,
    /// The server answered without a usable challenge.
    NoChallenge,
    /// The challenge answer went out with the original request.
    ResponseSent,
    /// The response to the authenticated request arrived.
    Completed { status: u16 },
    /// The SSO facility produced no further token after a challenge.
    TokenExhausted { status: u16 },
    /// Transport or codec failure in the middle of the exchange.
    Failed,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    /// Send the bare request carrying the first token.
    SendRequestToken,
    /// Send the original request carrying the answer to the challenge.
    SendResponseToken,
    /// Wait for the server's answer to the authenticated request.
    AwaitResponse,
    /// The exchange is over, the last response goes to the client.
    Finish,
    /// Give up and pass the original request through unauthenticated.
    PassThrough,
    /// The event does not fit the current state, state was reset.
    ProtocolViolation,
    None,
}

/// Compute the next state and the action the caller must take.
pub fn step(state: AuthState, event: AuthEvent) -> (AuthState, AuthAction) {
    use AuthAction as A;
    use AuthEvent as E;
    use AuthState as S;

    match (state, event) {
        (_, E::Begin) => (S::Type1Sent, A::SendRequestToken),
        (_, E::Reset) => (S::NotAuthenticated, A::None),
        (_, E::Failed) | (_, E::NoChallenge) => (S::NotAuthenticated, A::PassThrough),

        // Negotiate may loop: a new challenge can follow the answer
        (S::Type1Sent | S::Type3Sent, E::Challenge) => (S::Type2Received, A::SendResponseToken),
        (S::Type2Received, E::ResponseSent) => (S::Type3Sent, A::AwaitResponse),

        (S::Type3Sent, E::Completed { status }) | (S::Type2Received, E::TokenExhausted { status }) => {
            if status == 401 {
                (S::NotAuthenticated, A::Finish)
            } else {
                (S::Authenticated, A::Finish)
            }
        }

        // host did not require authentication, or already authenticated
        (S::NotAuthenticated, E::Completed { .. }) => (S::NotAuthenticated, A::None),
        (S::Authenticated, E::Completed { .. }) => (S::Authenticated, A::None),

        _ => (S::NotAuthenticated, A::ProtocolViolation),
    }
}
