use http::StatusCode;
use thiserror::Error;

use crate::proxy::agent::AgentError;

/// HTTP result type, T is typically a hyper::Response
/// HttpError is used to generate a synthetic error response
pub(crate) type HttpResult<T> = std::result::Result<T, HttpError>;

/// Describes things that can go wrong while forwarding a client request
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid request - Could not read \"host\" header or \"host\" header refers to this proxy")]
    InvalidHostInRequestHeader,

    #[error("Failed to read request body: {0}")]
    FailedToReadRequestBody(String),

    #[error("Failed to generate upstream request: {0}")]
    FailedToGenerateUpstreamRequest(String),

    #[error("Failed to get response from target: {source}")]
    FailedToGetResponseFromTarget {
        #[source]
        source: AgentError,
        via_upstream: bool,
    },
}

impl HttpError {
    pub fn target(source: AgentError, via_upstream: bool) -> Self {
        HttpError::FailedToGetResponseFromTarget { source, via_upstream }
    }
}

impl From<&HttpError> for StatusCode {
    fn from(e: &HttpError) -> StatusCode {
        match e {
            HttpError::InvalidHostInRequestHeader => StatusCode::BAD_REQUEST,
            HttpError::FailedToReadRequestBody(_) => StatusCode::BAD_REQUEST,
            HttpError::FailedToGenerateUpstreamRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HttpError::FailedToGetResponseFromTarget { via_upstream: true, .. } => StatusCode::GATEWAY_TIMEOUT,
            HttpError::FailedToGetResponseFromTarget { via_upstream: false, .. } => StatusCode::BAD_GATEWAY,
        }
    }
}
