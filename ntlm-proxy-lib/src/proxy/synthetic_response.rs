use bytes::Bytes;
use http::header::{CONTENT_TYPE, CONNECTION};
use http::{HeaderValue, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::Response;

use crate::error::{ProxyError, Result};

pub(crate) type RespBody = BoxBody<Bytes, hyper::Error>;

/// Build HTTP response with status code of 4xx and 5xx
pub(crate) fn synthetic_error_response(status_code: StatusCode) -> Result<Response<RespBody>> {
    let res = Response::builder()
        .status(status_code)
        .body(empty_body())
        .map_err(|e| ProxyError::Http(format!("Failed to build error response: {e}")))?;
    Ok(res)
}

/// Plain text response, closing the client connection when `close` is set.
pub(crate) fn text_response(status_code: StatusCode, text: impl Into<Bytes>, close: bool) -> Response<RespBody> {
    let mut res = Response::new(full_body(text.into()));
    *res.status_mut() = status_code;
    res.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    if close {
        res.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
    }
    res
}

pub(crate) fn full_body(bytes: Bytes) -> RespBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

pub(crate) fn empty_body() -> RespBody {
    full_body(Bytes::new())
}
