//! Proxy failures and the client-facing response they map to
//!
//! Every failure to reach the backend ends the same way: a `502 Bad Gateway`
//! with a short plain-text body. The `X-Proxy-Error` header carries the
//! specific cause for debugging.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::time::Duration;
use thiserror::Error;

/// Body sent with every 502
pub const GATEWAY_UNAVAILABLE: &str = "Gateway unavailable";

/// Ways forwarding to the backend can fail
#[derive(Debug, Error)]
pub enum ForwardError {
    /// TCP connect, send or receive failed
    #[error("connection to backend failed: {0}")]
    Connect(#[source] std::io::Error),
    /// The pooled HTTP client failed (refused, reset, protocol error)
    #[error("backend request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// The forwarded request could not be built
    #[error("failed to build backend request: {0}")]
    RequestBuild(#[from] hyper::http::Error),
    /// No response head within the request timeout
    #[error("backend did not respond within {}s", .0.as_secs())]
    Timeout(Duration),
    /// Backend closed the connection before answering an upgrade
    #[error("backend closed connection before responding")]
    Closed,
    /// Backend answered an upgrade with something that is not HTTP
    #[error("invalid upgrade response from backend")]
    InvalidResponse,
}

impl ForwardError {
    /// Value for the X-Proxy-Error header
    pub fn code(&self) -> &'static str {
        match self {
            ForwardError::Connect(_) | ForwardError::Client(_) => "CONNECTION_FAILED",
            ForwardError::RequestBuild(_) => "REQUEST_BUILD_FAILED",
            ForwardError::Timeout(_) => "REQUEST_TIMEOUT",
            ForwardError::Closed => "CONNECTION_CLOSED",
            ForwardError::InvalidResponse => "INVALID_RESPONSE",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::BAD_GATEWAY
    }

    /// The response sent to the client in place of the backend's
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        bad_gateway_response(self.code())
    }
}

/// Build the fixed 502 response
pub fn bad_gateway_response(code: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .header("X-Proxy-Error", code)
        .body(
            Full::new(Bytes::from_static(GATEWAY_UNAVAILABLE.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}
