//! Error normalization.
//!
//! Every route returns `Result<_, GatewayError>`.  Whatever failed on the way
//! (bad input, a missing bearer token, a SOAP fault, a token exchange or a
//! downstream HTTP error) ends up as exactly one of three kinds and is
//! rendered as `{"error": "<message>"}` with the matching status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::credentials::TokenError;
use crate::soap::SoapError;
use crate::xml::XmlError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Missing or invalid input. Detected before any upstream call.
    #[error("{0}")]
    Validation(String),
    /// Missing or malformed forwarded credential.
    #[error("{0}")]
    Auth(String),
    /// Request body exceeded the configured limit.
    #[error("{0}")]
    PayloadTooLarge(String),
    /// Any failure reported by, or while talking to, an upstream.
    #[error("Error : {0}")]
    Upstream(String),
}

/// Body of every error response.
#[derive(Debug, Serialize, Clone)]
pub struct ErrorBody {
    pub error: String,
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn upstream(message: impl std::fmt::Display) -> Self {
        Self::Upstream(message.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SoapError> for GatewayError {
    fn from(err: SoapError) -> Self {
        Self::upstream(err)
    }
}

impl From<TokenError> for GatewayError {
    fn from(err: TokenError) -> Self {
        Self::upstream(err)
    }
}

// Only reachable from response shaping, which runs after the upstream call.
impl From<XmlError> for GatewayError {
    fn from(err: XmlError) -> Self {
        Self::upstream(err)
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        // Strip the URL so upstream hosts and query strings stay internal.
        Self::Upstream(error_chain(&err.without_url()))
    }
}

/// Render an error together with its sources, `outer: inner: root`.
/// reqwest keeps the useful part ("operation timed out", "connection
/// refused") in the source chain.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            Self::Upstream(detail) => {
                tracing::warn!(status = status.as_u16(), error = %detail, "upstream failure")
            }
            other => tracing::debug!(status = status.as_u16(), error = %other, "request rejected"),
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
