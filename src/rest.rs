//! Bearer pass-through forwarding to the MOCI inspection API.
//!
//! The four lookups differ only in the upstream path segment and the query
//! parameter the path value goes into, so they share one implementation
//! driven by `MOCI_LOOKUPS`.

use std::time::Instant;

use axum::body::Bytes;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use crate::credentials::Credential;
use crate::error::GatewayError;

/// One GET lookup exposed as `/moci/{route}/:cr_number`.
#[derive(Debug)]
pub struct RestLookup {
    /// Path segment on the gateway side.
    pub route: &'static str,
    /// Path segment appended to the upstream base URL.
    pub segment: &'static str,
    /// Query parameter that receives the path value.
    pub param: &'static str,
}

pub static MOCI_LOOKUPS: [RestLookup; 4] = [
    RestLookup {
        route: "search-company",
        segment: "SearchCompany",
        param: "CRNumber",
    },
    RestLookup {
        route: "get-company-data",
        segment: "getCompanyData",
        param: "CRNumber",
    },
    RestLookup {
        route: "get-declared-activities",
        segment: "getDeclaredActivities",
        param: "CRNumber",
    },
    RestLookup {
        route: "get-places-of-activities",
        segment: "getPlacesOfActivities",
        param: "CRNumber",
    },
];

pub const LOGIN_SEGMENT: &str = "Login";

/// Upstream body returned to the caller as-is.
#[derive(Debug)]
pub struct UpstreamBody {
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

impl IntoResponse for UpstreamBody {
    fn into_response(self) -> Response {
        let mut resp = (StatusCode::OK, self.body).into_response();
        if let Some(ct) = self.content_type {
            resp.headers_mut().insert(CONTENT_TYPE, ct);
        }
        resp
    }
}

pub fn upstream_url(base: &str, segment: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), segment)
}

/// `GET {base}/{segment}?{param}={value}` with the caller's bearer token.
#[tracing::instrument(skip(http, base, credential), fields(segment = lookup.segment))]
pub async fn forward_lookup(
    http: &reqwest::Client,
    base: &str,
    lookup: &RestLookup,
    value: &str,
    credential: &Credential,
) -> Result<UpstreamBody, GatewayError> {
    let req = http
        .get(upstream_url(base, lookup.segment))
        .query(&[(lookup.param, value)])
        .header(CONTENT_TYPE, "application/json");
    relay(authorize(req, credential)).await
}

/// `POST {base}/Login` with the caller's JSON body.
#[tracing::instrument(skip_all)]
pub async fn forward_login(
    http: &reqwest::Client,
    base: &str,
    credential: &Credential,
    body: &Value,
) -> Result<UpstreamBody, GatewayError> {
    let req = http.post(upstream_url(base, LOGIN_SEGMENT)).json(body);
    relay(authorize(req, credential)).await
}

fn authorize(req: reqwest::RequestBuilder, credential: &Credential) -> reqwest::RequestBuilder {
    match credential {
        Credential::None => req,
        other => req.bearer_auth(other.expose()),
    }
}

async fn relay(req: reqwest::RequestBuilder) -> Result<UpstreamBody, GatewayError> {
    let started = Instant::now();
    let resp = req.send().await?;
    let status = resp.status();
    if !status.is_success() {
        tracing::warn!(status = status.as_u16(), "upstream rejected forwarded request");
        return Err(GatewayError::Upstream(format!(
            "Request failed with status code {}",
            status.as_u16()
        )));
    }
    let content_type = resp.headers().get(CONTENT_TYPE).cloned();
    let body = resp.bytes().await?;
    tracing::info!(
        status = status.as_u16(),
        bytes = body.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "forwarded request completed"
    );
    Ok(UpstreamBody { content_type, body })
}
