//! Core library for the CPA integration gateway.  This module wires the
//! configuration, credential resolver and shared HTTP client into the
//! application state and builds the Axum router over the route table in
//! `routes`.

mod config;
pub mod credentials;
pub mod email;
pub mod error;
pub mod rest;
pub mod routes;
pub mod soap;
pub mod validate;
pub mod xml;

pub use config::{AppConfig, Endpoints, MailCredentials, Secrets};
pub use error::{ErrorBody, GatewayError};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::handler::Handler;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, on, MethodRouter};
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::credentials::{CredentialResolver, OAuthClient};
use crate::routes::RouteDefinition;
use crate::soap::ResponseShape;

/// State shared across handlers.  Everything in here is read-only after
/// startup; cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Shared outbound client. Carries the upstream timeout.
    pub http: reqwest::Client,
    pub credentials: Arc<CredentialResolver>,
    pub endpoints: Arc<Endpoints>,
    pub rop_response: ResponseShape,
    /// Maximum accepted request body size in bytes (None => axum default).
    pub max_request_bytes: Option<usize>,
}

/// Build state from an explicit configuration.  Fails if the outbound HTTP
/// client cannot be constructed.
pub fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    let AppConfig {
        port: _,
        endpoints,
        secrets,
        rop_response,
        upstream_timeout_ms,
        max_request_bytes,
    } = config;

    let timeout = Duration::from_millis(upstream_timeout_ms);
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .context("failed to build outbound HTTP client")?;

    let oauth = OAuthClient::new(&endpoints.authority_url, &endpoints.mail_scope, &secrets.mail);
    let credentials = CredentialResolver::new(&secrets, oauth, http.clone());

    tracing::debug!(
        timeout_ms = upstream_timeout_ms,
        rop_response = ?rop_response,
        "gateway state built"
    );

    Ok(AppState {
        http,
        credentials: Arc::new(credentials),
        endpoints: Arc::new(endpoints),
        rop_response,
        max_request_bytes,
    })
}

/// Build state from environment variables.  See `AppConfig::from_env` for
/// the variables read; any missing secret is an error here, not later.
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    Ok(build_state(config)?)
}

fn method_router<H, T>(route: &RouteDefinition, handler: H) -> MethodRouter<AppState>
where
    H: Handler<T, AppState>,
    T: 'static,
{
    on(route.method, handler)
}

/// Build the Axum router and attach handlers.  The router holds a copy
/// of the `AppState` for each invocation.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let mut router = Router::new()
        .route(
            &routes::full_path(&routes::FETCH_CIVIL_INFO),
            method_router(&routes::FETCH_CIVIL_INFO, routes::fetch_civil_info),
        )
        .route(
            &routes::full_path(&routes::SEND_SMS),
            method_router(&routes::SEND_SMS, routes::send_sms),
        )
        .route(
            &routes::full_path(&routes::SEND_EMAIL),
            method_router(&routes::SEND_EMAIL, routes::send_email),
        )
        .route(
            &routes::full_path(&routes::MOCI_LOGIN),
            method_router(&routes::MOCI_LOGIN, routes::moci_login),
        )
        .route("/healthz", get(healthz_handler));

    for lookup in rest::MOCI_LOOKUPS.iter() {
        router = router.route(
            &routes::moci_lookup_path(lookup),
            method_router(
                &routes::MOCI_LOOKUP,
                move |State(state): State<AppState>,
                      Path(cr_number): Path<String>,
                      headers: HeaderMap| {
                    routes::moci_lookup(state, lookup, cr_number, headers)
                },
            ),
        );
    }

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler() -> axum::response::Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(json)).into_response()
}
