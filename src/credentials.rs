//! Credential resolution per upstream kind.
//!
//! * civil registry and SMS: static service secrets loaded once at startup;
//! * mail API: an OAuth2 client-credentials token, acquired per send;
//! * MOCI: the caller's own bearer token, passed through unchanged.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde::Deserialize;

use crate::config::{MailCredentials, Secrets};
use crate::error::{error_chain, GatewayError};

/// A string that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Arc<str>);

impl Secret {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    CivilRegistry,
    Sms,
    Mail,
    Moci,
    /// Upstreams that take their credentials from the request body.
    Open,
}

/// Ready-to-use credential material for one outbound call.
#[derive(Debug, Clone)]
pub enum Credential {
    StaticSecret {
        username: Option<String>,
        secret: Secret,
    },
    OAuth2Token {
        value: Secret,
        expires_at: Instant,
    },
    ForwardedBearer(String),
    None,
}

impl Credential {
    /// The secret, token or bearer value. Empty for `None`.
    pub fn expose(&self) -> &str {
        match self {
            Self::StaticSecret { secret, .. } => secret.expose(),
            Self::OAuth2Token { value, .. } => value.expose(),
            Self::ForwardedBearer(token) => token,
            Self::None => "",
        }
    }

    /// Only OAuth2 tokens expire; everything else is valid for the request.
    pub fn is_expired(&self) -> bool {
        match self {
            Self::OAuth2Token { expires_at, .. } => Instant::now() >= *expires_at,
            _ => false,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            Self::StaticSecret { username, .. } => username.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Http(String),
    #[error("token endpoint returned {status}: {detail}")]
    Rejected { status: u16, detail: String },
    #[error("unsupported token type '{0}'")]
    UnsupportedTokenType(String),
}

/// Token endpoint response; only the client-credentials fields.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Error body returned by Entra ID style token endpoints.
#[derive(Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

/// Client-credentials settings for the mail API.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Secret,
    pub scope: String,
}

impl OAuthClient {
    pub fn new(authority_url: &str, scope: &str, creds: &MailCredentials) -> Self {
        Self {
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                authority_url.trim_end_matches('/'),
                creds.tenant_id
            ),
            client_id: creds.client_id.clone(),
            client_secret: creds.client_secret.clone(),
            scope: scope.to_string(),
        }
    }

    /// Exchange the client id and secret for an access token.
    #[tracing::instrument(skip_all, fields(client_id = %self.client_id))]
    pub async fn request_token(&self, http: &reqwest::Client) -> Result<Credential, TokenError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose()),
            ("scope", self.scope.as_str()),
        ];
        let started = Instant::now();
        let resp = http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| TokenError::Http(error_chain(&e.without_url())))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<TokenErrorResponse>(&body)
                .ok()
                .and_then(|e| e.error_description.or(e.error))
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| TokenError::Http(error_chain(&e.without_url())))?;
        if let Some(tt) = token.token_type.as_deref() {
            if !tt.eq_ignore_ascii_case("bearer") {
                return Err(TokenError::UnsupportedTokenType(tt.to_string()));
            }
        }
        let ttl = token
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_TTL);
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            ttl_secs = ttl.as_secs(),
            "access token acquired"
        );
        Ok(Credential::OAuth2Token {
            value: Secret::new(token.access_token),
            expires_at: Instant::now() + ttl,
        })
    }
}

/// Produces the credential for each upstream kind. Built once from the
/// startup configuration and shared read-only across requests.
#[derive(Debug)]
pub struct CredentialResolver {
    rop_password: Secret,
    sms_username: String,
    sms_password: Secret,
    oauth: OAuthClient,
    http: reqwest::Client,
}

impl CredentialResolver {
    pub fn new(secrets: &Secrets, oauth: OAuthClient, http: reqwest::Client) -> Self {
        Self {
            rop_password: secrets.rop_service_password.clone(),
            sms_username: secrets.sms_username.clone(),
            sms_password: secrets.sms_password.clone(),
            oauth,
            http,
        }
    }

    pub async fn resolve(
        &self,
        kind: UpstreamKind,
        headers: &HeaderMap,
    ) -> Result<Credential, GatewayError> {
        match kind {
            UpstreamKind::CivilRegistry => Ok(Credential::StaticSecret {
                username: None,
                secret: self.rop_password.clone(),
            }),
            UpstreamKind::Sms => Ok(Credential::StaticSecret {
                username: Some(self.sms_username.clone()),
                secret: self.sms_password.clone(),
            }),
            UpstreamKind::Mail => Ok(self.oauth.request_token(&self.http).await?),
            UpstreamKind::Moci => forwarded_bearer(headers).map(Credential::ForwardedBearer),
            UpstreamKind::Open => Ok(Credential::None),
        }
    }
}

fn authorization_error() -> GatewayError {
    GatewayError::Auth("Missing or invalid Authorization header".into())
}

/// Extract `<token>` from `Authorization: Bearer <token>`.
pub fn forwarded_bearer(headers: &HeaderMap) -> Result<String, GatewayError> {
    let raw = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(authorization_error)?;

    let (scheme, token) = raw.split_once(' ').ok_or_else(authorization_error)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(authorization_error());
    }
    let token = token.trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(authorization_error());
    }
    Ok(token.to_string())
}
