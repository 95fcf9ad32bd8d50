use std::env;

use anyhow::{anyhow, Result};

use crate::credentials::Secret;
use crate::soap::ResponseShape;

const DEFAULT_ROP_WSDL_URL: &str = "http://10.14.7.77/ROP-PRO-V-2-DT/rop_service.asmx?wsdl";
const DEFAULT_SMS_WSDL_URL: &str = "https://tamimahsms.com/user/BulkPush.asmx?wsdl";
const DEFAULT_MOCI_BASE_URL: &str = "https://maidan.cpa.gov.om/cpa-web-api-pro/InspectionMobile";
const DEFAULT_AUTHORITY_URL: &str = "https://login.microsoftonline.com";
const DEFAULT_MAIL_API_URL: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_MAIL_SCOPE: &str = "https://graph.microsoft.com/.default";
const DEFAULT_MAIL_SENDER: &str = "no.reply@cpa.gov.om";

/// Where each upstream lives. Nothing in here is secret.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub rop_wsdl_url: String,
    pub sms_wsdl_url: String,
    pub moci_base_url: String,
    pub authority_url: String,
    pub mail_api_url: String,
    pub mail_scope: String,
    pub mail_sender: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            rop_wsdl_url: DEFAULT_ROP_WSDL_URL.to_owned(),
            sms_wsdl_url: DEFAULT_SMS_WSDL_URL.to_owned(),
            moci_base_url: DEFAULT_MOCI_BASE_URL.to_owned(),
            authority_url: DEFAULT_AUTHORITY_URL.to_owned(),
            mail_api_url: DEFAULT_MAIL_API_URL.to_owned(),
            mail_scope: DEFAULT_MAIL_SCOPE.to_owned(),
            mail_sender: DEFAULT_MAIL_SENDER.to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MailCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Secret,
}

#[derive(Debug, Clone)]
pub struct Secrets {
    pub rop_service_password: Secret,
    pub sms_username: String,
    pub sms_password: Secret,
    pub mail: MailCredentials,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub endpoints: Endpoints,
    pub secrets: Secrets,
    /// Result handling for the civil registry lookup.
    pub rop_response: ResponseShape,
    /// Applies to every outbound call, WSDL fetches included.
    pub upstream_timeout_ms: u64,
    pub max_request_bytes: Option<usize>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let secrets = Secrets {
            rop_service_password: require_env("ROP_SERVICE_PASSWORD")?.into(),
            sms_username: require_env("SMS_USERNAME")?,
            sms_password: require_env("SMS_PASSWORD")?.into(),
            mail: MailCredentials {
                tenant_id: require_env("EMAIL_TENANT_ID")?,
                client_id: require_env("EMAIL_CLIENT_ID")?,
                client_secret: require_env("EMAIL_CLIENT_SECRET")?.into(),
            },
        };

        let defaults = Endpoints::default();
        let endpoints = Endpoints {
            rop_wsdl_url: env_or("ROP_WSDL_URL", defaults.rop_wsdl_url),
            sms_wsdl_url: env_or("SMS_WSDL_URL", defaults.sms_wsdl_url),
            moci_base_url: env_or("MOCI_BASE_URL", defaults.moci_base_url),
            authority_url: env_or("EMAIL_AUTHORITY_URL", defaults.authority_url),
            mail_api_url: env_or("EMAIL_API_URL", defaults.mail_api_url),
            mail_scope: env_or("EMAIL_SCOPE", defaults.mail_scope),
            mail_sender: env_or("EMAIL_SENDER", defaults.mail_sender),
        };

        let rop_response = match optional_env("ROP_RESPONSE_MODE") {
            Some(mode) => ResponseShape::parse(&mode)
                .ok_or_else(|| anyhow!("ROP_RESPONSE_MODE must be 'raw' or 'json'"))?,
            None => ResponseShape::PassThrough,
        };

        let port = match parse_optional_u64("PORT")? {
            Some(p) => u16::try_from(p).map_err(|_| anyhow!("PORT must be between 0 and 65535"))?,
            None => 8080,
        };
        let upstream_timeout_ms = parse_optional_u64("UPSTREAM_TIMEOUT_MS")?
            .filter(|ms| *ms > 0)
            .unwrap_or(30_000);
        let max_request_bytes = parse_optional_u64("GATEWAY_MAX_REQUEST_BYTES")?.map(|v| v as usize);

        Ok(Self {
            port,
            endpoints,
            secrets,
            rop_response,
            upstream_timeout_ms,
            max_request_bytes,
        })
    }
}

fn optional_env(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn require_env(var: &str) -> Result<String> {
    optional_env(var).ok_or_else(|| anyhow!("{} must be set", var))
}

fn env_or(var: &str, default: String) -> String {
    optional_env(var).unwrap_or(default)
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
