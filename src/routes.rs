//! Route table and handlers.
//!
//! Each route is data: its path, required fields and upstream kind.  The
//! handlers all follow the same steps: validate, resolve the credential,
//! hand a freshly built call descriptor to the adapter for its upstream kind.

use axum::extract::rejection::{BytesRejection, FailedToBufferBody, JsonRejection};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::MethodFilter;
use axum::Json;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::credentials::{Credential, UpstreamKind};
use crate::email::{self, EmailRequest};
use crate::error::GatewayError;
use crate::rest::{self, RestLookup};
use crate::soap::{self, ResponseShape, SoapArgs, SoapCall, SoapValue};
use crate::validate::{self, FieldRule};
use crate::AppState;

pub const API_PREFIX: &str = "/api/v1";

#[derive(Debug)]
pub struct RouteDefinition {
    pub path: &'static str,
    pub method: MethodFilter,
    pub required: &'static [FieldRule],
    pub upstream: UpstreamKind,
}

pub static FETCH_CIVIL_INFO: RouteDefinition = RouteDefinition {
    path: "/rop/fetch-civil-info",
    method: MethodFilter::POST,
    required: &[
        FieldRule::truthy("civilId", "Invalid Civil Id"),
        FieldRule::truthy("expiryDate", "Invalid Expiry Date"),
    ],
    upstream: UpstreamKind::CivilRegistry,
};

const MOBILES: FieldRule =
    FieldRule::list("mobiles", "Invalid Mobile Numbers").or_alias(&["mobile"]);

pub static SEND_SMS: RouteDefinition = RouteDefinition {
    path: "/send-sms",
    method: MethodFilter::POST,
    required: &[
        FieldRule::truthy("message", "Invalid Message"),
        MOBILES,
    ],
    upstream: UpstreamKind::Sms,
};

pub static SEND_EMAIL: RouteDefinition = RouteDefinition {
    path: "/send-email",
    method: MethodFilter::POST,
    required: &[
        FieldRule::list("recipients", "Invalid recipients email addresses"),
        FieldRule::truthy("subject", "Invalid email subject"),
        FieldRule::truthy("content", "Invalid email content"),
    ],
    upstream: UpstreamKind::Mail,
};

pub static MOCI_LOGIN: RouteDefinition = RouteDefinition {
    path: "/moci/login",
    method: MethodFilter::POST,
    required: &[],
    upstream: UpstreamKind::Open,
};

/// Shared definition of the MOCI lookups; each `RestLookup` adds its
/// own segment under `path`.
pub static MOCI_LOOKUP: RouteDefinition = RouteDefinition {
    path: "/moci",
    method: MethodFilter::GET,
    required: &[],
    upstream: UpstreamKind::Moci,
};

/// Gateway path of a MOCI lookup route.
pub fn moci_lookup_path(lookup: &RestLookup) -> String {
    format!("{}{}/{}/:cr_number", API_PREFIX, MOCI_LOOKUP.path, lookup.route)
}

pub fn full_path(route: &RouteDefinition) -> String {
    format!("{}{}", API_PREFIX, route.path)
}

const ROP_OPERATION: &str = "GetByCivilIDFromROP";
const SMS_OPERATION: &str = "SendSMS";

// Fixed SendSMS values; callers cannot override them.
pub const SMS_PRIORITY: &str = "2";
pub const SMS_SENDER: &str = "CPA";
pub const SMS_SOURCE_REF: &str = "value2";

/// Unwrap the JSON body, turning extractor rejections into gateway errors.
fn json_body(payload: Result<Json<Value>, JsonRejection>) -> Result<Value, GatewayError> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        ))) => {
            tracing::warn!("request body exceeded configured limit");
            Err(GatewayError::PayloadTooLarge("Request too large".into()))
        }
        Err(rejection) => Err(GatewayError::validation(format!(
            "Invalid request body: {}",
            rejection.body_text()
        ))),
    }
}

fn typed<T: DeserializeOwned>(body: Value) -> Result<T, GatewayError> {
    serde_json::from_value(body)
        .map_err(|e| GatewayError::validation(format!("Invalid request body: {}", e)))
}

/// Text form of a scalar argument (`12345678` and `"12345678"` alike).
fn arg_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// A number is a string or a JSON number; anything nested is rejected.
fn msisdn_text(value: &Value) -> Option<String> {
    match value {
        Value::String(_) | Value::Number(_) => Some(arg_text(Some(value))),
        _ => None,
    }
}

pub fn civil_info_call(
    wsdl_url: &str,
    shape: ResponseShape,
    credential: &Credential,
    body: &Value,
) -> SoapCall {
    let args: SoapArgs = vec![
        ("ServicePassword", credential.expose().into()),
        ("CivilID", arg_text(body.get("civilId")).into()),
        ("ExpiryDate", arg_text(body.get("expiryDate")).into()),
    ];
    SoapCall {
        wsdl_url: wsdl_url.to_string(),
        operation: ROP_OPERATION,
        args,
        shape,
    }
}

pub fn sms_call(
    wsdl_url: &str,
    credential: &Credential,
    body: &Value,
) -> Result<SoapCall, GatewayError> {
    let invalid = || GatewayError::validation("Invalid Mobile Numbers");
    let numbers: Vec<String> = match MOBILES.lookup(body) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|n| msisdn_text(n).ok_or_else(invalid))
            .collect::<Result<_, _>>()?,
        Some(single) => vec![msisdn_text(single).ok_or_else(invalid)?],
        None => return Err(invalid()),
    };
    let numbers: Vec<String> = numbers.into_iter().filter(|n| !n.is_empty()).collect();
    if numbers.is_empty() {
        return Err(invalid());
    }
    let args: SoapArgs = vec![
        ("UserName", credential.username().unwrap_or_default().into()),
        ("Password", credential.expose().into()),
        ("Message", arg_text(body.get("message")).into()),
        ("Priority", SMS_PRIORITY.into()),
        ("Sender", SMS_SENDER.into()),
        ("SourceRef", SMS_SOURCE_REF.into()),
        ("MSISDNs", SoapValue::List(numbers)),
    ];
    Ok(SoapCall {
        wsdl_url: wsdl_url.to_string(),
        operation: SMS_OPERATION,
        args,
        shape: ResponseShape::Record,
    })
}

pub async fn fetch_civil_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let route = &FETCH_CIVIL_INFO;
    let body = json_body(payload)?;
    validate::check(&body, route.required)?;
    let credential = state.credentials.resolve(route.upstream, &headers).await?;
    let call = civil_info_call(
        &state.endpoints.rop_wsdl_url,
        state.rop_response,
        &credential,
        &body,
    );
    Ok(soap::dispatch(&state.http, &call).await?.into_response())
}

pub async fn send_sms(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let route = &SEND_SMS;
    let body = json_body(payload)?;
    validate::check(&body, route.required)?;
    let credential = state.credentials.resolve(route.upstream, &headers).await?;
    let call = sms_call(&state.endpoints.sms_wsdl_url, &credential, &body)?;
    Ok(soap::dispatch(&state.http, &call).await?.into_response())
}

pub async fn send_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let route = &SEND_EMAIL;
    let body = json_body(payload)?;
    validate::check(&body, route.required)?;
    let message = email::compose(typed::<EmailRequest>(body)?)?;
    let token = state.credentials.resolve(route.upstream, &headers).await?;
    email::send(
        &state.http,
        &state.endpoints.mail_api_url,
        &state.endpoints.mail_sender,
        &token,
        &message,
    )
    .await?;
    Ok(Json(json!({ "status": email::SENT_STATUS })).into_response())
}

pub async fn moci_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let route = &MOCI_LOGIN;
    let body = json_body(payload)?;
    validate::check(&body, route.required)?;
    let credential = state.credentials.resolve(route.upstream, &headers).await?;
    let forwarded =
        rest::forward_login(&state.http, &state.endpoints.moci_base_url, &credential, &body)
            .await?;
    Ok(forwarded.into_response())
}

pub async fn moci_lookup(
    state: AppState,
    lookup: &'static RestLookup,
    cr_number: String,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let route = &MOCI_LOOKUP;
    let credential = state.credentials.resolve(route.upstream, &headers).await?;
    let forwarded = rest::forward_lookup(
        &state.http,
        &state.endpoints.moci_base_url,
        lookup,
        &cr_number,
        &credential,
    )
    .await?;
    Ok(forwarded.into_response())
}
