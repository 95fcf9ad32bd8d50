//! Mapping of the gateway's email request onto the mail API's `sendMail`
//! message schema, and the send itself.

use std::time::Instant;

use axum::http::StatusCode;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::credentials::Credential;
use crate::error::GatewayError;

pub const SENT_STATUS: &str = "Email was sent Successfully !";
const FILE_ATTACHMENT_TYPE: &str = "#microsoft.graph.fileAttachment";

/// A single address or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInput {
    pub name: String,
    /// Base64 file content.
    pub content_bytes: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum BodyType {
    #[default]
    #[serde(rename = "HTML", alias = "html")]
    Html,
    #[serde(rename = "Text", alias = "text")]
    Text,
}

/// Inbound `/send-email` body. Optional lists may be absent or `null`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailRequest {
    pub recipients: OneOrMany,
    pub subject: String,
    pub content: String,
    #[serde(default)]
    pub content_type: Option<BodyType>,
    #[serde(default)]
    pub cc: Option<OneOrMany>,
    #[serde(default)]
    pub bcc: Option<OneOrMany>,
    #[serde(default)]
    pub attachments: Option<Vec<AttachmentInput>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmailAddress {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub email_address: EmailAddress,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemBody {
    pub content_type: BodyType,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    #[serde(rename = "@odata.type")]
    pub odata_type: &'static str,
    pub name: String,
    pub content_bytes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub subject: String,
    pub body: ItemBody,
    pub to_recipients: Vec<Recipient>,
    pub cc_recipients: Vec<Recipient>,
    pub bcc_recipients: Vec<Recipient>,
    pub attachments: Vec<FileAttachment>,
}

#[derive(Debug, Serialize)]
struct SendMailBody<'a> {
    message: &'a Message,
}

fn recipients(list: Option<OneOrMany>) -> Vec<Recipient> {
    list.map(OneOrMany::into_vec)
        .unwrap_or_default()
        .into_iter()
        .map(|address| address.trim().to_string())
        .filter(|address| !address.is_empty())
        .map(|address| Recipient {
            email_address: EmailAddress { address },
        })
        .collect()
}

/// Build the mail API message. Fails only on attachments whose content is
/// not valid base64.
pub fn compose(req: EmailRequest) -> Result<Message, GatewayError> {
    let to_recipients = recipients(Some(req.recipients));
    if to_recipients.is_empty() {
        return Err(GatewayError::validation("Invalid recipients email addresses"));
    }
    let attachments = req
        .attachments
        .unwrap_or_default()
        .into_iter()
        .map(|file| {
            general_purpose::STANDARD
                .decode(file.content_bytes.trim())
                .map_err(|_| {
                    GatewayError::validation(format!(
                        "Invalid attachment content for '{}'",
                        file.name
                    ))
                })?;
            Ok(FileAttachment {
                odata_type: FILE_ATTACHMENT_TYPE,
                name: file.name,
                content_bytes: file.content_bytes.trim().to_string(),
                content_type: file.content_type,
            })
        })
        .collect::<Result<Vec<_>, GatewayError>>()?;

    Ok(Message {
        subject: req.subject,
        body: ItemBody {
            content_type: req.content_type.unwrap_or_default(),
            content: req.content,
        },
        to_recipients,
        cc_recipients: recipients(req.cc),
        bcc_recipients: recipients(req.bcc),
        attachments,
    })
}

/// `POST {api}/users/{sender}/sendMail` with the acquired token.
#[tracing::instrument(skip(http, api_url, token, message), fields(to = message.to_recipients.len()))]
pub async fn send(
    http: &reqwest::Client,
    api_url: &str,
    sender: &str,
    token: &Credential,
    message: &Message,
) -> Result<(), GatewayError> {
    if token.is_expired() {
        return Err(GatewayError::Upstream("access token expired before send".into()));
    }
    let url = format!("{}/users/{}/sendMail", api_url.trim_end_matches('/'), sender);
    let started = Instant::now();
    let resp = http
        .post(url)
        .bearer_auth(token.expose())
        .json(&SendMailBody { message })
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(GatewayError::Upstream(api_error_message(status, &body)));
    }
    tracing::info!(
        status = status.as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "mail accepted"
    );
    Ok(())
}

/// Prefer the API's own `{"error": {"code", "message"}}` text.
fn api_error_message(status: StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));
    let code = error.and_then(|e| e.get("code")).and_then(Value::as_str);
    let message = error.and_then(|e| e.get("message")).and_then(Value::as_str);
    match (code, message) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        (None, Some(message)) => message.to_string(),
        _ => format!("mail API returned status {}", status.as_u16()),
    }
}
