#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use cpa_gateway::credentials::Secret;
use cpa_gateway::soap::ResponseShape;
use cpa_gateway::{app, build_state, AppConfig, Endpoints, MailCredentials, Secrets};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

pub const ROP_PASSWORD: &str = "rop-secret";
pub const SMS_USERNAME: &str = "cpa-user";
pub const SMS_PASSWORD: &str = "sms-secret";
pub const TENANT_ID: &str = "tenant-1";
pub const CLIENT_ID: &str = "client-1";
pub const CLIENT_SECRET: &str = "mail-secret";
pub const MAIL_SENDER: &str = "no.reply@cpa.gov.om";

/// One request as seen by a stub upstream.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: String,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("stub received non-JSON body")
    }
}

pub struct StubReply {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl StubReply {
    pub fn xml(status: StatusCode, body: String) -> Self {
        Self {
            status,
            content_type: "text/xml; charset=utf-8",
            body,
        }
    }

    pub fn json(status: StatusCode, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: String::new(),
        }
    }
}

type Responder = Arc<dyn Fn(&Recorded, &str) -> StubReply + Send + Sync>;

#[derive(Clone)]
struct StubContext {
    base: String,
    hits: Arc<Mutex<Vec<Recorded>>>,
    responder: Responder,
    delay: Option<Duration>,
}

/// A throwaway upstream on 127.0.0.1 that records every request and
/// answers through the supplied responder (which also receives the stub's
/// own base URL, for WSDL addresses).
pub struct Stub {
    pub base: String,
    hits: Arc<Mutex<Vec<Recorded>>>,
    handle: JoinHandle<()>,
}

impl Stub {
    pub async fn spawn<F>(responder: F) -> Self
    where
        F: Fn(&Recorded, &str) -> StubReply + Send + Sync + 'static,
    {
        Self::spawn_inner(None, responder).await
    }

    /// Like `spawn`, but every reply is held back for `delay`.
    pub async fn spawn_stalled<F>(delay: Duration, responder: F) -> Self
    where
        F: Fn(&Recorded, &str) -> StubReply + Send + Sync + 'static,
    {
        Self::spawn_inner(Some(delay), responder).await
    }

    async fn spawn_inner<F>(delay: Option<Duration>, responder: F) -> Self
    where
        F: Fn(&Recorded, &str) -> StubReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(Mutex::new(Vec::new()));
        let ctx = StubContext {
            base: base.clone(),
            hits: hits.clone(),
            responder: Arc::new(responder),
            delay,
        };
        let router = Router::new().fallback(record).with_state(ctx);
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Self { base, hits, handle }
    }

    pub fn hits(&self) -> Vec<Recorded> {
        self.hits.lock().unwrap().clone()
    }

    pub fn hit_count(&self) -> usize {
        self.hits.lock().unwrap().len()
    }

    /// Requests other than WSDL fetches.
    pub fn calls(&self) -> Vec<Recorded> {
        self.hits()
            .into_iter()
            .filter(|r| r.method != Method::GET || r.query.as_deref() != Some("wsdl"))
            .collect()
    }
}

impl Drop for Stub {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn record(
    State(ctx): State<StubContext>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let recorded = Recorded {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    let reply = (ctx.responder)(&recorded, &ctx.base);
    ctx.hits.lock().unwrap().push(recorded);
    if let Some(delay) = ctx.delay {
        tokio::time::sleep(delay).await;
    }
    (
        reply.status,
        [("content-type", reply.content_type)],
        reply.body,
    )
        .into_response()
}

/// Endpoints that all point at a single stub.
pub fn endpoints(base: &str) -> Endpoints {
    Endpoints {
        rop_wsdl_url: format!("{base}/rop.asmx?wsdl"),
        sms_wsdl_url: format!("{base}/sms.asmx?wsdl"),
        moci_base_url: format!("{base}/InspectionMobile"),
        authority_url: base.to_string(),
        mail_api_url: format!("{base}/graph"),
        mail_scope: "https://graph.microsoft.com/.default".to_string(),
        mail_sender: MAIL_SENDER.to_string(),
    }
}

pub fn config(base: &str) -> AppConfig {
    AppConfig {
        port: 0,
        endpoints: endpoints(base),
        secrets: Secrets {
            rop_service_password: Secret::new(ROP_PASSWORD),
            sms_username: SMS_USERNAME.to_string(),
            sms_password: Secret::new(SMS_PASSWORD),
            mail: MailCredentials {
                tenant_id: TENANT_ID.to_string(),
                client_id: CLIENT_ID.to_string(),
                client_secret: Secret::new(CLIENT_SECRET),
            },
        },
        rop_response: ResponseShape::PassThrough,
        upstream_timeout_ms: 5_000,
        max_request_bytes: None,
    }
}

pub async fn spawn_app(config: AppConfig) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = build_state(config).unwrap();
    let app: Router = app(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

/// Minimal ASMX-style WSDL exposing one document/literal operation.
pub fn wsdl(location: &str, operation: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<wsdl:definitions xmlns:soap="http://schemas.xmlsoap.org/wsdl/soap/" xmlns:wsdl="http://schemas.xmlsoap.org/wsdl/" xmlns:tns="http://tempuri.org/" targetNamespace="http://tempuri.org/">
  <wsdl:binding name="ServiceSoap" type="tns:ServiceSoap">
    <soap:binding transport="http://schemas.xmlsoap.org/soap/http"/>
    <wsdl:operation name="{operation}">
      <soap:operation soapAction="http://tempuri.org/{operation}" style="document"/>
    </wsdl:operation>
  </wsdl:binding>
  <wsdl:service name="Service">
    <wsdl:port name="ServiceSoap" binding="tns:ServiceSoap">
      <soap:address location="{location}"/>
    </wsdl:port>
  </wsdl:service>
</wsdl:definitions>"#
    )
}

pub fn soap_response(operation: &str, inner: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><{operation}Response xmlns="http://tempuri.org/">{inner}</{operation}Response></soap:Body></soap:Envelope>"#
    )
}

pub fn soap_fault(reason: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><soap:Fault><faultcode>soap:Server</faultcode><faultstring>{reason}</faultstring></soap:Fault></soap:Body></soap:Envelope>"#
    )
}

/// Serve a WSDL on `GET {path}?wsdl` and answer posts to `{path}` with `reply`.
pub fn soap_service(
    req: &Recorded,
    base: &str,
    path: &str,
    operation: &str,
    reply: impl FnOnce() -> StubReply,
) -> Option<StubReply> {
    if req.path != path {
        return None;
    }
    if req.method == Method::GET {
        return Some(StubReply::xml(
            StatusCode::OK,
            wsdl(&format!("{base}{path}"), operation),
        ));
    }
    Some(reply())
}
