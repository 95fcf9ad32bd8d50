//! SOAP 1.1 adapter.
//!
//! `SoapClient::connect` reads just enough of a WSDL document to call it: the
//! target namespace, the SOAP endpoint address and each operation's
//! SOAPAction.  `call` posts a document/literal envelope and returns the
//! `<{operation}Response>` element, turning SOAP faults into errors.
//! `dispatch` runs one `SoapCall` end to end and shapes the result.

use std::time::Instant;

use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::Json;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde_json::Value;

use crate::error::error_chain;
use crate::xml::{self, emit, XmlElement, XmlError};

const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
const XSD_NS: &str = "http://www.w3.org/2001/XMLSchema";
const SOAP_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

#[derive(Debug, thiserror::Error)]
pub enum SoapError {
    #[error("failed to load WSDL: {0}")]
    Wsdl(String),
    #[error("{0}")]
    Fault(String),
    #[error("SOAP transport error: {0}")]
    Transport(String),
    #[error("SOAP endpoint returned HTTP {status}")]
    Status { status: u16 },
    #[error("operation '{0}' is not described by the WSDL")]
    UnknownOperation(String),
    #[error("unexpected SOAP response: {0}")]
    Protocol(String),
    #[error(transparent)]
    Xml(#[from] XmlError),
}

/// One argument value. Lists are rendered the ASMX way, as
/// `<Name><string>..</string></Name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoapValue {
    Text(String),
    List(Vec<String>),
}

impl From<&str> for SoapValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SoapValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Ordered argument record for one operation.
pub type SoapArgs = Vec<(&'static str, SoapValue)>;

/// What a route hands back from a SOAP result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// The `{operation}Result` field, unmodified.
    PassThrough,
    /// The `{operation}Result` XML parsed into a JSON tree.
    Normalize,
    /// The whole response record as JSON.
    Record,
}

impl ResponseShape {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "raw" | "passthrough" | "pass-through" => Some(Self::PassThrough),
            "json" | "normalize" => Some(Self::Normalize),
            "record" => Some(Self::Record),
            _ => None,
        }
    }
}

/// Everything needed to perform one SOAP call. Built per request.
#[derive(Debug, Clone)]
pub struct SoapCall {
    pub wsdl_url: String,
    pub operation: &'static str,
    pub args: SoapArgs,
    pub shape: ResponseShape,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedResponse {
    Raw(String),
    Json(Value),
}

impl IntoResponse for NormalizedResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Raw(text) => ([(CONTENT_TYPE, SOAP_CONTENT_TYPE)], text).into_response(),
            Self::Json(value) => Json(value).into_response(),
        }
    }
}

#[derive(Debug, Clone)]
struct SoapOperation {
    name: String,
    action: Option<String>,
}

#[derive(Debug)]
pub struct SoapClient {
    http: reqwest::Client,
    endpoint: String,
    namespace: String,
    operations: Vec<SoapOperation>,
}

impl SoapClient {
    /// Fetch and read the WSDL at `wsdl_url`.
    pub async fn connect(http: &reqwest::Client, wsdl_url: &str) -> Result<Self, SoapError> {
        let resp = http
            .get(wsdl_url)
            .send()
            .await
            .map_err(|e| SoapError::Wsdl(error_chain(&e.without_url())))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SoapError::Wsdl(format!("HTTP {}", status.as_u16())));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| SoapError::Wsdl(error_chain(&e.without_url())))?;
        let wsdl = xml::parse(&text).map_err(|e| SoapError::Wsdl(e.to_string()))?;
        Self::from_wsdl(http.clone(), &wsdl)
    }

    fn from_wsdl(http: reqwest::Client, wsdl: &XmlElement) -> Result<Self, SoapError> {
        if wsdl.local_name() != "definitions" {
            return Err(SoapError::Wsdl(format!(
                "expected <definitions>, found <{}>",
                wsdl.name
            )));
        }
        let namespace = wsdl.attribute("targetNamespace").unwrap_or("").to_string();

        let addresses: Vec<&XmlElement> = wsdl
            .children_named("service")
            .flat_map(|s| s.children_named("port"))
            .flat_map(|p| p.children_named("address"))
            .collect();
        let address = addresses
            .iter()
            .find(|a| a.prefix() == Some("soap"))
            .or_else(|| addresses.iter().find(|a| a.prefix() != Some("http")))
            .and_then(|a| a.attribute("location"))
            .ok_or_else(|| SoapError::Wsdl("no SOAP address in service definition".into()))?;

        let mut operations: Vec<SoapOperation> = Vec::new();
        for op in wsdl
            .children_named("binding")
            .flat_map(|b| b.children_named("operation"))
        {
            let Some(name) = op.attribute("name") else {
                continue;
            };
            let action = op
                .child("operation")
                .and_then(|o| o.attribute("soapAction"))
                .map(str::to_string);
            match operations.iter_mut().find(|o| o.name == name) {
                Some(existing) if existing.action.is_none() => existing.action = action,
                Some(_) => {}
                None => operations.push(SoapOperation {
                    name: name.to_string(),
                    action,
                }),
            }
        }

        Ok(Self {
            http,
            endpoint: address.to_string(),
            namespace,
            operations,
        })
    }

    fn soap_action(&self, operation: &str) -> Result<String, SoapError> {
        let op = self
            .operations
            .iter()
            .find(|o| o.name == operation)
            .ok_or_else(|| SoapError::UnknownOperation(operation.to_string()))?;
        Ok(op.action.clone().unwrap_or_else(|| {
            if self.namespace.ends_with('/') {
                format!("{}{}", self.namespace, operation)
            } else {
                format!("{}/{}", self.namespace, operation)
            }
        }))
    }

    /// Invoke `operation` and return its response element.
    pub async fn call(&self, operation: &str, args: &SoapArgs) -> Result<XmlElement, SoapError> {
        let action = self.soap_action(operation)?;
        let body = envelope(&self.namespace, operation, args)?;
        let resp = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .header("SOAPAction", format!("\"{}\"", action))
            .body(body)
            .send()
            .await
            .map_err(|e| SoapError::Transport(error_chain(&e.without_url())))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| SoapError::Transport(error_chain(&e.without_url())))?;
        match parse_response(&text, operation) {
            // Faults usually arrive with HTTP 500; report them as faults.
            Err(SoapError::Fault(fault)) => Err(SoapError::Fault(fault)),
            _ if !status.is_success() => Err(SoapError::Status {
                status: status.as_u16(),
            }),
            other => other,
        }
    }
}

/// Build a SOAP 1.1 document/literal request envelope.
pub fn envelope(namespace: &str, operation: &str, args: &SoapArgs) -> Result<String, XmlError> {
    let mut writer = Writer::new(Vec::new());
    emit(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)),
    )?;
    let mut env = BytesStart::new("soap:Envelope");
    env.push_attribute(("xmlns:xsi", XSI_NS));
    env.push_attribute(("xmlns:xsd", XSD_NS));
    env.push_attribute(("xmlns:soap", SOAP_ENV_NS));
    emit(&mut writer, Event::Start(env))?;
    emit(&mut writer, Event::Start(BytesStart::new("soap:Body")))?;

    let mut op = BytesStart::new(operation);
    if !namespace.is_empty() {
        op.push_attribute(("xmlns", namespace));
    }
    emit(&mut writer, Event::Start(op))?;
    for (name, value) in args {
        match value {
            SoapValue::Text(text) => text_element(&mut writer, name, text)?,
            SoapValue::List(items) => {
                emit(&mut writer, Event::Start(BytesStart::new(*name)))?;
                for item in items {
                    text_element(&mut writer, "string", item)?;
                }
                emit(&mut writer, Event::End(BytesEnd::new(*name)))?;
            }
        }
    }
    emit(&mut writer, Event::End(BytesEnd::new(operation)))?;
    emit(&mut writer, Event::End(BytesEnd::new("soap:Body")))?;
    emit(&mut writer, Event::End(BytesEnd::new("soap:Envelope")))?;
    String::from_utf8(writer.into_inner()).map_err(|e| XmlError::Write(e.to_string()))
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<(), XmlError> {
    emit(writer, Event::Start(BytesStart::new(name)))?;
    emit(writer, Event::Text(BytesText::new(text)))?;
    emit(writer, Event::End(BytesEnd::new(name)))
}

/// Pull the response element (or the fault) out of a response envelope.
pub fn parse_response(body: &str, operation: &str) -> Result<XmlElement, SoapError> {
    let envelope = xml::parse(body)?;
    if envelope.local_name() != "Envelope" {
        return Err(SoapError::Protocol(format!(
            "expected a SOAP Envelope, found <{}>",
            envelope.name
        )));
    }
    let body = envelope
        .child("Body")
        .ok_or_else(|| SoapError::Protocol("envelope has no Body".into()))?;
    if let Some(fault) = body.child("Fault") {
        return Err(SoapError::Fault(fault_message(fault)));
    }
    let expected = format!("{operation}Response");
    body.child(&expected)
        .or_else(|| body.children.first())
        .cloned()
        .ok_or_else(|| SoapError::Protocol(format!("Body has no <{expected}>")))
}

fn fault_message(fault: &XmlElement) -> String {
    // SOAP 1.1: faultcode/faultstring. SOAP 1.2: Code/Value and Reason/Text.
    let code = fault
        .child("faultcode")
        .map(|c| c.text.as_str())
        .or_else(|| {
            fault
                .child("Code")
                .and_then(|c| c.child("Value"))
                .map(|v| v.text.as_str())
        })
        .filter(|c| !c.is_empty());
    let reason = fault
        .child("faultstring")
        .map(|s| s.text.as_str())
        .or_else(|| {
            fault
                .child("Reason")
                .and_then(|r| r.child("Text"))
                .map(|t| t.text.as_str())
        })
        .filter(|r| !r.is_empty())
        .unwrap_or("unknown SOAP fault");
    match code {
        Some(code) => format!("{code}: {reason}"),
        None => reason.to_string(),
    }
}

/// Turn a response element into what the route returns.
pub fn shape_response(
    response: &XmlElement,
    operation: &str,
    shape: ResponseShape,
) -> Result<NormalizedResponse, SoapError> {
    if shape == ResponseShape::Record {
        return Ok(NormalizedResponse::Json(
            without_namespace_decls(response).to_json(),
        ));
    }
    let result_name = format!("{operation}Result");
    let Some(result) = response.child(&result_name) else {
        return Ok(NormalizedResponse::Raw(String::new()));
    };
    // A typed (non-string) result is already structured.
    if !result.children.is_empty() || !result.attributes.is_empty() {
        let mut map = serde_json::Map::new();
        map.insert(
            result.name.clone(),
            without_namespace_decls(result).to_json(),
        );
        return Ok(NormalizedResponse::Json(Value::Object(map)));
    }
    match shape {
        ResponseShape::Normalize => Ok(NormalizedResponse::Json(xml::normalize(&result.text)?)),
        _ => Ok(NormalizedResponse::Raw(result.text.clone())),
    }
}

/// Copy of `element` with `xmlns` declarations dropped at every level.
fn without_namespace_decls(element: &XmlElement) -> XmlElement {
    XmlElement {
        name: element.name.clone(),
        attributes: element
            .attributes
            .iter()
            .filter(|(k, _)| k != "xmlns" && !k.starts_with("xmlns:"))
            .cloned()
            .collect(),
        text: element.text.clone(),
        children: element.children.iter().map(without_namespace_decls).collect(),
    }
}

/// Connect, invoke and shape: the full lifecycle of one SOAP call.
#[tracing::instrument(skip_all, fields(operation = call.operation))]
pub async fn dispatch(
    http: &reqwest::Client,
    call: &SoapCall,
) -> Result<NormalizedResponse, SoapError> {
    let started = Instant::now();
    let client = SoapClient::connect(http, &call.wsdl_url).await?;
    let response = client.call(call.operation, &call.args).await?;
    let shaped = shape_response(&response, call.operation, call.shape)?;
    tracing::info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        shape = ?call.shape,
        "SOAP call completed"
    );
    Ok(shaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const WSDL: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<wsdl:definitions xmlns:soap="http://schemas.xmlsoap.org/wsdl/soap/"
    xmlns:soap12="http://schemas.xmlsoap.org/wsdl/soap12/"
    xmlns:http="http://schemas.xmlsoap.org/wsdl/http/"
    xmlns:wsdl="http://schemas.xmlsoap.org/wsdl/"
    targetNamespace="http://tempuri.org/">
  <wsdl:binding name="BulkPushSoap" type="tns:BulkPushSoap">
    <soap:binding transport="http://schemas.xmlsoap.org/soap/http"/>
    <wsdl:operation name="SendSMS">
      <soap:operation soapAction="http://tempuri.org/SendSMS" style="document"/>
    </wsdl:operation>
  </wsdl:binding>
  <wsdl:binding name="BulkPushHttpGet" type="tns:BulkPushHttpGet">
    <wsdl:operation name="Ping"/>
  </wsdl:binding>
  <wsdl:service name="BulkPush">
    <wsdl:port name="BulkPushHttpGet" binding="tns:BulkPushHttpGet">
      <http:address location="http://sms.example/get"/>
    </wsdl:port>
    <wsdl:port name="BulkPushSoap12" binding="tns:BulkPushSoap12">
      <soap12:address location="http://sms.example/soap12"/>
    </wsdl:port>
    <wsdl:port name="BulkPushSoap" binding="tns:BulkPushSoap">
      <soap:address location="http://sms.example/BulkPush.asmx"/>
    </wsdl:port>
  </wsdl:service>
</wsdl:definitions>"#;

    fn client() -> SoapClient {
        let wsdl = xml::parse(WSDL).unwrap();
        SoapClient::from_wsdl(reqwest::Client::new(), &wsdl).unwrap()
    }

    #[test]
    fn wsdl_yields_endpoint_namespace_and_actions() {
        let client = client();
        assert_eq!(client.endpoint, "http://sms.example/BulkPush.asmx");
        assert_eq!(client.namespace, "http://tempuri.org/");
        assert_eq!(client.soap_action("SendSMS").unwrap(), "http://tempuri.org/SendSMS");
        assert_eq!(client.soap_action("Ping").unwrap(), "http://tempuri.org/Ping");
        assert!(matches!(
            client.soap_action("Missing"),
            Err(SoapError::UnknownOperation(_))
        ));
    }

    #[test]
    fn wsdl_without_address_is_rejected() {
        let wsdl = xml::parse(r#"<definitions targetNamespace="urn:x"><service/></definitions>"#)
            .unwrap();
        assert!(matches!(
            SoapClient::from_wsdl(reqwest::Client::new(), &wsdl),
            Err(SoapError::Wsdl(_))
        ));
    }

    #[test]
    fn envelope_carries_operation_namespace_and_ordered_args() {
        let args: SoapArgs = vec![
            ("Message", "a < b".into()),
            ("MSISDNs", SoapValue::List(vec!["968".into(), "969".into()])),
        ];
        let env = envelope("http://tempuri.org/", "SendSMS", &args).unwrap();
        let root = xml::parse(&env).unwrap();
        let op = root.child("Body").unwrap().child("SendSMS").unwrap();
        assert_eq!(op.attribute("xmlns"), Some("http://tempuri.org/"));
        assert_eq!(op.children[0].name, "Message");
        assert_eq!(op.children[0].text, "a < b");
        let numbers: Vec<&str> = op.children[1]
            .children_named("string")
            .map(|s| s.text.as_str())
            .collect();
        assert_eq!(numbers, vec!["968", "969"]);
    }

    #[test]
    fn faults_become_errors_with_their_text() {
        let fault = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><soap:Fault><faultcode>soap:Server</faultcode><faultstring>Invalid service password</faultstring></soap:Fault></soap:Body></soap:Envelope>"#;
        match parse_response(fault, "GetByCivilIDFromROP") {
            Err(SoapError::Fault(msg)) => assert_eq!(msg, "soap:Server: Invalid service password"),
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn shapes_follow_route_policy() {
        let body = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><GetByCivilIDFromROPResponse xmlns="http://tempuri.org/"><GetByCivilIDFromROPResult>&lt;Person&gt;&lt;Name&gt;Salim&lt;/Name&gt;&lt;/Person&gt;</GetByCivilIDFromROPResult></GetByCivilIDFromROPResponse></soap:Body></soap:Envelope>"#;
        let op = "GetByCivilIDFromROP";
        let response = parse_response(body, op).unwrap();

        let raw = shape_response(&response, op, ResponseShape::PassThrough).unwrap();
        assert_eq!(
            raw,
            NormalizedResponse::Raw("<Person><Name>Salim</Name></Person>".into())
        );
        let normalized = shape_response(&response, op, ResponseShape::Normalize).unwrap();
        assert_eq!(
            normalized,
            NormalizedResponse::Json(json!({"Person": {"Name": "Salim"}}))
        );
        let record = shape_response(&response, op, ResponseShape::Record).unwrap();
        assert_eq!(
            record,
            NormalizedResponse::Json(json!({
                "GetByCivilIDFromROPResult": "<Person><Name>Salim</Name></Person>"
            }))
        );
    }

    #[test]
    fn unparseable_result_fails_normalization() {
        let body = r#"<Envelope><Body><OpResponse><OpResult>not &lt;xml</OpResult></OpResponse></Body></Envelope>"#;
        let response = parse_response(body, "Op").unwrap();
        assert!(shape_response(&response, "Op", ResponseShape::Normalize).is_err());
    }

    #[test]
    fn response_shape_names() {
        assert_eq!(ResponseShape::parse("RAW"), Some(ResponseShape::PassThrough));
        assert_eq!(ResponseShape::parse("json"), Some(ResponseShape::Normalize));
        assert_eq!(ResponseShape::parse("xml"), None);
    }
}
