//! Small XML tree built on `quick-xml`, plus the XML <-> JSON mapping used to
//! normalize SOAP results.
//!
//! Mapping rules (`XmlElement::to_json`):
//!
//! * an element without attributes and without children becomes its text;
//! * otherwise it becomes an object: attributes under `"$"`, text under `"_"`
//!   and one key per child element name;
//! * repeated sibling names become arrays.
//!
//! `normalize` wraps the root as `{rootName: ...}`.  `from_json` is the
//! inverse, so `normalize(from_json(normalize(x)))` equals `normalize(x)`.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde_json::{Map, Value};

const ATTRIBUTES_KEY: &str = "$";
const TEXT_KEY: &str = "_";

#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("invalid XML: {0}")]
    Syntax(#[from] quick_xml::Error),
    #[error("malformed XML: {0}")]
    Malformed(&'static str),
    #[error("cannot render JSON as XML: {0}")]
    Shape(String),
    #[error("failed to write XML: {0}")]
    Write(String),
}

/// One parsed element.  `name` is the qualified name as written
/// (`soap:Body`); lookups go through the local part.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn local_name(&self) -> &str {
        local_part(&self.name)
    }

    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    /// First direct child with the given local name.
    pub fn child(&self, local: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.local_name() == local)
    }

    pub fn children_named<'a>(&'a self, local: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.local_name() == local)
    }

    /// Attribute value by local name (`soapAction`, `location`, ...).
    pub fn attribute(&self, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| local_part(k) == local)
            .map(|(_, v)| v.as_str())
    }

    pub fn to_json(&self) -> Value {
        if self.attributes.is_empty() && self.children.is_empty() {
            return Value::String(self.text.clone());
        }
        let mut map = Map::new();
        if !self.attributes.is_empty() {
            let attrs = self
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect::<Map<_, _>>();
            map.insert(ATTRIBUTES_KEY.to_string(), Value::Object(attrs));
        }
        if !self.text.is_empty() {
            map.insert(TEXT_KEY.to_string(), Value::String(self.text.clone()));
        }
        for child in &self.children {
            let value = child.to_json();
            match map.get_mut(&child.name) {
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    map.insert(child.name.clone(), value);
                }
            }
        }
        Value::Object(map)
    }
}

fn local_part(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

/// Parse a complete document into its root element.  Declarations, comments
/// and processing instructions are skipped; surrounding whitespace in text
/// nodes is trimmed.
pub fn parse(xml: &str) -> Result<XmlElement, XmlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;
    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(element_from(&start)?),
            Event::Empty(start) => {
                let element = element_from(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or(XmlError::Malformed("closing tag without opening tag"))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                let text = text.unescape()?;
                push_text(&mut stack, &text)?;
            }
            Event::CData(data) => {
                // Trimmed like text nodes, so rendering and re-parsing agree.
                let bytes = data.into_inner();
                push_text(&mut stack, String::from_utf8_lossy(&bytes).trim())?;
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if !stack.is_empty() {
        return Err(XmlError::Malformed("unclosed element at end of document"));
    }
    root.ok_or(XmlError::Malformed("document has no root element"))
}

/// Parse `xml` and map it to a JSON tree keyed by element names.
pub fn normalize(xml: &str) -> Result<Value, XmlError> {
    let root = parse(xml)?;
    let mut map = Map::new();
    map.insert(root.name.clone(), root.to_json());
    Ok(Value::Object(map))
}

/// Render a normalized JSON tree back into an XML document.
pub fn from_json(value: &Value) -> Result<String, XmlError> {
    let (name, inner) = match value {
        Value::Object(map) if map.len() == 1 => map
            .iter()
            .next()
            .ok_or_else(|| XmlError::Shape("empty object".into()))?,
        _ => {
            return Err(XmlError::Shape(
                "expected an object with exactly one root key".into(),
            ))
        }
    };
    if inner.is_array() {
        return Err(XmlError::Shape("root element cannot be an array".into()));
    }
    let mut writer = Writer::new(Vec::new());
    emit(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)),
    )?;
    write_value(&mut writer, name, inner)?;
    String::from_utf8(writer.into_inner()).map_err(|e| XmlError::Write(e.to_string()))
}

fn write_value(writer: &mut Writer<Vec<u8>>, name: &str, value: &Value) -> Result<(), XmlError> {
    match value {
        Value::Array(items) => {
            for item in items {
                if item.is_array() {
                    return Err(XmlError::Shape(format!("nested array under '{name}'")));
                }
                write_value(writer, name, item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            let mut start = BytesStart::new(name);
            if let Some(attrs) = map.get(ATTRIBUTES_KEY) {
                let attrs = attrs.as_object().ok_or_else(|| {
                    XmlError::Shape(format!("attributes of '{name}' must be an object"))
                })?;
                for (key, val) in attrs {
                    start.push_attribute((key.as_str(), scalar_text(val).as_str()));
                }
            }
            emit(writer, Event::Start(start))?;
            if let Some(text) = map.get(TEXT_KEY) {
                emit(writer, Event::Text(BytesText::new(&scalar_text(text))))?;
            }
            for (key, child) in map {
                if key == ATTRIBUTES_KEY || key == TEXT_KEY {
                    continue;
                }
                write_value(writer, key, child)?;
            }
            emit(writer, Event::End(BytesEnd::new(name)))
        }
        scalar => {
            emit(writer, Event::Start(BytesStart::new(name)))?;
            let text = scalar_text(scalar);
            if !text.is_empty() {
                emit(writer, Event::Text(BytesText::new(&text)))?;
            }
            emit(writer, Event::End(BytesEnd::new(name)))
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn emit(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), XmlError> {
    writer
        .write_event(event)
        .map_err(|e| XmlError::Write(e.to_string()))
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlElement, XmlError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attributes.push((key, value));
    }
    Ok(XmlElement {
        name,
        attributes,
        ..XmlElement::default()
    })
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), XmlError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
        return Ok(());
    }
    if root.is_some() {
        return Err(XmlError::Malformed("more than one root element"));
    }
    *root = Some(element);
    Ok(())
}

fn push_text(stack: &mut [XmlElement], text: &str) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(current) => {
            current.text.push_str(text);
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(XmlError::Malformed("text outside of the root element")),
    }
}
