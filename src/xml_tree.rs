//! Converts assignment XML into a `serde_json::Value` tree and provides the
//! get-or-null accessors every downstream stage reads it with.
//!
//! Tree rules: an element with neither attributes nor child elements becomes
//! its trimmed text (or `null` when empty). Anything else becomes an object
//! keyed by child element name, with `@attr` keys for attributes and `#text`
//! for non-empty text. A child name seen more than once turns into an array
//! in document order, so the same path can hold one object or a list of them.

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use quick_xml::escape::{resolve_predefined_entity, unescape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

struct OpenElement {
    name: String,
    fields: Map<String, Value>,
    text: String,
}

impl OpenElement {
    fn from_start(start: &BytesStart) -> Self {
        let mut fields = Map::new();
        for attr in start.attributes().flatten() {
            let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
            let raw = String::from_utf8_lossy(&attr.value).into_owned();
            let value = match unescape(&raw) {
                Ok(unescaped) => unescaped.into_owned(),
                Err(_) => raw,
            };
            fields.insert(key, Value::String(value));
        }

        Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            fields,
            text: String::new(),
        }
    }

    fn finish(self) -> (String, Value) {
        let text = self.text.trim();
        let value = if self.fields.is_empty() {
            if text.is_empty() {
                Value::Null
            } else {
                Value::String(text.to_string())
            }
        } else {
            let mut fields = self.fields;
            if !text.is_empty() {
                fields.insert("#text".to_string(), Value::String(text.to_string()));
            }
            Value::Object(fields)
        };
        (self.name, value)
    }
}

fn insert_child(fields: &mut Map<String, Value>, name: String, value: Value) {
    match fields.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            fields.insert(name, value);
        }
    }
}

fn attach(stack: &mut [OpenElement], root: &mut Map<String, Value>, name: String, value: Value) {
    match stack.last_mut() {
        Some(parent) => insert_child(&mut parent.fields, name, value),
        None => insert_child(root, name, value),
    }
}

fn resolve_reference(name: &str) -> Option<String> {
    if let Some(number) = name.strip_prefix('#') {
        let code = match number.strip_prefix('x').or_else(|| number.strip_prefix('X')) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => number.parse::<u32>().ok()?,
        };
        return char::from_u32(code).map(String::from);
    }
    resolve_predefined_entity(name).map(str::to_string)
}

/// Parses a complete XML document. The returned object holds the root element
/// under its own name.
pub fn parse_document(xml: &str) -> Result<Value> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut stack: Vec<OpenElement> = Vec::new();
    let mut root = Map::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => stack.push(OpenElement::from_start(e)),
            Ok(Event::Empty(ref e)) => {
                let (name, value) = OpenElement::from_start(e).finish();
                attach(&mut stack, &mut root, name, value);
            }
            Ok(Event::End(_)) => {
                let open = stack
                    .pop()
                    .ok_or_else(|| anyhow!("closing tag without a matching opening tag"))?;
                let (name, value) = open.finish();
                attach(&mut stack, &mut root, name, value);
            }
            Ok(Event::Text(e)) => {
                if let Some(open) = stack.last_mut() {
                    open.text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(open) = stack.last_mut() {
                    open.text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if let Some(open) = stack.last_mut() {
                    let name = String::from_utf8_lossy(&e).into_owned();
                    match resolve_reference(&name) {
                        Some(resolved) => open.text.push_str(&resolved),
                        None => {
                            open.text.push('&');
                            open.text.push_str(&name);
                            open.text.push(';');
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(anyhow!(
                    "malformed XML at byte {}: {}",
                    reader.error_position(),
                    e
                ))
            }
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        bail!("document ended inside <{}>", open.name);
    }
    if root.is_empty() {
        bail!("document has no root element");
    }
    Ok(Value::Object(root))
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Reads and parses one source file; `.gz` files are decompressed first.
pub fn read_document(path: &Path) -> Result<Value> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;

    let mut xml = String::new();
    if is_gzip(path) {
        GzDecoder::new(file).read_to_string(&mut xml)
    } else {
        BufReader::new(file).read_to_string(&mut xml)
    }
    .with_context(|| format!("Failed to read file: {}", path.display()))?;

    parse_document(&xml).with_context(|| format!("Failed to parse XML in {}", path.display()))
}

/// Follows `path` through nested objects. Returns `None` as soon as a segment
/// is missing, a non-object is hit on the way, or the final value is `null`.
pub fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |node, key| node.as_object()?.get(*key))
        .filter(|found| !found.is_null())
}

/// Normalizes a value that may be absent, a single item or an array into a list.
pub fn as_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single) => vec![single],
    }
}

/// Text content of a leaf: plain strings as-is, attributed elements via `#text`.
pub fn scalar_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(fields) => fields.get("#text").and_then(Value::as_str).map(str::to_string),
        Value::Null | Value::Array(_) => None,
    }
}
