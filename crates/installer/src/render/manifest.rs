use kube::api::DynamicObject;
use serde_json::Value;
use tracing::trace;

use super::{RenderError, RenderedSet};

const DOCUMENT_SEPARATOR: &str = "---";

/// Split a multi-document YAML stream into objects.
///
/// Empty and `null` documents are skipped. A document that is not a mapping
/// with string `apiVersion` and `kind` and a `metadata` mapping is kept
/// verbatim in [`RenderedSet::raw_blobs`] rather than dropped.
pub fn parse_manifest(manifest: &str) -> Result<RenderedSet, RenderError> {
    let mut rendered = RenderedSet::default();
    for document in split_documents(manifest) {
        let document = document.trim();
        if document.is_empty() || document == "null" {
            continue;
        }
        match parse_object(document) {
            Parsed::Object(object) => rendered.objects.push(*object),
            Parsed::Empty => continue,
            Parsed::Blob => {
                trace!(len = document.len(), "keeping unparsed document");
                let mut blob = document.as_bytes().to_vec();
                blob.push(b'\n');
                rendered.raw_blobs.push(blob);
            }
        }
    }
    Ok(rendered)
}

/// Parse manifest bytes, rejecting content that is not UTF-8.
pub(crate) fn parse_manifest_bytes(bytes: &[u8]) -> Result<RenderedSet, RenderError> {
    let manifest = std::str::from_utf8(bytes)
        .map_err(|e| RenderError::Manifest(format!("manifest is not valid UTF-8: {}", e)))?;
    parse_manifest(manifest)
}

enum Parsed {
    Object(Box<DynamicObject>),
    Empty,
    Blob,
}

fn split_documents(manifest: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();
    for line in manifest.lines() {
        if line.starts_with(DOCUMENT_SEPARATOR) && is_separator(line) {
            documents.push(std::mem::take(&mut current));
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    documents.push(current);
    documents
}

// `---` optionally followed by whitespace or a comment. `----` is content.
fn is_separator(line: &str) -> bool {
    let rest = &line[DOCUMENT_SEPARATOR.len()..];
    rest.is_empty() || rest.starts_with(char::is_whitespace) || rest.starts_with('#')
}

fn parse_object(document: &str) -> Parsed {
    let value: Value = match serde_yaml::from_str(document) {
        Ok(value) => value,
        Err(_) => return Parsed::Blob,
    };
    let map = match &value {
        Value::Null => return Parsed::Empty,
        Value::Object(map) if map.is_empty() => return Parsed::Empty,
        Value::Object(map) => map,
        _ => return Parsed::Blob,
    };
    let has_types = map.get("apiVersion").map(Value::is_string).unwrap_or(false)
        && map.get("kind").map(Value::is_string).unwrap_or(false);
    let has_metadata = map.get("metadata").map(Value::is_object).unwrap_or(false);
    if !has_types || !has_metadata {
        return Parsed::Blob;
    }
    match serde_json::from_value::<DynamicObject>(value) {
        Ok(object) => Parsed::Object(Box::new(object)),
        Err(_) => Parsed::Blob,
    }
}
