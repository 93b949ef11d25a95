//! JSONPath extraction over decoded request and response bodies.

use crate::error::{Error, Result};
use jsonpath_rust::{JsonPathFinder, JsonPathInst};
use serde_json::Value;
use std::str::FromStr;

/// Prefix bare paths (`data.id`, `[0].id`) with the JSONPath root.
fn normalize(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('$') {
        path.to_string()
    } else if path.starts_with('[') {
        format!("${path}")
    } else {
        format!("$.{path}")
    }
}

/// Compile a path, reporting syntax problems as
/// [`Error::ExtractionSyntax`].
pub fn compile(path: &str) -> Result<JsonPathInst> {
    let normalized = normalize(path);
    JsonPathInst::from_str(&normalized).map_err(|reason| Error::ExtractionSyntax {
        path: path.to_string(),
        reason,
    })
}

/// Return every value in `document` matched by `path`.
///
/// An empty vector means the path is valid but matched nothing.
pub fn extract(document: &Value, path: &str) -> Result<Vec<Value>> {
    let inst = compile(path)?;
    let finder = JsonPathFinder::new(Box::new(document.clone()), Box::new(inst));

    let matches = match finder.find() {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };
    Ok(matches)
}

/// First value matched by `path`, if any.
pub fn extract_first(document: &Value, path: &str) -> Result<Option<Value>> {
    Ok(extract(document, path)?.into_iter().next())
}

/// Text form of a value for splicing into strings: strings are used
/// raw, everything else in its JSON form.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
