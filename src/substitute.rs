//! Writing extracted values into a pending request.
//!
//! Targets are addressed as `body.<segments>`, `headers.<name>`,
//! `query.<name>` or `url.<placeholder>`. Body segments are walked on a
//! mutable [`Value`] so no field is ever located by evaluating text.

use crate::error::{Error, Result};
use crate::extractor::value_to_text;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

/// `{{ name }}` marker embedded in a string field. Markers named
/// `cache.<key>` are cache references and are left for
/// [`expand_cache_refs`].
static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("failed to compile marker regex")
});

const CACHE_REF_PREFIX: &str = "cache.";

/// One step into a JSON document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Location in a request that receives a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPath {
    Body(Vec<Segment>),
    Header(String),
    Query(String),
    Url(String),
}

const LOCATIONS: [&str; 4] = ["body", "headers", "query", "url"];

/// True when `target` starts with an explicit location such as
/// `headers.`.
pub fn has_location_prefix(target: &str) -> bool {
    LOCATIONS.iter().any(|loc| {
        target
            .strip_prefix(loc)
            .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('['))
    })
}

impl FromStr for TargetPath {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let target = raw.trim();
        let named = |rest: &str| -> Result<String> {
            let name = rest.trim();
            if name.is_empty() {
                return Err(Error::invalid_target(raw, "missing name"));
            }
            Ok(name.to_string())
        };

        if let Some(rest) = target.strip_prefix("headers.") {
            return Ok(Self::Header(named(rest)?));
        }
        if let Some(rest) = target.strip_prefix("query.") {
            return Ok(Self::Query(named(rest)?));
        }
        if let Some(rest) = target.strip_prefix("url.") {
            return Ok(Self::Url(named(rest)?));
        }
        let body = target
            .strip_prefix("body")
            .filter(|rest| rest.is_empty() || rest.starts_with('.') || rest.starts_with('['))
            .unwrap_or(target);
        Ok(Self::Body(parse_segments(body).map_err(|reason| {
            Error::invalid_target(raw, reason)
        })?))
    }
}

/// Split `data.items[0].id` (optionally rooted with `$`) into segments.
pub fn parse_segments(path: &str) -> std::result::Result<Vec<Segment>, String> {
    let path = path.trim();
    let path = path.strip_prefix('$').unwrap_or(path);
    let mut segments = Vec::new();

    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            segments.push(Segment::Key(key.to_string()));
        }
        while !rest.is_empty() {
            let close = rest
                .find(']')
                .ok_or_else(|| format!("unclosed bracket in '{part}'"))?;
            let inner = rest[1..close].trim();
            let inner = inner.trim_matches(|c| c == '\'' || c == '"');
            match inner.parse::<usize>() {
                Ok(index) => segments.push(Segment::Index(index)),
                Err(_) if !inner.is_empty() => segments.push(Segment::Key(inner.to_string())),
                Err(_) => return Err(format!("empty brackets in '{part}'")),
            }
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(format!("unexpected '{rest}' after brackets"));
            }
        }
    }

    if segments.is_empty() {
        return Err("path has no segments".to_string());
    }
    Ok(segments)
}

/// Replace every single-brace `{name}` in `url`. Tokens that are part of
/// a `{{ name }}` marker are not placeholders. `None` when nothing was
/// replaced.
fn replace_url_placeholder(url: &str, name: &str, replacement: &str) -> Option<String> {
    let token = format!("{{{name}}}");
    let mut out = String::with_capacity(url.len());
    let mut last = 0;
    let mut replaced = false;
    for (start, _) in url.match_indices(&token) {
        let end = start + token.len();
        if url[..start].ends_with('{') || url[end..].starts_with('}') {
            continue;
        }
        out.push_str(&url[last..start]);
        out.push_str(replacement);
        last = end;
        replaced = true;
    }
    if !replaced {
        return None;
    }
    out.push_str(&url[last..]);
    Some(out)
}

/// Set `value` at `segments` inside `root`, creating intermediate
/// objects. Array indices must exist or be one past the end.
pub fn set_path(
    root: &mut Value,
    segments: &[Segment],
    value: Value,
) -> std::result::Result<(), String> {
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return Ok(());
    };

    let mut current = root;
    for (i, segment) in parents.iter().enumerate() {
        let next_is_index = matches!(segments[i + 1], Segment::Index(_));
        current = step_mut(current, segment, next_is_index)?;
    }

    match last {
        Segment::Key(key) => {
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
            let Value::Object(map) = current else {
                return Err(format!("cannot set key '{key}' on non-object"));
            };
            map.insert(key.clone(), value);
        }
        Segment::Index(index) => {
            let Value::Array(items) = current else {
                return Err(format!("cannot set index {index} on non-array"));
            };
            if *index < items.len() {
                items[*index] = value;
            } else if *index == items.len() {
                items.push(value);
            } else {
                return Err(format!("index {index} out of bounds (len {})", items.len()));
            }
        }
    }
    Ok(())
}

fn step_mut<'a>(
    current: &'a mut Value,
    segment: &Segment,
    next_is_index: bool,
) -> std::result::Result<&'a mut Value, String> {
    let empty = || {
        if next_is_index {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        }
    };
    match segment {
        Segment::Key(key) => {
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
            match current {
                Value::Object(map) => Ok(map.entry(key.clone()).or_insert_with(empty)),
                _ => Err(format!("cannot descend into '{key}' of non-object")),
            }
        }
        Segment::Index(index) => match current {
            Value::Array(items) => {
                if *index == items.len() {
                    items.push(empty());
                }
                items
                    .get_mut(*index)
                    .ok_or_else(|| format!("index {index} out of bounds"))
            }
            _ => Err(format!("cannot index [{index}] into non-array")),
        },
    }
}

/// Read the value at `segments`, if present.
pub fn get_path<'a>(root: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |current, segment| match segment {
        Segment::Key(key) => current.get(key.as_str()),
        Segment::Index(index) => current.get(*index),
    })
}

/// Splice `replacement` into the first binding marker of `text`.
///
/// Returns `None` when `text` has no binding marker or consists of
/// nothing but the marker, in which case the caller replaces the whole
/// field instead.
pub fn splice_marker(text: &str, replacement: &str) -> Option<String> {
    let marker = MARKER_RE
        .captures_iter(text)
        .find(|caps| !caps[1].starts_with(CACHE_REF_PREFIX))?
        .get(0)?;
    if marker.as_str() == text.trim() {
        return None;
    }
    let mut spliced = String::with_capacity(text.len() + replacement.len());
    spliced.push_str(&text[..marker.start()]);
    spliced.push_str(replacement);
    spliced.push_str(&text[marker.end()..]);
    Some(spliced)
}

/// Request being prepared for a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: crate::model::HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
}

impl From<&crate::model::HttpRequest> for PreparedRequest {
    fn from(request: &crate::model::HttpRequest) -> Self {
        Self {
            method: request.method,
            url: request.url.clone(),
            headers: request.headers.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
        }
    }
}

impl PreparedRequest {
    /// Write `value` into this request at `target`.
    pub fn apply(&mut self, target: &TargetPath, value: &Value) -> Result<()> {
        match target {
            TargetPath::Url(name) => {
                self.url = replace_url_placeholder(&self.url, name, &value_to_text(value))
                    .ok_or_else(|| {
                        Error::invalid_target(
                            format!("url.{name}"),
                            format!("placeholder {{{name}}} not found in '{}'", self.url),
                        )
                    })?;
            }
            TargetPath::Header(name) => set_text(&mut self.headers, name, value),
            TargetPath::Query(name) => set_text(&mut self.query, name, value),
            TargetPath::Body(segments) => {
                let body = self.body.get_or_insert_with(|| Value::Object(Map::new()));
                let replacement = match get_path(body, segments) {
                    Some(Value::String(current)) => splice_marker(current, &value_to_text(value))
                        .map(Value::String)
                        .unwrap_or_else(|| value.clone()),
                    _ => value.clone(),
                };
                set_path(body, segments, replacement).map_err(|reason| {
                    Error::invalid_target(describe_body(segments), reason)
                })?;
            }
        }
        Ok(())
    }

    /// Cache keys referenced through `{{ cache.<key> }}` anywhere in the
    /// request.
    pub fn cache_refs(&self) -> Vec<String> {
        let mut refs = Vec::new();
        let mut collect = |text: &str| {
            for caps in MARKER_RE.captures_iter(text) {
                if let Some(key) = caps[1].strip_prefix(CACHE_REF_PREFIX) {
                    if !refs.iter().any(|r| r == key) {
                        refs.push(key.to_string());
                    }
                }
            }
        };
        collect(&self.url);
        self.headers.values().for_each(|v| collect(v));
        self.query.values().for_each(|v| collect(v));
        if let Some(body) = &self.body {
            visit_strings(body, &mut collect);
        }
        refs
    }
}

fn describe_body(segments: &[Segment]) -> String {
    let mut text = String::from("body");
    for segment in segments {
        match segment {
            Segment::Key(key) => {
                text.push('.');
                text.push_str(key);
            }
            Segment::Index(index) => text.push_str(&format!("[{index}]")),
        }
    }
    text
}

fn set_text(map: &mut HashMap<String, String>, name: &str, value: &Value) {
    let text = value_to_text(value);
    let updated = map
        .get(name)
        .and_then(|current| splice_marker(current, &text))
        .unwrap_or(text);
    map.insert(name.to_string(), updated);
}

fn visit_strings(value: &Value, f: &mut impl FnMut(&str)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|v| visit_strings(v, f)),
        Value::Object(map) => map.values().for_each(|v| visit_strings(v, f)),
        _ => {}
    }
}

/// Replace `{{ cache.<key> }}` references using `lookup`.
///
/// A string that is exactly one reference becomes the cached value
/// itself; references embedded in longer text are replaced by the
/// value's text form.
pub fn expand_cache_refs(request: &mut PreparedRequest, lookup: &HashMap<String, Value>) {
    let expand_text = |text: &str| -> String {
        MARKER_RE
            .replace_all(text, |caps: &regex::Captures| {
                caps[1]
                    .strip_prefix(CACHE_REF_PREFIX)
                    .and_then(|key| lookup.get(key))
                    .map(value_to_text)
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    };

    request.url = expand_text(&request.url);
    for value in request.headers.values_mut() {
        *value = expand_text(value);
    }
    for value in request.query.values_mut() {
        *value = expand_text(value);
    }
    if let Some(body) = request.body.as_mut() {
        expand_value(body, lookup, &expand_text);
    }
}

fn expand_value(
    value: &mut Value,
    lookup: &HashMap<String, Value>,
    expand_text: &impl Fn(&str) -> String,
) {
    match value {
        Value::String(s) => {
            let whole = MARKER_RE
                .captures(s.as_str())
                .filter(|caps| &caps[0] == s.trim())
                .and_then(|caps| caps[1].strip_prefix(CACHE_REF_PREFIX).map(str::to_string));
            let next = match whole.and_then(|key| lookup.get(&key)) {
                Some(cached) => cached.clone(),
                None => Value::String(expand_text(s)),
            };
            *value = next;
        }
        Value::Array(items) => items
            .iter_mut()
            .for_each(|v| expand_value(v, lookup, expand_text)),
        Value::Object(map) => map
            .values_mut()
            .for_each(|v| expand_value(v, lookup, expand_text)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HttpMethod, HttpRequest};
    use serde_json::json;

    fn request(url: &str, body: Value) -> PreparedRequest {
        PreparedRequest::from(&HttpRequest {
            method: HttpMethod::Post,
            url: url.to_string(),
            headers: HashMap::new(),
            query: HashMap::new(),
            body: Some(body),
        })
    }

    #[test]
    fn parses_target_locations() {
        assert_eq!(
            "headers.Authorization".parse::<TargetPath>().unwrap(),
            TargetPath::Header("Authorization".into())
        );
        assert_eq!(
            "url.mail_id".parse::<TargetPath>().unwrap(),
            TargetPath::Url("mail_id".into())
        );
        assert_eq!(
            "body.items[1].id".parse::<TargetPath>().unwrap(),
            TargetPath::Body(vec![
                Segment::Key("items".into()),
                Segment::Index(1),
                Segment::Key("id".into()),
            ])
        );
        assert_eq!(
            "$.parent_id".parse::<TargetPath>().unwrap(),
            TargetPath::Body(vec![Segment::Key("parent_id".into())])
        );
        assert!("headers.".parse::<TargetPath>().is_err());
        assert!("body.items[1".parse::<TargetPath>().is_err());
    }

    #[test]
    fn body_prefixed_key_is_not_a_location() {
        assert_eq!(
            "bodyguard".parse::<TargetPath>().unwrap(),
            TargetPath::Body(vec![Segment::Key("bodyguard".into())])
        );
        assert!(!has_location_prefix("bodyguard"));
        assert!(has_location_prefix("body.id"));
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut root = json!({});
        let segments = parse_segments("a.b.c").unwrap();
        set_path(&mut root, &segments, json!(5)).unwrap();
        assert_eq!(root, json!({"a": {"b": {"c": 5}}}));
    }

    #[test]
    fn set_path_rejects_out_of_bounds_index() {
        let mut root = json!({"items": [1]});
        let segments = parse_segments("items[3]").unwrap();
        assert!(set_path(&mut root, &segments, json!(5)).is_err());
    }

    #[test]
    fn body_value_is_replaced_with_typed_value() {
        let mut req = request("/mail", json!({"parent_id": "{{parent_id}}"}));
        let target = "body.parent_id".parse().unwrap();
        req.apply(&target, &json!(42)).unwrap();
        assert_eq!(req.body, Some(json!({"parent_id": 42})));
    }

    #[test]
    fn embedded_marker_is_spliced() {
        let mut req = request(
            "/mail",
            json!({"payload": "{\"ref\": \"{{ref}}\", \"n\": 1}"}),
        );
        let target = "body.payload".parse().unwrap();
        req.apply(&target, &json!("abc")).unwrap();
        assert_eq!(
            req.body,
            Some(json!({"payload": "{\"ref\": \"abc\", \"n\": 1}"}))
        );
    }

    #[test]
    fn url_placeholder_is_replaced() {
        let mut req = request("/mail/{mail_id}/reply", json!({}));
        req.apply(&"url.mail_id".parse().unwrap(), &json!("m-1"))
            .unwrap();
        assert_eq!(req.url, "/mail/m-1/reply");

        let err = req
            .apply(&"url.other".parse().unwrap(), &json!("x"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTarget { .. }));
    }

    #[test]
    fn url_markers_are_not_placeholders() {
        let mut req = request("/x/{{id}}/{id}", json!({}));
        req.apply(&"url.id".parse().unwrap(), &json!("v")).unwrap();
        assert_eq!(req.url, "/x/{{id}}/v");

        let mut req = request("/x/{{id}}", json!({}));
        let err = req.apply(&"url.id".parse().unwrap(), &json!("v")).unwrap_err();
        assert!(matches!(err, Error::InvalidTarget { .. }));
        assert_eq!(req.url, "/x/{{id}}");
    }

    #[test]
    fn header_marker_is_spliced() {
        let mut req = request("/me", json!({}));
        req.headers
            .insert("Authorization".into(), "Bearer {{token}}".into());
        req.apply(&"headers.Authorization".parse().unwrap(), &json!("t0k"))
            .unwrap();
        assert_eq!(req.headers["Authorization"], "Bearer t0k");
    }

    #[test]
    fn cache_markers_are_not_splice_targets() {
        assert_eq!(splice_marker("id={{ cache.id }}", "x"), None);
        assert_eq!(
            splice_marker("{{ cache.id }}/{{id}}", "x"),
            Some("{{ cache.id }}/x".to_string())
        );
        assert_eq!(splice_marker("{{id}}", "x"), None);
    }

    #[test]
    fn expands_cache_references() {
        let mut req = request(
            "/mail/{{ cache.mail_id }}",
            json!({"ids": "{{cache.ids}}", "note": "for {{ cache.mail_id }}"}),
        );
        assert_eq!(req.cache_refs(), vec!["mail_id".to_string(), "ids".to_string()]);

        let lookup = HashMap::from([
            ("mail_id".to_string(), json!("m-7")),
            ("ids".to_string(), json!([1, 2])),
        ]);
        expand_cache_refs(&mut req, &lookup);
        assert_eq!(req.url, "/mail/m-7");
        assert_eq!(req.body, Some(json!({"ids": [1, 2], "note": "for m-7"})));
    }
}
