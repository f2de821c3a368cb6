//! Variable substitution for node configurations.
//!
//! Placeholders look like `{{.path}}`, where `path` is a dotted path into
//! the scope (`{{.user_id}}`, `{{.fetch_user.body.email}}`, `{{.items.0}}`).
//! Whitespace inside the braces is ignored. There is no expression language:
//! a placeholder is a lookup and nothing else. Any other `{{` text, such as
//! a Mustache body meant for a downstream service, is passed through as is.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*\.([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
        .expect("placeholder pattern is a valid regex")
});

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown variable '{0}'")]
    UnknownPath(String),
}

/// Resolve every placeholder in `template` against `scope`.
///
/// A template that consists of exactly one placeholder resolves to the
/// referenced value itself, so objects and numbers keep their JSON type.
/// Otherwise each placeholder is replaced by its value: strings verbatim,
/// anything else as compact JSON.
pub fn resolve(template: &str, scope: &Value) -> Result<Value, TemplateError> {
    if !template.contains("{{") {
        return Ok(Value::String(template.to_owned()));
    }

    if let Some(caps) = PLACEHOLDER.captures(template) {
        if caps[0].len() == template.len() {
            let path = &caps[1];
            return lookup(scope, path)
                .cloned()
                .ok_or_else(|| TemplateError::UnknownPath(path.to_owned()));
        }
    }

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);

        let path = &caps[1];
        match lookup(scope, path) {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => return Err(TemplateError::UnknownPath(path.to_owned())),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);

    Ok(Value::String(out))
}

/// Recursively resolve every string inside `value`. Object keys are left
/// untouched.
pub fn resolve_value(value: &Value, scope: &Value) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => resolve(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve_value(v, scope).map(|v| (k.clone(), v)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Follow a dotted path through objects (by key) and arrays (by index).
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(scope, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
