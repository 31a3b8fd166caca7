//! Placeholder substitution for message templates.
//!
//! Templates carry `{{identifier}}` tokens. A token resolves against the
//! top-level data object first, then falls through to a nested `formData`
//! object. Missing values render as the empty string and arrays render as a
//! comma-joined list, so a half-filled contact row degrades gracefully
//! instead of failing the send.
//!
//! Compilation is a single left-to-right pass: every occurrence of a token is
//! replaced, resolution does not depend on position, and values are never
//! re-scanned for tokens, which makes `compile(compile(t, d), d)` equal to
//! `compile(t, d)` for token-free data.

use serde_json::Value;

/// Render a template against a data object.
pub fn compile(template: &str, data: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let token = after[..end].trim();
                out.push_str(&resolve(token, data));
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated token: copy the remainder through verbatim.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Resolve a token: top-level value first, then the `formData` fallback.
fn resolve(token: &str, data: &Value) -> String {
    let value = data
        .get(token)
        .filter(|v| !v.is_null())
        .or_else(|| data.get("formData").and_then(|form| form.get(token)));
    match value {
        Some(v) => render(v),
        None => String::new(),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .map(render)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(_) => value.to_string(),
    }
}
