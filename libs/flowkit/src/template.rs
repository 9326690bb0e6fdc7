//! `{{ fieldPath }}` templating over payload maps.
//!
//! Paths are dotted lookups into the context; a missing path renders as an
//! empty string.

use std::sync::OnceLock;

use crate::contracts::JsonMap;

fn placeholder_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").unwrap())
}

/// Dotted-path lookup into a context map.
pub fn lookup<'a>(ctx: &'a JsonMap, path: &str) -> Option<&'a serde_json::Value> {
    let mut parts = path.split('.');
    let mut current = ctx.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn scalar_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Render a template string against the context.
pub fn render(template: &str, ctx: &JsonMap) -> String {
    placeholder_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            lookup(ctx, &caps[1]).map(scalar_to_string).unwrap_or_default()
        })
        .into_owned()
}

/// Render every string scalar in a JSON tree against the context.
///
/// A string that is exactly one placeholder is replaced by the looked-up
/// value itself, preserving its type; mixed strings render as text.
pub fn render_value(value: &serde_json::Value, ctx: &JsonMap) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) => {
            if let Some(caps) = placeholder_pattern().captures(s) {
                if caps.get(0).map(|m| m.as_str()) == Some(s.as_str()) {
                    return lookup(ctx, &caps[1]).cloned().unwrap_or(Value::String(String::new()));
                }
            }
            Value::String(render(s, ctx))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> JsonMap {
        serde_json::from_value(serde_json::json!({
            "order": { "id": "o-42", "total": 12.5 },
            "customer": "ada"
        }))
        .unwrap()
    }

    #[test]
    fn renders_dotted_paths() {
        let out = render("order {{ order.id }} for {{customer}}", &ctx());
        assert_eq!(out, "order o-42 for ada");
    }

    #[test]
    fn missing_path_renders_empty() {
        assert_eq!(render("[{{ nope.deep }}]", &ctx()), "[]");
    }

    #[test]
    fn non_string_scalars_render_as_json() {
        assert_eq!(render("total={{order.total}}", &ctx()), "total=12.5");
    }

    #[test]
    fn sole_placeholder_preserves_type() {
        let v = render_value(&serde_json::json!("{{ order.total }}"), &ctx());
        assert_eq!(v, serde_json::json!(12.5));

        let v = render_value(&serde_json::json!("total: {{ order.total }}"), &ctx());
        assert_eq!(v, serde_json::json!("total: 12.5"));
    }

    #[test]
    fn renders_nested_structures() {
        let v = render_value(
            &serde_json::json!({"id": "{{order.id}}", "tags": ["{{customer}}"]}),
            &ctx(),
        );
        assert_eq!(v, serde_json::json!({"id": "o-42", "tags": ["ada"]}));
    }
}
