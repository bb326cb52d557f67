//! Pure-substitution template resolution over step params: `{{ input.x }}`
//! and `{{ steps.<id>.<field> }}` dot-paths resolved against a fixed
//! context; unresolved variables are left as-is; dot paths that traverse
//! a non-dict (or miss) return `None` and leave the placeholder untouched
//! rather than erroring the step.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([a-zA-Z0-9_.]+)\s*\}\}").unwrap());

/// Resolves every `{{ dot.path }}` placeholder found anywhere inside
/// `value` (recursively, through objects and arrays) against `context`.
/// A string that is *exactly* one placeholder and resolves to a non-string
/// JSON value is replaced by that value directly (preserving type); a
/// placeholder embedded in a larger string is stringified in place.
pub fn resolve(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => resolve_string(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, context)).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, context));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn resolve_string(s: &str, context: &Value) -> Value {
    if let Some(caps) = PLACEHOLDER.captures(s) {
        if caps.get(0).map(|m| m.as_str()) == Some(s.trim()) && s.trim() == s {
            let path = &caps[1];
            return lookup(context, path).unwrap_or_else(|| Value::String(s.to_string()));
        }
    }

    let replaced = PLACEHOLDER.replace_all(s, |caps: &regex::Captures| {
        let path = &caps[1];
        match lookup(context, path) {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

/// Walks a dot path (`input.x`, `steps.step1.output.field`) against a JSON
/// object context. Traversing through a non-object, or a missing key,
/// yields `None`.
pub(crate) fn lookup(context: &Value, path: &str) -> Option<Value> {
    let mut current = context;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_whole_value_placeholder_preserving_type() {
        let ctx = json!({"input": {"count": 5}});
        let resolved = resolve(&json!("{{ input.count }}"), &ctx);
        assert_eq!(resolved, json!(5));
    }

    #[test]
    fn resolves_embedded_placeholder_as_string() {
        let ctx = json!({"input": {"host": "db01"}});
        let resolved = resolve(&json!("host=/{{input.host}}/"), &ctx);
        assert_eq!(resolved, json!("host=/db01/"));
    }

    #[test]
    fn unresolved_variable_left_as_is() {
        let ctx = json!({"input": {}});
        let resolved = resolve(&json!("{{ input.missing }}"), &ctx);
        assert_eq!(resolved, json!("{{ input.missing }}"));
    }

    #[test]
    fn traversal_through_non_dict_returns_none_and_leaves_placeholder() {
        let ctx = json!({"input": "not-an-object"});
        let resolved = resolve(&json!("{{ input.x }}"), &ctx);
        assert_eq!(resolved, json!("{{ input.x }}"));
    }

    #[test]
    fn resolves_nested_object_and_array_params() {
        let ctx = json!({"steps": {"s1": {"output": {"ip": "1.2.3.4"}}}});
        let params = json!({"targets": ["{{ steps.s1.output.ip }}"], "nested": {"addr": "{{steps.s1.output.ip}}"}});
        let resolved = resolve(&params, &ctx);
        assert_eq!(resolved, json!({"targets": ["1.2.3.4"], "nested": {"addr": "1.2.3.4"}}));
    }
}
