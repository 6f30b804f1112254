//! `{{path}}` substitution.
//!
//! Resolution is fail-open: a path that does not resolve renders as an empty
//! string and never raises.

use serde_json::Value;

use crate::variables::Lookup;

/// Replace every `{{expr}}` in `template` with the stringified value.
pub fn resolve(template: &str, vars: &dyn Lookup) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let expr = &rest[start + 2..start + 2 + len];
        out.push_str(&stringify(vars.lookup(expr.trim())));
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    out
}

/// Resolve every string inside a JSON literal.
///
/// A string that is exactly one placeholder is replaced by the referenced
/// value itself, keeping its type.
pub fn resolve_value(value: &Value, vars: &dyn Lookup) -> Value {
    match value {
        Value::String(s) => match single_placeholder(s) {
            Some(path) => vars
                .lookup(path)
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| Value::String(String::new())),
            None => Value::String(resolve(s, vars)),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render a variable as text.
pub fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

/// The path of a string that is nothing but one `{{path}}`.
pub fn single_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn vars(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_resolve_basic() {
        let v = vars(json!({"nombre": "Ana"}));
        assert_eq!(resolve("Hola {{nombre}}", &v), "Hola Ana");
        assert_eq!(resolve("{{missing}}", &Map::new()), "");
        assert_eq!(resolve("Hola {{ nombre }}!", &v), "Hola Ana!");
    }

    #[test]
    fn test_resolve_stringification() {
        let v = vars(json!({
            "n": 3, "f": 2.5, "b": true, "z": null,
            "arr": [1, 2], "obj": {"a": 1}
        }));
        assert_eq!(resolve("{{n}}|{{f}}|{{b}}|{{z}}", &v), "3|2.5|true|");
        assert_eq!(resolve("{{arr}} {{obj}}", &v), r#"[1,2] {"a":1}"#);
    }

    #[test]
    fn test_unterminated_placeholder_is_literal() {
        let v = vars(json!({"a": "x"}));
        assert_eq!(resolve("{{a}} and {{b", &v), "x and {{b");
        assert_eq!(resolve("no braces", &v), "no braces");
    }

    #[test]
    fn test_resolve_value_keeps_types() {
        let v = vars(json!({"qty": 2, "titulo": "harry potter", "tags": ["a"]}));
        let body = json!({
            "quantity": "{{qty}}",
            "search": "{{titulo}}",
            "note": "buy {{qty}}",
            "tags": "{{tags}}",
            "nested": [{"q": "{{missing}}"}],
            "flag": false
        });
        assert_eq!(
            resolve_value(&body, &v),
            json!({
                "quantity": 2,
                "search": "harry potter",
                "note": "buy 2",
                "tags": ["a"],
                "nested": [{"q": ""}],
                "flag": false
            })
        );
    }

    #[test]
    fn test_single_placeholder() {
        assert_eq!(single_placeholder("{{a.b}}"), Some("a.b"));
        assert_eq!(single_placeholder(" {{ a }} "), Some("a"));
        assert_eq!(single_placeholder("x {{a}}"), None);
        assert_eq!(single_placeholder("{{a}}{{b}}"), None);
    }
}
