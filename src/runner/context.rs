use chrono::Utc;
use fake::faker::address::en::CityName;
use fake::faker::boolean::en::Boolean;
use fake::faker::internet::en::SafeEmail;
use fake::faker::name::en::{FirstName, LastName, Name};
use fake::faker::phone_number::en::PhoneNumber;
use fake::Fake;
use rand::Rng;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Run-scoped variable environment.
///
/// One mutable string-keyed map, created once per run and passed by
/// reference through every step and nested flow invocation: extraction
/// writes into it, interpolation reads from it. This is a deliberate
/// global scope shared across flow files (see DESIGN.md).
#[derive(Debug, Default)]
pub struct Environment {
    vars: HashMap<String, Value>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_strings(vars: HashMap<String, String>) -> Self {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    /// Resolve `expr`: a direct variable, or `var.dot.path` into a
    /// JSON-valued variable.
    fn lookup(&self, expr: &str) -> Option<Value> {
        if let Some(value) = self.vars.get(expr) {
            return Some(value.clone());
        }
        let (var, path) = expr.split_once('.')?;
        let root = self.vars.get(var)?;
        json_path(root, path).cloned()
    }

    /// Replace every `{{expr}}` occurrence. Mock generators produce a fresh
    /// value per call; unknown variables are left literally in place so
    /// unresolved placeholders stay visible in requests and logs.
    pub fn interpolate(&self, text: &str) -> String {
        placeholder_re()
            .replace_all(text, |caps: &regex::Captures| {
                let expr = caps[1].trim();
                if let Some(mock) = mock_value(expr) {
                    return mock;
                }
                match self.lookup(expr) {
                    Some(value) => value_to_string(&value),
                    None => caps[0].to_string(),
                }
            })
            .to_string()
    }

    /// Resolve a string that may be a placeholder to a JSON value.
    ///
    /// A string that is exactly one `{{expr}}` yields the underlying value
    /// itself, so an object-valued variable compares structurally instead
    /// of degrading to its stringified form.
    pub fn resolve_value(&self, text: &str) -> Value {
        if let Some(caps) = whole_placeholder_re().captures(text) {
            let expr = caps[1].trim();
            if let Some(mock) = mock_value(expr) {
                return Value::String(mock);
            }
            if let Some(value) = self.lookup(expr) {
                return value;
            }
        }
        Value::String(self.interpolate(text))
    }

    /// Apply interpolation recursively through strings, arrays and objects,
    /// leaving other value types untouched.
    pub fn deep_interpolate(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.resolve_value(s),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.deep_interpolate(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.deep_interpolate(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Walk each `name: "body.<dotPath>"` entry through the parsed response
    /// body and store defined values. Extracted values are visible to every
    /// subsequent step in the run, including nested flows.
    pub fn extract(&mut self, spec: &HashMap<String, String>, body: &Value) {
        for (name, path) in spec {
            let resolved = if path == "body" {
                Some(body)
            } else if let Some(rest) = path.strip_prefix("body.") {
                json_path(body, rest)
            } else {
                json_path(body, path)
            };
            if let Some(value) = resolved {
                if !value.is_null() {
                    self.vars.insert(name.clone(), value.clone());
                }
            }
        }
    }
}

fn placeholder_re() -> Regex {
    Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap()
}

fn whole_placeholder_re() -> Regex {
    Regex::new(r"^\{\{\s*([^{}]+?)\s*\}\}$").unwrap()
}

/// Walk a dot path through a JSON value. Numeric segments index arrays.
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Generate a value for a recognized mock expression. Generation is
/// stateless and random per call; values are never cached.
fn mock_value(expr: &str) -> Option<String> {
    let kind = match expr {
        "$uuid" => "uuid",
        "$randomInt" => "randomInt",
        "$timestamp" => "timestamp",
        _ => expr.strip_prefix("$mock.")?,
    };

    let value = match kind {
        "uuid" => Uuid::new_v4().to_string(),
        "randomInt" => rand::thread_rng().gen_range(0..10_000).to_string(),
        "timestamp" => Utc::now().timestamp_millis().to_string(),
        "email" => SafeEmail().fake::<String>(),
        "name" | "fullName" => Name().fake::<String>(),
        "firstName" => FirstName().fake::<String>(),
        "lastName" => LastName().fake::<String>(),
        "city" => CityName().fake::<String>(),
        "phone" => PhoneNumber().fake::<String>(),
        "date" => Utc::now().format("%Y-%m-%d").to_string(),
        "boolean" => Boolean(50).fake::<bool>().to_string(),
        "number" => rand::thread_rng().gen_range(0..=100).to_string(),
        _ => return None,
    };
    Some(value)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_variable_stays_literal() {
        let env = Environment::new();
        assert_eq!(env.interpolate("{{missing}}"), "{{missing}}");
        assert_eq!(env.interpolate("a {{missing}} b"), "a {{missing}} b");
    }

    #[test]
    fn test_variable_substitution() {
        let mut env = Environment::new();
        env.set("token", json!("abc123"));
        env.set("count", json!(7));
        assert_eq!(env.interpolate("Bearer {{token}}"), "Bearer abc123");
        assert_eq!(env.interpolate("n={{count}}"), "n=7");
    }

    #[test]
    fn test_dot_path_into_json_variable() {
        let mut env = Environment::new();
        env.set("user", json!({"id": 42, "tags": ["a", "b"]}));
        assert_eq!(env.interpolate("{{user.id}}"), "42");
        assert_eq!(env.interpolate("{{user.tags.1}}"), "b");
    }

    #[test]
    fn test_resolve_value_keeps_object_shape() {
        let mut env = Environment::new();
        env.set("user", json!({"id": 42}));
        assert_eq!(env.resolve_value("{{user}}"), json!({"id": 42}));
        // embedded placeholders still stringify
        assert_eq!(env.resolve_value("u={{user.id}}"), json!("u=42"));
        // unresolved whole placeholders stay literal
        assert_eq!(env.resolve_value("{{nope}}"), json!("{{nope}}"));
    }

    #[test]
    fn test_deep_interpolate() {
        let mut env = Environment::new();
        env.set("name", json!("flow"));
        let input = json!({
            "title": "{{name}}",
            "items": ["{{name}}", 1, true],
            "nested": {"keep": null}
        });
        let out = env.deep_interpolate(&input);
        assert_eq!(out["title"], json!("flow"));
        assert_eq!(out["items"], json!(["flow", 1, true]));
        assert_eq!(out["nested"]["keep"], json!(null));
    }

    #[test]
    fn test_mock_generators() {
        let env = Environment::new();
        let uuid = env.interpolate("{{$uuid}}");
        assert_eq!(uuid.len(), 36);
        assert_ne!(uuid, "{{$uuid}}");

        let n: i64 = env.interpolate("{{$randomInt}}").parse().unwrap();
        assert!((0..10_000).contains(&n));

        assert!(env.interpolate("{{$mock.email}}").contains('@'));
        assert!(env.interpolate("{{$timestamp}}").parse::<i64>().is_ok());
        // unknown mock kinds stay literal
        assert_eq!(env.interpolate("{{$mock.nope}}"), "{{$mock.nope}}");
    }

    #[test]
    fn test_extract_writes_and_propagates() {
        let mut env = Environment::new();
        let body = json!({"data": {"token": "t-1", "missing": null}});
        let spec = HashMap::from([
            ("token".to_string(), "body.data.token".to_string()),
            ("absent".to_string(), "body.data.nope".to_string()),
            ("nullish".to_string(), "body.data.missing".to_string()),
        ]);
        env.extract(&spec, &body);
        assert_eq!(env.interpolate("{{token}}"), "t-1");
        assert_eq!(env.interpolate("{{absent}}"), "{{absent}}");
        assert_eq!(env.interpolate("{{nullish}}"), "{{nullish}}");
    }
}
