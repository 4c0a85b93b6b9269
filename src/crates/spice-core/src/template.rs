//! Template resolver for subgraph input mapping
//!
//! Resolves `{{data.path.to.value}}` and `{{metadata.path.to.value}}`
//! expressions against a message. A mapping value that is exactly one
//! template keeps the resolved value's JSON type; a string with embedded
//! templates interpolates them as text. Literals pass through unchanged.
//! Missing paths resolve to a configurable sentinel (empty string by
//! default) and log at debug - they never fail the subgraph.

use crate::message::Message;
use serde_json::Value;

/// Resolver with a configurable sentinel for missing paths
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    missing: Value,
}

impl Default for TemplateResolver {
    fn default() -> Self {
        Self {
            missing: Value::String(String::new()),
        }
    }
}

impl TemplateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom sentinel for unresolvable paths
    pub fn with_missing_value(mut self, missing: Value) -> Self {
        self.missing = missing;
        self
    }

    /// Resolve a mapping value against a message
    pub fn resolve(&self, template: &Value, message: &Message) -> Value {
        match template {
            Value::String(s) => self.resolve_str(s, message),
            other => other.clone(),
        }
    }

    /// Resolve a string mapping value
    pub fn resolve_str(&self, template: &str, message: &Message) -> Value {
        let trimmed = template.trim();
        // A full-string template preserves the looked-up value's type.
        if trimmed.starts_with("{{")
            && trimmed.ends_with("}}")
            && trimmed.matches("{{").count() == 1
        {
            let expr = trimmed[2..trimmed.len() - 2].trim();
            return self.lookup(expr, message);
        }
        if !template.contains("{{") {
            return Value::String(template.to_string());
        }
        // Mixed string: interpolate each template as text.
        let mut out = String::new();
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let expr = after[..end].trim();
                    out.push_str(&value_as_text(&self.lookup(expr, message)));
                    rest = &after[end + 2..];
                }
                None => {
                    // Unterminated template; keep the remainder verbatim.
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        Value::String(out)
    }

    fn lookup(&self, expr: &str, message: &Message) -> Value {
        let (root, path) = match expr.split_once('.') {
            Some((root, path)) => (root, path),
            None => (expr, ""),
        };

        let start = match root {
            "data" => path
                .split('.')
                .next()
                .and_then(|head| message.data.get(head)),
            "metadata" => path
                .split('.')
                .next()
                .and_then(|head| message.metadata.get(head)),
            _ => None,
        };

        let resolved = start.and_then(|value| {
            path.split('.')
                .skip(1)
                .try_fold(value, |acc, segment| acc.get(segment))
        });

        match resolved {
            Some(value) if !path.is_empty() => value.clone(),
            _ => {
                tracing::debug!(expression = %expr, "template path unresolved, using sentinel");
                self.missing.clone()
            }
        }
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
