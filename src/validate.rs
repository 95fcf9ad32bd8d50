//! Declarative required-field checks, evaluated in declared order before any
//! upstream is contacted.

use serde_json::Value;

use crate::error::GatewayError;

/// How a required field is judged present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Not absent, `null`, `false`, `0` or a blank string.
    Truthy,
    /// Truthy, and when it is an array it must not be empty.
    NonEmptyList,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub field: &'static str,
    /// Accepted alternative names, checked when `field` is absent.
    pub aliases: &'static [&'static str],
    pub message: &'static str,
    pub presence: Presence,
}

impl FieldRule {
    pub const fn truthy(field: &'static str, message: &'static str) -> Self {
        Self {
            field,
            aliases: &[],
            message,
            presence: Presence::Truthy,
        }
    }

    pub const fn list(field: &'static str, message: &'static str) -> Self {
        Self {
            field,
            aliases: &[],
            message,
            presence: Presence::NonEmptyList,
        }
    }

    pub const fn or_alias(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    /// The value this rule reads from `body`, following aliases.
    pub fn lookup<'a>(&self, body: &'a Value) -> Option<&'a Value> {
        std::iter::once(self.field)
            .chain(self.aliases.iter().copied())
            .find_map(|name| body.get(name).filter(|v| !v.is_null()))
    }

    fn is_satisfied(&self, body: &Value) -> bool {
        let Some(value) = self.lookup(body) else {
            return false;
        };
        match (self.presence, value) {
            (Presence::NonEmptyList, Value::Array(items)) => !items.is_empty(),
            (_, value) => is_truthy(value),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Check `rules` against `body` in order and fail on the first missing field.
pub fn check(body: &Value, rules: &[FieldRule]) -> Result<(), GatewayError> {
    match rules.iter().find(|rule| !rule.is_satisfied(body)) {
        Some(rule) => {
            tracing::debug!(field = rule.field, "required field missing");
            Err(GatewayError::validation(rule.message))
        }
        None => Ok(()),
    }
}
