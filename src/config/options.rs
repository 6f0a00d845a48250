//! Loosely-typed backend option bags
//!
//! Backend options arrive as free-form TOML tables where numbers may be
//! written as strings and booleans as `"yes"`/`1`. [`OptionBag`] normalizes
//! those once, substituting the documented default (with a warning) for any
//! value that cannot be interpreted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key fragments that mark an option as secret when printing config
const SECRET_MARKERS: &[&str] = &["key", "token", "secret", "password"];

/// Free-form key/value options for one backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionBag(Map<String, Value>);

impl OptionBag {
    /// Create an empty bag
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an option, replacing any previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style [`insert`](Self::insert)
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Whether the key is present with a non-null value
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.get(key).is_some_and(|v| !v.is_null())
    }

    /// Raw value for a key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Number of options
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the bag is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// String value; numbers and booleans are rendered, blanks are absent
    #[must_use]
    pub fn string(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null => None,
            other => {
                tracing::warn!(key, value = %other, "option is not a string, ignoring");
                None
            }
        }
    }

    /// First present string among several alias keys
    #[must_use]
    pub fn string_any(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| self.string(k))
    }

    /// String value or a default
    #[must_use]
    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    /// Unsigned integer value or a default
    #[must_use]
    pub fn u64_or(&self, key: &str, default: u64) -> u64 {
        let Some(value) = self.present(key) else {
            return default;
        };

        let parsed = match value {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().and_then(whole_u64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<u64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(whole_u64))
            }
            _ => None,
        };

        parsed.unwrap_or_else(|| mistyped(key, value, default))
    }

    /// Float value or a default
    #[must_use]
    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        match self.present(key) {
            None => default,
            Some(value) => parse_f64(value).unwrap_or_else(|| mistyped(key, value, default)),
        }
    }

    /// Optional float value; mistyped values are treated as absent
    #[must_use]
    pub fn f64_opt(&self, key: &str) -> Option<f64> {
        let value = self.present(key)?;
        let parsed = parse_f64(value);
        if parsed.is_none() {
            tracing::warn!(key, value = %value, "option is not a number, ignoring");
        }
        parsed
    }

    /// Boolean value or a default
    ///
    /// Accepts `true`/`false`, `yes`/`no`, `on`/`off`, `1`/`0` and numbers.
    #[must_use]
    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        let Some(value) = self.present(key) else {
            return default;
        };

        let parsed = match value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|f| f != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        };

        parsed.unwrap_or_else(|| mistyped(key, value, default))
    }

    /// Copy with secret-looking values masked, for display
    #[must_use]
    pub fn redacted(&self) -> Self {
        let map = self
            .0
            .iter()
            .map(|(k, v)| {
                let lower = k.to_ascii_lowercase();
                if SECRET_MARKERS.iter().any(|m| lower.contains(m)) && !v.is_null() {
                    (k.clone(), Value::String("***".to_string()))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect();
        Self(map)
    }

    fn present(&self, key: &str) -> Option<&Value> {
        match self.0.get(key)? {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            v => Some(v),
        }
    }
}

impl From<Map<String, Value>> for OptionBag {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn parse_f64(value: &Value) -> Option<f64> {
    let f = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    f.is_finite().then_some(f)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_u64(f: f64) -> Option<u64> {
    (f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64).then_some(f as u64)
}

fn mistyped<T: std::fmt::Debug>(key: &str, value: &Value, default: T) -> T {
    tracing::warn!(key, value = %value, default = ?default, "invalid option, using default");
    default
}
