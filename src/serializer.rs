//! Request and response body encoding
//!
//! JSON goes through `serde_json` with insertion order preserved. Decoded
//! payloads are screened for prototype-poisoning shapes (`__proto__` keys,
//! `constructor.prototype` objects) since responses are often forwarded to
//! JavaScript consumers verbatim.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;

use crate::error::{Error, Result};

static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

const POISONED: &str = "Object contains forbidden prototype property";

/// Which prototype-poisoning checks are switched off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoisoningProtection {
    /// Both checks run
    #[default]
    Enabled,
    /// No check runs
    Disabled,
    /// `__proto__` keys are allowed
    Proto,
    /// `constructor.prototype` is allowed
    Constructor,
}

impl PoisoningProtection {
    fn checks_proto(self) -> bool {
        matches!(self, PoisoningProtection::Enabled | PoisoningProtection::Constructor)
    }

    fn checks_constructor(self) -> bool {
        matches!(self, PoisoningProtection::Enabled | PoisoningProtection::Proto)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Serializer {
    protection: PoisoningProtection,
}

impl Serializer {
    pub fn new(protection: PoisoningProtection) -> Self {
        Self { protection }
    }

    pub fn serialize<T: Serialize + Debug>(&self, value: &T) -> Result<String> {
        serde_json::to_string(value).map_err(|e| Error::Serialization {
            message: e.to_string(),
            data: format!("{:?}", value),
        })
    }

    pub fn deserialize(&self, json: &str) -> Result<Value> {
        let value: Value = serde_json::from_str(json).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            data: json.to_string(),
        })?;

        // Keys may be escaped in the raw text, so the parsed value is what gets screened
        let proto = self.protection.checks_proto();
        let constructor = self.protection.checks_constructor();
        if (proto || constructor) && is_poisoned(&value, proto, constructor) {
            return Err(Error::Deserialization {
                message: POISONED.to_string(),
                data: json.to_string(),
            });
        }

        Ok(value)
    }

    /// Screened decoding into a concrete type
    pub fn deserialize_as<T: DeserializeOwned>(&self, json: &str) -> Result<T> {
        let value = self.deserialize(json)?;
        serde_json::from_value(value).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            data: json.to_string(),
        })
    }

    /// Newline-delimited JSON for bulk bodies. Strings are taken as already
    /// encoded lines.
    pub fn ndserialize(&self, items: &[Value]) -> Result<String> {
        let mut out = String::new();
        for item in items {
            match item {
                Value::String(line) => out.push_str(line),
                other => out.push_str(&self.serialize(other)?),
            }
            out.push('\n');
        }
        Ok(out)
    }

    /// Querystring from an object. A string is returned unchanged, null
    /// fields are dropped and arrays are joined with commas.
    pub fn qserialize(&self, params: Option<&Value>) -> String {
        let map = match params {
            None | Some(Value::Null) => return String::new(),
            Some(Value::String(s)) => return s.clone(),
            Some(Value::Object(map)) => map,
            Some(_) => return String::new(),
        };

        let mut out = String::new();
        for (key, value) in map {
            let rendered = match value {
                Value::Null => continue,
                Value::Array(items) => items.iter().map(scalar_text).collect::<Vec<_>>().join(","),
                other => scalar_text(other),
            };
            if !out.is_empty() {
                out.push('&');
            }
            query_escape_into(key, &mut out);
            out.push('=');
            query_escape_into(&rendered, &mut out);
        }
        out
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => String::new(),
    }
}

fn is_poisoned(value: &Value, proto: bool, constructor: bool) -> bool {
    match value {
        Value::Object(map) => {
            if proto && map.contains_key("__proto__") {
                return true;
            }
            if constructor
                && map
                    .get("constructor")
                    .and_then(Value::as_object)
                    .is_some_and(|c| c.contains_key("prototype"))
            {
                return true;
            }
            map.values().any(|v| is_poisoned(v, proto, constructor))
        }
        Value::Array(items) => items.iter().any(|v| is_poisoned(v, proto, constructor)),
        _ => false,
    }
}

/// Querystring escaping: everything but `A-Z a-z 0-9 - _ . ! ~ * ' ( )` is encoded
fn query_escape_into(s: &str, out: &mut String) {
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => out.push(byte as char),
            _ => {
                out.push('%');
                out.push(HEX_UPPER[(byte >> 4) as usize] as char);
                out.push(HEX_UPPER[(byte & 0xf) as usize] as char);
            }
        }
    }
}
