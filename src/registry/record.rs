//! Server records.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::Platform;

/// Hidden field holding the QR session id.
pub const SESSION_FIELD: &str = "__session__";

/// Hidden field holding the platform tag.
pub const CONSOLE_FIELD: &str = "__console__";

/// A field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Integer.
    Int(i64),
    /// Text as reported by the client.
    Text(String),
}

impl FieldValue {
    /// Textual form.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            FieldValue::Int(v) => Cow::Owned(v.to_string()),
            FieldValue::Text(s) => Cow::Borrowed(s),
        }
    }

    /// Integer form, parsing decimal text.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Text(s) => numeric_text(s),
        }
    }

    /// JSON form used by stats output.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Int(v) => serde_json::Value::from(*v),
            FieldValue::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

/// Parse text that is written as a plain decimal integer.
///
/// Leading `+`, whitespace and other decorations are rejected.
pub fn numeric_text(s: &str) -> Option<i64> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// An ordered field map describing one hosted game session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    fields: Vec<(String, FieldValue)>,
}

impl ServerRecord {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from pairs, keeping their order.
    ///
    /// A repeated name keeps its first position and its last value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FieldValue>,
    {
        let mut record = Self::new();
        for (k, v) in pairs {
            record.set(k, v);
        }
        record
    }

    /// Field value by name.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Textual field value.
    pub fn text(&self, name: &str) -> Option<Cow<'_, str>> {
        self.get(name).map(FieldValue::as_text)
    }

    /// Integer field value (decimal text included).
    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(FieldValue::as_int)
    }

    /// True when the field exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set a field, replacing in place or appending.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Remove a field.
    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        let idx = self.fields.iter().position(|(k, _)| k == name)?;
        Some(self.fields.remove(idx).1)
    }

    /// Fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Session id stamped by the registry.
    pub fn session_id(&self) -> Option<u32> {
        self.int(SESSION_FIELD).and_then(|v| u32::try_from(v).ok())
    }

    /// Platform stamped by the registry.
    pub fn platform(&self) -> Platform {
        Platform::from_tag(self.int(CONSOLE_FIELD).unwrap_or(0))
    }

    /// `localip0`, `localip1`, ... while they are contiguous.
    pub fn local_ips(&self) -> impl Iterator<Item = (String, &FieldValue)> {
        (0..)
            .map(|i| format!("localip{}", i))
            .map_while(move |name| self.get(&name).map(|v| (name, v)))
    }

    /// JSON object form used by stats output.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

/// One search hit: the addressing fields plus the requested ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Addressing projection of the record.
    pub record: ServerRecord,
    /// Exactly the requested fields, in request order.
    pub requested: ServerRecord,
}
