//! Tolerant JSON decoding for LLM-produced fields.
//!
//! Agents routinely emit a scalar where the schema says array (and vice
//! versa). These wrappers accept every shape the models actually produce so
//! that a single deviation does not fail the whole artifact and stall the
//! workflow.

use std::fmt;
use std::ops::Deref;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Well-known object keys probed, in order, when an array element is an
/// object instead of a string.
const TEXT_KEYS: [&str; 6] = ["description", "text", "change", "message", "content", "value"];

// ---------------------------------------------------------------------------
// FlexibleString
// ---------------------------------------------------------------------------

/// A string field that also accepts a JSON array of strings, joined with a
/// single newline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlexibleString(pub String);

impl FlexibleString {
    /// Borrow the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the wrapper and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Deref for FlexibleString {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlexibleString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for FlexibleString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for FlexibleString {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<Vec<String>> for FlexibleString {
    fn from(lines: Vec<String>) -> Self {
        Self(lines.join("\n"))
    }
}

impl Serialize for FlexibleString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for FlexibleString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            One(String),
            Many(Vec<String>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::One(s) => Ok(Self(s)),
            Repr::Many(lines) => Ok(Self(lines.join("\n"))),
        }
    }
}

// ---------------------------------------------------------------------------
// FlexibleStringSlice
// ---------------------------------------------------------------------------

/// A list-of-strings field that also accepts a lone string (one-element
/// list) or an array of objects.
///
/// Object elements are reduced to the first non-empty value under the keys
/// in [`TEXT_KEYS`]; an object matching none of them is re-encoded as JSON
/// and used verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlexibleStringSlice(pub Vec<String>);

impl FlexibleStringSlice {
    /// Borrow the inner list.
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Consume the wrapper and return the inner list.
    pub fn into_inner(self) -> Vec<String> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl Deref for FlexibleStringSlice {
    type Target = [String];

    fn deref(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for FlexibleStringSlice {
    fn from(items: Vec<String>) -> Self {
        Self(items)
    }
}

impl From<String> for FlexibleStringSlice {
    fn from(s: String) -> Self {
        Self(vec![s])
    }
}

impl<'a> IntoIterator for &'a FlexibleStringSlice {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Serialize for FlexibleStringSlice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FlexibleStringSlice {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) => Ok(Self(vec![s])),
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(element_text(item).map_err(D::Error::custom)?);
                }
                Ok(Self(out))
            }
            other => Err(D::Error::custom(format!(
                "expected string or array, got {other}"
            ))),
        }
    }
}

/// Reduce one array element to its textual value.
fn element_text(item: serde_json::Value) -> Result<String, String> {
    match item {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Object(ref map) => {
            for key in TEXT_KEYS {
                if let Some(serde_json::Value::String(s)) = map.get(key) {
                    if !s.is_empty() {
                        return Ok(s.clone());
                    }
                }
            }
            // No well-known key: keep the whole object as its JSON text.
            serde_json::to_string(&item).map_err(|e| e.to_string())
        }
        other => Err(format!("expected string or object element, got {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flexible_string_accepts_plain_string() {
        let s: FlexibleString = serde_json::from_str(r#""hello""#).unwrap();
        assert_eq!(s.as_str(), "hello");
    }

    #[test]
    fn flexible_string_joins_array_with_newlines() {
        let s: FlexibleString = serde_json::from_str(r#"["a","b","c"]"#).unwrap();
        assert_eq!(s.as_str(), "a\nb\nc");
    }

    #[test]
    fn flexible_string_round_trips_plain_string() {
        let original = FlexibleString::from("some reasoning");
        let json = serde_json::to_string(&original).unwrap();
        let decoded: FlexibleString = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn flexible_string_from_list_encodes_joined() {
        let original = FlexibleString::from(vec!["a".to_string(), "b".to_string()]);
        let json = serde_json::to_string(&original).unwrap();
        let decoded: FlexibleString = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.as_str(), "a\nb");
    }

    #[test]
    fn slice_accepts_lone_string() {
        let s: FlexibleStringSlice = serde_json::from_str(r#""just one""#).unwrap();
        assert_eq!(s.as_slice(), ["just one"]);
    }

    #[test]
    fn slice_accepts_string_array() {
        let s: FlexibleStringSlice = serde_json::from_str(r#"["x","y"]"#).unwrap();
        assert_eq!(s.as_slice(), ["x", "y"]);
    }

    #[test]
    fn slice_accepts_objects_with_description_key() {
        let s: FlexibleStringSlice =
            serde_json::from_str(r#"[{"description":"first"},{"description":"second"}]"#).unwrap();
        assert_eq!(s.as_slice(), ["first", "second"]);
    }

    #[test]
    fn slice_accepts_objects_with_only_text_key() {
        let s: FlexibleStringSlice = serde_json::from_str(r#"[{"text":"the text"}]"#).unwrap();
        assert_eq!(s.as_slice(), ["the text"]);
    }

    #[test]
    fn slice_key_probe_order_prefers_description() {
        let s: FlexibleStringSlice =
            serde_json::from_str(r#"[{"text":"lower","description":"winner"}]"#).unwrap();
        assert_eq!(s.as_slice(), ["winner"]);
    }

    #[test]
    fn slice_skips_empty_values_for_later_keys() {
        let s: FlexibleStringSlice =
            serde_json::from_str(r#"[{"description":"","text":"fallback"}]"#).unwrap();
        assert_eq!(s.as_slice(), ["fallback"]);
    }

    #[test]
    fn slice_reencodes_unknown_objects() {
        let s: FlexibleStringSlice = serde_json::from_str(r#"[{"severity":"high"}]"#).unwrap();
        assert_eq!(s.as_slice(), [r#"{"severity":"high"}"#]);
    }

    #[test]
    fn slice_rejects_numbers() {
        let result: Result<FlexibleStringSlice, _> = serde_json::from_str("42");
        assert!(result.is_err());
    }

    #[test]
    fn slice_serializes_as_array() {
        let s = FlexibleStringSlice::from(vec!["a".to_string()]);
        assert_eq!(serde_json::to_string(&s).unwrap(), r#"["a"]"#);
    }
}
