//! Typed access over the parsed field tree
//!
//! Netlist text is deserialized into a `serde_json::Value` by
//! [`parse_source`]; this module is the only place that inspects it. Every
//! accessor reports failures as parse errors carrying the dotted path of the
//! offending field.

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{CompileError, CompileResult};

/// A value in the field tree together with its path from the root
#[derive(Debug, Clone)]
pub struct Node<'a> {
    value: &'a Value,
    path: String,
}

impl<'a> Node<'a> {
    pub fn root(value: &'a Value) -> Self {
        Self {
            value,
            path: String::new(),
        }
    }

    pub fn path(&self) -> &str {
        if self.path.is_empty() {
            "<root>"
        } else {
            &self.path
        }
    }

    pub fn value(&self) -> &'a Value {
        self.value
    }

    fn child(&self, key: &str, value: &'a Value) -> Node<'a> {
        let path = if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.path, key)
        };
        Node { value, path }
    }

    fn error(&self, expected: &str) -> CompileError {
        CompileError::parse_error(format!(
            "{}: expected {}, found {}",
            self.path(),
            expected,
            self.value
        ))
    }

    pub fn is_map(&self) -> bool {
        self.value.is_object()
    }

    pub fn is_seq(&self) -> bool {
        self.value.is_array()
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    fn map(&self) -> CompileResult<&'a Map<String, Value>> {
        self.value.as_object().ok_or_else(|| self.error("a map"))
    }

    /// Map entries in source order
    pub fn entries(&self) -> CompileResult<Vec<(&'a str, Node<'a>)>> {
        Ok(self
            .map()?
            .iter()
            .map(|(key, value)| (key.as_str(), self.child(key, value)))
            .collect())
    }

    /// The single entry of a one-key map, e.g. `{ execute: {...} }`
    pub fn single_entry(&self) -> CompileResult<(&'a str, Node<'a>)> {
        let map = self.map()?;
        let mut iter = map.iter();
        match (iter.next(), iter.next()) {
            (Some((key, value)), None) => Ok((key.as_str(), self.child(key, value))),
            _ => Err(self.error("a map with exactly one entry")),
        }
    }

    pub fn get(&self, key: &str) -> Option<Node<'a>> {
        self.value
            .as_object()
            .and_then(|map| map.get(key))
            .map(|value| self.child(key, value))
    }

    pub fn items(&self) -> CompileResult<Vec<Node<'a>>> {
        let seq = self.value.as_array().ok_or_else(|| self.error("a list"))?;
        Ok(seq
            .iter()
            .enumerate()
            .map(|(index, value)| self.child(&index.to_string(), value))
            .collect())
    }

    pub fn len(&self) -> usize {
        match self.value {
            Value::Array(seq) => seq.len(),
            Value::Object(map) => map.len(),
            Value::Null => 0,
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_str(&self) -> CompileResult<&'a str> {
        self.value.as_str().ok_or_else(|| self.error("a string"))
    }

    pub fn as_string(&self) -> CompileResult<String> {
        self.as_str().map(str::to_string)
    }

    /// A scalar rendered as text: strings verbatim, numbers and booleans
    /// formatted. Program fields keep `$var`, immediates and flags as text.
    pub fn as_scalar_text(&self) -> CompileResult<String> {
        match self.value {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(self.error("a scalar")),
        }
    }

    pub fn as_i64(&self) -> CompileResult<i64> {
        self.value.as_i64().ok_or_else(|| self.error("an integer"))
    }

    pub fn as_i32(&self) -> CompileResult<i32> {
        i32::try_from(self.as_i64()?).map_err(|_| self.error("a 32-bit integer"))
    }

    pub fn as_u32(&self) -> CompileResult<u32> {
        self.value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| self.error("a non-negative integer"))
    }

    pub fn as_u64(&self) -> CompileResult<u64> {
        self.value
            .as_u64()
            .ok_or_else(|| self.error("a non-negative integer"))
    }

    pub fn as_usize(&self) -> CompileResult<usize> {
        Ok(self.as_u32()? as usize)
    }

    pub fn as_f32(&self) -> CompileResult<f32> {
        self.value
            .as_f64()
            .map(|n| n as f32)
            .ok_or_else(|| self.error("a number"))
    }

    /// Booleans, also accepting the strings `true`/`false` in any case
    pub fn as_bool(&self) -> CompileResult<bool> {
        match self.value {
            Value::Bool(b) => Ok(*b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
            _ => Err(self.error("a boolean")),
        }
    }

    /// A two element list such as `grid_size: [r, c]`
    pub fn as_pair(&self) -> CompileResult<(u32, u32)> {
        let items = self.items()?;
        if items.len() != 2 {
            return Err(self.error("a list of 2 values"));
        }
        Ok((items[0].as_u32()?, items[1].as_u32()?))
    }

    pub fn as_u32_list(&self) -> CompileResult<Vec<u32>> {
        self.items()?.iter().map(Node::as_u32).collect()
    }

    pub fn as_string_list(&self) -> CompileResult<Vec<String>> {
        self.items()?.iter().map(Node::as_string).collect()
    }

    /// Parse a string field through `FromStr`
    pub fn parse<T>(&self) -> CompileResult<T>
    where
        T: FromStr<Err = CompileError>,
    {
        let text = self.as_str()?;
        text.parse().map_err(|err: CompileError| {
            CompileError::parse_error(format!("{}: {}", self.path(), err.message()))
        })
    }

    /// A value that is either one integer or a list of them
    pub fn as_u32_or_list(&self) -> CompileResult<Vec<u32>> {
        if self.is_seq() {
            self.as_u32_list()
        } else {
            Ok(vec![self.as_u32()?])
        }
    }
}

/// Read netlist text into a field tree. A key repeated within one map is a
/// parse error.
pub fn parse_source(text: &str) -> CompileResult<Value> {
    match serde_json::from_str::<UniqueKeys>(text) {
        Ok(UniqueKeys(value)) => Ok(value),
        // Data errors only come from the duplicate-key check below
        Err(e) if e.is_data() => Err(CompileError::parse_error(e.to_string())),
        Err(e) => Err(e.into()),
    }
}

struct UniqueKeys(Value);

impl<'de> Deserialize<'de> for UniqueKeys {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(UniqueKeysVisitor)
    }
}

struct UniqueKeysVisitor;

impl<'de> Visitor<'de> for UniqueKeysVisitor {
    type Value = UniqueKeys;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<UniqueKeys, E> {
        Ok(UniqueKeys(Value::Bool(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<UniqueKeys, E> {
        Ok(UniqueKeys(Value::from(v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<UniqueKeys, E> {
        Ok(UniqueKeys(Value::from(v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<UniqueKeys, E> {
        Ok(UniqueKeys(Value::from(v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<UniqueKeys, E> {
        Ok(UniqueKeys(Value::String(v.to_string())))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<UniqueKeys, E> {
        Ok(UniqueKeys(Value::String(v)))
    }

    fn visit_unit<E: de::Error>(self) -> Result<UniqueKeys, E> {
        Ok(UniqueKeys(Value::Null))
    }

    fn visit_none<E: de::Error>(self) -> Result<UniqueKeys, E> {
        Ok(UniqueKeys(Value::Null))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<UniqueKeys, A::Error> {
        let mut items = Vec::new();
        while let Some(UniqueKeys(item)) = seq.next_element()? {
            items.push(item);
        }
        Ok(UniqueKeys(Value::Array(items)))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<UniqueKeys, A::Error> {
        let mut map = Map::new();
        while let Some(key) = access.next_key::<String>()? {
            if map.contains_key(&key) {
                return Err(de::Error::custom(format!(
                    "Name {} is declared more than once in the same map",
                    key
                )));
            }
            let UniqueKeys(value) = access.next_value()?;
            map.insert(key, value);
        }
        Ok(UniqueKeys(Value::Object(map)))
    }
}

/// Error for a key the enclosing entity does not understand
pub fn unsupported_field(key: &str, entity: &str) -> CompileError {
    CompileError::parse_error(format!("Field {} is not supported for {}", key, entity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DataFormat;
    use serde_json::json;

    #[test]
    fn test_paths_in_errors() {
        let value = json!({ "queues": { "q0": { "entries": "many" } } });
        let root = Node::root(&value);
        let entries = root.get("queues").unwrap().get("q0").unwrap().get("entries").unwrap();
        let err = entries.as_u32().unwrap_err();
        assert!(err.message().starts_with("queues.q0.entries: expected a non-negative integer"));
    }

    #[test]
    fn test_entries_keep_source_order() {
        let value = json!({ "z": 1, "a": 2, "m": 3 });
        let keys: Vec<_> = Node::root(&value)
            .entries()
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_scalars() {
        let value = json!({ "flag": "True", "pair": [2, 3], "df": "Bfp8_b", "ptr": 4 });
        let root = Node::root(&value);
        assert!(root.get("flag").unwrap().as_bool().unwrap());
        assert_eq!(root.get("pair").unwrap().as_pair().unwrap(), (2, 3));
        assert_eq!(root.get("df").unwrap().parse::<DataFormat>().unwrap(), DataFormat::Bfp8_b);
        assert_eq!(root.get("ptr").unwrap().as_scalar_text().unwrap(), "4");
    }

    #[test]
    fn test_single_entry() {
        let value = json!([{ "execute": {} }, { "a": 1, "b": 2 }]);
        let items = Node::root(&value).items().unwrap();
        assert_eq!(items[0].single_entry().unwrap().0, "execute");
        assert!(items[1].single_entry().is_err());
    }

    #[test]
    fn test_parse_source_rejects_repeated_keys() {
        let err = parse_source(r#"{ "queues": { "q0": {}, "q1": {}, "q0": {} } }"#).unwrap_err();
        assert!(matches!(err, CompileError::ParseError { .. }));
        assert!(err.message().starts_with("Name q0 is declared more than once"), "{}", err);
    }

    #[test]
    fn test_parse_source_keeps_values_and_order() {
        let value = parse_source(r#"{ "b": [1, -2, 2.5, true, null], "a": { "x": "y" } }"#).unwrap();
        assert_eq!(value, json!({ "b": [1, -2, 2.5, true, null], "a": { "x": "y" } }));
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn test_parse_source_reports_bad_json() {
        assert!(matches!(parse_source("{ \"a\": ").unwrap_err(), CompileError::Json(_)));
    }
}
