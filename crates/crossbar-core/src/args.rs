//! Typed access to request arguments.
//!
//! Arguments arrive as a JSON object (query string values are strings, body
//! values are typed JSON). Accessors are generic over [`FromArg`] so each
//! target type gets the same missing/default/conversion semantics: a
//! provided default covers absence only, a present-but-unconvertible value
//! is always an error.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::errors::ServerError;

/// Conversion from a raw JSON argument value.
pub trait FromArg: Sized {
    const TYPE_NAME: &'static str;

    fn from_arg(value: &Value) -> Option<Self>;
}

impl FromArg for String {
    const TYPE_NAME: &'static str = "string";

    fn from_arg(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl FromArg for i64 {
    const TYPE_NAME: &'static str = "integer";

    fn from_arg(value: &Value) -> Option<Self> {
        // Query-string arguments arrive as strings.
        value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    }
}

impl FromArg for f64 {
    const TYPE_NAME: &'static str = "float";

    fn from_arg(value: &Value) -> Option<Self> {
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    }
}

impl FromArg for bool {
    const TYPE_NAME: &'static str = "boolean";

    fn from_arg(value: &Value) -> Option<Self> {
        value
            .as_bool()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    }
}

/// Parsed request arguments with typed, sentinel-aware accessors.
#[derive(Debug, Clone, Default)]
pub struct RequestArgs {
    map: Map<String, Value>,
}

impl RequestArgs {
    pub fn new(map: Map<String, Value>) -> Self {
        Self { map }
    }

    /// Build from optional JSON-RPC params. Absent or `null` params mean no
    /// arguments; anything other than an object is rejected.
    pub fn from_params(params: Option<Value>) -> Result<Self, ServerError> {
        match params {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::Object(map)) => Ok(Self { map }),
            Some(other) => Err(ServerError::invalid_argument(format!(
                "params must be an object, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Build from an HTTP query-string map.
    pub fn from_query(query: HashMap<String, String>) -> Self {
        let map = query
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        Self { map }
    }

    /// Merge another argument set into this one; `other` wins on conflicts.
    pub fn merge(&mut self, other: Map<String, Value>) {
        for (k, v) in other {
            let _ = self.map.insert(k, v);
        }
    }

    /// Required argument: absence or conversion failure is an error.
    pub fn get<T: FromArg>(&self, key: &str) -> Result<T, ServerError> {
        match self.map.get(key) {
            None => Err(ServerError::invalid_argument(format!(
                "missing required argument '{key}'"
            ))),
            Some(value) => T::from_arg(value).ok_or_else(|| conversion_error::<T>(key, value)),
        }
    }

    /// Optional argument with default: absence yields the default, a present
    /// but unconvertible value is still an error.
    pub fn get_or<T: FromArg>(&self, key: &str, default: T) -> Result<T, ServerError> {
        match self.map.get(key) {
            None => Ok(default),
            Some(value) => T::from_arg(value).ok_or_else(|| conversion_error::<T>(key, value)),
        }
    }

    /// Optional argument without default.
    pub fn opt<T: FromArg>(&self, key: &str) -> Result<Option<T>, ServerError> {
        match self.map.get(key) {
            None => Ok(None),
            Some(value) => T::from_arg(value)
                .map(Some)
                .ok_or_else(|| conversion_error::<T>(key, value)),
        }
    }

    /// Raw JSON value, for structured arguments the typed accessors do not
    /// cover (e.g. the subscription object map).
    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    /// Whole argument map, for handlers that echo or forward arguments.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.map
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn conversion_error<T: FromArg>(key: &str, value: &Value) -> ServerError {
    ServerError::invalid_argument(format!(
        "argument '{key}' is not a valid {}: {value}",
        T::TYPE_NAME
    ))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
