//! Values handling with deep merge support
//!
//! A value tree is a `serde_json::Value`: mappings, sequences and scalars.
//! Overlays are right-biased and recursive, so for any key present in
//! several layers the last layer wins, at every nesting level.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;

use crate::error::{CoreError, Result};

/// Values container with deep merge capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Values {
    /// Create empty values
    pub fn new() -> Self {
        Self(JsonValue::Object(serde_json::Map::new()))
    }

    /// Wrap a JSON value that must be a mapping (or null, treated as empty)
    pub fn from_mapping(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Object(_) => Ok(Self(value)),
            JsonValue::Null => Ok(Self::new()),
            other => Err(CoreError::Values {
                message: format!("expected a mapping, found {}", kind_of(&other)),
            }),
        }
    }

    /// Load values from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse values from YAML string. An empty document yields empty values.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::new());
        }
        let value: JsonValue = serde_yaml::from_str(yaml)?;
        Self::from_mapping(value)
    }

    /// Parse values from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(json)?;
        Self::from_mapping(value)
    }

    /// Deep merge another Values into this one
    ///
    /// Rules:
    /// - Scalars: overlay replaces base
    /// - Objects: recursive merge
    /// - Arrays: overlay replaces base (not appended)
    pub fn merge(&mut self, overlay: &Values) {
        deep_merge(&mut self.0, &overlay.0);
    }

    /// Builder-style merge, returning the merged tree
    pub fn overlaid(mut self, overlay: &Values) -> Self {
        self.merge(overlay);
        self
    }

    /// Merge multiple layers in order, later layers winning
    pub fn merge_all(layers: impl IntoIterator<Item = Values>) -> Self {
        let mut result = Values::new();
        for layer in layers {
            result.merge(&layer);
        }
        result
    }

    /// Set a value by dotted path (e.g., "image.tag")
    pub fn set(&mut self, path: &str, value: JsonValue) {
        let parts: Vec<&str> = path.split('.').collect();
        set_nested(&mut self.0, &parts, value);
    }

    /// Get a value by dotted path
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        let parts: Vec<&str> = path.split('.').collect();
        get_nested(&self.0, &parts)
    }

    /// Get the inner JSON value
    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    /// Convert to JSON value
    pub fn into_inner(self) -> JsonValue {
        self.0
    }

    /// Check if values are empty
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }
}

impl From<serde_json::Map<String, JsonValue>> for Values {
    fn from(map: serde_json::Map<String, JsonValue>) -> Self {
        Self(JsonValue::Object(map))
    }
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "sequence",
        JsonValue::Object(_) => "mapping",
    }
}

/// Deep merge two JSON values
fn deep_merge(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Set a nested value by path, creating intermediate mappings
fn set_nested(value: &mut JsonValue, path: &[&str], new_value: JsonValue) {
    let Some((key, remaining)) = path.split_first() else {
        *value = new_value;
        return;
    };

    if !value.is_object() {
        *value = JsonValue::Object(serde_json::Map::new());
    }

    if let JsonValue::Object(map) = value {
        if remaining.is_empty() {
            map.insert((*key).to_string(), new_value);
        } else {
            let entry = map
                .entry((*key).to_string())
                .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
            set_nested(entry, remaining, new_value);
        }
    }
}

/// Get a nested value by path
fn get_nested<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let Some((key, remaining)) = path.split_first() else {
        return Some(value);
    };

    match value {
        JsonValue::Object(map) => map.get(*key).and_then(|v| get_nested(v, remaining)),
        _ => None,
    }
}

/// Parse --set arguments (key=value format)
pub fn parse_set_values(set_args: &[String]) -> Result<Values> {
    let mut values = Values::new();

    for arg in set_args {
        let (key, val) = arg.split_once('=').ok_or_else(|| CoreError::Values {
            message: format!("Invalid --set format: '{}'. Expected key=value", arg),
        })?;

        let json_value = if val == "true" {
            JsonValue::Bool(true)
        } else if val == "false" {
            JsonValue::Bool(false)
        } else if val == "null" {
            JsonValue::Null
        } else if let Ok(num) = val.parse::<i64>() {
            JsonValue::Number(num.into())
        } else if let Some(num) = val.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            JsonValue::Number(num)
        } else if val.starts_with('[') || val.starts_with('{') {
            serde_json::from_str(val).unwrap_or_else(|_| JsonValue::String(val.to_string()))
        } else {
            JsonValue::String(val.to_string())
        };

        values.set(key, json_value);
    }

    Ok(values)
}
