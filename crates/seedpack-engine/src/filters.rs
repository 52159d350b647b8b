//! Kubernetes-specific template filters
//!
//! Helm-compatible helpers most extension charts rely on.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use minijinja::value::ValueKind;
use minijinja::{Error, ErrorKind, Value};
use semver::{Version, VersionReq};
use sha2::{Digest, Sha256};

/// Filters registered on every environment, besides MiniJinja builtins
pub const AVAILABLE_FILTERS: &[&str] = &[
    "toyaml",
    "tojson",
    "b64encode",
    "b64decode",
    "quote",
    "squote",
    "nindent",
    "indent",
    "required",
    "empty",
    "haskey",
    "sha256",
    "trunc",
    "trimprefix",
    "trimsuffix",
    "semver_match",
];

fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, message.into())
}

/// Text form of a scalar; booleans stay lowercase as in YAML
fn as_text(value: &Value) -> String {
    if let Some(s) = value.as_str() {
        return s.to_string();
    }
    match value.kind() {
        ValueKind::Bool => value.is_true().to_string(),
        _ => value.to_string(),
    }
}

/// Convert a value to YAML without the document marker or trailing newline
///
/// Usage: {{ values.config | toyaml }}
pub fn toyaml(value: Value) -> Result<String, Error> {
    let json: serde_json::Value = serde_json::to_value(&value).map_err(|e| invalid(e.to_string()))?;
    let yaml = serde_yaml::to_string(&json).map_err(|e| invalid(e.to_string()))?;

    Ok(yaml.trim_start_matches("---\n").trim_end().to_string())
}

/// Convert a value to compact JSON
///
/// Usage: {{ values.config | tojson }}
pub fn tojson(value: Value) -> Result<String, Error> {
    serde_json::to_string(&value).map_err(|e| invalid(e.to_string()))
}

/// Usage: {{ secret | b64encode }}
pub fn b64encode(value: String) -> String {
    BASE64.encode(value.as_bytes())
}

/// Usage: {{ encoded | b64decode }}
pub fn b64decode(value: String) -> Result<String, Error> {
    let decoded = BASE64
        .decode(value.as_bytes())
        .map_err(|e| invalid(format!("base64 decode error: {}", e)))?;

    String::from_utf8(decoded).map_err(|e| invalid(format!("UTF-8 decode error: {}", e)))
}

/// Usage: {{ name | quote }}
pub fn quote(value: Value) -> String {
    format!("\"{}\"", as_text(&value).replace('\\', "\\\\").replace('"', "\\\""))
}

/// Usage: {{ name | squote }}
pub fn squote(value: Value) -> String {
    format!("'{}'", as_text(&value).replace('\'', "''"))
}

/// Indent every non-empty line, prefixed by a newline (Helm's nindent)
///
/// Usage: {{ content | nindent(4) }}
pub fn nindent(value: String, spaces: usize) -> String {
    format!("\n{}", indent(value, spaces))
}

/// Indent every non-empty line
///
/// Usage: {{ content | indent(4) }}
pub fn indent(value: String, spaces: usize) -> String {
    let pad = " ".repeat(spaces);

    value
        .lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{}{}", pad, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fail rendering when a value is undefined, none or an empty string
///
/// Usage: {{ values.gardener.seed.provider | required("provider is required") }}
pub fn required(value: Value, message: Option<String>) -> Result<Value, Error> {
    let missing = value.is_undefined() || value.is_none() || value.as_str() == Some("");
    if missing {
        Err(invalid(
            message.unwrap_or_else(|| "required value is missing".to_string()),
        ))
    } else {
        Ok(value)
    }
}

/// Usage: {% if values.taints | empty %}
pub fn empty(value: Value) -> bool {
    if value.is_undefined() || value.is_none() {
        return true;
    }
    match value.len() {
        Some(len) => len == 0,
        None => value.as_str().is_some_and(str::is_empty),
    }
}

/// Usage: {% if values | haskey("gardener") %}
pub fn haskey(value: Value, key: String) -> bool {
    value
        .get_attr(&key)
        .map(|v| !v.is_undefined())
        .unwrap_or(false)
}

/// Hex SHA-256 digest, commonly used for checksum annotations
///
/// Usage: {{ values.config | tojson | sha256 }}
pub fn sha256sum(value: String) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

/// Usage: {{ name | trunc(63) }}
pub fn trunc(value: String, length: usize) -> String {
    value.chars().take(length).collect()
}

/// Usage: {{ version | trimprefix("v") }}
pub fn trimprefix(value: String, prefix: String) -> String {
    match value.strip_prefix(prefix.as_str()) {
        Some(rest) => rest.to_string(),
        None => value,
    }
}

/// Usage: {{ name | trimsuffix("-seed") }}
pub fn trimsuffix(value: String, suffix: String) -> String {
    match value.strip_suffix(suffix.as_str()) {
        Some(rest) => rest.to_string(),
        None => value,
    }
}

/// Check a version against a semver constraint (Helm's semverCompare)
///
/// Kubernetes-style versions such as `v1.30.2-eks-1234` are compared on
/// their `major.minor.patch` core.
///
/// Usage: {% if capabilities.kubeVersion.version | semver_match(">=1.29.0") %}
pub fn semver_match(version: Value, constraint: String) -> Result<bool, Error> {
    let raw = version
        .as_str()
        .ok_or_else(|| invalid("version must be a string"))?;
    let parsed = parse_lenient(raw).ok_or_else(|| invalid(format!("invalid version: {}", raw)))?;

    let req = VersionReq::parse(constraint.trim())
        .map_err(|e| invalid(format!("invalid constraint '{}': {}", constraint, e)))?;

    Ok(req.matches(&parsed))
}

fn parse_lenient(raw: &str) -> Option<Version> {
    let core = raw.trim_start_matches('v');
    let core = core.split(['-', '+']).next().unwrap_or(core);

    let mut numbers = core.split('.').map(|p| p.parse::<u64>());
    let major = numbers.next()?.ok()?;
    let minor = numbers.next().unwrap_or(Ok(0)).ok()?;
    let patch = numbers.next().unwrap_or(Ok(0)).ok()?;

    Some(Version::new(major, minor, patch))
}
