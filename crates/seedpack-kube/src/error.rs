//! Error types for seedpack-kube

use thiserror::Error;

/// Result type for seedpack-kube operations
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Errors that can occur while reconciling extension installations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// The seed cluster could not be reached
    #[error("cannot connect to seed '{seed}': {message}")]
    SeedConnection { seed: String, message: String },

    /// The registration's provider config is not a usable chart deployment
    #[error("invalid chart information: {0}")]
    ChartInformation(String),

    /// Chart rendering error
    #[error("chart cannot be rendered: {0}")]
    Render(#[from] seedpack_engine::EngineError),

    /// Chart or values error
    #[error(transparent)]
    Core(#[from] seedpack_core::CoreError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Several independent operations failed
    #[error("{} errors occurred: {}", .0.len(), join(.0))]
    Aggregate(Vec<ControllerError>),
}

impl From<serde_json::Error> for ControllerError {
    fn from(e: serde_json::Error) -> Self {
        ControllerError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for ControllerError {
    fn from(e: serde_yaml::Error) -> Self {
        ControllerError::Serialization(e.to_string())
    }
}

impl ControllerError {
    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, ControllerError::Api(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// Check if this is a conflict error (409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Api(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Combine errors, keeping a single error as is
    ///
    /// Returns `None` for an empty list.
    pub fn aggregate(mut errors: Vec<ControllerError>) -> Option<ControllerError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(ControllerError::Aggregate(errors)),
        }
    }
}

fn join(errors: &[ControllerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Build a Kubernetes API error response
///
/// Used by in-memory collaborators so that their failures classify exactly
/// like the API server's.
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> ControllerError {
    ControllerError::Api(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    }))
}

/// 404 for the named object
pub fn not_found(kind: &str, name: &str) -> ControllerError {
    api_error(404, "NotFound", format!("{} \"{}\" not found", kind, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(not_found("Seed", "a").is_not_found());
        assert!(api_error(409, "Conflict", "stale").is_conflict());
        assert!(!api_error(500, "InternalError", "boom").is_not_found());
        assert!(!ControllerError::InvalidConfig("x".into()).is_not_found());
    }

    #[test]
    fn test_aggregate() {
        assert!(ControllerError::aggregate(vec![]).is_none());

        let single = ControllerError::aggregate(vec![not_found("Extension", "a")]).unwrap();
        assert!(single.is_not_found());

        let many = ControllerError::aggregate(vec![
            api_error(500, "InternalError", "one"),
            api_error(403, "Forbidden", "two"),
        ])
        .unwrap();
        let message = many.to_string();
        assert!(message.starts_with("2 errors occurred"));
        assert!(message.contains("one") && message.contains("two"));
    }
}
