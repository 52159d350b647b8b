//! Engine error types

use miette::{Diagnostic, NamedSource, SourceSpan};
use seedpack_core::CoreError;
use thiserror::Error;

/// Main engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Invalid chart: {0}")]
    Chart(#[from] CoreError),

    #[error("Template {template} did not render to valid YAML: {source}")]
    Manifest {
        template: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Templates {first} and {second} both map to secret key {key}")]
    SecretKeyCollision {
        key: String,
        first: String,
        second: String,
    },
}

/// Error kind for categorizing template errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TemplateErrorKind {
    UndefinedVariable,
    UnknownFilter,
    UnknownFunction,
    SyntaxError,
    InvalidOperation,
    Other,
}

impl From<minijinja::ErrorKind> for TemplateErrorKind {
    fn from(kind: minijinja::ErrorKind) -> Self {
        match kind {
            minijinja::ErrorKind::UndefinedError => Self::UndefinedVariable,
            minijinja::ErrorKind::UnknownFilter => Self::UnknownFilter,
            minijinja::ErrorKind::UnknownFunction => Self::UnknownFunction,
            minijinja::ErrorKind::SyntaxError => Self::SyntaxError,
            minijinja::ErrorKind::InvalidOperation => Self::InvalidOperation,
            _ => Self::Other,
        }
    }
}

/// Template-specific error with source information
#[derive(Error, Debug, Diagnostic, Clone)]
#[error("{template}: {message}")]
#[diagnostic(code(seedpack::template::render))]
pub struct TemplateError {
    /// Error message
    pub message: String,

    /// Error kind for categorization
    pub kind: TemplateErrorKind,

    /// Chart-relative template path
    pub template: String,

    /// Template source code
    #[source_code]
    pub src: NamedSource<String>,

    /// Error location in source
    #[label("error occurred here")]
    pub span: Option<SourceSpan>,

    #[help]
    pub help: Option<String>,
}

impl TemplateError {
    /// Create a template error from a MiniJinja error
    pub fn from_minijinja(err: minijinja::Error, template_name: &str, template_source: &str) -> Self {
        let kind = TemplateErrorKind::from(err.kind());
        let span = err
            .line()
            .and_then(|line| calculate_span(template_source, line));

        let message = match err.detail() {
            Some(detail) => format!("{}: {}", err.kind(), detail),
            None => err.kind().to_string(),
        };

        let help = match kind {
            TemplateErrorKind::UndefinedVariable => Some(
                "values are under `values.*`; check the chart defaults and the registration values"
                    .to_string(),
            ),
            TemplateErrorKind::UnknownFilter => Some(format!(
                "available filters: {}",
                crate::filters::AVAILABLE_FILTERS.join(", ")
            )),
            _ => None,
        };

        Self {
            message,
            kind,
            template: template_name.to_string(),
            src: NamedSource::new(template_name, template_source.to_string()),
            span,
            help,
        }
    }

    /// Get the error kind
    pub fn kind(&self) -> TemplateErrorKind {
        self.kind
    }
}

/// Calculate the source span of a 1-based line number
fn calculate_span(source: &str, line_num: usize) -> Option<SourceSpan> {
    let mut offset = 0;

    for (idx, line) in source.lines().enumerate() {
        if idx + 1 == line_num {
            return Some(SourceSpan::new(offset.into(), line.len()));
        }
        offset += line.len() + 1;
    }

    None
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_points_at_line() {
        let source = "a: 1\nb: {{ nope }}\n";
        let span = calculate_span(source, 2).unwrap();
        assert_eq!(span.offset(), 5);
        assert_eq!(span.len(), "b: {{ nope }}".len());
        assert!(calculate_span(source, 9).is_none());
    }

    #[test]
    fn test_undefined_variable_kind() {
        let mut env = minijinja::Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        let err = env.render_str("{{ missing.key }}", ()).unwrap_err();

        let template_error = TemplateError::from_minijinja(err, "templates/x.yaml", "{{ missing.key }}");
        assert_eq!(template_error.kind(), TemplateErrorKind::UndefinedVariable);
        assert_eq!(template_error.template, "templates/x.yaml");
        assert!(template_error.help.is_some());
    }
}
