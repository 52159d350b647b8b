//! Seedpack Engine - chart rendering with MiniJinja
//!
//! This crate renders packaged charts into Kubernetes manifests:
//! - Helm-style filters and functions (toyaml, nindent, b64encode, ...)
//! - Template errors as `miette` diagnostics pointing at the failing line
//! - `ChartRenderer`, the seam the controller renders through

pub mod engine;
pub mod error;
pub mod filters;
pub mod functions;
pub mod renderer;

pub use engine::{Engine, EngineBuilder, RenderedChart};
pub use error::{EngineError, Result, TemplateError, TemplateErrorKind};
pub use filters::AVAILABLE_FILTERS;
pub use renderer::{ChartRenderer, EngineRenderer};
