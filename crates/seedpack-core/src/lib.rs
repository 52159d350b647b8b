//! Seedpack Core - Core types shared by the extension installation controller
//!
//! This crate provides the foundational types used throughout Seedpack:
//! - `Values`: Template value trees with recursive, right-biased overlay
//! - `Condition`: Named tri-state status conditions and their merge rules
//! - `Chart`: Packaged charts loaded from gzip tarballs or directories
//! - `TemplateContext`: Data exposed to templates while rendering

pub mod chart;
pub mod conditions;
pub mod context;
pub mod error;
pub mod values;

pub use chart::{Chart, ChartMetadata, decode_blob, encode_blob, package_dir};
pub use conditions::{Condition, ConditionStatus, ConditionType, merge_conditions};
pub use context::{Capabilities, ChartInfo, KubeVersion, ReleaseInfo, TemplateContext};
pub use error::{CoreError, Result};
pub use values::{Values, parse_set_values};
