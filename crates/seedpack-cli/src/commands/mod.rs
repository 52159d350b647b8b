//! CLI commands

pub mod package;
pub mod reconcile;
pub mod render;
pub mod run;
