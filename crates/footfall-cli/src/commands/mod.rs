//! CLI command implementations.

pub mod config;
pub mod replay;

use std::path::Path;

use anyhow::{Context, Result};
use footfall_config::FootfallConfig;

/// Loads the layered configuration for `project_dir`, or the current
/// directory.
fn load_config(project_dir: Option<&Path>) -> Result<FootfallConfig> {
    match project_dir {
        Some(dir) => FootfallConfig::load_from_dir(dir)
            .with_context(|| format!("failed to load configuration from {}", dir.display())),
        None => FootfallConfig::load().context("failed to load configuration"),
    }
}
