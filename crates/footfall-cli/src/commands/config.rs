//! Configuration commands.

use std::path::Path;

use anyhow::Result;

/// Prints the resolved configuration.
pub fn show(project_dir: Option<&Path>) -> Result<()> {
    let config = super::load_config(project_dir)?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}
