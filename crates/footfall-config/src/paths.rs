//! Where footfall looks for configuration files.

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Locations of the per-user and per-project configuration layers.
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("com", "Footfall", "footfall"),
        }
    }

    /// Per-user configuration directory, e.g. `~/.config/footfall/` on Linux.
    ///
    /// Fails when the platform reports no home directory, which happens for
    /// some service accounts.
    pub fn user_config_dir(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or_else(|| ConfigError::XdgError("no home directory for user settings".to_string()))
    }

    /// Per-user settings shared by every tracker of this user.
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.user_config_dir()?.join("config.toml"))
    }

    /// Settings checked into the deployment (`footfall.toml`).
    pub fn project_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("footfall.toml")
    }

    /// Machine-local overrides, kept out of version control.
    pub fn local_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("footfall.local.toml")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
