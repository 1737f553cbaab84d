//! Configuration loader with multi-source merging

use crate::{FootfallConfig, Paths};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    include_user_config: bool,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "FOOTFALL".to_string(),
            include_user_config: true,
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "FOOTFALL")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip ~/.config/footfall/config.toml
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<FootfallConfig> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = FootfallConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config (~/.config/footfall/config.toml)
        if self.include_user_config {
            if let Ok(user_config_file) = Paths::new().user_config_file() {
                if user_config_file.exists() {
                    builder = builder.add_source(toml_file(user_config_file));
                }
            }
        }

        // 3. Project config (footfall.toml)
        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(toml_file(project_config_file));
        }

        // 4. Local config (footfall.local.toml, gitignored)
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(toml_file(local_config_file));
        }

        // 5. Environment variables (FOOTFALL_SESSION__MAX_AGE_SECS=600)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("referrer.domain_blacklist")
                .try_parsing(true),
        );

        // Build and deserialize
        let config = builder.build().context("Failed to build configuration")?;

        let footfall_config: FootfallConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        footfall_config
            .validate()
            .context("Configuration failed validation")?;

        Ok(footfall_config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> FootfallConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn toml_file(path: PathBuf) -> impl config::Source + Send + Sync + 'static {
    config::File::from(path)
        .required(false)
        .format(config::FileFormat::Toml)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> ConfigLoader {
        // Unique prefix so ambient FOOTFALL_* variables cannot leak in
        ConfigLoader::new()
            .with_project_dir(dir)
            .with_env_prefix("FOOTFALL_LOADER_TEST")
            .without_user_config()
    }

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");

        assert_eq!(config, FootfallConfig::default());
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[tracker]
workers = 2
worker_buffer_size = 64
flush_timeout_secs = 3

[session]
max_age_secs = 1800

[fingerprint]
salt = "pepper"
rotate_daily = false

[referrer]
domain_blacklist = ["example.com", "example.org"]
blacklist_includes_subdomains = true
"#;
        fs::write(project_dir.join("footfall.toml"), config_content)
            .expect("Failed to write config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.tracker.workers, 2);
        assert_eq!(config.tracker.worker_buffer_size, 64);
        assert_eq!(config.tracker.flush_timeout_secs, 3);
        assert_eq!(config.session.max_age_secs, 1800);
        assert_eq!(config.session.bot_threshold, 5);
        assert_eq!(config.fingerprint.salt, "pepper");
        assert!(!config.fingerprint.rotate_daily);
        assert_eq!(
            config.referrer.domain_blacklist,
            vec!["example.com".to_string(), "example.org".to_string()]
        );
        assert!(config.referrer.blacklist_includes_subdomains);
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("footfall.toml"),
            r#"
[tracker]
workers = 2
worker_buffer_size = 64
"#,
        )
        .expect("Failed to write project config");

        fs::write(
            project_dir.join("footfall.local.toml"),
            r#"
[tracker]
workers = 8
"#,
        )
        .expect("Failed to write local config");

        let config = loader(project_dir).load().expect("Failed to load config");

        // Local config should override project config, key by key
        assert_eq!(config.tracker.workers, 8);
        assert_eq!(config.tracker.worker_buffer_size, 64);
    }

    #[test]
    fn test_invalid_project_config_fails() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("footfall.toml"),
            r#"
[referrer]
domain_blacklist = ["https://example.com/"]
"#,
        )
        .expect("Failed to write project config");

        assert!(loader(project_dir).load().is_err());
        assert_eq!(
            loader(project_dir).load_or_default(),
            FootfallConfig::default()
        );
    }

    // Environment overrides are not exercised here: edition 2024 makes
    // `env::set_var` unsafe and the workspace denies unsafe code. In use:
    //
    // FOOTFALL_TRACKER__WORKERS=4
    // FOOTFALL_SESSION__MAX_AGE_SECS=1800
    // FOOTFALL_REFERRER__DOMAIN_BLACKLIST=example.com,example.org
}
