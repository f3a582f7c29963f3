//! Pipeline configuration
//!
//! Every field has a default that reproduces the reference run, so an empty
//! file (or no file at all) is a valid configuration.
//!
//! Resolution order:
//! 1. `--config PATH`
//! 2. `./indexcheck.yaml`
//! 3. `<platform config dir>/indexcheck/config.yaml`
//! 4. built-in defaults

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::bundle::BundleSpec;
use crate::error::PipelineError;
use crate::index::DEFAULT_BINARY_SOURCE_IMAGE;
use crate::tags::DEFAULT_TAG_LENGTH;

pub const LOCAL_CONFIG_FILE: &str = "indexcheck.yaml";
pub const USER_CONFIG_FILE: &str = "config.yaml";

/// Names of the environment variables holding registry credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialVars {
    pub username: String,
    pub password: String,
}

impl Default for CredentialVars {
    fn default() -> Self {
        Self {
            username: "DOCKER_USERNAME".to_string(),
            password: "DOCKER_PASSWORD".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Registry host to log into
    pub registry: String,
    pub bundle_repository: String,
    pub index_repository: String,
    pub package_name: String,
    pub channels: Vec<String>,
    pub default_channel: Option<String>,
    /// One manifest directory per bundle version, in build order
    pub bundle_paths: Vec<PathBuf>,
    /// Package exported from the index; defaults to `package_name`
    pub export_package: Option<String>,
    pub export_dir: PathBuf,
    /// Where the verifier creates its scratch database
    pub database_dir: PathBuf,
    pub keep_database: bool,
    pub tag_length: usize,
    pub binary_source_image: String,
    pub credentials: CredentialVars,
    /// Upper bound for every container tool invocation
    pub command_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            registry: "quay.io".to_string(),
            bundle_repository: "quay.io/olmtest/e2e-bundle".to_string(),
            index_repository: "quay.io/olmtest/e2e-index".to_string(),
            package_name: "prometheus".to_string(),
            channels: vec!["preview".to_string()],
            default_channel: Some("preview".to_string()),
            bundle_paths: ["0.14.0", "0.15.0", "0.22.2"]
                .iter()
                .map(|v| Path::new("manifests").join("prometheus").join(v))
                .collect(),
            export_package: None,
            export_dir: PathBuf::from("downloaded"),
            database_dir: PathBuf::from("."),
            keep_database: false,
            tag_length: DEFAULT_TAG_LENGTH,
            binary_source_image: DEFAULT_BINARY_SOURCE_IMAGE.to_string(),
            credentials: CredentialVars::default(),
            command_timeout_secs: None,
        }
    }
}

/// Where a configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    WorkingDir(PathBuf),
    UserConfig(PathBuf),
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Explicit(p) | ConfigSource::WorkingDir(p) | ConfigSource::UserConfig(p) => {
                write!(f, "{}", p.display())
            }
            ConfigSource::Defaults => f.write_str("built-in defaults"),
        }
    }
}

impl PipelineConfig {
    /// Read and validate a YAML config file
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml_ng::from_str(&content).map_err(|e| {
                PipelineError::Config(format!("failed to parse {}: {e}", path.display()))
            })?
        };
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration following the documented order
    pub fn discover(
        explicit: Option<&Path>,
        working_dir: &Path,
    ) -> Result<(Self, ConfigSource), PipelineError> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(PipelineError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            return Ok((Self::from_file(path)?, ConfigSource::Explicit(path.to_path_buf())));
        }

        let local = working_dir.join(LOCAL_CONFIG_FILE);
        if local.is_file() {
            return Ok((Self::from_file(&local)?, ConfigSource::WorkingDir(local)));
        }

        if let Some(user) = user_config_path().filter(|p| p.is_file()) {
            return Ok((Self::from_file(&user)?, ConfigSource::UserConfig(user)));
        }

        debug!("No config file found, using defaults");
        let config = Self::default();
        config.validate()?;
        Ok((config, ConfigSource::Defaults))
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::Config(msg));

        if self.bundle_paths.is_empty() {
            return invalid("at least one bundle path is required".to_string());
        }
        if self.package_name.trim().is_empty() {
            return invalid("packageName must not be empty".to_string());
        }
        if self.channels.is_empty() {
            return invalid("at least one channel is required".to_string());
        }
        if self.tag_length == 0 {
            return invalid("tagLength must be greater than zero".to_string());
        }
        if let Some(default) = &self.default_channel {
            if !self.channels.contains(default) {
                return invalid(format!(
                    "defaultChannel {default} is not one of the channels {:?}",
                    self.channels
                ));
            }
        }
        let export = self.export_package();
        if export != self.package_name {
            return invalid(format!(
                "exportPackage {export} has no declared bundles (bundles belong to {})",
                self.package_name
            ));
        }
        Ok(())
    }

    pub fn export_package(&self) -> &str {
        self.export_package.as_deref().unwrap_or(&self.package_name)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    /// One build request template per bundle path
    pub fn bundle_specs(&self) -> Vec<BundleSpec> {
        self.bundle_paths
            .iter()
            .map(|path| BundleSpec {
                path: path.clone(),
                package_name: self.package_name.clone(),
                channels: self.channels.clone(),
                default_channel: self.default_channel.clone(),
            })
            .collect()
    }

    /// Resolve relative paths against `base`
    pub fn rooted_at(mut self, base: &Path) -> Self {
        let paths = self
            .bundle_paths
            .iter_mut()
            .chain([&mut self.export_dir, &mut self.database_dir]);
        for path in paths {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        debug!("Resolved pipeline paths against {}", base.display());
        self
    }
}

/// `<platform config dir>/indexcheck/config.yaml`, if the platform has one
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "indexcheck")
        .map(|dirs| dirs.config_dir().join(USER_CONFIG_FILE))
}
