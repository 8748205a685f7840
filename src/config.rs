use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::method::{self, DeletionMethod, PassSpec};
use crate::overwrite::{VerifyMode, DEFAULT_CHUNK_SIZE};

pub const DEFAULT_PASSES: u32 = 3;
pub const DEFAULT_WORKER_LIMIT: usize = 2;
const ENV_PREFIX: &str = "SHREDSPACE";

/// On-disk / environment configuration. Every field is optional and falls
/// back to the engine defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub default_method: Option<String>,
    pub default_passes: Option<u32>,
    pub chunk_size: Option<usize>,
    pub worker_limit: Option<usize>,
    pub verify_mode: Option<String>,
    pub backup_enabled: Option<bool>,
    pub backup_directory: Option<PathBuf>,
    pub obscure_file_names: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_method: Some("dod-5220.22-m".to_string()),
            default_passes: Some(DEFAULT_PASSES),
            chunk_size: Some(DEFAULT_CHUNK_SIZE),
            worker_limit: Some(DEFAULT_WORKER_LIMIT),
            verify_mode: Some("sampled".to_string()),
            backup_enabled: Some(false),
            backup_directory: None,
            obscure_file_names: Some(true),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = if is_yaml(path) {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults, then the optional file, then `SHREDSPACE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let loaded: Config = builder.build()?.try_deserialize()?;
        Ok(loaded.or_defaults())
    }

    fn or_defaults(self) -> Self {
        let defaults = Config::default();
        Self {
            default_method: self.default_method.or(defaults.default_method),
            default_passes: self.default_passes.or(defaults.default_passes),
            chunk_size: self.chunk_size.or(defaults.chunk_size),
            worker_limit: self.worker_limit.or(defaults.worker_limit),
            verify_mode: self.verify_mode.or(defaults.verify_mode),
            backup_enabled: self.backup_enabled.or(defaults.backup_enabled),
            backup_directory: self.backup_directory.or(defaults.backup_directory),
            obscure_file_names: self.obscure_file_names.or(defaults.obscure_file_names),
        }
    }

    pub fn method(&self) -> Result<DeletionMethod, ConfigurationError> {
        self.default_method
            .as_deref()
            .map_or(Ok(DeletionMethod::Dod522022M), str::parse)
    }

    pub fn passes(&self) -> u32 {
        self.default_passes.unwrap_or(DEFAULT_PASSES)
    }

    pub fn engine_options(&self) -> Result<EngineOptions, ConfigurationError> {
        let options = EngineOptions {
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            worker_limit: self.worker_limit.unwrap_or(DEFAULT_WORKER_LIMIT),
            verify_mode: self
                .verify_mode
                .as_deref()
                .map_or(Ok(VerifyMode::Sampled), str::parse)?,
            obscure_names: self.obscure_file_names.unwrap_or(true),
        };
        options.validate()?;
        Ok(options)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Engine tunables shared by every job of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub chunk_size: usize,
    /// Jobs on distinct files allowed to run at once.
    pub worker_limit: usize,
    pub verify_mode: VerifyMode,
    /// Rename to a random name before unlinking.
    pub obscure_names: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            worker_limit: DEFAULT_WORKER_LIMIT,
            verify_mode: VerifyMode::Sampled,
            obscure_names: true,
        }
    }
}

impl EngineOptions {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.chunk_size == 0 {
            return Err(ConfigurationError::InvalidChunkSize);
        }
        if self.worker_limit == 0 {
            return Err(ConfigurationError::InvalidWorkerLimit);
        }
        Ok(())
    }
}

/// Per-batch deletion settings, validated once before any job runs.
///
/// `passes` only matters for [`DeletionMethod::ZeroFill`] and
/// [`DeletionMethod::RandomFill`]; it is ignored for the fixed methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionConfig {
    pub method: DeletionMethod,
    pub passes: u32,
    pub backup_enabled: bool,
    pub backup_directory: Option<PathBuf>,
}

impl DeletionConfig {
    pub fn new(method: DeletionMethod, passes: u32) -> Self {
        Self {
            method,
            passes,
            backup_enabled: false,
            backup_directory: None,
        }
    }

    pub fn with_backup(mut self, directory: impl Into<PathBuf>) -> Self {
        self.backup_enabled = true;
        self.backup_directory = Some(directory.into());
        self
    }

    /// Resolve the pass plan, rejecting anything that would fail every job.
    pub fn validate(&self) -> Result<Vec<PassSpec>, ConfigurationError> {
        if self.backup_enabled && self.backup_directory.is_none() {
            return Err(ConfigurationError::MissingBackupDirectory);
        }
        method::plan(self.method, self.passes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn yaml_and_json_files_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.chunk_size = Some(4096);
        config.backup_directory = Some(PathBuf::from("/var/backups/shred"));

        for name in ["settings.yaml", "settings.json"] {
            let path = dir.path().join(name);
            config.save_to_file(&path).unwrap();
            assert_eq!(Config::from_file(&path).unwrap(), config);
        }
    }

    #[test]
    fn layered_load_fills_defaults_from_a_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "default_method": "zero", "chunk_size": 65536 }"#).unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(config.method().unwrap(), DeletionMethod::ZeroFill);
        assert_eq!(config.passes(), DEFAULT_PASSES);
        let options = config.engine_options().unwrap();
        assert_eq!(options.chunk_size, 65536);
        assert!(options.obscure_names);
    }

    #[test]
    fn invalid_engine_options_are_rejected() {
        let config = Config {
            worker_limit: Some(0),
            ..Config::default()
        };
        assert!(matches!(
            config.engine_options(),
            Err(ConfigurationError::InvalidWorkerLimit)
        ));

        let config = Config {
            verify_mode: Some("sometimes".into()),
            ..Config::default()
        };
        assert!(matches!(
            config.engine_options(),
            Err(ConfigurationError::UnknownVerifyMode(_))
        ));
    }

    #[test]
    fn backup_needs_a_directory() {
        let mut config = DeletionConfig::new(DeletionMethod::ZeroFill, 1);
        config.backup_enabled = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::MissingBackupDirectory)
        ));
        assert!(config.with_backup("/tmp/b").validate().is_ok());
    }

    #[test]
    fn fixed_methods_accept_any_pass_count() {
        assert_eq!(DeletionConfig::new(DeletionMethod::Dod522022M, 0).validate().unwrap().len(), 3);
        assert!(DeletionConfig::new(DeletionMethod::RandomFill, 0).validate().is_err());
    }
}
