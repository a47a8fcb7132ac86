//! # Configuration
//!
//! Store location and pipeline sizing, resolved once at startup.
//!
//! Precedence: environment > TOML file named by `SUBSTRATE_CONFIG` >
//! compiled-in defaults. Every value is validated; a bad value is an
//! `InvalidConfig` error, never silently replaced.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use substrate_core::{PipelineConfig, SubstrateError};

pub const ENV_DB: &str = "SUBSTRATE_DB";
pub const ENV_CONFIG: &str = "SUBSTRATE_CONFIG";
pub const ENV_WORKERS: &str = "SUBSTRATE_WORKERS";
pub const ENV_BATCH_SIZE: &str = "SUBSTRATE_BATCH_SIZE";
pub const ENV_QUEUE_DEPTH: &str = "SUBSTRATE_QUEUE_DEPTH";
pub const ENV_PARTITION_SIZE: &str = "SUBSTRATE_PARTITION_SIZE";
pub const ENV_TEXT_MEMO: &str = "SUBSTRATE_TEXT_MEMO";
pub const ENV_LOG_FORMAT: &str = "SUBSTRATE_LOG_FORMAT";

/// Store file used when neither the environment nor the file names one.
pub const DEFAULT_DB: &str = "substrate.redb";

/// Optional keys of the TOML config file.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub db: Option<PathBuf>,
    pub workers: Option<usize>,
    pub batch_size: Option<usize>,
    pub queue_depth: Option<usize>,
    pub partition_size: Option<usize>,
    pub text_memo: Option<usize>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self, SubstrateError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SubstrateError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, SubstrateError> {
        toml::from_str(text).map_err(|e| SubstrateError::InvalidConfig(e.to_string()))
    }
}

/// Resolved settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubstrateConfig {
    pub db_path: PathBuf,
    pub pipeline: PipelineConfig,
}

impl SubstrateConfig {
    /// Resolve from the process environment.
    pub fn from_env() -> Result<Self, SubstrateError> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary variable lookup.
    pub fn resolve(env: impl Fn(&str) -> Option<String>) -> Result<Self, SubstrateError> {
        let file = match env(ENV_CONFIG) {
            Some(path) => FileConfig::read(Path::new(&path))?,
            None => FileConfig::default(),
        };
        let defaults = PipelineConfig::default();

        let pipeline = PipelineConfig {
            workers: pick(&env, ENV_WORKERS, file.workers, defaults.workers)?,
            batch_size: pick(&env, ENV_BATCH_SIZE, file.batch_size, defaults.batch_size)?,
            queue_depth: pick(&env, ENV_QUEUE_DEPTH, file.queue_depth, defaults.queue_depth)?,
            partition_size: pick(
                &env,
                ENV_PARTITION_SIZE,
                file.partition_size,
                defaults.partition_size,
            )?,
            text_memo: pick(&env, ENV_TEXT_MEMO, file.text_memo, defaults.text_memo)?,
        };
        pipeline.validate()?;

        let db_path = env(ENV_DB)
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from)
            .or(file.db)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB));

        Ok(Self { db_path, pipeline })
    }
}

fn pick(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    from_file: Option<usize>,
    default: usize,
) -> Result<usize, SubstrateError> {
    match env(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            SubstrateError::InvalidConfig(format!("{key}={raw:?} is not a non-negative integer"))
        }),
        None => Ok(from_file.unwrap_or(default)),
    }
}

// =============================================================================
// TESTS
// =============================================================================
