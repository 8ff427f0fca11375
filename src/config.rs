//! Application configuration file (JSON).

use crate::error::{HarvestError, Result};
use crate::http::ServerConfig;
use crate::oai::OaiConfig;
use crate::repository::RepositoryConfig;
use crate::scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_delta_interval_secs() -> u64 {
    24 * 60 * 60
}

/// Everything the binary needs. Missing sections and fields take their
/// defaults, so `{}` is a valid file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub repository: RepositoryConfig,

    #[serde(default)]
    pub oai: OaiConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Seconds between scheduled delta runs over all active streams; 0
    /// disables them.
    #[serde(default = "default_delta_interval_secs")]
    pub delta_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            repository: RepositoryConfig::default(),
            oai: OaiConfig::default(),
            scheduler: SchedulerConfig::default(),
            server: ServerConfig::default(),
            delta_interval_secs: default_delta_interval_secs(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| HarvestError::Config(format!("{}: {e}", path.display())))
    }

    /// Read `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
