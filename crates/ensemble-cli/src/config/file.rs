use crate::error::{CliError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileFleetConfig {
    pub workers: Option<usize>,
    pub listen: Option<String>,
    pub spawn: Option<bool>,
    #[serde(rename = "in-process")]
    pub in_process: Option<bool>,
    #[serde(rename = "scratch-dir")]
    pub scratch_dir: Option<PathBuf>,
    /// Seconds.
    #[serde(rename = "accept-timeout")]
    pub accept_timeout: Option<u64>,
    /// Seconds.
    #[serde(rename = "connect-timeout")]
    pub connect_timeout: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileWorkerConfig {
    /// Seconds.
    #[serde(rename = "checkpoint-interval")]
    pub checkpoint_interval: Option<u64>,
    #[serde(rename = "marker-suffix")]
    pub marker_suffix: Option<String>,
    #[serde(rename = "tolerate-failures")]
    pub tolerate_failures: Option<bool>,
    #[serde(rename = "keep-scratch")]
    pub keep_scratch: Option<bool>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileCoordinatorConfig {
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: Option<u64>,
    /// Seconds.
    #[serde(rename = "shutdown-grace")]
    pub shutdown_grace: Option<u64>,
    #[serde(rename = "io-tickets")]
    pub io_tickets: Option<usize>,
    #[serde(rename = "idle-report-ms")]
    pub idle_report_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileResultsConfig {
    pub database: Option<PathBuf>,
    pub fresh: Option<bool>,
    /// Seconds.
    #[serde(rename = "commit-interval")]
    pub commit_interval: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileSimulationConfig {
    pub executable: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub fleet: Option<FileFleetConfig>,
    pub worker: Option<FileWorkerConfig>,
    pub coordinator: Option<FileCoordinatorConfig>,
    pub results: Option<FileResultsConfig>,
    pub simulation: Option<FileSimulationConfig>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }
}
