use cadee_ensemble::engine::config::{CoordinatorConfig, WorkerConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Where the worker ranks of a `run` come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetMode {
    /// Worker processes of this binary, started by the coordinator.
    Spawn,
    /// Worker processes started by someone else, e.g. a batch scheduler.
    External,
    /// Worker threads inside the coordinator process.
    InProcess,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub executable: String,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub simpack_dir: PathBuf,
    pub workers: usize,
    pub mode: FleetMode,
    pub listen: String,
    pub accept_timeout: Duration,
    pub scratch_root: PathBuf,
    pub fleet_id: String,
    pub database: PathBuf,
    pub fresh_db: bool,
    pub commit_interval: Duration,
    pub simulation: SimulationConfig,
    pub worker: WorkerConfig,
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Clone)]
pub struct WorkerProcessConfig {
    pub connect: String,
    pub rank: usize,
    pub size: usize,
    pub fleet_id: String,
    pub connect_timeout: Duration,
    pub scratch_root: PathBuf,
    pub simulation: SimulationConfig,
    pub worker: WorkerConfig,
}
