mod builder;
mod defaults;
mod file;
mod models;

pub use builder::{build_run_config, build_worker_config};
pub use defaults::DefaultsConfig;
pub use models::{FleetMode, RunConfig, SimulationConfig, WorkerProcessConfig};
