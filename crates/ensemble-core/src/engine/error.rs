use thiserror::Error;

use super::checkpoint::CheckpointError;
use super::config::ConfigError;
use crate::core::io::sink::SinkError;
use crate::core::models::ids::Rank;
use crate::core::transport::TransportError;
use std::path::PathBuf;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Result sink failed: {0}")]
    Sink(#[from] SinkError),

    #[error("Unit '{unit}' failed on rank {rank}: {source}")]
    UnitFailed {
        unit: String,
        rank: Rank,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Scratch directory '{path}' is unusable: {source}", path = path.display())]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("A fleet needs at least one worker")]
    NoWorkers,

    #[error("Internal logic error: {0}")]
    Internal(String),
}
