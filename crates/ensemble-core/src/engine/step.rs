use crate::core::models::results::ResultTuple;
use crate::core::models::unit::WorkUnit;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("Failed to prepare unit: {0}")]
    Prepare(String),

    #[error("Step failed: {0}")]
    Failed(String),

    #[error("I/O error in compute step: {0}")]
    Io(#[from] std::io::Error),
}

/// One unit's long-running computation, driven in discrete, uninterruptible steps.
pub trait ComputeStep {
    fn advance(&mut self) -> Result<(), StepError>;

    fn is_finished(&self) -> bool;

    /// The record to forward to the result sink once the unit is finished.
    fn results(&self) -> Option<ResultTuple>;
}

/// Builds a [`ComputeStep`] for a unit that has just been unpacked into `scratch`.
pub trait StepFactory {
    /// File name of the program the steps run. It lives in the scratch directory but is never
    /// checkpointed.
    fn executable(&self) -> Option<&str> {
        None
    }

    fn prepare(
        &mut self,
        scratch: &Path,
        unit: &WorkUnit,
    ) -> Result<Box<dyn ComputeStep>, StepError>;
}
