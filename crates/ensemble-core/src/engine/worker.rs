use super::checkpoint::{CheckpointEngine, CheckpointError, IoGate, TicketGuard};
use super::config::WorkerConfig;
use super::context::FleetContext;
use super::error::EngineError;
use super::step::{ComputeStep, StepFactory};
use super::termination::TerminationFlag;
use crate::core::io::archive;
use crate::core::models::ids::{COORDINATOR_RANK, Rank};
use crate::core::models::unit::{Assignment, WorkUnit};
use crate::core::transport::{Message, MessageKind, Transport, TransportError};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Fetching,
    Unpacking,
    Computing,
    Checkpointing,
    Reporting,
    ShuttingDown,
}

/// How a worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The coordinator ran out of work and told this rank to stop.
    Retired,
    /// A termination request stopped the rank early.
    Interrupted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: usize,
    pub failed: usize,
}

enum UnitOutcome {
    Completed,
    Interrupted,
}

/// Acquires tickets from the coordinator over the transport.
struct TicketGate<'a, T: Transport> {
    transport: &'a mut T,
}

impl<T: Transport> IoGate for TicketGate<'_, T> {
    fn acquire(&mut self) -> Result<(), TransportError> {
        self.transport.send(COORDINATOR_RANK, Message::IoRequest)?;
        self.transport
            .recv(COORDINATOR_RANK, MessageKind::IoTicket)
            .map(|_| ())
    }

    fn release(&mut self) -> Result<(), TransportError> {
        self.transport.send(COORDINATOR_RANK, Message::IoFinished)
    }
}

pub struct Worker<T: Transport, F: StepFactory> {
    ctx: FleetContext<T>,
    factory: F,
    config: WorkerConfig,
    scratch: PathBuf,
    termination: TerminationFlag,
    state: WorkerState,
    engine: Option<CheckpointEngine>,
    stats: WorkerStats,
}

impl<T: Transport, F: StepFactory> Worker<T, F> {
    pub fn new(
        ctx: FleetContext<T>,
        factory: F,
        config: WorkerConfig,
        scratch: impl Into<PathBuf>,
        termination: TerminationFlag,
    ) -> Self {
        Self {
            ctx,
            factory,
            config,
            scratch: scratch.into(),
            termination,
            state: WorkerState::Idle,
            engine: None,
            stats: WorkerStats::default(),
        }
    }

    pub fn rank(&self) -> Rank {
        self.ctx.rank()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    fn transition(&mut self, next: WorkerState) {
        trace!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Fetches and runs units until the coordinator sends the shutdown sentinel or a
    /// termination request arrives. Unless the coordinator itself is unreachable, a failing
    /// worker still acknowledges shutdown so the fleet does not wait for it.
    #[instrument(name = "rank", skip_all, fields(id = self.ctx.rank()))]
    pub fn run(mut self) -> Result<WorkerExit, EngineError> {
        let result = self.drive();
        if let Err(e) = &result {
            if !matches!(e, EngineError::Transport(_)) {
                self.acknowledge_shutdown();
            }
        }
        result
    }

    fn drive(&mut self) -> Result<WorkerExit, EngineError> {
        self.reset_scratch()?;
        info!(
            "Initialized on {}, in {}",
            self.ctx.hostname,
            self.scratch.display()
        );

        let mut previous: Option<PathBuf> = None;
        loop {
            if self.termination.is_raised() {
                return self.interrupt();
            }

            self.transition(WorkerState::Fetching);
            debug!("Worker sends DONE");
            self.ctx.transport.send(
                COORDINATOR_RANK,
                Message::Done {
                    previous: previous.take(),
                },
            )?;
            let reply = self
                .ctx
                .transport
                .recv(COORDINATOR_RANK, MessageKind::Inputs)?;

            let unit = match reply {
                Message::Inputs(Assignment::Unit(unit)) => unit,
                Message::Inputs(Assignment::Shutdown) => return self.retire(),
                other => {
                    return Err(EngineError::Internal(format!(
                        "expected INPUTS, received {}",
                        other.kind()
                    )));
                }
            };

            info!("Worker reinitializing for {}", unit);
            match self.process(&unit) {
                Ok(UnitOutcome::Completed) => {
                    self.stats.completed += 1;
                    previous = Some(unit.archive().to_path_buf());
                    self.transition(WorkerState::Idle);
                }
                Ok(UnitOutcome::Interrupted) => return Ok(WorkerExit::Interrupted),
                Err(e @ EngineError::UnitFailed { .. }) => {
                    self.stats.failed += 1;
                    error!("{}", e);
                    if self.termination.is_raised() {
                        return self.interrupt();
                    }
                    self.engine = None;
                    if !self.config.tolerate_failures {
                        return Err(e);
                    }
                    warn!("Abandoning {} and fetching the next unit", unit.name());
                    self.transition(WorkerState::Idle);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn process(&mut self, unit: &WorkUnit) -> Result<UnitOutcome, EngineError> {
        let rank = self.rank();
        let failed = |source: Box<dyn std::error::Error + Send + Sync>| EngineError::UnitFailed {
            unit: unit.name(),
            rank,
            source,
        };

        self.reset_scratch()?;
        self.transition(WorkerState::Unpacking);
        {
            let mut gate = TicketGate {
                transport: &mut self.ctx.transport,
            };
            let _ticket = TicketGuard::acquire(&mut gate)?;
            let start = Instant::now();
            let bytes = archive::unpack(&unit.input, &self.scratch).map_err(|e| failed(e.into()))?;
            archive::log_transfer(&unit.input.display().to_string(), bytes, start.elapsed());
        }

        let mut step = self
            .factory
            .prepare(&self.scratch, unit)
            .map_err(|e| failed(e.into()))?;

        if unit.output.is_none() {
            warn!("No output archive. Appending data to input archive.");
        }
        let mut engine = CheckpointEngine::new(
            &self.scratch,
            unit.archive(),
            &self.config.marker_suffix,
            self.config.checkpoint_interval,
        )
        .with_executable(self.factory.executable());
        if unit.resumes_in_place() {
            engine.seed_from_disk().map_err(|e| failed(e.into()))?;
        }
        self.engine = Some(engine);

        self.transition(WorkerState::Computing);
        debug!("working");
        while !step.is_finished() {
            if self.termination.is_raised() {
                self.interrupt()?;
                return Ok(UnitOutcome::Interrupted);
            }

            if let Err(e) = step.advance() {
                // The signal that raised the flag usually reaches the step's own process too.
                if self.termination.is_raised() {
                    warn!("Step stopped during termination: {}", e);
                    self.interrupt()?;
                    return Ok(UnitOutcome::Interrupted);
                }
                return Err(failed(e.into()));
            }

            if self.engine.as_ref().is_some_and(CheckpointEngine::is_due) {
                self.transition(WorkerState::Checkpointing);
                self.checkpoint()?;
                self.transition(WorkerState::Computing);
            }
        }

        self.transition(WorkerState::Checkpointing);
        self.checkpoint()?;

        self.transition(WorkerState::Reporting);
        self.report(step.as_ref())?;
        Ok(UnitOutcome::Completed)
    }

    fn report(&mut self, step: &dyn ComputeStep) -> Result<(), EngineError> {
        match step.results() {
            Some(row) => {
                self.ctx
                    .transport
                    .send(COORDINATOR_RANK, Message::Results(row))?;
            }
            None => debug!("Unit finished without a result record"),
        }
        Ok(())
    }

    /// Checkpoints the current unit. Archive failures are logged and retried next time; losing
    /// the coordinator is fatal.
    fn checkpoint(&mut self) -> Result<(), EngineError> {
        let Some(engine) = self.engine.as_mut() else {
            return Ok(());
        };
        let mut gate = TicketGate {
            transport: &mut self.ctx.transport,
        };
        match engine.checkpoint(&mut gate) {
            Ok(Some(report)) => {
                debug!("Checkpointed {} file(s)", report.files);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(CheckpointError::Ticket(e)) => Err(e.into()),
            Err(e) => {
                error!(
                    "Exception while appending to {}: {}",
                    engine.archive().display(),
                    e
                );
                Ok(())
            }
        }
    }

    /// Best-effort: a failure is logged, never propagated.
    fn final_checkpoint(&mut self) {
        debug!("Create last backup ...");
        if let Err(e) = self.checkpoint() {
            error!("Could not store before exiting: {}", e);
        }
    }

    fn acknowledge_shutdown(&mut self) {
        debug!("Tell coordinator that we exited...");
        if let Err(e) = self.ctx.transport.send(COORDINATOR_RANK, Message::Shutdown) {
            error!("Failed to acknowledge shutdown: {}", e);
        }
    }

    fn retire(&mut self) -> Result<WorkerExit, EngineError> {
        self.transition(WorkerState::ShuttingDown);
        debug!("Worker {} got shutdown signal!", self.rank());
        self.final_checkpoint();
        self.acknowledge_shutdown();

        if !self.config.keep_scratch {
            if let Err(e) = remove_dir_if_present(&self.scratch) {
                warn!(
                    "Could not remove scratch directory '{}': {}",
                    self.scratch.display(),
                    e
                );
            }
        }
        info!(
            "Retired after {} completed and {} failed unit(s)",
            self.stats.completed, self.stats.failed
        );
        Ok(WorkerExit::Retired)
    }

    fn interrupt(&mut self) -> Result<WorkerExit, EngineError> {
        self.transition(WorkerState::ShuttingDown);
        warn!("Termination requested. Creating backup");
        self.final_checkpoint();
        self.acknowledge_shutdown();
        warn!("Backup done. Unwinding.");
        Ok(WorkerExit::Interrupted)
    }

    fn reset_scratch(&self) -> Result<(), EngineError> {
        let scratch_err = |source| EngineError::Scratch {
            path: self.scratch.clone(),
            source,
        };
        remove_dir_if_present(&self.scratch).map_err(scratch_err)?;
        std::fs::create_dir_all(&self.scratch).map_err(scratch_err)?;
        Ok(())
    }
}

fn remove_dir_if_present(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
