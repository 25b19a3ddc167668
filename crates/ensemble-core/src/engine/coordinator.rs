use super::config::CoordinatorConfig;
use super::context::FleetContext;
use super::error::EngineError;
use super::progress::{Progress, ProgressReporter};
use super::queue::WorkQueue;
use super::termination::TerminationFlag;
use super::tickets::{TicketPool, capacity_for};
use crate::core::io::sink::{ResultSink, SinkError};
use crate::core::models::ids::Rank;
use crate::core::models::results::ResultTuple;
use crate::core::models::unit::{Assignment, WorkUnit};
use crate::core::transport::{Envelope, Message, Transport, TransportError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Remote log lines are re-emitted under this target.
pub const REMOTE_LOG_TARGET: &str = "cadee::remote";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    ShuttingDown { deadline: Instant },
    Draining,
    Terminated,
}

/// Coordinator-side bookkeeping for one worker rank.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub rank: Rank,
    pub alive: bool,
    pub assigned: Option<WorkUnit>,
    pub completed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetOutcome {
    /// Every worker acknowledged shutdown.
    Completed,
    /// The shutdown grace period ran out and the fleet was aborted.
    Aborted { live_workers: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetSummary {
    pub outcome: FleetOutcome,
    pub units_dispatched: usize,
    pub units_completed: usize,
    pub units_abandoned: usize,
    pub results_stored: usize,
    pub elapsed: Duration,
}

impl FleetSummary {
    pub fn is_success(&self) -> bool {
        self.outcome == FleetOutcome::Completed
    }
}

pub struct Coordinator<'a, T: Transport, S: ResultSink> {
    ctx: FleetContext<T>,
    config: CoordinatorConfig,
    queue: WorkQueue,
    tickets: TicketPool,
    sink: S,
    workers: BTreeMap<Rank, WorkerHandle>,
    state: CoordinatorState,
    termination: TerminationFlag,
    progress: ProgressReporter<'a>,
    scratch: Option<PathBuf>,
    started: Instant,
    dispatched: usize,
    completed: usize,
    abandoned: usize,
    stored: usize,
}

impl<'a, T: Transport, S: ResultSink> Coordinator<'a, T, S> {
    pub fn new(
        ctx: FleetContext<T>,
        config: CoordinatorConfig,
        queue: WorkQueue,
        sink: S,
        termination: TerminationFlag,
    ) -> Result<Self, EngineError> {
        let workers = ctx.workers();
        if workers == 0 {
            return Err(EngineError::NoWorkers);
        }
        let capacity = config.io_tickets.unwrap_or_else(|| capacity_for(workers));

        Ok(Self {
            workers: (1..=workers)
                .map(|rank| {
                    (
                        rank,
                        WorkerHandle {
                            rank,
                            alive: true,
                            assigned: None,
                            completed: 0,
                        },
                    )
                })
                .collect(),
            ctx,
            config,
            queue,
            tickets: TicketPool::new(capacity),
            sink,
            state: CoordinatorState::Running,
            termination,
            progress: ProgressReporter::new(),
            scratch: None,
            started: Instant::now(),
            dispatched: 0,
            completed: 0,
            abandoned: 0,
            stored: 0,
        })
    }

    pub fn with_progress(mut self, progress: ProgressReporter<'a>) -> Self {
        self.progress = progress;
        self
    }

    /// A rank-0 working directory created on start and removed on exit.
    pub fn with_scratch(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch = Some(dir.into());
        self
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn live_workers(&self) -> usize {
        self.workers.values().filter(|w| w.alive).count()
    }

    /// Serves the fleet until every worker retired or the shutdown grace period expired.
    #[instrument(name = "rank", skip_all, fields(id = self.ctx.rank()))]
    pub fn run(mut self) -> Result<FleetSummary, EngineError> {
        if let Some(dir) = &self.scratch {
            std::fs::create_dir_all(dir).map_err(|source| EngineError::Scratch {
                path: dir.clone(),
                source,
            })?;
        }
        info!(
            "Coordinator on {} serving {} unit(s) to {} worker(s) with {} I/O ticket(s)",
            self.ctx.hostname,
            self.queue.len(),
            self.workers.len(),
            self.tickets.capacity()
        );
        self.progress.report(Progress::FleetStart {
            total_units: self.queue.len() as u64,
            workers: self.workers.len(),
        });

        let result = self.serve();
        if result.is_err() {
            self.ctx.transport.abort(1);
        }
        self.shutdown();
        let outcome = result?;

        Ok(FleetSummary {
            outcome,
            units_dispatched: self.dispatched,
            units_completed: self.completed,
            units_abandoned: self.abandoned,
            results_stored: self.stored,
            elapsed: self.started.elapsed(),
        })
    }

    fn serve(&mut self) -> Result<FleetOutcome, EngineError> {
        let mut idle = Duration::ZERO;
        loop {
            if self.termination.is_raised() && self.state == CoordinatorState::Running {
                self.begin_shutdown();
            }

            let live = self.live_workers();
            if live == 0 {
                self.state = CoordinatorState::Draining;
                let leftover = self.queue.clear();
                if !leftover.is_empty() {
                    error!(
                        "No live workers left; {} unit(s) were never dispatched",
                        leftover.len()
                    );
                    self.abandoned += leftover.len();
                    self.progress.report(Progress::Message(format!(
                        "{} unit(s) left without workers",
                        leftover.len()
                    )));
                }
                return Ok(FleetOutcome::Completed);
            }

            if let CoordinatorState::ShuttingDown { deadline } = self.state {
                if Instant::now() >= deadline {
                    warn!("... Timeout! {} worker(s) still alive", live);
                    self.progress.report(Progress::Message(format!(
                        "Grace period expired with {} worker(s) alive, aborting",
                        live
                    )));
                    self.ctx.transport.abort(1);
                    self.abandoned += self
                        .workers
                        .values()
                        .filter(|w| w.assigned.is_some())
                        .count();
                    return Ok(FleetOutcome::Aborted { live_workers: live });
                }
            }

            let polled = match self.ctx.transport.poll(self.config.poll_interval) {
                Err(TransportError::PeerLost { rank }) => {
                    self.on_lost(rank);
                    continue;
                }
                other => other?,
            };
            match polled {
                Some(envelope) => {
                    if idle > self.config.idle_report {
                        info!(
                            "Slept for {:.1} seconds",
                            (idle - self.config.idle_report).as_secs_f64()
                        );
                    }
                    idle = Duration::ZERO;
                    self.dispatch(envelope)?;
                }
                None => {
                    let before = idle;
                    idle += self.config.poll_interval;
                    if before < self.config.idle_report && idle >= self.config.idle_report {
                        info!(
                            "Sleeping @ {:.1} s",
                            self.started.elapsed().as_secs_f64()
                        );
                    }
                    self.grant_tickets();
                }
            }
        }
    }

    fn dispatch(&mut self, envelope: Envelope) -> Result<(), EngineError> {
        let source = envelope.source;
        let kind = envelope.kind();
        if !self.workers.get(&source).is_some_and(|w| w.alive) {
            error!("Got {} from rank {}, which is not a live worker", kind, source);
            return Ok(());
        }

        match envelope.message {
            Message::Done { previous } => self.on_done(source, previous),
            Message::Results(row) => self.on_results(source, row),
            Message::Log(line) => {
                info!(target: REMOTE_LOG_TARGET, "{}", line.trim_end());
            }
            Message::Shutdown => self.on_shutdown(source),
            Message::IoRequest => {
                self.tickets.request(source);
                self.grant_tickets();
            }
            Message::IoFinished => {
                self.tickets.release(source);
                self.grant_tickets();
            }
            Message::Inputs(_) | Message::IoTicket => {
                error!("Protocol violation: rank {} sent {}", source, kind);
            }
        }
        Ok(())
    }

    fn on_done(&mut self, source: Rank, previous: Option<PathBuf>) {
        debug!("recv DONE from {}", source);
        if let Some(handle) = self.workers.get_mut(&source) {
            match (handle.assigned.take(), previous) {
                (Some(_), Some(archive)) => {
                    handle.completed += 1;
                    self.completed += 1;
                    debug!("Rank {} finished {}", source, archive.display());
                    self.progress.report(Progress::UnitCompleted { rank: source });
                }
                (Some(unit), None) => {
                    warn!("Rank {} abandoned {}", source, unit.name());
                    self.abandoned += 1;
                    self.progress.report(Progress::UnitAbandoned {
                        rank: source,
                        name: unit.name(),
                    });
                }
                (None, Some(archive)) => {
                    warn!(
                        "Rank {} reported {} without holding an assignment",
                        source,
                        archive.display()
                    );
                }
                (None, None) => {}
            }
        }

        let assignment = match self.queue.pop() {
            Some(unit) => {
                let name = unit.name();
                if let Some(handle) = self.workers.get_mut(&source) {
                    handle.assigned = Some(unit.clone());
                }
                self.dispatched += 1;
                self.progress
                    .report(Progress::UnitDispatched { rank: source, name });
                Assignment::Unit(unit)
            }
            None => {
                info!("Send SHUTDOWN to {}", source);
                Assignment::Shutdown
            }
        };

        self.send_or_drop(source, Message::Inputs(assignment));

        info!("Number of jobs left on queue: {}", self.queue.len());
        if self.queue.len() < 10 {
            debug!("Jobs left (list): {:?}", self.queue.pending_names());
        }
    }

    fn on_results(&mut self, source: Rank, row: ResultTuple) {
        match self.sink.insert(&row) {
            Ok(()) => self.stored += 1,
            Err(e @ SinkError::Arity { .. }) => {
                error!("Unable to store row from rank {}: {}", source, e);
                error!("Row: {:?}", row.values());
            }
            Err(e) => error!("Result sink rejected row from rank {}: {}", source, e),
        }
    }

    fn on_shutdown(&mut self, source: Rank) {
        let Some(handle) = self.workers.get_mut(&source) else {
            return;
        };
        handle.alive = false;
        if let Some(unit) = handle.assigned.take() {
            warn!("Rank {} stopped while holding {}", source, unit.name());
            self.abandoned += 1;
        }
        self.tickets.forget(source);

        let remaining = self.live_workers();
        info!(
            "Worker {} was removed from worker-list: There are {} (out of {}) left...",
            source,
            remaining,
            self.workers.len()
        );
        self.progress.report(Progress::WorkerRetired {
            rank: source,
            remaining,
        });
    }

    /// A worker whose link closed is retired as if it had acknowledged shutdown.
    fn on_lost(&mut self, rank: Rank) {
        if self.workers.get(&rank).is_some_and(|w| w.alive) {
            error!("Lost connection to rank {} before it acknowledged shutdown", rank);
            self.on_shutdown(rank);
        } else {
            debug!("Rank {} closed its connection", rank);
        }
    }

    fn grant_tickets(&mut self) {
        for rank in self.tickets.service() {
            self.send_or_drop(rank, Message::IoTicket);
        }
    }

    /// Sends to one worker; a worker that cannot be reached is treated as gone.
    fn send_or_drop(&mut self, dest: Rank, message: Message) {
        let kind = message.kind();
        if let Err(e) = self.ctx.transport.send(dest, message) {
            error!("Failed to send {} to rank {}: {}. Dropping it.", kind, dest, e);
            self.on_shutdown(dest);
        }
    }

    fn begin_shutdown(&mut self) {
        warn!("Termination requested.");
        let abandoned = self.queue.clear();
        if !abandoned.is_empty() {
            let names: Vec<String> = abandoned.iter().map(WorkUnit::name).collect();
            warn!(
                "Following simpacks have been removed unfinished from the queue: {}, items: {:?}",
                abandoned.len(),
                names
            );
        }
        self.abandoned += abandoned.len();
        self.progress.report(Progress::ShutdownRequested {
            abandoned: abandoned.len(),
        });

        warn!(
            "Waiting up to {}s for workers to shut down...",
            self.config.shutdown_grace.as_secs()
        );
        self.state = CoordinatorState::ShuttingDown {
            deadline: Instant::now() + self.config.shutdown_grace,
        };
    }

    fn shutdown(&mut self) {
        info!("Preparing to end this simulation! Syncing...");
        match self.sink.close() {
            Ok(()) => info!("Result sink closed."),
            Err(e) => error!("Failed to close result sink: {}", e),
        }
        if let Some(dir) = &self.scratch {
            info!("Removing temporary files...");
            if let Err(e) = std::fs::remove_dir_all(dir) {
                warn!("Could not remove '{}': {}", dir.display(), e);
            }
        }
        self.state = CoordinatorState::Terminated;
        self.progress.report(Progress::FleetFinish);
        info!(
            "Total wall time: {:.1}s",
            self.started.elapsed().as_secs_f64()
        );
    }
}
