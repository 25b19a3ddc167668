use crate::core::io::scratch;
use crate::core::io::sink::ResultSink;
use crate::core::models::ids::{COORDINATOR_RANK, Rank};
use crate::core::models::unit::WorkUnit;
use crate::core::transport::{LocalFabric, Transport};
use crate::engine::config::{CoordinatorConfig, WorkerConfig};
use crate::engine::context::FleetContext;
use crate::engine::coordinator::{Coordinator, FleetSummary};
use crate::engine::error::EngineError;
use crate::engine::progress::ProgressReporter;
use crate::engine::queue::WorkQueue;
use crate::engine::step::StepFactory;
use crate::engine::termination::TerminationFlag;
use crate::engine::worker::{Worker, WorkerExit};
use std::path::PathBuf;
use std::thread;
use tracing::{info, instrument};

/// A whole fleet inside one process: the coordinator on the calling thread and one thread per
/// worker.
#[derive(Debug, Clone)]
pub struct LocalFleet {
    /// Units in priority order; the first one is dispatched first.
    pub units: Vec<WorkUnit>,
    pub workers: usize,
    pub coordinator: CoordinatorConfig,
    pub worker: WorkerConfig,
    pub scratch_root: PathBuf,
    pub fleet_id: String,
    pub termination: TerminationFlag,
}

#[derive(Debug)]
pub struct LocalFleetReport {
    pub summary: FleetSummary,
    pub workers: Vec<(Rank, Result<WorkerExit, EngineError>)>,
}

#[instrument(skip_all, name = "local_fleet", fields(workers = fleet.workers, units = fleet.units.len()))]
pub fn run_local_fleet<'p, F, M, S>(
    fleet: LocalFleet,
    mut make_factory: M,
    sink: S,
    progress: ProgressReporter<'p>,
) -> Result<LocalFleetReport, EngineError>
where
    F: StepFactory + Send,
    M: FnMut(Rank) -> F,
    S: ResultSink,
{
    if fleet.workers == 0 {
        return Err(EngineError::NoWorkers);
    }

    let mut endpoints = LocalFabric::new(fleet.workers + 1);
    let coordinator_endpoint = endpoints.remove(COORDINATOR_RANK);
    info!("Starting in-process fleet '{}'", fleet.fleet_id);

    thread::scope(|scope| {
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let rank = endpoint.rank();
                let worker = Worker::new(
                    FleetContext::new(endpoint, fleet.fleet_id.clone()),
                    make_factory(rank),
                    fleet.worker.clone(),
                    scratch::rank_dir(&fleet.scratch_root, &fleet.fleet_id, rank),
                    fleet.termination.clone(),
                );
                let handle = thread::Builder::new()
                    .name(format!("cadee-worker-{rank}"))
                    .spawn_scoped(scope, move || worker.run());
                (rank, handle)
            })
            .collect();

        let coordinator = Coordinator::new(
            FleetContext::new(coordinator_endpoint, fleet.fleet_id.clone()),
            fleet.coordinator.clone(),
            WorkQueue::from_prioritized(fleet.units.clone()),
            sink,
            fleet.termination.clone(),
        );
        let summary = match coordinator {
            Ok(coordinator) => coordinator
                .with_progress(progress)
                .with_scratch(scratch::rank_dir(
                    &fleet.scratch_root,
                    &fleet.fleet_id,
                    COORDINATOR_RANK,
                ))
                .run(),
            Err(e) => Err(e),
        };

        let workers = handles
            .into_iter()
            .map(|(rank, handle)| {
                let exit = match handle {
                    Ok(handle) => handle.join().unwrap_or_else(|_| {
                        Err(EngineError::Internal(format!("worker {rank} panicked")))
                    }),
                    Err(e) => Err(EngineError::Initialization(format!(
                        "could not start worker {rank}: {e}"
                    ))),
                };
                (rank, exit)
            })
            .collect();

        Ok(LocalFleetReport {
            summary: summary?,
            workers,
        })
    })
}
