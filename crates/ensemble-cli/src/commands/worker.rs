use crate::cli::WorkerArgs;
use crate::config::build_worker_config;
use crate::error::{CliError, Result};
use crate::logging::LogForwarder;
use crate::simulation::QdynFactory;
use cadee_ensemble::core::io::scratch;
use cadee_ensemble::core::transport::{TcpTransport, Transport};
use cadee_ensemble::engine::context::FleetContext;
use cadee_ensemble::engine::termination::TerminationFlag;
use cadee_ensemble::engine::worker::{Worker, WorkerExit};
use tracing::{debug, info, warn};

pub async fn run(
    args: WorkerArgs,
    forwarder: LogForwarder,
    termination: TerminationFlag,
) -> Result<()> {
    let config = build_worker_config(&args)?;
    let factory = QdynFactory::new(
        &config.simulation.executable,
        config.worker.marker_suffix.clone(),
    )
    .map_err(|e| CliError::Config(e.to_string()))?;

    info!(
        "Rank {} of {} connecting to {}, running {}",
        config.rank,
        config.size,
        config.connect,
        factory.program().display()
    );
    let transport = tokio::task::block_in_place(|| {
        TcpTransport::connect(
            config.connect.as_str(),
            config.rank,
            config.size,
            config.connect_timeout,
        )
    })?;
    if forwarder.is_attached() {
        debug!("Log forwarding already attached");
    } else if forwarder.attach(transport.outbox()) {
        debug!("Forwarding log output to the coordinator");
    }

    let scratch_dir = scratch::rank_dir(&config.scratch_root, &config.fleet_id, config.rank);
    let worker = Worker::new(
        FleetContext::new(transport, config.fleet_id.clone()),
        factory,
        config.worker,
        scratch_dir,
        termination,
    );
    let exit = tokio::task::block_in_place(|| worker.run())?;
    match exit {
        WorkerExit::Retired => info!("Rank {} retired", config.rank),
        WorkerExit::Interrupted => warn!("Rank {} stopped on a termination request", config.rank),
    }
    Ok(())
}
