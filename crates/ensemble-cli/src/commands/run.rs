use crate::cli::RunArgs;
use crate::config::{FleetMode, RunConfig, build_run_config};
use crate::error::{CliError, Result};
use crate::launcher::{LaunchPlan, WorkerProcesses};
use crate::simulation::{QdynFactory, summary_schema};
use crate::utils::progress::CliProgressHandler;
use cadee_ensemble::core::io::scan::{prioritize, scan_simpacks};
use cadee_ensemble::core::io::scratch;
use cadee_ensemble::core::io::sink::{ResultSink, backup_existing, open_sink};
use cadee_ensemble::core::models::ids::COORDINATOR_RANK;
use cadee_ensemble::core::models::unit::WorkUnit;
use cadee_ensemble::core::transport::TcpTransport;
use cadee_ensemble::engine::context::FleetContext;
use cadee_ensemble::engine::coordinator::{Coordinator, FleetOutcome, FleetSummary};
use cadee_ensemble::engine::progress::ProgressReporter;
use cadee_ensemble::engine::queue::WorkQueue;
use cadee_ensemble::engine::termination::TerminationFlag;
use cadee_ensemble::workflows::local::{LocalFleet, run_local_fleet};
use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long spawned workers get to exit after the coordinator is done with them.
const REAP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RunOptions {
    pub verbosity: u8,
    pub quiet: bool,
    pub termination: TerminationFlag,
}

pub async fn run(args: RunArgs, options: RunOptions) -> Result<()> {
    let config = build_run_config(&args)?;
    info!(
        "Fleet '{}': {} worker(s), mode {:?}, scratch root {}",
        config.fleet_id,
        config.workers,
        config.mode,
        config.scratch_root.display()
    );

    let units = discover_units(&config.simpack_dir)?;
    if units.is_empty() {
        warn!(
            "No simulation packages found in {}",
            config.simpack_dir.display()
        );
        println!("Nothing to do: no *.tar packages found.");
        return Ok(());
    }
    println!(
        "Queued {} simulation package(s) from {}",
        units.len(),
        config.simpack_dir.display()
    );

    if config.fresh_db {
        if let Some(backup) = backup_existing(&config.database)? {
            println!("Moved previous results to {}", backup.display());
        }
    }
    let sink = open_sink(&config.database, summary_schema(), config.commit_interval)?;
    info!("Storing results in {}", config.database.display());

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    let summary = match config.mode {
        FleetMode::InProcess => run_in_process(&config, units, sink, reporter, &options)?,
        FleetMode::Spawn | FleetMode::External => {
            run_over_tcp(&config, units, sink, reporter, &options)?
        }
    };

    print_summary(&summary, &config.database);
    match summary.outcome {
        FleetOutcome::Completed => Ok(()),
        FleetOutcome::Aborted { live_workers } => Err(CliError::Other(anyhow::anyhow!(
            "fleet aborted with {} worker(s) still running",
            live_workers
        ))),
    }
}

/// Scans `dir` and orders the packages for dispatch. Each package is resumed in place.
pub fn discover_units(dir: &Path) -> Result<Vec<WorkUnit>> {
    let packs = prioritize(scan_simpacks(dir)?);
    Ok(packs.into_iter().map(WorkUnit::new).collect())
}

fn run_in_process(
    config: &RunConfig,
    units: Vec<WorkUnit>,
    sink: Box<dyn ResultSink>,
    reporter: ProgressReporter<'static>,
    options: &RunOptions,
) -> Result<FleetSummary> {
    let factory = QdynFactory::new(
        &config.simulation.executable,
        config.worker.marker_suffix.clone(),
    )
    .map_err(|e| CliError::Config(e.to_string()))?;

    let fleet = LocalFleet {
        units,
        workers: config.workers,
        coordinator: config.coordinator.clone(),
        worker: config.worker.clone(),
        scratch_root: config.scratch_root.clone(),
        fleet_id: config.fleet_id.clone(),
        termination: options.termination.clone(),
    };

    let report = tokio::task::block_in_place(|| {
        run_local_fleet(fleet, |_| factory.clone(), sink, reporter)
    })?;
    for (rank, exit) in &report.workers {
        match exit {
            Ok(exit) => info!("Worker {} finished: {:?}", rank, exit),
            Err(e) => error!("Worker {} failed: {}", rank, e),
        }
    }
    Ok(report.summary)
}

fn run_over_tcp(
    config: &RunConfig,
    units: Vec<WorkUnit>,
    sink: Box<dyn ResultSink>,
    reporter: ProgressReporter<'static>,
    options: &RunOptions,
) -> Result<FleetSummary> {
    let listener = TcpListener::bind(&config.listen)?;
    let address = listener.local_addr()?;
    let size = config.workers + 1;

    let mut processes = match config.mode {
        FleetMode::Spawn => {
            let plan = LaunchPlan {
                program: std::env::current_exe()?,
                coordinator: address,
                size,
                fleet_id: config.fleet_id.clone(),
                scratch_root: config.scratch_root.clone(),
                executable: config.simulation.executable.clone(),
                worker: config.worker.clone(),
                verbosity: options.verbosity,
                quiet: options.quiet,
            };
            let processes = WorkerProcesses::spawn(&plan)?;
            println!(
                "Started {} worker process(es); coordinator listening on {}",
                processes.len(),
                address
            );
            Some(processes)
        }
        _ => {
            println!(
                "Waiting for {} worker(s) on {}. Start each with:\n  cadee-ensemble worker --connect {} --rank <1..{}> --size {} --fleet-id {}",
                config.workers,
                address,
                address,
                config.workers,
                size,
                config.fleet_id
            );
            None
        }
    };

    let summary = tokio::task::block_in_place(|| -> Result<FleetSummary> {
        let transport = TcpTransport::serve(listener, config.workers, config.accept_timeout)?;
        let coordinator = Coordinator::new(
            FleetContext::new(transport, config.fleet_id.clone()),
            config.coordinator.clone(),
            WorkQueue::from_prioritized(units),
            sink,
            options.termination.clone(),
        )?
        .with_progress(reporter)
        .with_scratch(scratch::rank_dir(
            &config.scratch_root,
            &config.fleet_id,
            COORDINATOR_RANK,
        ));
        coordinator.run().map_err(CliError::from)
    });

    if let Some(processes) = processes.as_mut() {
        match &summary {
            Ok(summary) if summary.is_success() => {
                let failed = tokio::task::block_in_place(|| processes.wait_all(REAP_TIMEOUT));
                if !failed.is_empty() {
                    warn!("Worker process(es) {:?} did not exit cleanly", failed);
                }
            }
            _ => processes.kill_all(),
        }
    }
    summary
}

fn print_summary(summary: &FleetSummary, database: &Path) {
    println!(
        "Dispatched {} unit(s): {} completed, {} abandoned, {} result row(s) stored in {}.",
        summary.units_dispatched,
        summary.units_completed,
        summary.units_abandoned,
        summary.results_stored,
        database.display()
    );
    println!(
        "Total wall time: {:.1}s",
        summary.elapsed.as_secs_f64()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadee_ensemble::core::io::archive::{ArchiveAppender, list_entries};
    use serial_test::serial;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn pack(dir: &Path, name: &str, files: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut appender = ArchiveAppender::open(&path).unwrap();
        for file in files {
            let source = dir.join(format!(".staging-{file}"));
            fs::write(&source, format!("{file}\n")).unwrap();
            appender.append_file(&source, file).unwrap();
            fs::remove_file(&source).unwrap();
        }
        appender.finish().unwrap();
        path
    }

    #[test]
    fn discover_units_orders_by_replica_tier() {
        let dir = tempdir().unwrap();
        for name in ["a_1.tar", "b_0.tar", "wt.tar", "a_0.tar"] {
            pack(dir.path(), name, &["1_eq.inp"]);
        }
        let names: Vec<String> = discover_units(dir.path())
            .unwrap()
            .iter()
            .map(WorkUnit::name)
            .collect();
        assert_eq!(names, vec!["a_0", "b_0", "a_1", "wt"]);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[serial]
    async fn in_process_run_completes_every_package_and_stores_results() {
        use std::os::unix::fs::PermissionsExt;

        let bin = tempdir().unwrap();
        let exe = bin.path().join("fake_qdyn");
        fs::write(&exe, "#!/bin/sh\necho \"ran $1\"\n").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();

        let packs = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        for name in ["m1_0.tar", "m2_0.tar", "m1_1.tar"] {
            pack(packs.path(), name, &["1_eq.inp", "2_fep.inp"]);
        }

        let args = RunArgs {
            simpack_dir: packs.path().to_path_buf(),
            workers: Some(2),
            in_process: true,
            scratch_dir: Some(scratch.path().to_path_buf()),
            fleet_id: Some("test-fleet".to_string()),
            executable: Some(exe.to_string_lossy().into_owned()),
            database: Some(packs.path().join("results.csv")),
            ..Default::default()
        };
        let options = RunOptions {
            verbosity: 0,
            quiet: true,
            termination: TerminationFlag::new(),
        };
        run(args, options).await.expect("fleet completes");

        for name in ["m1_0.tar", "m2_0.tar", "m1_1.tar"] {
            let entries = list_entries(&packs.path().join(name)).unwrap();
            assert!(entries.iter().any(|e| e == "1_eq.log.zst"), "{name}: {entries:?}");
            assert!(entries.iter().any(|e| e == "2_fep.log.zst"), "{name}: {entries:?}");
            assert!(!entries.iter().any(|e| e == "fake_qdyn"));
        }

        let csv = fs::read_to_string(packs.path().join("results.csv")).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("time,mutant,replik,name,steps,steps_run,wall_seconds")
        );
        assert_eq!(lines.count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_directories_are_not_an_error() {
        let packs = tempdir().unwrap();
        let args = RunArgs {
            simpack_dir: packs.path().to_path_buf(),
            workers: Some(1),
            in_process: true,
            ..Default::default()
        };
        let options = RunOptions {
            verbosity: 0,
            quiet: true,
            termination: TerminationFlag::new(),
        };
        run(args, options).await.expect("nothing to do");
        assert!(!packs.path().join("cadee.db").exists());
    }
}
