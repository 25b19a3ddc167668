use super::defaults::DefaultsConfig;
use super::file::FileConfig;
use super::models::{FleetMode, RunConfig, SimulationConfig, WorkerProcessConfig};
use crate::cli::{RunArgs, WorkerArgs};
use crate::error::{CliError, Result};
use cadee_ensemble::core::io::scratch;
use cadee_ensemble::engine::config::{
    CoordinatorConfigBuilder, WorkerConfig, WorkerConfigBuilder,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub fn build_run_config(args: &RunArgs) -> Result<RunConfig> {
    let defaults = DefaultsConfig::default();
    let file_config = load_file_config(args.config.as_deref())?;
    let mut file_config = apply_set_values(file_config, &args.set_values)?;

    let fleet_file = file_config.fleet.take().unwrap_or_default();
    let workers = args
        .workers
        .or(fleet_file.workers)
        .unwrap_or(defaults.workers);
    if workers == 0 {
        return Err(CliError::Argument(
            "a fleet needs at least one worker".to_string(),
        ));
    }

    let mode = if args.in_process {
        FleetMode::InProcess
    } else if args.no_spawn {
        FleetMode::External
    } else if fleet_file.in_process.unwrap_or(defaults.in_process) {
        FleetMode::InProcess
    } else if fleet_file.spawn.unwrap_or(defaults.spawn) {
        FleetMode::Spawn
    } else {
        FleetMode::External
    };

    let listen = args
        .listen
        .clone()
        .or(fleet_file.listen)
        .unwrap_or_else(|| defaults.listen.clone());
    let accept_timeout = fleet_file
        .accept_timeout
        .map(Duration::from_secs)
        .unwrap_or(defaults.accept_timeout);
    let scratch_root = resolve_scratch(args.scratch_dir.clone().or(fleet_file.scratch_dir));
    let fleet_id = args
        .fleet_id
        .clone()
        .unwrap_or_else(|| std::process::id().to_string());

    let results_file = file_config.results.take().unwrap_or_default();
    let database = args
        .database
        .clone()
        .or(results_file.database)
        .unwrap_or_else(|| args.simpack_dir.join(&defaults.database_name));
    let fresh_db = args.fresh_db || results_file.fresh.unwrap_or(defaults.fresh_db);
    let commit_interval = results_file
        .commit_interval
        .map(Duration::from_secs)
        .unwrap_or(defaults.commit_interval);

    let coordinator_file = file_config.coordinator.take().unwrap_or_default();
    let mut coordinator = CoordinatorConfigBuilder::new()
        .poll_interval(
            coordinator_file
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        )
        .shutdown_grace(
            coordinator_file
                .shutdown_grace
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
        )
        .idle_report(
            coordinator_file
                .idle_report_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_report),
        );
    if let Some(tickets) = args.io_tickets.or(coordinator_file.io_tickets) {
        coordinator = coordinator.io_tickets(tickets);
    }
    let coordinator = coordinator
        .build()
        .map_err(|e| CliError::Config(e.to_string()))?;

    let worker = build_worker_section(&mut file_config, args.checkpoint_interval, &defaults)?;
    let simulation = build_simulation_section(&mut file_config, args.executable.as_deref(), &defaults);

    Ok(RunConfig {
        simpack_dir: args.simpack_dir.clone(),
        workers,
        mode,
        listen,
        accept_timeout,
        scratch_root,
        fleet_id,
        database,
        fresh_db,
        commit_interval,
        simulation,
        worker,
        coordinator,
    })
}

pub fn build_worker_config(args: &WorkerArgs) -> Result<WorkerProcessConfig> {
    let defaults = DefaultsConfig::default();
    let file_config = load_file_config(args.config.as_deref())?;
    let mut file_config = apply_set_values(file_config, &args.set_values)?;

    if args.rank == 0 || args.rank >= args.size {
        return Err(CliError::Argument(format!(
            "worker rank {} is outside 1..{}",
            args.rank, args.size
        )));
    }

    let fleet_file = file_config.fleet.take().unwrap_or_default();
    let connect_timeout = fleet_file
        .connect_timeout
        .map(Duration::from_secs)
        .unwrap_or(defaults.connect_timeout);
    let scratch_root = resolve_scratch(args.scratch_dir.clone().or(fleet_file.scratch_dir));

    let worker = build_worker_section(&mut file_config, args.checkpoint_interval, &defaults)?;
    let simulation = build_simulation_section(&mut file_config, args.executable.as_deref(), &defaults);

    Ok(WorkerProcessConfig {
        connect: args.connect.clone(),
        rank: args.rank,
        size: args.size,
        fleet_id: args
            .fleet_id
            .clone()
            .unwrap_or(defaults.worker_fleet_id),
        connect_timeout,
        scratch_root,
        simulation,
        worker,
    })
}

fn load_file_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => FileConfig::from_file(path),
        None => Ok(FileConfig::default()),
    }
}

fn resolve_scratch(dir: Option<PathBuf>) -> PathBuf {
    match dir {
        Some(dir) => dir,
        None => scratch::scratch_root(),
    }
}

fn build_worker_section(
    file_config: &mut FileConfig,
    checkpoint_interval: Option<u64>,
    defaults: &DefaultsConfig,
) -> Result<WorkerConfig> {
    let worker_file = file_config.worker.take().unwrap_or_default();
    WorkerConfigBuilder::new()
        .checkpoint_interval(
            checkpoint_interval
                .or(worker_file.checkpoint_interval)
                .map(Duration::from_secs)
                .unwrap_or(defaults.checkpoint_interval),
        )
        .marker_suffix(
            worker_file
                .marker_suffix
                .unwrap_or_else(|| defaults.marker_suffix.clone()),
        )
        .tolerate_failures(
            worker_file
                .tolerate_failures
                .unwrap_or(defaults.tolerate_failures),
        )
        .keep_scratch(worker_file.keep_scratch.unwrap_or(defaults.keep_scratch))
        .build()
        .map_err(|e| CliError::Config(e.to_string()))
}

fn build_simulation_section(
    file_config: &mut FileConfig,
    executable: Option<&str>,
    defaults: &DefaultsConfig,
) -> SimulationConfig {
    let simulation_file = file_config.simulation.take().unwrap_or_default();
    SimulationConfig {
        executable: executable
            .map(str::to_string)
            .or(simulation_file.executable)
            .unwrap_or_else(|| defaults.executable.clone()),
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str, kind: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CliError::Config(format!("Invalid {} value for {}: {}", kind, key, value)))
}

fn apply_set_values(mut config: FileConfig, set_values: &[String]) -> Result<FileConfig> {
    if set_values.is_empty() {
        return Ok(config);
    }
    for kv_pair in set_values {
        let Some((key, value_str)) = kv_pair.split_once('=') else {
            return Err(CliError::Config(format!(
                "Invalid --set format: '{}'. Expected KEY=VALUE.",
                kv_pair
            )));
        };

        match key {
            "fleet.workers" => {
                config.fleet.get_or_insert_with(Default::default).workers =
                    Some(parse_value(key, value_str, "integer")?);
            }
            "fleet.listen" => {
                config.fleet.get_or_insert_with(Default::default).listen =
                    Some(value_str.to_string());
            }
            "fleet.spawn" => {
                config.fleet.get_or_insert_with(Default::default).spawn =
                    Some(parse_value(key, value_str, "boolean")?);
            }
            "fleet.in-process" => {
                config.fleet.get_or_insert_with(Default::default).in_process =
                    Some(parse_value(key, value_str, "boolean")?);
            }
            "fleet.scratch-dir" => {
                config.fleet.get_or_insert_with(Default::default).scratch_dir =
                    Some(PathBuf::from(value_str));
            }
            "fleet.accept-timeout" => {
                config
                    .fleet
                    .get_or_insert_with(Default::default)
                    .accept_timeout = Some(parse_value(key, value_str, "integer")?);
            }
            "fleet.connect-timeout" => {
                config
                    .fleet
                    .get_or_insert_with(Default::default)
                    .connect_timeout = Some(parse_value(key, value_str, "integer")?);
            }
            "worker.checkpoint-interval" => {
                config
                    .worker
                    .get_or_insert_with(Default::default)
                    .checkpoint_interval = Some(parse_value(key, value_str, "integer")?);
            }
            "worker.marker-suffix" => {
                config
                    .worker
                    .get_or_insert_with(Default::default)
                    .marker_suffix = Some(value_str.to_string());
            }
            "worker.tolerate-failures" => {
                config
                    .worker
                    .get_or_insert_with(Default::default)
                    .tolerate_failures = Some(parse_value(key, value_str, "boolean")?);
            }
            "worker.keep-scratch" => {
                config
                    .worker
                    .get_or_insert_with(Default::default)
                    .keep_scratch = Some(parse_value(key, value_str, "boolean")?);
            }
            "coordinator.poll-interval-ms" => {
                config
                    .coordinator
                    .get_or_insert_with(Default::default)
                    .poll_interval_ms = Some(parse_value(key, value_str, "integer")?);
            }
            "coordinator.shutdown-grace" => {
                config
                    .coordinator
                    .get_or_insert_with(Default::default)
                    .shutdown_grace = Some(parse_value(key, value_str, "integer")?);
            }
            "coordinator.io-tickets" => {
                config
                    .coordinator
                    .get_or_insert_with(Default::default)
                    .io_tickets = Some(parse_value(key, value_str, "integer")?);
            }
            "coordinator.idle-report-ms" => {
                config
                    .coordinator
                    .get_or_insert_with(Default::default)
                    .idle_report_ms = Some(parse_value(key, value_str, "integer")?);
            }
            "results.database" => {
                config
                    .results
                    .get_or_insert_with(Default::default)
                    .database = Some(PathBuf::from(value_str));
            }
            "results.fresh" => {
                config.results.get_or_insert_with(Default::default).fresh =
                    Some(parse_value(key, value_str, "boolean")?);
            }
            "results.commit-interval" => {
                config
                    .results
                    .get_or_insert_with(Default::default)
                    .commit_interval = Some(parse_value(key, value_str, "integer")?);
            }
            "simulation.executable" => {
                config
                    .simulation
                    .get_or_insert_with(Default::default)
                    .executable = Some(value_str.to_string());
            }
            _ => {
                return Err(CliError::Config(format!(
                    "Unsupported configuration key for --set: '{}'",
                    key
                )));
            }
        }
    }
    Ok(config)
}
