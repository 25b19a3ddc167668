use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    author = "Tony Kan, Ted Yu, William A. Goddard III, Victor Wai Tak Kam",
    version,
    about = "CADEE ensemble runner - distributes simulation packages over a fleet of worker ranks and checkpoints their progress incrementally.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every simulation package in a directory on a fleet of workers.
    Run(RunArgs),
    /// Serve as one worker rank of a fleet started with `run`.
    Worker(WorkerArgs),
    /// List the packages in a directory in the order `run` would dispatch them.
    Scan(ScanArgs),
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Directory containing the simulation packages (*.tar).
    #[arg(required = true, value_name = "SIMPACK_DIR")]
    pub simpack_dir: PathBuf,

    /// Path to a configuration file in TOML format.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    // --- Fleet ---
    /// Number of worker ranks.
    #[arg(short = 'n', long, value_name = "INT")]
    pub workers: Option<usize>,

    /// Address the coordinator listens on for worker connections.
    #[arg(long, value_name = "HOST:PORT")]
    pub listen: Option<String>,

    /// Wait for externally started workers instead of spawning them.
    #[arg(long, conflicts_with = "in_process")]
    pub no_spawn: bool,

    /// Run the workers as threads of this process.
    #[arg(long)]
    pub in_process: bool,

    /// Scratch root for rank working directories. Defaults to $CADEE_TMP or a system scratch dir.
    #[arg(long, value_name = "DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Identifier shared by all ranks of this fleet. Defaults to the coordinator's process id.
    #[arg(long, value_name = "ID")]
    pub fleet_id: Option<String>,

    // --- Results ---
    /// Result database. A `.csv` extension selects CSV output.
    #[arg(long = "db", value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// Move an existing result database aside before starting.
    #[arg(long)]
    pub fresh_db: bool,

    // --- Worker ---
    /// Simulation executable, resolved through PATH unless it contains a path separator.
    #[arg(short = 'x', long, value_name = "NAME_OR_PATH")]
    pub executable: Option<String>,

    /// Seconds between periodic checkpoints of a running unit.
    #[arg(long, value_name = "SECS")]
    pub checkpoint_interval: Option<u64>,

    /// Number of concurrent shared-storage transfers. Defaults to max(8, workers/16).
    #[arg(long, value_name = "INT")]
    pub io_tickets: Option<usize>,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S worker.checkpoint-interval=300
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `worker` subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct WorkerArgs {
    /// Coordinator address.
    #[arg(long, required = true, value_name = "HOST:PORT")]
    pub connect: String,

    /// This worker's rank, in 1..SIZE.
    #[arg(long, required = true, value_name = "INT")]
    pub rank: usize,

    /// Total number of ranks, coordinator included.
    #[arg(long, required = true, value_name = "INT")]
    pub size: usize,

    /// Identifier shared by all ranks of the fleet.
    #[arg(long, value_name = "ID")]
    pub fleet_id: Option<String>,

    /// Path to a configuration file in TOML format.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Scratch root for this rank's working directory.
    #[arg(long, value_name = "DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Simulation executable, resolved through PATH unless it contains a path separator.
    #[arg(short = 'x', long, value_name = "NAME_OR_PATH")]
    pub executable: Option<String>,

    /// Seconds between periodic checkpoints of a running unit.
    #[arg(long, value_name = "SECS")]
    pub checkpoint_interval: Option<u64>,

    /// Set a specific configuration value, overriding the config file.
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `scan` subcommand.
#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// Directory containing the simulation packages (*.tar).
    #[arg(required = true, value_name = "SIMPACK_DIR")]
    pub simpack_dir: PathBuf,

    /// Suffix of the per-input completion marker.
    #[arg(long, value_name = "SUFFIX")]
    pub marker_suffix: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_fleet_flags() {
        let cli = Cli::parse_from([
            "cadee-ensemble",
            "-vv",
            "run",
            "packs",
            "-n",
            "4",
            "--in-process",
            "--fresh-db",
            "-S",
            "worker.keep-scratch=true",
        ]);
        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.simpack_dir, PathBuf::from("packs"));
        assert_eq!(args.workers, Some(4));
        assert!(args.in_process);
        assert!(args.fresh_db);
        assert_eq!(args.set_values, vec!["worker.keep-scratch=true"]);
    }

    #[test]
    fn no_spawn_conflicts_with_in_process() {
        let result = Cli::try_parse_from(["cadee-ensemble", "run", "packs", "--no-spawn", "--in-process"]);
        assert!(result.is_err());
    }

    #[test]
    fn worker_requires_connection_details() {
        assert!(Cli::try_parse_from(["cadee-ensemble", "worker", "--rank", "1"]).is_err());
        let cli = Cli::parse_from([
            "cadee-ensemble",
            "worker",
            "--connect",
            "127.0.0.1:4000",
            "--rank",
            "2",
            "--size",
            "3",
        ]);
        let Commands::Worker(args) = cli.command else {
            panic!("expected worker");
        };
        assert_eq!(args.rank, 2);
        assert_eq!(args.size, 3);
    }
}
