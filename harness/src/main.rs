use clap::{Parser, Subcommand};
use pavilion_harness::{
    config::HarnessConfig,
    jobs::JobRegistry,
    status::StatusLog,
    test_run::{TestRun, STATUS_FN},
};
use std::{path::PathBuf, process::exit, time::Duration};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Inspect the state of a shared pavilion working directory.
#[derive(Parser, Debug)]
#[command(name = "pav", version, about)]
struct Cli {
    /// Path to the harness config file
    #[arg(short, long, default_value = "pavilion.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the current (or full) status of a test run
    Status {
        /// Run directory of the test
        run_dir: PathBuf,

        /// Print the whole state history instead of the last entry
        #[arg(long)]
        history: bool,
    },
    /// List job entries and their remaining member tests
    Jobs,
    /// Remove job entries whose member tests are all gone
    Prune,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match HarnessConfig::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            error!(path = ?cli.config, error = ?error, "Failed to load config");

            exit(1)
        }
    };

    match cli.command {
        Command::Status { run_dir, history } => show_status(&run_dir, history),
        Command::Jobs => list_jobs(&config),
        Command::Prune => prune_jobs(&config),
    }
}

fn prune_jobs(config: &HarnessConfig) {
    let wd = config.working_dir();
    let registry = JobRegistry::new(wd.jobs());
    let lock_path = wd.locks().join("jobs.prune.lock");

    match registry.prune(&lock_path, Some(Duration::from_secs(30))) {
        Ok(removed) => println!("Removed {removed} drained job entries"),
        Err(error) => {
            error!(error = ?error, "Failed to prune jobs");

            exit(1)
        }
    }
}

fn show_status(run_dir: &PathBuf, history: bool) {
    let log = StatusLog::open(run_dir.join(STATUS_FN));
    let id = TestRun::load(run_dir)
        .map(|run| run.id.to_string())
        .unwrap_or_else(|_| run_dir.to_string_lossy().into_owned());

    if history {
        match log.history() {
            Ok(entries) => {
                for entry in entries {
                    println!("{} {} {}", entry.when.to_rfc3339(), entry.state, entry.note);
                }
            }
            Err(error) => {
                error!(test = %id, error = ?error, "Failed to read status history");

                exit(1)
            }
        }
    } else {
        match log.current() {
            Ok(Some(entry)) => println!("{id}: {} ({})", entry.state, entry.note),
            Ok(None) => println!("{id}: no valid status recorded"),
            Err(error) => {
                error!(test = %id, error = ?error, "Failed to read status");

                exit(1)
            }
        }
    }
}

fn list_jobs(config: &HarnessConfig) {
    let registry = JobRegistry::new(config.working_dir().jobs());

    let jobs = match registry.jobs() {
        Ok(jobs) => jobs,
        Err(error) => {
            error!(error = ?error, "Failed to list jobs");

            exit(1)
        }
    };

    for job in jobs {
        match job.member_test_ids() {
            Ok(members) => {
                let ids = members
                    .iter()
                    .map(|member| member.id.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");

                println!("{}: [{ids}]", job.name());
            }
            Err(error) => {
                error!(job = %job.name(), error = ?error, "Failed to resolve job members");
            }
        }
    }
}
