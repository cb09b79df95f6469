mod cleanup;
mod config;
mod executors;
mod job;
mod ledger;
mod orchestrator;
mod poller;
mod probe;
mod registry;
mod report;
mod scheduler;
mod script;
mod sync;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use config::SimqConfig;
use executors::LocalExecutor;
use ledger::Ledger;
use orchestrator::Orchestrator;
use poller::SystemClock;
use probe::FsProbe;
use report::FailureLog;
use script::ScriptFormat;
use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};
use sync::CancelToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "simq")]
#[command(version)]
#[command(about = "Runs prepare, compute and extract stages of simulation jobs under a license budget")]
struct Args {
    /// override the job root of the config
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// log debug output (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// run every discovered job to completion
    Run { config: PathBuf },
    /// list the discovered groups and jobs without running anything
    Discover { config: PathBuf },
    /// write one standalone control script per group
    Emit {
        config: PathBuf,
        #[arg(long, value_enum, default_value = "sh")]
        format: ScriptFormat,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// validate the config, including the engine executables
    Check { config: PathBuf },
}

fn load_config(path: &Path, root: Option<PathBuf>) -> Option<SimqConfig> {
    match SimqConfig::load(path) {
        Ok(mut config) => {
            if let Some(root) = root {
                config.root = root;
            }

            Some(config)
        }
        Err(error) => {
            error!(error = ?error, path = ?path, "Failed to load config: {error}");

            None
        }
    }
}

fn run(config: SimqConfig) -> ExitCode {
    if config.preflight_checks(true) {
        error!("Config failed preflight checks, not running anything");
        return ExitCode::FAILURE;
    }

    let groups = match registry::discover(&config.root, &config.naming, &config.grouping) {
        Ok(groups) => groups,
        Err(error) => {
            error!(error = ?error, "{error}");
            return ExitCode::FAILURE;
        }
    };

    let run_config = config.run_config();

    if let Err(error) = fs::create_dir_all(&run_config.log_dir) {
        error!(error = ?error, path = ?run_config.log_dir, "Failed to create the log directory");
        return ExitCode::FAILURE;
    }

    let ledger = match ledger::open(config.ledger.as_deref()) {
        Ok(ledger) => ledger,
        Err(error) => {
            error!(error = ?error, "Failed to open the ledger: {error}");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancelToken::new();
    if let Err(error) = sync::install_signal_handlers(&cancel) {
        warn!(error = ?error, "Failed to install signal handlers, interrupts will kill the run");
    }

    let executor = LocalExecutor::load(config.engine.clone());
    let clock = SystemClock::new();
    let failures = FailureLog::new(&run_config.log_dir);

    let report = Orchestrator::new(
        &executor,
        &FsProbe,
        &clock,
        &run_config,
        &cancel,
        &failures,
        &*ledger,
    )
    .run_groups(groups);

    let report_path = run_config.log_dir.join("run_report.yaml");
    if let Err(error) = report.write_yaml(&report_path) {
        error!(error = ?error, path = ?report_path, "Failed to write the run report");
    }

    match serde_yaml::to_string(&report) {
        Ok(yaml) => print!("{yaml}"),
        Err(error) => error!(error = ?error, "Failed to serialize the run report"),
    }

    // failed jobs are part of a normal run, only an interrupted run is an error
    if cancel.is_cancelled() {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    }
}

fn discover(config: SimqConfig) -> ExitCode {
    // only read an existing ledger, listing jobs must not create one
    let existing = config.ledger.as_deref().filter(|path| path.is_file());
    let history: Box<dyn Ledger> = match ledger::open(existing) {
        Ok(ledger) => ledger,
        Err(error) => {
            warn!(error = ?error, "Failed to open the ledger, listing jobs without history");
            Box::new(ledger::NullLedger)
        }
    };

    match registry::discover(&config.root, &config.naming, &config.grouping) {
        Ok(groups) => {
            for group in groups.iter() {
                println!("{} ({} jobs)", group.name(), group.len());

                for job in group.jobs() {
                    let input = if job.compute_script.is_file() {
                        "input ready"
                    } else {
                        "input pending"
                    };
                    let last = match history.latest(job) {
                        Ok(Some((step, state))) => format!("last {step} {state}"),
                        Ok(None) => String::from("no history"),
                        Err(error) => {
                            warn!(job = %job.name, error = ?error, "Failed to read the ledger");
                            String::from("no history")
                        }
                    };
                    println!(
                        "  {}\t{}\t{input}\t{last}",
                        job.name,
                        job.work_dir.to_string_lossy()
                    );
                }
            }

            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(error = ?error, "{error}");
            ExitCode::FAILURE
        }
    }
}

fn emit(config: SimqConfig, format: ScriptFormat, out: &Path) -> ExitCode {
    if config.preflight_checks(false) {
        error!("Config failed preflight checks, not writing any script");
        return ExitCode::FAILURE;
    }

    let groups = match registry::discover(&config.root, &config.naming, &config.grouping) {
        Ok(groups) => groups,
        Err(error) => {
            error!(error = ?error, "{error}");
            return ExitCode::FAILURE;
        }
    };

    match script::emit_all(&groups, &config, format, out) {
        Ok(paths) => {
            for path in paths {
                println!("{}", path.to_string_lossy());
            }

            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(error = ?error, out = ?out, "Failed to write control scripts");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let (config_path, command) = match &args.command {
        Commands::Run { config } => (config, "run"),
        Commands::Discover { config } => (config, "discover"),
        Commands::Emit { config, .. } => (config, "emit"),
        Commands::Check { config } => (config, "check"),
    };

    let Some(config) = load_config(config_path, args.root.clone()) else {
        return ExitCode::FAILURE;
    };
    info!(command, root = ?config.root, "simq {}", clap::crate_version!());

    match args.command {
        Commands::Run { .. } => run(config),
        Commands::Discover { .. } => discover(config),
        Commands::Emit { format, out, .. } => emit(config, format, &out),
        Commands::Check { .. } => {
            if config.preflight_checks(true) {
                ExitCode::FAILURE
            } else {
                info!("Config is valid");
                ExitCode::SUCCESS
            }
        }
    }
}
