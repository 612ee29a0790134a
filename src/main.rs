use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use roistat::logging::init_logging;
use roistat::{Config, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "roistat")]
#[command(about = "ROI overlap quantification for fMRI statistical maps", long_about = None)]
struct Cli {
    /// Config TOML file (built-in defaults when omitted)
    #[arg(short, long, global = true, env = "ROISTAT_CONFIG")]
    config: Option<PathBuf>,

    /// Debug-level logging unless RUST_LOG is set
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Preprocess a subject and run every configured task
    Run {
        /// Subject identifier, e.g. sub-01
        subject: String,
    },
    /// Build and cache the subject's template and native masks only
    Preprocess { subject: String },
    /// Run a single task for a subject
    Overlap {
        subject: String,
        /// Task identifier from the config
        #[arg(short, long)]
        task: String,
    },
    /// Print the effective configuration as TOML
    PrintConfig,
}

impl Command {
    fn subject(&self) -> Option<&str> {
        match self {
            Command::Run { subject }
            | Command::Preprocess { subject }
            | Command::Overlap { subject, .. } => Some(subject),
            Command::PrintConfig => None,
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    if let Command::PrintConfig = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let orchestrator = Orchestrator::new(config).context("invalid configuration")?;
    let log_file = cli.command.subject().map(|s| orchestrator.log_path(s));
    let guard = init_logging(log_file.as_deref(), cli.verbose)?;
    if let Some(path) = guard.log_file() {
        info!(log = %path.display(), "consolidated subject log");
    }

    // Logged here so the file writer is still alive.
    let outcome = execute(&orchestrator, &cli.command);
    if let Err(e) = &outcome {
        error!("{e:#}");
    }
    outcome
}

fn execute(orchestrator: &Orchestrator, command: &Command) -> Result<()> {
    match command {
        Command::Run { subject } => {
            let report = orchestrator
                .run_subject(subject)
                .with_context(|| format!("subject {subject} did not complete"))?;
            for outcome in &report.outcomes {
                info!(
                    task = %outcome.task,
                    rows = outcome.rows,
                    skipped = outcome.skipped,
                    report = %outcome.report.display(),
                    "task complete"
                );
            }
            info!(subject = %report.subject, state = ?report.state, "done");
        }
        Command::Preprocess { subject } => {
            orchestrator
                .preprocess(subject)
                .with_context(|| format!("preprocessing failed for {subject}"))?;
            info!(subject = %subject, "preprocessing complete");
        }
        Command::Overlap { subject, task } => {
            let outcome = orchestrator
                .run_single_task(subject, task)
                .with_context(|| format!("task {task} failed for {subject}"))?;
            info!(report = %outcome.report.display(), rows = outcome.rows, "task complete");
        }
        Command::PrintConfig => {}
    }
    Ok(())
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !tracing::dispatcher::has_been_set() {
                eprintln!("error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}
