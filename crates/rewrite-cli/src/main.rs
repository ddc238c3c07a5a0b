use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rewrite_core::ensure_dir;
use rewrite_runner::{BatchReport, JobInspection, JobOutcome, Pipeline, PipelineConfig};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "rewrite-pages",
    version,
    about = "Instrument, profile and rewrite recorded page loads"
)]
struct Cli {
    /// Debug-level logging unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline over every capture directory in INPUT.
    Run {
        input: PathBuf,
        output: PathBuf,
        /// Newline-delimited page identifiers to restrict the batch to.
        #[arg(long)]
        filter: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        trials: Option<usize>,
        #[arg(long)]
        jobs: Option<usize>,
        /// Seed for replay port selection.
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long)]
        tools_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show the pipeline state of every job under OUTPUT.
    Status {
        output: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Remove working directories and/or rewritten pages under OUTPUT.
    Clean {
        output: PathBuf,
        #[arg(long)]
        work: bool,
        #[arg(long)]
        outputs: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            input,
            output,
            filter,
            config,
            trials,
            jobs,
            seed,
            timeout_secs,
            tools_dir,
            json,
        } => {
            let mut config = PipelineConfig::load(config.as_deref())?;
            if let Some(trials) = trials {
                config.trial_count = trials;
                config.timing_trial_count = trials;
            }
            if let Some(jobs) = jobs {
                config.jobs = jobs;
            }
            if seed.is_some() {
                config.port_seed = seed;
            }
            if let Some(secs) = timeout_secs {
                config.tool_timeout_secs = secs;
            }
            if tools_dir.is_some() {
                config.tools_dir = tools_dir;
            }
            config.validate()?;
            if let Some(dir) = &config.tools_dir {
                config.tools_dir = Some(canonical(dir)?);
            }

            // Tools run from their own directory, so every path handed to
            // them has to be absolute.
            let input = canonical(&input)?;
            ensure_dir(&output)
                .with_context(|| format!("failed to create {}", output.display()))?;
            let output = canonical(&output)?;
            tracing::debug!(?config, input = %input.display(), output = %output.display(), "configured");
            let allow_list = match &filter {
                Some(path) => Some(rewrite_runner::read_allow_list(path)?),
                None => None,
            };

            let discovery = rewrite_runner::discover_jobs(&input, &output, allow_list.as_ref())?;
            let pipeline = Pipeline::from_config(config);
            let report = rewrite_runner::run_batch(&pipeline, discovery);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "input": input,
                    "output": output,
                    "report": report_to_json(&report)?,
                })));
            }
            print_report(&report);
        }
        Commands::Status { output, json } => {
            let inspections = rewrite_runner::inspect_jobs(&output)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "jobs": serde_json::to_value(&inspections)?,
                })));
            }
            print_inspections(&inspections);
        }
        Commands::Clean {
            output,
            work,
            outputs,
            json,
        } => {
            if !work && !outputs {
                return Err(anyhow!("nothing to clean: pass --work and/or --outputs"));
            }
            let removed = rewrite_runner::clean(&output, work, outputs)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "clean",
                    "removed": removed,
                })));
            }
            for path in &removed {
                println!("removed: {}", path.display());
            }
            println!("removed_count: {}", removed.len());
        }
    }
    Ok(None)
}

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("failed to resolve {}", path.display()))
}

fn report_to_json(report: &BatchReport) -> Result<Value> {
    Ok(json!({
        "completed": report.completed(),
        "failed": report.failed(),
        "skipped": report.skipped,
        "jobs": serde_json::to_value(&report.jobs)?,
    }))
}

fn print_report(report: &BatchReport) {
    for job in &report.jobs {
        match &job.outcome {
            JobOutcome::Completed { resumed_from } => println!(
                "{}: completed (from {}, {} ms)",
                job.job_id, resumed_from, job.elapsed_ms
            ),
            JobOutcome::Failed { error } => println!("{}: failed: {}", job.job_id, error),
        }
    }
    println!(
        "completed: {}  failed: {}  skipped: {}",
        report.completed(),
        report.failed(),
        report.skipped
    );
}

fn print_inspections(inspections: &[JobInspection]) {
    if inspections.is_empty() {
        println!("no jobs");
        return;
    }
    for job in inspections {
        let status = job
            .status
            .map(|s| format!("{:?}", s).to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        match &job.error {
            Some(error) => println!("{}: {} ({}): {}", job.job_id, job.state, status, error),
            None => println!("{}: {} ({})", job.job_id, job.state, status),
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Status { json, .. } | Commands::Clean { json, .. } => {
            *json
        }
    }
}
