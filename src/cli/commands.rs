//! CLI command implementations for the fuzz scheduler.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::config::ControllerConfig;
use crate::controller::{Controller, TcpTransport};
use crate::scheduler::job::{JobStatus, NewJob, ResourceRequirements};
use crate::scheduler::worker::{Capabilities, WorkerRegistration};
use crate::scheduler::SchedulerOrchestrator;
use crate::storage::Database;

/// Fuzz scheduler - priority job scheduling across a fleet of fuzzing workers.
#[derive(Parser)]
#[command(name = "fuzz-scheduler")]
#[command(about = "Schedules fuzzing jobs onto remote workers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Path to the controller YAML configuration.
    #[arg(short, long, env = "FUZZ_SCHEDULER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Database path, overriding the configuration.
    #[arg(long, env = "FUZZ_SCHEDULER_DB", global = true)]
    pub db: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the controller loop until interrupted.
    Controller,

    /// Submit a job.
    Submit(SubmitArgs),

    /// Register or refresh a worker.
    RegisterWorker(RegisterWorkerArgs),

    /// Print scheduler status as JSON.
    Status(StatusArgs),

    /// Run a single scheduler cycle and print what it did.
    Cycle,
}

/// Arguments for the submit command.
#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Job name.
    #[arg(short, long)]
    pub name: String,

    /// Job config as inline JSON.
    #[arg(long, conflicts_with = "config_file")]
    pub config_json: Option<String>,

    /// Job config read from a JSON file.
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Priority from 0 to 100; higher runs first.
    #[arg(short, long, default_value = "50")]
    pub priority: u8,

    /// Deadline as an RFC 3339 timestamp.
    #[arg(long)]
    pub deadline: Option<String>,

    /// IDs of jobs that must complete first.
    #[arg(long, value_delimiter = ',')]
    pub depends_on: Vec<i64>,

    /// Free CPU cores required.
    #[arg(long)]
    pub cpu: Option<f64>,

    /// Free RAM in GB required.
    #[arg(long)]
    pub ram: Option<f64>,

    /// Free VM slots required.
    #[arg(long)]
    pub vms: Option<u32>,

    /// Worker tags, any of which qualifies a worker.
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Attempts allowed before the job fails. Defaults to the configured value.
    #[arg(long)]
    pub max_retries: Option<u32>,
}

/// Arguments for the register-worker command.
#[derive(Args, Debug)]
pub struct RegisterWorkerArgs {
    /// Worker IP address.
    pub ip: String,

    #[arg(long)]
    pub hostname: Option<String>,

    #[arg(long, default_value = "4")]
    pub cpu_cores: f64,

    #[arg(long, default_value = "8")]
    pub ram_gb: f64,

    #[arg(long, default_value = "4")]
    pub max_vms: u32,

    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,
}

/// Arguments for the status command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Also list jobs, optionally filtered by --job-status.
    #[arg(long)]
    pub jobs: bool,

    /// Only list jobs in this status.
    #[arg(long, requires = "jobs")]
    pub job_status: Option<JobStatus>,

    /// Also print the Prometheus exposition.
    #[arg(long)]
    pub metrics: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Controller => run_controller_command(config).await,
        Commands::Submit(args) => run_submit_command(config, args).await,
        Commands::RegisterWorker(args) => run_register_worker_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::Cycle => run_cycle_command(config).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ControllerConfig> {
    let mut config = match &cli.config {
        Some(path) => ControllerConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    Ok(config)
}

async fn open_database(config: &ControllerConfig) -> anyhow::Result<Arc<Database>> {
    let db = Database::connect(&config.db_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    Ok(Arc::new(db))
}

// ============================================================================
// Controller Command
// ============================================================================

async fn run_controller_command(config: ControllerConfig) -> anyhow::Result<()> {
    let db = open_database(&config).await?;
    let orchestrator = SchedulerOrchestrator::new(db, &config.scheduler)?;
    let transport = Arc::new(
        TcpTransport::new(config.worker_port)
            .with_timeouts(config.push_timeout(), config.request_timeout()),
    );

    let controller = Controller::new(orchestrator, transport, &config);
    let shutdown = controller.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current iteration");
            let _ = shutdown.send(());
        }
    });

    controller.run().await?;
    Ok(())
}

// ============================================================================
// Submit Command
// ============================================================================

async fn run_submit_command(config: ControllerConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let job_config: serde_json::Value = match (&args.config_json, &args.config_file) {
        (Some(inline), _) => {
            serde_json::from_str(inline).context("Failed to parse --config-json")?
        }
        (None, Some(path)) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        }
        (None, None) => serde_json::json!({}),
    };

    let mut job = NewJob::new(args.name, job_config)
        .with_priority(args.priority)
        .with_dependencies(args.depends_on)
        .with_max_retries(
            args.max_retries
                .unwrap_or(config.scheduler.default_max_retries),
        );

    if let Some(deadline) = args.deadline.as_deref() {
        job = job.with_deadline(parse_deadline(deadline)?);
    }

    let mut requirements = ResourceRequirements::new();
    requirements.cpu = args.cpu;
    requirements.ram = args.ram;
    requirements.vms = args.vms;
    requirements.tags = args.tags;
    if !requirements.is_empty() {
        job = job.with_requirements(requirements);
    }

    let db = open_database(&config).await?;
    let job_id = db.add_job(job).await?;
    let queued = db.is_queued(job_id).await?;
    let status = db
        .get_job(job_id)
        .await?
        .map(|j| j.status.to_string())
        .unwrap_or_default();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "job_id": job_id,
            "status": status,
            "queued": queued,
        }))?
    );
    Ok(())
}

fn parse_deadline(value: &str) -> anyhow::Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid deadline '{}', expected RFC 3339", value))?;
    Ok(parsed.with_timezone(&Utc))
}

// ============================================================================
// Register Worker Command
// ============================================================================

async fn run_register_worker_command(
    config: ControllerConfig,
    args: RegisterWorkerArgs,
) -> anyhow::Result<()> {
    let mut registration = WorkerRegistration::new(args.ip)
        .with_capabilities(Capabilities::new(args.cpu_cores, args.ram_gb, args.max_vms))
        .with_tags(args.tags);
    if let Some(hostname) = args.hostname {
        registration = registration.with_hostname(hostname);
    }

    let db = open_database(&config).await?;
    let worker_id = db.register_worker(registration).await?;
    let worker = db.get_worker(worker_id).await?;
    println!("{}", serde_json::to_string_pretty(&worker)?);
    Ok(())
}

// ============================================================================
// Status Command
// ============================================================================

async fn run_status_command(config: ControllerConfig, args: StatusArgs) -> anyhow::Result<()> {
    let db = open_database(&config).await?;
    let orchestrator = SchedulerOrchestrator::new(Arc::clone(&db), &config.scheduler)?;
    let status = orchestrator.get_status().await?;

    let mut output = serde_json::to_value(&status)?;
    output["schema_version"] = db.schema_version().await?.into();
    if args.jobs {
        let jobs = db.list_jobs(args.job_status).await?;
        output["job_list"] = serde_json::to_value(jobs)?;
    }
    println!("{}", serde_json::to_string_pretty(&output)?);

    if args.metrics {
        print!("{}", orchestrator.metrics().export());
    }
    Ok(())
}

// ============================================================================
// Cycle Command
// ============================================================================

async fn run_cycle_command(config: ControllerConfig) -> anyhow::Result<()> {
    let db = open_database(&config).await?;
    let orchestrator = SchedulerOrchestrator::new(db, &config.scheduler)?;
    let stats = orchestrator.run_cycle().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
