//! Thin CLI adapter over the fleet core.
//!
//! Translates commands into `FleetManager` calls and maps outcomes to
//! exit codes: 0 success, 1 task failed, 2 quality gate blocked,
//! 3 configuration error, 4 runtime error, 130 interrupted.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use console::style;

use crate::domain::models::{
    BackoffKind, FleetConfig, Partition, PutOptions, RetryPolicy, Task, TaskPriority, TaskStatus,
};
use crate::services::FleetManager;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_TASK_FAILED: i32 = 1;
pub const EXIT_QUALITY_GATE_BLOCKED: i32 = 2;
pub const EXIT_CONFIG_ERROR: i32 = 3;
pub const EXIT_RUNTIME_ERROR: i32 = 4;
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "aqe", version, about = "Autonomous quality engineering fleet")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a config file (defaults to .aqe/config.yaml hierarchy)
    #[arg(long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a default .aqe/config.yaml in the current directory
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the fleet until interrupted
    Start {
        /// Override fleet.max_concurrent_agents
        #[arg(long)]
        max_agents: Option<usize>,
    },
    /// Submit one task and wait for its result
    Submit(SubmitArgs),
    /// Inspect or edit the swarm memory store
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
}

#[derive(Args)]
pub struct SubmitArgs {
    /// Task type, e.g. generate-tests
    #[arg(long)]
    pub task_type: String,

    /// JSON payload
    #[arg(long, default_value = "{}")]
    pub payload: String,

    /// Priority lane (p0 highest)
    #[arg(long, default_value = "p2")]
    pub priority: String,

    /// Required capability (repeatable)
    #[arg(long = "capability")]
    pub capabilities: Vec<String>,

    /// Per-attempt timeout in milliseconds
    #[arg(long, default_value_t = Task::DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,

    /// Maximum attempts (1 = no retry)
    #[arg(long, default_value_t = 1)]
    pub max_attempts: u32,
}

#[derive(Subcommand)]
pub enum MemoryCommands {
    /// Read one key
    Get { partition: String, key: String },
    /// Write one key
    Put {
        partition: String,
        key: String,
        value: String,
        /// Time-to-live in milliseconds
        #[arg(long)]
        ttl_ms: Option<u64>,
    },
    /// List keys in a partition
    List {
        partition: String,
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

const DEFAULT_CONFIG_YAML: &str = "\
adapter:
  type: real
  db_path: .aqe/aqe.db
  fail_fast: true
fleet:
  max_concurrent_agents: 15
  topology: mesh
logging:
  level: info
  format: pretty
";

/// `aqe init`
pub fn handle_init(force: bool) -> Result<i32> {
    let dir = Path::new(".aqe");
    let config_path = dir.join("config.yaml");
    if config_path.exists() && !force {
        eprintln!(
            "{} {} already exists (use --force to overwrite)",
            style("error:").red().bold(),
            config_path.display()
        );
        return Ok(EXIT_CONFIG_ERROR);
    }
    std::fs::create_dir_all(dir).context("failed to create .aqe directory")?;
    std::fs::write(&config_path, DEFAULT_CONFIG_YAML).context("failed to write config")?;
    println!("{} {}", style("created").green(), config_path.display());
    Ok(EXIT_SUCCESS)
}

/// `aqe start`: run until Ctrl-C.
pub async fn handle_start(mut config: FleetConfig, max_agents: Option<usize>) -> Result<i32> {
    if let Some(max) = max_agents {
        config.fleet.max_concurrent_agents = max;
    }
    let fleet = FleetManager::init(config).await?;
    fleet.start().await?;
    println!(
        "{} fleet running ({} agent types); press Ctrl-C to stop",
        style("ok").green(),
        fleet.registry().types().len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    println!("\n{} shutting down...", style("interrupt").yellow());
    let summary = fleet.shutdown(true, Duration::from_secs(30)).await?;
    print_shutdown_summary(&summary.tasks);
    Ok(EXIT_INTERRUPTED)
}

/// `aqe submit`: ephemeral fleet, one task, exit code by outcome.
pub async fn handle_submit(config: FleetConfig, args: SubmitArgs) -> Result<i32> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("payload must be valid JSON")?;
    let Some(priority) = TaskPriority::from_str(&args.priority) else {
        eprintln!(
            "{} invalid priority `{}` (expected p0..p3)",
            style("error:").red().bold(),
            args.priority
        );
        return Ok(EXIT_CONFIG_ERROR);
    };

    let mut task = Task::new(args.task_type.clone(), payload)
        .with_priority(priority)
        .with_timeout_ms(args.timeout_ms)
        .with_retry_policy(RetryPolicy::new(
            args.max_attempts.max(1),
            BackoffKind::Exponential,
            100,
            10_000,
        ));
    for capability in args.capabilities {
        task = task.with_capability(capability);
    }

    let fleet = FleetManager::init(config).await?;
    fleet.start().await?;
    let task_id = fleet.submit(task).await?;
    println!("submitted {}", style(task_id.to_string()).cyan());

    let result = fleet.await_task(task_id, None).await?;
    let _ = fleet.shutdown(true, Duration::from_secs(10)).await;

    let code = match result.status {
        TaskStatus::Completed => {
            println!("{} completed in {} attempt(s)", style("ok").green(), result.attempts);
            if let Some(value) = &result.value {
                println!("{}", serde_json::to_string_pretty(value)?);
            }
            EXIT_SUCCESS
        }
        TaskStatus::Canceled => EXIT_INTERRUPTED,
        _ => {
            eprintln!(
                "{} task {}: {}",
                style("failed").red().bold(),
                result.status.as_str(),
                result.error.as_deref().unwrap_or("unknown cause")
            );
            if args.task_type == "quality-gate" {
                EXIT_QUALITY_GATE_BLOCKED
            } else {
                EXIT_TASK_FAILED
            }
        }
    };
    Ok(code)
}

/// `aqe memory ...`
pub async fn handle_memory(config: FleetConfig, command: MemoryCommands) -> Result<i32> {
    let fleet = FleetManager::init(config).await?;
    let memory = fleet.memory();

    match command {
        MemoryCommands::Get { partition, key } => {
            let partition = Partition::parse_str(&partition)?;
            match memory.get(partition, &key).await? {
                Some(entry) => {
                    println!("{}", String::from_utf8_lossy(&entry.value));
                    Ok(EXIT_SUCCESS)
                }
                None => {
                    eprintln!("{} key not found", style("error:").red().bold());
                    Ok(EXIT_TASK_FAILED)
                }
            }
        }
        MemoryCommands::Put {
            partition,
            key,
            value,
            ttl_ms,
        } => {
            let partition = Partition::parse_str(&partition)?;
            let created = memory
                .put(
                    partition,
                    &key,
                    value.into_bytes(),
                    PutOptions {
                        ttl_ms,
                        ..PutOptions::default()
                    },
                )
                .await?;
            println!(
                "{} {}",
                style(if created { "created" } else { "updated" }).green(),
                key
            );
            Ok(EXIT_SUCCESS)
        }
        MemoryCommands::List {
            partition,
            prefix,
            limit,
        } => {
            let partition = Partition::parse_str(&partition)?;
            let entries = memory
                .scan(partition, prefix.as_deref(), Some(limit))
                .await?;

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["key", "bytes", "ttl_ms", "updated_at"]);
            for entry in &entries {
                table.add_row(vec![
                    entry.key.clone(),
                    entry.value.len().to_string(),
                    entry.ttl_ms.map_or_else(|| "-".to_string(), |t| t.to_string()),
                    entry.updated_at.to_rfc3339(),
                ]);
            }
            println!("{table}");
            println!("{} entries", entries.len());
            Ok(EXIT_SUCCESS)
        }
    }
}

fn print_shutdown_summary(tasks: &[(crate::domain::models::TaskId, TaskStatus)]) {
    if tasks.is_empty() {
        return;
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["task", "final state"]);
    for (id, status) in tasks {
        table.add_row(vec![id.to_string(), status.as_str().to_string()]);
    }
    println!("{table}");
}
