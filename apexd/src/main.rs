//! APEX daemon CLI entry point

use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing_subscriber::EnvFilter;

use apexd::cli::{Cli, Command, TaskCommand};
use apexd::config::Config;
use apexd::daemon::DaemonManager;
use apexd::orchestrator::{Orchestrator, OrchestratorOptions};
use apexd::{ids, DirWorkspaceManager};
use apexstore::{Store, Task, TaskFilter, TaskPatch, TaskStatus};

fn setup_logging(cli_level: Option<&str>) {
    let default = cli_level.unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref());

    match cli.command {
        Command::Start => {
            let manager = DaemonManager::new();
            let pid = manager.start()?;
            println!("{} daemon started (pid {})", "ok:".green().bold(), pid);
            Ok(())
        }
        Command::Stop => {
            let manager = DaemonManager::new();
            manager.stop()?;
            println!("{} daemon stopped", "ok:".green().bold());
            Ok(())
        }
        Command::Status => {
            let status = DaemonManager::new().status();
            if status.running {
                println!(
                    "{} running (pid {}, version {})",
                    "daemon:".bold(),
                    status.pid.unwrap_or_default(),
                    status.version.unwrap_or_else(|| "unknown".to_string())
                );
            } else {
                println!("{} {}", "daemon:".bold(), "not running".yellow());
            }
            Ok(())
        }
        Command::RunDaemon => run_daemon(&cli.project, cli.config.clone()).await,
        Command::Task(task_cmd) => run_task_command(&cli.project, cli.config.clone(), task_cmd),
    }
}

/// Foreground daemon loop: initialize, run until SIGTERM/ctrl-c, drain
async fn run_daemon(project: &PathBuf, config_path: Option<PathBuf>) -> Result<()> {
    let manager = DaemonManager::new();
    manager.register_self()?;

    let project_path = project
        .canonicalize()
        .unwrap_or_else(|_| project.clone())
        .to_string_lossy()
        .to_string();

    let mut options = OrchestratorOptions::new(&project_path);
    options.config_path = config_path;
    options.workspace = Some(std::sync::Arc::new(DirWorkspaceManager::new(&project_path)));
    let orchestrator = Orchestrator::initialize(options).await?;
    orchestrator.start();

    wait_for_shutdown_signal().await;
    tracing::info!("Shutdown signal received; draining workers");
    orchestrator.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Task operations run directly against the store, like any other caller.
/// They fail fast when a running daemon holds the store lock.
fn run_task_command(project: &PathBuf, config_path: Option<PathBuf>, command: TaskCommand) -> Result<()> {
    let config = Config::load(config_path.as_ref())?;
    let project_path = project
        .canonicalize()
        .unwrap_or_else(|_| project.clone())
        .to_string_lossy()
        .to_string();
    let db_path = PathBuf::from(&project_path).join(".apex").join("apex.db");
    let store = Store::open(&db_path).context("Is the daemon running? Stop it before using direct task commands")?;

    match command {
        TaskCommand::Add {
            description,
            workflow,
            priority,
            criteria,
        } => {
            let mut task = Task::new(
                ids::task_id(),
                &description,
                workflow.as_deref().unwrap_or("feature"),
                &project_path,
                ids::branch_name(&description),
            );
            task.priority = priority;
            task.acceptance_criteria = criteria;
            task.max_retries = config.limits.max_retries;
            store.create_task(&task)?;
            println!("{} {} ({})", "created:".green().bold(), task.id, task.branch_name);
        }
        TaskCommand::List { status } => {
            let filter = TaskFilter {
                status: status.as_deref().map(|s| s.parse()).transpose().map_err(|e: String| eyre::eyre!(e))?,
                order_by_priority: true,
                limit: None,
            };
            for task in store.list_tasks(&filter)? {
                let status = match task.status {
                    TaskStatus::Completed => task.status.to_string().green(),
                    TaskStatus::Failed | TaskStatus::Cancelled => task.status.to_string().red(),
                    TaskStatus::Paused => task.status.to_string().yellow(),
                    _ => task.status.to_string().normal(),
                };
                println!("{}  [{}] {} - {}", task.id, task.priority, status, task.description);
            }
        }
        TaskCommand::Show { task_id } => {
            let task = store.require_task(&task_id)?;
            println!("{}: {}", "id".bold(), task.id);
            println!("{}: {}", "description".bold(), task.description);
            println!("{}: {}", "status".bold(), task.status);
            println!("{}: {}", "workflow".bold(), task.workflow);
            println!("{}: {}", "branch".bold(), task.branch_name);
            println!("{}: {}", "priority".bold(), task.priority);
            println!(
                "{}: {} tokens, ${:.2}",
                "usage".bold(),
                task.usage.total_tokens,
                task.usage.estimated_cost
            );
            if let Some(stage) = &task.current_stage {
                println!("{}: {}", "stage".bold(), stage);
            }
            if let Some(error) = &task.error {
                println!("{}: {}", "error".bold(), error.red());
            }
            if let Some(url) = &task.pr_url {
                println!("{}: {}", "pr".bold(), url);
            }
        }
        TaskCommand::Cancel { task_id } => {
            let task = store.require_task(&task_id)?;
            if task.is_terminal() {
                println!("{} task {} is already {}", "skipped:".yellow().bold(), task_id, task.status);
            } else {
                store.update_task(&task_id, &TaskPatch::new().status(TaskStatus::Cancelled))?;
                println!("{} {}", "cancelled:".green().bold(), task_id);
            }
        }
    }

    Ok(())
}
