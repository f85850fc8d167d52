mod config;
mod status_cmd;
mod task_file;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use wtask_core::instance::tmux::TmuxInstance;
use wtask_core::storage::FileTaskStore;
use wtask_core::webhook::{WebhookClient, WebhookClientConfig, WebhookQueueConfig};
use wtask_core::worktree::GitWorktreeDriver;
use wtask_core::{MainTask, TaskManager, TaskStatus};

use config::ResolvedDefaults;

#[derive(Parser)]
#[command(name = "wtask", about = "Run ordered bundles of prompt-driven subtasks against ephemeral git worktrees")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a worktree-based main task with subtasks
    Run {
        /// Path to the main task JSON file
        task_file: PathBuf,
        /// Default timeout for subtasks that do not specify one (e.g. 30m, 1h, 2h30m)
        #[arg(long)]
        timeout: Option<String>,
        /// Override the webhook URL from the task file
        #[arg(long)]
        webhook: Option<String>,
        /// Override the program used by every subtask
        #[arg(long)]
        program: Option<String>,
    },
    /// Show the status of a previously saved main task
    Status {
        /// Main task id to show (omit to list all saved tasks)
        id: Option<String>,
    },
    /// Write a wtask config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

/// Execute the `wtask run` command end to end: load the task file, apply
/// overrides, run the manager until the main task reaches a terminal
/// status, then report the outcome.
async fn cmd_run(
    task_file: &std::path::Path,
    cli_timeout: Option<&str>,
    cli_webhook: Option<&str>,
    cli_program: Option<&str>,
) -> anyhow::Result<()> {
    tracing::info!(path = %task_file.display(), "loading main task");
    let mut mt = task_file::load_main_task_from_file(task_file)?;

    let defaults = ResolvedDefaults::resolve(cli_program, cli_timeout);
    task_file::apply_overrides(&mut mt, cli_webhook, cli_program, &defaults)?;

    tracing::info!(
        id = %mt.id,
        title = %mt.title,
        sub_tasks = mt.sub_tasks.len(),
        "loaded main task"
    );

    let instance_factory: wtask_core::manager::InstanceFactory =
        Arc::new(|| Box::new(TmuxInstance::new()));
    let manager = TaskManager::new(Arc::new(GitWorktreeDriver), instance_factory);

    let store = Arc::new(FileTaskStore::new(config::config_dir().join("tasks")));
    manager.set_task_store(store).await;

    let webhook_client = WebhookClient::new(WebhookClientConfig::default());
    manager.start(webhook_client, WebhookQueueConfig::default()).await;

    manager
        .execute(mt.clone())
        .await
        .context("failed to start main task")?;

    let final_task = wait_for_completion(&manager, &mt.id).await;
    manager.stop().await;

    match final_task {
        Some(final_task) => {
            println!(
                "Task {} finished with status {} ({}/{} subtasks completed)",
                final_task.id,
                final_task.status,
                final_task.completed_sub_tasks,
                final_task.sub_tasks.len()
            );
            if final_task.status == TaskStatus::Failed || final_task.status == TaskStatus::TimedOut {
                std::process::exit(1);
            }
            Ok(())
        }
        None => anyhow::bail!("main task {} disappeared before completing", mt.id),
    }
}

/// Poll the manager until the main task reaches a terminal status.
async fn wait_for_completion(manager: &TaskManager, id: &str) -> Option<MainTask> {
    const POLL: Duration = Duration::from_secs(5);
    loop {
        let mt = manager.get(id).await?;
        if mt.status.is_terminal() {
            return Some(mt);
        }
        tokio::time::sleep(POLL).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            task_file,
            timeout,
            webhook,
            program,
        } => {
            cmd_run(
                &task_file,
                timeout.as_deref(),
                webhook.as_deref(),
                program.as_deref(),
            )
            .await?;
        }
        Commands::Status { id } => {
            status_cmd::run_status(id.as_deref())?;
        }
        Commands::Init { force } => {
            cmd_init(force)?;
        }
    }

    Ok(())
}

/// Execute the `wtask init` command: write a default config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        defaults: config::DefaultsSection {
            program: "claude".to_string(),
            timeout: "30m".to_string(),
        },
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  defaults.program = {}", cfg.defaults.program);
    println!("  defaults.timeout = {}", cfg.defaults.timeout);

    Ok(())
}
