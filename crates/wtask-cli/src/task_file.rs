//! Loading a main task from a JSON task file and applying CLI overrides.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use wtask_core::storage::FileTaskStore;
use wtask_core::task::TaskStatus;
use wtask_core::MainTask;

use crate::config::ResolvedDefaults;

/// Load a [`MainTask`] from `path`, filling in any fields the task file
/// left blank (id, timestamps, per-subtask ownership).
pub fn load_main_task_from_file(path: &Path) -> Result<MainTask> {
    let mut mt = FileTaskStore::load_main_task_from_file(path)
        .with_context(|| format!("failed to load task file {}", path.display()))?;

    if mt.id.is_empty() {
        mt.id = generate_task_id(&mt.title);
    }
    if mt.created_at == chrono::DateTime::<Utc>::default() {
        mt.created_at = Utc::now();
    }
    mt.status = TaskStatus::Pending;

    for sub_task in &mut mt.sub_tasks {
        sub_task.main_task_id = mt.id.clone();
        if sub_task.created_at == chrono::DateTime::<Utc>::default() {
            sub_task.created_at = Utc::now();
        }
        sub_task.status = TaskStatus::Pending;
    }

    Ok(mt)
}

/// Apply CLI-flag overrides (webhook URL, program, default timeout) and
/// fill in any remaining per-subtask defaults (program/timeout/id) plus
/// the main task's repo path.
pub fn apply_overrides(
    mt: &mut MainTask,
    cli_webhook: Option<&str>,
    cli_program: Option<&str>,
    defaults: &ResolvedDefaults,
) -> Result<()> {
    if let Some(webhook) = cli_webhook {
        mt.webhook_url = webhook.to_string();
    }

    for (idx, sub_task) in mt.sub_tasks.iter_mut().enumerate() {
        if let Some(program) = cli_program {
            sub_task.program = program.to_string();
        }
        if sub_task.program.is_empty() {
            if let Some(program) = &defaults.program {
                sub_task.program = program.clone();
            }
        }

        if sub_task.timeout.is_empty() {
            if let Some(timeout) = &defaults.timeout {
                sub_task.timeout = timeout.clone();
            }
        }
        if sub_task.timeout.is_empty() {
            sub_task.timeout = "30m".to_string();
        }

        if sub_task.id.is_empty() {
            sub_task.id = format!("{}-subtask-{}", mt.id, idx + 1);
        }
    }

    if mt.repo_path.is_empty() {
        let cwd = std::env::current_dir().context("failed to get current directory")?;
        mt.repo_path = cwd.to_string_lossy().to_string();
    } else {
        let abs = std::path::absolute(&mt.repo_path)
            .with_context(|| format!("failed to resolve repo_path {}", mt.repo_path))?;
        mt.repo_path = abs.to_string_lossy().to_string();
    }

    Ok(())
}

/// Derive a task id from a title: lowercased, spaces to hyphens, anything
/// outside `[a-z0-9-]` dropped, suffixed with a local timestamp so repeat
/// runs of the same title never collide.
pub fn generate_task_id(title: &str) -> String {
    let lowered = title.to_lowercase().replace(' ', "-");
    let cleaned: String = lowered
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    format!("{cleaned}-{timestamp}")
}
