//! The MainTask/SubTask data model: status enum, entities, validation, and
//! the single write path that keeps the derived fields (`completed_sub_tasks`,
//! main-task status) consistent with subtask state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed status enumeration for both main tasks and subtasks.
///
/// Subtasks progress strictly `Pending -> Running -> {Completed | Failed |
/// TimedOut}`. A main task's status is derived from its subtasks by
/// [`MainTask::recompute_status`] and never set directly except at the
/// start of its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl TaskStatus {
    /// `true` for any status a subtask or main task does not leave once
    /// entered.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::TimedOut
        )
    }
}

impl Default for TaskStatus {
    /// A freshly loaded task file that omits `status` entirely starts
    /// `Pending`, matching the zero value of the integer status field in
    /// the original task-file format.
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// One prompt-driven execution unit run against an external program inside
/// a main task's worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub main_task_id: String,
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub completion_markers: Vec<String>,
    /// Duration string, e.g. "30m", "1h", "2h30m" (parsed by the caller).
    #[serde(default)]
    pub timeout: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_payload: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

impl SubTask {
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, TaskStatus::Failed | TaskStatus::TimedOut)
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
    }

    pub fn mark_completed(&mut self, output: String) {
        self.status = TaskStatus::Completed;
        self.output = output;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error_message: String) {
        self.status = TaskStatus::Failed;
        self.error_message = error_message;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_timed_out(&mut self) {
        self.status = TaskStatus::TimedOut;
        self.error_message = format!("subtask timed out after {}", self.timeout);
        self.completed_at = Some(Utc::now());
    }
}

/// An ordered bundle of subtasks bound to a single worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainTask {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub worktree_path: String,
    #[serde(default)]
    pub branch_name: String,
    #[serde(default)]
    pub repo_path: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(rename = "subtasks")]
    pub sub_tasks: Vec<SubTask>,
    #[serde(default, rename = "completed_subtasks")]
    pub completed_sub_tasks: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

impl MainTask {
    /// Progress in `[0, 100]`. A main task with zero subtasks is defined as
    /// fully complete (this state is rejected by [`validate_main_task`], but
    /// the formula stays total).
    pub fn get_progress(&self) -> f64 {
        if self.sub_tasks.is_empty() {
            return 100.0;
        }
        (self.completed_sub_tasks as f64 / self.sub_tasks.len() as f64) * 100.0
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }

    /// The first subtask still in `Pending`, if any.
    pub fn next_pending_sub_task(&self) -> Option<&SubTask> {
        self.sub_tasks.iter().find(|s| s.status == TaskStatus::Pending)
    }

    /// Recompute `completed_sub_tasks` and `status` from the current
    /// subtask statuses. This is the single place main-task derived state
    /// is written, keeping invariants 2/4/5 of the data model satisfied.
    pub fn recompute_status(&mut self) {
        let completed = self
            .sub_tasks
            .iter()
            .filter(|s| s.status == TaskStatus::Completed)
            .count();
        let failed = self.sub_tasks.iter().any(|s| s.is_failed());
        let running = self
            .sub_tasks
            .iter()
            .any(|s| s.status == TaskStatus::Running);

        self.completed_sub_tasks = completed;

        if completed == self.sub_tasks.len() {
            self.status = TaskStatus::Completed;
            self.completed_at = Some(Utc::now());
        } else if failed {
            let failed_count = self.sub_tasks.iter().filter(|s| s.is_failed()).count();
            self.status = TaskStatus::Failed;
            self.completed_at = Some(Utc::now());
            self.error_message = format!("{failed_count} subtasks failed");
        } else if running {
            self.status = TaskStatus::Running;
        }
    }
}

/// Errors raised by [`validate_main_task`] / [`validate_sub_task`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("main task id must not be empty")]
    EmptyMainTaskId,
    #[error("main task title must not be empty")]
    EmptyTitle,
    #[error("main task repo_path must not be empty")]
    EmptyRepoPath,
    #[error("main task must have at least one subtask")]
    NoSubTasks,
    #[error("subtask {0} id must not be empty")]
    EmptySubTaskId(usize),
    #[error("subtask {0} title must not be empty")]
    EmptySubTaskTitle(usize),
    #[error("subtask {0} prompt must not be empty")]
    EmptyPrompt(usize),
    #[error("subtask {0} program must not be empty")]
    EmptyProgram(usize),
    #[error("subtask {0} timeout must be positive")]
    NonPositiveTimeout(usize),
    #[error("subtask {0} main_task_id does not match owning main task")]
    SubTaskOwnerMismatch(usize),
}

/// Validate a [`MainTask`] against the data-model invariants in SPEC_FULL.md
/// section 3. Called once, before a main task is ever tracked or executed.
pub fn validate_main_task(mt: &MainTask) -> Result<(), ValidationError> {
    if mt.id.is_empty() {
        return Err(ValidationError::EmptyMainTaskId);
    }
    if mt.title.is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    if mt.repo_path.is_empty() {
        return Err(ValidationError::EmptyRepoPath);
    }
    if mt.sub_tasks.is_empty() {
        return Err(ValidationError::NoSubTasks);
    }
    for (idx, st) in mt.sub_tasks.iter().enumerate() {
        validate_sub_task(st, idx)?;
        if st.main_task_id != mt.id {
            return Err(ValidationError::SubTaskOwnerMismatch(idx));
        }
    }
    Ok(())
}

/// Validate a single [`SubTask`]. `idx` is used only for error messages.
pub fn validate_sub_task(st: &SubTask, idx: usize) -> Result<(), ValidationError> {
    if st.id.is_empty() {
        return Err(ValidationError::EmptySubTaskId(idx));
    }
    if st.title.is_empty() {
        return Err(ValidationError::EmptySubTaskTitle(idx));
    }
    if st.prompt.is_empty() {
        return Err(ValidationError::EmptyPrompt(idx));
    }
    if st.program.is_empty() {
        return Err(ValidationError::EmptyProgram(idx));
    }
    if parse_timeout(&st.timeout).map(|d| d.is_zero()).unwrap_or(true) {
        return Err(ValidationError::NonPositiveTimeout(idx));
    }
    Ok(())
}

/// Parse a Go-style duration string (`"30m"`, `"1h"`, `"2h30m"`) into a
/// [`std::time::Duration`]. Supports `h`, `m`, `s` unit suffixes, matching
/// the subset of `time.ParseDuration` the task file format actually uses.
pub fn parse_timeout(s: &str) -> Option<std::time::Duration> {
    if s.is_empty() {
        return None;
    }
    let mut total = std::time::Duration::ZERO;
    let mut num = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            continue;
        }
        let value: f64 = num.parse().ok()?;
        num.clear();
        let unit = match c {
            'h' => 3600.0,
            'm' => 60.0,
            's' => 1.0,
            _ => return None,
        };
        total += std::time::Duration::from_secs_f64(value * unit);
    }
    if !num.is_empty() {
        return None;
    }
    Some(total)
}

/// Update a single subtask's status/output/error and recompute the owning
/// main task's derived status. This is the single write path for subtask
/// transitions; callers must not mutate `sub_tasks[i].status` directly.
pub fn update_sub_task_status(
    mt: &mut MainTask,
    sub_task_id: &str,
    apply: impl FnOnce(&mut SubTask),
) -> bool {
    let Some(st) = mt.sub_tasks.iter_mut().find(|s| s.id == sub_task_id) else {
        return false;
    };
    apply(st);
    mt.recompute_status();
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub_task(id: &str, main_task_id: &str) -> SubTask {
        SubTask {
            id: id.to_string(),
            main_task_id: main_task_id.to_string(),
            title: "do thing".into(),
            prompt: "do the thing".into(),
            program: "claude".into(),
            completion_markers: vec![],
            timeout: "30m".into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            webhook_payload: None,
            output: String::new(),
            error_message: String::new(),
        }
    }

    fn main_task(n_subtasks: usize) -> MainTask {
        let id = "mt-1".to_string();
        MainTask {
            id: id.clone(),
            title: "Main".into(),
            worktree_path: String::new(),
            branch_name: String::new(),
            repo_path: "/repo".into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            webhook_url: String::new(),
            sub_tasks: (0..n_subtasks)
                .map(|i| sub_task(&format!("st-{i}"), &id))
                .collect(),
            completed_sub_tasks: 0,
            error_message: String::new(),
        }
    }

    #[test]
    fn validates_empty_subtasks() {
        let mt = main_task(0);
        assert_eq!(validate_main_task(&mt), Err(ValidationError::NoSubTasks));
    }

    #[test]
    fn validates_ok_task() {
        let mt = main_task(2);
        assert!(validate_main_task(&mt).is_ok());
    }

    #[test]
    fn validates_empty_subtask_title() {
        let mut mt = main_task(1);
        mt.sub_tasks[0].title = String::new();
        assert_eq!(
            validate_main_task(&mt),
            Err(ValidationError::EmptySubTaskTitle(0))
        );
    }

    #[test]
    fn validates_non_positive_timeout() {
        let mut mt = main_task(1);
        mt.sub_tasks[0].timeout = "0s".into();
        assert_eq!(
            validate_main_task(&mt),
            Err(ValidationError::NonPositiveTimeout(0))
        );
    }

    #[test]
    fn progress_empty_subtasks_is_100() {
        let mt = main_task(0);
        assert_eq!(mt.get_progress(), 100.0);
    }

    #[test]
    fn progress_reflects_completed_count() {
        let mut mt = main_task(4);
        mt.completed_sub_tasks = 1;
        assert_eq!(mt.get_progress(), 25.0);
    }

    #[test]
    fn update_sub_task_status_recomputes_completed() {
        let mut mt = main_task(2);
        update_sub_task_status(&mut mt, "st-0", |s| s.mark_completed("ok".into()));
        assert_eq!(mt.completed_sub_tasks, 1);
        assert_eq!(mt.status, TaskStatus::Running);

        update_sub_task_status(&mut mt, "st-1", |s| s.mark_completed("ok".into()));
        assert_eq!(mt.completed_sub_tasks, 2);
        assert_eq!(mt.status, TaskStatus::Completed);
        assert!(mt.completed_at.is_some());
    }

    #[test]
    fn update_sub_task_status_recomputes_failed() {
        let mut mt = main_task(2);
        update_sub_task_status(&mut mt, "st-0", |s| s.mark_failed("boom".into()));
        assert_eq!(mt.status, TaskStatus::Failed);
        assert_eq!(mt.error_message, "1 subtasks failed");
    }

    #[test]
    fn update_sub_task_status_unknown_id_is_noop() {
        let mut mt = main_task(1);
        let found = update_sub_task_status(&mut mt, "nope", |s| s.mark_completed("x".into()));
        assert!(!found);
        assert_eq!(mt.status, TaskStatus::Pending);
    }

    #[test]
    fn parse_timeout_handles_compound_durations() {
        assert_eq!(
            parse_timeout("2h30m"),
            Some(std::time::Duration::from_secs(2 * 3600 + 30 * 60))
        );
        assert_eq!(parse_timeout("30m"), Some(std::time::Duration::from_secs(30 * 60)));
        assert_eq!(parse_timeout(""), None);
        assert_eq!(parse_timeout("0s"), Some(std::time::Duration::ZERO));
    }

    #[test]
    fn subtask_terminal_states_never_revisited_by_helper_calls() {
        let mut st = sub_task("st-0", "mt-1");
        st.mark_completed("out".into());
        assert!(st.is_completed());
        assert_eq!(st.status, TaskStatus::Completed);
    }

    #[test]
    fn main_task_deserializes_from_a_hand_written_task_file() {
        let json = r#"{
            "title": "Fix login bug",
            "subtasks": [
                {"title": "write a failing test", "prompt": "add a regression test for the login bug"},
                {"title": "fix it", "prompt": "make the new test pass"}
            ]
        }"#;
        let mt: MainTask = serde_json::from_str(json).unwrap();
        assert!(mt.id.is_empty());
        assert_eq!(mt.status, TaskStatus::Pending);
        assert_eq!(mt.sub_tasks.len(), 2);
        assert!(mt.sub_tasks[0].id.is_empty());
        assert_eq!(mt.sub_tasks[0].status, TaskStatus::Pending);
    }
}
