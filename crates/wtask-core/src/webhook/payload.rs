//! Pure mapping from task state transitions to wire payloads.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::{MainTask, SubTask};

/// The JSON body sent to a webhook URL. Field names and optionality match
/// SPEC_FULL.md section 6 exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookPayload {
    pub event_type: String,
    pub main_task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub worktree_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub branch_name: String,
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<HashMap<String, Value>>,
}

fn base(mt: &MainTask, subtask_id: Option<String>) -> WebhookPayload {
    WebhookPayload {
        event_type: String::new(),
        main_task_id: mt.id.clone(),
        subtask_id,
        status: String::new(),
        worktree_path: mt.worktree_path.clone(),
        branch_name: mt.branch_name.clone(),
        timestamp: Utc::now(),
        output: String::new(),
        error_message: String::new(),
        progress: mt.get_progress(),
        custom_data: None,
    }
}

/// `subtask_started` payload.
pub fn sub_task_started(mt: &MainTask, st: &SubTask) -> WebhookPayload {
    let mut p = base(mt, Some(st.id.clone()));
    p.event_type = "subtask_started".to_string();
    p.status = "running".to_string();
    p.custom_data = st.webhook_payload.clone();
    p
}

/// `subtask_completed` payload for a successful subtask.
pub fn sub_task_completed_success(mt: &MainTask, st: &SubTask) -> WebhookPayload {
    let mut p = base(mt, Some(st.id.clone()));
    p.event_type = "subtask_completed".to_string();
    p.status = "success".to_string();
    p.output = st.output.clone();
    p.custom_data = st.webhook_payload.clone();
    p
}

/// `subtask_completed` payload for a failed subtask.
pub fn sub_task_completed_failed(mt: &MainTask, st: &SubTask) -> WebhookPayload {
    let mut p = base(mt, Some(st.id.clone()));
    p.event_type = "subtask_completed".to_string();
    p.status = "failed".to_string();
    p.error_message = st.error_message.clone();
    p.custom_data = st.webhook_payload.clone();
    p
}

/// `subtask_completed` payload for a timed-out subtask.
pub fn sub_task_completed_timeout(mt: &MainTask, st: &SubTask) -> WebhookPayload {
    let mut p = base(mt, Some(st.id.clone()));
    p.event_type = "subtask_completed".to_string();
    p.status = "timeout".to_string();
    p.error_message = st.error_message.clone();
    p.custom_data = st.webhook_payload.clone();
    p
}

fn summary_custom_data(mt: &MainTask) -> HashMap<String, Value> {
    let mut data = HashMap::new();
    data.insert("total_subtasks".to_string(), Value::from(mt.sub_tasks.len()));
    data.insert(
        "completed_subtasks".to_string(),
        Value::from(mt.completed_sub_tasks),
    );
    data.insert("title".to_string(), Value::from(mt.title.clone()));
    if let Some(completed_at) = mt.completed_at {
        let duration = completed_at - mt.created_at;
        data.insert(
            "duration".to_string(),
            Value::from(humanize_duration(duration)),
        );
    }
    data
}

/// Render a duration the way `time.Duration.String()` would for the
/// hour/minute/second range tasks run in, e.g. `"1h2m3.5s"`, `"45m0s"`, `"8s"`.
fn humanize_duration(d: chrono::Duration) -> String {
    let total_ms = d.num_milliseconds().max(0);
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let millis_remainder = total_ms % 60_000;
    let secs = millis_remainder as f64 / 1000.0;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if secs.fract() == 0.0 {
        out.push_str(&format!("{}s", secs as i64));
    } else {
        out.push_str(&format!("{secs:.3}s"));
    }
    out
}

/// `maintask_completed` payload (all subtasks succeeded).
pub fn main_task_completed(mt: &MainTask) -> WebhookPayload {
    let mut p = base(mt, None);
    p.event_type = "maintask_completed".to_string();
    p.status = "success".to_string();
    p.custom_data = Some(summary_custom_data(mt));
    p
}

/// `maintask_failed` payload (the loop broke on a subtask failure).
pub fn main_task_failed(mt: &MainTask) -> WebhookPayload {
    let mut p = base(mt, None);
    p.event_type = "maintask_failed".to_string();
    p.status = "failed".to_string();
    p.error_message = mt.error_message.clone();
    p.custom_data = Some(summary_custom_data(mt));
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use chrono::Utc;

    fn main_task() -> MainTask {
        MainTask {
            id: "mt-1".into(),
            title: "Main".into(),
            worktree_path: "/tmp/wt".into(),
            branch_name: "wtask/mt-1".into(),
            repo_path: "/repo".into(),
            status: TaskStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
            webhook_url: "https://example.com/hook".into(),
            sub_tasks: vec![],
            completed_sub_tasks: 0,
            error_message: String::new(),
        }
    }

    fn sub_task() -> SubTask {
        SubTask {
            id: "st-1".into(),
            main_task_id: "mt-1".into(),
            title: "step".into(),
            prompt: "do it".into(),
            program: "claude".into(),
            completion_markers: vec![],
            timeout: "30m".into(),
            status: TaskStatus::Completed,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
            webhook_payload: None,
            output: "done".into(),
            error_message: String::new(),
        }
    }

    #[test]
    fn sub_task_started_has_running_status() {
        let mt = main_task();
        let st = sub_task();
        let p = sub_task_started(&mt, &st);
        assert_eq!(p.event_type, "subtask_started");
        assert_eq!(p.status, "running");
        assert_eq!(p.subtask_id.as_deref(), Some("st-1"));
    }

    #[test]
    fn main_task_completed_includes_summary() {
        let mut mt = main_task();
        mt.completed_at = Some(Utc::now());
        let p = main_task_completed(&mt);
        assert_eq!(p.event_type, "maintask_completed");
        let data = p.custom_data.unwrap();
        assert!(data.contains_key("duration"));
        assert_eq!(data["title"], Value::from("Main"));
    }

    #[test]
    fn main_task_completed_omits_duration_without_completed_at() {
        let mt = main_task();
        let p = main_task_completed(&mt);
        let data = p.custom_data.unwrap();
        assert!(!data.contains_key("duration"));
    }

    #[test]
    fn humanize_duration_formats_hours_minutes_seconds() {
        assert_eq!(humanize_duration(chrono::Duration::seconds(8)), "8s");
        assert_eq!(humanize_duration(chrono::Duration::seconds(45 * 60)), "45m0s");
        assert_eq!(
            humanize_duration(chrono::Duration::seconds(3600 + 120 + 3)),
            "1h2m3s"
        );
    }

    #[test]
    fn payload_round_trips_through_json() {
        let mt = main_task();
        let st = sub_task();
        let p = sub_task_completed_success(&mt, &st);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(serde_json::from_str::<WebhookPayload>(&json).unwrap(), p);
    }
}
