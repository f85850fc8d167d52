//! The subtask executor: runs one subtask to completion against an
//! instance, enforcing its timeout and evaluating the completion
//! predicate.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::instance::Instance;
use crate::task::parse_timeout;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct SubTaskOutcome {
    pub output: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("instance failed to start: {0}")]
    StartFailed(String),
    #[error("failed to send prompt: {0}")]
    PromptFailed(String),
    #[error("subtask timed out after {0}")]
    TimedOut(String),
    #[error("cancelled")]
    Cancelled,
}

/// Send `prompt` to an already-started `instance` and wait for completion
/// per the given `timeout` string and `completion_markers`. The caller
/// starts the instance (and registers it, so a health check can observe it
/// while this runs) before calling this function, and is responsible for
/// killing it afterward on every return path -- this function only drives
/// the instance, it does not own its lifecycle.
pub async fn run_sub_task(
    instance: &dyn Instance,
    prompt: &str,
    timeout: &str,
    completion_markers: &[String],
    cancel: &CancellationToken,
) -> Result<SubTaskOutcome, ExecutorError> {
    instance
        .send_prompt(prompt)
        .await
        .map_err(|e| ExecutorError::PromptFailed(e.to_string()))?;

    let deadline = parse_timeout(timeout).unwrap_or(Duration::from_secs(30 * 60));
    let deadline_fut = tokio::time::sleep(deadline);
    tokio::pin!(deadline_fut);

    loop {
        tokio::select! {
            _ = &mut deadline_fut => {
                return Err(ExecutorError::TimedOut(timeout.to_string()));
            }
            _ = cancel.cancelled() => {
                return Err(ExecutorError::Cancelled);
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                if check_completion(instance, completion_markers).await {
                    let output = instance.preview().await.unwrap_or_default();
                    return Ok(SubTaskOutcome { output });
                }
            }
        }
    }
}

/// Evaluate the completion predicate for one poll tick.
///
/// Non-empty markers: substring match against the current preview, first
/// match wins. Empty markers: fall back to the idle heuristic -- completion
/// iff the instance reports no update since the last check. Any preview
/// error is treated as "not yet completed".
async fn check_completion(instance: &dyn Instance, completion_markers: &[String]) -> bool {
    if completion_markers.is_empty() {
        return !instance.has_updated().await;
    }

    match instance.preview().await {
        Ok(preview) => completion_markers.iter().any(|marker| preview.contains(marker.as_str())),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::fakes::FakeInstance;

    #[tokio::test(start_paused = true)]
    async fn completes_via_marker_match() {
        let instance = FakeInstance {
            previews: std::sync::Mutex::new(vec!["working...".into(), "DONE: all set".into()]),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let result = run_sub_task(&instance, "do it", "30m", &["DONE:".to_string()], &cancel)
            .await
            .unwrap();
        assert!(result.output.contains("DONE"));
    }

    #[tokio::test(start_paused = true)]
    async fn completes_via_idle_heuristic() {
        let instance = FakeInstance {
            updated: std::sync::Mutex::new(vec![true, false]),
            previews: std::sync::Mutex::new(vec!["final output".into()]),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let result = run_sub_task(&instance, "do it", "30m", &[], &cancel)
            .await
            .unwrap();
        assert_eq!(result.output, "final output");
    }

    #[tokio::test]
    async fn prompt_failure_is_surfaced() {
        let instance = FakeInstance {
            fail_prompt: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let result = run_sub_task(&instance, "do it", "30m", &[], &cancel).await;
        assert!(matches!(result, Err(ExecutorError::PromptFailed(_))));
    }

    #[tokio::test]
    async fn cancellation_is_surfaced() {
        let instance = FakeInstance::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_sub_task(&instance, "do it", "30m", &[], &cancel).await;
        assert!(matches!(result, Err(ExecutorError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_marker_string_matches_on_first_tick() {
        let instance = FakeInstance {
            previews: std::sync::Mutex::new(vec!["anything".into()]),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let result = run_sub_task(&instance, "do it", "30m", &["".to_string()], &cancel)
            .await
            .unwrap();
        assert_eq!(result.output, "anything");
    }
}
