//! tmux-backed [`Instance`] implementation.
//!
//! Shells out to the `tmux` binary: a detached session per instance,
//! `send-keys` to deliver input, `capture-pane` to read output. Failures
//! reading the pane are swallowed into an empty/false result rather than
//! propagated, matching the completion predicate's "any preview error means
//! not yet completed" rule (see SPEC_FULL.md section 4.3).

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;

use super::{Instance, InstanceOptions};

/// One tmux session, named after the instance title with a fixed prefix so
/// sessions are identifiable from outside the process (`tmux ls`).
pub struct TmuxInstance {
    session_name: Mutex<Option<String>>,
    last_preview: Mutex<String>,
}

impl Default for TmuxInstance {
    fn default() -> Self {
        Self {
            session_name: Mutex::new(None),
            last_preview: Mutex::new(String::new()),
        }
    }
}

impl TmuxInstance {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self) -> Option<String> {
        self.session_name.lock().unwrap().clone()
    }
}

fn sanitize(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

#[async_trait]
impl Instance for TmuxInstance {
    async fn start(&self, opts: &InstanceOptions, _first_time: bool) -> anyhow::Result<()> {
        let session_name = format!("wtask-{}", sanitize(&opts.title));

        let status = Command::new("tmux")
            .args(["new-session", "-d", "-s", &session_name, "-c", &opts.path])
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("tmux new-session failed for {session_name}");
        }

        let mut program_cmd = opts.program.clone();
        if opts.auto_yes {
            program_cmd.push_str(" --dangerously-skip-permissions");
        }

        let status = Command::new("tmux")
            .args(["send-keys", "-t", &session_name, &program_cmd, "Enter"])
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("tmux send-keys (launch) failed for {session_name}");
        }

        *self.session_name.lock().unwrap() = Some(session_name);
        Ok(())
    }

    async fn send_prompt(&self, prompt: &str) -> anyhow::Result<()> {
        let Some(session) = self.session() else {
            anyhow::bail!("send_prompt called before start");
        };
        let status = Command::new("tmux")
            .args(["send-keys", "-t", &session, prompt, "Enter"])
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("tmux send-keys (prompt) failed for {session}");
        }
        Ok(())
    }

    async fn preview(&self) -> anyhow::Result<String> {
        let Some(session) = self.session() else {
            return Ok(String::new());
        };
        let output = Command::new("tmux")
            .args(["capture-pane", "-t", &session, "-p", "-S", "-200"])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                Ok(String::from_utf8_lossy(&out.stdout).to_string())
            }
            _ => Ok(String::new()),
        }
    }

    async fn has_updated(&self) -> bool {
        let current = self.preview().await.unwrap_or_default();
        let mut last = self.last_preview.lock().unwrap();
        let changed = *last != current;
        *last = current;
        changed
    }

    async fn tmux_alive(&self) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        Command::new("tmux")
            .args(["has-session", "-t", &session])
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn kill(&self) -> anyhow::Result<()> {
        let Some(session) = self.session_name.lock().unwrap().take() else {
            return Ok(());
        };
        let _ = Command::new("tmux")
            .args(["kill-session", "-t", &session])
            .status()
            .await;
        Ok(())
    }
}
