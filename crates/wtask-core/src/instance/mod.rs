//! The instance driver: supervises one external program session inside a
//! terminal multiplexer.
//!
//! An [`Instance`] fronts a single subtask's program. The trait is kept
//! deliberately narrow (start, prompt, preview, liveness, kill) so the
//! executor is agnostic to how sessions are actually hosted; the default
//! adapter ([`tmux::TmuxInstance`]) is a tmux pane.

pub mod tmux;

use async_trait::async_trait;

/// Options needed to start an instance.
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    /// Session/window title, conventionally `"<main_task_id>-<subtask_id>"`.
    pub title: String,
    /// Working directory the program runs in (the subtask's worktree).
    pub path: String,
    /// Program to execute, e.g. `"claude"`.
    pub program: String,
    /// Whether the program should be launched with auto-accept/yes flags.
    pub auto_yes: bool,
}

/// A supervised session of an external program.
///
/// Implementations must make `kill` safe to call on an instance that was
/// never started or already killed (idempotent cleanup).
#[async_trait]
pub trait Instance: Send + Sync {
    /// Start the underlying session and launch the program inside it.
    /// `first_time` distinguishes initial creation from (unsupported, in
    /// this version) session reattachment.
    async fn start(&self, opts: &InstanceOptions, first_time: bool) -> anyhow::Result<()>;

    /// Deliver a prompt to the running program.
    async fn send_prompt(&self, prompt: &str) -> anyhow::Result<()>;

    /// Fetch the currently visible output buffer. On any underlying error,
    /// implementations should still return *some* result rather than
    /// erroring out of the wait loop; callers treat an `Err` here as "not
    /// yet completed" for that tick.
    async fn preview(&self) -> anyhow::Result<String>;

    /// Whether the visible output has changed since the last call to
    /// `preview`/`has_updated`. Used by the idle-completion heuristic when
    /// a subtask declares no completion markers.
    async fn has_updated(&self) -> bool;

    /// Whether the underlying terminal session is still alive.
    async fn tmux_alive(&self) -> bool;

    /// Tear down the session. Idempotent.
    async fn kill(&self) -> anyhow::Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Instance) {}
};
