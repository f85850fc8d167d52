//! The engine's closed error taxonomy.
//!
//! Each variant corresponds to one of the error categories in SPEC_FULL.md
//! section 7. Validation and setup errors are reported synchronously by
//! [`crate::manager::TaskManager::execute`]; subtask-fatal and timeout
//! errors short-circuit a main task's loop but are not returned to the
//! caller of `execute` (the loop runs in the background).

use crate::task::ValidationError;
use crate::worktree::WorktreeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("main task validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("worktree setup failed: {0}")]
    WorktreeSetup(#[from] WorktreeError),

    #[error("main task {0} not found")]
    MainTaskNotFound(String),

    #[error("main task {0} is already tracked")]
    AlreadyTracked(String),

    #[error("instance error: {0}")]
    Instance(String),

    #[error("subtask timed out after {0}")]
    SubTaskTimedOut(String),

    #[error("engine was cancelled")]
    Cancelled,
}
