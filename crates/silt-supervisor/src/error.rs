//! Supervisor error types.
//!
//! turf surfaces failures as negative errno-style return codes. Callers
//! filter on [`TurfError::is_transient`] (worth retrying) and
//! [`TurfError::is_gone`] (the sandbox is already dead, which for `stop`
//! and `delete` is success).

use thiserror::Error;

/// `ENOENT`: no such sandbox.
pub const CODE_NOENT: i32 = -2;
/// `ECHILD`: no child process to wait on.
pub const CODE_CHILD: i32 = -10;
/// `EAGAIN` (linux): resource temporarily unavailable.
pub const CODE_AGAIN_LINUX: i32 = -11;
/// `EAGAIN` (darwin).
pub const CODE_AGAIN_DARWIN: i32 = -35;
/// `EINVAL`: invalid argument.
pub const CODE_INVAL: i32 = -22;

/// Errors from driving the turf CLI.
#[derive(Debug, Error)]
pub enum TurfError {
    #[error("failed to spawn turf: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("turf {command} failed (code {code:?}): {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unparsable turf output: {0}")]
    Parse(String),
}

pub type TurfResult<T> = Result<T, TurfError>;

impl TurfError {
    /// The supervisor return code, if the command ran and exited.
    pub fn code(&self) -> Option<i32> {
        match self {
            TurfError::Command { code, .. } => *code,
            _ => None,
        }
    }

    /// EAGAIN-class failure: the operation may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self.code(), Some(CODE_AGAIN_LINUX) | Some(CODE_AGAIN_DARWIN))
    }

    /// The sandbox is already gone (ENOENT / ECHILD).
    pub fn is_gone(&self) -> bool {
        matches!(self.code(), Some(CODE_NOENT) | Some(CODE_CHILD))
    }
}
