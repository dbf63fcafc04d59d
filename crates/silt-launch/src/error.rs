//! Launch error types.

use thiserror::Error;

use silt_state::{ReadyError, StateError};
use silt_supervisor::TurfError;

/// Errors that can fail a worker launch. Reported per call; the autoscale
/// cycle logs them and keeps going.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no function profile registered: {0}")]
    NoFunction(String),

    #[error(
        "virtual memory pool exhausted launching {function}: \
         need {need} bytes, {available} available"
    )]
    NoEnoughVirtualMemory {
        function: String,
        need: u64,
        available: u64,
    },

    #[error("failed to ensure code bundle for {function}: {source}")]
    EnsureCodeFailed {
        function: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to write bundle spec: {0}")]
    BundleSpec(#[from] std::io::Error),

    #[error("failed to serialize bundle spec: {0}")]
    SpecSerialize(#[from] serde_json::Error),

    #[error("supervisor command failed: {0}")]
    Supervisor(#[from] TurfError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("worker failed to become ready: {0}")]
    Ready(#[from] ReadyError),
}

pub type LaunchResult<T> = Result<T, LaunchError>;
