//! State-model error types.

use thiserror::Error;

use crate::worker::ContainerStatus;

/// Errors from snapshot/broker mutations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("no function profile registered: {0}")]
    NoFunction(String),

    #[error("worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),
}

pub type StateResult<T> = Result<T, StateError>;

/// Errors from publishing function profiles.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("invalid function profile: {0}")]
    InvalidProfile(String),

    #[error("invalid v8 option for {function}: {option}")]
    InvalidV8Option { function: String, option: String },

    #[error("profile preset hook failed: {0}")]
    Preset(#[source] anyhow::Error),
}

/// How waiting for a worker's readiness can fail.
#[derive(Debug, Error)]
pub enum ReadyError {
    #[error("worker stopped before becoming ready ({0:?})")]
    Stopped(ContainerStatus),

    #[error("worker initialization timeout")]
    InitTimeout,
}
