//! Error types for engine construction and waits.

use thiserror::Error;

use crate::task::CancellationReason;

/// Errors produced while setting up or talking to reactors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A second reactor tried to claim the process-wide default loop.
    #[error("trying to use more than one default ev loop, thread_name={0}")]
    DefaultLoopClaimed(String),
    /// The OS notification primitive could not be created.
    #[error("event loop io error: {0}")]
    Io(#[from] std::io::Error),
    /// Rejected configuration values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Child process notifications only go to the default loop.
    #[error("child process exits are only handled by the default ev loop")]
    NotDefaultLoop,
    /// The reactor thread has already been stopped.
    #[error("reactor has been stopped")]
    ReactorStopped,
}

/// Errors observed when waiting for a task's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The awaited task finished without running to completion.
    #[error("task cancelled: {0}")]
    Cancelled(CancellationReason),
    /// The waiting task itself was cancelled.
    #[error("wait interrupted: {0}")]
    WaitInterrupted(CancellationReason),
    /// The wait deadline expired first.
    #[error("deadline expired")]
    Timeout,
    /// The result has already been taken out of the handle.
    #[error("task result has already been retrieved")]
    AlreadyRetrieved,
    /// The task body panicked, so there is no result.
    #[error("task panicked")]
    Panicked,
}

/// Errors observed when waiting on a [`PromiseFuture`](crate::sync::PromiseFuture).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FutureError {
    /// The promise was dropped without a value.
    #[error("broken promise")]
    BrokenPromise,
    /// The value has already been taken.
    #[error("future value has already been retrieved")]
    AlreadyRetrieved,
    /// The waiting task was cancelled.
    #[error("wait interrupted: {0}")]
    WaitInterrupted(CancellationReason),
    /// The wait deadline expired first.
    #[error("deadline expired")]
    Timeout,
}
