#![forbid(unsafe_code)]

//! Reactor threads, deadline timers and wait-any for cooperatively
//! scheduled tasks.
//!
//! An [`Engine`] owns a pool of worker threads stepping tasks and a pool of
//! reactor threads driving timers and cross-thread dispatch. Tasks suspend
//! through [`wait`] primitives, are woken by sleep-epoch guarded wakeups and
//! are cancelled cooperatively.

#[macro_use]
extern crate educe;

use std::{future::Future, sync::Arc};

pub mod config;
pub mod deadline;
pub mod error;
pub mod reactor;
pub mod sync;
pub mod task;
pub mod telemetry;
pub mod timer;
pub mod wait;

pub use config::{EngineConfig, RegisterEventMode};
pub use deadline::Deadline;
pub use error::{EngineError, FutureError, TaskError};
pub use task::{current as current_task, CancellationReason, TaskProcessor, TaskWithResult};
pub use timer::{DeadlineTimer, TimerAction, TimerTarget};
pub use wait::{
    sleep_for, sleep_until,
    wait_any::{wait_any, wait_any_for, wait_any_until, Awaitable},
    yield_now,
};

/// A running task processor. Shuts down when dropped.
pub struct Engine {
    processor: Arc<TaskProcessor>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Ok(Self {
            processor: TaskProcessor::start(config)?,
        })
    }

    pub fn task_processor(&self) -> &Arc<TaskProcessor> {
        &self.processor
    }

    /// Spawn a task on this engine.
    /// Task execution begins eagerly, without needing you to await it
    pub fn spawn<F>(&self, fut: F) -> TaskWithResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.processor.spawn(fut)
    }

    /// Run a future as a critical task and block the calling thread until
    /// it finishes.
    ///
    /// Must not be called from a worker thread.
    pub fn block_on<F>(&self, fut: F) -> Result<F::Output, TaskError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        futures::executor::block_on(self.processor.spawn_critical(fut))
    }

    pub fn shutdown(&self) {
        self.processor.shutdown();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.processor.shutdown();
    }
}

/// Spawn a future on the current task processor.
/// Returns a handle that can be later awaited for its output.
///
/// # Panics
/// When called outside of a task.
pub fn spawn<F>(fut: F) -> TaskWithResult<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    current_task::task_processor().spawn(fut)
}

/// Run a future to completion.
///
/// Starts a new engine with the default configuration and runs the future
/// on it.
pub fn block_on<F>(fut: F) -> anyhow::Result<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let engine = Engine::new(EngineConfig::default())?;
    Ok(engine.block_on(fut)?)
}
