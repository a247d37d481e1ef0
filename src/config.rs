//! Construction-time settings for reactors and the worker pool.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// How cross-thread submissions notify a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterEventMode {
    /// Every cross-thread submission wakes the reactor.
    Immediate,
    /// The reactor ticks at least every millisecond and picks up far-off
    /// submissions on its own; only urgent ones wake it.
    #[default]
    Deferred,
}

/// Settings for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads polling tasks.
    pub worker_threads: usize,
    /// Reactor threads driving timers and dispatch payloads.
    pub ev_threads: usize,
    /// Name prefix for worker threads.
    pub thread_name: String,
    /// Name prefix for reactor threads.
    pub ev_thread_name: String,
    /// Whether the first reactor claims the process-wide default loop.
    pub use_default_ev_loop: bool,
    pub register_event_mode: RegisterEventMode,
    /// Ready queue length at which new non-critical tasks are cancelled.
    pub task_queue_overload_threshold: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
            ev_threads: 2,
            thread_name: "task-worker".into(),
            ev_thread_name: "event-worker".into(),
            use_default_ev_loop: false,
            register_event_mode: RegisterEventMode::default(),
            task_queue_overload_threshold: None,
        }
    }
}

impl EngineConfig {
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn with_ev_threads(mut self, ev_threads: usize) -> Self {
        self.ev_threads = ev_threads;
        self
    }

    pub fn with_default_ev_loop(mut self, use_default_ev_loop: bool) -> Self {
        self.use_default_ev_loop = use_default_ev_loop;
        self
    }

    pub fn with_register_event_mode(mut self, mode: RegisterEventMode) -> Self {
        self.register_event_mode = mode;
        self
    }

    pub fn with_overload_threshold(mut self, threshold: usize) -> Self {
        self.task_queue_overload_threshold = Some(threshold);
        self
    }

    /// Validate thread counts and names.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.worker_threads == 0 {
            return Err(EngineError::InvalidConfig(
                "worker_threads must be greater than 0".into(),
            ));
        }
        if self.ev_threads == 0 {
            return Err(EngineError::InvalidConfig(
                "ev_threads must be greater than 0".into(),
            ));
        }
        if self.thread_name.is_empty() || self.ev_thread_name.is_empty() {
            return Err(EngineError::InvalidConfig(
                "thread names must not be empty".into(),
            ));
        }
        if self.task_queue_overload_threshold == Some(0) {
            return Err(EngineError::InvalidConfig(
                "task_queue_overload_threshold must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate it.
    pub fn from_json_str(input: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = serde_json::from_str(input)
            .map_err(|e| EngineError::InvalidConfig(format!("parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}
