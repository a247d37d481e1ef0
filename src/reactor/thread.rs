use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread::JoinHandle,
};

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tracing::debug;

use super::{Reactor, ReactorHandle};
use crate::{
    config::{EngineConfig, RegisterEventMode},
    error::EngineError,
};

/// A named OS thread running one [`Reactor`] until stopped.
pub struct ReactorThread {
    handle: ReactorHandle,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ReactorThread {
    /// Start the thread and wait for its loop to be created.
    pub fn spawn(
        name: &str,
        mode: RegisterEventMode,
        use_default_loop: bool,
    ) -> Result<Self, EngineError> {
        let (tx, rx) = bounded(1);
        let thread_name = name.to_owned();
        let join = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let mut reactor = match Reactor::new(&thread_name, mode, use_default_loop) {
                    Ok(reactor) => reactor,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                if tx.send(Ok(reactor.handle())).is_err() {
                    return;
                }
                reactor.run();
            })?;

        let handle = match rx.recv() {
            Ok(result) => result?,
            Err(_) => return Err(EngineError::ReactorStopped),
        };
        debug!(name, use_default_loop, "started ev thread");
        Ok(Self {
            handle,
            join: Mutex::new(Some(join)),
        })
    }

    pub fn handle(&self) -> &ReactorHandle {
        &self.handle
    }

    /// Break the loop and join the thread. Idempotent.
    pub fn stop(&self) {
        let Some(join) = self.join.lock().take() else {
            return;
        };
        self.handle.request_break();
        if self.handle.is_in_ev_thread() {
            // joining ourselves would deadlock, the loop exits on its own
            return;
        }
        if join.join().is_err() {
            tracing::error!(name = self.handle.name(), "ev thread panicked");
        }
        debug!(name = self.handle.name(), "joined ev thread");
    }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The fixed set of reactor threads shared by a task processor.
pub struct ReactorPool {
    threads: Vec<ReactorThread>,
    next: AtomicUsize,
}

impl ReactorPool {
    /// Spawn `config.ev_threads` reactors. With `use_default_ev_loop` set,
    /// the first of them owns the process-wide default loop.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let threads = (0..config.ev_threads)
            .map(|i| {
                let name = format!("{}-{i}", config.ev_thread_name);
                let use_default_loop = config.use_default_ev_loop && i == 0;
                ReactorThread::spawn(&name, config.register_event_mode, use_default_loop)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            threads,
            next: AtomicUsize::new(0),
        })
    }

    /// Round-robin pick for the next timer.
    pub fn next_timer_thread(&self) -> &ReactorHandle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[i].handle()
    }

    pub fn default_loop(&self) -> Option<&ReactorHandle> {
        self.threads
            .iter()
            .map(ReactorThread::handle)
            .find(|h| h.uses_default_loop())
    }

    pub fn get(&self, i: usize) -> Option<&ReactorHandle> {
        self.threads.get(i).map(ReactorThread::handle)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn stop(&self) {
        for thread in &self.threads {
            thread.stop();
        }
    }
}
