use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    task::{Context, Poll},
    thread::JoinHandle,
    time::Duration,
};

use chashmap::CHashMap;
use parking_lot::{Condvar, Mutex};
use pin_project::pin_project;
use tracing::{debug, error, warn};

use super::{
    current,
    ready::{self, Job},
    CancellationReason, TaskBody, TaskContext, TaskState, TaskWithResult,
};
use crate::{
    config::EngineConfig, deadline::Deadline, error::EngineError, reactor::thread::ReactorPool,
};

/// Task body writing the output of `fut` into the handle's slot.
#[pin_project]
struct StoreResult<F: Future> {
    #[pin]
    fut: F,
    slot: Arc<Mutex<Option<F::Output>>>,
}

impl<F: Future> Future for StoreResult<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        let value = futures::ready!(this.fut.poll(cx));
        *this.slot.lock() = Some(value);
        Poll::Ready(())
    }
}

/// A pool of worker threads stepping tasks, plus the reactors serving
/// their timers.
pub struct TaskProcessor {
    config: EngineConfig,
    ready: ready::Queue,
    reactors: ReactorPool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    stopped: AtomicBool,
    tasks: CHashMap<u64, Weak<TaskContext>>,
    alive: AtomicUsize,
    exhausted: (Mutex<()>, Condvar),
    next_task_id: AtomicU64,
}

impl TaskProcessor {
    /// Validate `config`, then start reactors and workers.
    pub fn start(config: EngineConfig) -> Result<Arc<Self>, EngineError> {
        config.validate()?;
        let reactors = ReactorPool::new(&config)?;
        let processor = Arc::new(Self {
            ready: ready::Queue::default(),
            reactors,
            workers: Mutex::new(Vec::with_capacity(config.worker_threads)),
            shutting_down: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: CHashMap::new(),
            alive: AtomicUsize::new(0),
            exhausted: (Mutex::new(()), Condvar::new()),
            next_task_id: AtomicU64::new(1),
            config,
        });

        let mut workers = processor.workers.lock();
        for i in 0..processor.config.worker_threads {
            let jobs = processor.ready.worker();
            let worker = std::thread::Builder::new()
                .name(format!("{}-{i}", processor.config.thread_name))
                .spawn(move || {
                    while let Ok(Job::Run(task)) = jobs.recv() {
                        task.step();
                    }
                })?;
            workers.push(worker);
        }
        drop(workers);

        debug!(
            workers = processor.config.worker_threads,
            ev_threads = processor.reactors.len(),
            "task processor started"
        );
        Ok(processor)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn reactors(&self) -> &ReactorPool {
        &self.reactors
    }

    pub fn ready_queue_len(&self) -> usize {
        self.ready.len()
    }

    /// Tasks spawned and not yet finished.
    pub fn alive_tasks(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Queue `task` for a worker.
    pub(crate) fn schedule(&self, task: Arc<TaskContext>) {
        if self.stopped.load(Ordering::Acquire) {
            // no worker left to step it
            task.request_cancel(CancellationReason::Shutdown);
            if !task.is_finished() {
                task.finish(TaskState::Cancelled);
            }
            return;
        }
        if self.is_shutting_down() {
            task.request_cancel(CancellationReason::Shutdown);
        } else if let Some(threshold) = self.config.task_queue_overload_threshold {
            let queued = self.ready.len();
            if !task.is_critical() && !task.has_started() && queued >= threshold {
                warn!(
                    task = task.id(),
                    queued,
                    threshold,
                    "task queue overloaded, cancelling task"
                );
                task.request_cancel(CancellationReason::Overload);
            }
        }
        self.ready.push(Job::Run(task));
        if self.stopped.load(Ordering::Acquire) {
            // raced with the final drain
            self.drain_ready();
        }
    }

    pub fn spawn<F>(self: &Arc<Self>, fut: F) -> TaskWithResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_impl(fut, false, Deadline::unreachable())
    }

    /// Spawn a task that is cancelled with [`CancellationReason::Deadline`]
    /// once `deadline` is reached.
    pub fn spawn_with_deadline<F>(
        self: &Arc<Self>,
        deadline: Deadline,
        fut: F,
    ) -> TaskWithResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_impl(fut, false, deadline)
    }

    /// Spawn a task that runs its body even if cancelled before its first
    /// step, and is never cancelled for overload.
    pub fn spawn_critical<F>(self: &Arc<Self>, fut: F) -> TaskWithResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_impl(fut, true, Deadline::unreachable())
    }

    fn spawn_impl<F>(
        self: &Arc<Self>,
        fut: F,
        is_critical: bool,
        deadline: Deadline,
    ) -> TaskWithResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let result = Arc::new(Mutex::new(None));
        let body: TaskBody = Box::pin(StoreResult {
            fut,
            slot: result.clone(),
        });

        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let context = TaskContext::new(id, self.clone(), is_critical, deadline, body);
        self.alive.fetch_add(1, Ordering::SeqCst);
        self.tasks.insert(id, Arc::downgrade(&context));
        context.schedule();
        TaskWithResult::new(context, result)
    }

    pub(crate) fn task_finished(&self, id: u64) {
        self.tasks.remove(&id);
        if self.alive.fetch_sub(1, Ordering::SeqCst) <= 2 {
            let _guard = self.exhausted.0.lock();
            self.exhausted.1.notify_all();
        }
    }

    fn live_tasks(&self) -> Vec<Arc<TaskContext>> {
        let live = Mutex::new(Vec::new());
        self.tasks.retain(|_, task| {
            if let Some(task) = task.upgrade() {
                live.lock().push(task);
            }
            true
        });
        live.into_inner()
    }

    // blocks until at most `allowed` tasks are alive
    fn wait_for_exhaustion(&self, allowed: usize) {
        let mut guard = self.exhausted.0.lock();
        while self.alive_tasks() > allowed {
            self.exhausted
                .1
                .wait_for(&mut guard, Duration::from_millis(10));
        }
    }

    fn drain_ready(&self) {
        while let Some(job) = self.ready.try_poll() {
            if let Job::Run(task) = job {
                if !task.is_finished() {
                    task.request_cancel(CancellationReason::Shutdown);
                    task.finish(TaskState::Cancelled);
                }
            }
        }
    }

    /// Cancel every live task, wait for all of them to finish, then stop the
    /// workers and reactors. Idempotent.
    ///
    /// Called from inside one of this processor's tasks, it does not wait:
    /// the caller's own worker could never step the remaining tasks.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let live = self.live_tasks();
        debug!(live = live.len(), "task processor shutting down");
        for task in &live {
            task.request_cancel(CancellationReason::Shutdown);
        }
        drop(live);

        let on_worker = current::try_current()
            .is_some_and(|task| std::ptr::eq(Arc::as_ptr(task.processor()), self));
        if !on_worker {
            self.wait_for_exhaustion(0);
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for _ in &workers {
            self.ready.push(Job::Stop);
        }
        let this_thread = std::thread::current().id();
        for worker in workers {
            if worker.thread().id() == this_thread {
                continue;
            }
            if worker.join().is_err() {
                error!("task worker panicked");
            }
        }

        self.stopped.store(true, Ordering::Release);
        self.drain_ready();
        self.reactors.stop();
        debug!(alive = self.alive_tasks(), "task processor stopped");
    }
}
