//! Per-thread event loops.
//!
//! A [`Reactor`] is confined to the thread that created it: it owns the OS
//! poll, the native timers and the consuming end of its dispatch queue.
//! Everything other threads need lives behind a cloneable [`ReactorHandle`].

pub mod child;
mod io;
pub mod queue;
pub mod thread;
mod timers;

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::ThreadId,
    time::{Duration, Instant},
};

use tracing::{debug, error, trace, warn};

use crate::{config::RegisterEventMode, deadline::Deadline, error::EngineError};

use queue::{dispatch_queue, Consumer, Payload, Producer};
pub use timers::TimerKey;

/// Upper bound on how long a deferred-mode reactor sleeps between ticks.
pub const PERIODIC_EVENTS_DRIVER_INTERVAL: Duration = Duration::from_millis(1);

// deferred submissions closer than this still wake the loop
const IMMEDIATE_SETUP_THRESHOLD: Duration = Duration::from_millis(2);

// immediate-mode reactors are always woken explicitly
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

static DEFAULT_LOOP_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Ownership of the process-wide default loop. Released on drop.
struct DefaultLoopClaim;

impl DefaultLoopClaim {
    fn acquire(thread_name: &str) -> Result<Self, EngineError> {
        if DEFAULT_LOOP_CLAIMED.swap(true, Ordering::AcqRel) {
            return Err(EngineError::DefaultLoopClaimed(thread_name.to_owned()));
        }
        debug!(thread_name, "acquire default ev loop");
        Ok(Self)
    }
}

impl Drop for DefaultLoopClaim {
    fn drop(&mut self) {
        debug!("release default ev loop");
        DEFAULT_LOOP_CLAIMED.store(false, Ordering::Release);
    }
}

pub(crate) struct Shared {
    name: String,
    producer: Producer,
    waker: Arc<mio::Waker>,
    thread_id: ThreadId,
    mode: RegisterEventMode,
    uses_default_loop: bool,
    stopping: AtomicBool,
}

/// Thread-safe submission side of a reactor.
#[derive(Clone)]
pub struct ReactorHandle(Arc<Shared>);

/// Non-owning [`ReactorHandle`]
#[derive(Clone)]
pub struct WeakReactorHandle(Weak<Shared>);

impl WeakReactorHandle {
    pub fn upgrade(&self) -> Option<ReactorHandle> {
        self.0.upgrade().map(ReactorHandle)
    }
}

impl ReactorHandle {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn uses_default_loop(&self) -> bool {
        self.0.uses_default_loop
    }

    pub fn is_in_ev_thread(&self) -> bool {
        std::thread::current().id() == self.0.thread_id
    }

    pub fn downgrade(&self) -> WeakReactorHandle {
        WeakReactorHandle(Arc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &ReactorHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Run `payload` on the reactor thread, waking the loop if needed.
    ///
    /// Payloads pushed by one thread run in push order. A payload is
    /// guaranteed to run unless the reactor is stopped first.
    pub fn run_in_ev_loop_async(&self, payload: Payload) -> Result<(), EngineError> {
        self.register_in_ev_loop(payload)?;
        if !self.is_in_ev_thread() {
            self.notify();
        }
        Ok(())
    }

    /// Like [`run_in_ev_loop_async`](Self::run_in_ev_loop_async), but in
    /// deferred mode skips the wakeup unless `deadline` is close: the
    /// periodic driver tick picks the payload up in time.
    pub fn run_in_ev_loop_deferred(
        &self,
        payload: Payload,
        deadline: Deadline,
    ) -> Result<(), EngineError> {
        match self.0.mode {
            RegisterEventMode::Immediate => self.run_in_ev_loop_async(payload),
            RegisterEventMode::Deferred => {
                let urgent = matches!(
                    deadline.time_left(),
                    Some(left) if left < IMMEDIATE_SETUP_THRESHOLD
                );
                if urgent {
                    self.run_in_ev_loop_async(payload)
                } else {
                    self.register_in_ev_loop(payload)
                }
            }
        }
    }

    /// Forward an OS child exit notification to this reactor.
    ///
    /// Only the reactor owning the default loop tracks child processes.
    pub fn notify_child_exit(
        &self,
        pid: u32,
        status: std::process::ExitStatus,
    ) -> Result<(), EngineError> {
        if !self.uses_default_loop() {
            return Err(EngineError::NotDefaultLoop);
        }
        self.run_in_ev_loop_async(Payload::once(move |_| child::handle_exit(pid, status)))
    }

    fn register_in_ev_loop(&self, payload: Payload) -> Result<(), EngineError> {
        self.0.producer.push(payload).map_err(|payload| {
            error!(
                reactor = %self.0.name,
                kind = payload.kind(),
                "some work was enqueued on a dead reactor"
            );
            EngineError::ReactorStopped
        })
    }

    fn notify(&self) {
        if let Err(e) = self.0.waker.wake() {
            warn!(reactor = %self.0.name, "failed to wake ev loop: {e}");
        }
    }

    pub(crate) fn request_break(&self) {
        self.0.stopping.store(true, Ordering::Release);
        self.notify();
    }
}

/// A thread-confined event loop.
pub struct Reactor {
    timers: timers::Queue,
    consumer: Consumer,
    shared: Arc<Shared>,
    os: io::Os,
    // dropped last so the next default reactor only starts after us
    _default_loop: Option<DefaultLoopClaim>,
}

impl Reactor {
    /// Create a loop bound to the calling thread.
    ///
    /// Fails with [`EngineError::DefaultLoopClaimed`] if `use_default_loop`
    /// is set while another live reactor owns the default loop.
    pub fn new(
        name: &str,
        mode: RegisterEventMode,
        use_default_loop: bool,
    ) -> Result<Self, EngineError> {
        let default_loop = if use_default_loop {
            Some(DefaultLoopClaim::acquire(name)?)
        } else {
            None
        };
        let (os, waker) = io::Os::new()?;
        let (producer, consumer) = dispatch_queue();

        let shared = Arc::new(Shared {
            name: name.to_owned(),
            producer,
            waker,
            thread_id: std::thread::current().id(),
            mode,
            uses_default_loop: use_default_loop,
            stopping: AtomicBool::new(false),
        });

        Ok(Self {
            timers: timers::Queue::default(),
            consumer,
            shared,
            os,
            _default_loop: default_loop,
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle(self.shared.clone())
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// A single tick: wait for the OS, fire due timers, drain the queue.
    ///
    /// Returns the number of timers and payloads run.
    pub fn run_once(&mut self) -> std::io::Result<usize> {
        let timeout = self.poll_timeout();
        self.os.process(Some(timeout))?;
        let fired = self.fire_due_timers();
        Ok(fired + self.drain_queue())
    }

    /// Tick until a break is requested, then drain the queue one last time.
    pub fn run(&mut self) {
        debug!(reactor = %self.shared.name, "ev loop started");
        while !self.is_stopping() {
            if let Err(e) = self.run_once() {
                error!(reactor = %self.shared.name, "ev loop poll failed: {e}");
                break;
            }
        }
        self.drain_queue();
        debug!(reactor = %self.shared.name, "ev loop stopped");
    }

    /// Arm (or re-arm) the native timer `key`.
    pub fn arm_timer(
        &mut self,
        key: TimerKey,
        at: Instant,
        callback: impl FnOnce(&mut Reactor) + Send + 'static,
    ) {
        trace!(reactor = %self.shared.name, ?key, "arm native timer");
        self.timers.arm(key, at, Box::new(callback));
    }

    pub fn disarm_timer(&mut self, key: TimerKey) -> bool {
        self.timers.disarm(key)
    }

    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    fn poll_timeout(&mut self) -> Duration {
        if !self.consumer.is_empty() || self.is_stopping() {
            return Duration::ZERO;
        }
        let cap = match self.shared.mode {
            RegisterEventMode::Deferred => PERIODIC_EVENTS_DRIVER_INTERVAL,
            RegisterEventMode::Immediate => IDLE_POLL_INTERVAL,
        };
        match self.timers.next_deadline() {
            Some(at) => at.saturating_duration_since(Instant::now()).min(cap),
            None => cap,
        }
    }

    fn fire_due_timers(&mut self) -> usize {
        let due = self.timers.take_due(Instant::now());
        let n = due.len();
        for callback in due {
            self.run_guarded("timer", callback);
        }
        n
    }

    fn drain_queue(&mut self) -> usize {
        let mut n = 0;
        while let Some(payload) = self.consumer.try_pop() {
            let kind = payload.kind();
            trace!(reactor = %self.shared.name, kind, "perform payload");
            self.run_guarded(kind, |reactor| payload.perform(reactor));
            n += 1;
        }
        n
    }

    fn run_guarded(&mut self, kind: &'static str, f: impl FnOnce(&mut Reactor)) {
        if catch_unwind(AssertUnwindSafe(|| f(self))).is_err() {
            warn!(reactor = %self.shared.name, kind, "panic in ev loop callback");
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let left = self.consumer.len();
        if left > 0 {
            error!(
                reactor = %self.shared.name,
                left, "some work was enqueued on a dead reactor"
            );
        }
    }
}
