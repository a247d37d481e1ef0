//! Deadline timers bound to a task and a reactor.
//!
//! Native timers may only be touched on the reactor thread, so a
//! [`DeadlineTimer`] never arms anything itself. It writes the latest
//! requested parameters into a single slot and submits its shared core as a
//! repeatable payload; the reactor drains the slot and arms, re-arms or
//! drops the native timer. Every request bumps a generation counter, so an
//! arm request or a native expiry that has been superseded is discarded.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    deadline::Deadline,
    reactor::{
        queue::{Payload, PayloadLink, RepeatablePayload},
        Reactor, ReactorHandle, TimerKey, WeakReactorHandle,
    },
    task::Epoch,
};

static NEXT_TIMER_KEY: AtomicU64 = AtomicU64::new(1);

/// Receives the action of an expired [`DeadlineTimer`].
pub trait TimerTarget: Send + Sync + 'static {
    /// Called on the reactor thread, or inline when the deadline had
    /// already passed at start/restart time.
    fn on_deadline(self: Arc<Self>, action: TimerAction);
}

/// What an expired timer does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Cancel,
    WakeupByEpoch(Epoch),
}

enum Request {
    Arm {
        deadline: Instant,
        action: TimerAction,
        generation: u64,
    },
    Finalize,
}

struct TimerCore {
    key: TimerKey,
    link: PayloadLink,
    target: Mutex<Option<Arc<dyn TimerTarget>>>,
    reactor: WeakReactorHandle,
    request: Mutex<Option<Request>>,
    generation: AtomicU64,
}

impl TimerCore {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn schedule(self: &Arc<Self>, deadline: Instant, action: TimerAction) {
        let passed = deadline <= Instant::now();
        {
            let mut request = self.request.lock();
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            if passed {
                // anything armed or in flight is stale now
                *request = None;
            } else {
                *request = Some(Request::Arm {
                    deadline,
                    action,
                    generation,
                });
            }
        }

        if passed {
            trace!(key = ?self.key, ?action, "deadline already passed, firing inline");
            self.fire(action);
        } else {
            self.submit(Deadline::from_time_point(deadline));
        }
    }

    fn finalize(self: &Arc<Self>) {
        {
            let mut request = self.request.lock();
            self.generation.fetch_add(1, Ordering::AcqRel);
            *request = Some(Request::Finalize);
        }
        if !self.submit(Deadline::unreachable()) {
            // no reactor to hand the release to
            self.request.lock().take();
            self.target.lock().take();
        }
    }

    fn submit(self: &Arc<Self>, deadline: Deadline) -> bool {
        let Some(reactor) = self.reactor.upgrade() else {
            debug!(key = ?self.key, "timer reactor is gone");
            return false;
        };
        reactor
            .run_in_ev_loop_deferred(Payload::repeatable(self.clone()), deadline)
            .is_ok()
    }

    fn fire(&self, action: TimerAction) {
        let target = self.target.lock().clone();
        if let Some(target) = target {
            target.on_deadline(action);
        }
    }
}

impl RepeatablePayload for TimerCore {
    fn link(&self) -> &PayloadLink {
        &self.link
    }

    fn perform(self: Arc<Self>, reactor: &mut Reactor) {
        let Some(request) = self.request.lock().take() else {
            return;
        };

        match request {
            Request::Finalize => {
                reactor.disarm_timer(self.key);
                self.target.lock().take();
                trace!(key = ?self.key, "timer finalized");
            }
            Request::Arm {
                deadline,
                action,
                generation,
            } => {
                if !self.is_current(generation) {
                    trace!(key = ?self.key, "discarding stale arm request");
                    return;
                }
                if deadline <= Instant::now() {
                    reactor.disarm_timer(self.key);
                    trace!(key = ?self.key, ?action, "deadline passed before arming");
                    self.fire(action);
                    return;
                }
                let core = self.clone();
                reactor.arm_timer(self.key, deadline, move |_| {
                    if core.is_current(generation) {
                        core.fire(action);
                    }
                });
            }
        }
    }
}

/// A single-owner timer that fires a [`TimerAction`] at its target.
///
/// Lifecycle: [`start`](Self::start) once, then any number of
/// [`restart`](Self::restart) calls, then [`finalize`](Self::finalize).
/// Dropping the timer finalizes it.
#[derive(Default)]
pub struct DeadlineTimer {
    core: Option<Arc<TimerCore>>,
    finalized: bool,
}

impl DeadlineTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `target` and `reactor` and arm the first deadline.
    ///
    /// # Panics
    /// If the timer has already been started.
    pub fn start(
        &mut self,
        target: Arc<dyn TimerTarget>,
        reactor: &ReactorHandle,
        deadline: Instant,
        action: TimerAction,
    ) {
        assert!(self.core.is_none(), "deadline timer started twice");
        let core = Arc::new(TimerCore {
            key: TimerKey(NEXT_TIMER_KEY.fetch_add(1, Ordering::Relaxed)),
            link: PayloadLink::default(),
            target: Mutex::new(Some(target)),
            reactor: reactor.downgrade(),
            request: Mutex::new(None),
            generation: AtomicU64::new(0),
        });
        core.schedule(deadline, action);
        self.core = Some(core);
    }

    /// Replace the pending deadline and action. The most recent call wins.
    ///
    /// # Panics
    /// If the timer was never started or has been finalized.
    pub fn restart(&mut self, deadline: Instant, action: TimerAction) {
        assert!(!self.finalized, "deadline timer restarted after finalize");
        let core = self
            .core
            .as_ref()
            .unwrap_or_else(|| panic!("deadline timer restarted before start"));
        core.schedule(deadline, action);
    }

    /// Detach from the reactor and release the target. Idempotent.
    pub fn finalize(&mut self) {
        if std::mem::replace(&mut self.finalized, true) {
            return;
        }
        if let Some(core) = &self.core {
            core.finalize();
        }
    }

    pub fn was_started(&self) -> bool {
        self.core.is_some()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn start_wakeup(
        &mut self,
        target: Arc<dyn TimerTarget>,
        reactor: &ReactorHandle,
        deadline: Instant,
        epoch: Epoch,
    ) {
        self.start(target, reactor, deadline, TimerAction::WakeupByEpoch(epoch))
    }

    pub fn start_cancel(
        &mut self,
        target: Arc<dyn TimerTarget>,
        reactor: &ReactorHandle,
        deadline: Instant,
    ) {
        self.start(target, reactor, deadline, TimerAction::Cancel)
    }

    pub fn restart_wakeup(&mut self, deadline: Instant, epoch: Epoch) {
        self.restart(deadline, TimerAction::WakeupByEpoch(epoch))
    }

    pub fn restart_cancel(&mut self, deadline: Instant) {
        self.restart(deadline, TimerAction::Cancel)
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RegisterEventMode;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TimerAction>>);

    impl TimerTarget for Recorder {
        fn on_deadline(self: Arc<Self>, action: TimerAction) {
            self.0.lock().push(action);
        }
    }

    fn reactor() -> Reactor {
        Reactor::new("timer-test", RegisterEventMode::Immediate, false).unwrap()
    }

    fn tick_until(reactor: &mut Reactor, at: Instant) {
        while Instant::now() < at {
            reactor.run_once().unwrap();
        }
        reactor.run_once().unwrap();
    }

    #[test]
    fn past_deadline_fires_inline() {
        let reactor = reactor();
        let target = Arc::new(Recorder::default());
        let mut timer = DeadlineTimer::new();
        timer.start_cancel(target.clone(), &reactor.handle(), Instant::now());
        assert_eq!(*target.0.lock(), vec![TimerAction::Cancel]);
    }

    #[test]
    fn latest_restart_wins() {
        let mut reactor = reactor();
        let target = Arc::new(Recorder::default());
        let mut timer = DeadlineTimer::new();
        let now = Instant::now();
        timer.start_cancel(target.clone(), &reactor.handle(), now + Duration::from_millis(5));
        timer.restart_wakeup(now + Duration::from_millis(10), Epoch::default());
        timer.restart_wakeup(now + Duration::from_millis(15), Epoch::default().next());

        tick_until(&mut reactor, now + Duration::from_millis(30));
        assert_eq!(
            *target.0.lock(),
            vec![TimerAction::WakeupByEpoch(Epoch::default().next())]
        );
        assert_eq!(reactor.armed_timers(), 0);
    }

    #[test]
    fn finalize_releases_target_once() {
        let mut reactor = reactor();
        let target = Arc::new(Recorder::default());
        let mut timer = DeadlineTimer::new();
        timer.start_cancel(
            target.clone(),
            &reactor.handle(),
            Instant::now() + Duration::from_secs(60),
        );
        assert_eq!(Arc::strong_count(&target), 2);

        timer.finalize();
        timer.finalize();
        reactor.run_once().unwrap();
        assert_eq!(Arc::strong_count(&target), 1);
        assert_eq!(reactor.armed_timers(), 0);
        assert!(target.0.lock().is_empty());
    }

    #[test]
    fn finalize_without_start_is_noop() {
        let mut timer = DeadlineTimer::new();
        timer.finalize();
        timer.finalize();
        assert!(!timer.was_started());
    }

    #[test]
    #[should_panic(expected = "restarted before start")]
    fn restart_requires_start() {
        DeadlineTimer::new().restart_cancel(Instant::now());
    }

    #[test]
    #[should_panic(expected = "started twice")]
    fn start_twice_panics() {
        let reactor = reactor();
        let target = Arc::new(Recorder::default());
        let mut timer = DeadlineTimer::new();
        let later = Instant::now() + Duration::from_secs(1);
        timer.start_cancel(target.clone(), &reactor.handle(), later);
        timer.start_cancel(target, &reactor.handle(), later);
    }
}
