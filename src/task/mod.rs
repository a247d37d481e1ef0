//! Per-task state: sleep epochs, wakeup flags and cooperative cancellation.
//!
//! A task sleeps whenever its body returns `Pending`. Wakeups race with each
//! other and with the task itself, so they are all funneled through one
//! atomic [`SleepState`] word holding the wakeup flags and the sleep epoch.
//! A wakeup carrying an epoch other than the current one is a no-op, and
//! only the first wakeup of a sleep schedules the task again.

pub mod current;
pub mod handle;
pub mod processor;
mod ready;
mod sleep_state;

use std::{
    fmt,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    task::{Context, Poll, Wake, Waker},
    time::Instant,
};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::{
    deadline::Deadline,
    timer::{DeadlineTimer, TimerAction, TimerTarget},
    wait::{
        wait_any::CompletionSource,
        wait_list::{WaitList, WaiterKey},
        Sleep, WaitStrategy,
    },
};

pub use handle::TaskWithResult;
pub use processor::TaskProcessor;
pub use sleep_state::{AtomicSleepState, Epoch, SleepFlags, SleepState};

pub(crate) type TaskBody = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Why a sleep ended.
#[derive(Debug, Clone, Copy, Educe)]
#[educe(Default, PartialEq, Eq)]
pub enum WakeupSource {
    #[educe(Default)]
    None,
    /// A wait list, event or foreign waker.
    ManualEvent,
    Deadline,
    Cancellation,
}

impl WakeupSource {
    fn flag(self) -> SleepFlags {
        match self {
            WakeupSource::None => SleepFlags::NONE,
            WakeupSource::ManualEvent => SleepFlags::WAKEUP_BY_WAIT_LIST,
            WakeupSource::Deadline => SleepFlags::WAKEUP_BY_DEADLINE,
            WakeupSource::Cancellation => SleepFlags::WAKEUP_BY_CANCEL_REQUEST,
        }
    }

    /// Whether the awaited condition may have been satisfied
    pub fn has_wait_succeeded(self) -> bool {
        self == WakeupSource::ManualEvent
    }

    /// The wakeup that ended a sleep, given the flags it ended with
    pub(crate) fn primary(flags: SleepFlags) -> Self {
        if flags.contains(SleepFlags::WAKEUP_BY_WAIT_LIST) {
            WakeupSource::ManualEvent
        } else if flags.contains(SleepFlags::WAKEUP_BY_DEADLINE) {
            WakeupSource::Deadline
        } else if flags.contains(SleepFlags::WAKEUP_BY_CANCEL_REQUEST)
            && !flags.contains(SleepFlags::NON_CANCELLABLE)
        {
            WakeupSource::Cancellation
        } else {
            WakeupSource::None
        }
    }
}

/// Why a task was asked to stop.
#[derive(Debug, Clone, Copy, Educe)]
#[educe(Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CancellationReason {
    #[educe(Default)]
    None = 0,
    UserRequest,
    Deadline,
    Overload,
    /// The task handle was dropped while the task was still running.
    Abandoned,
    Shutdown,
}

impl CancellationReason {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CancellationReason::UserRequest,
            2 => CancellationReason::Deadline,
            3 => CancellationReason::Overload,
            4 => CancellationReason::Abandoned,
            5 => CancellationReason::Shutdown,
            _ => CancellationReason::None,
        }
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CancellationReason::None => "not cancelled",
            CancellationReason::UserRequest => "user request",
            CancellationReason::Deadline => "deadline",
            CancellationReason::Overload => "task processor overload",
            CancellationReason::Abandoned => "task handle dropped",
            CancellationReason::Shutdown => "task processor shutdown",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    New,
    Queued,
    Running,
    Suspended,
    Cancelled,
    Completed,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::New,
            1 => TaskState::Queued,
            2 => TaskState::Running,
            3 => TaskState::Suspended,
            4 => TaskState::Cancelled,
            _ => TaskState::Completed,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, TaskState::Cancelled | TaskState::Completed)
    }
}

/// Shared state of one task.
pub struct TaskContext {
    id: u64,
    processor: Arc<TaskProcessor>,
    is_critical: bool,
    state: AtomicU8,
    sleep_state: AtomicSleepState,
    cancellation_reason: AtomicU8,
    is_cancellable: AtomicBool,
    within_sleep: AtomicBool,
    started: AtomicBool,
    wakeup_source: Mutex<WakeupSource>,
    cancel_deadline: Mutex<Deadline>,
    deadline_timer: Mutex<DeadlineTimer>,
    body: Mutex<Option<TaskBody>>,
    finish_waiters: WaitList,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("sleep_state", &self.sleep_state.load())
            .field("cancellation_reason", &self.cancellation_reason())
            .finish()
    }
}

impl TaskContext {
    pub(crate) fn new(
        id: u64,
        processor: Arc<TaskProcessor>,
        is_critical: bool,
        cancel_deadline: Deadline,
        body: TaskBody,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            processor,
            is_critical,
            state: AtomicU8::new(TaskState::New as u8),
            sleep_state: AtomicSleepState::default(),
            cancellation_reason: AtomicU8::new(CancellationReason::None as u8),
            is_cancellable: AtomicBool::new(true),
            within_sleep: AtomicBool::new(false),
            started: AtomicBool::new(false),
            wakeup_source: Mutex::new(WakeupSource::None),
            cancel_deadline: Mutex::new(cancel_deadline),
            deadline_timer: Mutex::new(DeadlineTimer::new()),
            body: Mutex::new(Some(body)),
            finish_waiters: WaitList::default(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn processor(&self) -> &Arc<TaskProcessor> {
        &self.processor
    }

    pub fn is_critical(&self) -> bool {
        self.is_critical
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    pub(crate) fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn sleep_state(&self) -> SleepState {
        self.sleep_state.load()
    }

    pub fn wakeup_source(&self) -> WakeupSource {
        *self.wakeup_source.lock()
    }

    pub fn cancellation_reason(&self) -> CancellationReason {
        CancellationReason::from_u8(self.cancellation_reason.load(Ordering::SeqCst))
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancellation_reason() != CancellationReason::None
    }

    pub fn is_cancellable(&self) -> bool {
        self.is_cancellable.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set_cancellable(&self, value: bool) -> bool {
        self.is_cancellable.swap(value, Ordering::SeqCst)
    }

    pub fn should_cancel(&self) -> bool {
        self.is_cancel_requested() && self.is_cancellable()
    }

    pub fn cancel_deadline(&self) -> Deadline {
        *self.cancel_deadline.lock()
    }

    /// Replace the deadline after which this task is cancelled.
    pub fn set_cancel_deadline(self: &Arc<Self>, deadline: Deadline) {
        *self.cancel_deadline.lock() = deadline;
        if deadline.is_reachable() {
            self.arm_cancellation_timer();
        } else {
            // drops and finalizes the old timer
            *self.deadline_timer.lock() = DeadlineTimer::new();
        }
    }

    /// Sleep until woken by `strategy`, the deadline or cancellation.
    ///
    /// Must be awaited from within this task.
    pub fn sleep<S>(self: &Arc<Self>, strategy: S, deadline: Deadline) -> Sleep<S>
    where
        S: WaitStrategy + Unpin,
    {
        Sleep::new(self.clone(), strategy, deadline)
    }

    /// Deliver a wakeup for the sleep identified by `epoch`.
    ///
    /// Stale epochs are ignored. Only the first wakeup of a sleep
    /// reschedules the task.
    pub fn wakeup(self: &Arc<Self>, source: WakeupSource, epoch: Epoch) {
        if self.is_finished() {
            return;
        }
        let flag = source.flag();
        let mut prev = self.sleep_state.load();
        loop {
            if prev.epoch != epoch {
                trace!(task = self.id, ?source, ?epoch, "ignoring stale wakeup");
                return;
            }
            let new = SleepState::new(prev.flags | flag, epoch);
            match self.sleep_state.compare_exchange_weak(prev, new) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
        if Self::should_schedule(prev.flags, source) {
            self.schedule();
        }
    }

    /// Deliver a wakeup to whatever sleep is current.
    pub fn wakeup_no_epoch(self: &Arc<Self>, source: WakeupSource) {
        if self.is_finished() {
            return;
        }
        let prev = self.sleep_state.fetch_or_flags(source.flag());
        if Self::should_schedule(prev.flags, source) {
            self.schedule();
        }
    }

    fn should_schedule(prev: SleepFlags, source: WakeupSource) -> bool {
        if !prev.contains(SleepFlags::SLEEPING) {
            // still running, the step will notice the flag
            return false;
        }
        if source == WakeupSource::Cancellation && prev.contains(SleepFlags::NON_CANCELLABLE) {
            return false;
        }
        !Self::is_woken(prev)
    }

    fn is_woken(flags: SleepFlags) -> bool {
        flags.intersects(SleepFlags::WAKEUP_BY_WAIT_LIST | SleepFlags::WAKEUP_BY_DEADLINE)
            || (flags.contains(SleepFlags::WAKEUP_BY_CANCEL_REQUEST)
                && !flags.contains(SleepFlags::NON_CANCELLABLE))
    }

    /// Ask the task to stop. Sticky: only the first reason is kept.
    ///
    /// Returns whether this call set the reason.
    pub fn request_cancel(self: &Arc<Self>, reason: CancellationReason) -> bool {
        if self
            .cancellation_reason
            .compare_exchange(
                CancellationReason::None as u8,
                reason as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }
        trace!(task = self.id, %reason, "cancellation requested");
        let epoch = self.sleep_state.load().epoch;
        self.wakeup(WakeupSource::Cancellation, epoch);
        true
    }

    pub(crate) fn schedule(self: &Arc<Self>) {
        self.set_state(TaskState::Queued);
        self.processor.schedule(self.clone());
    }

    /// A waker delivering [`WakeupSource::ManualEvent`], bound to `epoch`
    /// if given.
    pub fn epoch_waker(self: &Arc<Self>, epoch: Option<Epoch>) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            task: self.clone(),
            epoch,
        }))
    }

    pub(crate) fn arm_deadline_timer(self: &Arc<Self>, deadline: Instant, epoch: Epoch) {
        let mut timer = self.deadline_timer.lock();
        if timer.is_finalized() {
            return;
        }
        if timer.was_started() {
            timer.restart_wakeup(deadline, epoch);
        } else {
            let reactor = self.processor.reactors().next_timer_thread().clone();
            timer.start_wakeup(self.clone(), &reactor, deadline, epoch);
        }
    }

    /// Point the deadline timer back at the cancel deadline, if any.
    pub(crate) fn arm_cancellation_timer(self: &Arc<Self>) {
        let deadline = self.cancel_deadline();
        let Some(at) = deadline.time_point() else {
            return;
        };
        if deadline.is_reached() {
            self.request_cancel(CancellationReason::Deadline);
            return;
        }
        let mut timer = self.deadline_timer.lock();
        if timer.is_finalized() {
            return;
        }
        if timer.was_started() {
            timer.restart_cancel(at);
        } else {
            let reactor = self.processor.reactors().next_timer_thread().clone();
            timer.start_cancel(self.clone(), &reactor, at);
        }
    }

    pub(crate) fn enter_sleep(&self) -> bool {
        !self.within_sleep.swap(true, Ordering::AcqRel)
    }

    /// Consume the wakeup flags of the current sleep and move to the next
    /// epoch. Returns the source that ended the sleep.
    pub(crate) fn leave_sleep(&self) -> WakeupSource {
        let epoch = self.sleep_state.load().epoch;
        let prev = self
            .sleep_state
            .exchange(SleepState::new(SleepFlags::NONE, epoch.next()));
        self.within_sleep.store(false, Ordering::Release);
        let mut flags = prev.flags;
        if !self.is_cancellable() {
            flags = flags | SleepFlags::NON_CANCELLABLE;
        }
        let source = WakeupSource::primary(flags);
        *self.wakeup_source.lock() = source;
        source
    }

    /// Run the body once. Called by a worker thread.
    pub(crate) fn step(self: &Arc<Self>) {
        if self.is_finished() {
            return;
        }
        let mut clear = SleepFlags::SLEEPING | SleepFlags::NON_CANCELLABLE;
        if !self.within_sleep.load(Ordering::Acquire) {
            clear = clear | SleepFlags::ALL_WAKEUPS;
        }
        self.sleep_state.fetch_clear_flags(clear);
        self.set_state(TaskState::Running);

        if !self.started.swap(true, Ordering::AcqRel) {
            self.arm_cancellation_timer();
            if self.is_cancel_requested() && !self.is_critical {
                trace!(task = self.id, "cancelled before first step");
                self.finish(TaskState::Cancelled);
                return;
            }
        }

        let poll = {
            let mut body = self.body.lock();
            let Some(fut) = body.as_mut() else {
                return;
            };
            let waker = self.epoch_waker(None);
            let mut cx = Context::from_waker(&waker);
            current::enter(self, || catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))))
        };

        match poll {
            Ok(Poll::Ready(())) => self.finish(TaskState::Completed),
            Err(_) => {
                warn!(task = self.id, "task body panicked");
                self.finish(TaskState::Completed);
            }
            Ok(Poll::Pending) => {
                self.set_state(TaskState::Suspended);
                let cancellable = self.is_cancellable();
                let mut flags = SleepFlags::SLEEPING;
                if !cancellable {
                    flags = flags | SleepFlags::NON_CANCELLABLE;
                }
                let prev = self.sleep_state.fetch_or_flags(flags);
                let mut pending = prev.flags;
                if !cancellable {
                    pending = pending | SleepFlags::NON_CANCELLABLE;
                }
                if Self::is_woken(pending) {
                    self.schedule();
                }
            }
        }
    }

    pub(crate) fn finish(self: &Arc<Self>, state: TaskState) {
        // the body may hold sleeps that still talk to the timer
        let Some(body) = self.body.lock().take() else {
            // already finished
            return;
        };
        drop(body);
        self.deadline_timer.lock().finalize();
        self.set_state(state);
        trace!(task = self.id, ?state, "task finished");
        self.processor.task_finished(self.id);
        self.finish_waiters.wakeup_all();
    }
}

impl TimerTarget for TaskContext {
    fn on_deadline(self: Arc<Self>, action: TimerAction) {
        match action {
            TimerAction::Cancel => {
                self.request_cancel(CancellationReason::Deadline);
            }
            TimerAction::WakeupByEpoch(epoch) => self.wakeup(WakeupSource::Deadline, epoch),
        }
    }
}

impl CompletionSource for TaskContext {
    fn is_ready(&self) -> bool {
        self.is_finished()
    }

    fn try_append_waiter(&self, waker: Waker) -> Option<WaiterKey> {
        self.finish_waiters
            .append_unless(waker, || self.is_finished())
    }

    fn remove_waiter(&self, key: WaiterKey) {
        self.finish_waiters.remove(key);
    }
}

struct TaskWaker {
    task: Arc<TaskContext>,
    epoch: Option<Epoch>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        match self.epoch {
            Some(epoch) => self.task.wakeup(WakeupSource::ManualEvent, epoch),
            None => self.task.wakeup_no_epoch(WakeupSource::ManualEvent),
        }
    }
}
