//! Suspension points.
//!
//! Every engine-level wait goes through [`Sleep`]: it captures the task's
//! sleep epoch, lets a [`WaitStrategy`] register wakeups bound to that epoch,
//! optionally arms the task's deadline timer, and resolves to the
//! [`WakeupSource`] that ended the sleep.

pub mod wait_any;
pub mod wait_list;

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use tracing::trace;

use crate::{
    deadline::Deadline,
    task::{current, Epoch, TaskContext, WakeupSource},
};

use wait_any::CompletionSource;
use wait_list::WaiterKey;

/// Whether the awaited condition already held at setup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarlyWakeup(pub bool);

/// Hooks a sleep uses to connect to the thing it waits for.
pub trait WaitStrategy: Send {
    /// Register wakeups for the sleep identified by `epoch`.
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>, epoch: Epoch) -> EarlyWakeup;

    /// Retract every registration made by `setup_wakeups`.
    fn disable_wakeups(&mut self);
}

/// Sleep on the deadline and cancellation only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWaitStrategy;

impl WaitStrategy for NoopWaitStrategy {
    fn setup_wakeups(&mut self, _: &Arc<TaskContext>, _: Epoch) -> EarlyWakeup {
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {}
}

/// Sleep until a single [`CompletionSource`] is ready.
pub struct CompletionWaitStrategy<'a> {
    source: &'a dyn CompletionSource,
    key: Option<WaiterKey>,
}

impl<'a> CompletionWaitStrategy<'a> {
    pub fn new(source: &'a dyn CompletionSource) -> Self {
        Self { source, key: None }
    }
}

impl WaitStrategy for CompletionWaitStrategy<'_> {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>, epoch: Epoch) -> EarlyWakeup {
        self.key = self.source.try_append_waiter(task.epoch_waker(Some(epoch)));
        EarlyWakeup(self.key.is_none())
    }

    fn disable_wakeups(&mut self) {
        if let Some(key) = self.key.take() {
            self.source.remove_waiter(key);
        }
    }
}

enum Stage {
    Init,
    Waiting { has_deadline: bool },
    Done,
}

/// One suspension of the current task. See [`TaskContext::sleep`].
///
/// A task may only have one `Sleep` in progress at a time.
pub struct Sleep<S: WaitStrategy> {
    task: Arc<TaskContext>,
    strategy: S,
    deadline: Deadline,
    stage: Stage,
}

impl<S: WaitStrategy> Sleep<S> {
    pub(crate) fn new(task: Arc<TaskContext>, strategy: S, deadline: Deadline) -> Self {
        Self {
            task,
            strategy,
            deadline,
            stage: Stage::Init,
        }
    }

    fn start(&mut self) -> Poll<WakeupSource> {
        assert!(
            current::is_current(&self.task),
            "sleep polled outside of its own task"
        );
        assert!(self.task.enter_sleep(), "recursive sleep within one task");

        if self.task.should_cancel() {
            return self.complete_early(WakeupSource::Cancellation);
        }

        let epoch = self.task.sleep_state().epoch;
        if self.strategy.setup_wakeups(&self.task, epoch).0 {
            self.strategy.disable_wakeups();
            return self.complete_early(WakeupSource::ManualEvent);
        }
        if self.deadline.is_reached() {
            self.strategy.disable_wakeups();
            return self.complete_early(WakeupSource::Deadline);
        }

        // an earlier cancel deadline wakes us anyway
        let has_deadline = match self.deadline.time_point() {
            Some(at) => {
                let armed = !self.task.is_cancellable()
                    || self.deadline.is_before(&self.task.cancel_deadline());
                if armed {
                    self.task.arm_deadline_timer(at, epoch);
                }
                armed
            }
            None => false,
        };

        trace!(task = self.task.id(), ?epoch, has_deadline, "task going to sleep");
        self.stage = Stage::Waiting { has_deadline };
        Poll::Pending
    }

    fn complete_early(&mut self, source: WakeupSource) -> Poll<WakeupSource> {
        self.task.leave_sleep();
        self.stage = Stage::Done;
        Poll::Ready(source)
    }

    fn is_woken(&self) -> bool {
        use crate::task::SleepFlags;

        let flags = self.task.sleep_state().flags;
        flags.intersects(SleepFlags::WAKEUP_BY_WAIT_LIST | SleepFlags::WAKEUP_BY_DEADLINE)
            || (flags.contains(SleepFlags::WAKEUP_BY_CANCEL_REQUEST) && self.task.is_cancellable())
    }

    fn finish(&mut self, has_deadline: bool) -> WakeupSource {
        if has_deadline {
            self.task.arm_cancellation_timer();
        }
        self.strategy.disable_wakeups();
        self.stage = Stage::Done;
        self.task.leave_sleep()
    }
}

impl<S: WaitStrategy + Unpin> Future for Sleep<S> {
    type Output = WakeupSource;

    fn poll(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<WakeupSource> {
        let this = self.get_mut();
        match this.stage {
            Stage::Init => this.start(),
            Stage::Waiting { has_deadline } => {
                if !this.is_woken() {
                    return Poll::Pending;
                }
                let source = this.finish(has_deadline);
                trace!(task = this.task.id(), ?source, "task woke up");
                Poll::Ready(source)
            }
            Stage::Done => panic!("sleep polled after completion"),
        }
    }
}

impl<S: WaitStrategy> Drop for Sleep<S> {
    fn drop(&mut self) {
        if let Stage::Waiting { has_deadline } = self.stage {
            self.finish(has_deadline);
        }
    }
}

/// Suspend the current task until `deadline` or cancellation.
pub async fn sleep_until(deadline: Deadline) {
    let task = current::context();
    while !deadline.is_reached() {
        if task.sleep(NoopWaitStrategy, deadline).await == WakeupSource::Cancellation {
            return;
        }
    }
}

/// Suspend the current task for `duration` or until cancellation.
pub async fn sleep_for(duration: Duration) {
    sleep_until(Deadline::from_duration(duration)).await
}

/// Let other tasks run before continuing.
pub async fn yield_now() {
    let task = current::context();
    let _ = task.sleep(YieldStrategy, Deadline::unreachable()).await;
}

// wakes the sleep right after it is set up
struct YieldStrategy;

impl WaitStrategy for YieldStrategy {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>, epoch: Epoch) -> EarlyWakeup {
        task.wakeup(WakeupSource::ManualEvent, epoch);
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {}
}
