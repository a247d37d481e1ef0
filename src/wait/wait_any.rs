//! Waiting for the first of several operations to complete.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Wake, Waker},
    time::Duration,
};

use tracing::trace;

use super::{wait_list::WaiterKey, EarlyWakeup, WaitStrategy};
use crate::{
    deadline::Deadline,
    task::{current, Epoch, TaskContext, WakeupSource},
};

/// Something a task can wait on to become ready.
pub trait CompletionSource: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Register `waker` to be woken on completion. Returns `None` without
    /// registering if the source is already ready.
    fn try_append_waiter(&self, waker: Waker) -> Option<WaiterKey>;

    fn remove_waiter(&self, key: WaiterKey);
}

/// An operand of [`wait_any`].
pub trait Awaitable: Sync {
    /// `None` for an operand that is invalid (for example, whose result has
    /// already been retrieved); such operands are skipped.
    fn try_get_completion_source(&self) -> Option<&dyn CompletionSource>;
}

const NO_WINNER: usize = usize::MAX;
const TIMED_OUT: usize = usize::MAX - 1;

/// Set exactly once, by whoever gets there first.
struct WinnerSlot(AtomicUsize);

impl WinnerSlot {
    fn new() -> Self {
        Self(AtomicUsize::new(NO_WINNER))
    }

    fn claim(&self, value: usize) -> bool {
        self.0
            .compare_exchange(NO_WINNER, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn winner(&self) -> Option<usize> {
        match self.0.load(Ordering::Acquire) {
            NO_WINNER | TIMED_OUT => None,
            index => Some(index),
        }
    }
}

struct OperandWaker {
    slot: Arc<WinnerSlot>,
    index: usize,
    task: Arc<TaskContext>,
    epoch: Epoch,
}

impl Wake for OperandWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.slot.claim(self.index) {
            self.task.wakeup(WakeupSource::ManualEvent, self.epoch);
        }
    }
}

struct WaitAnyStrategy<'a> {
    sources: &'a [Option<&'a dyn CompletionSource>],
    slot: Arc<WinnerSlot>,
    keys: Vec<(usize, WaiterKey)>,
}

impl WaitStrategy for WaitAnyStrategy<'_> {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>, epoch: Epoch) -> EarlyWakeup {
        for (index, source) in self.sources.iter().enumerate() {
            let Some(source) = source else { continue };
            let waker = Waker::from(Arc::new(OperandWaker {
                slot: self.slot.clone(),
                index,
                task: task.clone(),
                epoch,
            }));
            match source.try_append_waiter(waker) {
                Some(key) => self.keys.push((index, key)),
                None => {
                    self.slot.claim(index);
                    return EarlyWakeup(true);
                }
            }
        }
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        for (index, key) in self.keys.drain(..) {
            if let Some(source) = self.sources[index] {
                source.remove_waiter(key);
            }
        }
    }
}

fn assert_distinct(operands: &[&dyn Awaitable]) {
    for (i, a) in operands.iter().enumerate() {
        for b in &operands[i + 1..] {
            assert!(
                !std::ptr::addr_eq(*a, *b),
                "the same operand was passed to wait_any twice"
            );
        }
    }
}

fn first_ready(sources: &[Option<&dyn CompletionSource>]) -> Option<usize> {
    sources
        .iter()
        .position(|source| source.is_some_and(|s| s.is_ready()))
}

/// Wait until one of `operands` completes or `deadline` is reached.
///
/// Returns the index of a completed operand, or `None` on timeout, on
/// cancellation of the current task, or if no operand is valid. Operands
/// other than the returned one are left untouched.
///
/// # Panics
/// If the same operand appears twice.
pub async fn wait_any_until(deadline: Deadline, operands: &[&dyn Awaitable]) -> Option<usize> {
    assert_distinct(operands);
    let sources: Vec<Option<&dyn CompletionSource>> = operands
        .iter()
        .map(|operand| operand.try_get_completion_source())
        .collect();
    if sources.iter().all(Option::is_none) {
        return None;
    }

    let task = current::context();
    loop {
        if let Some(index) = first_ready(&sources) {
            return Some(index);
        }

        let slot = Arc::new(WinnerSlot::new());
        let strategy = WaitAnyStrategy {
            sources: &sources,
            slot: slot.clone(),
            keys: Vec::with_capacity(sources.len()),
        };
        let source = task.sleep(strategy, deadline).await;

        if let Some(index) = slot.winner() {
            trace!(task = task.id(), index, "wait_any operand completed");
            return Some(index);
        }
        match source {
            WakeupSource::Cancellation => return None,
            WakeupSource::Deadline => {
                if slot.claim(TIMED_OUT) {
                    return None;
                }
                return slot.winner();
            }
            _ => {}
        }
    }
}

/// [`wait_any_until`] with a timeout.
pub async fn wait_any_for(timeout: Duration, operands: &[&dyn Awaitable]) -> Option<usize> {
    wait_any_until(Deadline::from_duration(timeout), operands).await
}

/// [`wait_any_until`] without a deadline.
pub async fn wait_any(operands: &[&dyn Awaitable]) -> Option<usize> {
    wait_any_until(Deadline::unreachable(), operands).await
}
