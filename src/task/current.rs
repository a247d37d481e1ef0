//! Access to the task running on this thread.

use std::{cell::RefCell, sync::Arc};

use super::{CancellationReason, TaskContext, TaskProcessor};
use crate::deadline::Deadline;

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<TaskContext>>> = const { RefCell::new(None) };
}

struct Restore(Option<Arc<TaskContext>>);

impl Drop for Restore {
    fn drop(&mut self) {
        let prev = self.0.take();
        CURRENT_TASK.with(|current| *current.borrow_mut() = prev);
    }
}

/// Run `f` with `task` registered as the current task of this thread.
pub(crate) fn enter<R>(task: &Arc<TaskContext>, f: impl FnOnce() -> R) -> R {
    let prev = CURRENT_TASK.with(|current| current.borrow_mut().replace(task.clone()));
    let _restore = Restore(prev);
    f()
}

pub fn try_current() -> Option<Arc<TaskContext>> {
    CURRENT_TASK.with(|current| current.borrow().clone())
}

/// The task running on this thread.
///
/// # Panics
/// When called outside of a task.
pub fn context() -> Arc<TaskContext> {
    try_current().unwrap_or_else(|| panic!("current_task called outside of a task context"))
}

pub(crate) fn is_current(task: &Arc<TaskContext>) -> bool {
    CURRENT_TASK.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, task))
    })
}

pub fn should_cancel() -> bool {
    context().should_cancel()
}

pub fn cancellation_reason() -> CancellationReason {
    context().cancellation_reason()
}

pub fn task_processor() -> Arc<TaskProcessor> {
    context().processor().clone()
}

/// Cancel the current task once `deadline` is reached.
pub fn set_deadline(deadline: Deadline) {
    context().set_cancel_deadline(deadline)
}

/// Returns the previous value.
pub fn set_cancellable(value: bool) -> bool {
    context().set_cancellable(value)
}
