use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use parking_lot::Mutex;

use super::{current, CancellationReason, TaskContext, TaskState, WakeupSource};
use crate::{
    deadline::Deadline,
    error::TaskError,
    wait::{
        wait_any::{Awaitable, CompletionSource},
        wait_list::WaiterKey,
        CompletionWaitStrategy,
    },
};

/// Handle to a spawned task and its eventual result.
///
/// Dropping the handle of an unfinished task cancels it with
/// [`CancellationReason::Abandoned`], unless it was [detached](Self::detach).
/// Once the result has been taken the handle is invalid.
pub struct TaskWithResult<T> {
    context: Option<Arc<TaskContext>>,
    result: Arc<Mutex<Option<T>>>,
    // registration made by the `Future` impl
    waiter: Option<WaiterKey>,
}

impl<T> TaskWithResult<T> {
    pub(crate) fn new(context: Arc<TaskContext>, result: Arc<Mutex<Option<T>>>) -> Self {
        Self {
            context: Some(context),
            result,
            waiter: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.context.is_some()
    }

    fn context(&self) -> &Arc<TaskContext> {
        self.context
            .as_ref()
            .unwrap_or_else(|| panic!("task handle used after its result was retrieved"))
    }

    pub fn state(&self) -> TaskState {
        self.context().state()
    }

    pub fn is_finished(&self) -> bool {
        self.context().is_finished()
    }

    pub fn task_context(&self) -> Option<&Arc<TaskContext>> {
        self.context.as_ref()
    }

    /// Request cancellation with [`CancellationReason::UserRequest`].
    pub fn cancel(&self) {
        self.context().request_cancel(CancellationReason::UserRequest);
    }

    /// Wait until the task finishes.
    pub async fn wait(&self) -> Result<(), TaskError> {
        self.wait_until(Deadline::unreachable()).await
    }

    /// Wait until the task finishes or `deadline` is reached.
    ///
    /// # Panics
    /// When awaited from inside the task itself.
    pub async fn wait_until(&self, deadline: Deadline) -> Result<(), TaskError> {
        let target = self.context.as_ref().ok_or(TaskError::AlreadyRetrieved)?;
        let current = current::context();
        assert!(
            !Arc::ptr_eq(&current, target),
            "task attempted to wait for itself"
        );

        loop {
            if target.is_finished() {
                return Ok(());
            }
            let strategy = CompletionWaitStrategy::new(&**target);
            match current.sleep(strategy, deadline).await {
                WakeupSource::Cancellation => {
                    return Err(TaskError::WaitInterrupted(current.cancellation_reason()))
                }
                WakeupSource::Deadline if !target.is_finished() => {
                    return Err(TaskError::Timeout)
                }
                _ => {}
            }
        }
    }

    /// Wait for the task and take its result. The handle is invalid after
    /// the result has been taken.
    pub async fn get(&mut self) -> Result<T, TaskError> {
        self.wait().await?;
        let context = self.context.take().ok_or(TaskError::AlreadyRetrieved)?;
        Self::take_result(&self.result, &context)
    }

    fn take_result(result: &Mutex<Option<T>>, context: &TaskContext) -> Result<T, TaskError> {
        match result.lock().take() {
            Some(value) => Ok(value),
            None if context.state() == TaskState::Cancelled => {
                Err(TaskError::Cancelled(context.cancellation_reason()))
            }
            None => Err(TaskError::Panicked),
        }
    }

    /// Let the task run to completion on its own.
    pub fn detach(mut self) {
        if let Some(context) = self.context.take() {
            if let Some(key) = self.waiter.take() {
                context.remove_waiter(key);
            }
        }
    }
}

impl<T> Drop for TaskWithResult<T> {
    fn drop(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };
        if let Some(key) = self.waiter.take() {
            context.remove_waiter(key);
        }
        if !context.is_finished() {
            context.request_cancel(CancellationReason::Abandoned);
        }
    }
}

/// Lets a task be awaited from any executor, not only from another task.
impl<T> Future for TaskWithResult<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(context) = this.context.clone() else {
            return Poll::Ready(Err(TaskError::AlreadyRetrieved));
        };
        assert!(
            !current::is_current(&context),
            "task attempted to wait for itself"
        );

        if let Some(key) = this.waiter.take() {
            context.remove_waiter(key);
        }
        if let Some(key) = context.try_append_waiter(cx.waker().clone()) {
            this.waiter = Some(key);
            return Poll::Pending;
        }

        this.context = None;
        Poll::Ready(Self::take_result(&this.result, &context))
    }
}

impl<T: Send> Awaitable for TaskWithResult<T> {
    fn try_get_completion_source(&self) -> Option<&dyn CompletionSource> {
        self.context
            .as_deref()
            .map(|context| context as &dyn CompletionSource)
    }
}
