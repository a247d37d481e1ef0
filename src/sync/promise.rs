//! One-shot value channel between tasks.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::Waker,
};

use parking_lot::Mutex;

use crate::{
    deadline::Deadline,
    error::FutureError,
    task::{current, WakeupSource},
    wait::{
        wait_any::{Awaitable, CompletionSource},
        wait_list::{WaitList, WaiterKey},
        CompletionWaitStrategy,
    },
};

struct Shared<T> {
    value: Mutex<Option<Result<T, FutureError>>>,
    ready: AtomicBool,
    waiters: WaitList,
}

impl<T: Send> Shared<T> {
    fn resolve(&self, value: Result<T, FutureError>) {
        *self.value.lock() = Some(value);
        self.ready.store(true, Ordering::Release);
        self.waiters.wakeup_all();
    }
}

impl<T: Send> CompletionSource for Shared<T> {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn try_append_waiter(&self, waker: Waker) -> Option<WaiterKey> {
        self.waiters.append_unless(waker, || self.is_ready())
    }

    fn remove_waiter(&self, key: WaiterKey) {
        self.waiters.remove(key);
    }
}

/// Create a connected promise and future.
pub fn channel<T: Send>() -> (Promise<T>, PromiseFuture<T>) {
    let shared = Arc::new(Shared {
        value: Mutex::new(None),
        ready: AtomicBool::new(false),
        waiters: WaitList::default(),
    });
    (
        Promise {
            shared: Some(shared.clone()),
        },
        PromiseFuture {
            shared: Some(shared),
        },
    )
}

/// Producing half. Dropping it unset breaks the promise.
pub struct Promise<T: Send> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T: Send> Promise<T> {
    pub fn set_value(mut self, value: T) {
        if let Some(shared) = self.shared.take() {
            shared.resolve(Ok(value));
        }
    }
}

impl<T: Send> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.resolve(Err(FutureError::BrokenPromise));
        }
    }
}

/// Consuming half. Invalid once its value has been taken.
pub struct PromiseFuture<T: Send> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T: Send> PromiseFuture<T> {
    pub fn is_valid(&self) -> bool {
        self.shared.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.as_ref().is_some_and(|shared| shared.is_ready())
    }

    /// Wait until the value is set, the promise is broken or `deadline`
    /// is reached.
    pub async fn wait_until(&self, deadline: Deadline) -> Result<(), FutureError> {
        let shared = self.shared.as_ref().ok_or(FutureError::AlreadyRetrieved)?;
        let task = current::context();
        loop {
            if shared.is_ready() {
                return Ok(());
            }
            match task
                .sleep(CompletionWaitStrategy::new(&**shared), deadline)
                .await
            {
                WakeupSource::Cancellation => {
                    return Err(FutureError::WaitInterrupted(task.cancellation_reason()))
                }
                WakeupSource::Deadline if !shared.is_ready() => return Err(FutureError::Timeout),
                _ => {}
            }
        }
    }

    /// Wait for and take the value.
    pub async fn get(&mut self) -> Result<T, FutureError> {
        self.wait_until(Deadline::unreachable()).await?;
        let shared = self.shared.take().ok_or(FutureError::AlreadyRetrieved)?;
        let value = shared.value.lock().take();
        value.unwrap_or(Err(FutureError::AlreadyRetrieved))
    }
}

impl<T: Send> Awaitable for PromiseFuture<T> {
    fn try_get_completion_source(&self) -> Option<&dyn CompletionSource> {
        self.shared
            .as_deref()
            .map(|shared| shared as &dyn CompletionSource)
    }
}
