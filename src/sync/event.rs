use std::{
    sync::atomic::{AtomicBool, Ordering},
    task::Waker,
};

use crate::{
    deadline::Deadline,
    task::{current, WakeupSource},
    wait::{
        wait_any::{Awaitable, CompletionSource},
        wait_list::{WaitList, WaiterKey},
        CompletionWaitStrategy,
    },
};

/// Auto-reset event for a single waiting task.
///
/// [`send`](Self::send) sets the signal; a successful wait consumes it.
/// Sending while the signal is already set has no further effect.
#[derive(Default)]
pub struct SingleConsumerEvent {
    signal: AtomicBool,
    waiters: WaitList,
}

impl SingleConsumerEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self) {
        self.signal.store(true, Ordering::Release);
        // only one consumer may be waiting
        self.waiters.wakeup_one();
    }

    pub fn is_ready(&self) -> bool {
        self.signal.load(Ordering::Acquire)
    }

    fn try_consume(&self) -> bool {
        self.signal.swap(false, Ordering::AcqRel)
    }

    /// Wait for the signal. Returns `false` if the task was cancelled.
    pub async fn wait_for_event(&self) -> bool {
        self.wait_for_event_until(Deadline::unreachable()).await
    }

    /// Wait for the signal. Returns `false` on timeout or cancellation.
    pub async fn wait_for_event_until(&self, deadline: Deadline) -> bool {
        let task = current::context();
        loop {
            if self.try_consume() {
                return true;
            }
            let source = task
                .sleep(CompletionWaitStrategy::new(self), deadline)
                .await;
            if self.try_consume() {
                return true;
            }
            if matches!(source, WakeupSource::Cancellation | WakeupSource::Deadline) {
                return false;
            }
        }
    }
}

impl CompletionSource for SingleConsumerEvent {
    fn is_ready(&self) -> bool {
        SingleConsumerEvent::is_ready(self)
    }

    fn try_append_waiter(&self, waker: Waker) -> Option<WaiterKey> {
        self.waiters.append_unless(waker, || self.is_ready())
    }

    fn remove_waiter(&self, key: WaiterKey) {
        self.waiters.remove(key);
    }
}

impl Awaitable for SingleConsumerEvent {
    fn try_get_completion_source(&self) -> Option<&dyn CompletionSource> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{atomic::AtomicUsize, Arc},
        task::Wake,
    };

    use super::*;

    struct Counter(AtomicUsize);

    impl Wake for Counter {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn send_wakes_the_waiting_consumer_once() {
        let event = SingleConsumerEvent::new();
        let consumer = Arc::new(Counter(AtomicUsize::new(0)));
        let key = event.try_append_waiter(Waker::from(consumer.clone()));
        assert!(key.is_some());

        event.send();
        event.send();
        assert_eq!(consumer.0.load(Ordering::SeqCst), 1);
        assert!(event.is_ready());

        // the signal stays set until consumed
        assert!(event.try_append_waiter(Waker::from(consumer.clone())).is_none());
        assert!(event.try_consume());
        assert!(!event.is_ready());
    }
}
