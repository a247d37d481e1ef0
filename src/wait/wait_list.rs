use std::task::Waker;

use parking_lot::Mutex;

/// Identifies a registration in a [`WaitList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterKey(u64);

#[derive(Default)]
struct Inner {
    next_key: u64,
    waiters: Vec<(u64, Waker)>,
}

/// Wakers waiting for one condition.
///
/// The completing side must make the condition observable before calling
/// [`wakeup_all`](WaitList::wakeup_all); registration re-checks it under the
/// same lock, so a completion can never slip between check and append.
#[derive(Default)]
pub struct WaitList(Mutex<Inner>);

impl WaitList {
    /// Register `waker` unless `is_ready` already holds.
    pub fn append_unless(&self, waker: Waker, is_ready: impl FnOnce() -> bool) -> Option<WaiterKey> {
        let mut inner = self.0.lock();
        if is_ready() {
            return None;
        }
        let key = inner.next_key;
        inner.next_key += 1;
        inner.waiters.push((key, waker));
        Some(WaiterKey(key))
    }

    /// Unregister. A key that already fired is ignored.
    pub fn remove(&self, key: WaiterKey) {
        self.0.lock().waiters.retain(|(k, _)| *k != key.0);
    }

    /// Wake and unregister everyone.
    pub fn wakeup_all(&self) {
        let waiters = std::mem::take(&mut self.0.lock().waiters);
        for (_, waker) in waiters {
            waker.wake();
        }
    }

    /// Wake and unregister the oldest waiter.
    pub fn wakeup_one(&self) -> bool {
        let waiter = {
            let mut inner = self.0.lock();
            if inner.waiters.is_empty() {
                None
            } else {
                Some(inner.waiters.remove(0))
            }
        };
        match waiter {
            Some((_, waker)) => {
                waker.wake();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.0.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
