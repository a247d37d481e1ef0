use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::Instant,
};

use super::Reactor;

/// Identifies one native timer slot on a reactor.
///
/// Arming a key that is already armed replaces the pending expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey(pub(crate) u64);

pub(crate) type TimerCallback = Box<dyn FnOnce(&mut Reactor) + Send + 'static>;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    at: Instant,
    seq: u64,
    key: TimerKey,
}

/// Native timers of one reactor, ordered by expiry.
///
/// Disarming is lazy: stale heap entries are skipped when their sequence
/// number no longer matches the armed one.
#[derive(Default)]
pub(crate) struct Queue {
    heap: BinaryHeap<Reverse<Entry>>,
    armed: HashMap<TimerKey, (u64, TimerCallback)>,
    seq: u64,
}

impl Queue {
    pub fn arm(&mut self, key: TimerKey, at: Instant, callback: TimerCallback) {
        self.seq += 1;
        self.armed.insert(key, (self.seq, callback));
        self.heap.push(Reverse(Entry {
            at,
            seq: self.seq,
            key,
        }));
    }

    pub fn disarm(&mut self, key: TimerKey) -> bool {
        self.armed.remove(&key).is_some()
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    fn is_live(&self, entry: &Entry) -> bool {
        matches!(self.armed.get(&entry.key), Some((seq, _)) if *seq == entry.seq)
    }

    /// Earliest live expiry
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.is_live(entry) {
                return Some(entry.at);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return the callbacks of every timer due at `now`
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerCallback> {
        let mut due = vec![];
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.at > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            if self.is_live(&entry) {
                if let Some((_, callback)) = self.armed.remove(&entry.key) {
                    due.push(callback);
                }
            }
        }
        due
    }
}
