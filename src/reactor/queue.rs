//! Cross-thread dispatch queue feeding a single reactor thread.
//!
//! Any thread may push; only the owning reactor pops. Payloads are moved
//! into the queue and handed back out by value, so a payload is owned by
//! exactly one side at a time.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::Reactor;

/// Enqueue bookkeeping for payloads that get submitted more than once.
#[derive(Debug, Default)]
pub struct PayloadLink {
    queued: AtomicBool,
}

impl PayloadLink {
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    // returns false if the node is already sitting in a queue
    fn try_enqueue(&self) -> bool {
        !self.queued.swap(true, Ordering::AcqRel)
    }

    fn dequeue(&self) {
        self.queued.store(false, Ordering::Release);
    }
}

/// A payload node that can be submitted again after it has been dequeued.
///
/// Submitting a node that is still queued is coalesced into the pending
/// submission, so a node never runs concurrently with itself and every
/// submission is followed by at least one run.
pub trait RepeatablePayload: Send + Sync + 'static {
    fn link(&self) -> &PayloadLink;

    /// Runs on the reactor thread.
    fn perform(self: Arc<Self>, reactor: &mut Reactor);
}

/// Work to run on a specific reactor thread
pub enum Payload {
    /// Consumed by its single run.
    Once(Box<dyn FnOnce(&mut Reactor) + Send + 'static>),
    /// Shared node, see [`RepeatablePayload`].
    Repeatable(Arc<dyn RepeatablePayload>),
}

impl Payload {
    pub fn once(f: impl FnOnce(&mut Reactor) + Send + 'static) -> Self {
        Payload::Once(Box::new(f))
    }

    pub fn repeatable(node: Arc<dyn RepeatablePayload>) -> Self {
        Payload::Repeatable(node)
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Payload::Once(_) => "once",
            Payload::Repeatable(_) => "repeatable",
        }
    }

    pub(crate) fn perform(self, reactor: &mut Reactor) {
        match self {
            Payload::Once(f) => f(reactor),
            Payload::Repeatable(node) => {
                // unlink before running so the node may resubmit itself
                node.link().dequeue();
                node.perform(reactor);
            }
        }
    }
}

/// Create a connected producer/consumer pair.
pub fn dispatch_queue() -> (Producer, Consumer) {
    let (sender, receiver) = unbounded();
    (Producer(sender), Consumer(receiver))
}

/// Submitting end. Cheap to clone and usable from any thread.
#[derive(Clone)]
pub struct Producer(Sender<Payload>);

impl Producer {
    /// Push a payload. Never blocks.
    ///
    /// Fails only when the consumer is gone, handing the payload back.
    /// A repeatable node that is already queued is not pushed twice.
    pub fn push(&self, payload: Payload) -> Result<(), Payload> {
        if let Payload::Repeatable(node) = &payload {
            if !node.link().try_enqueue() {
                return Ok(());
            }
        }
        self.0.send(payload).map_err(|err| {
            let payload = err.into_inner();
            if let Payload::Repeatable(node) = &payload {
                node.link().dequeue();
            }
            payload
        })
    }
}

/// Receiving end, owned by the reactor.
pub struct Consumer(Receiver<Payload>);

impl Consumer {
    /// The oldest pushed payload, if any.
    pub fn try_pop(&self) -> Option<Payload> {
        self.0.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
