use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::TaskContext;

pub(crate) enum Job {
    Run(Arc<TaskContext>),
    Stop,
}

/// Tasks waiting for a worker.
pub(crate) struct Queue {
    pub receiver: Receiver<Job>,
    pub sender: Sender<Job>,
}

impl Queue {
    /// A receiving end for one worker thread.
    pub fn worker(&self) -> Receiver<Job> {
        self.receiver.clone()
    }

    pub fn try_poll(&self) -> Option<Job> {
        self.receiver.try_recv().ok()
    }

    pub fn push(&self, job: Job) {
        // the queue owns both ends, sending cannot fail
        let _ = self.sender.send(job);
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}

impl Default for Queue {
    fn default() -> Self {
        let (sender, receiver) = unbounded();
        Self { receiver, sender }
    }
}
