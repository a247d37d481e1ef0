use std::{io, sync::Arc, time::Duration};

use mio::{Events, Poll, Token, Waker};

// the only source registered on a reactor's poll
const WAKER_TOKEN: Token = Token(0);

/// The OS readiness primitive of one reactor.
pub(crate) struct Os {
    poll: Poll,
    events: Events,
}

impl Os {
    /// Create the poll along with the waker other threads use to interrupt it
    pub fn new() -> io::Result<(Self, Arc<Waker>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let os = Self {
            poll,
            events: Events::with_capacity(16),
        };
        Ok((os, waker))
    }

    /// Block until woken or until `timeout` elapses.
    ///
    /// Returns whether the waker fired.
    pub fn process(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(e),
        }
        Ok(self
            .events
            .iter()
            .any(|event| event.token() == WAKER_TOKEN))
    }
}
