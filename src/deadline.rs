use std::time::{Duration, Instant};

/// An absolute point in time after which a wait gives up.
///
/// Deadlines are time points rather than durations, so a call that takes a
/// while to reach its suspension point does not silently extend the wait.
/// The default deadline is unreachable: waits bounded by it only end on
/// completion or cancellation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never expires
    pub const fn unreachable() -> Self {
        Self(None)
    }

    /// A deadline that has already expired
    pub fn passed() -> Self {
        Self(Some(Instant::now()))
    }

    pub fn from_time_point(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// Deadline `duration` from now. Saturates to unreachable on overflow.
    pub fn from_duration(duration: Duration) -> Self {
        Self(Instant::now().checked_add(duration))
    }

    pub fn is_reachable(&self) -> bool {
        self.0.is_some()
    }

    pub fn is_reached(&self) -> bool {
        matches!(self.0, Some(instant) if instant <= Instant::now())
    }

    pub fn time_point(&self) -> Option<Instant> {
        self.0
    }

    /// Time left until the deadline, zero if it has passed.
    /// `None` for an unreachable deadline.
    pub fn time_left(&self) -> Option<Duration> {
        self.0
            .map(|instant| instant.saturating_duration_since(Instant::now()))
    }

    /// Strict ordering where an unreachable deadline is later than any other
    pub fn is_before(&self, other: &Deadline) -> bool {
        match (self.0, other.0) {
            (Some(this), Some(other)) => this < other,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Self::from_time_point(instant)
    }
}
