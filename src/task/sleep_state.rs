use std::{
    fmt,
    ops::{BitAnd, BitOr, Not},
    sync::atomic::{AtomicU64, Ordering},
};

const FLAG_BITS: u32 = 8;
const EPOCH_MASK: u64 = (1 << (64 - FLAG_BITS)) - 1;

/// Counter distinguishing successive suspensions of one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Epoch(u64);

impl Epoch {
    pub const fn new(value: u64) -> Self {
        Self(value & EPOCH_MASK)
    }

    pub fn next(self) -> Self {
        Self((self.0 + 1) & EPOCH_MASK)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// Sleep and wakeup bits of a task.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct SleepFlags(u8);

impl SleepFlags {
    pub const NONE: Self = Self(0);
    pub const SLEEPING: Self = Self(1);
    pub const WAKEUP_BY_WAIT_LIST: Self = Self(1 << 1);
    pub const WAKEUP_BY_DEADLINE: Self = Self(1 << 2);
    pub const WAKEUP_BY_CANCEL_REQUEST: Self = Self(1 << 3);
    pub const NON_CANCELLABLE: Self = Self(1 << 4);

    pub const ALL_WAKEUPS: Self = Self(
        Self::WAKEUP_BY_WAIT_LIST.0 | Self::WAKEUP_BY_DEADLINE.0 | Self::WAKEUP_BY_CANCEL_REQUEST.0,
    );

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SleepFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for SleepFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for SleepFlags {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for SleepFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(SleepFlags, &str); 5] = [
            (SleepFlags::SLEEPING, "SLEEPING"),
            (SleepFlags::WAKEUP_BY_WAIT_LIST, "WAKEUP_BY_WAIT_LIST"),
            (SleepFlags::WAKEUP_BY_DEADLINE, "WAKEUP_BY_DEADLINE"),
            (SleepFlags::WAKEUP_BY_CANCEL_REQUEST, "WAKEUP_BY_CANCEL_REQUEST"),
            (SleepFlags::NON_CANCELLABLE, "NON_CANCELLABLE"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// A snapshot of flags and epoch, stored together in one atomic word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SleepState {
    pub flags: SleepFlags,
    pub epoch: Epoch,
}

impl SleepState {
    pub fn new(flags: SleepFlags, epoch: Epoch) -> Self {
        Self { flags, epoch }
    }

    fn pack(self) -> u64 {
        (self.epoch.0 << FLAG_BITS) | u64::from(self.flags.0)
    }

    fn unpack(word: u64) -> Self {
        Self {
            flags: SleepFlags(word as u8),
            epoch: Epoch(word >> FLAG_BITS),
        }
    }
}

#[derive(Debug, Default)]
pub struct AtomicSleepState(AtomicU64);

impl AtomicSleepState {
    pub fn load(&self) -> SleepState {
        SleepState::unpack(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: SleepState) {
        self.0.store(state.pack(), Ordering::SeqCst)
    }

    pub fn exchange(&self, state: SleepState) -> SleepState {
        SleepState::unpack(self.0.swap(state.pack(), Ordering::SeqCst))
    }

    /// Set `flags`, leaving the epoch alone. Returns the previous state.
    pub fn fetch_or_flags(&self, flags: SleepFlags) -> SleepState {
        SleepState::unpack(self.0.fetch_or(u64::from(flags.0), Ordering::SeqCst))
    }

    /// Clear `flags`, leaving the epoch alone. Returns the previous state.
    pub fn fetch_clear_flags(&self, flags: SleepFlags) -> SleepState {
        SleepState::unpack(self.0.fetch_and(!u64::from(flags.0), Ordering::SeqCst))
    }

    pub fn compare_exchange_weak(
        &self,
        current: SleepState,
        new: SleepState,
    ) -> Result<SleepState, SleepState> {
        self.0
            .compare_exchange_weak(current.pack(), new.pack(), Ordering::SeqCst, Ordering::SeqCst)
            .map(SleepState::unpack)
            .map_err(SleepState::unpack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_do_not_touch_epoch() {
        let state = AtomicSleepState::default();
        state.store(SleepState::new(SleepFlags::NONE, Epoch(41).next()));

        let prev = state.fetch_or_flags(SleepFlags::SLEEPING | SleepFlags::NON_CANCELLABLE);
        assert_eq!(prev.flags, SleepFlags::NONE);
        let now = state.load();
        assert_eq!(now.epoch, Epoch(42));
        assert!(now.flags.contains(SleepFlags::SLEEPING));

        state.fetch_clear_flags(SleepFlags::SLEEPING);
        let now = state.load();
        assert_eq!(now.flags, SleepFlags::NON_CANCELLABLE);
        assert_eq!(now.epoch, Epoch(42));
    }

    #[test]
    fn epoch_wraps_within_its_bits() {
        let last = Epoch(EPOCH_MASK);
        assert_eq!(last.next(), Epoch(0));

        let state = AtomicSleepState::default();
        state.store(SleepState::new(SleepFlags::ALL_WAKEUPS, last));
        assert_eq!(state.load().epoch, last);
        assert_eq!(state.load().flags, SleepFlags::ALL_WAKEUPS);
    }

    #[test]
    fn compare_exchange_detects_epoch_change() {
        let state = AtomicSleepState::default();
        let sleeping = SleepState::new(SleepFlags::SLEEPING, Epoch(1));
        state.store(sleeping);

        let stale = SleepState::new(SleepFlags::SLEEPING, Epoch(0));
        let woken = SleepState::new(
            SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_DEADLINE,
            Epoch(0),
        );
        assert_eq!(state.compare_exchange_weak(stale, woken), Err(sleeping));
    }
}
