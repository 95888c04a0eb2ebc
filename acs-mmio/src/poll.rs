//! Clocks and Deadlines
//!
//! Every wait on the SMMU (queue space, command completion, CR0
//! acknowledgement) is a bounded busy-poll. Bounds are expressed as a
//! [`Duration`] measured on a [`Clock`], not as an iteration count, so the
//! same budget holds on a fast core, a slow model and a host-side test.

use core::cell::Cell;
use core::time::Duration;

#[cfg(target_arch = "aarch64")]
use aarch64_cpu::registers::{CNTFRQ_EL0, CNTPCT_EL0};
#[cfg(target_arch = "aarch64")]
use tock_registers::interfaces::Readable;

/// A monotonic time source.
pub trait Clock {
    /// Time elapsed since an arbitrary, fixed epoch.
    fn now(&self) -> Duration;
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now(&self) -> Duration {
        (**self).now()
    }
}

/// A point in time after which a wait gives up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Duration,
}

impl Deadline {
    /// A deadline `timeout` from now.
    #[inline]
    #[must_use]
    pub fn after<C: Clock + ?Sized>(clock: &C, timeout: Duration) -> Self {
        Self {
            expires_at: clock.now().saturating_add(timeout),
        }
    }

    /// Whether the deadline has passed.
    #[inline]
    #[must_use]
    pub fn has_expired<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        clock.now() >= self.expires_at
    }

    /// The clock reading at which this deadline expires.
    #[inline]
    #[must_use]
    pub const fn expires_at(&self) -> Duration {
        self.expires_at
    }
}

/// Spin until `condition` returns `true` or `timeout` elapses.
///
/// The condition is always evaluated at least once. Returns `true` if it was
/// met before the deadline.
pub fn poll_until<C, F>(clock: &C, timeout: Duration, mut condition: F) -> bool
where
    C: Clock + ?Sized,
    F: FnMut() -> bool,
{
    let deadline = Deadline::after(clock, timeout);
    loop {
        if condition() {
            return true;
        }
        if deadline.has_expired(clock) {
            return false;
        }
        core::hint::spin_loop();
    }
}

/// The Arm generic timer (CNTPCT_EL0 scaled by CNTFRQ_EL0).
#[cfg(target_arch = "aarch64")]
#[derive(Clone, Copy, Debug, Default)]
pub struct GenericTimer;

#[cfg(target_arch = "aarch64")]
impl Clock for GenericTimer {
    fn now(&self) -> Duration {
        let ticks = CNTPCT_EL0.get();
        let freq = CNTFRQ_EL0.get();

        if freq == 0 {
            return Duration::ZERO;
        }

        // u128 keeps ticks * 1e9 from overflowing
        let nanos = (ticks as u128 * 1_000_000_000) / freq as u128;
        Duration::from_nanos(nanos as u64)
    }
}

/// A clock that advances by a fixed step every time it is read.
///
/// Makes timeouts deterministic: a wait with budget `T` gives up after
/// roughly `T / step` polls regardless of host speed.
#[derive(Debug)]
pub struct TickClock {
    now: Cell<Duration>,
    step: Duration,
}

impl TickClock {
    /// Create a clock starting at zero.
    #[must_use]
    pub const fn new(step: Duration) -> Self {
        Self {
            now: Cell::new(Duration::ZERO),
            step,
        }
    }

    /// Jump the clock forward without counting as a read.
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get().saturating_add(by));
    }
}

impl Clock for TickClock {
    fn now(&self) -> Duration {
        let now = self.now.get();
        self.now.set(now.saturating_add(self.step));
        now
    }
}
