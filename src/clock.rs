//! Monotonic time, cached per scheduling decision.
//!
//! The scheduler refreshes a vcpu-local microsecond timestamp on every
//! scheduling decision; everything inside the runtime (timer deadlines,
//! poll timeouts, RPC expirations) is computed against that cache instead
//! of hitting `clock_gettime` on every call.
//!
//! - [`now_cached()`] - the cached event-loop time, cheap;
//! - [`now()`] - the real `CLOCK_MONOTONIC` reading, accurate;
//! - [`Deadline`] - saturating `now + timeout` arithmetic.
//!
//! Use [`now_cached`] when computing timeouts for yielding operations, and
//! [`now`] when timing how long things execute.

use std::cell::Cell;
use std::mem::MaybeUninit;
use std::time::Duration;

/// Timeout value meaning "wait forever".
pub const TIMEOUT_INFINITY: u64 = u64::MAX;

thread_local! {
    static CACHED_US: Cell<u64> = Cell::new(0);
}

/// Read `CLOCK_MONOTONIC`, in microseconds since an unspecified epoch.
#[inline]
pub fn now() -> u64 {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr()) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        panic!("failed to get time: {}", err);
    }
    let ts = unsafe { ts.assume_init() };
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

/// The monotonic time cached at the last scheduling decision of this vcpu,
/// in microseconds.
///
/// Outside a runtime (before [`init`](crate::init)) falls back to the real
/// clock.
#[inline(always)]
pub fn now_cached() -> u64 {
    CACHED_US.with(|c| {
        let v = c.get();
        if v != 0 {
            v
        } else {
            now()
        }
    })
}

/// Refresh the vcpu-local cache. Called by the scheduler; harmless (but
/// pointless) anywhere else.
#[inline]
pub(crate) fn refresh() -> u64 {
    let t = now();
    CACHED_US.with(|c| c.set(t));
    t
}

////////////////////////////////////////////////////////////////////////////////
// Deadline
////////////////////////////////////////////////////////////////////////////////

/// A point in cached-monotonic time at which a blocking call gives up.
///
/// Encapsulates the saturating arithmetic so that `TIMEOUT_INFINITY` never
/// overflows into the past.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(u64);

impl Deadline {
    /// A deadline that never expires.
    pub const INFINITE: Self = Deadline(u64::MAX);

    /// Deadline `timeout_us` microseconds from the cached now.
    #[inline]
    pub fn after_us(timeout_us: u64) -> Self {
        Deadline(now_cached().saturating_add(timeout_us))
    }

    /// Deadline a `Duration` from the cached now. `None` means infinite.
    #[inline]
    pub fn after(timeout: Option<Duration>) -> Self {
        match timeout {
            None => Self::INFINITE,
            Some(d) => Self::after_us(duration_to_us(d)),
        }
    }

    /// The absolute expiration time in microseconds.
    #[inline(always)]
    pub fn expire_us(&self) -> u64 {
        self.0
    }

    /// Time left until expiration, saturating at zero.
    #[inline]
    pub fn remaining_us(&self) -> u64 {
        if self.0 == u64::MAX {
            TIMEOUT_INFINITY
        } else {
            self.0.saturating_sub(now_cached())
        }
    }

    /// Has the deadline passed, per the cached clock?
    #[inline]
    pub fn has_expired(&self) -> bool {
        self.0 != u64::MAX && self.0 <= now_cached()
    }
}

/// Saturating `Duration` → microseconds conversion.
#[inline]
pub fn duration_to_us(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(TIMEOUT_INFINITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn cached_tracks_refresh() {
        let t = refresh();
        assert_eq!(now_cached(), t);
        let t2 = refresh();
        assert!(t2 >= t);
    }

    #[test]
    fn deadline_saturates() {
        refresh();
        let d = Deadline::after_us(TIMEOUT_INFINITY);
        assert_eq!(d, Deadline::INFINITE);
        assert!(!d.has_expired());
        assert_eq!(d.remaining_us(), TIMEOUT_INFINITY);

        let z = Deadline::after_us(0);
        assert!(z.remaining_us() <= 1);
    }

    #[test]
    fn duration_conversion() {
        assert_eq!(duration_to_us(Duration::from_millis(2)), 2_000);
        assert_eq!(duration_to_us(Duration::MAX), TIMEOUT_INFINITY);
    }
}
