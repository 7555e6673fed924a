//! Monotonic tick source for the latency stamps.
//!
//! Ticks are nanoseconds from `CLOCK_MONOTONIC`; the frequency is
//! published in the header so the host converts stamps to microseconds
//! without a syscall.

/// Ticks per second of [`ticks`].
pub const TICKS_PER_SEC: u64 = 1_000_000_000;

/// Current monotonic tick count.
#[allow(unsafe_code)]
#[must_use]
pub fn ticks() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64) * TICKS_PER_SEC + ts.tv_nsec as u64
}

/// Milliseconds since boot, for the coarse last-update stamp.
#[must_use]
pub fn millis() -> u64 {
    ticks() / 1_000_000
}

/// Microseconds between two tick stamps.
///
/// Yields 0 for a wrapped or negative interval. The multiply widens to
/// `u128` so large tick values cannot overflow before the divide.
#[must_use]
pub fn ticks_to_micros(start: u64, end: u64) -> u64 {
    if end < start {
        return 0;
    }
    ((u128::from(end - start) * 1_000_000) / u128::from(TICKS_PER_SEC)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_monotonic() {
        let a = ticks();
        let b = ticks();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn test_micros_conversion() {
        assert_eq!(ticks_to_micros(0, TICKS_PER_SEC), 1_000_000);
        assert_eq!(ticks_to_micros(500, 1_500), 1);
        assert_eq!(ticks_to_micros(0, 0), 0);
    }

    #[test]
    fn test_micros_negative_interval() {
        assert_eq!(ticks_to_micros(100, 50), 0);
    }

    #[test]
    fn test_micros_no_overflow() {
        // A diff far past 2^44 ticks would overflow a naive u64 multiply.
        let start = 0;
        let end = u64::MAX / 2;
        assert_eq!(
            ticks_to_micros(start, end),
            ((u128::from(end) * 1_000_000) / 1_000_000_000) as u64
        );
    }
}
