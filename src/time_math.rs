/*
 * time_math.rs
 *
 * Deadline arithmetic for the timed wait and timed communicate loops.
 *
 * Rules:
 * - remaining time saturates at zero: overshooting a deadline is normal
 * - a deadline that can't be represented is "never", not a panic
 * - backoff starts sub-millisecond, doubles, and is capped twice: by
 *   BACKOFF_MAX and by whatever time is left
 * - poll(2) timeouts round UP to whole milliseconds so rounding never
 *   turns "0.4ms left" into a busy loop of poll(0)
 */

use std::time::{Duration, Instant};

/// First sleep between non-blocking reap attempts.
pub const BACKOFF_START: Duration = Duration::from_micros(500);
/// Longest sleep between reap attempts.
pub const BACKOFF_MAX: Duration = Duration::from_millis(50);

/*
 * Absolute deadline `timeout` from `now`.
 *
 * None when the sum overflows Instant - callers treat that as no deadline.
 */
#[inline]
#[must_use]
pub fn deadline_after(now: Instant, timeout: Duration) -> Option<Instant> {
    now.checked_add(timeout)
}

/* time left until deadline, zero on overshoot */
#[inline]
#[must_use]
pub fn remaining(now: Instant, deadline: Instant) -> Duration {
    deadline.saturating_duration_since(now)
}

#[inline]
#[must_use]
pub fn deadline_reached(now: Instant, deadline: Instant) -> bool {
    now >= deadline
}

/* next backoff step: double, capped at BACKOFF_MAX */
#[inline]
#[must_use]
pub fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(BACKOFF_MAX)
}

/* how long to actually sleep: never past the deadline */
#[inline]
#[must_use]
pub fn backoff_sleep(step: Duration, left: Duration) -> Duration {
    step.min(left)
}

/*
 * poll(2) timeout in milliseconds for `left`, rounded up.
 *
 * Clamped to i32::MAX (about 24 days); the loop re-polls if it wakes
 * early.
 */
#[must_use]
pub fn poll_timeout_ms(left: Duration) -> libc::c_int {
    let mut ms = left.as_millis();
    if left.subsec_nanos() % 1_000_000 != 0 {
        ms += 1;
    }
    libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
}
