//! Monotonic microsecond clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_US: AtomicU64 = AtomicU64::new(0);

/// Returns the current time in microseconds since the Unix epoch, ratcheted
/// so that two successive calls on the same process never observe the same
/// or a decreasing value.
///
/// Vector clock entries stamped on one node must increase strictly between
/// increments, even when the system clock stalls or steps backwards.
pub fn monotonic_us() -> u64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);

    let mut prev = LAST_US.load(Ordering::Relaxed);
    loop {
        let next = wall.max(prev + 1);
        match LAST_US.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return next,
            Err(observed) => prev = observed,
        }
    }
}
