//! Kernel-to-wall clock normalization.
//!
//! Kernel probes stamp events with `bpf_ktime_get_ns`, which counts from
//! boot, not from the epoch. The offset between the two clocks is computed
//! once at startup and applied to every event timestamp.

use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

/// Nanoseconds to add to a boot-relative timestamp to get wall-clock time.
/// Returns 0 (leaving timestamps boot-relative) if either clock read fails.
pub fn boot_offset_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if ret != 0 {
        warn!("clock_gettime(CLOCK_MONOTONIC) failed, event timestamps stay boot-relative");
        return 0;
    }
    let monotonic = ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64;

    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64 - monotonic,
        Err(_) => {
            warn!("wall clock predates the epoch, event timestamps stay boot-relative");
            0
        }
    }
}

/// Apply a boot offset to a kernel timestamp, saturating at the u64 range.
pub fn normalize(ts_ns: u64, offset_ns: i64) -> u64 {
    if offset_ns >= 0 {
        ts_ns.saturating_add(offset_ns as u64)
    } else {
        ts_ns.saturating_sub(offset_ns.unsigned_abs())
    }
}

/// Current wall-clock time in nanoseconds since the epoch.
pub fn wall_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
