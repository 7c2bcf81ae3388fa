//! Guest timebase.
//!
//! The Xenon timebase ticks at 50 MHz. `mftb` in recompiled code reads the
//! host monotonic clock scaled to guest ticks, anchored at the first query
//! so early reads start near zero like a fresh console.

use std::sync::OnceLock;
use std::time::Instant;

const GUEST_TIMEBASE_HZ: u64 = 50_000_000;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic guest tick counter (mftb).
pub fn query_guest_tick_count() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    let nanos = epoch.elapsed().as_nanos() as u64;
    // 50 MHz = one tick per 20 ns.
    nanos / (1_000_000_000 / GUEST_TIMEBASE_HZ)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_count_is_monotonic() {
        let a = query_guest_tick_count();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = query_guest_tick_count();
        assert!(b > a);
        // 2 ms at 50 MHz is 100_000 ticks; allow generous slack.
        assert!(b - a >= 50_000);
    }
}
