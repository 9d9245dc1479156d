use std::sync::LazyLock;
use std::time::Instant;

/// Process-wide monotonic anchor. All local timestamps are nanoseconds
/// relative to this instant, so they compare and subtract safely across
/// threads.
pub static START_TIME: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Monotonic nanoseconds since process start.
#[inline(always)]
pub fn monotonic_ns() -> u64 {
    START_TIME.elapsed().as_nanos() as u64
}

/// Elapsed nanoseconds since an earlier [`monotonic_ns`] reading.
/// Saturates instead of wrapping when clocks are handed around threads.
#[inline(always)]
pub fn elapsed_ns(since: u64) -> u64 {
    monotonic_ns().saturating_sub(since)
}
