use crate::clock::monotonic_ns;
use crossbeam_utils::CachePadded;
use hdrhistogram::Histogram;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

const MAX_TRACKABLE_NS: u64 = 1_000_000_000_000;

#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
    pub p9999: u64,
}

/// Latency histogram over nanosecond samples, 1ns..1000s at 3 significant
/// figures. Owned by exactly one thread; snapshots are published by value.
pub struct LatencyRecorder {
    histogram: Histogram<u64>,
    sample_rate: u64,
    step: u64,
    sum: u64,
}

impl LatencyRecorder {
    /// `sample_rate` of 1 records every sample; N records every Nth.
    pub fn new(sample_rate: u64) -> Self {
        assert!(sample_rate > 0, "sample_rate must be positive");
        let histogram = Histogram::<u64>::new_with_bounds(1, MAX_TRACKABLE_NS, 3).unwrap();
        Self {
            histogram,
            sample_rate,
            step: 0,
            sum: 0,
        }
    }

    #[inline]
    pub fn record(&mut self, nanos: u64) {
        self.step += 1;
        if !self.step.is_multiple_of(self.sample_rate) {
            return;
        }
        self.record_unsampled(nanos);
    }

    #[inline]
    pub fn record_unsampled(&mut self, nanos: u64) {
        let nanos = nanos.clamp(1, MAX_TRACKABLE_NS);
        self.histogram.record(nanos).unwrap();
        self.sum += nanos;
    }

    /// Time a scope: the guard records on drop. Respects the sampling
    /// rate by handing out inert guards for skipped steps.
    pub fn time_scope(&mut self) -> ScopeTimer<'_> {
        self.step += 1;
        let start = if self.step.is_multiple_of(self.sample_rate) {
            Some(monotonic_ns())
        } else {
            None
        };
        ScopeTimer {
            recorder: self,
            start,
        }
    }

    pub fn reset(&mut self) {
        self.histogram.reset();
        self.sum = 0;
    }

    pub fn snapshot(&self) -> LatencyStats {
        let count = self.histogram.len();
        if count == 0 {
            return LatencyStats::default();
        }

        LatencyStats {
            count,
            min: self.histogram.min(),
            max: self.histogram.max(),
            mean: self.histogram.mean(),
            p50: self.histogram.value_at_quantile(0.5),
            p90: self.histogram.value_at_quantile(0.9),
            p99: self.histogram.value_at_quantile(0.99),
            p999: self.histogram.value_at_quantile(0.999),
            p9999: self.histogram.value_at_quantile(0.9999),
        }
    }

    pub fn format_stats(&self) -> String {
        let stats = self.snapshot();
        if stats.count == 0 {
            return "no samples".into();
        }

        format!(
            "min={} max={} mean={} p50={} p99={} p999={} p9999={}",
            format_duration(stats.min as f64),
            format_duration(stats.max as f64),
            format_duration(stats.mean),
            format_duration(stats.p50 as f64),
            format_duration(stats.p99 as f64),
            format_duration(stats.p999 as f64),
            format_duration(stats.p9999 as f64),
        )
    }
}

pub struct ScopeTimer<'a> {
    recorder: &'a mut LatencyRecorder,
    start: Option<u64>,
}

impl Drop for ScopeTimer<'_> {
    fn drop(&mut self) {
        if let Some(start) = self.start {
            let elapsed = monotonic_ns().saturating_sub(start);
            self.recorder.record_unsampled(elapsed);
        }
    }
}

pub fn format_duration(nanos: f64) -> String {
    if nanos < 1000.0 {
        format!("{:.0}ns", nanos)
    } else if nanos < 1_000_000.0 {
        format!("{:.1}us", nanos / 1000.0)
    } else if nanos < 1_000_000_000.0 {
        format!("{:.2}ms", nanos / 1_000_000.0)
    } else {
        format!("{:.2}s", nanos / 1_000_000_000.0)
    }
}

/// Shared decode-path counters. Each counter has exactly one writer;
/// anyone may read. A snapshot may be slightly inconsistent between
/// fields. Capture-side counters live with the capture stage.
#[derive(Default)]
pub struct PipelineCounters {
    pub messages_parsed: CachePadded<AtomicU64>,
    pub parse_errors: CachePadded<AtomicU64>,
    pub messages_dispatched: CachePadded<AtomicU64>,
    /// Records refused by full subscriber rings, summed across rings.
    pub messages_dropped: CachePadded<AtomicU64>,
    latency_min_ns: CachePadded<AtomicU64>,
    latency_max_ns: CachePadded<AtomicU64>,
    latency_sum_ns: CachePadded<AtomicU64>,
    latency_samples: CachePadded<AtomicU64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub messages_parsed: u64,
    pub parse_errors: u64,
    pub messages_dispatched: u64,
    pub messages_dropped: u64,
    pub latency_min_ns: u64,
    pub latency_max_ns: u64,
    pub latency_avg_ns: f64,
}

impl PipelineCounters {
    pub fn new() -> Self {
        let counters = Self::default();
        counters.latency_min_ns.store(u64::MAX, Relaxed);
        counters
    }

    /// Single-writer: only the thread that produced the sample calls this,
    /// so plain load/store on min/max is race-free.
    #[inline]
    pub fn record_latency(&self, nanos: u64) {
        if nanos < self.latency_min_ns.load(Relaxed) {
            self.latency_min_ns.store(nanos, Relaxed);
        }
        if nanos > self.latency_max_ns.load(Relaxed) {
            self.latency_max_ns.store(nanos, Relaxed);
        }
        self.latency_sum_ns.fetch_add(nanos, Relaxed);
        self.latency_samples.fetch_add(1, Relaxed);
    }

    pub fn avg_latency_ns(&self) -> f64 {
        let samples = self.latency_samples.load(Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.latency_sum_ns.load(Relaxed) as f64 / samples as f64
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let min = self.latency_min_ns.load(Relaxed);
        CounterSnapshot {
            messages_parsed: self.messages_parsed.load(Relaxed),
            parse_errors: self.parse_errors.load(Relaxed),
            messages_dispatched: self.messages_dispatched.load(Relaxed),
            messages_dropped: self.messages_dropped.load(Relaxed),
            latency_min_ns: if min == u64::MAX { 0 } else { min },
            latency_max_ns: self.latency_max_ns.load(Relaxed),
            latency_avg_ns: self.avg_latency_ns(),
        }
    }

    pub fn reset(&self) {
        self.messages_parsed.store(0, Relaxed);
        self.parse_errors.store(0, Relaxed);
        self.messages_dispatched.store(0, Relaxed);
        self.messages_dropped.store(0, Relaxed);
        self.latency_min_ns.store(u64::MAX, Relaxed);
        self.latency_max_ns.store(0, Relaxed);
        self.latency_sum_ns.store(0, Relaxed);
        self.latency_samples.store(0, Relaxed);
    }
}
