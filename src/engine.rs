use crate::affinity;
use crate::book::{OrderBook, PriceLevel};
use crate::capture::{CaptureConfig, CaptureConsumer, CaptureStats, UdpCapture};
use crate::clock::monotonic_ns;
use crate::decoder::{Decoder, DecoderRegistry, DecoderStats};
use crate::dispatch::{DispatchHandle, Dispatcher, Subscriber, SubscriberStats};
use crate::hw::{self, Offload};
use crate::pool::ObjectPool;
use crate::stats::{CounterSnapshot, LatencyRecorder, LatencyStats, PipelineCounters};
use crate::types::{InstrumentId, MessageKind, NormalizedMessage, Price, Quantity, Side};
use hashbrown::HashMap;
use spdlog::{info, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct ThreadConfig {
    pub decode_cpu: Option<usize>,
    pub dispatch_cpu: Option<usize>,
    pub use_realtime: bool,
    pub realtime_priority: i32,
    pub lock_memory: bool,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            decode_cpu: None,
            dispatch_cpu: None,
            use_realtime: false,
            realtime_priority: 10,
            lock_memory: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PoolSizes {
    pub order_pool_size: u32,
    /// Power of two; every subscriber ring gets this many slots.
    pub subscriber_ring_size: usize,
    /// Scratch records per parsed packet.
    pub max_messages_per_packet: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            order_pool_size: 1 << 20,
            subscriber_ring_size: 1 << 16,
            max_messages_per_packet: 64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BookConfig {
    pub max_symbols: usize,
    pub max_price_levels: usize,
    pub enable_book_processing: bool,
    /// Create books on demand for instruments first seen at decode time.
    pub auto_add_symbols: bool,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            max_symbols: 10_000,
            max_price_levels: crate::book::DEFAULT_MAX_PRICE_LEVELS,
            enable_book_processing: true,
            auto_add_symbols: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DecoderConfig {
    pub protocol: String,
    pub enable_sequence_checking: bool,
    /// Honored by protocols that carry frame checksums; ITCH 5.0 has none,
    /// so the flag is accepted and ignored there.
    pub validate_checksums: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            protocol: "ITCH-5.0".into(),
            enable_sequence_checking: false,
            validate_checksums: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub network: CaptureConfig,
    pub threads: ThreadConfig,
    pub pools: PoolSizes,
    pub book: BookConfig,
    pub decoder: DecoderConfig,
    /// When set, a statistics thread snapshots at this cadence and invokes
    /// the statistics callback.
    pub stats_interval: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("network configuration invalid: {0}")]
    Network(String),
    #[error("pool configuration invalid: {0}")]
    Pool(String),
    #[error("book configuration invalid: {0}")]
    Book(String),
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
}

impl EngineConfig {
    pub fn validate(&self, registry: &DecoderRegistry) -> Result<(), ConfigError> {
        if !self.network.is_valid() {
            return Err(ConfigError::Network(
                "ring size must be a power of two and pool/buffer sizes positive".into(),
            ));
        }
        if self.pools.order_pool_size == 0 {
            return Err(ConfigError::Pool(
                "order pool must hold at least one order".into(),
            ));
        }
        if !self.pools.subscriber_ring_size.is_power_of_two() || self.pools.subscriber_ring_size < 2
        {
            return Err(ConfigError::Pool(
                "subscriber ring size must be a power of two".into(),
            ));
        }
        if self.pools.max_messages_per_packet == 0 {
            return Err(ConfigError::Pool(
                "max_messages_per_packet must be positive".into(),
            ));
        }
        if self.book.max_symbols == 0 || self.book.max_price_levels == 0 {
            return Err(ConfigError::Book(
                "max_symbols and max_price_levels must be positive".into(),
            ));
        }
        if !registry.contains(&self.decoder.protocol) {
            return Err(ConfigError::UnknownProtocol(self.decoder.protocol.clone()));
        }
        Ok(())
    }
}

/// Abstract error categories surfaced through the error callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidMessage,
    SequenceGap,
    UnknownSymbol,
    PoolExhausted,
    NetworkError,
    ConfigInvalid,
}

impl ErrorKind {
    fn slot(self) -> usize {
        match self {
            ErrorKind::InvalidMessage => 0,
            ErrorKind::SequenceGap => 1,
            ErrorKind::UnknownSymbol => 2,
            ErrorKind::PoolExhausted => 3,
            ErrorKind::NetworkError => 4,
            ErrorKind::ConfigInvalid => 5,
        }
    }
}

const ERROR_KINDS: usize = 6;
const ERROR_CALLBACK_INTERVAL_NS: u64 = 1_000_000_000;

type ErrorCallback = Box<dyn Fn(ErrorKind, &str) + Send + Sync>;

/// Rate-limited outward error channel: at most one callback per kind per
/// second; a panicking callback is caught and counted, never propagated.
struct ErrorReporter {
    callback: Mutex<Option<ErrorCallback>>,
    last_emit_ns: [AtomicU64; ERROR_KINDS],
    callback_panics: AtomicU64,
}

impl ErrorReporter {
    fn new() -> Self {
        Self {
            callback: Mutex::new(None),
            last_emit_ns: Default::default(),
            callback_panics: AtomicU64::new(0),
        }
    }

    fn set_callback(&self, callback: ErrorCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    fn report(&self, kind: ErrorKind, message: &str) {
        let now = monotonic_ns().max(1);
        let slot = &self.last_emit_ns[kind.slot()];
        let last = slot.load(Relaxed);
        if last != 0 && now.saturating_sub(last) < ERROR_CALLBACK_INTERVAL_NS {
            return;
        }
        if slot.compare_exchange(last, now, Relaxed, Relaxed).is_err() {
            return;
        }
        let guard = self.callback.lock().unwrap();
        if let Some(callback) = guard.as_ref() {
            if catch_unwind(AssertUnwindSafe(|| callback(kind, message))).is_err() {
                self.callback_panics.fetch_add(1, Relaxed);
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineStatistics {
    pub capture: CaptureStats,
    pub pipeline: CounterSnapshot,
    pub decoder: DecoderStats,
    /// Capture stamp to post-dispatch, per record batch.
    pub end_to_end_latency: LatencyStats,
    /// Parse + book + fan-out work per packet, excluding queue residence.
    pub processing_latency: LatencyStats,
    pub subscribers: Vec<SubscriberStats>,
    pub book_updates: u64,
    pub book_update_failures: u64,
    pub symbols_active: usize,
    pub order_pool_utilization: f64,
    pub healthy: bool,
}

type StatsCallback = Box<dyn Fn(&EngineStatistics) + Send + Sync>;
type QuoteCallback = Arc<dyn Fn(InstrumentId, Option<PriceLevel>, Option<PriceLevel>) + Send + Sync>;
type TradeCallback = Arc<dyn Fn(InstrumentId, Price, Quantity) + Send + Sync>;

/// State shared between the engine facade, the decode thread, and the
/// statistics thread.
struct EngineShared {
    running: Arc<AtomicBool>,
    counters: Arc<PipelineCounters>,
    books: Arc<Mutex<HashMap<InstrumentId, OrderBook>>>,
    order_pool: Arc<ObjectPool<crate::book::Order>>,
    decoder_stats: Arc<Mutex<DecoderStats>>,
    e2e_latency: Arc<Mutex<LatencyStats>>,
    processing_latency: Arc<Mutex<LatencyStats>>,
    book_updates: Arc<AtomicU64>,
    book_update_failures: Arc<AtomicU64>,
    reporter: Arc<ErrorReporter>,
}

/// Assembles capture, decode, book maintenance and fan-out into one
/// pipeline with three named threads: capture, dispatch, decode (started
/// in that order, stopped in reverse).
pub struct Engine {
    config: EngineConfig,
    capture: UdpCapture,
    dispatcher: Dispatcher,
    decoder: Option<Box<dyn Decoder>>,
    offload: Option<Box<dyn Offload>>,
    quote_callback: Option<QuoteCallback>,
    trade_callback: Option<TradeCallback>,
    shared: EngineShared,
    decode_thread: Option<thread::JoinHandle<(Box<dyn Decoder>, Option<Box<dyn Offload>>)>>,
    stats_thread: Option<thread::JoinHandle<()>>,
    stats_running: Arc<AtomicBool>,
    stats_callback: Arc<Mutex<Option<StatsCallback>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        Self::with_registry(config, &DecoderRegistry::with_defaults())
    }

    pub fn with_registry(
        config: EngineConfig,
        registry: &DecoderRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate(registry)?;

        let capture = UdpCapture::new(config.network.clone())
            .map_err(|err| ConfigError::Network(err.to_string()))?;
        let order_pool = Arc::new(
            ObjectPool::new(config.pools.order_pool_size)
                .map_err(|err| ConfigError::Pool(err.to_string()))?,
        );
        let dispatcher = Dispatcher::new(config.pools.subscriber_ring_size);

        // The registry hands out decoders with default settings; the ITCH
        // gap checker is the one knob configured past construction.
        let decoder: Box<dyn Decoder> =
            if config.decoder.protocol == "ITCH-5.0" && config.decoder.enable_sequence_checking {
                Box::new(crate::decoder::Itch50Decoder::new().with_sequence_checking(true))
            } else {
                registry
                    .create(&config.decoder.protocol)
                    .ok_or_else(|| ConfigError::UnknownProtocol(config.decoder.protocol.clone()))?
            };

        let shared = EngineShared {
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(PipelineCounters::new()),
            books: Arc::new(Mutex::new(HashMap::new())),
            order_pool,
            decoder_stats: Arc::new(Mutex::new(DecoderStats::default())),
            e2e_latency: Arc::new(Mutex::new(LatencyStats::default())),
            processing_latency: Arc::new(Mutex::new(LatencyStats::default())),
            book_updates: Arc::new(AtomicU64::new(0)),
            book_update_failures: Arc::new(AtomicU64::new(0)),
            reporter: Arc::new(ErrorReporter::new()),
        };

        Ok(Self {
            config,
            capture,
            dispatcher,
            decoder: Some(decoder),
            offload: None,
            quote_callback: None,
            trade_callback: None,
            shared,
            decode_thread: None,
            stats_thread: None,
            stats_running: Arc::new(AtomicBool::new(false)),
            stats_callback: Arc::new(Mutex::new(None)),
        })
    }

    /// Swap the protocol decoder. Refused while running.
    pub fn set_decoder(&mut self, decoder: Box<dyn Decoder>) -> bool {
        if self.is_running() {
            return false;
        }
        self.decoder = Some(decoder);
        true
    }

    /// Attach a hardware offload adapter; the engine is software-only
    /// without one. Refused while running.
    pub fn set_offload(&mut self, offload: Box<dyn Offload>) -> bool {
        if self.is_running() {
            return false;
        }
        self.offload = Some(offload);
        true
    }

    /// Registration only while stopped.
    pub fn add_subscriber(&mut self, subscriber: Box<dyn Subscriber>) -> bool {
        if self.is_running() {
            return false;
        }
        self.dispatcher.add_subscriber(subscriber)
    }

    pub fn set_error_callback(
        &mut self,
        callback: impl Fn(ErrorKind, &str) + Send + Sync + 'static,
    ) {
        self.shared.reporter.set_callback(Box::new(callback));
    }

    pub fn set_statistics_callback(
        &mut self,
        callback: impl Fn(&EngineStatistics) + Send + Sync + 'static,
    ) {
        *self.stats_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Invoked from the decode thread whenever a book's touch (best bid or
    /// ask price/quantity) changes. Must not block. Only while stopped.
    pub fn set_quote_callback(
        &mut self,
        callback: impl Fn(InstrumentId, Option<PriceLevel>, Option<PriceLevel>) + Send + Sync + 'static,
    ) -> bool {
        if self.is_running() {
            return false;
        }
        self.quote_callback = Some(Arc::new(callback));
        true
    }

    /// Invoked from the decode thread for every trade record. Must not
    /// block. Only while stopped.
    pub fn set_trade_callback(
        &mut self,
        callback: impl Fn(InstrumentId, Price, Quantity) + Send + Sync + 'static,
    ) -> bool {
        if self.is_running() {
            return false;
        }
        self.trade_callback = Some(Arc::new(callback));
        true
    }

    /// Zero every counter and latency window, including the decoder's
    /// cumulative counters and protocol state (symbol table, gap
    /// tracking). Books are untouched. Only while stopped.
    pub fn reset_statistics(&mut self) -> bool {
        if self.is_running() {
            return false;
        }
        self.shared.counters.reset();
        self.capture.reset_stats();
        self.shared.book_updates.store(0, Relaxed);
        self.shared.book_update_failures.store(0, Relaxed);
        *self.shared.decoder_stats.lock().unwrap() = DecoderStats::default();
        *self.shared.e2e_latency.lock().unwrap() = LatencyStats::default();
        *self.shared.processing_latency.lock().unwrap() = LatencyStats::default();
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
        true
    }

    /// Bind the socket and prepare components. Failure leaves the engine
    /// stopped and reusable.
    pub fn initialize(&mut self) -> bool {
        if self.config.threads.lock_memory {
            affinity::lock_process_memory();
        }
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.initialize();
        }
        self.capture.initialize()
    }

    /// Start capture, dispatch, then decode. False when any stage fails;
    /// already-started stages are rolled back.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            return true;
        }
        let Some(decoder) = self.decoder.take() else {
            return false;
        };

        if !self.capture.start() {
            self.decoder = Some(decoder);
            return false;
        }
        if !self.dispatcher.start(self.config.threads.dispatch_cpu) {
            self.capture.stop();
            self.decoder = Some(decoder);
            return false;
        }
        let Some(dispatch) = self.dispatcher.handle() else {
            self.dispatcher.stop();
            self.capture.stop();
            self.decoder = Some(decoder);
            return false;
        };

        self.shared.running.store(true, Relaxed);
        let worker = DecodeWorker {
            running: self.shared.running.clone(),
            consumer: self.capture.consumer(),
            dispatch,
            counters: self.shared.counters.clone(),
            books: self.shared.books.clone(),
            order_pool: self.shared.order_pool.clone(),
            decoder_stats: self.shared.decoder_stats.clone(),
            e2e_latency: self.shared.e2e_latency.clone(),
            processing_latency: self.shared.processing_latency.clone(),
            book_updates: self.shared.book_updates.clone(),
            book_update_failures: self.shared.book_update_failures.clone(),
            reporter: self.shared.reporter.clone(),
            quote_callback: self.quote_callback.clone(),
            trade_callback: self.trade_callback.clone(),
            book_config: self.config.book.clone(),
            max_messages: self.config.pools.max_messages_per_packet,
            cpu: self.config.threads.decode_cpu,
            use_realtime: self.config.threads.use_realtime,
            realtime_priority: self.config.threads.realtime_priority,
        };
        let offload = self.offload.take();
        let spawned = thread::Builder::new()
            .name("decode".into())
            .spawn(move || worker.run(decoder, offload));

        match spawned {
            Ok(handle) => {
                self.decode_thread = Some(handle);
                self.start_stats_thread();
                info!("engine started ({})", self.config.decoder.protocol);
                true
            }
            Err(err) => {
                warn!("failed to spawn decode thread: {}", err);
                self.shared.running.store(false, Relaxed);
                self.dispatcher.stop();
                self.capture.stop();
                false
            }
        }
    }

    /// Stop in reverse start order: decode, dispatch, capture.
    pub fn stop(&mut self) {
        self.stats_running.store(false, Relaxed);
        if let Some(thread) = self.stats_thread.take() {
            let _ = thread.join();
        }

        self.shared.running.store(false, Relaxed);
        if let Some(thread) = self.decode_thread.take() {
            match thread.join() {
                Ok((decoder, offload)) => {
                    self.decoder = Some(decoder);
                    self.offload = offload;
                }
                Err(_) => warn!("decode thread panicked"),
            }
        }
        self.dispatcher.stop();
        self.capture.stop();
        info!("engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Relaxed)
    }

    /// The capture stage, for port and counter inspection.
    pub fn capture(&self) -> &UdpCapture {
        &self.capture
    }

    /// Create an empty book for an instrument. Only while stopped.
    pub fn add_symbol(&mut self, instrument: InstrumentId) -> bool {
        if self.is_running() {
            return false;
        }
        let mut books = self.shared.books.lock().unwrap();
        if books.contains_key(&instrument) {
            return true;
        }
        if books.len() >= self.config.book.max_symbols {
            return false;
        }
        books.insert(
            instrument,
            OrderBook::with_max_levels(
                instrument,
                self.shared.order_pool.clone(),
                self.config.book.max_price_levels,
            ),
        );
        true
    }

    /// Drop an instrument's book, releasing its orders. Only while stopped.
    pub fn remove_symbol(&mut self, instrument: InstrumentId) -> bool {
        if self.is_running() {
            return false;
        }
        self.shared
            .books
            .lock()
            .unwrap()
            .remove(&instrument)
            .is_some()
    }

    pub fn active_symbols(&self) -> Vec<InstrumentId> {
        let mut symbols: Vec<_> = self.shared.books.lock().unwrap().keys().copied().collect();
        symbols.sort_unstable();
        symbols
    }

    /// Run a closure against one instrument's book. Intended for use while
    /// stopped; while running it briefly contends with the decode thread.
    pub fn with_book<R>(
        &self,
        instrument: InstrumentId,
        f: impl FnOnce(&OrderBook) -> R,
    ) -> Option<R> {
        let books = self.shared.books.lock().unwrap();
        books.get(&instrument).map(f)
    }

    /// Snapshot of every pipeline counter. Fields may be mutually slightly
    /// inconsistent; always readable, running or not.
    pub fn get_statistics(&self) -> EngineStatistics {
        let healthy = self.is_healthy();
        EngineStatistics {
            capture: self.capture.stats(),
            pipeline: self.shared.counters.snapshot(),
            decoder: *self.shared.decoder_stats.lock().unwrap(),
            end_to_end_latency: self.shared.e2e_latency.lock().unwrap().clone(),
            processing_latency: self.shared.processing_latency.lock().unwrap().clone(),
            subscribers: self.dispatcher.subscriber_stats(),
            book_updates: self.shared.book_updates.load(Relaxed),
            book_update_failures: self.shared.book_update_failures.load(Relaxed),
            symbols_active: self.shared.books.lock().unwrap().len(),
            order_pool_utilization: self.shared.order_pool.utilization(),
            healthy,
        }
    }

    pub fn is_healthy(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let decode_alive = self
            .decode_thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished());
        decode_alive && self.capture.is_healthy() && self.shared.order_pool.utilization() < 1.0
    }

    fn start_stats_thread(&mut self) {
        let Some(interval) = self.config.stats_interval else {
            return;
        };
        self.stats_running.store(true, Relaxed);

        let running = self.stats_running.clone();
        let callback = self.stats_callback.clone();
        let capture_counters = self.capture.shared_counters();
        let counters = self.shared.counters.clone();
        let decoder_stats = self.shared.decoder_stats.clone();
        let e2e_latency = self.shared.e2e_latency.clone();
        let processing_latency = self.shared.processing_latency.clone();
        let books = self.shared.books.clone();
        let order_pool = self.shared.order_pool.clone();
        let book_updates = self.shared.book_updates.clone();
        let book_update_failures = self.shared.book_update_failures.clone();
        let roster = self.dispatcher.roster();
        let reporter = self.shared.reporter.clone();

        let spawned = thread::Builder::new()
            .name("stats".into())
            .spawn(move || {
                let mut last_network_errors = 0u64;
                while running.load(Relaxed) {
                    thread::sleep(interval);
                    if !running.load(Relaxed) {
                        break;
                    }

                    let errors = capture_counters.errors.load(Relaxed);
                    if errors > last_network_errors {
                        reporter.report(ErrorKind::NetworkError, "capture errors increasing");
                        last_network_errors = errors;
                    }

                    let snapshot = EngineStatistics {
                        capture: CaptureStats {
                            packets_received: capture_counters.packets_received.load(Relaxed),
                            packets_dropped: capture_counters.packets_dropped.load(Relaxed),
                            bytes_received: capture_counters.bytes_received.load(Relaxed),
                            errors,
                            sequence_gaps: capture_counters.sequence_gaps.load(Relaxed),
                            consecutive_errors: capture_counters.consecutive_errors.load(Relaxed),
                            reconnect_attempts: capture_counters.reconnect_attempts.load(Relaxed),
                            peak_ring_usage: capture_counters.peak_ring_usage.load(Relaxed),
                            ..Default::default()
                        },
                        pipeline: counters.snapshot(),
                        decoder: *decoder_stats.lock().unwrap(),
                        end_to_end_latency: e2e_latency.lock().unwrap().clone(),
                        processing_latency: processing_latency.lock().unwrap().clone(),
                        subscribers: crate::dispatch::stats_from_roster(&roster),
                        book_updates: book_updates.load(Relaxed),
                        book_update_failures: book_update_failures.load(Relaxed),
                        symbols_active: books.lock().unwrap().len(),
                        order_pool_utilization: order_pool.utilization(),
                        healthy: true,
                    };
                    if let Some(callback) = callback.lock().unwrap().as_ref() {
                        callback(&snapshot);
                    }
                }
            });
        match spawned {
            Ok(handle) => self.stats_thread = Some(handle),
            Err(err) => warn!("failed to spawn stats thread: {}", err),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct DecodeWorker {
    running: Arc<AtomicBool>,
    consumer: CaptureConsumer,
    dispatch: DispatchHandle,
    counters: Arc<PipelineCounters>,
    books: Arc<Mutex<HashMap<InstrumentId, OrderBook>>>,
    order_pool: Arc<ObjectPool<crate::book::Order>>,
    decoder_stats: Arc<Mutex<DecoderStats>>,
    e2e_latency: Arc<Mutex<LatencyStats>>,
    processing_latency: Arc<Mutex<LatencyStats>>,
    book_updates: Arc<AtomicU64>,
    book_update_failures: Arc<AtomicU64>,
    reporter: Arc<ErrorReporter>,
    quote_callback: Option<QuoteCallback>,
    trade_callback: Option<TradeCallback>,
    book_config: BookConfig,
    max_messages: usize,
    cpu: Option<usize>,
    use_realtime: bool,
    realtime_priority: i32,
}

impl DecodeWorker {
    fn run(
        self,
        mut decoder: Box<dyn Decoder>,
        mut offload: Option<Box<dyn Offload>>,
    ) -> (Box<dyn Decoder>, Option<Box<dyn Offload>>) {
        if let Some(cpu) = self.cpu {
            affinity::pin_to_cpu(cpu);
        }
        if self.use_realtime {
            affinity::set_realtime(self.realtime_priority);
        }

        let mut out = vec![NormalizedMessage::default(); self.max_messages];
        let mut e2e = LatencyRecorder::new(1);
        let mut processing = LatencyRecorder::new(1);
        let mut packets = 0u64;
        let mut last_parse_errors = 0u64;
        let mut last_gaps = 0u64;

        while self.running.load(Relaxed) {
            let Some(packet) = self.consumer.try_next() else {
                thread::yield_now();
                continue;
            };

            let work_start = monotonic_ns();
            let view = packet.view();
            let capture_ns = view.timestamp;
            let count = decoder.parse(&view, &mut out);
            drop(packet);

            for msg in &out[..count] {
                self.process_record(msg, offload.as_deref_mut());
            }

            if count > 0 {
                let now = monotonic_ns();
                let sample = now.saturating_sub(capture_ns);
                self.counters.record_latency(sample);
                e2e.record(sample);
                processing.record(now.saturating_sub(work_start));
            }

            // Publish decoder state; these counters are single-writer so
            // plain stores are enough.
            let stats = decoder.stats();
            self.counters
                .messages_parsed
                .store(stats.messages_parsed, Relaxed);
            self.counters.parse_errors.store(stats.parse_errors, Relaxed);
            if stats.parse_errors > last_parse_errors {
                self.reporter
                    .report(ErrorKind::InvalidMessage, "malformed frames observed");
                last_parse_errors = stats.parse_errors;
            }
            if stats.sequence_gaps > last_gaps {
                self.reporter
                    .report(ErrorKind::SequenceGap, "protocol sequence gap observed");
                last_gaps = stats.sequence_gaps;
            }

            packets += 1;
            if packets.is_multiple_of(1024) {
                *self.decoder_stats.lock().unwrap() = stats;
                *self.e2e_latency.lock().unwrap() = e2e.snapshot();
                *self.processing_latency.lock().unwrap() = processing.snapshot();
            }
        }

        *self.decoder_stats.lock().unwrap() = decoder.stats();
        let final_e2e = e2e.snapshot();
        if final_e2e.count > 0 {
            info!("[decode] end-to-end: {}", e2e.format_stats());
            info!("[decode] processing: {}", processing.format_stats());
        }
        *self.e2e_latency.lock().unwrap() = final_e2e;
        *self.processing_latency.lock().unwrap() = processing.snapshot();
        (decoder, offload)
    }

    fn process_record(&self, msg: &NormalizedMessage, offload: Option<&mut (dyn Offload + '_)>) {
        if self.book_config.enable_book_processing && is_book_kind(msg.kind()) {
            self.update_book(msg);
        }

        if msg.kind() == MessageKind::Trade {
            if let Some(callback) = &self.trade_callback {
                callback(msg.instrument_id, msg.price, msg.quantity);
            }
        }

        if let Some(offload) = offload {
            if is_book_kind(msg.kind()) || msg.kind() == MessageKind::Trade {
                offload.send(&hw::order_message(
                    msg.sequence,
                    msg.instrument_id,
                    msg.order_id,
                    msg.price,
                    msg.quantity,
                    Side::from_u8(msg.side),
                ));
            }
        }

        let accepted = self.dispatch.dispatch(msg);
        self.counters.messages_dispatched.fetch_add(1, Relaxed);
        let refused = self.dispatch.lane_count() - accepted;
        if refused > 0 {
            self.counters
                .messages_dropped
                .fetch_add(refused as u64, Relaxed);
        }
    }

    fn update_book(&self, msg: &NormalizedMessage) {
        let mut books = self.books.lock().unwrap();
        let book = match books.get_mut(&msg.instrument_id) {
            Some(book) => book,
            None => {
                if !self.book_config.auto_add_symbols || books.len() >= self.book_config.max_symbols
                {
                    self.reporter
                        .report(ErrorKind::UnknownSymbol, "record for untracked instrument");
                    return;
                }
                books.entry(msg.instrument_id).or_insert_with(|| {
                    OrderBook::with_max_levels(
                        msg.instrument_id,
                        self.order_pool.clone(),
                        self.book_config.max_price_levels,
                    )
                })
            }
        };

        let touch_before = self.quote_callback.as_ref().map(|_| touch(book));

        if book.apply(msg) {
            self.book_updates.fetch_add(1, Relaxed);
        } else {
            self.book_update_failures.fetch_add(1, Relaxed);
            if self.order_pool.is_exhausted() {
                self.reporter
                    .report(ErrorKind::PoolExhausted, "order pool exhausted");
            }
        }

        if let (Some(callback), Some(before)) = (&self.quote_callback, touch_before) {
            if touch(book) != before {
                callback(
                    msg.instrument_id,
                    book.best_bid().copied(),
                    book.best_ask().copied(),
                );
            }
        }
    }
}

type Touch = (Option<(Price, Quantity)>, Option<(Price, Quantity)>);

#[inline]
fn touch(book: &OrderBook) -> Touch {
    (
        book.best_bid().map(|l| (l.price, l.total_quantity)),
        book.best_ask().map(|l| (l.price, l.total_quantity)),
    )
}

#[inline]
fn is_book_kind(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::OrderAdd
            | MessageKind::OrderModify
            | MessageKind::OrderExecute
            | MessageKind::OrderDelete
    )
}
