use crate::affinity;
use crate::clock::monotonic_ns;
use crate::pool::ObjectPool;
use crate::ring::SpscRing;
use crate::types::{MAX_PACKET_SIZE, Packet, PacketView};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use spdlog::{debug, info, warn};
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, Shutdown, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RecoveryConfig {
    pub max_retry_attempts: u32,
    pub retry_backoff_base: Duration,
    pub max_retry_backoff: Duration,
    pub max_consecutive_errors: u32,
    pub enable_auto_recovery: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_backoff_base: Duration::from_millis(10),
            max_retry_backoff: Duration::from_secs(5),
            max_consecutive_errors: 100,
            enable_auto_recovery: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub interface_ip: Ipv4Addr,
    /// `None` receives plain unicast UDP; useful for loopback testing.
    pub multicast_group: Option<Ipv4Addr>,
    pub port: u16,
    pub receive_buffer_size: usize,
    pub enable_timestamps: bool,
    pub busy_poll: bool,
    pub socket_priority: Option<i32>,
    /// Upper bound on how long `recv` may block; stop() additionally
    /// shuts the socket down for reading.
    pub receive_timeout: Duration,
    pub cpu: Option<usize>,
    /// Raw-packet ring slots, power of two.
    pub ring_size: usize,
    /// Packet pool slots.
    pub pool_size: u32,
    /// Treat the first four payload bytes as a big-endian feed sequence
    /// and count gaps.
    pub wire_sequence_prefix: bool,
    pub recovery: RecoveryConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface_ip: Ipv4Addr::UNSPECIFIED,
            multicast_group: Some(Ipv4Addr::new(239, 1, 1, 1)),
            port: 10_000,
            receive_buffer_size: 8 * 1024 * 1024,
            enable_timestamps: true,
            busy_poll: false,
            socket_priority: None,
            receive_timeout: Duration::from_millis(1),
            cpu: None,
            ring_size: 16_384,
            pool_size: 16_384,
            wire_sequence_prefix: false,
            recovery: RecoveryConfig::default(),
        }
    }
}

impl CaptureConfig {
    pub fn is_valid(&self) -> bool {
        self.ring_size.is_power_of_two()
            && self.ring_size >= 2
            && self.pool_size > 0
            && self.receive_buffer_size > 0
    }
}

#[derive(Default)]
pub struct CaptureCounters {
    pub packets_received: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub bytes_received: AtomicU64,
    pub errors: AtomicU64,
    pub sequence_gaps: AtomicU64,
    pub consecutive_errors: AtomicU32,
    pub reconnect_attempts: AtomicU32,
    pub peak_ring_usage: AtomicU64,
    last_wire_sequence: AtomicU32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub sequence_gaps: u64,
    pub consecutive_errors: u32,
    pub reconnect_attempts: u32,
    pub peak_ring_usage: u64,
    pub ring_len: usize,
    pub pool_available: u64,
    pub is_running: bool,
}

/// A popped raw-packet slot. The borrow keeps the slot alive; dropping the
/// guard returns it to the capture pool.
pub struct CapturedPacket<'a> {
    pool: &'a ObjectPool<Packet>,
    idx: u32,
}

impl CapturedPacket<'_> {
    #[inline]
    pub fn view(&self) -> PacketView<'_> {
        // The slot was handed off through the ring and is exclusively ours
        // until this guard drops.
        PacketView::from_packet(unsafe { self.pool.slot(self.idx) })
    }
}

impl Drop for CapturedPacket<'_> {
    fn drop(&mut self) {
        self.pool.deallocate(self.idx);
    }
}

/// Consumer half of the capture stage, detachable from the receiver so the
/// decode thread can own it. Exactly one consumer may pop at a time.
#[derive(Clone)]
pub struct CaptureConsumer {
    pool: Arc<ObjectPool<Packet>>,
    ring: Arc<SpscRing<u32>>,
}

impl CaptureConsumer {
    #[inline]
    pub fn try_next(&self) -> Option<CapturedPacket<'_>> {
        let idx = self.ring.pop()?;
        Some(CapturedPacket {
            pool: &self.pool,
            idx,
        })
    }

    pub fn has_packets(&self) -> bool {
        !self.ring.is_empty()
    }
}

/// UDP multicast receive stage. A dedicated thread recv()s into pool
/// slots, stamps them, and pushes slot indices into the raw-packet ring;
/// exactly one consumer thread pops them.
pub struct UdpCapture {
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    socket: Arc<Mutex<Option<Arc<Socket>>>>,
    pool: Arc<ObjectPool<Packet>>,
    ring: Arc<SpscRing<u32>>,
    counters: Arc<CaptureCounters>,
    thread: Option<thread::JoinHandle<()>>,
}

impl UdpCapture {
    pub fn new(config: CaptureConfig) -> io::Result<Self> {
        assert!(config.is_valid(), "invalid capture configuration");
        let pool = Arc::new(ObjectPool::<Packet>::new(config.pool_size)?);
        let ring = Arc::new(SpscRing::new(config.ring_size));
        Ok(Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            socket: Arc::new(Mutex::new(None)),
            pool,
            ring,
            counters: Arc::new(CaptureCounters::default()),
            thread: None,
        })
    }

    /// Open and configure the socket. Idempotent; returns false when the
    /// socket cannot be opened or bound.
    pub fn initialize(&self) -> bool {
        let mut slot = self.socket.lock().unwrap();
        if slot.is_some() {
            return true;
        }
        match open_socket(&self.config) {
            Ok(socket) => {
                info!(
                    "capture socket bound on port {} (group {:?})",
                    self.config.port, self.config.multicast_group
                );
                *slot = Some(Arc::new(socket));
                true
            }
            Err(err) => {
                warn!("capture socket setup failed: {}", err);
                false
            }
        }
    }

    pub fn start(&mut self) -> bool {
        if self.running.load(Relaxed) {
            return true;
        }
        if !self.initialize() {
            return false;
        }

        self.running.store(true, Relaxed);
        let worker = CaptureWorker {
            config: self.config.clone(),
            running: self.running.clone(),
            socket: self.socket.clone(),
            pool: self.pool.clone(),
            ring: self.ring.clone(),
            counters: self.counters.clone(),
        };
        match thread::Builder::new()
            .name("capture".into())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                self.thread = Some(handle);
                true
            }
            Err(err) => {
                warn!("failed to spawn capture thread: {}", err);
                self.running.store(false, Relaxed);
                false
            }
        }
    }

    /// Flag the loop down, unblock `recv` by shutting the socket's read
    /// half, then join.
    pub fn stop(&mut self) {
        self.running.store(false, Relaxed);
        if let Some(socket) = self.socket.lock().unwrap().as_ref() {
            let _ = socket.shutdown(Shutdown::Read);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        *self.socket.lock().unwrap() = None;
    }

    /// Consumer side of the raw-packet ring. Single consumer thread.
    #[inline]
    pub fn try_next(&self) -> Option<CapturedPacket<'_>> {
        let idx = self.ring.pop()?;
        Some(CapturedPacket {
            pool: &self.pool,
            idx,
        })
    }

    /// Detach a consumer handle for another thread. The single-consumer
    /// contract then binds that thread instead of this handle.
    pub fn consumer(&self) -> CaptureConsumer {
        CaptureConsumer {
            pool: self.pool.clone(),
            ring: self.ring.clone(),
        }
    }

    pub fn shared_counters(&self) -> Arc<CaptureCounters> {
        self.counters.clone()
    }

    pub fn has_packets(&self) -> bool {
        !self.ring.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.is_running()
            && self.counters.consecutive_errors.load(Relaxed)
                < self.config.recovery.max_consecutive_errors
            && !self.pool.is_exhausted()
    }

    /// Actual bound port; differs from the configured port when 0 was
    /// requested (ephemeral, used by tests).
    pub fn local_port(&self) -> Option<u16> {
        let slot = self.socket.lock().unwrap();
        let socket = slot.as_ref()?;
        let addr = socket.local_addr().ok()?;
        addr.as_socket().map(|s| s.port())
    }

    pub fn counters(&self) -> &CaptureCounters {
        &self.counters
    }

    /// Zero every counter. Meant for the stopped state; while running it
    /// races the single-writer discipline of the receive thread.
    pub fn reset_stats(&self) {
        self.counters.packets_received.store(0, Relaxed);
        self.counters.packets_dropped.store(0, Relaxed);
        self.counters.bytes_received.store(0, Relaxed);
        self.counters.errors.store(0, Relaxed);
        self.counters.sequence_gaps.store(0, Relaxed);
        self.counters.consecutive_errors.store(0, Relaxed);
        self.counters.reconnect_attempts.store(0, Relaxed);
        self.counters.peak_ring_usage.store(0, Relaxed);
        self.counters.last_wire_sequence.store(0, Relaxed);
    }

    pub fn pool_utilization(&self) -> f64 {
        self.pool.utilization()
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            packets_received: self.counters.packets_received.load(Relaxed),
            packets_dropped: self.counters.packets_dropped.load(Relaxed),
            bytes_received: self.counters.bytes_received.load(Relaxed),
            errors: self.counters.errors.load(Relaxed),
            sequence_gaps: self.counters.sequence_gaps.load(Relaxed),
            consecutive_errors: self.counters.consecutive_errors.load(Relaxed),
            reconnect_attempts: self.counters.reconnect_attempts.load(Relaxed),
            peak_ring_usage: self.counters.peak_ring_usage.load(Relaxed),
            ring_len: self.ring.len(),
            pool_available: self.pool.available_count(),
            is_running: self.is_running(),
        }
    }
}

impl Drop for UdpCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Aggregates several receivers (one per feed/port) behind one consumer
/// surface. `try_next` polls the receivers round-robin so no feed starves.
///
/// Holds a polling cursor in a `Cell`, which keeps the type `!Sync`:
/// exactly one thread may consume, same as a single receiver.
pub struct MultiPortCapture {
    receivers: Vec<UdpCapture>,
    cursor: std::cell::Cell<usize>,
}

impl MultiPortCapture {
    pub fn new(configs: Vec<CaptureConfig>) -> io::Result<Self> {
        assert!(!configs.is_empty(), "at least one feed required");
        let receivers = configs
            .into_iter()
            .map(UdpCapture::new)
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            receivers,
            cursor: std::cell::Cell::new(0),
        })
    }

    /// Start every receiver; stops the ones already started when any
    /// fails, so the group is all-running or all-stopped.
    pub fn start_all(&mut self) -> bool {
        for position in 0..self.receivers.len() {
            if !self.receivers[position].start() {
                for receiver in &mut self.receivers[..position] {
                    receiver.stop();
                }
                return false;
            }
        }
        true
    }

    pub fn stop_all(&mut self) {
        for receiver in &mut self.receivers {
            receiver.stop();
        }
    }

    /// Pop from the next feed that has a packet, rotating the starting
    /// point each call.
    pub fn try_next(&self) -> Option<CapturedPacket<'_>> {
        let count = self.receivers.len();
        let start = self.cursor.get();
        for offset in 0..count {
            let position = (start + offset) % count;
            if let Some(packet) = self.receivers[position].try_next() {
                self.cursor.set((position + 1) % count);
                return Some(packet);
            }
        }
        None
    }

    pub fn receiver(&self, position: usize) -> Option<&UdpCapture> {
        self.receivers.get(position)
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_healthy(&self) -> bool {
        self.receivers.iter().all(UdpCapture::is_healthy)
    }

    /// Counter totals across every feed. Ring/pool columns are sums and
    /// lose per-feed meaning; use `receiver()` for those.
    pub fn combined_stats(&self) -> CaptureStats {
        let mut combined = CaptureStats::default();
        combined.is_running = true;
        for receiver in &self.receivers {
            let stats = receiver.stats();
            combined.packets_received += stats.packets_received;
            combined.packets_dropped += stats.packets_dropped;
            combined.bytes_received += stats.bytes_received;
            combined.errors += stats.errors;
            combined.sequence_gaps += stats.sequence_gaps;
            combined.consecutive_errors += stats.consecutive_errors;
            combined.reconnect_attempts += stats.reconnect_attempts;
            combined.peak_ring_usage = combined.peak_ring_usage.max(stats.peak_ring_usage);
            combined.ring_len += stats.ring_len;
            combined.pool_available += stats.pool_available;
            combined.is_running &= stats.is_running;
        }
        combined
    }
}

impl Drop for MultiPortCapture {
    fn drop(&mut self) {
        self.stop_all();
    }
}

struct CaptureWorker {
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    socket: Arc<Mutex<Option<Arc<Socket>>>>,
    pool: Arc<ObjectPool<Packet>>,
    ring: Arc<SpscRing<u32>>,
    counters: Arc<CaptureCounters>,
}

impl CaptureWorker {
    fn run(self) {
        if let Some(cpu) = self.config.cpu {
            affinity::pin_to_cpu(cpu);
        }

        let mut sequence: u64 = 0;
        'session: while self.running.load(Relaxed) {
            let Some(socket) = self.current_socket() else {
                break;
            };

            while self.running.load(Relaxed) {
                if !self.receive_one(&socket, &mut sequence) {
                    // Unrecoverable errors piled past the threshold.
                    if self.config.recovery.enable_auto_recovery && self.reconnect() {
                        continue 'session;
                    }
                    warn!("capture thread giving up after repeated errors");
                    break 'session;
                }
            }
        }
        self.running.store(false, Relaxed);
        debug!("capture thread exited after {} packets", sequence);
    }

    fn current_socket(&self) -> Option<Arc<Socket>> {
        self.socket.lock().unwrap().clone()
    }

    /// One recv round. Returns false when the consecutive-error threshold
    /// was crossed.
    fn receive_one(&self, socket: &Socket, sequence: &mut u64) -> bool {
        let Some(idx) = self.pool.allocate() else {
            // No slot for the next datagram: consume and drop it so the
            // kernel buffer does not back up.
            let mut scratch = [MaybeUninit::<u8>::uninit(); 2048];
            if socket.recv(&mut scratch).is_ok() {
                self.counters.packets_dropped.fetch_add(1, Relaxed);
            }
            return true;
        };

        let packet = unsafe { self.pool.slot_mut(idx) };
        let buf = unsafe {
            std::slice::from_raw_parts_mut(
                packet.data.as_mut_ptr() as *mut MaybeUninit<u8>,
                MAX_PACKET_SIZE,
            )
        };

        match socket.recv(buf) {
            Ok(0) => {
                // Read-half shutdown during stop().
                self.pool.deallocate(idx);
                true
            }
            Ok(len) => {
                let len = len.min(MAX_PACKET_SIZE);
                packet.length = len as u32;
                packet.timestamp = monotonic_ns();
                *sequence += 1;
                packet.sequence = *sequence;

                if self.config.wire_sequence_prefix && len >= 4 {
                    self.observe_wire_sequence(&packet.data[..4]);
                }
                self.counters.consecutive_errors.store(0, Relaxed);

                if self.ring.push(idx).is_err() {
                    self.pool.deallocate(idx);
                    self.counters.packets_dropped.fetch_add(1, Relaxed);
                } else {
                    self.counters.packets_received.fetch_add(1, Relaxed);
                    self.counters.bytes_received.fetch_add(len as u64, Relaxed);
                    let depth = self.ring.len() as u64;
                    if depth > self.counters.peak_ring_usage.load(Relaxed) {
                        self.counters.peak_ring_usage.store(depth, Relaxed);
                    }
                }
                true
            }
            Err(err) => {
                self.pool.deallocate(idx);
                match err.kind() {
                    io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted => {
                        thread::yield_now();
                        true
                    }
                    _ => {
                        self.counters.errors.fetch_add(1, Relaxed);
                        let streak = self.counters.consecutive_errors.fetch_add(1, Relaxed) + 1;
                        if streak == 1 {
                            warn!("capture recv error: {}", err);
                        }
                        streak < self.config.recovery.max_consecutive_errors
                    }
                }
            }
        }
    }

    fn observe_wire_sequence(&self, prefix: &[u8]) {
        let seq = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let last = self.counters.last_wire_sequence.swap(seq, Relaxed);
        if last != 0 {
            let expected = last.wrapping_add(1);
            if seq != expected {
                self.counters
                    .sequence_gaps
                    .fetch_add(seq.wrapping_sub(expected) as u64, Relaxed);
            }
        }
    }

    /// Tear down and reopen the socket with exponential backoff and ±25%
    /// jitter. Returns false when every attempt failed.
    fn reconnect(&self) -> bool {
        *self.socket.lock().unwrap() = None;
        let recovery = &self.config.recovery;
        let mut rng = rand::thread_rng();

        for attempt in 0..recovery.max_retry_attempts {
            if !self.running.load(Relaxed) {
                return false;
            }
            self.counters.reconnect_attempts.fetch_add(1, Relaxed);

            let backoff = recovery
                .retry_backoff_base
                .saturating_mul(1u32 << attempt.min(16))
                .min(recovery.max_retry_backoff);
            let jitter = rng.gen_range(0.75..=1.25);
            let delay = backoff.mul_f64(jitter);
            self.sleep_interruptibly(delay);

            match open_socket(&self.config) {
                Ok(socket) => {
                    info!("capture socket reinitialized (attempt {})", attempt + 1);
                    *self.socket.lock().unwrap() = Some(Arc::new(socket));
                    self.counters.consecutive_errors.store(0, Relaxed);
                    return true;
                }
                Err(err) => {
                    warn!("capture reconnect attempt {} failed: {}", attempt + 1, err);
                }
            }
        }
        false
    }

    fn sleep_interruptibly(&self, total: Duration) {
        let slice = Duration::from_millis(10);
        let mut remaining = total;
        while !remaining.is_zero() && self.running.load(Relaxed) {
            let step = remaining.min(slice);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }
}

fn open_socket(config: &CaptureConfig) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    if let Err(err) = socket.set_recv_buffer_size(config.receive_buffer_size) {
        debug!("receive buffer resize refused: {}", err);
    }
    let timeout = if config.receive_timeout.is_zero() {
        None
    } else {
        Some(config.receive_timeout)
    };
    socket.set_read_timeout(timeout)?;

    set_raw_options(&socket, config);

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
    socket.bind(&bind_addr.into())?;

    if let Some(group) = config.multicast_group {
        socket.join_multicast_v4(&group, &config.interface_ip)?;
    }
    Ok(socket)
}

/// Kernel timestamps, busy polling, and socket priority are raw options
/// without portable wrappers; refusals are logged and ignored.
#[cfg(target_os = "linux")]
fn set_raw_options(socket: &Socket, config: &CaptureConfig) {
    use std::os::fd::AsRawFd;

    unsafe fn set_opt(fd: i32, level: i32, name: i32, value: i32, what: &str) {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const i32 as *const libc::c_void,
                size_of::<i32>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            debug!("{} refused: {}", what, std::io::Error::last_os_error());
        }
    }

    let fd = socket.as_raw_fd();
    unsafe {
        if config.enable_timestamps {
            set_opt(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPNS, 1, "SO_TIMESTAMPNS");
        }
        if config.busy_poll {
            set_opt(fd, libc::SOL_SOCKET, libc::SO_BUSY_POLL, 50, "SO_BUSY_POLL");
        }
        if let Some(priority) = config.socket_priority {
            set_opt(fd, libc::SOL_SOCKET, libc::SO_PRIORITY, priority, "SO_PRIORITY");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_raw_options(_socket: &Socket, _config: &CaptureConfig) {}
