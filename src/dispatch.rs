use crate::ring::SpscRing;
use crate::types::NormalizedMessage;
use spdlog::{info, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::thread;

/// In-process consumer of normalized records.
///
/// `on_message` runs on the dispatch thread and must not block; returning
/// false unsubscribes at the next safe point. `initialize`/`shutdown` are
/// invoked once per engine run, outside the hot path.
pub trait Subscriber: Send {
    fn on_message(&mut self, msg: &NormalizedMessage) -> bool;

    fn name(&self) -> &str;

    fn initialize(&mut self) {}

    fn shutdown(&mut self) {}
}

/// Closure-backed subscriber for simple consumers.
pub struct ClosureSubscriber<F> {
    name: String,
    callback: F,
}

impl<F> ClosureSubscriber<F>
where
    F: FnMut(&NormalizedMessage) -> bool + Send,
{
    pub fn new(name: impl Into<String>, callback: F) -> Self {
        Self {
            name: name.into(),
            callback,
        }
    }
}

impl<F> Subscriber for ClosureSubscriber<F>
where
    F: FnMut(&NormalizedMessage) -> bool + Send,
{
    fn on_message(&mut self, msg: &NormalizedMessage) -> bool {
        (self.callback)(msg)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
pub struct SubscriberCounters {
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub failures: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct SubscriberStats {
    pub name: String,
    pub delivered: u64,
    pub dropped: u64,
    pub failures: u64,
}

struct Entry {
    subscriber: Box<dyn Subscriber>,
    ring: Arc<SpscRing<NormalizedMessage>>,
    counters: Arc<SubscriberCounters>,
    name: String,
}

#[derive(Clone)]
struct Lane {
    ring: Arc<SpscRing<NormalizedMessage>>,
    counters: Arc<SubscriberCounters>,
}

/// Producer-side view of the running dispatcher, handed to the decode
/// thread at start. Pushing through the handle touches no locks.
#[derive(Clone)]
pub struct DispatchHandle {
    lanes: Vec<Lane>,
}

impl DispatchHandle {
    /// Copy `msg` into every subscriber ring. A full ring counts a drop
    /// for that subscriber and never stalls the others. Returns how many
    /// rings accepted the record.
    #[inline]
    pub fn dispatch(&self, msg: &NormalizedMessage) -> usize {
        let mut accepted = 0;
        for lane in &self.lanes {
            if lane.ring.push(*msg).is_ok() {
                accepted += 1;
            } else {
                lane.counters.dropped.fetch_add(1, Relaxed);
            }
        }
        accepted
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}

/// Fans normalized records out to N subscribers, each with a private SPSC
/// ring for back-pressure isolation. One dispatch thread drains the rings
/// round-robin and runs the callbacks.
pub struct Dispatcher {
    ring_size: usize,
    entries: Option<Vec<Entry>>,
    roster: Vec<(String, Arc<SubscriberCounters>)>,
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<Vec<Entry>>>,
    handle: Option<DispatchHandle>,
}

impl Dispatcher {
    /// `ring_size` must be a power of two; every subscriber gets a ring of
    /// this size.
    pub fn new(ring_size: usize) -> Self {
        assert!(ring_size.is_power_of_two() && ring_size >= 2);
        Self {
            ring_size,
            entries: Some(Vec::new()),
            roster: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            handle: None,
        }
    }

    /// Registration is only allowed while stopped.
    pub fn add_subscriber(&mut self, subscriber: Box<dyn Subscriber>) -> bool {
        let Some(entries) = self.entries.as_mut() else {
            return false;
        };
        let name = subscriber.name().to_string();
        let counters = Arc::new(SubscriberCounters::default());
        self.roster.push((name.clone(), counters.clone()));
        entries.push(Entry {
            subscriber,
            ring: Arc::new(SpscRing::new(self.ring_size)),
            counters,
            name,
        });
        true
    }

    pub fn subscriber_count(&self) -> usize {
        match &self.entries {
            Some(entries) => entries.len(),
            None => self.roster.len(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Relaxed)
    }

    /// Producer-side handle; available while running.
    pub fn handle(&self) -> Option<DispatchHandle> {
        self.handle.clone()
    }

    pub fn start(&mut self, cpu: Option<usize>) -> bool {
        if self.thread.is_some() {
            return true;
        }
        let Some(mut entries) = self.entries.take() else {
            return false;
        };

        for entry in entries.iter_mut() {
            entry.subscriber.initialize();
        }
        self.handle = Some(DispatchHandle {
            lanes: entries
                .iter()
                .map(|entry| Lane {
                    ring: entry.ring.clone(),
                    counters: entry.counters.clone(),
                })
                .collect(),
        });

        self.running.store(true, Relaxed);
        let running = self.running.clone();
        let thread = thread::Builder::new()
            .name("dispatch".into())
            .spawn(move || {
                if let Some(cpu) = cpu {
                    crate::affinity::pin_to_cpu(cpu);
                }
                drain_loop(&running, entries)
            });

        match thread {
            Ok(handle) => {
                self.thread = Some(handle);
                true
            }
            Err(err) => {
                warn!("failed to spawn dispatch thread: {}", err);
                self.running.store(false, Relaxed);
                self.handle = None;
                // Entries were moved into the failed closure and are gone;
                // leave the dispatcher stopped but usable for re-adding.
                self.entries = Some(Vec::new());
                false
            }
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Relaxed);
        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(mut entries) => {
                    for entry in entries.iter_mut() {
                        entry.subscriber.shutdown();
                    }
                    self.entries = Some(entries);
                }
                Err(_) => {
                    warn!("dispatch thread panicked");
                    self.entries = Some(Vec::new());
                }
            }
        }
        self.handle = None;
    }

    /// Per-subscriber delivery counters, including subscribers removed
    /// mid-run.
    pub fn subscriber_stats(&self) -> Vec<SubscriberStats> {
        stats_from_roster(&self.roster)
    }

    /// Counter handles for readers that outlive the borrow (the statistics
    /// thread).
    pub fn roster(&self) -> Vec<(String, Arc<SubscriberCounters>)> {
        self.roster.clone()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn stats_from_roster(
    roster: &[(String, Arc<SubscriberCounters>)],
) -> Vec<SubscriberStats> {
    roster
        .iter()
        .map(|(name, counters)| SubscriberStats {
            name: name.clone(),
            delivered: counters.delivered.load(Relaxed),
            dropped: counters.dropped.load(Relaxed),
            failures: counters.failures.load(Relaxed),
        })
        .collect()
}

fn drain_loop(running: &AtomicBool, mut entries: Vec<Entry>) -> Vec<Entry> {
    let mut doomed: Vec<usize> = Vec::new();

    while running.load(Relaxed) {
        let mut any_activity = false;

        for (position, entry) in entries.iter_mut().enumerate() {
            while let Some(msg) = entry.ring.pop() {
                any_activity = true;
                match catch_unwind(AssertUnwindSafe(|| entry.subscriber.on_message(&msg))) {
                    Ok(true) => {
                        entry.counters.delivered.fetch_add(1, Relaxed);
                    }
                    Ok(false) => {
                        entry.counters.delivered.fetch_add(1, Relaxed);
                        doomed.push(position);
                        break;
                    }
                    Err(_) => {
                        entry.counters.failures.fetch_add(1, Relaxed);
                        doomed.push(position);
                        break;
                    }
                }
            }
        }

        // Safe point: detach subscribers that resigned or panicked.
        for position in doomed.drain(..).rev() {
            let mut entry = entries.remove(position);
            info!("unsubscribing '{}'", entry.name);
            entry.subscriber.shutdown();
        }

        if !any_activity {
            thread::yield_now();
        }
    }

    entries
}
