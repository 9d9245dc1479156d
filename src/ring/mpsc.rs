use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded multi-producer single-consumer ring.
///
/// Every slot carries a sequence counter. A producer claims a slot by
/// compare-exchanging the tail, writes the payload, then publishes the
/// slot's next sequence; the consumer waits for the slot's sequence to
/// reach `head + 1`, moves the value out, and re-arms the slot with
/// `head + size`. Lock-free: a stalled producer delays only its own slot.
pub struct MpscRing<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    /// Consumer index; single consumer, plain stores.
    head: CachePadded<AtomicUsize>,
    /// Producer claim index.
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for MpscRing<T> {}
unsafe impl<T: Send> Sync for MpscRing<T> {}

impl<T> MpscRing<T> {
    /// `size` must be a power of two, at least 2.
    pub fn new(size: usize) -> Self {
        assert!(size.is_power_of_two(), "ring size must be a power of two");
        assert!(size >= 2, "ring size must be at least 2");

        let buffer = (0..size)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer,
            mask: size - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Any producer thread. Returns the value back when the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[tail & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let diff = sequence as isize - tail as isize;

            if diff == 0 {
                // Slot is free at this position; try to claim it.
                match self.tail.compare_exchange_weak(
                    tail,
                    tail + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(tail + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => tail = current,
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                // Another producer claimed this slot; move to the new tail.
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// The single consumer thread.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.buffer[head & self.mask];
        let sequence = slot.sequence.load(Ordering::Acquire);

        if sequence as isize - (head + 1) as isize != 0 {
            // Either empty, or the claiming producer has not published yet.
            return None;
        }

        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.sequence
            .store(head + self.buffer.len(), Ordering::Release);
        self.head.store(head + 1, Ordering::Release);
        Some(value)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let sequence = self.buffer[head & self.mask].sequence.load(Ordering::Acquire);
        (sequence as isize - (head + 1) as isize) < 0
    }

    /// Claimed-but-unconsumed count; approximate under contention.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.saturating_sub(head)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

impl<T> Drop for MpscRing<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
