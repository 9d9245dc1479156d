use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::hint::spin_loop;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bounded single-producer single-consumer ring.
///
/// Capacity is a power of two; one slot stays empty to distinguish full
/// from empty, so `capacity() == N - 1` usable slots. Producer publishes
/// the tail with release, consumer publishes the head with release; each
/// reads the other side with acquire. Head and tail live on separate
/// cache lines.
///
/// The queue itself does not enforce the thread roles: exactly one thread
/// may call producer methods and exactly one may call consumer methods.
pub struct SpscRing<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// Consumer index.
    head: CachePadded<AtomicUsize>,
    /// Producer index.
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// `size` must be a power of two, at least 2.
    pub fn new(size: usize) -> Self {
        assert!(size.is_power_of_two(), "ring size must be a power of two");
        assert!(size >= 2, "ring size must be at least 2");

        let buffer = (0..size)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer,
            mask: size - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Producer side. Returns the value back when the ring is full; a full
    /// ring is ordinary control flow, not an error.
    #[inline]
    pub fn push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next_tail = (tail + 1) & self.mask;

        if next_tail == self.head.load(Ordering::Acquire) {
            return Err(value);
        }

        unsafe { (*self.buffer[tail].get()).write(value) };
        self.tail.store(next_tail, Ordering::Release);
        Ok(())
    }

    /// Consumer side.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);

        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }

        let value = unsafe { (*self.buffer[head].get()).assume_init_read() };
        self.head.store((head + 1) & self.mask, Ordering::Release);
        Some(value)
    }

    /// Busy-wait push with a CPU pause hint.
    #[inline]
    pub fn push_spin(&self, value: T) {
        let mut value = value;
        loop {
            match self.push(value) {
                Ok(()) => return,
                Err(v) => {
                    value = v;
                    spin_loop();
                }
            }
        }
    }

    /// Busy-wait pop with a CPU pause hint.
    #[inline]
    pub fn pop_spin(&self) -> T {
        loop {
            if let Some(value) = self.pop() {
                return value;
            }
            spin_loop();
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        ((tail + 1) & self.mask) == self.head.load(Ordering::Acquire)
    }

    /// Occupancy; may be stale the moment it returns.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) & self.mask
    }

    /// Usable slots: one less than the allocated size.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask
    }
}

impl<T: Copy> SpscRing<T> {
    /// Push a contiguous batch; returns how many fit.
    pub fn push_batch(&self, values: &[T]) -> usize {
        let mut count = 0;
        for &value in values {
            if self.push(value).is_err() {
                break;
            }
            count += 1;
        }
        count
    }

    /// Pop up to `out.len()` values; returns how many were transferred.
    pub fn pop_batch(&self, out: &mut [T]) -> usize {
        let mut count = 0;
        for slot in out.iter_mut() {
            match self.pop() {
                Some(value) => {
                    *slot = value;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        // Drain whatever the consumer never took.
        while self.pop().is_some() {}
    }
}
