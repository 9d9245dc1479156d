use crossbeam_utils::CachePadded;
use memmap2::{MmapMut, MmapOptions};
use std::hint::spin_loop;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

/// Sentinel slot index: no free block / no link.
pub const NIL: u32 = u32::MAX;

const STATE_FREE: u8 = 0;
const STATE_ALLOCATED: u8 = 1;

#[derive(Clone, Copy, Debug, Default)]
pub struct PoolConfig {
    /// Back the storage with huge pages when the OS grants them.
    pub huge_pages: bool,
    /// mlock the storage so it never swaps. Failure is non-fatal.
    pub lock_memory: bool,
}

/// Bounded lock-free pool of fixed-size blocks.
///
/// Blocks are laid out contiguously in an anonymous mapping; the free list
/// is a LIFO threaded through unused blocks (each free block stores the
/// next-free index in its first word). The list head carries a 32-bit
/// generation tag so a pop/push/pop interleaving cannot corrupt the list.
///
/// Handles are `u32` slot indices rather than pointers; they stay stable
/// for the lifetime of the pool and index arithmetic is the ownership
/// story for intrusive structures built on top (see `book`).
pub struct ObjectPool<T> {
    _storage: MmapMut,
    base: *mut u8,
    slot_size: usize,
    capacity: u32,
    head: CachePadded<AtomicU64>,
    allocated: CachePadded<AtomicU64>,
    states: Box<[AtomicU8]>,
    huge_backed: bool,
    memory_locked: bool,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for ObjectPool<T> {}
unsafe impl<T: Send> Sync for ObjectPool<T> {}

impl<T: Copy + Send> ObjectPool<T> {
    pub fn new(capacity: u32) -> io::Result<Self> {
        Self::with_config(capacity, PoolConfig::default())
    }

    pub fn with_config(capacity: u32, config: PoolConfig) -> io::Result<Self> {
        assert!(capacity > 0, "pool capacity must be positive");
        assert!(capacity < NIL, "pool capacity must be below the NIL sentinel");

        // A free block stores a u32 link in its first word, and every block
        // starts on a cache-line (or stricter) boundary.
        let align = align_of::<T>().max(64);
        let slot_size = size_of::<T>().max(size_of::<u32>()).next_multiple_of(align);
        let total = slot_size * capacity as usize;

        let (mut storage, huge_backed) = map_storage(total, config.huge_pages)?;
        let memory_locked = config.lock_memory && lock_storage(&storage);

        let base = storage.as_mut_ptr();
        let states = (0..capacity)
            .map(|_| AtomicU8::new(STATE_FREE))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let pool = Self {
            _storage: storage,
            base,
            slot_size,
            capacity,
            head: CachePadded::new(AtomicU64::new(0)),
            allocated: CachePadded::new(AtomicU64::new(0)),
            states,
            huge_backed,
            memory_locked,
            _marker: PhantomData,
        };
        pool.thread_free_list();
        Ok(pool)
    }

    /// Pop a free block. Wait-free when uncontended; retries only when
    /// another thread won the head CAS. `None` means exhaustion, which is
    /// an ordinary outcome counted by the caller.
    pub fn allocate(&self) -> Option<u32> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let idx = unpack_idx(head);
            if idx == NIL {
                return None;
            }
            let next = unsafe { self.link_at(idx).load(Ordering::Acquire) };
            let new_head = pack(unpack_tag(head).wrapping_add(1), next);
            if self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.states[idx as usize].store(STATE_ALLOCATED, Ordering::Relaxed);
                self.allocated.fetch_add(1, Ordering::Relaxed);
                return Some(idx);
            }
            spin_loop();
        }
    }

    /// Allocate and initialise a block in one step. The fresh slot is
    /// exclusively ours until the index is handed out, so the write is safe.
    pub fn construct(&self, value: T) -> Option<u32> {
        let idx = self.allocate()?;
        unsafe { self.slot_ptr(idx).write(value) };
        Some(idx)
    }

    /// Push a block back. Freeing an index that is not currently allocated
    /// is undefined behaviour; debug builds assert.
    pub fn deallocate(&self, idx: u32) {
        debug_assert!(idx < self.capacity, "index {} outside pool", idx);
        let prev = self.states[idx as usize].swap(STATE_FREE, Ordering::Relaxed);
        debug_assert_eq!(prev, STATE_ALLOCATED, "double free of slot {}", idx);

        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe { self.link_at(idx).store(unpack_idx(head), Ordering::Relaxed) };
            let new_head = pack(unpack_tag(head).wrapping_add(1), idx);
            if self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            spin_loop();
        }
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }

    /// Allocate up to `out.len()` blocks; returns how many were obtained.
    pub fn allocate_batch(&self, out: &mut [u32]) -> usize {
        let mut count = 0;
        for slot in out.iter_mut() {
            match self.allocate() {
                Some(idx) => {
                    *slot = idx;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    pub fn deallocate_batch(&self, indices: &[u32]) {
        for &idx in indices {
            self.deallocate(idx);
        }
    }

    /// True iff `idx` was returned by `allocate` and not yet freed.
    #[inline]
    pub fn owns(&self, idx: u32) -> bool {
        idx < self.capacity && self.states[idx as usize].load(Ordering::Relaxed) == STATE_ALLOCATED
    }

    /// Capacity growth is not supported for mapped storage; reports failure
    /// without side effects.
    pub fn expand(&self, _additional: u32) -> bool {
        false
    }

    pub fn expansions(&self) -> u64 {
        0
    }

    /// Rebuild the free list from scratch.
    ///
    /// # Safety
    /// The caller guarantees no live indices remain; any outstanding handle
    /// dangles after this call.
    pub unsafe fn reset(&self) {
        for state in self.states.iter() {
            state.store(STATE_FREE, Ordering::Relaxed);
        }
        self.allocated.store(0, Ordering::Relaxed);
        self.thread_free_list();
    }

    /// Raw pointer to a slot. Dereferencing requires the index to be
    /// allocated and the caller to hold exclusive access to it.
    #[inline]
    pub fn slot_ptr(&self, idx: u32) -> *mut T {
        debug_assert!(idx < self.capacity);
        unsafe { self.base.add(idx as usize * self.slot_size) as *mut T }
    }

    /// # Safety
    /// `idx` must be allocated and no `&mut` to the slot may exist.
    #[inline]
    pub unsafe fn slot(&self, idx: u32) -> &T {
        unsafe { &*self.slot_ptr(idx) }
    }

    /// # Safety
    /// `idx` must be allocated and the caller must be its only accessor.
    /// The intended topology gives every allocated slot exactly one owning
    /// thread (the decode thread for orders, the capture thread for fresh
    /// packet slots), which is what makes this sound.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, idx: u32) -> &mut T {
        unsafe { &mut *self.slot_ptr(idx) }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.slot_size
    }

    #[inline]
    pub fn allocated_count(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn available_count(&self) -> u64 {
        self.capacity as u64 - self.allocated_count()
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.available_count() == 0
    }

    pub fn utilization(&self) -> f64 {
        self.allocated_count() as f64 / self.capacity as f64
    }

    pub fn huge_page_backed(&self) -> bool {
        self.huge_backed
    }

    pub fn memory_locked(&self) -> bool {
        self.memory_locked
    }

    #[inline]
    unsafe fn link_at(&self, idx: u32) -> &AtomicU32 {
        // Free blocks carry the next-free index in their first word. The
        // load may race with a winner rewriting the slot as T data; the
        // atomic keeps it defined and the head tag rejects the stale value.
        unsafe { &*(self.base.add(idx as usize * self.slot_size) as *const AtomicU32) }
    }

    fn thread_free_list(&self) {
        for idx in 0..self.capacity {
            let next = if idx + 1 == self.capacity { NIL } else { idx + 1 };
            unsafe { self.link_at(idx).store(next, Ordering::Relaxed) };
        }
        self.head.store(pack(0, 0), Ordering::Release);
    }
}

#[inline]
fn pack(tag: u32, idx: u32) -> u64 {
    ((tag as u64) << 32) | idx as u64
}

#[inline]
fn unpack_idx(head: u64) -> u32 {
    head as u32
}

#[inline]
fn unpack_tag(head: u64) -> u32 {
    (head >> 32) as u32
}

fn map_storage(len: usize, huge: bool) -> io::Result<(MmapMut, bool)> {
    #[cfg(target_os = "linux")]
    if huge {
        if let Ok(map) = MmapOptions::new().len(len).huge(None).map_anon() {
            return Ok((map, true));
        }
        // Huge pages unavailable; fall through to a regular mapping.
    }
    let _ = huge;
    Ok((MmapOptions::new().len(len).map_anon()?, false))
}

fn lock_storage(map: &MmapMut) -> bool {
    #[cfg(unix)]
    {
        map.lock().is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = map;
        false
    }
}
