//! Device buffer pools
//!
//! Core, write and read buffers are fixed-size sets of slots in device
//! memory. Core and write buffers are plain bitmaps. Read buffers also carry
//! a deallocation lifecycle: after data has been copied out of a read buffer
//! the device must be told to release it, either with an independent
//! deallocation command or piggybacked on the next outgoing command.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Index of a buffer slot inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u16);

impl BufferId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which pool a buffer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Core,
    Write,
    Read,
}

impl BufferKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Write => "write",
            Self::Read => "read",
        }
    }
}

/// Bitmap allocator for a fixed set of buffer slots
///
/// One bit per slot: 0 = free, 1 = in use.
#[derive(Debug)]
pub struct BufferPool {
    kind: BufferKind,
    words: Vec<u64>,
    total: usize,
    free: usize,
    /// Hint for next free slot search
    search_hint: usize,
}

impl BufferPool {
    /// Create a pool of `total` free slots
    #[must_use]
    pub fn new(kind: BufferKind, total: usize) -> Self {
        let total = total.min(usize::from(u16::MAX));
        Self {
            kind,
            words: vec![0u64; total.div_ceil(64)],
            total,
            free: total,
            search_hint: 0,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> BufferKind {
        self.kind
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    #[must_use]
    pub const fn free_count(&self) -> usize {
        self.free
    }

    #[must_use]
    pub const fn allocated_count(&self) -> usize {
        self.total - self.free
    }

    /// Check whether a slot is in use; out of range slots count as used
    #[must_use]
    pub fn is_allocated(&self, id: BufferId) -> bool {
        let i = id.index();
        if i >= self.total {
            return true;
        }
        self.words[i / 64] & (1 << (i % 64)) != 0
    }

    /// Allocate one slot
    pub fn allocate(&mut self) -> Option<BufferId> {
        if self.free == 0 {
            return None;
        }
        let hint = self.search_hint;
        let slot = self
            .find_free(hint, self.total)
            .or_else(|| self.find_free(0, hint))?;

        self.words[slot / 64] |= 1 << (slot % 64);
        self.free -= 1;
        self.search_hint = (slot + 1) % self.total.max(1);
        u16::try_from(slot).ok().map(BufferId)
    }

    /// Return a slot to the pool
    pub fn free(&mut self, id: BufferId) {
        let i = id.index();
        debug_assert!(self.is_allocated(id), "{} buffer {} double free", self.kind.as_str(), id);
        if i >= self.total || !self.is_allocated(id) {
            warn!("ignoring free of unallocated {} buffer {}", self.kind.as_str(), id);
            return;
        }
        self.words[i / 64] &= !(1 << (i % 64));
        self.free += 1;
    }

    /// Release every slot
    pub fn reset(&mut self) {
        self.words.fill(0);
        self.free = self.total;
        self.search_hint = 0;
    }

    fn find_free(&self, start: usize, end: usize) -> Option<usize> {
        let mut i = start;
        while i < end {
            let word = self.words[i / 64];
            if word == u64::MAX {
                i = (i / 64 + 1) * 64;
                continue;
            }
            if word & (1 << (i % 64)) == 0 {
                return Some(i);
            }
            i += 1;
        }
        None
    }
}

/// Lifecycle of one read buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSlot {
    Free,
    /// Owned by a token, last touched at the given time
    InUse { last_used: Instant },
    /// Data consumed, waiting for a deallocation command
    PendingDealloc,
    /// Deallocation command in flight
    Deallocating,
}

/// Read buffer pool with deferred device-side deallocation
#[derive(Debug)]
pub struct ReadBufferPool {
    slots: Vec<ReadSlot>,
    free: usize,
    dealloc_queue: VecDeque<BufferId>,
    search_hint: usize,
}

impl ReadBufferPool {
    #[must_use]
    pub fn new(total: usize) -> Self {
        let total = total.min(usize::from(u16::MAX));
        Self {
            slots: vec![ReadSlot::Free; total],
            free: total,
            dealloc_queue: VecDeque::new(),
            search_hint: 0,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub const fn free_count(&self) -> usize {
        self.free
    }

    /// Buffers waiting for a deallocation command to be issued
    #[must_use]
    pub fn pending_deallocations(&self) -> usize {
        self.dealloc_queue.len()
    }

    /// Buffers neither free nor queued, i.e. owned by a token or being
    /// deallocated
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, ReadSlot::InUse { .. } | ReadSlot::Deallocating))
            .count()
    }

    #[must_use]
    pub fn state(&self, id: BufferId) -> Option<ReadSlot> {
        self.slots.get(id.index()).copied()
    }

    /// Allocate a read buffer for a token
    pub fn allocate(&mut self, now: Instant) -> Option<BufferId> {
        if self.free == 0 {
            return None;
        }
        let total = self.slots.len();
        let slot = (0..total)
            .map(|i| (self.search_hint + i) % total)
            .find(|&i| self.slots[i] == ReadSlot::Free)?;
        self.slots[slot] = ReadSlot::InUse { last_used: now };
        self.free -= 1;
        self.search_hint = (slot + 1) % total;
        u16::try_from(slot).ok().map(BufferId)
    }

    /// Refresh the last-use time of an owned buffer
    pub fn touch(&mut self, id: BufferId, now: Instant) {
        if let Some(slot @ ReadSlot::InUse { .. }) = self.slots.get_mut(id.index()) {
            *slot = ReadSlot::InUse { last_used: now };
        }
    }

    /// Queue a buffer for device-side deallocation
    ///
    /// Accepts buffers that are in use, or free ones during a purge where
    /// the device may still hold stale allocations.
    pub fn schedule_deallocation(&mut self, id: BufferId) {
        let Some(slot) = self.slots.get_mut(id.index()) else {
            return;
        };
        match *slot {
            ReadSlot::InUse { .. } => {}
            ReadSlot::Free => self.free -= 1,
            ReadSlot::PendingDealloc | ReadSlot::Deallocating => return,
        }
        *slot = ReadSlot::PendingDealloc;
        self.dealloc_queue.push_back(id);
    }

    /// Take the next buffer whose deallocation should be issued
    pub fn next_to_deallocate(&mut self) -> Option<BufferId> {
        let id = self.dealloc_queue.pop_front()?;
        self.slots[id.index()] = ReadSlot::Deallocating;
        Some(id)
    }

    /// A deallocation command failed; put the buffer back at the head
    pub fn requeue_deallocation(&mut self, id: BufferId) {
        if let Some(slot) = self.slots.get_mut(id.index())
            && *slot == ReadSlot::Deallocating
        {
            *slot = ReadSlot::PendingDealloc;
            self.dealloc_queue.push_front(id);
        }
    }

    /// Device confirmed the deallocation; the slot is free again
    pub fn deallocated(&mut self, id: BufferId) {
        if let Some(slot) = self.slots.get_mut(id.index())
            && *slot != ReadSlot::Free
        {
            *slot = ReadSlot::Free;
            self.free += 1;
        }
    }

    /// Release a buffer the device never filled
    pub fn free(&mut self, id: BufferId) {
        self.deallocated(id);
    }

    /// Reclaim buffers that have sat in use past `threshold` and are not
    /// owned by any live token
    ///
    /// Reclaimed buffers are queued for deallocation, since the device side
    /// may still consider them allocated.
    pub fn recover_orphans<F>(&mut self, now: Instant, threshold: Duration, owned: F) -> usize
    where
        F: Fn(BufferId) -> bool,
    {
        let mut recovered = Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if let ReadSlot::InUse { last_used } = *slot
                && now.saturating_duration_since(last_used) > threshold
                && let Ok(raw) = u16::try_from(i)
                && !owned(BufferId(raw))
            {
                recovered.push(BufferId(raw));
            }
        }
        for &id in &recovered {
            warn!("recovering orphaned read buffer {}", id);
            self.schedule_deallocation(id);
        }
        if !recovered.is_empty() {
            debug!("recovered {} orphaned read buffers", recovered.len());
        }
        recovered.len()
    }

    /// Forget all state
    pub fn reset(&mut self) {
        self.slots.fill(ReadSlot::Free);
        self.free = self.slots.len();
        self.dealloc_queue.clear();
        self.search_hint = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_bitmap_allocate_until_exhausted() {
        let mut pool = BufferPool::new(BufferKind::Core, 130);
        let mut seen = HashSet::new();
        for _ in 0..130 {
            let id = pool.allocate().unwrap();
            assert!(seen.insert(id));
        }
        assert_eq!(pool.free_count(), 0);
        assert!(pool.allocate().is_none());

        pool.free(BufferId(77));
        assert_eq!(pool.allocate(), Some(BufferId(77)));
    }

    #[test]
    fn test_bitmap_hint_wraps() {
        let mut pool = BufferPool::new(BufferKind::Write, 4);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let _c = pool.allocate().unwrap();
        let _d = pool.allocate().unwrap();
        pool.free(b);
        pool.free(a);
        // Hint sits past the end; wrap and find the lowest free slot.
        assert_eq!(pool.allocate(), Some(a));
        assert_eq!(pool.allocate(), Some(b));
    }

    #[test]
    fn test_bitmap_counts() {
        let mut pool = BufferPool::new(BufferKind::Core, 8);
        let id = pool.allocate().unwrap();
        assert!(pool.is_allocated(id));
        assert_eq!(pool.allocated_count(), 1);
        assert!(pool.is_allocated(BufferId(100)));
        pool.reset();
        assert_eq!(pool.free_count(), 8);
        assert!(!pool.is_allocated(id));
    }

    #[test]
    fn test_read_buffer_lifecycle() {
        let now = Instant::now();
        let mut pool = ReadBufferPool::new(2);
        let id = pool.allocate(now).unwrap();
        assert_eq!(pool.free_count(), 1);

        pool.schedule_deallocation(id);
        assert_eq!(pool.state(id), Some(ReadSlot::PendingDealloc));
        assert_eq!(pool.pending_deallocations(), 1);
        // Not free until the device confirms.
        assert_eq!(pool.free_count(), 1);

        assert_eq!(pool.next_to_deallocate(), Some(id));
        pool.requeue_deallocation(id);
        assert_eq!(pool.next_to_deallocate(), Some(id));
        pool.deallocated(id);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.state(id), Some(ReadSlot::Free));
    }

    #[test]
    fn test_schedule_free_buffer_for_purge() {
        let mut pool = ReadBufferPool::new(3);
        for i in 0..3 {
            pool.schedule_deallocation(BufferId(i));
        }
        assert_eq!(pool.free_count(), 0);
        assert!(pool.allocate(Instant::now()).is_none());
        while let Some(id) = pool.next_to_deallocate() {
            pool.deallocated(id);
        }
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn test_orphan_recovery_skips_owned() {
        let start = Instant::now();
        let mut pool = ReadBufferPool::new(4);
        let owned = pool.allocate(start).unwrap();
        let orphan = pool.allocate(start).unwrap();
        let fresh = pool.allocate(start + Duration::from_secs(10)).unwrap();

        let now = start + Duration::from_secs(11);
        let n = pool.recover_orphans(now, Duration::from_secs(5), |id| id == owned);
        assert_eq!(n, 1);
        assert_eq!(pool.state(orphan), Some(ReadSlot::PendingDealloc));
        assert!(matches!(pool.state(owned), Some(ReadSlot::InUse { .. })));
        assert!(matches!(pool.state(fresh), Some(ReadSlot::InUse { .. })));
    }
}
