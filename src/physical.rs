use crate::{
    globals::GRANULE_SIZE,
    util::{is_aligned, mmap},
};

/// A run of physically backed granules. Offsets are granule aligned positions
/// inside the heap's physical capacity and carry no virtual meaning.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PhysicalSegment {
    pub start: usize,
    pub size: usize,
}

impl PhysicalSegment {
    pub fn end(&self) -> usize {
        self.start + self.size
    }
}

/// Descriptor of the physical memory owned by a single page. Ordered segment
/// list, possibly discontiguous.
#[derive(Default, Debug)]
pub struct PhysicalMemory {
    segments: Vec<PhysicalSegment>,
}

impl PhysicalMemory {
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn size(&self) -> usize {
        self.segments.iter().map(|s| s.size).sum()
    }

    pub fn nsegments(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[PhysicalSegment] {
        &self.segments
    }

    /// Append a segment, merging with the previous one when adjacent.
    pub fn add_segment(&mut self, segment: PhysicalSegment) {
        debug_assert!(is_aligned(segment.start, GRANULE_SIZE));
        debug_assert!(is_aligned(segment.size, GRANULE_SIZE));
        if let Some(last) = self.segments.last_mut() {
            if last.end() == segment.start {
                last.size += segment.size;
                return;
            }
        }
        self.segments.push(segment);
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }
}

/// Pool of free physical granules over a fixed capacity. Allocation and
/// freeing mutate the pool and run under the page allocator lock; `map` and
/// `unmap` only touch the committed state of a private virtual range and are
/// callable without it.
pub struct PhysicalMemoryManager {
    free: Vec<usize>,
    capacity: usize,
}

impl PhysicalMemoryManager {
    pub fn new(capacity: usize) -> Self {
        assert!(is_aligned(capacity, GRANULE_SIZE));
        let ngranules = capacity / GRANULE_SIZE;
        Self {
            free: (0..ngranules).map(|i| i * GRANULE_SIZE).rev().collect(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.len() * GRANULE_SIZE
    }

    /// Take `size` bytes of physical memory out of the pool. Exhaustion is
    /// unrecoverable at this layer.
    pub fn alloc(&mut self, size: usize) -> PhysicalMemory {
        assert!(is_aligned(size, GRANULE_SIZE));
        let ngranules = size / GRANULE_SIZE;
        if ngranules > self.free.len() {
            panic!(
                "out of physical memory: requested {} granules, {} available",
                ngranules,
                self.free.len()
            );
        }
        let mut taken: Vec<usize> = self.free.split_off(self.free.len() - ngranules);
        taken.sort_unstable();
        let mut pmem = PhysicalMemory::new();
        for start in taken {
            pmem.add_segment(PhysicalSegment {
                start,
                size: GRANULE_SIZE,
            });
        }
        pmem
    }

    /// Return every granule of `pmem` to the pool.
    pub fn free(&mut self, pmem: &PhysicalMemory) {
        for segment in pmem.segments() {
            let mut start = segment.start;
            while start < segment.end() {
                self.free.push(start);
                start += GRANULE_SIZE;
            }
        }
    }

    /// Commit `pmem` at `addr`. Lock free: the range belongs to a page no
    /// shared list can reach.
    pub fn map(pmem: &PhysicalMemory, addr: usize) {
        mmap::commit(addr, pmem.size());
    }

    /// Drop the committed backing of `pmem`'s mapping at `addr`.
    pub fn unmap(pmem: &PhysicalMemory, addr: usize) {
        mmap::uncommit(addr, pmem.size());
    }
}
