use parking_lot::{Mutex, MutexGuard};

use crate::{
    globals::GRANULE_SIZE,
    page::{Page, PageKind},
    page_cache::PageCache,
    page_table::PageTable,
    physical::PhysicalMemoryManager,
    util::{align_up, is_aligned},
    virtual_memory::VirtualMemoryManager,
};

/// State serialised by the allocator lock: the page cache, the physical
/// pool, the address space manager, the detached shells and the usage
/// counters. Mapping syscalls never run while this is held.
pub struct PageAllocatorInner {
    pub cache: PageCache,
    pub physical: PhysicalMemoryManager,
    pub vspace: VirtualMemoryManager,
    pub detached: Vec<Box<Page>>,
    used: usize,
    gc_reclaimed: usize,
}

impl PageAllocatorInner {
    /// Produce a fresh, unmapped page backed by newly allocated physical
    /// memory and a fresh virtual range.
    pub fn create_page(&mut self, kind: PageKind, size: usize) -> Box<Page> {
        debug_assert!(is_aligned(size, GRANULE_SIZE));
        let vmem = self.vspace.alloc(size);
        let pmem = self.physical.alloc(size);
        Box::new(Page::new(kind, vmem, pmem))
    }

    /// `reclaimed` gates only the GC reclaimed byte accounting.
    pub fn increase_used(&mut self, bytes: usize, reclaimed: bool) {
        self.used += bytes;
        if reclaimed {
            self.gc_reclaimed = self.gc_reclaimed.saturating_sub(bytes);
        }
    }

    pub fn decrease_used(&mut self, bytes: usize, reclaimed: bool) {
        assert!(self.used >= bytes, "used bytes underflow");
        self.used -= bytes;
        if reclaimed {
            self.gc_reclaimed += bytes;
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn gc_reclaimed(&self) -> usize {
        self.gc_reclaimed
    }
}

pub struct PageAllocator {
    inner: Mutex<PageAllocatorInner>,
    base: usize,
    capacity: usize,
}

impl PageAllocator {
    pub fn new(capacity: usize) -> Self {
        let capacity = align_up(capacity, GRANULE_SIZE);
        let vspace = VirtualMemoryManager::new(capacity);
        let base = vspace.base();
        Self {
            inner: Mutex::new(PageAllocatorInner {
                cache: PageCache::new(),
                physical: PhysicalMemoryManager::new(capacity),
                vspace,
                detached: Vec::new(),
                used: 0,
                gc_reclaimed: 0,
            }),
            base,
            capacity,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn lock(&self) -> MutexGuard<'_, PageAllocatorInner> {
        self.inner.lock()
    }

    /// Commit a page's backing at its virtual range. The page must be
    /// private to the caller; the allocator lock is deliberately not taken.
    pub fn map_page(&self, page: &mut Page) {
        assert!(!page.is_mapped(), "page is already mapped");
        assert!(page.is_backed(), "cannot map a shell");
        PhysicalMemoryManager::map(page.physical_memory(), page.start());
        page.set_mapped(true);
    }

    /// Serve a page of `kind` from the cache, or create and map a fresh one.
    pub fn alloc_page(&self, kind: PageKind) -> Box<Page> {
        let size = kind.size();
        let (mut page, fresh) = {
            let mut inner = self.lock();
            inner.increase_used(size, false);
            match inner.cache.take(kind) {
                Some(page) => (page, false),
                None => (inner.create_page(kind, size), true),
            }
        };
        if fresh {
            self.map_page(&mut page);
        }
        debug_assert!(page.is_mapped());
        page
    }

    /// Large pages are cached by exact size and never rebalanced.
    pub fn alloc_large_page(&self, size: usize) -> Box<Page> {
        let size = align_up(size, GRANULE_SIZE);
        let (mut page, fresh) = {
            let mut inner = self.lock();
            inner.increase_used(size, false);
            match inner.cache.take_large(size) {
                Some(page) => (page, false),
                None => (inner.create_page(PageKind::Large, size), true),
            }
        };
        if fresh {
            self.map_page(&mut page);
        }
        debug_assert!(page.is_mapped());
        page
    }

    /// Standard release path: return a mapped page to the cache.
    pub fn free_page(&self, page: Box<Page>, reclaimed: bool) {
        assert!(
            page.is_mapped() && page.is_backed(),
            "only mapped, backed pages may enter the cache"
        );
        let size = page.size();
        let mut inner = self.lock();
        inner.decrease_used(size, reclaimed);
        inner.cache.push(page);
    }

    /// Recycle detached shells: hand their virtual ranges back and drop
    /// their identities from `table`. Runs on the general free path, not
    /// during balancing.
    pub fn flush_detached(&self, table: &PageTable) {
        let shells = {
            let mut inner = self.lock();
            std::mem::take(&mut inner.detached)
        };
        for shell in &shells {
            assert!(!shell.is_backed(), "detached shells own no physical memory");
            table.remove(shell.start(), shell.size());
        }
        let mut inner = self.lock();
        for shell in shells {
            inner.vspace.free(*shell.virtual_memory());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::{MEDIUM_PAGE_SIZE, SMALL_PAGE_SIZE};

    #[test]
    fn alloc_maps_and_accounts() {
        let allocator = PageAllocator::new(8 * MEDIUM_PAGE_SIZE);
        let page = allocator.alloc_page(PageKind::Small);
        assert!(page.is_mapped());
        assert_eq!(page.size(), SMALL_PAGE_SIZE);
        assert_eq!(allocator.lock().used(), SMALL_PAGE_SIZE);

        allocator.free_page(page, false);
        assert_eq!(allocator.lock().used(), 0);
        assert_eq!(allocator.lock().cache.small_page_count(), 1);
    }

    #[test]
    fn cached_pages_are_served_before_fresh_ones() {
        let allocator = PageAllocator::new(8 * MEDIUM_PAGE_SIZE);
        let page = allocator.alloc_page(PageKind::Medium);
        let start = page.start();
        allocator.free_page(page, false);

        let again = allocator.alloc_page(PageKind::Medium);
        assert_eq!(again.start(), start);
    }

    #[test]
    fn reclaimed_flag_feeds_the_reclaimed_counter() {
        let allocator = PageAllocator::new(8 * MEDIUM_PAGE_SIZE);
        let page = allocator.alloc_page(PageKind::Small);
        allocator.free_page(page, true);
        assert_eq!(allocator.lock().gc_reclaimed(), SMALL_PAGE_SIZE);

        let page = allocator.alloc_page(PageKind::Small);
        allocator.free_page(page, false);
        assert_eq!(allocator.lock().gc_reclaimed(), SMALL_PAGE_SIZE);
    }

    #[test]
    fn large_pages_are_cached_by_exact_size() {
        let allocator = PageAllocator::new(16 * MEDIUM_PAGE_SIZE);
        let page = allocator.alloc_large_page(3 * SMALL_PAGE_SIZE);
        assert_eq!(page.kind(), PageKind::Large);
        assert_eq!(page.size(), 3 * SMALL_PAGE_SIZE);
        let start = page.start();
        allocator.free_page(page, false);
        assert_eq!(allocator.lock().cache.large_page_count(), 1);

        // A differently sized request gets a fresh page.
        let other = allocator.alloc_large_page(5 * SMALL_PAGE_SIZE);
        assert_ne!(other.start(), start);
        assert_eq!(allocator.lock().cache.large_page_count(), 1);

        let again = allocator.alloc_large_page(3 * SMALL_PAGE_SIZE);
        assert_eq!(again.start(), start);
    }

    #[test]
    fn flush_detached_recycles_address_space() {
        let allocator = PageAllocator::new(2 * SMALL_PAGE_SIZE);
        let table = PageTable::new(allocator.base(), allocator.capacity());

        let mut page = allocator.alloc_page(PageKind::Small);
        table.insert(&page);
        let start = page.start();

        // Tear the page down into a shell by hand.
        {
            let mut inner = allocator.lock();
            let pmem = page.take_physical_memory();
            inner.physical.free(&pmem);
            inner.decrease_used(SMALL_PAGE_SIZE, false);
            page.set_mapped(false);
            inner.detached.push(page);
        }

        allocator.flush_detached(&table);
        assert!(table.get(start).is_none());
        assert!(allocator.lock().detached.is_empty());

        // The recycled range is usable again.
        let fresh = allocator.alloc_page(PageKind::Small);
        assert!(fresh.is_mapped());
    }
}
