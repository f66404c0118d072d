//! # Pulsar
//!
//! Pulsar is the page management layer of a region based concurrent GC. The
//! heap hands out pre-mapped pages in two cached size classes, small and
//! medium, and this crate keeps that cache healthy: the page allocator
//! serves and recycles pages, and the page cache balancer converts cached
//! pages of one class into the other so the mix follows the relocation
//! reservations and the observed allocation rates.

pub mod balance;
pub mod globals;
pub mod page;
pub mod page_allocator;
pub mod page_cache;
pub mod page_table;
pub mod physical;
pub mod statistics;
pub mod util;
pub mod virtual_memory;
pub mod worker;

use balance::PageCacheBalance;
use globals::{M, MIN_PAGE_CACHE_PERCENT};
use page::{Page, PageKind};
use page_allocator::PageAllocator;
use page_table::PageTable;
use statistics::Statistics;

/// Process wide settings, read-only while the collector runs.
#[derive(Clone, Copy, Debug)]
pub struct Tunables {
    pub heap_capacity: usize,
    pub balance_page_cache: bool,
    pub min_page_cache_percent: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            heap_capacity: 128 * M,
            balance_page_cache: true,
            min_page_cache_percent: MIN_PAGE_CACHE_PERCENT,
        }
    }
}

/// The one handle threaded through GC phases: page allocator, page table,
/// statistics and tunables.
pub struct GcContext {
    allocator: PageAllocator,
    page_table: PageTable,
    stats: Statistics,
    tunables: Tunables,
}

impl GcContext {
    pub fn new(tunables: Tunables) -> Self {
        assert!(tunables.min_page_cache_percent <= 100);
        let allocator = PageAllocator::new(tunables.heap_capacity);
        let page_table = PageTable::new(allocator.base(), allocator.capacity());
        log::debug!(
            "reserved {} of address space for the page heap",
            util::formatted_size(allocator.capacity())
        );
        Self {
            allocator,
            page_table,
            stats: Statistics::new(),
            tunables,
        }
    }

    pub fn capacity(&self) -> usize {
        self.allocator.capacity()
    }

    pub fn page_allocator(&self) -> &PageAllocator {
        &self.allocator
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Hand a mapped page of `kind` to a mutator.
    pub fn alloc_page(&self, kind: PageKind) -> Box<Page> {
        let page = self.allocator.alloc_page(kind);
        self.page_table.insert(&page);
        self.stats.sample_alloc(kind, page.size());
        page
    }

    /// Hand a mapped large page of at least `size` bytes to a mutator.
    /// Large pages never take part in balancing.
    pub fn alloc_large_page(&self, size: usize) -> Box<Page> {
        let page = self.allocator.alloc_large_page(size);
        self.page_table.insert(&page);
        self.stats.sample_alloc(PageKind::Large, page.size());
        page
    }

    /// Standard release path: return a page to the cache. `reclaimed` says
    /// whether the bytes count as reclaimed by the current GC cycle.
    pub fn release_page(&self, page: Box<Page>, reclaimed: bool) {
        self.allocator.free_page(page, reclaimed);
    }

    /// Recycle detached page shells: their virtual ranges return to the
    /// address space manager and their identities leave the page table.
    pub fn flush_detached(&self) {
        self.allocator.flush_detached(&self.page_table);
    }

    /// Run the page cache balancer sub-phase. A no-op when balancing is
    /// disabled or the collector is cold.
    pub fn balance_page_cache(
        &self,
        before_relocation: bool,
        small_selected_to: usize,
        medium_selected_to: usize,
    ) {
        if !self.tunables.balance_page_cache {
            return;
        }
        let mut balance = PageCacheBalance::new(
            self,
            before_relocation,
            small_selected_to,
            medium_selected_to,
        );
        balance.balance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wires_the_subsystems_together() {
        let ctx = GcContext::new(Tunables::default());
        assert_eq!(ctx.capacity(), 128 * M);

        let page = ctx.alloc_page(PageKind::Small);
        assert!(page.is_mapped());
        assert!(ctx.page_table().get(page.start()).is_some());
        assert_eq!(ctx.page_allocator().lock().used(), page.size());

        ctx.release_page(page, false);
        assert_eq!(ctx.page_allocator().lock().used(), 0);
    }

    #[test]
    fn large_pages_flow_through_the_context() {
        let ctx = GcContext::new(Tunables::default());
        let page = ctx.alloc_large_page(5 * globals::SMALL_PAGE_SIZE);
        assert_eq!(page.kind(), PageKind::Large);
        assert!(ctx.page_table().get(page.start()).is_some());
        ctx.release_page(page, false);
        // Large allocations never feed the balancer's rate statistics.
        ctx.statistics().flush_cycle(1.0);
        assert_eq!(ctx.statistics().small_rate(), 0.0);
        assert_eq!(ctx.statistics().medium_rate(), 0.0);
    }

    #[test]
    fn allocation_feeds_the_rate_statistics() {
        let ctx = GcContext::new(Tunables::default());
        let page = ctx.alloc_page(PageKind::Medium);
        let size = page.size();
        ctx.release_page(page, false);
        ctx.statistics().flush_cycle(1.0);
        assert_eq!(ctx.statistics().medium_rate(), size as f64);
    }
}
