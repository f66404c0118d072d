use std::time::Instant;

use log::{debug, info};

use crate::{
    globals::{M, MEDIUM_PAGE_SIZE, SMALL_PAGE_SIZE},
    page::{Page, PageKind},
    physical::PhysicalMemoryManager,
    worker, GcContext,
};

const MB: f64 = M as f64;

/// Keeps the ratio denominator non-zero when both rates are zero.
const RATE_EPSILON: f64 = 0.1;

fn total_size(small_count: usize, medium_count: usize) -> usize {
    SMALL_PAGE_SIZE * small_count + MEDIUM_PAGE_SIZE * medium_count
}

/// Largest small page count that exactly saturates `total` once `medium`
/// medium pages are set aside. Always saturates: the remainder is a multiple
/// of the small page size.
fn max_small_for_medium(total: usize, medium: usize) -> usize {
    assert!(total > medium * MEDIUM_PAGE_SIZE, "enough page cache");
    (total - medium * MEDIUM_PAGE_SIZE) / SMALL_PAGE_SIZE
}

/// Largest medium page count that leaves room for `small` small pages. May
/// not saturate `total`; the caller recomputes the small count afterwards.
fn max_medium_for_small(total: usize, small: usize) -> usize {
    assert!(total > small * SMALL_PAGE_SIZE, "enough page cache");
    (total - small * SMALL_PAGE_SIZE) / MEDIUM_PAGE_SIZE
}

/// Inputs of one sizing decision, sampled under the allocator lock.
#[derive(Clone, Copy, Debug)]
pub struct SizingRequest {
    pub available_small: usize,
    pub available_medium: usize,
    pub before_relocation: bool,
    pub small_selected_to: usize,
    pub medium_selected_to: usize,
    pub capacity: usize,
    pub min_page_cache_percent: usize,
    pub small_rate: f64,
    pub medium_rate: f64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SizingOutcome {
    /// The reservation floor cannot be met without growing the cache.
    Infeasible,
    /// The targets equal the current counts; nothing to transform.
    NoMovement,
    Rebalance {
        target_small: usize,
        target_medium: usize,
    },
}

/*
 The targets must satisfy the reservation floor and should match the
 allocation rate ratio:

 [reservation floor] keep at least minimal_small/minimal_medium cached pages
   so the page cache is never flushed to serve an ordinary allocation:
   - a percentage of heap capacity per class, and
   - before relocation, enough pages of each class for the selected
     to-space.

 [allocation rate goal] split the cache capacity between the classes in
   proportion to the observed per class allocation rates. Only applied after
   relocation; before relocation the current split is kept.

 The optimum is projected onto the floor while preserving the total byte
 size of the cache. When the small count has to be lifted to its floor, the
 medium count is set to the largest value whose paired small count still
 meets that floor, which can leave the medium count well above its own
 floor. That is intentional: the pair must saturate the available cache.
*/
impl SizingRequest {
    fn available_total(&self) -> usize {
        total_size(self.available_small, self.available_medium)
    }

    fn minimal_small(&self) -> usize {
        let floor = (self.capacity as f64 * self.min_page_cache_percent as f64
            / 100.0
            / SMALL_PAGE_SIZE as f64) as usize;
        let floor = floor.max(1);
        if self.before_relocation {
            floor.max(self.small_selected_to)
        } else {
            floor
        }
    }

    fn minimal_medium(&self) -> usize {
        let floor = (self.capacity as f64 * self.min_page_cache_percent as f64
            / 100.0
            / MEDIUM_PAGE_SIZE as f64) as usize;
        let floor = floor.max(1);
        if self.before_relocation {
            floor.max(self.medium_selected_to)
        } else {
            floor
        }
    }

    fn optimal_medium(&self) -> usize {
        if self.before_relocation {
            return self.available_medium;
        }
        let ratio = self.medium_rate / (self.medium_rate + self.small_rate + RATE_EPSILON);
        (self.available_total() as f64 * ratio / MEDIUM_PAGE_SIZE as f64) as usize
    }

    pub fn solve(&self) -> SizingOutcome {
        let minimal_medium = self.minimal_medium();
        let minimal_small = self.minimal_small();
        let available = self.available_total();

        if total_size(minimal_small, minimal_medium) > available {
            debug!(
                "will not balance page cache in this GC cycle \
                 (the lower bound of page cache size exceeds the available page cache size)"
            );
            return SizingOutcome::Infeasible;
        }

        debug!(
            "Allocation Rate: {:.3}MB/s (small), {:.3}MB/s (medium)",
            self.small_rate / MB,
            self.medium_rate / MB
        );

        let optimal_medium = self.optimal_medium();
        let optimal_small = if self.before_relocation {
            self.available_small
        } else {
            max_small_for_medium(available, optimal_medium)
        };
        assert_eq!(
            total_size(optimal_small, optimal_medium),
            available,
            "the optimum must preserve the page cache size"
        );

        let (target_small, target_medium) = if optimal_medium >= minimal_medium
            && optimal_small >= minimal_small
        {
            (optimal_small, optimal_medium)
        } else if optimal_medium < minimal_medium {
            let target_medium = minimal_medium;
            let target_small = max_small_for_medium(available, target_medium);
            assert!(target_small >= minimal_small, "small page lower bound");
            (target_small, target_medium)
        } else if optimal_small < minimal_small {
            // Largest medium count whose paired small count still meets the
            // small floor. Recomputing the small count afterwards restores
            // exact saturation.
            let target_medium = max_medium_for_small(available, minimal_small);
            assert!(target_medium >= minimal_medium, "medium page lower bound");
            let target_small = max_small_for_medium(available, target_medium);
            assert!(target_small >= minimal_small, "small page lower bound");
            (target_small, target_medium)
        } else {
            unreachable!()
        };

        assert_eq!(
            total_size(target_small, target_medium),
            available,
            "the target must preserve the page cache size"
        );

        if target_medium == self.available_medium {
            debug!("will not balance page cache in this GC cycle (no page will be transformed)");
            return SizingOutcome::NoMovement;
        }
        debug!(
            "Page Cache (Medium Pages): {}->{}",
            self.available_medium, target_medium
        );
        debug!(
            "Page Cache (Small Pages): {}->{}",
            self.available_small, target_small
        );
        SizingOutcome::Rebalance {
            target_small,
            target_medium,
        }
    }
}

/// Converts cached pages of one class into the other, preserving the total
/// cached byte size. Runs twice per GC cycle on a concurrent worker: before
/// relocation to guarantee to-space reservations, after relocation to chase
/// the observed allocation rates.
pub struct PageCacheBalance<'a> {
    ctx: &'a GcContext,
    before_relocation: bool,
    small_selected_to: usize,
    medium_selected_to: usize,

    available_small: usize,
    available_medium: usize,
    target_small: usize,
    target_medium: usize,

    loaner_kind: PageKind,
    debtor_kind: PageKind,
    loaner_count: usize,
    debtor_count: usize,
    loaner_list: Vec<Box<Page>>,
    debtor_list: Vec<Box<Page>>,

    start: Instant,
}

impl<'a> PageCacheBalance<'a> {
    pub fn new(
        ctx: &'a GcContext,
        before_relocation: bool,
        small_selected_to: usize,
        medium_selected_to: usize,
    ) -> Self {
        assert!(ctx.tunables().balance_page_cache, "sanity");
        Self {
            ctx,
            before_relocation,
            small_selected_to,
            medium_selected_to,
            available_small: 0,
            available_medium: 0,
            target_small: 0,
            target_medium: 0,
            loaner_kind: PageKind::Small,
            debtor_kind: PageKind::Medium,
            loaner_count: 0,
            debtor_count: 0,
            loaner_list: Vec::new(),
            debtor_list: Vec::new(),
            start: Instant::now(),
        }
    }

    pub fn balance(&mut self) {
        assert!(
            worker::is_concurrent_gc_worker(),
            "page cache balance must run on a concurrent GC worker"
        );
        if self.need_to_balance() {
            self.teardown();
            self.rebuild();
        }
    }

    /// Sample the cache, solve for the targets and loan the surplus pages
    /// out, all under the allocator lock.
    fn need_to_balance(&mut self) -> bool {
        // A cold collector serves allocations from free physical memory
        // rather than flushing the cache, and the rate averages have no
        // usable samples yet.
        if !self.ctx.statistics().is_warm() {
            return false;
        }

        let mut inner = self.ctx.page_allocator().lock();
        self.available_small = inner.cache.small_page_count();
        self.available_medium = inner.cache.medium_page_count();
        self.target_small = self.available_small;
        self.target_medium = self.available_medium;

        let request = SizingRequest {
            available_small: self.available_small,
            available_medium: self.available_medium,
            before_relocation: self.before_relocation,
            small_selected_to: self.small_selected_to,
            medium_selected_to: self.medium_selected_to,
            capacity: self.ctx.capacity(),
            min_page_cache_percent: self.ctx.tunables().min_page_cache_percent,
            small_rate: self.ctx.statistics().small_rate(),
            medium_rate: self.ctx.statistics().medium_rate(),
        };
        match request.solve() {
            SizingOutcome::Infeasible | SizingOutcome::NoMovement => false,
            SizingOutcome::Rebalance {
                target_small,
                target_medium,
            } => {
                self.target_small = target_small;
                self.target_medium = target_medium;
                self.calculate_loaner_and_debtor();
                inner
                    .cache
                    .loan_pages(self.loaner_count, self.loaner_kind, &mut self.loaner_list);
                true
            }
        }
    }

    fn calculate_loaner_and_debtor(&mut self) {
        if self.target_small > self.available_small {
            self.debtor_count = self.target_small - self.available_small;
            self.debtor_kind = PageKind::Small;
            self.loaner_count = self.available_medium - self.target_medium;
            self.loaner_kind = PageKind::Medium;
        } else if self.target_medium > self.available_medium {
            self.debtor_count = self.target_medium - self.available_medium;
            self.debtor_kind = PageKind::Medium;
            self.loaner_count = self.available_small - self.target_small;
            self.loaner_kind = PageKind::Small;
        } else {
            unreachable!()
        }
    }

    fn teardown(&mut self) {
        self.unmap_pages();
        self.free_physical_memory();
    }

    fn rebuild(&mut self) {
        self.create_pages_for_debtor();
        self.map_pages();
        self.insert_pages_to_page_cache();
    }

    /// Drop the virtual mappings of the loaned pages. The pages left the
    /// cache under the lock, so nothing else can reach them here.
    fn unmap_pages(&mut self) {
        for page in self.loaner_list.iter_mut() {
            PhysicalMemoryManager::unmap(page.physical_memory(), page.start());
            page.set_mapped(false);
        }
    }

    /// Return the loaned pages' physical memory to the pool and park the
    /// shells. The lock is re-taken per page to bound the hold time.
    fn free_physical_memory(&mut self) {
        while let Some(mut page) = self.loaner_list.pop() {
            let mut inner = self.ctx.page_allocator().lock();
            let pmem = page.take_physical_memory();
            inner.physical.free(&pmem);
            inner.detached.push(page);
        }
    }

    /// Create the debtor pages from the physical memory teardown released.
    /// The lock is re-taken per page to bound the hold time.
    fn create_pages_for_debtor(&mut self) {
        let size = self.debtor_kind.size();
        for _ in 0..self.debtor_count {
            let mut inner = self.ctx.page_allocator().lock();
            let page = inner.create_page(self.debtor_kind, size);
            inner.increase_used(size, false);
            self.debtor_list.push(page);
        }
    }

    fn map_pages(&mut self) {
        for page in self.debtor_list.iter_mut() {
            assert!(!page.is_mapped(), "pages come out of creation unmapped");
            self.ctx.page_allocator().map_page(page);
        }
    }

    fn insert_pages_to_page_cache(&mut self) {
        while let Some(mut page) = self.debtor_list.pop() {
            page.reset();
            self.ctx.page_table().insert(&page);
            // reclaimed is false so the bytes do not count as reclaimed by
            // this GC cycle.
            self.ctx.release_page(page, false);
        }
    }
}

impl Drop for PageCacheBalance<'_> {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64() * 1000.0;
        info!(
            "Balance Page Cache {} Relocation (Sub-phase): {:.3}ms",
            if self.before_relocation {
                "Before"
            } else {
                "After"
            },
            duration
        );
    }
}
