use crate::page::{Page, PageKind};

/// Ready to allocate pages, partitioned by size class. Every page in here is
/// mapped and physically backed. Callers get no ordering guarantees.
#[derive(Default)]
pub struct PageCache {
    small: Vec<Box<Page>>,
    medium: Vec<Box<Page>>,
    large: Vec<Box<Page>>,
}

impl PageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn small_page_count(&self) -> usize {
        self.small.len()
    }

    pub fn medium_page_count(&self) -> usize {
        self.medium.len()
    }

    pub fn large_page_count(&self) -> usize {
        self.large.len()
    }

    fn list(&mut self, kind: PageKind) -> &mut Vec<Box<Page>> {
        match kind {
            PageKind::Small => &mut self.small,
            PageKind::Medium => &mut self.medium,
            PageKind::Large => &mut self.large,
        }
    }

    pub fn push(&mut self, page: Box<Page>) {
        debug_assert!(page.is_mapped() && page.is_backed());
        let kind = page.kind();
        self.list(kind).push(page);
    }

    pub fn take(&mut self, kind: PageKind) -> Option<Box<Page>> {
        self.list(kind).pop()
    }

    /// Take a cached large page of exactly `size` bytes.
    pub fn take_large(&mut self, size: usize) -> Option<Box<Page>> {
        let index = self.large.iter().position(|page| page.size() == size)?;
        Some(self.large.swap_remove(index))
    }

    /// Move `count` pages of `kind` out of the cache into `out`. Which pages
    /// are picked is unspecified.
    pub fn loan_pages(&mut self, count: usize, kind: PageKind, out: &mut Vec<Box<Page>>) {
        assert!(
            kind != PageKind::Large,
            "large pages are never loaned for balancing"
        );
        let list = self.list(kind);
        assert!(
            count <= list.len(),
            "loan of {} {:?} pages exceeds the {} cached",
            count,
            kind,
            list.len()
        );
        let at = list.len() - count;
        out.extend(list.drain(at..));
    }
}
