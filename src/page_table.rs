use parking_lot::Mutex;

use crate::{
    globals::GRANULE_SHIFT,
    page::{Page, PageKind},
};

/// Identity of a published page, as seen through the table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageTableEntry {
    pub start: usize,
    pub size: usize,
    pub kind: PageKind,
    pub seqnum: u32,
}

/// Dense granule indexed map from heap address to page identity. Every
/// granule a page covers points at the same entry. Mutated when pages are
/// created, destroyed or reset; reads and writes take the table's own lock.
pub struct PageTable {
    base: usize,
    entries: Mutex<Vec<Option<PageTableEntry>>>,
}

impl PageTable {
    pub fn new(base: usize, capacity: usize) -> Self {
        let slots = capacity >> GRANULE_SHIFT;
        Self {
            base,
            entries: Mutex::new(vec![None; slots]),
        }
    }

    fn index_of(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.base);
        (addr - self.base) >> GRANULE_SHIFT
    }

    pub fn insert(&self, page: &Page) {
        let entry = PageTableEntry {
            start: page.start(),
            size: page.size(),
            kind: page.kind(),
            seqnum: page.seqnum(),
        };
        let first = self.index_of(page.start());
        let last = self.index_of(page.end());
        let mut entries = self.entries.lock();
        for slot in &mut entries[first..last] {
            *slot = Some(entry);
        }
    }

    pub fn remove(&self, start: usize, size: usize) {
        let first = self.index_of(start);
        let last = self.index_of(start + size);
        let mut entries = self.entries.lock();
        for slot in &mut entries[first..last] {
            *slot = None;
        }
    }

    pub fn get(&self, addr: usize) -> Option<PageTableEntry> {
        let index = self.index_of(addr);
        self.entries.lock()[index]
    }
}
