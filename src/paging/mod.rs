//! Page-table entry storage and the per-level operation descriptors used by
//! page-table walkers.
//!
//! Two views of the same operations are provided:
//!
//! - A typed view: every translation depth is a marker type implementing
//!   [`PagingLevel`], plus [`TableLevel`] if its entries may point to a child
//!   table and [`TerminalLevel`] if its entries may map memory. Calling an
//!   operation that does not exist at a depth fails to compile.
//! - A runtime view: a slice of [`PagingDescriptor`]s indexed by depth
//!   (0 = root), for walkers that iterate over levels. Depth-inapplicable
//!   operations return [`AxError::Unsupported`](axerrno::AxError::Unsupported).

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use axerrno::{ax_err, AxResult};
use bitflags::bitflags;
use memory_addr::{PhysAddr, VirtAddr, PAGE_SIZE_4K};

pub mod x86_64;

#[cfg(test)]
mod tests;

/// Number of entries in one page table.
pub const ENTRY_COUNT: usize = PAGE_SIZE_4K / core::mem::size_of::<u64>();

const INDEX_MASK: usize = ENTRY_COUNT - 1;

/// Width of the flags field reported by [`PageTableEntry::flags`].
const LOW_FLAGS_MASK: u64 = 0x7f;

bitflags! {
    /// Flag bits of a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        /// The entry is valid.
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// Large-page shortcut at intermediate levels.
        const HUGE_PAGE     = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// One hardware translation-table slot.
///
/// The raw word is only reachable through the level operations. Stores are
/// single atomic writes, so a concurrent hardware or software walker never
/// observes a half-written entry.
#[repr(transparent)]
pub struct PageTableEntry(AtomicU64);

impl PageTableEntry {
    /// An invalid (all-zero) entry.
    pub const fn empty() -> Self {
        Self(AtomicU64::new(0))
    }

    /// The raw hardware word.
    pub fn bits(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn store(&self, bits: u64) {
        self.0.store(bits, Ordering::Release);
    }

    /// Whether the validity bit is set.
    pub fn is_valid(&self) -> bool {
        self.bits() & PteFlags::PRESENT.bits() != 0
    }

    /// The low flags field of the entry.
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.bits() & LOW_FLAGS_MASK)
    }

    /// Zero the slot, making it invalid.
    pub fn clear(&self) {
        self.store(0);
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageTableEntry({:#x})", self.bits())
    }
}

/// A page-sized array of [`ENTRY_COUNT`] entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRY_COUNT],
}

impl PageTable {
    /// A table with every slot invalid.
    pub const fn new() -> Self {
        const EMPTY: PageTableEntry = PageTableEntry::empty();
        Self {
            entries: [EMPTY; ENTRY_COUNT],
        }
    }

    /// The slot at `index`. Panics if `index >= ENTRY_COUNT`.
    pub fn entry(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }

    /// Whether no slot of the table is valid, i.e. the table may be freed.
    pub fn is_empty(&self) -> bool {
        !self.entries.iter().any(PageTableEntry::is_valid)
    }

    /// Invalidate every slot.
    pub fn clear(&self) {
        self.entries.iter().for_each(PageTableEntry::clear);
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One translation depth.
pub trait PagingLevel {
    /// Depth of the level, 0 being the root.
    const DEPTH: usize;
    /// Bit position of the 9-bit table index inside a virtual address.
    const INDEX_SHIFT: usize;
    /// Size of a terminal mapping at this level, 0 if entries never map memory
    /// as a regular page.
    const PAGE_SIZE: usize = 0;

    /// The slot index of `vaddr` in a table of this level.
    fn index_of(vaddr: VirtAddr) -> usize {
        (vaddr.as_usize() >> Self::INDEX_SHIFT) & INDEX_MASK
    }

    /// The slot of `vaddr` in `table`.
    fn get_entry(table: &PageTable, vaddr: VirtAddr) -> &PageTableEntry {
        table.entry(Self::index_of(vaddr))
    }

    /// Physical address `vaddr` translates to through `entry`, or `None` if
    /// the entry does not map memory at this level.
    fn get_phys(entry: &PageTableEntry, vaddr: VirtAddr) -> Option<PhysAddr>;
}

/// A depth whose entries may point to a child table.
pub trait TableLevel: PagingLevel {
    /// The level of the child tables.
    type Next: PagingLevel;

    /// Make `entry` a valid pointer to the child table at `next_pt`.
    fn set_next_pt(entry: &PageTableEntry, next_pt: PhysAddr);

    /// Physical base of the child table `entry` points to.
    fn get_next_pt(entry: &PageTableEntry) -> PhysAddr;
}

/// A depth whose entries map memory.
pub trait TerminalLevel: PagingLevel {
    /// Make `entry` a valid mapping of the page at `paddr` with `flags`.
    fn set_terminal(entry: &PageTableEntry, paddr: PhysAddr, flags: PteFlags);
}

/// Operations of one translation depth, usable without knowing the depth at
/// compile time.
#[derive(Clone, Copy)]
pub struct PagingDescriptor {
    page_size: usize,
    entry_valid: fn(&PageTableEntry) -> bool,
    get_flags: fn(&PageTableEntry) -> PteFlags,
    set_next_pt: Option<fn(&PageTableEntry, PhysAddr)>,
    clear_entry: fn(&PageTableEntry),
    page_table_empty: fn(&PageTable) -> bool,
    get_entry: fn(&PageTable, VirtAddr) -> &PageTableEntry,
    set_terminal: Option<fn(&PageTableEntry, PhysAddr, PteFlags)>,
    get_phys: fn(&PageTableEntry, VirtAddr) -> Option<PhysAddr>,
    get_next_pt: Option<fn(&PageTableEntry) -> PhysAddr>,
}

impl PagingDescriptor {
    /// Descriptor of a non-terminal depth.
    pub const fn table<L: TableLevel>() -> Self {
        Self {
            page_size: 0,
            entry_valid: PageTableEntry::is_valid,
            get_flags: PageTableEntry::flags,
            set_next_pt: Some(L::set_next_pt),
            clear_entry: PageTableEntry::clear,
            page_table_empty: PageTable::is_empty,
            get_entry: L::get_entry,
            set_terminal: None,
            get_phys: L::get_phys,
            get_next_pt: Some(L::get_next_pt),
        }
    }

    /// Descriptor of the innermost depth.
    pub const fn terminal<L: TerminalLevel>() -> Self {
        Self {
            page_size: L::PAGE_SIZE,
            entry_valid: PageTableEntry::is_valid,
            get_flags: PageTableEntry::flags,
            set_next_pt: None,
            clear_entry: PageTableEntry::clear,
            page_table_empty: PageTable::is_empty,
            get_entry: L::get_entry,
            set_terminal: Some(L::set_terminal),
            get_phys: L::get_phys,
            get_next_pt: None,
        }
    }

    /// Size of a terminal mapping, 0 for non-terminal depths.
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    pub const fn is_terminal(&self) -> bool {
        self.set_terminal.is_some()
    }

    pub fn entry_valid(&self, entry: &PageTableEntry) -> bool {
        (self.entry_valid)(entry)
    }

    pub fn get_flags(&self, entry: &PageTableEntry) -> PteFlags {
        (self.get_flags)(entry)
    }

    pub fn set_next_pt(&self, entry: &PageTableEntry, next_pt: PhysAddr) -> AxResult {
        match self.set_next_pt {
            Some(set_next_pt) => {
                set_next_pt(entry, next_pt);
                Ok(())
            }
            None => ax_err!(Unsupported, "set_next_pt on a terminal paging level"),
        }
    }

    pub fn clear_entry(&self, entry: &PageTableEntry) {
        (self.clear_entry)(entry)
    }

    pub fn page_table_empty(&self, table: &PageTable) -> bool {
        (self.page_table_empty)(table)
    }

    pub fn get_entry<'a>(&self, table: &'a PageTable, vaddr: VirtAddr) -> &'a PageTableEntry {
        (self.get_entry)(table, vaddr)
    }

    pub fn set_terminal(
        &self,
        entry: &PageTableEntry,
        paddr: PhysAddr,
        flags: PteFlags,
    ) -> AxResult {
        match self.set_terminal {
            Some(set_terminal) => {
                set_terminal(entry, paddr, flags);
                Ok(())
            }
            None => ax_err!(Unsupported, "set_terminal on a non-terminal paging level"),
        }
    }

    /// See [`PagingLevel::get_phys`].
    pub fn get_phys(&self, entry: &PageTableEntry, vaddr: VirtAddr) -> Option<PhysAddr> {
        (self.get_phys)(entry, vaddr)
    }

    pub fn get_next_pt(&self, entry: &PageTableEntry) -> AxResult<PhysAddr> {
        match self.get_next_pt {
            Some(get_next_pt) => Ok(get_next_pt(entry)),
            None => ax_err!(Unsupported, "get_next_pt on a terminal paging level"),
        }
    }
}

impl fmt::Debug for PagingDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagingDescriptor")
            .field("page_size", &self.page_size)
            .field("terminal", &self.is_terminal())
            .finish()
    }
}
