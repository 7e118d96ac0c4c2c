//! x86-64 four-level paging (PML4, PDPT, PD, PT) with 4 KiB base pages and
//! 1 GiB / 2 MiB large pages.

use memory_addr::{PhysAddr, VirtAddr, PAGE_SIZE_4K};

use super::{PageTableEntry, PagingDescriptor, PagingLevel, PteFlags, TableLevel, TerminalLevel};

/// Frame bits of an entry; the physical address width is 52 bits.
const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

const PAGE_SIZE_1G: usize = 0x4000_0000;
const PAGE_SIZE_2M: usize = 0x20_0000;

/// Flags of an entry pointing to a child table.
pub const PAGE_DEFAULT_FLAGS: PteFlags = PteFlags::PRESENT.union(PteFlags::WRITABLE);

/// Root level, one entry per 512 GiB.
pub enum Pml4 {}
/// Second level, one entry per 1 GiB.
pub enum Pdpt {}
/// Third level, one entry per 2 MiB.
pub enum Pd {}
/// Leaf level, one entry per 4 KiB page.
pub enum Pt {}

fn write_next_pt(entry: &PageTableEntry, next_pt: PhysAddr) {
    entry.store((next_pt.as_usize() as u64 & PHYS_ADDR_MASK) | PAGE_DEFAULT_FLAGS.bits());
}

fn read_next_pt(entry: &PageTableEntry) -> PhysAddr {
    PhysAddr::from_usize((entry.bits() & PHYS_ADDR_MASK) as usize)
}

/// Physical address of `vaddr` inside a large page of `page_size` bytes.
fn huge_page_phys(entry: &PageTableEntry, vaddr: VirtAddr, page_size: usize) -> Option<PhysAddr> {
    let bits = entry.bits();
    if bits & PteFlags::HUGE_PAGE.bits() == 0 {
        return None;
    }
    let offset_mask = page_size as u64 - 1;
    let frame = bits & PHYS_ADDR_MASK & !offset_mask;
    Some(PhysAddr::from_usize(
        (frame | (vaddr.as_usize() as u64 & offset_mask)) as usize,
    ))
}

impl PagingLevel for Pml4 {
    const DEPTH: usize = 0;
    const INDEX_SHIFT: usize = 39;

    fn get_phys(_entry: &PageTableEntry, _vaddr: VirtAddr) -> Option<PhysAddr> {
        None
    }
}

impl TableLevel for Pml4 {
    type Next = Pdpt;

    fn set_next_pt(entry: &PageTableEntry, next_pt: PhysAddr) {
        write_next_pt(entry, next_pt)
    }

    fn get_next_pt(entry: &PageTableEntry) -> PhysAddr {
        read_next_pt(entry)
    }
}

impl PagingLevel for Pdpt {
    const DEPTH: usize = 1;
    const INDEX_SHIFT: usize = 30;

    fn get_phys(entry: &PageTableEntry, vaddr: VirtAddr) -> Option<PhysAddr> {
        huge_page_phys(entry, vaddr, PAGE_SIZE_1G)
    }
}

impl TableLevel for Pdpt {
    type Next = Pd;

    fn set_next_pt(entry: &PageTableEntry, next_pt: PhysAddr) {
        write_next_pt(entry, next_pt)
    }

    fn get_next_pt(entry: &PageTableEntry) -> PhysAddr {
        read_next_pt(entry)
    }
}

impl PagingLevel for Pd {
    const DEPTH: usize = 2;
    const INDEX_SHIFT: usize = 21;

    fn get_phys(entry: &PageTableEntry, vaddr: VirtAddr) -> Option<PhysAddr> {
        huge_page_phys(entry, vaddr, PAGE_SIZE_2M)
    }
}

impl TableLevel for Pd {
    type Next = Pt;

    fn set_next_pt(entry: &PageTableEntry, next_pt: PhysAddr) {
        write_next_pt(entry, next_pt)
    }

    fn get_next_pt(entry: &PageTableEntry) -> PhysAddr {
        read_next_pt(entry)
    }
}

impl PagingLevel for Pt {
    const DEPTH: usize = 3;
    const INDEX_SHIFT: usize = 12;
    const PAGE_SIZE: usize = PAGE_SIZE_4K;

    fn get_phys(entry: &PageTableEntry, vaddr: VirtAddr) -> Option<PhysAddr> {
        let offset = (vaddr.as_usize() & (PAGE_SIZE_4K - 1)) as u64;
        Some(PhysAddr::from_usize(
            ((entry.bits() & PHYS_ADDR_MASK) | offset) as usize,
        ))
    }
}

impl TerminalLevel for Pt {
    fn set_terminal(entry: &PageTableEntry, paddr: PhysAddr, flags: PteFlags) {
        entry.store(
            (paddr.as_usize() as u64 & PHYS_ADDR_MASK) | (flags | PteFlags::PRESENT).bits(),
        );
    }
}

/// Level table of x86-64 four-level paging, root first.
pub static X86_64_PAGING: [PagingDescriptor; 4] = [
    PagingDescriptor::table::<Pml4>(),
    PagingDescriptor::table::<Pdpt>(),
    PagingDescriptor::table::<Pd>(),
    PagingDescriptor::terminal::<Pt>(),
];
