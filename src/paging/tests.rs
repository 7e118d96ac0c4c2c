use axerrno::AxError;
use memory_addr::{PhysAddr, VirtAddr};

use super::x86_64::{Pd, Pdpt, Pml4, Pt, PAGE_DEFAULT_FLAGS, X86_64_PAGING};
use super::{PageTable, PageTableEntry, PagingLevel, PteFlags, TableLevel, TerminalLevel, ENTRY_COUNT};

const INDEX_SHIFTS: [usize; 4] = [39, 30, 21, 12];

fn pa(addr: usize) -> PhysAddr {
    PhysAddr::from_usize(addr)
}

fn va(addr: usize) -> VirtAddr {
    VirtAddr::from_usize(addr)
}

#[test]
fn test_get_entry_selects_index_field() {
    let table = PageTable::new();
    // Noise in every bit outside the index field of each depth.
    let noise = 0xffff_ffff_ffff_ffffusize;

    for (depth, paging) in X86_64_PAGING.iter().enumerate() {
        let shift = INDEX_SHIFTS[depth];
        for index in 0..ENTRY_COUNT {
            let vaddr = (noise & !(0x1ff << shift)) | (index << shift);
            let entry = paging.get_entry(&table, va(vaddr));
            assert!(
                core::ptr::eq(entry, table.entry(index)),
                "depth {depth} index {index}"
            );
        }
    }
}

#[test]
fn test_typed_levels_match_descriptors() {
    assert_eq!(Pml4::DEPTH, 0);
    assert_eq!(Pdpt::DEPTH, 1);
    assert_eq!(Pd::DEPTH, 2);
    assert_eq!(Pt::DEPTH, 3);
    assert_eq!(<<Pml4 as TableLevel>::Next as PagingLevel>::DEPTH, 1);
    assert_eq!(<<Pd as TableLevel>::Next as PagingLevel>::DEPTH, 3);

    let vaddr = va(0x0000_7f12_3456_7000);
    assert_eq!(Pml4::index_of(vaddr), (0x0000_7f12_3456_7000 >> 39) & 0x1ff);
    assert_eq!(Pt::index_of(vaddr), 0x167);

    assert_eq!(X86_64_PAGING.len(), 4);
    for paging in &X86_64_PAGING[..3] {
        assert_eq!(paging.page_size(), 0);
        assert!(!paging.is_terminal());
    }
    assert_eq!(X86_64_PAGING[3].page_size(), 0x1000);
    assert!(X86_64_PAGING[3].is_terminal());
}

#[test]
fn test_set_next_pt_round_trips_page_aligned() {
    let entry = PageTableEntry::empty();
    for paging in &X86_64_PAGING[..3] {
        for addr in [0x1000, 0x2345_6000, 0x0000_1234_5678_9abc, 0x000f_ffff_ffff_f000] {
            paging.set_next_pt(&entry, pa(addr)).unwrap();
            assert!(paging.entry_valid(&entry));
            assert_eq!(paging.get_flags(&entry), PAGE_DEFAULT_FLAGS);
            assert_eq!(paging.get_next_pt(&entry).unwrap(), pa(addr & !0xfff));
        }
    }
}

#[test]
fn test_set_next_pt_l4_concrete() {
    let table = PageTable::new();
    let vaddr = va(0x0000_1000_0000_0000);
    let entry = Pml4::get_entry(&table, vaddr);

    Pml4::set_next_pt(entry, pa(0x0000_1234_5678_9000));
    assert_eq!(Pml4::get_next_pt(entry), pa(0x0000_1234_5678_9000));

    // Bits above the physical width and below the page boundary are dropped.
    Pml4::set_next_pt(entry, pa(0xfff0_1234_5678_9abc));
    assert_eq!(Pml4::get_next_pt(entry), pa(0x0000_1234_5678_9000));
    assert_eq!(entry.bits(), 0x0000_1234_5678_9003);
}

#[test]
fn test_clear_entry() {
    let entry = PageTableEntry::empty();
    for paging in &X86_64_PAGING {
        entry.store(0x8000_0000_1234_50ff);
        assert!(paging.entry_valid(&entry));
        paging.clear_entry(&entry);
        assert!(!paging.entry_valid(&entry));
        assert_eq!(paging.get_flags(&entry), PteFlags::empty());
        assert_eq!(entry.bits(), 0);
    }
}

#[test]
fn test_page_table_empty_transitions() {
    let table = PageTable::new();
    let leaf = &X86_64_PAGING[3];
    assert!(leaf.page_table_empty(&table));

    for index in [0, 17, ENTRY_COUNT - 1] {
        let vaddr = va(index << 21);
        let entry = X86_64_PAGING[2].get_entry(&table, vaddr);
        X86_64_PAGING[2].set_next_pt(entry, pa(0x5000)).unwrap();
        assert!(!X86_64_PAGING[2].page_table_empty(&table));
        X86_64_PAGING[2].clear_entry(entry);
        assert!(X86_64_PAGING[2].page_table_empty(&table));

        let entry = leaf.get_entry(&table, va(index << 12));
        leaf.set_terminal(entry, pa(0x7000), PteFlags::WRITABLE).unwrap();
        assert!(!leaf.page_table_empty(&table));
        leaf.clear_entry(entry);
        assert!(leaf.page_table_empty(&table));
    }

    // Non-valid garbage does not make a table non-empty.
    table.entry(3).store(0x1234_5000);
    assert!(table.is_empty());
    table.entry(4).store(0x1);
    assert!(!table.is_empty());
    table.clear();
    assert!(table.is_empty());
}

#[test]
fn test_set_terminal_get_phys_leaf() {
    let entry = PageTableEntry::empty();
    let flag_sets = [
        PteFlags::empty(),
        PteFlags::WRITABLE,
        PteFlags::WRITABLE | PteFlags::USER | PteFlags::NO_EXECUTE,
        PteFlags::NO_CACHE | PteFlags::GLOBAL,
    ];
    for paddr in [0x0, 0x1000, 0x8_0000_0000, 0x000f_ffff_ffff_f000] {
        for flags in flag_sets {
            Pt::set_terminal(&entry, pa(paddr), flags);
            assert!(entry.is_valid());
            for vaddr in [0x0, 0x7ff, 0xfff, 0x1234_5abc, 0xffff_8000_0000_0123] {
                assert_eq!(
                    Pt::get_phys(&entry, va(vaddr)),
                    Some(pa(paddr | (vaddr & 0xfff)))
                );
            }
        }
    }
}

#[test]
fn test_set_terminal_merges_validity_bit() {
    let entry = PageTableEntry::empty();
    X86_64_PAGING[3]
        .set_terminal(&entry, pa(0x4000), PteFlags::WRITABLE | PteFlags::NO_EXECUTE)
        .unwrap();
    assert_eq!(entry.flags(), PteFlags::PRESENT | PteFlags::WRITABLE);
    assert_eq!(entry.bits(), 0x8000_0000_0000_4003);
}

#[test]
fn test_set_terminal_drops_out_of_range_bits() {
    let table = PageTable::new();
    let entry = Pt::get_entry(&table, va(0x1234_5000));

    // Bits above the physical width and below the page boundary are dropped.
    Pt::set_terminal(entry, pa(0xfff0_1234_5678_9abc), PteFlags::WRITABLE);
    assert_eq!(entry.bits(), 0x0000_1234_5678_9003);
    assert_eq!(
        Pt::get_phys(entry, va(0x1234_5def)),
        Some(pa(0x0000_1234_5678_9def))
    );

    X86_64_PAGING[3]
        .set_terminal(entry, pa(0x0010_0000_0000_0fff), PteFlags::empty())
        .unwrap();
    assert_eq!(entry.bits(), 0x1);
    assert_eq!(X86_64_PAGING[3].get_phys(entry, va(0x10)), Some(pa(0x10)));
}

#[test]
fn test_get_phys_intermediate_requires_huge_bit() {
    let entry = PageTableEntry::empty();
    let vaddr = va(0x0000_0040_1234_5678);

    Pdpt::set_next_pt(&entry, pa(0x8000_0000));
    assert_eq!(Pdpt::get_phys(&entry, vaddr), None);
    assert_eq!(X86_64_PAGING[1].get_phys(&entry, vaddr), None);
    assert_eq!(Pd::get_phys(&entry, vaddr), None);
    assert_eq!(X86_64_PAGING[2].get_phys(&entry, vaddr), None);

    // 1 GiB page at depth 1: frame bits above 30, offset bits below.
    entry.store(0x0000_0001_c000_0000 | 0x83);
    assert_eq!(Pdpt::get_phys(&entry, vaddr), Some(pa(0x0000_0001_c000_0000 | 0x1234_5678)));

    // 2 MiB page at depth 2: frame bits above 21, offset bits below.
    entry.store(0x0000_0001_c020_0000 | 0x83);
    assert_eq!(Pd::get_phys(&entry, vaddr), Some(pa(0x0000_0001_c020_0000 | 0x14_5678)));

    // Low frame bits below the large page size are not part of the address.
    entry.store(0x0000_0001_c020_0000 | 0x83);
    assert_eq!(
        X86_64_PAGING[1].get_phys(&entry, vaddr),
        Some(pa(0x0000_0001_c000_0000 | 0x1234_5678))
    );
}

#[test]
fn test_get_phys_root_never_maps() {
    let entry = PageTableEntry::empty();
    entry.store(0x0000_0001_c000_0000 | 0x83);
    assert_eq!(Pml4::get_phys(&entry, va(0x1234)), None);
    assert_eq!(X86_64_PAGING[0].get_phys(&entry, va(0x1234)), None);
}

#[test]
fn test_inapplicable_operations_are_reported() {
    let entry = PageTableEntry::empty();
    for paging in &X86_64_PAGING[..3] {
        assert_eq!(
            paging.set_terminal(&entry, pa(0x1000), PteFlags::WRITABLE),
            Err(AxError::Unsupported)
        );
        assert_eq!(entry.bits(), 0);
    }
    assert_eq!(
        X86_64_PAGING[3].set_next_pt(&entry, pa(0x1000)),
        Err(AxError::Unsupported)
    );
    assert_eq!(entry.bits(), 0);
    assert_eq!(X86_64_PAGING[3].get_next_pt(&entry), Err(AxError::Unsupported));
}

#[test]
fn test_page_table_layout() {
    assert_eq!(core::mem::size_of::<PageTable>(), 0x1000);
    assert_eq!(core::mem::align_of::<PageTable>(), 0x1000);
    assert_eq!(core::mem::size_of::<PageTableEntry>(), 8);
}
