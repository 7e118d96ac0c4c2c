use memory_addr::{PhysAddr, VirtAddr};

/// The interfaces which the underlying hypervisor must implement.
pub trait PerCpuHal {
    /// Converts a hypervisor virtual address to a host physical address.
    ///
    /// # Parameters
    ///
    /// * `vaddr` - The virtual address to convert.
    ///
    /// # Returns
    ///
    /// * `PhysAddr` - The corresponding physical address.
    fn virt_to_phys(vaddr: VirtAddr) -> PhysAddr;
}
