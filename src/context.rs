//! CPU-private part of a per-CPU record.

use core::mem::size_of;
use core::sync::atomic::AtomicU32;

use axerrno::{ax_err, AxResult};
use memory_addr::{PhysAddr, VirtAddr, PAGE_SIZE_4K};

use crate::hal::PerCpuHal;
use crate::paging::x86_64::X86_64_PAGING;
use crate::paging::{PageTable, PagingDescriptor};

/// Size of the stack used while in hypervisor mode.
pub const STACK_SIZE: usize = PAGE_SIZE_4K;

/// Number of host general registers saved on hypervisor entry.
pub const NUM_ENTRY_REGS: usize = 6;

/// Upper bound of attempts to drain pending local APIC interrupts during
/// teardown.
pub const MAX_CLEAR_APIC_IRQS: u32 = 256;

/// Guest general registers, saved on the hypervisor stack on every VM exit.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    /// Slot of `rsp`, which lives in the hardware control block instead.
    _unused_rsp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

/// The hypervisor-mode stack. Its top holds the guest register snapshot.
#[repr(C)]
pub struct HvStack {
    _fill: [u8; STACK_SIZE - size_of::<GuestRegisters>()],
    pub guest_regs: GuestRegisters,
}

impl HvStack {
    const fn new() -> Self {
        Self {
            _fill: [0; STACK_SIZE - size_of::<GuestRegisters>()],
            guest_regs: GuestRegisters {
                r15: 0,
                r14: 0,
                r13: 0,
                r12: 0,
                r11: 0,
                r10: 0,
                r9: 0,
                r8: 0,
                rdi: 0,
                rsi: 0,
                rbp: 0,
                _unused_rsp: 0,
                rbx: 0,
                rdx: 0,
                rcx: 0,
                rax: 0,
            },
        }
    }

    /// Address one past the highest byte of the stack.
    pub fn top(&self) -> VirtAddr {
        VirtAddr::from_usize(self as *const Self as usize + STACK_SIZE)
    }
}

/// A descriptor-table register (GDTR/IDTR), in the packed layout `sgdt` and
/// `sidt` store.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescTableReg {
    pub limit: u16,
    pub base: u64,
}

/// A cached segment register.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub access_rights: u32,
    pub selector: u16,
}

/// Host kernel state saved on the handover to the hypervisor and restored
/// when the CPU is returned to the host.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostState {
    pub sp: u64,
    pub gdtr: DescTableReg,
    pub idtr: DescTableReg,
    pub regs: [u64; NUM_ENTRY_REGS],
    pub ip: u64,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub tss: Segment,
    pub efer: u64,
}

/// Shadow copies of model-specific registers the guest may change.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShadowMsrs {
    pub pat: u64,
    pub mtrr_def_type: u64,
}

/// A VMX region (VMXON region or VMCS).
#[repr(C, align(4096))]
pub struct Vmcs {
    pub revision_id: u32,
    pub abort_indicator: u32,
    _data: [u8; PAGE_SIZE_4K - 8],
}

impl Vmcs {
    const fn new() -> Self {
        Self {
            revision_id: 0,
            abort_indicator: 0,
            _data: [0; PAGE_SIZE_4K - 8],
        }
    }
}

/// The SVM virtual machine control block, opaque at this layer.
#[repr(C, align(4096))]
pub struct Vmcb {
    bytes: [u8; PAGE_SIZE_4K],
}

/// The SVM host save area, opaque to software.
#[repr(C, align(4096))]
pub struct HostSaveArea {
    _opaque: [u8; PAGE_SIZE_4K],
}

impl Vmcb {
    const fn new() -> Self {
        Self {
            bytes: [0; PAGE_SIZE_4K],
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl HostSaveArea {
    const fn new() -> Self {
        Self {
            _opaque: [0; PAGE_SIZE_4K],
        }
    }
}

/// Hardware virtualization extension used by a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtExtension {
    /// Intel VMX.
    Vmx,
    /// AMD SVM.
    Svm,
}

/// Activation state of VMX.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum VmxState {
    #[default]
    Off,
    /// VMXON executed.
    On,
    /// The VMCS is loaded and set up.
    VmcsReady,
}

/// Activation state of SVM.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SvmState {
    #[default]
    Off,
    On,
}

/// The hardware control structures of the selected virtualization extension.
pub enum VirtControl {
    Vmx {
        vmxon_region: Vmcs,
        vmcs: Vmcs,
        state: VmxState,
    },
    Svm {
        vmcb: Vmcb,
        host_save_area: HostSaveArea,
        state: SvmState,
    },
}

impl VirtControl {
    /// Zeroed control structures for `extension`, in the off state.
    pub fn new(extension: VirtExtension) -> Self {
        match extension {
            VirtExtension::Vmx => Self::Vmx {
                vmxon_region: Vmcs::new(),
                vmcs: Vmcs::new(),
                state: VmxState::Off,
            },
            VirtExtension::Svm => Self::Svm {
                vmcb: Vmcb::new(),
                host_save_area: HostSaveArea::new(),
                state: SvmState::Off,
            },
        }
    }

    pub fn extension(&self) -> VirtExtension {
        match self {
            Self::Vmx { .. } => VirtExtension::Vmx,
            Self::Svm { .. } => VirtExtension::Svm,
        }
    }

    /// Whether hardware virtualization is switched on.
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Vmx { state, .. } => *state != VmxState::Off,
            Self::Svm { state, .. } => *state == SvmState::On,
        }
    }

    pub fn vmx_state(&self) -> Option<VmxState> {
        match self {
            Self::Vmx { state, .. } => Some(*state),
            Self::Svm { .. } => None,
        }
    }

    pub fn svm_state(&self) -> Option<SvmState> {
        match self {
            Self::Svm { state, .. } => Some(*state),
            Self::Vmx { .. } => None,
        }
    }

    pub fn set_vmx_state(&mut self, new_state: VmxState) -> AxResult {
        match self {
            Self::Vmx { state, .. } => {
                *state = new_state;
                Ok(())
            }
            Self::Svm { .. } => ax_err!(BadState, "CPU uses SVM, not VMX"),
        }
    }

    pub fn set_svm_state(&mut self, new_state: SvmState) -> AxResult {
        match self {
            Self::Svm { state, .. } => {
                *state = new_state;
                Ok(())
            }
            Self::Vmx { .. } => ax_err!(BadState, "CPU uses VMX, not SVM"),
        }
    }

    /// Physical addresses of the two hardware pages: VMXON region and VMCS,
    /// or VMCB and host save area.
    pub fn region_paddrs<H: PerCpuHal>(&self) -> [PhysAddr; 2] {
        let (first, second) = match self {
            Self::Vmx {
                vmxon_region, vmcs, ..
            } => (
                vmxon_region as *const Vmcs as usize,
                vmcs as *const Vmcs as usize,
            ),
            Self::Svm {
                vmcb,
                host_save_area,
                ..
            } => (
                vmcb as *const Vmcb as usize,
                host_save_area as *const HostSaveArea as usize,
            ),
        };
        [
            H::virt_to_phys(VirtAddr::from_usize(first)),
            H::virt_to_phys(VirtAddr::from_usize(second)),
        ]
    }
}

/// The private address-translation set of a CPU.
pub struct PagingStructures {
    root_paging: &'static [PagingDescriptor],
    root_table: PageTable,
}

impl PagingStructures {
    /// An empty root table walked with `root_paging`.
    pub fn new(root_paging: &'static [PagingDescriptor]) -> Self {
        Self {
            root_paging,
            root_table: PageTable::new(),
        }
    }

    /// Level descriptors, root first.
    pub fn root_paging(&self) -> &'static [PagingDescriptor] {
        self.root_paging
    }

    pub fn root_table(&self) -> &PageTable {
        &self.root_table
    }

    /// Physical address of the root table, as loaded into CR3.
    pub fn root_paddr<H: PerCpuHal>(&self) -> PhysAddr {
        H::virt_to_phys(VirtAddr::from_usize(
            &self.root_table as *const PageTable as usize,
        ))
    }
}

impl Default for PagingStructures {
    fn default() -> Self {
        Self::new(&X86_64_PAGING)
    }
}

/// The CPU-private part of a per-CPU record. Only the owning CPU may touch it.
#[repr(C)]
pub struct ExecutionContext {
    pub stack: HvStack,
    virt: Option<VirtControl>,
    pub host: HostState,
    pub shadow: ShadowMsrs,
    /// Cached PDPTEs for guests in PAE paging mode.
    pub pdpte: [u64; 4],
    pub pg_structs: PagingStructures,
    /// Completion word of the IOMMU invalidation queue, written by hardware.
    iq_completed: AtomicU32,
    initialized: bool,
    num_clear_apic_irqs: u32,
}

impl ExecutionContext {
    pub(crate) fn new() -> Self {
        Self {
            stack: HvStack::new(),
            virt: None,
            host: HostState::default(),
            shadow: ShadowMsrs::default(),
            pdpte: [0; 4],
            pg_structs: PagingStructures::default(),
            iq_completed: AtomicU32::new(0),
            initialized: false,
            num_clear_apic_irqs: 0,
        }
    }

    pub(crate) fn init(&mut self, extension: VirtExtension) -> AxResult {
        if self.initialized {
            return ax_err!(BadState, "per-CPU state is already initialized");
        }
        self.virt = Some(VirtControl::new(extension));
        self.initialized = true;
        Ok(())
    }

    /// Back to the zeroed, uninitialized state.
    pub(crate) fn wipe(&mut self) {
        self.stack = HvStack::new();
        self.virt = None;
        self.host = HostState::default();
        self.shadow = ShadowMsrs::default();
        self.pdpte = [0; 4];
        self.pg_structs.root_table.clear();
        *self.iq_completed.get_mut() = 0;
        self.initialized = false;
        self.num_clear_apic_irqs = 0;
    }

    /// Whether the CPU completed hypervisor-mode setup.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn guest_regs(&self) -> &GuestRegisters {
        &self.stack.guest_regs
    }

    pub fn guest_regs_mut(&mut self) -> &mut GuestRegisters {
        &mut self.stack.guest_regs
    }

    /// The virtualization control structures, `None` before initialization.
    pub fn virt(&self) -> Option<&VirtControl> {
        self.virt.as_ref()
    }

    pub fn virt_mut(&mut self) -> Option<&mut VirtControl> {
        self.virt.as_mut()
    }

    pub fn iq_completed(&self) -> &AtomicU32 {
        &self.iq_completed
    }

    /// Physical address the IOMMU writes invalidation completions to.
    pub fn iq_completion_paddr<H: PerCpuHal>(&self) -> PhysAddr {
        H::virt_to_phys(VirtAddr::from_usize(
            &self.iq_completed as *const AtomicU32 as usize,
        ))
    }

    /// Count one attempt to drain pending APIC interrupts. Returns `false`
    /// once [`MAX_CLEAR_APIC_IRQS`] attempts were made.
    pub fn note_clear_apic_irq(&mut self) -> bool {
        if self.num_clear_apic_irqs >= MAX_CLEAR_APIC_IRQS {
            return false;
        }
        self.num_clear_apic_irqs += 1;
        true
    }

    pub fn reset_clear_apic_irqs(&mut self) {
        self.num_clear_apic_irqs = 0;
    }
}
