use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use axerrno::{ax_err, AxResult};
use spin::Mutex;

use crate::context::ExecutionContext;

/// Maximum number of logical CPUs a pool can hold.
pub const MAX_CPUS: usize = 255;

/// Number of statistic counters per CPU.
pub const NUM_CPU_STATS: usize = 12;

/// Statistic counters kept per CPU.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuStat {
    VmExitsTotal = 0,
    VmExitsMmio = 1,
    VmExitsManagement = 2,
    VmExitsHypercall = 3,
    VmExitsPio = 4,
    VmExitsXapic = 5,
    VmExitsCr = 6,
    VmExitsCpuid = 7,
    VmExitsXsetbv = 8,
    VmExitsException = 9,
    VmExitsMsrOther = 10,
    VmExitsMsrX2apicIcr = 11,
}

/// A startup request pending for a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupVector {
    /// A startup IPI with the given vector.
    Sipi(u8),
    /// Restart at the reset entry of the bootstrap processor.
    BspReset,
}

/// Progress of the hypervisor shutdown on a CPU.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// No shutdown in progress.
    #[default]
    None,
    /// Shutdown in progress.
    Started,
    /// Shutdown failed with the given negative error code. Never left.
    Failed(i32),
}

/// The control fields of a CPU, guarded by the control lock of its
/// [`PublicPerCpu`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    pub(crate) suspend_cpu: bool,
    pub(crate) wait_for_sipi: bool,
    pub(crate) init_signaled: bool,
    pub(crate) sipi_vector: Option<StartupVector>,
    pub(crate) flush_vcpu_caches: bool,
    pub(crate) update_cat: bool,
    pub(crate) shutdown_state: ShutdownState,
    pub(crate) failed: bool,
}

impl ControlState {
    const fn new() -> Self {
        Self {
            suspend_cpu: false,
            wait_for_sipi: false,
            init_signaled: false,
            sipi_vector: None,
            flush_vcpu_caches: false,
            update_cat: false,
            shutdown_state: ShutdownState::None,
            failed: false,
        }
    }

    /// The CPU is instructed to suspend.
    pub fn suspend_requested(&self) -> bool {
        self.suspend_cpu
    }

    /// The CPU waits for a startup IPI.
    pub fn wait_for_sipi(&self) -> bool {
        self.wait_for_sipi
    }

    /// An INIT signal is pending.
    pub fn init_signaled(&self) -> bool {
        self.init_signaled
    }

    pub fn pending_startup(&self) -> Option<StartupVector> {
        self.sipi_vector
    }

    /// A flush of the guest-physical translation caches is pending.
    pub fn flush_vcpu_caches(&self) -> bool {
        self.flush_vcpu_caches
    }

    /// A cache allocation (CAT) update is pending.
    pub fn update_cat(&self) -> bool {
        self.update_cat
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown_state
    }

    pub fn failed(&self) -> bool {
        self.failed
    }
}

/// Per-CPU state accessible from all CPUs.
///
/// All control fields live in [`ControlState`] behind the control lock. The
/// only exception is the `suspended` flag: it is written by the owning CPU
/// alone and may be spun on by any other CPU without taking the lock.
#[repr(C, align(4096))]
pub struct PublicPerCpu<C> {
    /// Logical CPU ID.
    cpu_id: usize,
    /// Physical APIC ID.
    apic_id: AtomicU32,
    /// Owning cell, null if the CPU is unowned.
    cell: AtomicPtr<C>,
    stats: [AtomicU32; NUM_CPU_STATS],
    pub(crate) control: Mutex<ControlState>,
    suspended: AtomicBool,
}

impl<C> PublicPerCpu<C> {
    const fn new(cpu_id: usize) -> Self {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self {
            cpu_id,
            apic_id: AtomicU32::new(0),
            cell: AtomicPtr::new(ptr::null_mut()),
            stats: [ZERO; NUM_CPU_STATS],
            control: Mutex::new(ControlState::new()),
            suspended: AtomicBool::new(false),
        }
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    pub fn apic_id(&self) -> u32 {
        self.apic_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_apic_id(&self, apic_id: u32) {
        self.apic_id.store(apic_id, Ordering::Release);
    }

    /// Increase a statistic counter by one.
    pub fn stat_inc(&self, stat: CpuStat) {
        self.stats[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn stat(&self, stat: CpuStat) -> u32 {
        self.stats[stat as usize].load(Ordering::Relaxed)
    }

    /// A snapshot of all statistic counters, indexed by [`CpuStat`].
    pub fn stats(&self) -> [u32; NUM_CPU_STATS] {
        let mut stats = [0; NUM_CPU_STATS];
        for (value, counter) in stats.iter_mut().zip(&self.stats) {
            *value = counter.load(Ordering::Relaxed);
        }
        stats
    }

    pub fn reset_stats(&self) {
        for counter in &self.stats {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// A consistent copy of the control fields, taken under the lock.
    pub fn control(&self) -> ControlState {
        *self.control.lock()
    }

    /// Whether the CPU is parked in the suspended state. Lock-free.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Only called by the owning CPU.
    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    /// Back to the zeroed, unowned state.
    pub(crate) fn wipe(&self) {
        *self.control.lock() = ControlState::new();
        self.cell.store(ptr::null_mut(), Ordering::Release);
        self.apic_id.store(0, Ordering::Release);
        self.suspended.store(false, Ordering::Release);
        self.reset_stats();
    }
}

impl<C: Sync + 'static> PublicPerCpu<C> {
    /// The cell owning this CPU.
    pub fn cell(&self) -> Option<&'static C> {
        // SAFETY: only null or pointers derived from `&'static C` are stored.
        unsafe { self.cell.load(Ordering::Acquire).as_ref() }
    }

    /// Assign the CPU to `cell`, or mark it unowned.
    pub fn set_cell(&self, cell: Option<&'static C>) {
        let ptr = cell.map_or(ptr::null_mut(), |cell| cell as *const C as *mut C);
        self.cell.store(ptr, Ordering::Release);
    }
}

/// The complete per-CPU record: the private execution context followed by
/// the public control block at a page-aligned offset.
#[repr(C, align(4096))]
pub struct PerCpu<C> {
    pub(crate) context: UnsafeCell<ExecutionContext>,
    pub(crate) public: PublicPerCpu<C>,
}

// SAFETY: the execution context is only reachable through the unique
// `CpuHandle` of the record or through `unsafe` accessors; everything else is
// synchronized by atomics or the control lock.
unsafe impl<C: Sync> Sync for PerCpu<C> {}

impl<C> PerCpu<C> {
    fn new(cpu_id: usize) -> Self {
        Self {
            context: UnsafeCell::new(ExecutionContext::new()),
            public: PublicPerCpu::new(cpu_id),
        }
    }

    pub fn cpu_id(&self) -> usize {
        self.public.cpu_id
    }

    /// The part of the record other CPUs may use.
    pub fn public(&self) -> &PublicPerCpu<C> {
        &self.public
    }

    /// The private execution context.
    ///
    /// # Safety
    ///
    /// The caller must be the owning CPU, or the owning CPU must be stopped so
    /// that the context is not mutated concurrently.
    pub unsafe fn context(&self) -> &ExecutionContext {
        &*self.context.get()
    }

    /// The mutable private execution context.
    ///
    /// # Safety
    ///
    /// Same as [`PerCpu::context`], and no other reference to the context may
    /// be alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn context_mut(&self) -> &mut ExecutionContext {
        &mut *self.context.get()
    }
}

/// Per-CPU records of all logical CPUs, indexed by CPU ID.
///
/// Recommended usage:
/// - Allocate the pool once when the hypervisor is loaded:
///
///   ```ignore
///   let pool = PerCpuPool::<Cell>::new(num_cpus)?;
///   ```
///
/// - Then hand each CPU the handle of its own record:
///
///   ```ignore
///   let mut cpu = pool.claim(cpu_id)?;
///   cpu.init(CpuInitConfig { apic_id, extension: VirtExtension::Vmx })?;
///   ```
pub struct PerCpuPool<C> {
    records: Box<[PerCpu<C>]>,
    /// One flag per record, set while a [`CpuHandle`](crate::CpuHandle)
    /// exists. Kept outside the page-aligned records.
    claimed: Box<[AtomicBool]>,
}

impl<C> PerCpuPool<C> {
    /// Allocate zeroed records for `num_cpus` CPUs.
    pub fn new(num_cpus: usize) -> AxResult<Self> {
        if num_cpus == 0 || num_cpus > MAX_CPUS {
            return ax_err!(
                InvalidInput,
                format!("CPU count {} not in 1..={}", num_cpus, MAX_CPUS)
            );
        }
        let records: Vec<PerCpu<C>> = (0..num_cpus).map(PerCpu::new).collect();
        debug!("allocated per-CPU records for {} CPUs", num_cpus);
        let claimed: Vec<AtomicBool> = (0..num_cpus)
            .map(|_| AtomicBool::new(false))
            .collect();
        Ok(Self {
            records: records.into_boxed_slice(),
            claimed: claimed.into_boxed_slice(),
        })
    }

    pub fn num_cpus(&self) -> usize {
        self.records.len()
    }

    /// The record of `cpu_id`. Panics if `cpu_id` is out of range.
    pub fn record(&self, cpu_id: usize) -> &PerCpu<C> {
        assert!(
            cpu_id < self.records.len(),
            "CPU ID {} out of range",
            cpu_id
        );
        &self.records[cpu_id]
    }

    pub fn get(&self, cpu_id: usize) -> Option<&PerCpu<C>> {
        self.records.get(cpu_id)
    }

    /// The public part of the record of `cpu_id`. Panics if `cpu_id` is out of
    /// range.
    pub fn public(&self, cpu_id: usize) -> &PublicPerCpu<C> {
        &self.record(cpu_id).public
    }

    pub fn get_public(&self, cpu_id: usize) -> Option<&PublicPerCpu<C>> {
        self.get(cpu_id).map(PerCpu::public)
    }

    pub fn iter_public(&self) -> impl Iterator<Item = &PublicPerCpu<C>> {
        self.records.iter().map(PerCpu::public)
    }

    /// Whether a [`CpuHandle`](crate::CpuHandle) for `cpu_id` exists.
    pub fn is_claimed(&self, cpu_id: usize) -> bool {
        self.claimed
            .get(cpu_id)
            .is_some_and(|claimed| claimed.load(Ordering::Acquire))
    }

    pub(crate) fn claim_flag(&self, cpu_id: usize) -> Option<&AtomicBool> {
        self.claimed.get(cpu_id)
    }
}
