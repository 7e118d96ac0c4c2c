use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::{ax_err, AxResult};

use crate::context::{ExecutionContext, VirtExtension};
use crate::events::{CpuAction, CpuEvents};
use crate::percpu::{CpuStat, PerCpu, PerCpuPool, PublicPerCpu, ShutdownState};

/// Configuration applied when a CPU enters hypervisor mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInitConfig {
    /// Physical APIC ID of the CPU.
    pub apic_id: u32,
    /// The virtualization extension whose control structures the CPU uses.
    pub extension: VirtExtension,
}

/// Exclusive access of one CPU to its own per-CPU record.
///
/// At most one handle exists per record; it is obtained with
/// [`PerCpuPool::claim`] and gives the owner mutable access to the private
/// [`ExecutionContext`]. Dropping the handle returns the claim, not the state.
pub struct CpuHandle<'a, C> {
    record: &'a PerCpu<C>,
    claimed: &'a AtomicBool,
}

impl<C> PerCpuPool<C> {
    /// Take the handle of the record of `cpu_id`.
    pub fn claim(&self, cpu_id: usize) -> AxResult<CpuHandle<'_, C>> {
        let (Some(record), Some(claimed)) = (self.get(cpu_id), self.claim_flag(cpu_id)) else {
            return ax_err!(InvalidInput, format!("CPU ID {} out of range", cpu_id));
        };
        if claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ax_err!(BadState, format!("CPU {} is already claimed", cpu_id));
        }
        Ok(CpuHandle { record, claimed })
    }
}

impl<'a, C> CpuHandle<'a, C> {
    /// The execution context of this CPU.
    pub fn current(&self) -> &ExecutionContext {
        // SAFETY: the handle is the only safe way to reach the context.
        unsafe { self.record.context() }
    }

    pub fn current_mut(&mut self) -> &mut ExecutionContext {
        // SAFETY: `&mut self` on the unique handle excludes other references.
        unsafe { self.record.context_mut() }
    }

    /// The logical ID of this CPU.
    pub fn current_id(&self) -> usize {
        self.record.cpu_id()
    }

    pub fn public(&self) -> &'a PublicPerCpu<C> {
        self.record.public()
    }

    pub fn record(&self) -> &'a PerCpu<C> {
        self.record
    }

    /// Increase a statistic counter of this CPU.
    pub fn stat_inc(&self, stat: CpuStat) {
        self.public().stat_inc(stat);
    }

    /// Mark the record initialized once the CPU completed its hypervisor-mode
    /// setup.
    pub fn init(&mut self, config: CpuInitConfig) -> AxResult {
        self.current_mut().init(config.extension)?;
        self.public().set_apic_id(config.apic_id);
        debug!(
            "CPU {} initialized: APIC ID {}, {:?}",
            self.current_id(),
            config.apic_id,
            config.extension
        );
        Ok(())
    }

    /// Return the record to the zeroed, unowned state, e.g. when the CPU is
    /// handed back to the host.
    pub fn release(&mut self) {
        self.current_mut().wipe();
        self.public().wipe();
        debug!("CPU {} released", self.current_id());
    }

    /// Process the pending control requests of this CPU.
    ///
    /// If a suspension was requested, the CPU reports itself suspended and
    /// spins until it is resumed. INIT, startup vectors, cache flush and
    /// CAT update requests are consumed and handed to the caller.
    pub fn check_events(&self) -> CpuEvents {
        let public = self.public();
        let mut startup = None;
        let mut control = public.control.lock();

        loop {
            if control.init_signaled && !control.suspend_cpu {
                control.init_signaled = false;
                control.wait_for_sipi = true;
                startup = None;
                break;
            }

            if control.suspend_cpu {
                public.set_suspended(true);
                drop(control);
                trace!("CPU {} suspended", self.current_id());

                // A resume may be followed by a new suspend before the lock is
                // retaken; `suspended` must stay set across it.
                control = loop {
                    while public.control.lock().suspend_cpu {
                        spin_loop();
                    }
                    let relocked = public.control.lock();
                    if !relocked.suspend_cpu {
                        break relocked;
                    }
                };
                public.set_suspended(false);
            }

            if let Some(vector) = control.sipi_vector.take() {
                // A failed CPU stays parked until its cell is restarted.
                if !control.failed {
                    control.wait_for_sipi = false;
                    startup = Some(vector);
                }
            }

            if !control.init_signaled {
                break;
            }
        }

        let action = match startup {
            _ if control.wait_for_sipi => CpuAction::Park,
            Some(vector) => CpuAction::Start(vector),
            None => CpuAction::Resume,
        };
        CpuEvents {
            action,
            flush_vcpu_caches: core::mem::take(&mut control.flush_vcpu_caches),
            update_cat: core::mem::take(&mut control.update_cat),
            shutdown: control.shutdown_state == ShutdownState::Started,
        }
    }

    /// Execute a block with the current CPU set to this record.
    ///
    /// The bound record is passed to `f` and cannot outlive the binding.
    pub fn with_current_cpu_set<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&PerCpu<C>) -> T,
    {
        if unsafe { get_current_cpu::<C>() }.is_some() {
            panic!("Nested per-CPU binding is not allowed!");
        } else {
            unsafe {
                set_current_cpu(self.record);
            }
            let result = f(self.record);
            unsafe {
                clear_current_cpu();
            }
            result
        }
    }
}

impl<C: Sync + 'static> CpuHandle<'_, C> {
    /// The cell owning this CPU.
    pub fn current_cell(&self) -> Option<&'static C> {
        self.public().cell()
    }
}

impl<C> Drop for CpuHandle<'_, C> {
    fn drop(&mut self) {
        self.claimed.store(false, Ordering::Release);
    }
}

#[::percpu::def_percpu]
static mut CURRENT_CPU: Option<*mut u8> = None;

/// Get the per-CPU record bound to the current physical CPU.
///
/// The record is bound while [`CpuHandle::with_current_cpu_set`] runs, so code
/// without access to the handle can find its own record.
///
/// # Safety
///
/// `C` must be the cell type of the pool the bound record belongs to, and the
/// returned reference must not be used after the binding ends.
pub unsafe fn get_current_cpu<'a, C>() -> Option<&'a PerCpu<C>> {
    CURRENT_CPU
        .current_ref_raw()
        .as_ref()
        .copied()
        .and_then(|p| (p as *const PerCpu<C>).as_ref())
}

/// Bind `record` to the current physical CPU.
///
/// # Safety
/// This method is marked as unsafe because it may result in unexpected behavior if not used properly.
/// Do not call this method unless you know what you are doing.
pub unsafe fn set_current_cpu<C>(record: &PerCpu<C>) {
    CURRENT_CPU
        .current_ref_mut_raw()
        .replace(record as *const _ as *mut u8);
}

/// Clear the record bound to the current physical CPU.
///
/// # Safety
/// This method is marked as unsafe because it may result in unexpected behavior if not used properly.
/// Do not call this method unless you know what you are doing.
pub unsafe fn clear_current_cpu() {
    CURRENT_CPU.current_ref_mut_raw().take();
}
