use crate::percpu::StartupVector;

#[allow(unused_imports)] // used in doc
use super::CpuHandle;

/// What the CPU has to do after [`CpuHandle::check_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuAction {
    /// Continue running the guest.
    Resume,
    /// Stop the guest and wait for a startup IPI.
    ///
    /// Entered after an INIT signal and left by a startup vector.
    Park,
    /// Restart the guest from the given startup vector.
    ///
    /// * for [`StartupVector::Sipi`], at the real-mode entry the vector selects,
    /// * for [`StartupVector::BspReset`], at the architectural reset entry.
    Start(StartupVector),
}

/// The result of [`CpuHandle::check_events`].
///
/// The pending requests have been consumed from the control state; the
/// caller performs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuEvents {
    /// The next execution step of the CPU.
    pub action: CpuAction,
    /// Flush the guest-physical translation caches of this CPU.
    pub flush_vcpu_caches: bool,
    /// Reload the cache allocation (CAT) settings of this CPU.
    pub update_cat: bool,
    /// A hypervisor shutdown is in progress and this CPU has to leave
    /// hypervisor mode.
    pub shutdown: bool,
}
