//! Control requests issued to a CPU through its public per-CPU state.
//!
//! Requests only record what the target has to do. A request that returns
//! `true` needs the target to be kicked (by an NMI or IPI, sent by the caller)
//! so that it processes its events with [`CpuHandle::check_events`].
//!
//! [`CpuHandle::check_events`]: crate::CpuHandle::check_events

use core::hint::spin_loop;

use axerrno::{ax_err, AxResult};

use crate::percpu::{PublicPerCpu, ShutdownState, StartupVector};

impl<C> PublicPerCpu<C> {
    /// Instruct the CPU to suspend. Returns `true` if the CPU is not yet
    /// suspended and has to be kicked.
    pub fn request_suspend(&self) -> bool {
        let mut control = self.control.lock();
        control.suspend_cpu = true;
        let kick = !self.is_suspended();
        trace!("CPU {} suspend requested", self.cpu_id());
        kick
    }

    /// Spin until the CPU reports being suspended.
    ///
    /// The flag is read without the control lock. There is no timeout.
    pub fn wait_suspended(&self) {
        while !self.is_suspended() {
            spin_loop();
        }
    }

    /// Suspend the CPU and wait until it is parked. `kick` is called if the
    /// CPU has to be interrupted to notice the request.
    pub fn suspend<F: FnOnce(&Self)>(&self, kick: F) {
        if self.request_suspend() {
            kick(self);
        }
        self.wait_suspended();
    }

    /// Let a suspended CPU continue.
    pub fn resume(&self) {
        self.control.lock().suspend_cpu = false;
        trace!("CPU {} resumed", self.cpu_id());
    }

    /// Signal INIT. Ignored while the CPU already waits for a startup IPI.
    /// Returns `true` if the CPU has to be kicked.
    pub fn send_init(&self) -> bool {
        let mut control = self.control.lock();
        if control.wait_for_sipi {
            return false;
        }
        control.init_signaled = true;
        trace!("CPU {} INIT signaled", self.cpu_id());
        true
    }

    /// Deliver a startup IPI. Ignored unless the CPU waits for one. Returns
    /// `true` if the CPU has to be kicked.
    pub fn send_sipi(&self, vector: u8) -> bool {
        let mut control = self.control.lock();
        if !control.wait_for_sipi {
            return false;
        }
        control.sipi_vector = Some(StartupVector::Sipi(vector));
        trace!("CPU {} SIPI {:#x} pending", self.cpu_id(), vector);
        true
    }

    /// Restart a suspended CPU at its reset entry.
    pub fn reset(&self) {
        let mut control = self.control.lock();
        control.sipi_vector = Some(StartupVector::BspReset);
        control.suspend_cpu = false;
        trace!("CPU {} reset", self.cpu_id());
    }

    /// Move a suspended CPU into the wait-for-SIPI state.
    pub fn park(&self) {
        let mut control = self.control.lock();
        control.init_signaled = true;
        control.suspend_cpu = false;
        trace!("CPU {} parked", self.cpu_id());
    }

    /// Request a flush of the CPU's guest-physical translation caches.
    pub fn request_cache_flush(&self) {
        self.control.lock().flush_vcpu_caches = true;
    }

    /// Request the CPU to reload its cache allocation (CAT) settings.
    pub fn request_cat_update(&self) {
        self.control.lock().update_cat = true;
    }

    /// Mark the CPU as having violated a cell boundary or failed in guest
    /// mode.
    pub fn mark_failed(&self) {
        self.control.lock().failed = true;
        warn!("CPU {} failed", self.cpu_id());
    }

    /// Clear the failure mark, e.g. when the owning cell is restarted.
    pub fn clear_failed(&self) {
        self.control.lock().failed = false;
    }

    pub fn failed(&self) -> bool {
        self.control.lock().failed
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.control.lock().shutdown_state
    }

    /// Start the shutdown of the CPU if none was started. Returns the
    /// resulting state.
    pub fn begin_shutdown(&self) -> ShutdownState {
        let mut control = self.control.lock();
        if control.shutdown_state == ShutdownState::None {
            control.shutdown_state = ShutdownState::Started;
            debug!("CPU {} shutdown started", self.cpu_id());
        }
        control.shutdown_state
    }

    /// Record a failed shutdown with the negative error `code`.
    ///
    /// The first recorded failure sticks: later calls leave it in place and
    /// return it.
    pub fn fail_shutdown(&self, code: i32) -> AxResult<ShutdownState> {
        if code >= 0 {
            return ax_err!(
                InvalidInput,
                format!("shutdown error code {} is not negative", code)
            );
        }
        let mut control = self.control.lock();
        if !matches!(control.shutdown_state, ShutdownState::Failed(_)) {
            control.shutdown_state = ShutdownState::Failed(code);
            warn!("CPU {} shutdown failed: {}", self.cpu_id(), code);
        }
        Ok(control.shutdown_state)
    }
}
