// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxCellCpu - per-CPU control state and page-table primitives for a
//! partitioning hypervisor.
//!
//! This crate provides the two leaf components the control paths of a
//! partitioning hypervisor are built on: the per-level page-table operations a
//! generic walker uses to edit hardware translation structures, and the per-CPU
//! records through which CPUs are suspended, resumed, started and shut down.
//!
//! # Features
//!
//! - Level-polymorphic page-table entry operations, typed per depth and
//!   available as a runtime level table (`paging::x86_64::X86_64_PAGING`)
//! - Per-CPU records split into a cross-CPU control block and a private
//!   execution context
//! - Exclusive per-CPU handles instead of an implicit CPU-local base address
//! - Suspend/resume rendezvous, INIT/SIPI delivery and sticky shutdown state

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

// Core modules
mod context; // CPU-private execution context
mod control; // Cross-CPU control requests
mod cpu; // Per-CPU handle and owner-side event processing
mod events; // Outcome of event processing
mod hal; // Hardware abstraction layer interfaces
pub mod paging; // Page-table entries and level descriptors
mod percpu; // Per-CPU records and the record pool

// Public API exports
pub use context::*; // Execution context layout types
pub use cpu::*; // Per-CPU handle and current-CPU binding
pub use events::{CpuAction, CpuEvents};
pub use hal::PerCpuHal; // Hardware abstraction layer trait
pub use self::percpu::*; // Control block, record and pool
