// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//

//! Hardware abstraction for the hypervisor core
//!
//! This crate offers the HAL trait the core runs on, a hosted software
//! implementation of it, and the per-architecture capability layer used by
//! the trap dispatcher.
//!
//! # Platform support
//!
//! - ARM (ARMv7 with virtualization extensions)
//! - AArch64
//! - x86_64 (VMX exit model)
//! - RISC-V 64 (H extension)
//!

#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

/// Architecture specific definitions
pub mod arch;

/// CPU related module
mod cpu;

/// HAL trait and CPU masks
mod hal;

/// Hosted software HAL
pub mod soft;

pub use arch::emulator::{
    AccessWidth, EmulationError, EmulationResult, Endianness, PlatformEmulator, PlatformError,
};
pub use arch::{Arch, ArchVcpu, GuestException, PortIoBus, VirqKind};
pub use cpu::{
    AbortKind, AccessKind, Fault, HypervisorCpuError, MmioSyndrome, PortIo, Stage2Fault,
    Stage2FaultKind, SysRegAccess, SysRegError, SysRegId, TrapInfo, VmExit, WaitEvent,
};
pub use hal::{CpuMask, GuestExecutor, Hal, HalError, IpiHandler, MAX_HOST_CPUS};
pub use soft::SoftHal;
