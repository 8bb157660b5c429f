// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Device emulation seams shared by the emulators and the core: the
//! [`Emulator`] trait, the emulator registry, the per-guest IRQ router and
//! the configuration tree.

#[macro_use]
extern crate log;

pub mod device_tree;
mod emulator;
pub mod interrupt;
mod memory;
mod registry;
mod timer;

pub use hypervisor::{AccessWidth, Endianness, VirqKind};

pub use crate::emulator::{
    dispatch_read, dispatch_write, Emulator, EmulatorError, EmulatorId, Result, SharedWriter,
};
pub use crate::interrupt::{IrqChip, IrqError, IrqLine, IrqRouter, VcpuIrqSink};
pub use crate::memory::{GuestMemoryAccess, GuestMemoryExt, MemoryAccessError};
pub use crate::registry::{EmulatorKind, EmulatorRegistry, ProbeContext, ProbeFn, RegistryError};
pub use crate::timer::{GuestTimerService, TimerCallback, TimerToken};
