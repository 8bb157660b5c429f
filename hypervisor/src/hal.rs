// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::fmt;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arch::ArchVcpu;
use crate::cpu::{AccessKind, VmExit};

/// Upper bound on host CPUs a `CpuMask` can describe.
pub const MAX_HOST_CPUS: usize = 64;

#[derive(Error, Debug)]
pub enum HalError {
    #[error("Host CPU {0} does not exist")]
    InvalidCpu(usize),
    #[error("Guest virtual address {0:#x} cannot be translated")]
    Translation(u64),
    #[error("Guest execution failed: {0}")]
    GuestExecution(#[source] anyhow::Error),
}

/// Set of host CPUs.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn empty() -> Self {
        CpuMask(0)
    }

    pub fn from_bits(bits: u64) -> Self {
        CpuMask(bits)
    }

    /// All CPUs in `0..count`.
    pub fn first_n(count: usize) -> Self {
        if count >= MAX_HOST_CPUS {
            CpuMask(u64::MAX)
        } else {
            CpuMask((1u64 << count) - 1)
        }
    }

    pub fn single(cpu: usize) -> Self {
        CpuMask(1u64 << (cpu % MAX_HOST_CPUS))
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_HOST_CPUS && self.0 & (1u64 << cpu) != 0
    }

    pub fn set(&mut self, cpu: usize) {
        if cpu < MAX_HOST_CPUS {
            self.0 |= 1u64 << cpu;
        }
    }

    pub fn clear(&mut self, cpu: usize) {
        if cpu < MAX_HOST_CPUS {
            self.0 &= !(1u64 << cpu);
        }
    }

    pub fn and(&self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn first(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_HOST_CPUS).filter(move |cpu| self.contains(*cpu))
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

/// Receives IPIs delivered to a host CPU.
pub trait IpiHandler: Send + Sync {
    fn handle_ipi(&self, cpu: usize);
}

/// Executes guest code on behalf of the hosted HAL.
///
/// `step` runs a bounded burst of guest execution and returns the exit that
/// ended it, or `None` when the burst completed without trapping.
pub trait GuestExecutor: Send + Sync {
    fn step(&self, cpu: usize, vcpu: usize, state: &mut ArchVcpu) -> Option<VmExit>;
}

/// Architecture primitives the core is built on.
pub trait Hal: Send + Sync {
    /// Number of host CPUs.
    fn cpu_count(&self) -> usize;

    /// Host CPU the caller is running on, if it is a host CPU context.
    fn current_cpu(&self) -> Option<usize>;

    /// Make the calling context host CPU `cpu`, or no CPU at all.
    fn bind_current_cpu(&self, _cpu: Option<usize>) {}

    /// Send a rescheduling IPI to `cpu`.
    fn send_ipi(&self, cpu: usize);

    /// Consume a pending IPI for `cpu`, returning whether one was pending.
    fn take_ipi(&self, cpu: usize) -> bool;

    /// Install the callback run when an IPI reaches a CPU.
    fn set_ipi_handler(&self, handler: Arc<dyn IpiHandler>);

    /// Invalidate stage-2 translations of `vmid` on `cpus`; all of them when
    /// `ipa` is `None`.
    fn flush_stage2_tlb(&self, cpus: CpuMask, vmid: u32, ipa: Option<u64>);

    /// Full memory barrier.
    fn memory_barrier(&self) {
        fence(Ordering::SeqCst);
    }

    /// Free running monotonic clock in nanoseconds.
    fn monotonic_ns(&self) -> u64;

    /// Enter the guest described by `state` on `cpu` until it exits.
    fn run_vcpu(
        &self,
        cpu: usize,
        vcpu: usize,
        state: &Mutex<ArchVcpu>,
    ) -> Result<VmExit, HalError>;

    /// Stage-1 translation of a guest virtual address.
    fn translate_guest_va(
        &self,
        state: &ArchVcpu,
        va: u64,
        access: AccessKind,
    ) -> Result<u64, HalError>;
}
