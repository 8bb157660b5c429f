// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//

//! Per-architecture capability layer.
//!
//! Each architecture is one variant of [`ArchVcpu`]; the trap dispatcher only
//! talks to the methods below and never looks inside a variant.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod aarch64;
pub mod arm;
pub mod emulator;
pub mod riscv64;
pub mod x86;

use crate::arch::emulator::{EmulationResult, Endianness, PlatformEmulator};
use crate::cpu::{
    AbortKind, Fault, HypervisorCpuError, PortIo, Stage2Fault, SysRegError, SysRegId, TrapInfo,
};
pub use x86::PortIoBus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Arm32,
    Aarch64,
    #[serde(rename = "x86_64")]
    X86_64,
    Riscv64,
}

impl Arch {
    pub fn parse(name: &str) -> Option<Arch> {
        match name {
            "arm" | "arm32" | "armv7" => Some(Arch::Arm32),
            "arm64" | "aarch64" | "armv8" => Some(Arch::Aarch64),
            "x86" | "x86_64" | "amd64" => Some(Arch::X86_64),
            "riscv" | "riscv64" => Some(Arch::Riscv64),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Arch::Arm32 => "arm32",
            Arch::Aarch64 => "aarch64",
            Arch::X86_64 => "x86_64",
            Arch::Riscv64 => "riscv64",
        };
        write!(f, "{}", name)
    }
}

/// Virtual interrupt input of a VCPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VirqKind {
    /// Normal interrupt line (ARM IRQ, x86 INTR, RISC-V supervisor external).
    Irq,
    /// ARM FIQ.
    Fiq,
    /// RISC-V supervisor timer.
    Timer,
    /// RISC-V supervisor software.
    Software,
}

/// Synchronous exception raised into the guest at its current privilege level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestException {
    Undefined {
        instruction_len: u64,
    },
    DataAbort {
        va: u64,
        ipa: u64,
        write: bool,
        kind: AbortKind,
    },
    PrefetchAbort {
        va: u64,
        kind: AbortKind,
    },
}

#[derive(Clone, Debug)]
pub enum ArchVcpu {
    Arm32(arm::Arm32Vcpu),
    Aarch64(aarch64::Aarch64Vcpu),
    X86_64(x86::X86Vcpu),
    Riscv64(riscv64::RiscvVcpu),
}

impl ArchVcpu {
    pub fn new(arch: Arch, subid: usize, start_pc: u64) -> Self {
        match arch {
            Arch::Arm32 => ArchVcpu::Arm32(arm::Arm32Vcpu::new(subid, start_pc)),
            Arch::Aarch64 => ArchVcpu::Aarch64(aarch64::Aarch64Vcpu::new(subid, start_pc)),
            Arch::X86_64 => ArchVcpu::X86_64(x86::X86Vcpu::new(subid, start_pc)),
            Arch::Riscv64 => ArchVcpu::Riscv64(riscv64::RiscvVcpu::new(subid, start_pc)),
        }
    }

    pub fn arch(&self) -> Arch {
        match self {
            ArchVcpu::Arm32(_) => Arch::Arm32,
            ArchVcpu::Aarch64(_) => Arch::Aarch64,
            ArchVcpu::X86_64(_) => Arch::X86_64,
            ArchVcpu::Riscv64(_) => Arch::Riscv64,
        }
    }

    /// Return the register file to its power-on state.
    pub fn reset(&mut self, start_pc: u64) {
        match self {
            ArchVcpu::Arm32(v) => v.reset(start_pc),
            ArchVcpu::Aarch64(v) => v.reset(start_pc),
            ArchVcpu::X86_64(v) => v.reset(start_pc),
            ArchVcpu::Riscv64(v) => v.reset(start_pc),
        }
    }

    pub fn decode_fault(&self, trap: &TrapInfo) -> Result<Fault, HypervisorCpuError> {
        match (self, trap) {
            (ArchVcpu::Arm32(v), TrapInfo::Arm32 { .. }) => Ok(v.decode_fault(trap)),
            (ArchVcpu::Aarch64(v), TrapInfo::Aarch64 { .. }) => Ok(v.decode_fault(trap)),
            (ArchVcpu::X86_64(v), TrapInfo::X86 { .. }) => Ok(v.decode_fault(trap)),
            (ArchVcpu::Riscv64(v), TrapInfo::Riscv { .. }) => Ok(v.decode_fault(trap)),
            _ => Err(HypervisorCpuError::ArchMismatch),
        }
    }

    pub fn read_gpr(&self, reg: usize) -> Result<u64, HypervisorCpuError> {
        match self {
            ArchVcpu::Arm32(v) => v.read_gpr(reg),
            ArchVcpu::Aarch64(v) => v.read_gpr(reg),
            ArchVcpu::X86_64(v) => v.read_gpr(reg),
            ArchVcpu::Riscv64(v) => v.read_gpr(reg),
        }
    }

    pub fn write_gpr(&mut self, reg: usize, value: u64) -> Result<(), HypervisorCpuError> {
        match self {
            ArchVcpu::Arm32(v) => v.write_gpr(reg, value),
            ArchVcpu::Aarch64(v) => v.write_gpr(reg, value),
            ArchVcpu::X86_64(v) => v.write_gpr(reg, value),
            ArchVcpu::Riscv64(v) => v.write_gpr(reg, value),
        }
    }

    pub fn pc(&self) -> u64 {
        match self {
            ArchVcpu::Arm32(v) => u64::from(v.regs.pc),
            ArchVcpu::Aarch64(v) => v.pc,
            ArchVcpu::X86_64(v) => v.regs.rip,
            ArchVcpu::Riscv64(v) => v.pc,
        }
    }

    pub fn set_pc(&mut self, pc: u64) {
        match self {
            ArchVcpu::Arm32(v) => v.regs.pc = pc as u32,
            ArchVcpu::Aarch64(v) => v.pc = pc,
            ArchVcpu::X86_64(v) => v.regs.rip = pc,
            ArchVcpu::Riscv64(v) => v.pc = pc,
        }
    }

    /// Step over a trapped instruction of `len` bytes.
    pub fn advance_pc(&mut self, len: u64) {
        match self {
            ArchVcpu::Arm32(v) => v.advance_pc(len),
            ArchVcpu::Aarch64(v) => v.pc = v.pc.wrapping_add(len),
            ArchVcpu::X86_64(v) => v.regs.rip = v.regs.rip.wrapping_add(len),
            ArchVcpu::Riscv64(v) => v.pc = v.pc.wrapping_add(len),
        }
    }

    pub fn inject_sync_exception(&mut self, exception: GuestException) {
        debug!("inject {:?} into {} guest", exception, self.arch());
        match self {
            ArchVcpu::Arm32(v) => v.inject(exception),
            ArchVcpu::Aarch64(v) => v.inject(exception),
            ArchVcpu::X86_64(v) => v.inject(exception),
            ArchVcpu::Riscv64(v) => v.inject(exception),
        }
    }

    pub fn set_pending_virq(&mut self, kind: VirqKind, level: bool) {
        match self {
            ArchVcpu::Arm32(v) => v.set_pending_virq(kind, level),
            ArchVcpu::Aarch64(v) => v.set_pending_virq(kind, level),
            ArchVcpu::X86_64(v) => v.set_pending_virq(kind, level),
            ArchVcpu::Riscv64(v) => v.set_pending_virq(kind, level),
        }
    }

    pub fn virq_pending(&self, kind: VirqKind) -> bool {
        match self {
            ArchVcpu::Arm32(v) => v.virq_pending(kind),
            ArchVcpu::Aarch64(v) => v.virq_pending(kind),
            ArchVcpu::X86_64(v) => v.virq_pending(kind),
            ArchVcpu::Riscv64(v) => v.virq_pending(kind),
        }
    }

    pub fn read_system_reg(&mut self, id: SysRegId) -> Result<u64, SysRegError> {
        match self {
            ArchVcpu::Arm32(v) => v.cp15.read(id),
            ArchVcpu::Aarch64(v) => v.sysregs.read(id),
            ArchVcpu::X86_64(v) => v.read_system_reg(id),
            ArchVcpu::Riscv64(v) => v.read_csr(id),
        }
    }

    pub fn write_system_reg(&mut self, id: SysRegId, value: u64) -> Result<(), SysRegError> {
        match self {
            ArchVcpu::Arm32(v) => v.cp15.write(id, value),
            ArchVcpu::Aarch64(v) => v.sysregs.write(id, value),
            ArchVcpu::X86_64(v) => v.write_system_reg(id, value),
            ArchVcpu::Riscv64(v) => v.write_csr(id, value),
        }
    }

    /// Emulate the data access of the instruction that raised `fault` when
    /// the hardware syndrome does not describe it. Updates registers and PC.
    pub fn emulate_instruction(
        &mut self,
        fault: &Stage2Fault,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<()> {
        match self {
            ArchVcpu::Arm32(v) => v.emulate_instruction(platform),
            ArchVcpu::Aarch64(_) => Err(emulator::EmulationError::UnsupportedInstruction(
                anyhow!("AArch64 data abort at {:#x} without a valid syndrome", fault.ipa),
            )),
            ArchVcpu::X86_64(v) => v.emulate_instruction(platform),
            ArchVcpu::Riscv64(v) => v.emulate_instruction(fault, platform),
        }
    }

    /// Answer a CPUID exit and step over it.
    pub fn emulate_cpuid(&mut self, instruction_len: u64) -> EmulationResult<()> {
        match self {
            ArchVcpu::X86_64(v) => {
                v.cpuid(instruction_len);
                Ok(())
            }
            _ => Err(emulator::EmulationError::UnsupportedInstruction(anyhow!(
                "CPUID on {}",
                self.arch()
            ))),
        }
    }

    /// Complete a port I/O exit and step over it.
    pub fn emulate_port_io(
        &mut self,
        io: &PortIo,
        bus: &mut dyn PortIoBus,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<()> {
        match self {
            ArchVcpu::X86_64(v) => v.port_io(io, bus, platform),
            _ => Err(emulator::EmulationError::UnsupportedInstruction(anyhow!(
                "port I/O on {}",
                self.arch()
            ))),
        }
    }

    /// Byte order of guest data accesses at the current privilege level.
    pub fn endianness(&self) -> Endianness {
        match self {
            ArchVcpu::Arm32(v) => v.endianness(),
            ArchVcpu::Aarch64(v) => v.endianness(),
            ArchVcpu::X86_64(_) | ArchVcpu::Riscv64(_) => Endianness::Little,
        }
    }

    /// Whether the guest's own stage-1 translation is on.
    pub fn mmu_enabled(&self) -> bool {
        match self {
            ArchVcpu::Arm32(v) => v.cp15.sctlr & arm::SCTLR_M != 0,
            ArchVcpu::Aarch64(v) => v.sysregs.sctlr_el1 & aarch64::SCTLR_M != 0,
            ArchVcpu::X86_64(v) => v.sregs.cr0 & x86::CR0_PG != 0,
            ArchVcpu::Riscv64(v) => v.csrs.vsatp >> 60 != 0,
        }
    }

    /// Human readable register dump.
    pub fn dump(&self) -> String {
        match self {
            ArchVcpu::Arm32(v) => v.dump(),
            ArchVcpu::Aarch64(v) => v.dump(),
            ArchVcpu::X86_64(v) => v.dump(),
            ArchVcpu::Riscv64(v) => v.dump(),
        }
    }
}
