// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arch::emulator::AccessWidth;

#[derive(Error, Debug)]
///
/// Enum for CPU error
pub enum HypervisorCpuError {
    ///
    /// The trap descriptor does not belong to this VCPU's architecture
    ///
    #[error("Trap descriptor does not match the VCPU architecture")]
    ArchMismatch,
    ///
    /// Invalid general purpose register index
    ///
    #[error("Invalid general purpose register r{0}")]
    InvalidRegister(usize),
    ///
    /// Running Vcpu error
    ///
    #[error("Failed to run vcpu: {0}")]
    RunVcpu(#[source] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum SysRegError {
    /// The encoding is not in the emulated register table.
    #[error("Unknown system register {0:?}")]
    Unknown(SysRegId),
    /// Write to a read-only register.
    #[error("System register {0:?} is read-only")]
    ReadOnly(SysRegId),
}

/// Raw per-architecture fault descriptors handed over by the HAL on a trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapInfo {
    /// ARMv7 hyp trap: HSR, HDFAR, HIFAR, HPFAR.
    Arm32 {
        hsr: u32,
        hdfar: u32,
        hifar: u32,
        hpfar: u32,
    },
    /// ARMv8 EL2 trap: ESR_EL2, FAR_EL2, HPFAR_EL2.
    Aarch64 { esr: u64, far: u64, hpfar: u64 },
    /// VMX exit: basic exit reason and exit information fields.
    X86 {
        reason: u32,
        qualification: u64,
        guest_linear: u64,
        guest_physical: u64,
        instruction_len: u32,
    },
    /// RISC-V HS-mode trap: scause, stval, htval, htinst.
    Riscv {
        scause: u64,
        stval: u64,
        htval: u64,
        htinst: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmExit {
    /// Synchronous trap from the guest.
    Trap(TrapInfo),
    /// A host interrupt arrived while the guest was running.
    Irq,
    /// An inter-processor interrupt asked this host CPU to reschedule.
    Ipi,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage2FaultKind {
    Translation,
    AccessFlag,
    Permission,
}

/// Access decoded by hardware from the fault syndrome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmioSyndrome {
    pub width: AccessWidth,
    pub sign_extend: bool,
    /// Transfer register.
    pub reg: usize,
    /// Destination register is 64 bits wide (AArch64 SF).
    pub sixty_four: bool,
    pub instruction_len: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stage2Fault {
    pub ipa: u64,
    /// Guest virtual address, when the trap reports one.
    pub va: Option<u64>,
    pub access: AccessKind,
    pub kind: Stage2FaultKind,
    pub syndrome: Option<MmioSyndrome>,
    /// Transformed instruction reported by the trap (RISC-V htinst).
    pub instruction: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SysRegId {
    /// MCR/MRC p15, opc1, <Rt>, CRn, CRm, opc2
    Cp15 { opc1: u8, crn: u8, crm: u8, opc2: u8 },
    /// MCRR/MRRC p15, opc1, <Rt>, <Rt2>, CRm
    Cp15Wide { opc1: u8, crm: u8 },
    /// MSR/MRS op0, op1, CRn, CRm, op2
    Aarch64 {
        op0: u8,
        op1: u8,
        crn: u8,
        crm: u8,
        op2: u8,
    },
    /// x86 model specific register
    Msr(u32),
    /// x86 control register
    Cr(u8),
    /// RISC-V control and status register
    Csr(u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SysRegAccess {
    pub id: SysRegId,
    pub write: bool,
    pub rt: usize,
    /// Second transfer register for 64-bit coprocessor moves and RDMSR/WRMSR.
    pub rt2: Option<usize>,
    /// RISC-V CSR instruction function and source operand.
    pub csr_op: Option<(u8, u64)>,
    pub instruction_len: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortIo {
    pub port: u16,
    pub width: AccessWidth,
    pub write: bool,
    pub string: bool,
    pub rep: bool,
    pub instruction_len: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitEvent {
    Interrupt,
    Event,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortKind {
    /// Access to an address with no backing.
    External,
    Alignment,
    Permission,
    Translation,
}

/// A trap classified by the architecture layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    Stage2(Stage2Fault),
    Wait {
        event: WaitEvent,
        instruction_len: u64,
    },
    Hypercall {
        imm: u64,
        instruction_len: u64,
    },
    SysReg(SysRegAccess),
    PortIo(PortIo),
    Cpuid {
        instruction_len: u64,
    },
    /// Host interrupt exit; no guest state to update.
    Interrupt,
    /// Trapped instruction failed its condition check: skip it.
    ConditionFailed {
        instruction_len: u64,
    },
    /// The guest executed something the hypervisor cannot emulate and the
    /// architecture can report as an undefined instruction.
    Undefined {
        instruction_len: u64,
    },
    /// The trap cannot be expressed as a guest fault.
    Unrecoverable(String),
}
