// Copyright 2022 Arm Limited (or its affiliates). All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! ARMv8 AArch64 guests at EL1 under an EL2 hypervisor.

pub mod sysreg;

use std::fmt::Write as _;

pub use sysreg::{Aarch64SysRegs, SCTLR_E0E, SCTLR_EE, SCTLR_M};

use crate::arch::arm::stage2_fault_kind;
use crate::arch::emulator::{AccessWidth, Endianness};
use crate::arch::{GuestException, VirqKind};
use crate::cpu::{
    AbortKind, AccessKind, Fault, HypervisorCpuError, MmioSyndrome, Stage2Fault, SysRegAccess,
    SysRegId, TrapInfo, WaitEvent,
};

// ESR_EL2 exception classes
pub const EC_UNKNOWN: u64 = 0x00;
pub const EC_WFX: u64 = 0x01;
pub const EC_HVC64: u64 = 0x16;
pub const EC_SMC64: u64 = 0x17;
pub const EC_SYS64: u64 = 0x18;
pub const EC_IABT_LOW: u64 = 0x20;
pub const EC_IABT_CUR: u64 = 0x21;
pub const EC_DABT_LOW: u64 = 0x24;
pub const EC_DABT_CUR: u64 = 0x25;

pub const ESR_EC_SHIFT: u64 = 26;
pub const ESR_IL: u64 = 1 << 25;
pub const ESR_ISV: u64 = 1 << 24;
pub const ESR_SSE: u64 = 1 << 21;
pub const ESR_SF: u64 = 1 << 15;
pub const ESR_WNR: u64 = 1 << 6;

// PSTATE
pub const PSTATE_MODE_MASK: u64 = 0x1f;
pub const PSTATE_EL0T: u64 = 0x0;
pub const PSTATE_EL1T: u64 = 0x4;
pub const PSTATE_EL1H: u64 = 0x5;
pub const PSTATE_DAIF: u64 = 0x3c0;

const FSC_EXTERNAL: u64 = 0x10;
const FSC_ALIGNMENT: u64 = 0x21;
const FSC_PERMISSION_L3: u64 = 0x0f;
const FSC_TRANSLATION_L3: u64 = 0x07;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct StandardRegisters {
    pub gpr: [u64; 31usize], // 31 General Purpose Registers
    pub sp_el0: u64,         // Stack Pointer for EL0
    pub sp_el1: u64,         // Stack Pointer for EL1
    pub elr_el1: u64,        // Exception Link Register for EL1
    pub spsr_el1: u64,       // Saved Program Status Register for EL1
}

#[derive(Clone, Debug)]
pub struct Aarch64Vcpu {
    pub regs: StandardRegisters,
    pub pc: u64,
    pub pstate: u64,
    pub sysregs: Aarch64SysRegs,
    /// HCR_EL2.VI
    pub virq: bool,
    /// HCR_EL2.VF
    pub vfiq: bool,
}

impl Aarch64Vcpu {
    pub fn new(subid: usize, start_pc: u64) -> Self {
        Aarch64Vcpu {
            regs: StandardRegisters::default(),
            pc: start_pc,
            pstate: PSTATE_EL1H | PSTATE_DAIF,
            sysregs: Aarch64SysRegs::new(subid),
            virq: false,
            vfiq: false,
        }
    }

    pub fn reset(&mut self, start_pc: u64) {
        let mpidr = self.sysregs.mpidr_el1;
        *self = Aarch64Vcpu::new(0, start_pc);
        self.sysregs.mpidr_el1 = mpidr;
    }

    /// Register 31 is XZR in transfer register fields.
    pub fn read_gpr(&self, reg: usize) -> Result<u64, HypervisorCpuError> {
        match reg {
            0..=30 => Ok(self.regs.gpr[reg]),
            31 => Ok(0),
            _ => Err(HypervisorCpuError::InvalidRegister(reg)),
        }
    }

    pub fn write_gpr(&mut self, reg: usize, value: u64) -> Result<(), HypervisorCpuError> {
        match reg {
            0..=30 => {
                self.regs.gpr[reg] = value;
                Ok(())
            }
            31 => Ok(()),
            _ => Err(HypervisorCpuError::InvalidRegister(reg)),
        }
    }

    fn at_el0(&self) -> bool {
        self.pstate & PSTATE_MODE_MASK == PSTATE_EL0T
    }

    pub fn endianness(&self) -> Endianness {
        let bit = if self.at_el0() { SCTLR_E0E } else { SCTLR_EE };
        if self.sysregs.sctlr_el1 & bit != 0 {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    pub fn decode_fault(&self, trap: &TrapInfo) -> Fault {
        let TrapInfo::Aarch64 { esr, far, hpfar } = *trap else {
            return Fault::Unrecoverable("not an AArch64 trap".to_string());
        };

        let ec = (esr >> ESR_EC_SHIFT) & 0x3f;
        let instruction_len = if esr & ESR_IL != 0 { 4 } else { 2 };
        let ipa_page = (hpfar >> 4) << 12;

        match ec {
            EC_UNKNOWN => Fault::Undefined { instruction_len },
            EC_WFX => Fault::Wait {
                event: if esr & 1 != 0 {
                    WaitEvent::Event
                } else {
                    WaitEvent::Interrupt
                },
                instruction_len,
            },
            // ELR_EL2 already points past the HVC.
            EC_HVC64 => Fault::Hypercall {
                imm: esr & 0xffff,
                instruction_len: 0,
            },
            EC_SMC64 => Fault::Hypercall {
                imm: esr & 0xffff,
                instruction_len,
            },
            EC_SYS64 => Fault::SysReg(SysRegAccess {
                id: SysRegId::Aarch64 {
                    op0: ((esr >> 20) & 0x3) as u8,
                    op1: ((esr >> 14) & 0x7) as u8,
                    crn: ((esr >> 10) & 0xf) as u8,
                    crm: ((esr >> 1) & 0xf) as u8,
                    op2: ((esr >> 17) & 0x7) as u8,
                },
                write: esr & 1 == 0,
                rt: ((esr >> 5) & 0x1f) as usize,
                rt2: None,
                csr_op: None,
                instruction_len,
            }),
            EC_IABT_LOW => match stage2_fault_kind(esr as u32) {
                Some(kind) => Fault::Stage2(Stage2Fault {
                    ipa: ipa_page | (far & 0xfff),
                    va: Some(far),
                    access: AccessKind::Execute,
                    kind,
                    syndrome: None,
                    instruction: None,
                }),
                None => Fault::Unrecoverable(format!("instruction abort IFSC {:#x}", esr & 0x3f)),
            },
            EC_DABT_LOW => match stage2_fault_kind(esr as u32) {
                Some(kind) => {
                    let syndrome = if esr & ESR_ISV != 0 {
                        AccessWidth::from_bytes(1 << ((esr >> 22) & 0x3)).map(|width| {
                            MmioSyndrome {
                                width,
                                sign_extend: esr & ESR_SSE != 0,
                                reg: ((esr >> 16) & 0x1f) as usize,
                                sixty_four: esr & ESR_SF != 0,
                                instruction_len,
                            }
                        })
                    } else {
                        None
                    };
                    Fault::Stage2(Stage2Fault {
                        ipa: ipa_page | (far & 0xfff),
                        va: Some(far),
                        access: if esr & ESR_WNR != 0 {
                            AccessKind::Write
                        } else {
                            AccessKind::Read
                        },
                        kind,
                        syndrome,
                        instruction: None,
                    })
                }
                None => Fault::Unrecoverable(format!("data abort DFSC {:#x}", esr & 0x3f)),
            },
            _ => Fault::Unrecoverable(format!("unhandled ESR_EL2 class {:#x}", ec)),
        }
    }

    fn vector_offset(&self) -> u64 {
        match self.pstate & PSTATE_MODE_MASK {
            PSTATE_EL0T => 0x400,
            PSTATE_EL1T => 0x000,
            _ => 0x200,
        }
    }

    fn fault_status(kind: AbortKind) -> u64 {
        match kind {
            AbortKind::External => FSC_EXTERNAL,
            AbortKind::Alignment => FSC_ALIGNMENT,
            AbortKind::Permission => FSC_PERMISSION_L3,
            AbortKind::Translation => FSC_TRANSLATION_L3,
        }
    }

    pub fn inject(&mut self, exception: GuestException) {
        let from_el0 = self.at_el0();
        let esr = match exception {
            GuestException::Undefined { .. } => (EC_UNKNOWN << ESR_EC_SHIFT) | ESR_IL,
            GuestException::DataAbort { va, write, kind, .. } => {
                self.sysregs.far_el1 = va;
                let ec = if from_el0 { EC_DABT_LOW } else { EC_DABT_CUR };
                let wnr = if write { ESR_WNR } else { 0 };
                (ec << ESR_EC_SHIFT) | ESR_IL | wnr | Self::fault_status(kind)
            }
            GuestException::PrefetchAbort { va, kind } => {
                self.sysregs.far_el1 = va;
                let ec = if from_el0 { EC_IABT_LOW } else { EC_IABT_CUR };
                (ec << ESR_EC_SHIFT) | ESR_IL | Self::fault_status(kind)
            }
        };

        let offset = self.vector_offset();
        self.sysregs.esr_el1 = esr;
        self.regs.elr_el1 = self.pc;
        self.regs.spsr_el1 = self.pstate;
        self.pstate = PSTATE_EL1H | PSTATE_DAIF;
        self.pc = self.sysregs.vbar_el1 + offset;
    }

    pub fn set_pending_virq(&mut self, kind: VirqKind, level: bool) {
        match kind {
            VirqKind::Fiq => self.vfiq = level,
            _ => self.virq = level,
        }
    }

    pub fn virq_pending(&self, kind: VirqKind) -> bool {
        match kind {
            VirqKind::Fiq => self.vfiq,
            _ => self.virq,
        }
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, reg) in self.regs.gpr.iter().enumerate() {
            let _ = write!(out, "x{:<2}: {:#018x}", i, reg);
            out.push(if i % 4 == 3 { '\n' } else { ' ' });
        }
        let _ = writeln!(
            out,
            "\npc : {:#018x} pstate: {:#010x} sp_el0: {:#018x} sp_el1: {:#018x}",
            self.pc, self.pstate, self.regs.sp_el0, self.regs.sp_el1
        );
        let _ = writeln!(
            out,
            "sctlr_el1: {:#x} vbar_el1: {:#x} esr_el1: {:#x} far_el1: {:#x}",
            self.sysregs.sctlr_el1,
            self.sysregs.vbar_el1,
            self.sysregs.esr_el1,
            self.sysregs.far_el1
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dabt(iss: u64, far: u64) -> TrapInfo {
        TrapInfo::Aarch64 {
            esr: (EC_DABT_LOW << ESR_EC_SHIFT) | ESR_IL | iss,
            far,
            hpfar: (far >> 12) << 4,
        }
    }

    #[test]
    fn data_abort_syndrome() {
        let vcpu = Aarch64Vcpu::new(0, 0x4008_0000);
        // str x5, [..] 64-bit, translation fault level 2
        let iss = ESR_ISV | (3 << 22) | (5 << 16) | ESR_SF | ESR_WNR | 0x06;
        let Fault::Stage2(f) = vcpu.decode_fault(&dabt(iss, 0x0900_0008)) else {
            panic!("expected a stage-2 fault");
        };
        assert_eq!(f.ipa, 0x0900_0008);
        assert_eq!(f.access, AccessKind::Write);
        let s = f.syndrome.unwrap();
        assert_eq!(s.width, AccessWidth::Double);
        assert_eq!(s.reg, 5);
        assert!(s.sixty_four);
    }

    #[test]
    fn data_abort_without_syndrome() {
        let vcpu = Aarch64Vcpu::new(0, 0);
        let Fault::Stage2(f) = vcpu.decode_fault(&dabt(0x07, 0x0900_0000)) else {
            panic!("expected a stage-2 fault");
        };
        assert!(f.syndrome.is_none());
    }

    #[test]
    fn sys64_decode() {
        let vcpu = Aarch64Vcpu::new(0, 0);
        // mrs x3, sctlr_el1
        let iss = (3 << 20) | (1 << 10) | (3 << 5) | 1;
        let trap = TrapInfo::Aarch64 {
            esr: (EC_SYS64 << ESR_EC_SHIFT) | ESR_IL | iss,
            far: 0,
            hpfar: 0,
        };
        match vcpu.decode_fault(&trap) {
            Fault::SysReg(access) => {
                assert!(!access.write);
                assert_eq!(access.rt, 3);
                assert_eq!(
                    access.id,
                    SysRegId::Aarch64 {
                        op0: 3,
                        op1: 0,
                        crn: 1,
                        crm: 0,
                        op2: 0
                    }
                );
            }
            f => panic!("unexpected {:?}", f),
        }
    }

    #[test]
    fn undefined_to_el1_vector() {
        let mut vcpu = Aarch64Vcpu::new(0, 0x4008_1000);
        vcpu.sysregs.vbar_el1 = 0x4000_0000;
        let old = vcpu.pstate;
        vcpu.inject(GuestException::Undefined { instruction_len: 4 });
        assert_eq!(vcpu.pc, 0x4000_0200);
        assert_eq!(vcpu.regs.elr_el1, 0x4008_1000);
        assert_eq!(vcpu.regs.spsr_el1, old);
        assert_eq!(vcpu.sysregs.esr_el1 >> ESR_EC_SHIFT, EC_UNKNOWN);

        vcpu.pstate = PSTATE_EL0T;
        vcpu.pc = 0x1000;
        vcpu.inject(GuestException::DataAbort {
            va: 0xdead_0000,
            ipa: 0x0a00_0000,
            write: false,
            kind: AbortKind::External,
        });
        assert_eq!(vcpu.pc, 0x4000_0400);
        assert_eq!(vcpu.sysregs.far_el1, 0xdead_0000);
        assert_eq!(vcpu.sysregs.esr_el1 & 0x3f, FSC_EXTERNAL);
        assert_eq!(vcpu.sysregs.esr_el1 >> ESR_EC_SHIFT, EC_DABT_LOW);
    }

    #[test]
    fn xzr_transfer() {
        let mut vcpu = Aarch64Vcpu::new(0, 0);
        vcpu.write_gpr(31, 5).unwrap();
        assert_eq!(vcpu.read_gpr(31).unwrap(), 0);
        assert!(vcpu.read_gpr(32).is_err());
    }
}
