// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2019 Intel Corporation
//

//! ARMv7 with virtualization extensions.

mod a32;
pub mod cp15;
pub mod regs;
mod t32;

use std::fmt::Write as _;

pub use cp15::{Cp15State, SCTLR_A, SCTLR_EE, SCTLR_M, SCTLR_TE, SCTLR_V};
use regs::*;

use crate::arch::emulator::{
    AccessWidth, EmulationError, EmulationResult, Endianness, PlatformEmulator, PlatformError,
};
use crate::arch::{GuestException, VirqKind};
use crate::cpu::{
    AbortKind, AccessKind, Fault, HypervisorCpuError, MmioSyndrome, Stage2Fault,
    Stage2FaultKind, SysRegAccess, SysRegId, TrapInfo, WaitEvent,
};

// HSR exception classes
pub const EC_UNKNOWN: u32 = 0x00;
pub const EC_WFI_WFE: u32 = 0x01;
pub const EC_CP15_32: u32 = 0x03;
pub const EC_CP15_64: u32 = 0x04;
pub const EC_CP14_32: u32 = 0x05;
pub const EC_CP14_LS: u32 = 0x06;
pub const EC_CP10: u32 = 0x07;
pub const EC_CP14_64: u32 = 0x0c;
pub const EC_HVC: u32 = 0x12;
pub const EC_PABT_LOW: u32 = 0x20;
pub const EC_DABT_LOW: u32 = 0x24;

pub const HSR_EC_SHIFT: u32 = 26;
pub const HSR_IL: u32 = 1 << 25;
pub const HSR_ISV: u32 = 1 << 24;
pub const HSR_SSE: u32 = 1 << 21;
pub const HSR_WNR: u32 = 1 << 6;

const HIGH_VECTORS: u32 = 0xffff_0000;
const VECTOR_UND: u32 = 0x04;
const VECTOR_PABT: u32 = 0x0c;
const VECTOR_DABT: u32 = 0x10;

/// Stage-2 fault status from an LPAE-format DFSC/IFSC.
pub(crate) fn stage2_fault_kind(fsc: u32) -> Option<Stage2FaultKind> {
    match fsc & 0x3c {
        0x04 => Some(Stage2FaultKind::Translation),
        0x08 => Some(Stage2FaultKind::AccessFlag),
        0x0c => Some(Stage2FaultKind::Permission),
        _ => None,
    }
}

#[derive(Clone, Debug)]
pub struct Arm32Vcpu {
    pub regs: Arm32Regs,
    pub cp15: Cp15State,
    /// HCR.VI
    pub virq: bool,
    /// HCR.VF
    pub vfiq: bool,
    /// Address tagged by the last LDREX.
    pub exclusive: Option<u32>,
}

impl Arm32Vcpu {
    pub fn new(subid: usize, start_pc: u64) -> Self {
        let mut vcpu = Arm32Vcpu {
            regs: Arm32Regs::default(),
            cp15: Cp15State::new(subid),
            virq: false,
            vfiq: false,
            exclusive: None,
        };
        vcpu.regs.pc = start_pc as u32;
        vcpu
    }

    pub fn reset(&mut self, start_pc: u64) {
        let subid = (self.cp15.mpidr & 0xff) as usize;
        *self = Arm32Vcpu::new(subid, start_pc);
    }

    pub fn read_gpr(&self, reg: usize) -> Result<u64, HypervisorCpuError> {
        if reg > 15 {
            return Err(HypervisorCpuError::InvalidRegister(reg));
        }
        Ok(u64::from(self.regs.get(reg)))
    }

    pub fn write_gpr(&mut self, reg: usize, value: u64) -> Result<(), HypervisorCpuError> {
        if reg > 15 {
            return Err(HypervisorCpuError::InvalidRegister(reg));
        }
        self.regs.set(reg, value as u32);
        Ok(())
    }

    pub fn advance_pc(&mut self, len: u64) {
        self.regs.pc = self.regs.pc.wrapping_add(len as u32);
        if self.regs.thumb() {
            self.regs.advance_itstate();
        }
    }

    pub fn endianness(&self) -> Endianness {
        if self.regs.cpsr & CPSR_E != 0 {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    pub fn decode_fault(&self, trap: &TrapInfo) -> Fault {
        let TrapInfo::Arm32 {
            hsr,
            hdfar,
            hifar,
            hpfar,
        } = *trap
        else {
            return Fault::Unrecoverable("not an ARM32 trap".to_string());
        };

        let ec = hsr >> HSR_EC_SHIFT;
        let instruction_len = if hsr & HSR_IL != 0 { 4 } else { 2 };
        let ipa_page = (u64::from(hpfar) >> 4) << 12;

        if (EC_WFI_WFE..=EC_CP14_64).contains(&ec) && !self.trapped_condition_passed(hsr) {
            return Fault::ConditionFailed { instruction_len };
        }

        match ec {
            EC_UNKNOWN | EC_CP14_32 | EC_CP14_LS | EC_CP10 | EC_CP14_64 => {
                Fault::Undefined { instruction_len }
            }
            EC_WFI_WFE => Fault::Wait {
                event: if hsr & 1 != 0 {
                    WaitEvent::Event
                } else {
                    WaitEvent::Interrupt
                },
                instruction_len,
            },
            EC_CP15_32 => Fault::SysReg(SysRegAccess {
                id: SysRegId::Cp15 {
                    opc1: ((hsr >> 14) & 0x7) as u8,
                    crn: ((hsr >> 10) & 0xf) as u8,
                    crm: ((hsr >> 1) & 0xf) as u8,
                    opc2: ((hsr >> 17) & 0x7) as u8,
                },
                write: hsr & 1 == 0,
                rt: ((hsr >> 5) & 0xf) as usize,
                rt2: None,
                csr_op: None,
                instruction_len,
            }),
            EC_CP15_64 => Fault::SysReg(SysRegAccess {
                id: SysRegId::Cp15Wide {
                    opc1: ((hsr >> 16) & 0xf) as u8,
                    crm: ((hsr >> 1) & 0xf) as u8,
                },
                write: hsr & 1 == 0,
                rt: ((hsr >> 5) & 0xf) as usize,
                rt2: Some(((hsr >> 10) & 0xf) as usize),
                csr_op: None,
                instruction_len,
            }),
            // ELR_hyp already points past the HVC.
            EC_HVC => Fault::Hypercall {
                imm: u64::from(hsr & 0xffff),
                instruction_len: 0,
            },
            EC_PABT_LOW => match stage2_fault_kind(hsr) {
                Some(kind) => Fault::Stage2(Stage2Fault {
                    ipa: ipa_page | u64::from(hifar & 0xfff),
                    va: Some(u64::from(hifar)),
                    access: AccessKind::Execute,
                    kind,
                    syndrome: None,
                    instruction: None,
                }),
                None => Fault::Unrecoverable(format!("prefetch abort IFSC {:#x}", hsr & 0x3f)),
            },
            EC_DABT_LOW => match stage2_fault_kind(hsr) {
                Some(kind) => {
                    let syndrome = if hsr & HSR_ISV != 0 {
                        AccessWidth::from_bytes(1 << ((hsr >> 22) & 0x3)).map(|width| {
                            MmioSyndrome {
                                width,
                                sign_extend: hsr & HSR_SSE != 0,
                                reg: ((hsr >> 16) & 0xf) as usize,
                                sixty_four: false,
                                instruction_len,
                            }
                        })
                    } else {
                        None
                    };
                    Fault::Stage2(Stage2Fault {
                        ipa: ipa_page | u64::from(hdfar & 0xfff),
                        va: Some(u64::from(hdfar)),
                        access: if hsr & HSR_WNR != 0 {
                            AccessKind::Write
                        } else {
                            AccessKind::Read
                        },
                        kind,
                        syndrome,
                        instruction: None,
                    })
                }
                None => Fault::Unrecoverable(format!("data abort DFSC {:#x}", hsr & 0x3f)),
            },
            _ => Fault::Unrecoverable(format!("unhandled HSR class {:#x}", ec)),
        }
    }

    fn trapped_condition_passed(&self, hsr: u32) -> bool {
        let cond = if hsr & (1 << 24) != 0 {
            ((hsr >> 20) & 0xf) as u8
        } else if self.regs.thumb() {
            self.regs.it_condition()
        } else {
            0xe
        };
        self.regs.condition_passed(cond)
    }

    fn vector_base(&self) -> u32 {
        if self.cp15.sctlr & SCTLR_V != 0 {
            HIGH_VECTORS
        } else {
            self.cp15.vbar
        }
    }

    /// Enter `mode` at vector `offset` as the hardware would.
    fn take_exception(&mut self, mode: u32, offset: u32, lr: u32, mask_abort: bool) {
        let old_cpsr = self.regs.cpsr;
        let mut cpsr = old_cpsr & !(CPSR_MODE_MASK | CPSR_IT_MASK | CPSR_J | CPSR_E | CPSR_T);
        cpsr |= mode | CPSR_I;
        if mask_abort {
            cpsr |= CPSR_A;
        }
        if self.cp15.sctlr & SCTLR_TE != 0 {
            cpsr |= CPSR_T;
        }
        if self.cp15.sctlr & SCTLR_EE != 0 {
            cpsr |= CPSR_E;
        }
        self.regs.set_spsr_of(mode, old_cpsr);
        self.regs.set_lr_of(mode, lr);
        self.regs.pc = self.vector_base().wrapping_add(offset);
        self.regs.cpsr = cpsr;
    }

    fn fault_status(&self, kind: AbortKind) -> u32 {
        let lpae = self.cp15.ttbcr & (1 << 31) != 0;
        match (lpae, kind) {
            (true, AbortKind::External) => (1 << 9) | 0x10,
            (true, AbortKind::Alignment) => (1 << 9) | 0x21,
            (true, AbortKind::Permission) => (1 << 9) | 0x0f,
            (true, AbortKind::Translation) => (1 << 9) | 0x07,
            (false, AbortKind::External) => 0x08,
            (false, AbortKind::Alignment) => 0x01,
            (false, AbortKind::Permission) => 0x0d,
            (false, AbortKind::Translation) => 0x05,
        }
    }

    pub fn inject(&mut self, exception: GuestException) {
        let pc = self.regs.pc;
        let thumb = self.regs.thumb();
        match exception {
            GuestException::Undefined { .. } => {
                let lr = pc.wrapping_add(if thumb { 2 } else { 4 });
                self.take_exception(MODE_UND, VECTOR_UND, lr, false);
            }
            GuestException::DataAbort { va, write, kind, .. } => {
                self.cp15.dfar = va as u32;
                self.cp15.dfsr = self.fault_status(kind) | if write { 1 << 11 } else { 0 };
                self.take_exception(MODE_ABT, VECTOR_DABT, pc.wrapping_add(8), true);
            }
            GuestException::PrefetchAbort { va, kind } => {
                self.cp15.ifar = va as u32;
                self.cp15.ifsr = self.fault_status(kind);
                self.take_exception(MODE_ABT, VECTOR_PABT, pc.wrapping_add(4), true);
            }
        }
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

    /// Register value as an instruction operand: PC reads ahead.
    fn operand(&self, reg: usize) -> u32 {
        if reg == 15 {
            self.regs
                .pc
                .wrapping_add(if self.regs.thumb() { 4 } else { 8 })
        } else {
            self.regs.get(reg)
        }
    }

    fn carry(&self) -> bool {
        self.regs.cpsr & CPSR_C != 0
    }

    fn check_alignment(&self, addr: u32, align: u32, always: bool) -> EmulationResult<()> {
        let strict = always || self.cp15.sctlr & SCTLR_A != 0;
        if strict && align > 1 && addr % align != 0 {
            return Err(EmulationError::PlatformEmulationError(
                PlatformError::Alignment(u64::from(addr)),
            ));
        }
        Ok(())
    }

    fn load(
        &self,
        platform: &mut dyn PlatformEmulator,
        addr: u32,
        width: AccessWidth,
    ) -> EmulationResult<u32> {
        platform
            .read_memory(u64::from(addr), width)
            .map(|v| v as u32)
            .map_err(EmulationError::PlatformEmulationError)
    }

    fn store(
        &self,
        platform: &mut dyn PlatformEmulator,
        addr: u32,
        width: AccessWidth,
        value: u32,
    ) -> EmulationResult<()> {
        platform
            .write_memory(u64::from(addr), width, u64::from(value))
            .map_err(EmulationError::PlatformEmulationError)
    }

    /// Write a load result; a load into PC is an interworking branch.
    fn write_reg(&mut self, reg: usize, value: u32) -> bool {
        if reg == 15 {
            if value & 1 != 0 {
                self.regs.cpsr |= CPSR_T;
                self.regs.pc = value & !1;
            } else {
                self.regs.cpsr &= !CPSR_T;
                self.regs.pc = value & !3;
            }
            true
        } else {
            self.regs.set(reg, value);
            false
        }
    }

    /// Fetch, decode and emulate the instruction at PC.
    pub fn emulate_instruction(
        &mut self,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<()> {
        let pc = u64::from(self.regs.pc);
        let mut bytes = [0u8; 4];

        let (branch, len) = if self.regs.thumb() {
            platform
                .fetch(pc, &mut bytes[..2])
                .map_err(|e| EmulationError::InstructionFetchingError(e.into()))?;
            let hw1 = u16::from_le_bytes([bytes[0], bytes[1]]);
            let len = t32::instruction_len(hw1);
            let insn = if len == 4 {
                platform
                    .fetch(pc + 2, &mut bytes[2..])
                    .map_err(|e| EmulationError::InstructionFetchingError(e.into()))?;
                let hw2 = u16::from_le_bytes([bytes[2], bytes[3]]);
                (u32::from(hw1) << 16) | u32::from(hw2)
            } else {
                u32::from(hw1)
            };
            (self.emulate_t32(insn, len == 4, platform)?, len)
        } else {
            platform
                .fetch(pc, &mut bytes)
                .map_err(|e| EmulationError::InstructionFetchingError(e.into()))?;
            (self.emulate_a32(u32::from_le_bytes(bytes), platform)?, 4)
        };

        if !branch {
            self.advance_pc(len);
        }
        Ok(())
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        for reg in 0..13 {
            let _ = write!(out, "r{:<2}: {:#010x}", reg, self.regs.get(reg));
            out.push(if reg % 4 == 3 { '\n' } else { ' ' });
        }
        let _ = writeln!(
            out,
            "sp : {:#010x} lr : {:#010x} pc : {:#010x}",
            self.regs.get(13),
            self.regs.get(14),
            self.regs.pc
        );
        let _ = writeln!(out, "cpsr: {:#010x}", self.regs.cpsr);
        let _ = writeln!(
            out,
            "sctlr: {:#010x} vbar: {:#010x} ttbr0: {:#018x} dfsr: {:#x} dfar: {:#010x}",
            self.cp15.sctlr, self.cp15.vbar, self.cp15.ttbr0, self.cp15.dfsr, self.cp15.dfar
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hsr(ec: u32, iss: u32) -> u32 {
        (ec << HSR_EC_SHIFT) | HSR_IL | iss
    }

    fn trap(hsr: u32, hdfar: u32, hpfar: u32) -> TrapInfo {
        TrapInfo::Arm32 {
            hsr,
            hdfar,
            hifar: 0,
            hpfar,
        }
    }

    #[test]
    fn data_abort_with_syndrome() {
        let vcpu = Arm32Vcpu::new(0, 0x4000_0000);
        // ISV, word, Rt = r3, read, translation fault level 3
        let iss = HSR_ISV | (2 << 22) | (3 << 16) | 0x07;
        let fault = vcpu.decode_fault(&trap(hsr(EC_DABT_LOW, iss), 0x0900_0018, 0x0009_0000));
        let Fault::Stage2(f) = fault else {
            panic!("expected a stage-2 fault");
        };
        assert_eq!(f.ipa, 0x0900_0018);
        assert_eq!(f.access, AccessKind::Read);
        assert_eq!(f.kind, Stage2FaultKind::Translation);
        let s = f.syndrome.unwrap();
        assert_eq!(s.width, AccessWidth::Word);
        assert_eq!(s.reg, 3);
        assert_eq!(s.instruction_len, 4);
    }

    #[test]
    fn cp15_trap_decode() {
        let vcpu = Arm32Vcpu::new(0, 0);
        // mrc p15, 0, r2, c1, c0, 0 (SCTLR read), unconditional
        let iss = (1 << 24) | (0xe << 20) | (1 << 10) | (2 << 5) | 1;
        match vcpu.decode_fault(&trap(hsr(EC_CP15_32, iss), 0, 0)) {
            Fault::SysReg(access) => {
                assert!(!access.write);
                assert_eq!(access.rt, 2);
                assert_eq!(
                    access.id,
                    SysRegId::Cp15 {
                        opc1: 0,
                        crn: 1,
                        crm: 0,
                        opc2: 0
                    }
                );
            }
            f => panic!("unexpected {:?}", f),
        }
    }

    #[test]
    fn wfi_condition_failed() {
        let vcpu = Arm32Vcpu::new(0, 0);
        // wfieq with Z clear
        let iss = 1 << 24;
        assert_eq!(
            vcpu.decode_fault(&trap(hsr(EC_WFI_WFE, iss), 0, 0)),
            Fault::ConditionFailed { instruction_len: 4 }
        );
        let iss = (1 << 24) | (0xe << 20) | 1;
        assert_eq!(
            vcpu.decode_fault(&trap(hsr(EC_WFI_WFE, iss), 0, 0)),
            Fault::Wait {
                event: WaitEvent::Event,
                instruction_len: 4
            }
        );
    }

    #[test]
    fn undefined_injection() {
        let mut vcpu = Arm32Vcpu::new(0, 0x8000_1000);
        vcpu.cp15.vbar = 0x8000_0000;
        let old_cpsr = vcpu.regs.cpsr;
        vcpu.inject(GuestException::Undefined { instruction_len: 4 });
        assert_eq!(vcpu.regs.mode(), MODE_UND);
        assert_eq!(vcpu.regs.pc, 0x8000_0004);
        assert_eq!(vcpu.regs.get(14), 0x8000_1004);
        assert_eq!(vcpu.regs.spsr_of(MODE_UND), old_cpsr);
        assert_ne!(vcpu.regs.cpsr & CPSR_I, 0);

        let mut vcpu = Arm32Vcpu::new(0, 0x100);
        vcpu.cp15.sctlr |= SCTLR_V;
        vcpu.inject(GuestException::Undefined { instruction_len: 4 });
        assert_eq!(vcpu.regs.pc, 0xffff_0004);
    }

    #[test]
    fn data_abort_injection() {
        let mut vcpu = Arm32Vcpu::new(0, 0x2000);
        vcpu.inject(GuestException::DataAbort {
            va: 0x0a00_0000,
            ipa: 0x0a00_0000,
            write: true,
            kind: AbortKind::External,
        });
        assert_eq!(vcpu.regs.mode(), MODE_ABT);
        assert_eq!(vcpu.regs.pc, VECTOR_DABT);
        assert_eq!(vcpu.regs.get(14), 0x2008);
        assert_eq!(vcpu.cp15.dfar, 0x0a00_0000);
        assert_eq!(vcpu.cp15.dfsr, 0x808);
    }

    #[test]
    fn thumb_advance_moves_itstate() {
        let mut vcpu = Arm32Vcpu::new(0, 0x100);
        vcpu.regs.cpsr |= CPSR_T;
        vcpu.regs.set_itstate(0x06);
        vcpu.advance_pc(2);
        assert_eq!(vcpu.regs.pc, 0x102);
        assert_eq!(vcpu.regs.itstate(), 0x0c);
    }
}
