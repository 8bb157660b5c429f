// Copyright © 2024 Institute of Software, CAS. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! RISC-V 64 guests running in VS-mode under the H extension.

use std::fmt::Write;

pub mod csr;
pub mod decode;

use csr::{RiscvCsrs, SSTATUS_SIE, SSTATUS_SPIE, SSTATUS_SPP};
use decode::SystemOp;

use crate::arch::emulator::{EmulationError, EmulationResult, PlatformEmulator};
use crate::arch::{GuestException, VirqKind};
use crate::cpu::{
    AccessKind, Fault, HypervisorCpuError, Stage2Fault, Stage2FaultKind, SysRegAccess,
    SysRegError, SysRegId, TrapInfo, WaitEvent,
};

const SCAUSE_INTERRUPT: u64 = 1 << 63;

// Exception codes
pub const EXC_INST_ACCESS: u64 = 1;
pub const EXC_ILLEGAL_INSN: u64 = 2;
pub const EXC_LOAD_ACCESS: u64 = 5;
pub const EXC_STORE_ACCESS: u64 = 7;
pub const EXC_VS_ECALL: u64 = 10;
pub const EXC_INST_GUEST_PAGE_FAULT: u64 = 20;
pub const EXC_LOAD_GUEST_PAGE_FAULT: u64 = 21;
pub const EXC_VIRTUAL_INSN: u64 = 22;
pub const EXC_STORE_GUEST_PAGE_FAULT: u64 = 23;

/// a7 carries the SBI extension id
const REG_A7: usize = 17;

#[derive(Clone, Debug)]
pub struct RiscvVcpu {
    /// x0..x31; x0 reads as zero.
    x: [u64; 32],
    pub pc: u64,
    pub csrs: RiscvCsrs,
    /// Privilege the guest trapped from (hstatus.SPVP): true for VS-mode.
    pub supervisor: bool,
    hartid: usize,
}

impl RiscvVcpu {
    pub fn new(subid: usize, start_pc: u64) -> Self {
        let mut vcpu = RiscvVcpu {
            x: [0; 32],
            pc: 0,
            csrs: RiscvCsrs::default(),
            supervisor: true,
            hartid: subid,
        };
        vcpu.reset(start_pc);
        vcpu
    }

    /// Boot protocol: a0 = hart id, a1 = device tree (filled later by the loader).
    pub fn reset(&mut self, start_pc: u64) {
        self.x = [0; 32];
        self.x[10] = self.hartid as u64;
        self.pc = start_pc;
        self.csrs = RiscvCsrs::default();
        self.supervisor = true;
    }

    pub fn read_gpr(&self, reg: usize) -> Result<u64, HypervisorCpuError> {
        self.x
            .get(reg)
            .copied()
            .ok_or(HypervisorCpuError::InvalidRegister(reg))
    }

    pub fn write_gpr(&mut self, reg: usize, value: u64) -> Result<(), HypervisorCpuError> {
        match reg {
            0 => Ok(()),
            1..=31 => {
                self.x[reg] = value;
                Ok(())
            }
            _ => Err(HypervisorCpuError::InvalidRegister(reg)),
        }
    }

    pub fn read_csr(&self, id: SysRegId) -> Result<u64, SysRegError> {
        self.csrs.read(id)
    }

    pub fn write_csr(&mut self, id: SysRegId, value: u64) -> Result<(), SysRegError> {
        self.csrs.write(id, value)
    }

    pub fn decode_fault(&self, trap: &TrapInfo) -> Fault {
        let TrapInfo::Riscv {
            scause,
            stval,
            htval,
            htinst,
        } = *trap
        else {
            return Fault::Unrecoverable(format!("{:?} is not a RISC-V trap", trap));
        };

        if scause & SCAUSE_INTERRUPT != 0 {
            return Fault::Interrupt;
        }

        match scause {
            EXC_INST_GUEST_PAGE_FAULT | EXC_LOAD_GUEST_PAGE_FAULT | EXC_STORE_GUEST_PAGE_FAULT => {
                let access = match scause {
                    EXC_INST_GUEST_PAGE_FAULT => AccessKind::Execute,
                    EXC_LOAD_GUEST_PAGE_FAULT => AccessKind::Read,
                    _ => AccessKind::Write,
                };
                // Standard transformed instructions have bit 0 set.
                let instruction = (htinst & 0x1 != 0).then_some(htinst as u32);
                Fault::Stage2(Stage2Fault {
                    ipa: (htval << 2) | (stval & 0x3),
                    va: Some(stval),
                    access,
                    kind: Stage2FaultKind::Translation,
                    syndrome: None,
                    instruction,
                })
            }
            EXC_VS_ECALL => Fault::Hypercall {
                imm: self.x[REG_A7],
                instruction_len: 4,
            },
            EXC_ILLEGAL_INSN | EXC_VIRTUAL_INSN => self.decode_system(stval as u32),
            other => Fault::Unrecoverable(format!(
                "unhandled RISC-V exception {} at {:#x}, stval {:#x}",
                other, self.pc, stval
            )),
        }
    }

    fn decode_system(&self, insn: u32) -> Fault {
        let len = decode::instruction_len(insn as u16);
        match decode::decode_system(insn) {
            Some(SystemOp::Wfi) => Fault::Wait {
                event: WaitEvent::Interrupt,
                instruction_len: 4,
            },
            Some(SystemOp::Csr {
                csr,
                funct3,
                rd,
                rs1,
            }) => {
                let source = if funct3 & 0x4 != 0 {
                    rs1 as u64
                } else {
                    self.x[rs1]
                };
                // CSRRS/CSRRC with x0 (or a zero immediate) are pure reads.
                let write = funct3 & 0x3 == 1 || rs1 != 0;
                Fault::SysReg(SysRegAccess {
                    id: SysRegId::Csr(csr),
                    write,
                    rt: rd,
                    rt2: None,
                    csr_op: Some((funct3, source)),
                    instruction_len: 4,
                })
            }
            None => Fault::Undefined {
                instruction_len: len,
            },
        }
    }

    /// Redirect the guest to its VS-mode trap vector.
    pub fn inject(&mut self, exception: GuestException) {
        let (cause, tval) = match exception {
            GuestException::Undefined { .. } => (EXC_ILLEGAL_INSN, 0),
            GuestException::DataAbort { va, write, .. } => {
                (if write { EXC_STORE_ACCESS } else { EXC_LOAD_ACCESS }, va)
            }
            GuestException::PrefetchAbort { va, .. } => (EXC_INST_ACCESS, va),
        };
        let csrs = &mut self.csrs;
        csrs.vsepc = self.pc;
        csrs.vscause = cause;
        csrs.vstval = tval;
        let mut status = csrs.vsstatus & !(SSTATUS_SPIE | SSTATUS_SPP | SSTATUS_SIE);
        if csrs.vsstatus & SSTATUS_SIE != 0 {
            status |= SSTATUS_SPIE;
        }
        if self.supervisor {
            status |= SSTATUS_SPP;
        }
        csrs.vsstatus = status;
        self.pc = csrs.vstvec & !0x3;
        self.supervisor = true;
    }

    fn virq_bit(kind: VirqKind) -> u64 {
        match kind {
            VirqKind::Irq | VirqKind::Fiq => csr::HVIP_VSEIP,
            VirqKind::Timer => csr::HVIP_VSTIP,
            VirqKind::Software => csr::HVIP_VSSIP,
        }
    }

    pub fn set_pending_virq(&mut self, kind: VirqKind, level: bool) {
        let bit = Self::virq_bit(kind);
        if level {
            self.csrs.hvip |= bit;
        } else {
            self.csrs.hvip &= !bit;
        }
    }

    pub fn virq_pending(&self, kind: VirqKind) -> bool {
        self.csrs.hvip & Self::virq_bit(kind) != 0
    }

    /// Emulate the load or store behind a guest page fault.
    pub fn emulate_instruction(
        &mut self,
        fault: &Stage2Fault,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<()> {
        let insn = match fault.instruction {
            // transformed compressed instructions have bit 1 cleared
            Some(t) => t | 0x2,
            None => self.fetch(platform)?,
        };
        let mut op = decode::decode_mem(insn)?;
        if let Some(t) = fault.instruction {
            op.len = if t & 0x2 != 0 { 4 } else { 2 };
        }

        let addr = match fault.va {
            Some(va) => va,
            None => self.x[op.rs1].wrapping_add(op.offset as u64),
        };
        if op.load != (fault.access == AccessKind::Read) {
            return Err(EmulationError::InvalidOperand(anyhow!(
                "{:?} access faulted but instruction {:#x} disagrees",
                fault.access,
                insn
            )));
        }

        if op.load {
            let mut value = platform
                .read_memory(addr, op.width)
                .map_err(EmulationError::PlatformEmulationError)?;
            if op.signed {
                value = op.width.sign_extend(value);
            }
            self.write_reg(op.reg, value);
        } else {
            let value = self.x[op.reg] & op.width.mask();
            platform
                .write_memory(addr, op.width, value)
                .map_err(EmulationError::PlatformEmulationError)?;
        }
        self.pc = self.pc.wrapping_add(op.len);
        Ok(())
    }

    fn write_reg(&mut self, reg: usize, value: u64) {
        if reg != 0 {
            self.x[reg] = value;
        }
    }

    fn fetch(&self, platform: &mut dyn PlatformEmulator) -> EmulationResult<u32> {
        let mut low = [0u8; 2];
        platform
            .fetch(self.pc, &mut low)
            .map_err(|e| EmulationError::InstructionFetchingError(anyhow!(e)))?;
        let low = u16::from_le_bytes(low);
        if decode::instruction_len(low) == 2 {
            return Ok(u32::from(low));
        }
        let mut full = [0u8; 4];
        platform
            .fetch(self.pc, &mut full)
            .map_err(|e| EmulationError::InstructionFetchingError(anyhow!(e)))?;
        Ok(u32::from_le_bytes(full))
    }

    pub fn dump(&self) -> String {
        const ABI: [&str; 32] = [
            "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3",
            "a4", "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11",
            "t3", "t4", "t5", "t6",
        ];
        let mut out = String::new();
        let _ = writeln!(out, "pc {:#018x} vsstatus {:#x}", self.pc, self.csrs.vsstatus);
        for (i, chunk) in self.x.chunks(4).enumerate() {
            for (j, value) in chunk.iter().enumerate() {
                let _ = write!(out, "{:>4} {:#018x} ", ABI[i * 4 + j], value);
            }
            out.push('\n');
        }
        let _ = writeln!(
            out,
            "vsepc {:#x} vscause {:#x} vstval {:#x} vsatp {:#x} hvip {:#x}",
            self.csrs.vsepc, self.csrs.vscause, self.csrs.vstval, self.csrs.vsatp, self.csrs.hvip
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::emulator::testing::FlatPlatform;
    use crate::arch::emulator::AccessWidth;

    const UART: u64 = 0x1000_0000;

    fn page_fault(scause: u64, stval: u64, htinst: u64) -> TrapInfo {
        TrapInfo::Riscv {
            scause,
            stval,
            htval: stval >> 2,
            htinst,
        }
    }

    fn uart_platform(value: u64) -> FlatPlatform {
        FlatPlatform {
            device_base: UART,
            device_len: 0x100,
            device_value: value,
            ..Default::default()
        }
    }

    #[test]
    fn guest_page_fault_ipa() {
        let vcpu = RiscvVcpu::new(0, 0x8020_0000);
        let trap = TrapInfo::Riscv {
            scause: EXC_LOAD_GUEST_PAGE_FAULT,
            stval: 0xffff_ffc0_0000_1005,
            htval: 0x1000_0004 >> 2,
            htinst: 0,
        };
        let Fault::Stage2(fault) = vcpu.decode_fault(&trap) else {
            panic!("expected stage-2 fault");
        };
        assert_eq!(fault.ipa, 0x1000_0005);
        assert_eq!(fault.access, AccessKind::Read);
        assert_eq!(fault.instruction, None);
    }

    #[test]
    fn csr_and_wfi_traps() {
        let mut vcpu = RiscvVcpu::new(0, 0);
        assert_eq!(
            vcpu.decode_fault(&page_fault(EXC_VIRTUAL_INSN, u64::from(decode::INSN_WFI), 0)),
            Fault::Wait {
                event: WaitEvent::Interrupt,
                instruction_len: 4,
            }
        );
        vcpu.write_gpr(5, 0x22).unwrap();
        // csrrs a0, sip, t0
        let Fault::SysReg(access) =
            vcpu.decode_fault(&page_fault(EXC_VIRTUAL_INSN, 0x1442_a573, 0))
        else {
            panic!("expected CSR access");
        };
        assert_eq!(access.id, SysRegId::Csr(csr::CSR_SIP));
        assert!(access.write);
        assert_eq!(access.rt, 10);
        assert_eq!(access.csr_op, Some((2, 0x22)));
        // csrr a0, time never writes
        let Fault::SysReg(access) =
            vcpu.decode_fault(&page_fault(EXC_ILLEGAL_INSN, 0xc010_2573, 0))
        else {
            panic!("expected CSR access");
        };
        assert!(!access.write);
        assert!(matches!(
            vcpu.decode_fault(&page_fault(EXC_ILLEGAL_INSN, 0x0000_0000, 0)),
            Fault::Undefined { .. }
        ));
    }

    #[test]
    fn ecall_is_hypercall() {
        let mut vcpu = RiscvVcpu::new(0, 0);
        vcpu.write_gpr(REG_A7, 0x54494d45).unwrap();
        assert_eq!(
            vcpu.decode_fault(&page_fault(EXC_VS_ECALL, 0, 0)),
            Fault::Hypercall {
                imm: 0x54494d45,
                instruction_len: 4,
            }
        );
    }

    #[test]
    fn load_from_fetched_instruction() {
        let mut vcpu = RiscvVcpu::new(0, 0x8000_0000);
        let mut platform = uart_platform(0x80);
        // lb a0, 5(a1)
        platform.load(0x8000_0000, &0x0055_8503u32.to_le_bytes());
        vcpu.write_gpr(11, UART).unwrap();
        let Fault::Stage2(fault) =
            vcpu.decode_fault(&page_fault(EXC_LOAD_GUEST_PAGE_FAULT, UART + 5, 0))
        else {
            panic!("expected stage-2 fault");
        };
        vcpu.emulate_instruction(&fault, &mut platform).unwrap();
        assert_eq!(vcpu.read_gpr(10).unwrap(), 0xffff_ffff_ffff_ff80);
        assert_eq!(vcpu.pc, 0x8000_0004);
        assert_eq!(platform.device_log, vec![(false, UART + 5, AccessWidth::Byte, 0)]);
    }

    #[test]
    fn store_from_transformed_compressed_instruction() {
        let mut vcpu = RiscvVcpu::new(0, 0x8000_0000);
        let mut platform = uart_platform(0);
        vcpu.write_gpr(15, 0x1122_3344_5566_7788).unwrap();
        // transformed c.sw a5, 0(a0): sw a5, 0(x0) with bit 1 cleared
        let htinst = 0x00f0_2021;
        let Fault::Stage2(fault) =
            vcpu.decode_fault(&page_fault(EXC_STORE_GUEST_PAGE_FAULT, UART + 8, htinst))
        else {
            panic!("expected stage-2 fault");
        };
        assert_eq!(fault.instruction, Some(htinst as u32));
        vcpu.emulate_instruction(&fault, &mut platform).unwrap();
        assert_eq!(
            platform.device_log,
            vec![(true, UART + 8, AccessWidth::Word, 0x5566_7788)]
        );
        assert_eq!(vcpu.pc, 0x8000_0002);
    }

    #[test]
    fn inject_redirects_to_vstvec() {
        let mut vcpu = RiscvVcpu::new(0, 0x8000_1000);
        vcpu.csrs.vstvec = 0x8000_0101;
        vcpu.csrs.vsstatus = SSTATUS_SIE;
        vcpu.inject(GuestException::DataAbort {
            va: 0x1000_0000,
            ipa: 0x1000_0000,
            write: true,
            kind: crate::cpu::AbortKind::External,
        });
        assert_eq!(vcpu.pc, 0x8000_0100);
        assert_eq!(vcpu.csrs.vsepc, 0x8000_1000);
        assert_eq!(vcpu.csrs.vscause, EXC_STORE_ACCESS);
        assert_eq!(vcpu.csrs.vstval, 0x1000_0000);
        assert_eq!(vcpu.csrs.vsstatus, SSTATUS_SPIE | SSTATUS_SPP);
    }

    #[test]
    fn virq_lines_map_to_hvip() {
        let mut vcpu = RiscvVcpu::new(1, 0);
        vcpu.set_pending_virq(VirqKind::Timer, true);
        vcpu.set_pending_virq(VirqKind::Irq, true);
        assert_eq!(vcpu.csrs.hvip, csr::HVIP_VSTIP | csr::HVIP_VSEIP);
        vcpu.set_pending_virq(VirqKind::Irq, false);
        assert!(!vcpu.virq_pending(VirqKind::Irq));
        assert!(vcpu.virq_pending(VirqKind::Timer));
        assert_eq!(vcpu.read_gpr(10).unwrap(), 1);
    }
}
