// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//

//! x86_64 guests under the VMX exit model.

use std::fmt::Write;

pub mod emulator;
pub mod msr;
pub mod regs;

pub use regs::{SpecialRegisters, StandardRegisters, CR0_PE, CR0_PG, EFER_LMA, EFER_LME};

use crate::arch::emulator::{AccessWidth, EmulationError, EmulationResult, PlatformEmulator};
use crate::arch::{GuestException, VirqKind};
use crate::cpu::{
    AccessKind, Fault, HypervisorCpuError, PortIo, Stage2Fault, Stage2FaultKind, SysRegAccess,
    SysRegError, SysRegId, TrapInfo, WaitEvent,
};
use msr::MsrTable;

// Basic VM exit reasons
pub const EXIT_REASON_EXCEPTION_NMI: u32 = 0;
pub const EXIT_REASON_EXTERNAL_INTERRUPT: u32 = 1;
pub const EXIT_REASON_TRIPLE_FAULT: u32 = 2;
pub const EXIT_REASON_INTERRUPT_WINDOW: u32 = 7;
pub const EXIT_REASON_CPUID: u32 = 10;
pub const EXIT_REASON_HLT: u32 = 12;
pub const EXIT_REASON_VMCALL: u32 = 18;
pub const EXIT_REASON_CR_ACCESS: u32 = 28;
pub const EXIT_REASON_IO_INSTRUCTION: u32 = 30;
pub const EXIT_REASON_MSR_READ: u32 = 31;
pub const EXIT_REASON_MSR_WRITE: u32 = 32;
pub const EXIT_REASON_EPT_VIOLATION: u32 = 48;
pub const EXIT_REASON_EPT_MISCONFIG: u32 = 49;
pub const EXIT_REASON_PREEMPTION_TIMER: u32 = 52;

/// Set in the exit reason when VM entry itself failed.
pub const EXIT_REASON_ENTRY_FAILURE: u32 = 1 << 31;

const EPT_QUAL_WRITE: u64 = 1 << 1;
const EPT_QUAL_FETCH: u64 = 1 << 2;
const EPT_QUAL_ENTRY_PERMS: u64 = 0x7 << 3;
const EPT_QUAL_LINEAR_VALID: u64 = 1 << 7;

// X86 Exceptions
#[allow(dead_code, clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    DE = 0,  // Divide Error
    DB = 1,  // Debug Exception
    BP = 3,  // Breakpoint
    OF = 4,  // Overflow
    BR = 5,  // BOUND Range Exceeded
    UD = 6,  // Invalid/Undefined Opcode
    NM = 7,  // No Math Coprocessor
    DF = 8,  // Double Fault
    TS = 10, // Invalid TSS
    NP = 11, // Segment Not Present
    SS = 12, // Stack Segment Fault
    GP = 13, // General Protection
    PF = 14, // Page Fault
    MF = 16, // Math Fault
    AC = 17, // Alignment Check
    MC = 18, // Machine Check
    XM = 19, // SIMD Floating-Point Exception
    VE = 20, // Virtualization Exception
    CP = 21, // Control Protection Exception
}

/// Event the HAL delivers on the next VM entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingEvent {
    pub exception: Exception,
    pub error_code: Option<u32>,
}

/// Port I/O side of the platform, used by IN/OUT and their string forms.
pub trait PortIoBus {
    fn pio_read(&mut self, port: u16, width: AccessWidth) -> EmulationResult<u64>;
    fn pio_write(&mut self, port: u16, width: AccessWidth, value: u64) -> EmulationResult<()>;
}

#[derive(Clone, Debug)]
pub struct X86Vcpu {
    pub regs: StandardRegisters,
    pub sregs: SpecialRegisters,
    pub msrs: MsrTable,
    pub pending_event: Option<PendingEvent>,
    intr: bool,
    nmi: bool,
    subid: usize,
}

impl X86Vcpu {
    pub fn new(subid: usize, start_pc: u64) -> Self {
        let mut vcpu = X86Vcpu {
            regs: StandardRegisters::default(),
            sregs: SpecialRegisters::default(),
            msrs: MsrTable::new(subid == 0),
            pending_event: None,
            intr: false,
            nmi: false,
            subid,
        };
        vcpu.reset(start_pc);
        vcpu
    }

    /// Flat protected mode with paging off, entered at `start_pc`.
    pub fn reset(&mut self, start_pc: u64) {
        self.regs = StandardRegisters {
            rip: start_pc,
            rflags: regs::RFLAGS_RESERVED,
            ..Default::default()
        };
        self.sregs = SpecialRegisters {
            cr0: CR0_PE | regs::CR0_ET | regs::CR0_NE,
            cs_db: true,
            ..Default::default()
        };
        self.msrs = MsrTable::new(self.subid == 0);
        self.pending_event = None;
        self.intr = false;
        self.nmi = false;
    }

    pub fn read_gpr(&self, reg: usize) -> Result<u64, HypervisorCpuError> {
        self.regs
            .gpr(reg)
            .ok_or(HypervisorCpuError::InvalidRegister(reg))
    }

    pub fn write_gpr(&mut self, reg: usize, value: u64) -> Result<(), HypervisorCpuError> {
        let slot = self
            .regs
            .gpr_mut(reg)
            .ok_or(HypervisorCpuError::InvalidRegister(reg))?;
        *slot = value;
        Ok(())
    }

    /// Code size the decoder runs in.
    pub fn bitness(&self) -> u32 {
        if self.sregs.efer & EFER_LMA != 0 && self.sregs.cs_long {
            64
        } else if self.sregs.cr0 & CR0_PE != 0 && self.sregs.cs_db {
            32
        } else {
            16
        }
    }

    pub fn decode_fault(&self, trap: &TrapInfo) -> Fault {
        let TrapInfo::X86 {
            reason,
            qualification,
            guest_linear,
            guest_physical,
            instruction_len,
        } = *trap
        else {
            return Fault::Unrecoverable(format!("{:?} is not a VMX exit", trap));
        };
        let len = u64::from(instruction_len);

        if reason & EXIT_REASON_ENTRY_FAILURE != 0 {
            return Fault::Unrecoverable(format!(
                "VM entry failed, reason {:#x}",
                reason & 0xffff
            ));
        }

        match reason & 0xffff {
            EXIT_REASON_EXCEPTION_NMI
            | EXIT_REASON_EXTERNAL_INTERRUPT
            | EXIT_REASON_INTERRUPT_WINDOW
            | EXIT_REASON_PREEMPTION_TIMER => Fault::Interrupt,
            EXIT_REASON_CPUID => Fault::Cpuid {
                instruction_len: len,
            },
            EXIT_REASON_HLT => Fault::Wait {
                event: WaitEvent::Interrupt,
                instruction_len: len,
            },
            EXIT_REASON_VMCALL => Fault::Hypercall {
                imm: self.regs.rax,
                instruction_len: len,
            },
            EXIT_REASON_CR_ACCESS => {
                let cr = (qualification & 0xf) as u8;
                let gpr = ((qualification >> 8) & 0xf) as usize;
                match (qualification >> 4) & 0x3 {
                    access @ (0 | 1) => Fault::SysReg(SysRegAccess {
                        id: SysRegId::Cr(cr),
                        write: access == 0,
                        rt: gpr,
                        rt2: None,
                        csr_op: None,
                        instruction_len: len,
                    }),
                    _ => Fault::Unrecoverable(format!(
                        "CLTS/LMSW exit not emulated, qualification {:#x}",
                        qualification
                    )),
                }
            }
            EXIT_REASON_IO_INSTRUCTION => {
                let width = match qualification & 0x7 {
                    0 => AccessWidth::Byte,
                    1 => AccessWidth::Half,
                    3 => AccessWidth::Word,
                    size => {
                        return Fault::Unrecoverable(format!("bad I/O size encoding {}", size))
                    }
                };
                Fault::PortIo(PortIo {
                    port: (qualification >> 16) as u16,
                    width,
                    write: qualification & (1 << 3) == 0,
                    string: qualification & (1 << 4) != 0,
                    rep: qualification & (1 << 5) != 0,
                    instruction_len: len,
                })
            }
            reason @ (EXIT_REASON_MSR_READ | EXIT_REASON_MSR_WRITE) => {
                Fault::SysReg(SysRegAccess {
                    id: SysRegId::Msr(self.regs.rcx as u32),
                    write: reason == EXIT_REASON_MSR_WRITE,
                    rt: 0,
                    rt2: Some(2),
                    csr_op: None,
                    instruction_len: len,
                })
            }
            EXIT_REASON_EPT_VIOLATION => {
                let access = if qualification & EPT_QUAL_WRITE != 0 {
                    AccessKind::Write
                } else if qualification & EPT_QUAL_FETCH != 0 {
                    AccessKind::Execute
                } else {
                    AccessKind::Read
                };
                let kind = if qualification & EPT_QUAL_ENTRY_PERMS == 0 {
                    Stage2FaultKind::Translation
                } else {
                    Stage2FaultKind::Permission
                };
                Fault::Stage2(Stage2Fault {
                    ipa: guest_physical,
                    va: (qualification & EPT_QUAL_LINEAR_VALID != 0).then_some(guest_linear),
                    access,
                    kind,
                    syndrome: None,
                    instruction: None,
                })
            }
            EXIT_REASON_EPT_MISCONFIG => Fault::Stage2(Stage2Fault {
                ipa: guest_physical,
                va: None,
                access: AccessKind::Read,
                kind: Stage2FaultKind::Translation,
                syndrome: None,
                instruction: None,
            }),
            EXIT_REASON_TRIPLE_FAULT => Fault::Unrecoverable("guest triple fault".to_string()),
            other => Fault::Unrecoverable(format!("unhandled VM exit reason {}", other)),
        }
    }

    pub fn inject(&mut self, exception: GuestException) {
        self.pending_event = Some(match exception {
            GuestException::Undefined { .. } => PendingEvent {
                exception: Exception::UD,
                error_code: None,
            },
            GuestException::DataAbort { .. } | GuestException::PrefetchAbort { .. } => {
                PendingEvent {
                    exception: Exception::GP,
                    error_code: Some(0),
                }
            }
        });
    }

    pub fn set_pending_virq(&mut self, kind: VirqKind, level: bool) {
        match kind {
            VirqKind::Fiq => self.nmi = level,
            _ => self.intr = level,
        }
    }

    pub fn virq_pending(&self, kind: VirqKind) -> bool {
        match kind {
            VirqKind::Fiq => self.nmi,
            _ => self.intr,
        }
    }

    pub fn read_system_reg(&self, id: SysRegId) -> Result<u64, SysRegError> {
        match id {
            SysRegId::Cr(0) => Ok(self.sregs.cr0),
            SysRegId::Cr(2) => Ok(self.sregs.cr2),
            SysRegId::Cr(3) => Ok(self.sregs.cr3),
            SysRegId::Cr(4) => Ok(self.sregs.cr4),
            SysRegId::Cr(8) => Ok(self.sregs.cr8),
            SysRegId::Msr(msr::MSR_EFER) => Ok(self.sregs.efer),
            SysRegId::Msr(index) => self.msrs.read(index),
            _ => Err(SysRegError::Unknown(id)),
        }
    }

    pub fn write_system_reg(&mut self, id: SysRegId, value: u64) -> Result<(), SysRegError> {
        match id {
            SysRegId::Cr(0) => {
                self.sregs.cr0 = value;
                self.update_long_mode();
            }
            SysRegId::Cr(3) => self.sregs.cr3 = value,
            SysRegId::Cr(4) => self.sregs.cr4 = value,
            SysRegId::Cr(8) => self.sregs.cr8 = value & 0xf,
            SysRegId::Msr(msr::MSR_EFER) => {
                self.msrs.write(msr::MSR_EFER, value)?;
                self.sregs.efer = self.msrs.read(msr::MSR_EFER)?;
                self.update_long_mode();
            }
            SysRegId::Msr(index) => self.msrs.write(index, value)?,
            _ => return Err(SysRegError::Unknown(id)),
        }
        Ok(())
    }

    // EFER.LMA follows EFER.LME once paging is turned on.
    fn update_long_mode(&mut self) {
        if self.sregs.efer & EFER_LME != 0 && self.sregs.cr0 & CR0_PG != 0 {
            self.sregs.efer |= EFER_LMA;
        } else {
            self.sregs.efer &= !EFER_LMA;
        }
    }

    /// Fill EAX..EDX for the CPUID leaf in EAX/ECX and step over the instruction.
    pub fn cpuid(&mut self, instruction_len: u64) {
        let leaf = self.regs.rax as u32;
        let (eax, ebx, ecx, edx): (u32, u32, u32, u32) = match leaf {
            // "XvisorXvisor" vendor, max basic leaf 1
            0 => (1, 0x7369_7658, 0x726f_7369, 0x7658_726f),
            // family 6, APIC id in EBX[31:24], FPU TSC MSR PAE CX8 APIC SEP PGE CMOV
            1 => (
                0x0000_0600,
                (self.subid as u32) << 24,
                0,
                0x0000_a37b,
            ),
            0x8000_0000 => (0x8000_0001, 0, 0, 0),
            // SYSCALL, NX, long mode
            0x8000_0001 => (0, 0, 0, (1 << 11) | (1 << 20) | (1 << 29)),
            _ => (0, 0, 0, 0),
        };
        self.regs.rax = u64::from(eax);
        self.regs.rbx = u64::from(ebx);
        self.regs.rcx = u64::from(ecx);
        self.regs.rdx = u64::from(edx);
        self.regs.rip = self.regs.rip.wrapping_add(instruction_len);
    }

    /// Complete an IN/OUT exit, including the INS/OUTS forms, and step over it.
    pub fn port_io(
        &mut self,
        io: &PortIo,
        bus: &mut dyn PortIoBus,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<()> {
        if !io.string {
            if io.write {
                bus.pio_write(io.port, io.width, self.regs.rax & io.width.mask())?;
            } else {
                let value = bus.pio_read(io.port, io.width)? & io.width.mask();
                self.regs.rax = match io.width {
                    // 32-bit destinations clear the upper half.
                    AccessWidth::Word => value,
                    w => (self.regs.rax & !w.mask()) | value,
                };
            }
            self.regs.rip = self.regs.rip.wrapping_add(io.instruction_len);
            return Ok(());
        }

        let step = io.width.bytes() as u64;
        let backwards = self.regs.rflags & regs::DF != 0;
        let mut count = if io.rep { self.regs.rcx } else { 1 };
        while count > 0 {
            if io.write {
                let value = platform
                    .read_memory(self.regs.rsi, io.width)
                    .map_err(EmulationError::PlatformEmulationError)?;
                bus.pio_write(io.port, io.width, value)?;
                self.regs.rsi = advance(self.regs.rsi, step, backwards);
            } else {
                let value = bus.pio_read(io.port, io.width)?;
                platform
                    .write_memory(self.regs.rdi, io.width, value)
                    .map_err(EmulationError::PlatformEmulationError)?;
                self.regs.rdi = advance(self.regs.rdi, step, backwards);
            }
            count -= 1;
            if io.rep {
                self.regs.rcx = count;
            }
        }
        self.regs.rip = self.regs.rip.wrapping_add(io.instruction_len);
        Ok(())
    }

    /// Decode and emulate the memory access at RIP after an EPT exit.
    pub fn emulate_instruction(&mut self, platform: &mut dyn PlatformEmulator) -> EmulationResult<()> {
        emulator::emulate_insn(self, platform).map(|_| ())
    }

    pub fn dump(&self) -> String {
        let r = &self.regs;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "rip {:#018x} rflags {:#010x} bitness {}",
            r.rip,
            r.rflags,
            self.bitness()
        );
        let gprs = [
            ("rax", r.rax),
            ("rbx", r.rbx),
            ("rcx", r.rcx),
            ("rdx", r.rdx),
            ("rsi", r.rsi),
            ("rdi", r.rdi),
            ("rsp", r.rsp),
            ("rbp", r.rbp),
            ("r8", r.r8),
            ("r9", r.r9),
            ("r10", r.r10),
            ("r11", r.r11),
            ("r12", r.r12),
            ("r13", r.r13),
            ("r14", r.r14),
            ("r15", r.r15),
        ];
        for row in gprs.chunks(4) {
            for (name, value) in row {
                let _ = write!(out, "{:>4} {:#018x} ", name, value);
            }
            out.push('\n');
        }
        let s = &self.sregs;
        let _ = writeln!(
            out,
            "cr0 {:#x} cr2 {:#x} cr3 {:#x} cr4 {:#x} efer {:#x}",
            s.cr0, s.cr2, s.cr3, s.cr4, s.efer
        );
        out
    }
}

fn advance(addr: u64, step: u64, backwards: bool) -> u64 {
    if backwards {
        addr.wrapping_sub(step)
    } else {
        addr.wrapping_add(step)
    }
}
