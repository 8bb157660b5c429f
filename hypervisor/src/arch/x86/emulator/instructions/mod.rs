//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

extern crate iced_x86;

use std::collections::HashMap;
use std::sync::OnceLock;

use iced_x86::*;

use crate::arch::emulator::{AccessWidth, EmulationResult, PlatformEmulator, PlatformError};
use crate::arch::x86::emulator::CpuStateManager;
use crate::arch::x86::regs::DF;

pub mod mov;
pub mod movs;
pub mod stos;

pub trait InstructionHandler: Sync + Send {
    fn emulate(
        &self,
        insn: &Instruction,
        state: &mut dyn CpuStateManager,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<()>;
}

pub struct InstructionMap {
    pub instructions: HashMap<Code, Box<dyn InstructionHandler>>,
}

impl InstructionMap {
    pub fn new() -> InstructionMap {
        InstructionMap {
            instructions: HashMap::new(),
        }
    }

    pub fn add_insn(&mut self, insn: Code, insn_handler: Box<dyn InstructionHandler>) {
        self.instructions.insert(insn, insn_handler);
    }

    pub fn get(&self, insn: Code) -> Option<&dyn InstructionHandler> {
        self.instructions.get(&insn).map(|h| h.as_ref())
    }

    /// Every instruction form an MMIO access is allowed to use.
    pub fn mmio() -> InstructionMap {
        let mut map = InstructionMap::new();
        mov::register(&mut map);
        movs::register(&mut map);
        stos::register(&mut map);
        map
    }
}

impl Default for InstructionMap {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn instruction_map() -> &'static InstructionMap {
    static MAP: OnceLock<InstructionMap> = OnceLock::new();
    MAP.get_or_init(InstructionMap::mmio)
}

/// Effective address of the memory operand. Segments are flat.
pub fn memory_operand_address(
    insn: &Instruction,
    state: &dyn CpuStateManager,
) -> Result<u64, PlatformError> {
    let mut address: u64 = 0;

    // iced already folds RIP into the displacement of RIP-relative operands.
    if insn.memory_base() != Register::None && !insn.is_ip_rel_memory_operand() {
        let base: u64 = state.read_reg(insn.memory_base())?;
        address = address.wrapping_add(base);
    }

    if insn.memory_index() != Register::None {
        let mut index: u64 = state.read_reg(insn.memory_index())?;
        index = index.wrapping_mul(insn.memory_index_scale().into());

        address = address.wrapping_add(index);
    }

    address = address.wrapping_add(insn.memory_displacement64());

    Ok(address)
}

pub fn get_op(
    insn: &Instruction,
    op_index: u32,
    width: AccessWidth,
    state: &dyn CpuStateManager,
    platform: &mut dyn PlatformEmulator,
) -> Result<u64, PlatformError> {
    let value = match insn.op_kind(op_index) {
        OpKind::Register => state.read_reg(insn.op_register(op_index))?,
        OpKind::Memory => {
            let addr = memory_operand_address(insn, state)?;
            platform.read_memory(addr, width)?
        }
        OpKind::Immediate8 => insn.immediate8().into(),
        OpKind::Immediate8to16 => insn.immediate8to16() as u64,
        OpKind::Immediate8to32 => insn.immediate8to32() as u64,
        OpKind::Immediate8to64 => insn.immediate8to64() as u64,
        OpKind::Immediate16 => insn.immediate16().into(),
        OpKind::Immediate32 => insn.immediate32().into(),
        OpKind::Immediate32to64 => insn.immediate32to64() as u64,
        OpKind::Immediate64 => insn.immediate64(),
        k => return Err(PlatformError::InvalidOperand(anyhow!("{:?}", k))),
    };

    Ok(value & width.mask())
}

pub fn set_op(
    insn: &Instruction,
    op_index: u32,
    width: AccessWidth,
    state: &mut dyn CpuStateManager,
    platform: &mut dyn PlatformEmulator,
    value: u64,
) -> Result<(), PlatformError> {
    match insn.op_kind(op_index) {
        OpKind::Register => state.write_reg(insn.op_register(op_index), value & width.mask())?,
        OpKind::Memory => {
            let addr = memory_operand_address(insn, state)?;
            platform.write_memory(addr, width, value & width.mask())?
        }
        k => return Err(PlatformError::InvalidOperand(anyhow!("{:?}", k))),
    };

    Ok(())
}

/// Count, source and destination registers of string instructions.
fn string_registers(state: &dyn CpuStateManager) -> (Register, Register, Register) {
    if state.bitness() == 64 {
        (Register::RCX, Register::RSI, Register::RDI)
    } else {
        (Register::ECX, Register::ESI, Register::EDI)
    }
}

/// Step a string pointer by one element in the direction RFLAGS.DF selects.
fn string_step(state: &dyn CpuStateManager, ptr: u64, width: AccessWidth) -> u64 {
    let len = width.bytes() as u64;
    if state.flags() & DF != 0 {
        ptr.wrapping_sub(len)
    } else {
        ptr.wrapping_add(len)
    }
}
