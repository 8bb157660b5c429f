// Copyright © 2024 Institute of Software, CAS. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Decoding of the trapped instruction forms the hypervisor emulates.

use crate::arch::emulator::{AccessWidth, EmulationError, EmulationResult};

const OPCODE_LOAD: u32 = 0x03;
const OPCODE_STORE: u32 = 0x23;
const OPCODE_SYSTEM: u32 = 0x73;

pub const INSN_WFI: u32 = 0x1050_0073;

/// A decoded load or store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemOp {
    pub load: bool,
    pub width: AccessWidth,
    pub signed: bool,
    /// rd of a load, rs2 of a store.
    pub reg: usize,
    /// Base register and immediate offset.
    pub rs1: usize,
    pub offset: i64,
    pub len: u64,
}

/// A decoded SYSTEM instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemOp {
    Wfi,
    Csr {
        csr: u16,
        funct3: u8,
        rd: usize,
        /// rs1 register number or 5-bit immediate.
        rs1: usize,
    },
}

/// Length of the instruction starting with halfword `low`.
pub fn instruction_len(low: u16) -> u64 {
    if low & 0x3 == 0x3 {
        4
    } else {
        2
    }
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 32 - bits;
    i64::from(((value << shift) as i32) >> shift)
}

fn unsupported(insn: u32) -> EmulationError {
    EmulationError::UnsupportedInstruction(anyhow!("RISC-V instruction {:#010x}", insn))
}

pub fn decode_mem(insn: u32) -> EmulationResult<MemOp> {
    if insn & 0x3 != 0x3 {
        return decode_compressed_mem(insn as u16);
    }
    let funct3 = (insn >> 12) & 0x7;
    let rs1 = ((insn >> 15) & 0x1f) as usize;
    match insn & 0x7f {
        OPCODE_LOAD => {
            let (width, signed) = match funct3 {
                0 => (AccessWidth::Byte, true),
                1 => (AccessWidth::Half, true),
                2 => (AccessWidth::Word, true),
                3 => (AccessWidth::Double, false),
                4 => (AccessWidth::Byte, false),
                5 => (AccessWidth::Half, false),
                6 => (AccessWidth::Word, false),
                _ => return Err(unsupported(insn)),
            };
            Ok(MemOp {
                load: true,
                width,
                signed,
                reg: ((insn >> 7) & 0x1f) as usize,
                rs1,
                offset: sign_extend(insn >> 20, 12),
                len: 4,
            })
        }
        OPCODE_STORE => {
            let width = match funct3 {
                0 => AccessWidth::Byte,
                1 => AccessWidth::Half,
                2 => AccessWidth::Word,
                3 => AccessWidth::Double,
                _ => return Err(unsupported(insn)),
            };
            let imm = ((insn >> 25) << 5) | ((insn >> 7) & 0x1f);
            Ok(MemOp {
                load: false,
                width,
                signed: false,
                reg: ((insn >> 20) & 0x1f) as usize,
                rs1,
                offset: sign_extend(imm, 12),
                len: 4,
            })
        }
        _ => Err(unsupported(insn)),
    }
}

fn decode_compressed_mem(insn: u16) -> EmulationResult<MemOp> {
    let insn32 = u32::from(insn);
    let funct3 = insn >> 13;
    let bits = |hi: u16, lo: u16| u64::from((insn >> lo) & ((1 << (hi - lo + 1)) - 1));
    let (load, width, reg, rs1, offset) = match (insn & 0x3, funct3) {
        // C.LW / C.SW: offset[5:3] = [12:10], offset[2] = [6], offset[6] = [5]
        (0b00, 0b010) | (0b00, 0b110) => {
            let offset = (bits(12, 10) << 3) | (bits(6, 6) << 2) | (bits(5, 5) << 6);
            (funct3 == 0b010, AccessWidth::Word, bits(4, 2) + 8, bits(9, 7) + 8, offset)
        }
        // C.LD / C.SD: offset[5:3] = [12:10], offset[7:6] = [6:5]
        (0b00, 0b011) | (0b00, 0b111) => {
            let offset = (bits(12, 10) << 3) | (bits(6, 5) << 6);
            (funct3 == 0b011, AccessWidth::Double, bits(4, 2) + 8, bits(9, 7) + 8, offset)
        }
        // C.LWSP: offset[5] = [12], offset[4:2] = [6:4], offset[7:6] = [3:2]
        (0b10, 0b010) => {
            let offset = (bits(12, 12) << 5) | (bits(6, 4) << 2) | (bits(3, 2) << 6);
            (true, AccessWidth::Word, bits(11, 7), 2, offset)
        }
        // C.LDSP: offset[5] = [12], offset[4:3] = [6:5], offset[8:6] = [4:2]
        (0b10, 0b011) => {
            let offset = (bits(12, 12) << 5) | (bits(6, 5) << 3) | (bits(4, 2) << 6);
            (true, AccessWidth::Double, bits(11, 7), 2, offset)
        }
        // C.SWSP: offset[5:2] = [12:9], offset[7:6] = [8:7]
        (0b10, 0b110) => {
            let offset = (bits(12, 9) << 2) | (bits(8, 7) << 6);
            (false, AccessWidth::Word, bits(6, 2), 2, offset)
        }
        // C.SDSP: offset[5:3] = [12:10], offset[8:6] = [9:7]
        (0b10, 0b111) => {
            let offset = (bits(12, 10) << 3) | (bits(9, 7) << 6);
            (false, AccessWidth::Double, bits(6, 2), 2, offset)
        }
        _ => return Err(unsupported(insn32)),
    };
    Ok(MemOp {
        load,
        width,
        // C.LW sign extends, C.LD needs no extension
        signed: load && width == AccessWidth::Word,
        reg: reg as usize,
        rs1: rs1 as usize,
        offset: offset as i64,
        len: 2,
    })
}

pub fn decode_system(insn: u32) -> Option<SystemOp> {
    if insn == INSN_WFI {
        return Some(SystemOp::Wfi);
    }
    if insn & 0x7f != OPCODE_SYSTEM {
        return None;
    }
    let funct3 = ((insn >> 12) & 0x7) as u8;
    if funct3 == 0 || funct3 == 4 {
        return None;
    }
    Some(SystemOp::Csr {
        csr: (insn >> 20) as u16,
        funct3,
        rd: ((insn >> 7) & 0x1f) as usize,
        rs1: ((insn >> 15) & 0x1f) as usize,
    })
}
