//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

extern crate iced_x86;

use iced_x86::*;

use crate::arch::emulator::{EmulationError, EmulationResult, PlatformEmulator, PlatformError};
use crate::arch::x86::X86Vcpu;

pub mod instructions;

use instructions::instruction_map;

/// Longest legal x86 instruction.
const MAX_INSN_LEN: usize = 15;

/// CpuStateManager manages an x86 CPU state.
///
/// Instruction emulation handlers get a mutable reference to
/// a `CpuStateManager` implementation, representing the current state of the
/// CPU they have to emulate an instruction stream against.
pub trait CpuStateManager {
    /// Reads a CPU register.
    ///
    /// # Arguments
    ///
    /// * `reg` - A general purpose or control register.
    fn read_reg(&self, reg: Register) -> Result<u64, PlatformError>;

    /// Write to a CPU register.
    ///
    /// # Arguments
    ///
    /// * `reg` - A general purpose or control register.
    /// * `val` - The value to load.
    fn write_reg(&mut self, reg: Register, val: u64) -> Result<(), PlatformError>;

    /// Get the CPU instruction pointer.
    fn ip(&self) -> u64;

    /// Set the CPU instruction pointer.
    fn set_ip(&mut self, ip: u64);

    /// Get the CPU flags.
    fn flags(&self) -> u64;

    /// Set the CPU flags.
    fn set_flags(&mut self, flags: u64);

    /// 16, 32 or 64.
    fn bitness(&self) -> u32;
}

const REGISTER_MASK_64: u64 = 0xffff_ffff_ffff_ffffu64;
const REGISTER_MASK_32: u64 = 0xffff_ffffu64;
const REGISTER_MASK_16: u64 = 0xffffu64;
const REGISTER_MASK_8: u64 = 0xffu64;

macro_rules! set_reg {
    ($reg:expr, $mask:expr, $value:expr) => {
        $reg = ($reg & $mask) | $value
    };
}

fn high_byte(reg: Register) -> bool {
    matches!(reg, Register::AH | Register::BH | Register::CH | Register::DH)
}

// full_register() maps AL, AX, EAX and AH onto RAX, and iced orders the
// 64-bit registers the way ModRM numbers them.
fn gpr_index(reg: Register) -> Option<usize> {
    reg.is_gpr()
        .then(|| reg.full_register() as usize - Register::RAX as usize)
}

impl X86Vcpu {
    fn reg_value(&self, reg: Register) -> Option<u64> {
        match reg {
            Register::CR0 => Some(self.sregs.cr0),
            Register::CR2 => Some(self.sregs.cr2),
            Register::CR3 => Some(self.sregs.cr3),
            Register::CR4 => Some(self.sregs.cr4),
            Register::CR8 => Some(self.sregs.cr8),
            r => self.regs.gpr(gpr_index(r)?),
        }
    }

    fn reg_slot(&mut self, reg: Register) -> Option<&mut u64> {
        match reg {
            Register::CR0 => Some(&mut self.sregs.cr0),
            Register::CR2 => Some(&mut self.sregs.cr2),
            Register::CR3 => Some(&mut self.sregs.cr3),
            Register::CR4 => Some(&mut self.sregs.cr4),
            Register::CR8 => Some(&mut self.sregs.cr8),
            r => self.regs.gpr_mut(gpr_index(r)?),
        }
    }
}

impl CpuStateManager for X86Vcpu {
    fn read_reg(&self, reg: Register) -> Result<u64, PlatformError> {
        let reg_value = self.reg_value(reg).ok_or_else(|| {
            PlatformError::InvalidRegister(anyhow!("read_reg invalid register {:?}", reg))
        })?;

        let reg_value = if reg.is_gpr64() || reg.is_cr() {
            reg_value
        } else if reg.is_gpr32() {
            reg_value & REGISTER_MASK_32
        } else if reg.is_gpr16() {
            reg_value & REGISTER_MASK_16
        } else if high_byte(reg) {
            (reg_value >> 8) & REGISTER_MASK_8
        } else {
            reg_value & REGISTER_MASK_8
        };

        debug!("Register read: {:#x} from {:?}", reg_value, reg);

        Ok(reg_value)
    }

    fn write_reg(&mut self, reg: Register, val: u64) -> Result<(), PlatformError> {
        debug!("Register write: {:#x} to {:?}", val, reg);

        // SDM Vol 1 - 3.4.1.1
        //
        // 8-bit and 16-bit operands generate an 8-bit or 16-bit result.
        // The upper 56 bits or 48 bits (respectively) of the destination
        // general-purpose register are not modified by the operation.
        // 32-bit results are zero-extended.
        let (reg_value, mask): (u64, u64) = if reg.is_gpr64() || reg.is_cr() {
            (val, !REGISTER_MASK_64)
        } else if reg.is_gpr32() {
            (val & REGISTER_MASK_32, !REGISTER_MASK_64)
        } else if reg.is_gpr16() {
            (val & REGISTER_MASK_16, !REGISTER_MASK_16)
        } else if high_byte(reg) {
            ((val & REGISTER_MASK_8) << 8, !(REGISTER_MASK_8 << 8))
        } else if reg.is_gpr8() {
            (val & REGISTER_MASK_8, !REGISTER_MASK_8)
        } else {
            return Err(PlatformError::InvalidRegister(anyhow!(
                "write_reg invalid register {:?}",
                reg
            )));
        };

        let slot = self.reg_slot(reg).ok_or_else(|| {
            PlatformError::InvalidRegister(anyhow!("write_reg invalid register {:?}", reg))
        })?;
        set_reg!(*slot, mask, reg_value);

        Ok(())
    }

    fn ip(&self) -> u64 {
        self.regs.rip
    }

    fn set_ip(&mut self, ip: u64) {
        self.regs.rip = ip;
    }

    fn flags(&self) -> u64 {
        self.regs.rflags
    }

    fn set_flags(&mut self, flags: u64) {
        self.regs.rflags = flags;
    }

    fn bitness(&self) -> u32 {
        X86Vcpu::bitness(self)
    }
}

/// Fetch, decode and emulate the instruction at the current IP, then move
/// IP past it.
pub fn emulate_insn(
    state: &mut dyn CpuStateManager,
    platform: &mut dyn PlatformEmulator,
) -> EmulationResult<Instruction> {
    let ip = state.ip();
    let mut bytes = [0u8; MAX_INSN_LEN];
    platform
        .fetch(ip, &mut bytes)
        .map_err(EmulationError::PlatformEmulationError)?;

    let mut decoder = Decoder::try_with_ip(state.bitness(), &bytes, ip, DecoderOptions::NONE)
        .map_err(|e| EmulationError::InstructionFetchingError(anyhow!(e)))?;
    let insn = decoder.decode();
    if insn.is_invalid() {
        return Err(EmulationError::InstructionFetchingError(anyhow!(
            "Invalid instruction at {:#x}: {:?}",
            ip,
            decoder.last_error()
        )));
    }

    let handler = instruction_map().get(insn.code()).ok_or_else(|| {
        EmulationError::UnsupportedInstruction(anyhow!("{:?} at {:#x}", insn.code(), ip))
    })?;
    handler.emulate(&insn, state, platform)?;
    state.set_ip(insn.next_ip());

    Ok(insn)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::arch::emulator::testing::FlatPlatform;

    #[test]
    fn partial_register_writes() {
        let mut vcpu = long_mode_vcpu(&[(Register::RAX, 0x1111_2222_3333_4444)]);
        vcpu.write_reg(Register::AH, 0xab).unwrap();
        assert_eq!(vcpu.regs.rax, 0x1111_2222_3333_ab44);
        vcpu.write_reg(Register::AX, 0xcdef).unwrap();
        assert_eq!(vcpu.regs.rax, 0x1111_2222_3333_cdef);
        vcpu.write_reg(Register::EAX, 0x5555_6666).unwrap();
        assert_eq!(vcpu.regs.rax, 0x5555_6666);
        vcpu.write_reg(Register::R9L, 0x7f).unwrap();
        assert_eq!(vcpu.read_reg(Register::R9).unwrap(), 0x7f);
        assert_eq!(vcpu.read_reg(Register::AH).unwrap(), 0x66);
    }

    #[test]
    fn invalid_register() {
        let vcpu = long_mode_vcpu(&[]);
        assert!(vcpu.read_reg(Register::XMM0).is_err());
    }

    #[test]
    fn unsupported_instruction() {
        let mut vcpu = long_mode_vcpu(&[]);
        let mut platform = FlatPlatform::default();
        // add dword ptr [rax], eax
        platform.load(CODE, &[0x01, 0x00]);
        let err = emulate_insn(&mut vcpu, &mut platform).unwrap_err();
        assert!(matches!(err, EmulationError::UnsupportedInstruction(_)));
        assert_eq!(vcpu.regs.rip, CODE);
    }

    #[test]
    fn ip_moves_past_instruction() {
        let mut vcpu = long_mode_vcpu(&[(Register::RAX, 0x2000)]);
        let mut platform = FlatPlatform::default();
        // mov ebx, dword ptr [rax]
        run(&mut vcpu, &mut platform, &[0x8b, 0x18]);
        assert_eq!(vcpu.regs.rip, CODE + 2);
    }

    #[test]
    fn protected_mode_decode() {
        let mut vcpu = X86Vcpu::new(0, CODE);
        let mut platform = FlatPlatform::default();
        platform.load(0x2000, &0xdead_beefu32.to_le_bytes());
        vcpu.regs.rsi = 0x2000;
        // mov eax, dword ptr [esi]
        run(&mut vcpu, &mut platform, &[0x8b, 0x06]);
        assert_eq!(vcpu.regs.rax, 0xdead_beef);
    }
}
