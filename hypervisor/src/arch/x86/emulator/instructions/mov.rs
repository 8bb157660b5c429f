//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//
// MOV-Move
// SDM Volume 1, Chapter 4.3
//   Copies the second operand (source operand) to the first operand (destination operand).
//
// MOVZX/MOVSX/MOVSXD copy a narrower source and zero or sign extend it.
//

use crate::arch::emulator::EmulationError;
use crate::arch::x86::emulator::instructions::*;

use crate::arch::emulator::AccessWidth::{Byte, Double, Half, Word};

pub struct Mov {
    dst: AccessWidth,
    src: AccessWidth,
    sign_extend: bool,
}

impl InstructionHandler for Mov {
    fn emulate(
        &self,
        insn: &Instruction,
        state: &mut dyn CpuStateManager,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<()> {
        let mut value = get_op(insn, 1, self.src, state, platform)
            .map_err(EmulationError::PlatformEmulationError)?;
        if self.sign_extend {
            value = self.src.sign_extend(value);
        }

        set_op(insn, 0, self.dst, state, platform, value)
            .map_err(EmulationError::PlatformEmulationError)?;

        Ok(())
    }
}

macro_rules! mov {
    ($map:expr, $code:ident, $dst:expr, $src:expr, $sign:expr) => {
        $map.add_insn(
            Code::$code,
            Box::new(Mov {
                dst: $dst,
                src: $src,
                sign_extend: $sign,
            }),
        )
    };
    ($map:expr, $code:ident, $width:expr) => {
        mov!($map, $code, $width, $width, false)
    };
}

pub(super) fn register(map: &mut InstructionMap) {
    mov!(map, Mov_rm8_r8, Byte);
    mov!(map, Mov_rm16_r16, Half);
    mov!(map, Mov_rm32_r32, Word);
    mov!(map, Mov_rm64_r64, Double);
    mov!(map, Mov_r8_rm8, Byte);
    mov!(map, Mov_r16_rm16, Half);
    mov!(map, Mov_r32_rm32, Word);
    mov!(map, Mov_r64_rm64, Double);
    mov!(map, Mov_r8_imm8, Byte);
    mov!(map, Mov_r16_imm16, Half);
    mov!(map, Mov_r32_imm32, Word);
    mov!(map, Mov_r64_imm64, Double);
    mov!(map, Mov_rm8_imm8, Byte);
    mov!(map, Mov_rm16_imm16, Half);
    mov!(map, Mov_rm32_imm32, Word);
    // imm32 is sign extended by the decoder
    mov!(map, Mov_rm64_imm32, Double);
    mov!(map, Mov_AL_moffs8, Byte);
    mov!(map, Mov_AX_moffs16, Half);
    mov!(map, Mov_EAX_moffs32, Word);
    mov!(map, Mov_RAX_moffs64, Double);
    mov!(map, Mov_moffs8_AL, Byte);
    mov!(map, Mov_moffs16_AX, Half);
    mov!(map, Mov_moffs32_EAX, Word);
    mov!(map, Mov_moffs64_RAX, Double);

    // MOVZX
    mov!(map, Movzx_r16_rm8, Half, Byte, false);
    mov!(map, Movzx_r32_rm8, Word, Byte, false);
    mov!(map, Movzx_r64_rm8, Double, Byte, false);
    mov!(map, Movzx_r16_rm16, Half, Half, false);
    mov!(map, Movzx_r32_rm16, Word, Half, false);
    mov!(map, Movzx_r64_rm16, Double, Half, false);

    // MOVSX
    mov!(map, Movsx_r16_rm8, Half, Byte, true);
    mov!(map, Movsx_r32_rm8, Word, Byte, true);
    mov!(map, Movsx_r64_rm8, Double, Byte, true);
    mov!(map, Movsx_r16_rm16, Half, Half, true);
    mov!(map, Movsx_r32_rm16, Word, Half, true);
    mov!(map, Movsx_r64_rm16, Double, Half, true);
    mov!(map, Movsxd_r64_rm32, Double, Word, true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::emulator::testing::FlatPlatform;
    use crate::arch::x86::emulator::testing::*;

    const MMIO: u64 = 0xfed0_0000;

    fn mmio_platform(value: u64) -> FlatPlatform {
        FlatPlatform {
            device_base: MMIO,
            device_len: 0x1000,
            device_value: value,
            ..Default::default()
        }
    }

    #[test]
    // mov rax,rbx
    fn test_mov_r64_r64() {
        let rbx: u64 = 0x8899aabbccddeeff;
        let insn = [0x48, 0x89, 0xd8];
        let mut vcpu = long_mode_vcpu(&[(Register::RBX, rbx)]);
        run(&mut vcpu, &mut FlatPlatform::default(), &insn);

        assert_eq!(vcpu.read_reg(Register::RAX).unwrap(), rbx);
    }

    #[test]
    // mov rax,0x1122334411223344
    fn test_mov_r64_imm64() {
        let imm64: u64 = 0x1122334411223344;
        let insn = [0x48, 0xb8, 0x44, 0x33, 0x22, 0x11, 0x44, 0x33, 0x22, 0x11];
        let mut vcpu = long_mode_vcpu(&[]);
        run(&mut vcpu, &mut FlatPlatform::default(), &insn);

        assert_eq!(vcpu.read_reg(Register::RAX).unwrap(), imm64);
        assert_eq!(vcpu.regs.rip, CODE + insn.len() as u64);
    }

    #[test]
    // mov rbx, qword ptr [rax+10h]
    fn test_mov_r64_m64_device() {
        let rax: u64 = MMIO;
        let insn = [0x48, 0x8b, 0x58, 0x10];
        let mut platform = mmio_platform(0x1234567812345678);
        let mut vcpu = long_mode_vcpu(&[(Register::RAX, rax)]);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(vcpu.regs.rbx, 0x1234567812345678);
        assert_eq!(
            platform.device_log,
            vec![(false, MMIO + 0x10, AccessWidth::Double, 0)]
        );
    }

    #[test]
    // mov dword ptr [rax+rcx*4], edx
    fn test_mov_m32_r32_scaled() {
        let insn = [0x89, 0x14, 0x88];
        let mut platform = mmio_platform(0);
        let mut vcpu = long_mode_vcpu(&[
            (Register::RAX, MMIO),
            (Register::RCX, 3),
            (Register::RDX, 0xffff_ffff_cafe_f00d),
        ]);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(
            platform.device_log,
            vec![(true, MMIO + 12, AccessWidth::Word, 0xcafe_f00d)]
        );
    }

    #[test]
    // mov byte ptr [rax],dh
    fn test_mov_m8_r8() {
        let rax: u64 = 0x100;
        let dh: u64 = 0x99;
        let insn = [0x88, 0x30];
        let mut platform = FlatPlatform::default();
        let mut vcpu = long_mode_vcpu(&[(Register::RAX, rax), (Register::DH, dh)]);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(platform.read_memory(rax, AccessWidth::Byte).unwrap(), dh);
    }

    #[test]
    // mov dword ptr [rax], 0x11223344
    fn test_mov_m32_imm32() {
        let insn = [0xc7, 0x00, 0x44, 0x33, 0x22, 0x11];
        let mut platform = mmio_platform(0);
        let mut vcpu = long_mode_vcpu(&[(Register::RAX, MMIO + 4)]);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(
            platform.device_log,
            vec![(true, MMIO + 4, AccessWidth::Word, 0x11223344)]
        );
    }

    #[test]
    // mov qword ptr [rax], -1
    fn test_mov_m64_imm32_sign_extends() {
        let insn = [0x48, 0xc7, 0x00, 0xff, 0xff, 0xff, 0xff];
        let mut platform = mmio_platform(0);
        let mut vcpu = long_mode_vcpu(&[(Register::RAX, MMIO)]);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(
            platform.device_log,
            vec![(true, MMIO, AccessWidth::Double, u64::MAX)]
        );
    }

    #[test]
    // mov eax, dword ptr [rip+0x10]
    fn test_mov_rip_relative() {
        let insn = [0x8b, 0x05, 0x10, 0x00, 0x00, 0x00];
        let mut platform = FlatPlatform::default();
        platform.load(CODE + insn.len() as u64 + 0x10, &0xabcdu32.to_le_bytes());
        let mut vcpu = long_mode_vcpu(&[(Register::RAX, u64::MAX)]);
        run(&mut vcpu, &mut platform, &insn);

        // 32-bit destination clears the upper half
        assert_eq!(vcpu.regs.rax, 0xabcd);
    }

    #[test]
    // movzx eax, bl
    fn test_movzx_r32_r8l() {
        let bl: u64 = 0xff;
        let insn = [0x0f, 0xb6, 0xc3];
        let mut vcpu = long_mode_vcpu(&[(Register::RAX, u64::MAX), (Register::BL, bl)]);
        run(&mut vcpu, &mut FlatPlatform::default(), &insn);

        assert_eq!(vcpu.read_reg(Register::RAX).unwrap(), bl);
    }

    #[test]
    // movzx ebx, word ptr [rax]
    fn test_movzx_r32_m16_device() {
        let insn = [0x0f, 0xb7, 0x18];
        let mut platform = mmio_platform(0xffff_8001);
        let mut vcpu = long_mode_vcpu(&[(Register::RAX, MMIO), (Register::RBX, u64::MAX)]);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(vcpu.regs.rbx, 0x8001);
    }

    #[test]
    // movsx rbx, byte ptr [rax]
    fn test_movsx_r64_m8() {
        let insn = [0x48, 0x0f, 0xbe, 0x18];
        let mut platform = mmio_platform(0x80);
        let mut vcpu = long_mode_vcpu(&[(Register::RAX, MMIO)]);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(vcpu.regs.rbx, 0xffff_ffff_ffff_ff80);
    }

    #[test]
    // movsxd rcx, dword ptr [rax]
    fn test_movsxd_r64_m32() {
        let insn = [0x48, 0x63, 0x08];
        let mut platform = mmio_platform(0x8000_0000);
        let mut vcpu = long_mode_vcpu(&[(Register::RAX, MMIO)]);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(vcpu.regs.rcx, 0xffff_ffff_8000_0000);
    }

    #[test]
    // mov ax, word ptr [rax]
    fn test_mov_r16_m16_keeps_upper_bits() {
        let insn = [0x66, 0x8b, 0x00];
        let mut platform = mmio_platform(0xbeef);
        let mut vcpu = long_mode_vcpu(&[(Register::RAX, MMIO | 0x1111_0000_0000_0000)]);
        platform.device_base = MMIO | 0x1111_0000_0000_0000;
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(vcpu.regs.rax, 0x1111_0000_fed0_beef);
    }
}
