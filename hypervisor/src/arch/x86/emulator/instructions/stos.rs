//
// Copyright © 2024 Microsoft
//
// SPDX-License-Identifier: Apache-2.0
//

//
// STOS - Store String
//

use crate::arch::emulator::AccessWidth::{Byte, Double, Half, Word};
use crate::arch::emulator::EmulationError;
use crate::arch::x86::emulator::instructions::*;

pub struct Stos(AccessWidth);

impl InstructionHandler for Stos {
    fn emulate(
        &self,
        insn: &Instruction,
        state: &mut dyn CpuStateManager,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<()> {
        let (count_reg, _, dst_reg) = string_registers(state);
        let mut count: u64 = if insn.has_rep_prefix() {
            state
                .read_reg(count_reg)
                .map_err(|e| EmulationError::InvalidOperand(anyhow!(e)))?
        } else {
            1
        };

        let rax = state
            .read_reg(Register::RAX)
            .map_err(|e| EmulationError::InvalidOperand(anyhow!(e)))?;

        let mut rdi = state
            .read_reg(dst_reg)
            .map_err(|e| EmulationError::InvalidOperand(anyhow!(e)))?;

        while count > 0 {
            platform
                .write_memory(rdi, self.0, rax & self.0.mask())
                .map_err(EmulationError::PlatformEmulationError)?;

            rdi = string_step(state, rdi, self.0);
            count -= 1;
        }

        state
            .write_reg(dst_reg, rdi)
            .map_err(|e| EmulationError::InvalidOperand(anyhow!(e)))?;
        if insn.has_rep_prefix() {
            state
                .write_reg(count_reg, 0)
                .map_err(|e| EmulationError::InvalidOperand(anyhow!(e)))?;
        }

        Ok(())
    }
}

pub(super) fn register(map: &mut InstructionMap) {
    map.add_insn(Code::Stosb_m8_AL, Box::new(Stos(Byte)));
    map.add_insn(Code::Stosw_m16_AX, Box::new(Stos(Half)));
    map.add_insn(Code::Stosd_m32_EAX, Box::new(Stos(Word)));
    map.add_insn(Code::Stosq_m64_RAX, Box::new(Stos(Double)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::emulator::testing::FlatPlatform;
    use crate::arch::x86::emulator::testing::*;
    use crate::arch::x86::regs::DF;

    #[test]
    fn test_rep_stosb() {
        let insn = [0xf3, 0xaa]; // rep stosb
        let mut platform = FlatPlatform::default();
        platform.load(0x3000, &[0x78, 0x56, 0x34, 0x12]);
        let mut vcpu = long_mode_vcpu(&[
            (Register::RCX, 3),
            (Register::RDI, 0x3000),
            (Register::RAX, 0x123456ff),
        ]);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(
            platform.read_memory(0x3000, AccessWidth::Word).unwrap(),
            0x12ffffff
        );
        assert_eq!(vcpu.regs.rdi, 0x3003);
    }

    #[test]
    fn test_stosw_to_device() {
        let insn = [0x66, 0xab]; // stosw
        let mut platform = FlatPlatform {
            device_base: 0xa0000,
            device_len: 0x20000,
            ..Default::default()
        };
        let mut vcpu = long_mode_vcpu(&[(Register::RDI, 0xa0010), (Register::RAX, 0x1234_aabb)]);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(
            platform.device_log,
            vec![(true, 0xa0010, AccessWidth::Half, 0xaabb)]
        );
    }

    #[test]
    fn test_rep_stosd_backwards() {
        let insn = [0xf3, 0xab]; // rep stosd
        let mut platform = FlatPlatform::default();
        let mut vcpu = long_mode_vcpu(&[
            (Register::RCX, 2),
            (Register::RDI, 0x3008),
            (Register::RAX, 0xaabbccdd),
        ]);
        vcpu.set_flags(vcpu.flags() | DF);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(platform.read_memory(0x3000, AccessWidth::Word).unwrap(), 0);
        assert_eq!(
            platform.read_memory(0x3004, AccessWidth::Double).unwrap(),
            0xaabbccdd_aabbccdd
        );
        assert_eq!(vcpu.regs.rdi, 0x3000);
    }

    #[test]
    fn test_rep_stosq() {
        let insn = [0xf3, 0x48, 0xab]; // rep stosq
        let mut platform = FlatPlatform::default();
        let mut vcpu = long_mode_vcpu(&[
            (Register::RCX, 2),
            (Register::RDI, 0x3000),
            (Register::RAX, 0x11223344aabbccdd),
        ]);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(
            platform.read_memory(0x3008, AccessWidth::Double).unwrap(),
            0x11223344aabbccdd
        );
        assert_eq!(platform.read_memory(0x3010, AccessWidth::Double).unwrap(), 0);
        assert_eq!(vcpu.regs.rcx, 0);
    }
}
