//
// Copyright © 2021 Microsoft
//
// SPDX-License-Identifier: Apache-2.0
//

//
// MOVS - Move Data from String to String
//

use crate::arch::emulator::AccessWidth::{Byte, Double, Half, Word};
use crate::arch::emulator::EmulationError;
use crate::arch::x86::emulator::instructions::*;

pub struct Movs(AccessWidth);

impl InstructionHandler for Movs {
    fn emulate(
        &self,
        insn: &Instruction,
        state: &mut dyn CpuStateManager,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<()> {
        let (count_reg, src_reg, dst_reg) = string_registers(state);
        let mut count: u64 = if insn.has_rep_prefix() {
            state
                .read_reg(count_reg)
                .map_err(|e| EmulationError::InvalidOperand(anyhow!(e)))?
        } else {
            1
        };

        let mut rsi = state
            .read_reg(src_reg)
            .map_err(|e| EmulationError::InvalidOperand(anyhow!(e)))?;
        let mut rdi = state
            .read_reg(dst_reg)
            .map_err(|e| EmulationError::InvalidOperand(anyhow!(e)))?;

        while count > 0 {
            let value = platform
                .read_memory(rsi, self.0)
                .map_err(EmulationError::PlatformEmulationError)?;
            platform
                .write_memory(rdi, self.0, value)
                .map_err(EmulationError::PlatformEmulationError)?;

            rsi = string_step(state, rsi, self.0);
            rdi = string_step(state, rdi, self.0);
            count -= 1;
        }

        state
            .write_reg(src_reg, rsi)
            .map_err(|e| EmulationError::InvalidOperand(anyhow!(e)))?;
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
    map.add_insn(Code::Movsb_m8_m8, Box::new(Movs(Byte)));
    map.add_insn(Code::Movsw_m16_m16, Box::new(Movs(Half)));
    map.add_insn(Code::Movsd_m32_m32, Box::new(Movs(Word)));
    map.add_insn(Code::Movsq_m64_m64, Box::new(Movs(Double)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::emulator::testing::FlatPlatform;
    use crate::arch::x86::emulator::testing::*;
    use crate::arch::x86::regs::DF;

    const SRC: u64 = 0x4000;

    fn platform() -> FlatPlatform {
        let mut platform = FlatPlatform {
            device_base: 0xfee0_0000,
            device_len: 0x1000,
            device_value: 0x5aa5_5aa5,
            ..Default::default()
        };
        platform.load(
            SRC,
            &[
                0x78, 0x56, 0x34, 0x12, // 0x12345678
                0xdd, 0xcc, 0xbb, 0xaa, // 0xaabbccdd
                0xa5, 0x5a, 0xa5, 0x5a, // 0x5aa55aa5
                0xcd, 0xcd, 0xcd, 0xcd, // 0xcdcdcdcd
            ],
        );
        platform
    }

    #[test]
    fn test_rep_movsq_m64_m64() {
        let insn = [0xf3, 0x48, 0xa5]; // rep movsq
        let mut platform = platform();
        let mut vcpu = long_mode_vcpu(&[
            (Register::RCX, 2),
            (Register::RSI, SRC),
            (Register::RDI, 0x8000),
        ]);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(
            platform.read_memory(0x8000, AccessWidth::Double).unwrap(),
            0xaabbccdd12345678
        );
        assert_eq!(
            platform.read_memory(0x8008, AccessWidth::Double).unwrap(),
            0xcdcdcdcd5aa55aa5
        );
        assert_eq!(platform.read_memory(0x8010, AccessWidth::Double).unwrap(), 0);
        assert_eq!(vcpu.regs.rcx, 0);
        assert_eq!(vcpu.regs.rsi, SRC + 16);
        assert_eq!(vcpu.regs.rdi, 0x8010);
    }

    #[test]
    fn test_movsd_to_device() {
        let insn = [0xa5]; // movsd
        let mut platform = platform();
        let mut vcpu = long_mode_vcpu(&[
            (Register::RCX, 7),
            (Register::RSI, SRC + 4),
            (Register::RDI, 0xfee0_0300),
        ]);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(
            platform.device_log,
            vec![(true, 0xfee0_0300, AccessWidth::Word, 0xaabbccdd)]
        );
        // no rep prefix, the count is left alone
        assert_eq!(vcpu.regs.rcx, 7);
    }

    #[test]
    fn test_rep_movsw_from_device_backwards() {
        let insn = [0x66, 0xf3, 0xa5]; // rep movsw
        let mut platform = platform();
        let mut vcpu = long_mode_vcpu(&[
            (Register::RCX, 2),
            (Register::RSI, 0xfee0_0010),
            (Register::RDI, 0x8002),
        ]);
        vcpu.set_flags(vcpu.flags() | DF);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(
            platform.read_memory(0x8000, AccessWidth::Word).unwrap(),
            0x5aa55aa5
        );
        assert_eq!(vcpu.regs.rsi, 0xfee0_000c);
        assert_eq!(vcpu.regs.rdi, 0x7ffe);
    }

    #[test]
    fn test_movsb_m8_m8() {
        let insn = [0xa4]; // movsb
        let mut platform = platform();
        let mut vcpu = long_mode_vcpu(&[(Register::RSI, SRC), (Register::RDI, 0x8000)]);
        run(&mut vcpu, &mut platform, &insn);

        assert_eq!(platform.read_memory(0x8000, AccessWidth::Half).unwrap(), 0x78);
        // the source is left as is
        assert_eq!(platform.read_memory(SRC, AccessWidth::Byte).unwrap(), 0x78);
    }
}
