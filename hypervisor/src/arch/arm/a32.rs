// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2019 Intel Corporation
//

//! A32 load/store emulation for data aborts without a usable syndrome.

use super::Arm32Vcpu;
use crate::arch::emulator::{AccessWidth, EmulationError, EmulationResult, PlatformEmulator};

macro_rules! bits {
    ($insn:expr, $hi:expr, $lo:expr) => {
        (($insn >> $lo) & ((1u32 << ($hi - $lo + 1)) - 1))
    };
}

macro_rules! bit {
    ($insn:expr, $n:expr) => {
        (($insn >> $n) & 1) == 1
    };
}

pub(super) use {bit, bits};

/// Barrel shifter for register offsets with an immediate shift amount.
pub(super) fn shift_imm(value: u32, kind: u32, amount: u32, carry: bool) -> u32 {
    match (kind, amount) {
        (0, n) => value.wrapping_shl(n),
        (1, 0) => 0,
        (1, n) => value >> n,
        (2, 0) => ((value as i32) >> 31) as u32,
        (2, n) => ((value as i32) >> n) as u32,
        (_, 0) => (u32::from(carry) << 31) | (value >> 1),
        (_, n) => value.rotate_right(n),
    }
}

fn unpredictable(insn: u32, what: &str) -> EmulationError {
    EmulationError::Unpredictable(anyhow!("{}: {:#010x}", what, insn))
}

fn unsupported(insn: u32) -> EmulationError {
    EmulationError::UnsupportedInstruction(anyhow!("A32 {:#010x}", insn))
}

impl Arm32Vcpu {
    /// Emulate one A32 instruction. Returns `true` when it wrote the PC.
    pub(super) fn emulate_a32(
        &mut self,
        insn: u32,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<bool> {
        let cond = (insn >> 28) as u8;
        if cond != 0xf && !self.regs.condition_passed(cond) {
            return Ok(false);
        }

        match bits!(insn, 27, 25) {
            0b010 | 0b011 => self.a32_single(insn, platform),
            0b100 => self.a32_multiple(insn, platform),
            0b000 if insn & 0x0fb0_0ff0 == 0x0100_0090 => self.a32_swap(insn, platform),
            0b000
                if insn & 0x0f90_0ff0 == 0x0180_0f90 || insn & 0x0f90_0fff == 0x0190_0f9f =>
            {
                self.a32_exclusive(insn, platform)
            }
            0b000 if bit!(insn, 7) && bit!(insn, 4) && bits!(insn, 6, 5) != 0 => {
                self.a32_extra(insn, platform)
            }
            _ => Err(unsupported(insn)),
        }
    }

    /// LDR/STR/LDRB/STRB
    fn a32_single(
        &mut self,
        insn: u32,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<bool> {
        let reg_offset = bit!(insn, 25);
        let p = bit!(insn, 24);
        let u = bit!(insn, 23);
        let byte = bit!(insn, 22);
        let w = bit!(insn, 21);
        let load = bit!(insn, 20);
        let rn = bits!(insn, 19, 16) as usize;
        let rt = bits!(insn, 15, 12) as usize;

        if reg_offset && bit!(insn, 4) {
            // Media instructions share this space.
            return Err(unsupported(insn));
        }

        let offset = if reg_offset {
            let rm = bits!(insn, 3, 0) as usize;
            if rm == 15 {
                return Err(unpredictable(insn, "register offset from PC"));
            }
            shift_imm(
                self.operand(rm),
                bits!(insn, 6, 5),
                bits!(insn, 11, 7),
                self.carry(),
            )
        } else {
            bits!(insn, 11, 0)
        };

        let wback = !p || w;
        if wback && (rn == 15 || rn == rt) {
            return Err(unpredictable(insn, "writeback with PC or Rt as base"));
        }

        let base = self.operand(rn);
        let offset_addr = if u {
            base.wrapping_add(offset)
        } else {
            base.wrapping_sub(offset)
        };
        let addr = if p { offset_addr } else { base };
        let width = if byte {
            AccessWidth::Byte
        } else {
            AccessWidth::Word
        };

        self.check_alignment(addr, width.bytes() as u32, false)?;
        let mut branch = false;
        if load {
            let value = self.load(platform, addr, width)?;
            if wback {
                self.regs.set(rn, offset_addr);
            }
            branch = self.write_reg(rt, value);
        } else {
            let value = if byte {
                self.operand(rt) & 0xff
            } else {
                self.operand(rt)
            };
            self.store(platform, addr, width, value)?;
            if wback {
                self.regs.set(rn, offset_addr);
            }
        }
        Ok(branch)
    }

    /// LDRH/STRH/LDRSB/LDRSH/LDRD/STRD
    fn a32_extra(
        &mut self,
        insn: u32,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<bool> {
        let p = bit!(insn, 24);
        let u = bit!(insn, 23);
        let imm = bit!(insn, 22);
        let w = bit!(insn, 21);
        let load = bit!(insn, 20);
        let rn = bits!(insn, 19, 16) as usize;
        let rt = bits!(insn, 15, 12) as usize;
        let op2 = bits!(insn, 6, 5);

        let offset = if imm {
            (bits!(insn, 11, 8) << 4) | bits!(insn, 3, 0)
        } else {
            let rm = bits!(insn, 3, 0) as usize;
            if rm == 15 {
                return Err(unpredictable(insn, "register offset from PC"));
            }
            self.operand(rm)
        };

        let wback = !p || w;
        if !p && w {
            // LDRHT and friends run with user permissions; not emulated.
            return Err(unsupported(insn));
        }
        if wback && (rn == 15 || rn == rt) {
            return Err(unpredictable(insn, "writeback with PC or Rt as base"));
        }

        let base = self.operand(rn);
        let offset_addr = if u {
            base.wrapping_add(offset)
        } else {
            base.wrapping_sub(offset)
        };
        let addr = if p { offset_addr } else { base };

        let dual = !load && op2 != 0b01;
        if dual {
            if rt % 2 == 1 || rt == 14 {
                return Err(unpredictable(insn, "LDRD/STRD with odd or LR transfer register"));
            }
            if wback && rn == rt + 1 {
                return Err(unpredictable(insn, "LDRD/STRD writeback into Rt2"));
            }
            self.check_alignment(addr, 4, true)?;
            if op2 == 0b10 {
                // LDRD
                let lo = self.load(platform, addr, AccessWidth::Word)?;
                let hi = self.load(platform, addr.wrapping_add(4), AccessWidth::Word)?;
                if wback {
                    self.regs.set(rn, offset_addr);
                }
                self.regs.set(rt, lo);
                self.regs.set(rt + 1, hi);
            } else {
                // STRD
                let lo = self.operand(rt);
                let hi = self.operand(rt + 1);
                self.store(platform, addr, AccessWidth::Word, lo)?;
                self.store(platform, addr.wrapping_add(4), AccessWidth::Word, hi)?;
                if wback {
                    self.regs.set(rn, offset_addr);
                }
            }
            return Ok(false);
        }

        if rt == 15 {
            return Err(unpredictable(insn, "halfword transfer with PC"));
        }
        let (width, signed) = match op2 {
            0b01 => (AccessWidth::Half, false),
            0b10 => (AccessWidth::Byte, true),
            _ => (AccessWidth::Half, true),
        };
        self.check_alignment(addr, width.bytes() as u32, false)?;
        if load {
            let mut value = self.load(platform, addr, width)?;
            if signed {
                value = width.sign_extend(u64::from(value)) as u32;
            }
            if wback {
                self.regs.set(rn, offset_addr);
            }
            self.regs.set(rt, value);
        } else {
            let value = self.operand(rt) & 0xffff;
            self.store(platform, addr, width, value)?;
            if wback {
                self.regs.set(rn, offset_addr);
            }
        }
        Ok(false)
    }

    /// LDM/STM in all four addressing modes.
    fn a32_multiple(
        &mut self,
        insn: u32,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<bool> {
        let p = bit!(insn, 24);
        let u = bit!(insn, 23);
        let user = bit!(insn, 22);
        let wback = bit!(insn, 21);
        let load = bit!(insn, 20);
        let rn = bits!(insn, 19, 16) as usize;
        let list = bits!(insn, 15, 0) as u16;

        if user {
            return Err(unsupported(insn));
        }
        self.transfer_multiple(insn, rn, list, p, u, wback, load, platform)
    }

    /// Shared LDM/STM core for A32 and T32.
    ///
    /// Every word is a separate platform access in ascending address order.
    /// Loaded registers and the base writeback are committed only after the
    /// last access succeeded.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn transfer_multiple(
        &mut self,
        insn: u32,
        rn: usize,
        list: u16,
        before: bool,
        increment: bool,
        wback: bool,
        load: bool,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<bool> {
        if list == 0 {
            return Err(unpredictable(insn, "empty register list"));
        }
        if rn == 15 {
            return Err(unpredictable(insn, "PC as base register"));
        }
        if wback && load && list & (1 << rn) != 0 {
            return Err(unpredictable(insn, "writeback with base in load list"));
        }

        let count = list.count_ones();
        let base = self.operand(rn);
        let start = match (increment, before) {
            (true, false) => base,
            (true, true) => base.wrapping_add(4),
            (false, false) => base.wrapping_sub(4 * count).wrapping_add(4),
            (false, true) => base.wrapping_sub(4 * count),
        };
        let final_base = if increment {
            base.wrapping_add(4 * count)
        } else {
            base.wrapping_sub(4 * count)
        };
        self.check_alignment(start, 4, true)?;

        let mut addr = start;
        let mut loaded = Vec::with_capacity(count as usize);
        for reg in (0..16).filter(|r| list & (1 << r) != 0) {
            if load {
                loaded.push((reg, self.load(platform, addr, AccessWidth::Word)?));
            } else {
                let value = self.operand(reg);
                self.store(platform, addr, AccessWidth::Word, value)?;
            }
            addr = addr.wrapping_add(4);
        }

        let mut branch = false;
        for (reg, value) in loaded {
            branch |= self.write_reg(reg, value);
        }
        if wback {
            self.regs.set(rn, final_base);
        }
        Ok(branch)
    }

    /// SWP/SWPB
    fn a32_swap(
        &mut self,
        insn: u32,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<bool> {
        let byte = bit!(insn, 22);
        let rn = bits!(insn, 19, 16) as usize;
        let rt = bits!(insn, 15, 12) as usize;
        let rt2 = bits!(insn, 3, 0) as usize;
        if rn == 15 || rt == 15 || rt2 == 15 || rn == rt || rn == rt2 {
            return Err(unpredictable(insn, "SWP register overlap"));
        }

        let width = if byte {
            AccessWidth::Byte
        } else {
            AccessWidth::Word
        };
        let addr = self.regs.get(rn);
        self.check_alignment(addr, width.bytes() as u32, true)?;
        let new = u64::from(self.regs.get(rt2)) & width.mask();
        let old = platform
            .swap_memory(u64::from(addr), width, new)
            .map_err(EmulationError::PlatformEmulationError)?;
        self.regs.set(rt, old as u32);
        Ok(false)
    }

    /// LDREX/STREX{B,H}. The exclusive monitor always grants the store.
    fn a32_exclusive(
        &mut self,
        insn: u32,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<bool> {
        let load = bit!(insn, 20);
        let rn = bits!(insn, 19, 16) as usize;
        let rd = bits!(insn, 15, 12) as usize;
        let width = match bits!(insn, 22, 21) {
            0b00 => AccessWidth::Word,
            0b10 => AccessWidth::Byte,
            0b11 => AccessWidth::Half,
            _ => return Err(unsupported(insn)),
        };
        if rn == 15 || rd == 15 {
            return Err(unpredictable(insn, "exclusive access with PC"));
        }
        let addr = self.regs.get(rn);
        self.check_alignment(addr, width.bytes() as u32, true)?;

        if load {
            let value = self.load(platform, addr, width)?;
            self.regs.set(rd, value);
            self.exclusive = Some(addr);
        } else {
            let rt = bits!(insn, 3, 0) as usize;
            if rt == 15 || rd == rn || rd == rt {
                return Err(unpredictable(insn, "STREX register overlap"));
            }
            let value = u64::from(self.regs.get(rt)) & width.mask();
            self.store(platform, addr, width, value as u32)?;
            self.exclusive = None;
            self.regs.set(rd, 0);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::super::regs::MODE_SVC;
    use super::*;
    use crate::arch::emulator::testing::FlatPlatform;
    use crate::arch::emulator::{EmulationError, PlatformError};

    const DEV: u64 = 0x0900_0000;

    fn setup(insn: u32) -> (Arm32Vcpu, FlatPlatform) {
        let mut vcpu = Arm32Vcpu::new(0, 0x8000);
        assert_eq!(vcpu.regs.mode(), MODE_SVC);
        let mut platform = FlatPlatform {
            device_base: DEV,
            device_len: 0x1000,
            device_value: 0x90,
            ..Default::default()
        };
        platform.load(0x8000, &insn.to_le_bytes());
        (vcpu, platform)
    }

    #[test]
    fn ldr_from_device() {
        // ldr r0, [r1]
        let (mut vcpu, mut platform) = setup(0xe591_0000);
        vcpu.regs.set(1, 0x0900_0018);
        vcpu.emulate_instruction(&mut platform).unwrap();
        assert_eq!(vcpu.regs.get(0), 0x90);
        assert_eq!(vcpu.regs.pc, 0x8004);
        assert_eq!(
            platform.device_log,
            vec![(false, DEV + 0x18, AccessWidth::Word, 0)]
        );
    }

    #[test]
    fn str_post_index_writeback() {
        // str r2, [r3], #4
        let (mut vcpu, mut platform) = setup(0xe483_2004);
        vcpu.regs.set(2, 0xdead_beef);
        vcpu.regs.set(3, 0x0900_0100);
        vcpu.emulate_instruction(&mut platform).unwrap();
        assert_eq!(vcpu.regs.get(3), 0x0900_0104);
        assert_eq!(
            platform.device_log,
            vec![(true, DEV + 0x100, AccessWidth::Word, 0xdead_beef)]
        );
    }

    #[test]
    fn ldrsh_sign_extends() {
        // ldrsh r4, [r5, #2]
        let (mut vcpu, mut platform) = setup(0xe1d5_40f2);
        platform.device_value = 0x8001;
        vcpu.regs.set(5, 0x0900_0000);
        vcpu.emulate_instruction(&mut platform).unwrap();
        assert_eq!(vcpu.regs.get(4), 0xffff_8001);
    }

    #[test]
    fn ldm_across_ram_and_device() {
        // ldmia r0!, {r1-r4}: two words of RAM then two device words.
        let (mut vcpu, mut platform) = setup(0xe8b0_001e);
        platform.load(DEV - 8, &[1, 0, 0, 0, 2, 0, 0, 0]);
        vcpu.regs.set(0, (DEV - 8) as u32);
        vcpu.emulate_instruction(&mut platform).unwrap();

        assert_eq!(
            platform.device_log,
            vec![
                (false, DEV, AccessWidth::Word, 0),
                (false, DEV + 4, AccessWidth::Word, 0),
            ]
        );
        assert_eq!(vcpu.regs.get(1), 1);
        assert_eq!(vcpu.regs.get(2), 2);
        assert_eq!(vcpu.regs.get(3), 0x90);
        assert_eq!(vcpu.regs.get(4), 0x90);
        assert_eq!(vcpu.regs.get(0), (DEV + 8) as u32);
    }

    #[test]
    fn stmdb_order() {
        // stmdb r0!, {r1, r2}
        let (mut vcpu, mut platform) = setup(0xe920_0006);
        vcpu.regs.set(0, (DEV + 0x10) as u32);
        vcpu.regs.set(1, 11);
        vcpu.regs.set(2, 22);
        vcpu.emulate_instruction(&mut platform).unwrap();
        assert_eq!(
            platform.device_log,
            vec![
                (true, DEV + 0x8, AccessWidth::Word, 11),
                (true, DEV + 0xc, AccessWidth::Word, 22),
            ]
        );
        assert_eq!(vcpu.regs.get(0), (DEV + 0x8) as u32);
    }

    #[test]
    fn unpredictable_encodings() {
        // ldm r0!, {} and ldmia r0!, {r0, r1}
        for insn in [0xe8b0_0000u32, 0xe8b0_0003] {
            let (mut vcpu, mut platform) = setup(insn);
            vcpu.regs.set(0, DEV as u32);
            assert!(matches!(
                vcpu.emulate_instruction(&mut platform),
                Err(EmulationError::Unpredictable(_))
            ));
            assert_eq!(vcpu.regs.pc, 0x8000);
        }
    }

    #[test]
    fn ldm_unaligned_is_alignment_fault() {
        let (mut vcpu, mut platform) = setup(0xe890_0006);
        vcpu.regs.set(0, (DEV + 2) as u32);
        assert!(matches!(
            vcpu.emulate_instruction(&mut platform),
            Err(EmulationError::PlatformEmulationError(
                PlatformError::Alignment(_)
            ))
        ));
        assert!(platform.device_log.is_empty());
    }

    #[test]
    fn swp_exchanges() {
        // swp r0, r1, [r2]
        let (mut vcpu, mut platform) = setup(0xe102_0091);
        vcpu.regs.set(1, 0x55);
        vcpu.regs.set(2, DEV as u32);
        vcpu.emulate_instruction(&mut platform).unwrap();
        assert_eq!(vcpu.regs.get(0), 0x90);
        assert_eq!(
            platform.device_log,
            vec![
                (false, DEV, AccessWidth::Word, 0),
                (true, DEV, AccessWidth::Word, 0x55),
            ]
        );
    }

    #[test]
    fn condition_failed_skips() {
        // ldreq r0, [r1] with Z clear
        let (mut vcpu, mut platform) = setup(0x0591_0000);
        vcpu.regs.set(1, DEV as u32);
        vcpu.emulate_instruction(&mut platform).unwrap();
        assert!(platform.device_log.is_empty());
        assert_eq!(vcpu.regs.pc, 0x8004);
    }

    #[test]
    fn barrel_shifter() {
        assert_eq!(shift_imm(1, 0, 4, false), 16);
        assert_eq!(shift_imm(0x8000_0000, 1, 0, false), 0);
        assert_eq!(shift_imm(0x8000_0000, 2, 0, false), 0xffff_ffff);
        assert_eq!(shift_imm(2, 3, 0, true), 0x8000_0001);
        assert_eq!(shift_imm(1, 3, 1, false), 0x8000_0000);
    }
}
