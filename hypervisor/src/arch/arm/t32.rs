// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2019 Intel Corporation
//

//! T32 load/store subset.

use super::a32::{bit, bits};
use super::Arm32Vcpu;
use crate::arch::emulator::{AccessWidth, EmulationError, EmulationResult, PlatformEmulator};

/// Length in bytes of the Thumb instruction starting with `hw1`.
pub(super) fn instruction_len(hw1: u16) -> u64 {
    match hw1 >> 11 {
        0b11101..=0b11111 => 4,
        _ => 2,
    }
}

fn unsupported(insn: u32) -> EmulationError {
    EmulationError::UnsupportedInstruction(anyhow!("T32 {:#x}", insn))
}

fn unpredictable(insn: u32, what: &str) -> EmulationError {
    EmulationError::Unpredictable(anyhow!("{}: {:#x}", what, insn))
}

/// Transfer width and signedness shared by the T32 forms.
#[derive(Clone, Copy)]
struct Xfer {
    width: AccessWidth,
    signed: bool,
    load: bool,
}

impl Arm32Vcpu {
    /// Emulate one Thumb instruction; `insn` holds `hw1` in the low half for
    /// 16-bit encodings and `hw1 << 16 | hw2` for 32-bit ones.
    pub(super) fn emulate_t32(
        &mut self,
        insn: u32,
        wide: bool,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<bool> {
        let cond = self.regs.it_condition();
        if !self.regs.condition_passed(cond) {
            return Ok(false);
        }
        if wide {
            self.t32_wide(insn, platform)
        } else {
            self.t32_narrow(insn, platform)
        }
    }

    fn t32_narrow(
        &mut self,
        insn: u32,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<bool> {
        let rt = bits!(insn, 2, 0) as usize;
        let rn = bits!(insn, 5, 3) as usize;

        match bits!(insn, 15, 12) {
            0b0101 => {
                let rm = bits!(insn, 8, 6) as usize;
                let xfer = match bits!(insn, 11, 9) {
                    0b000 => (AccessWidth::Word, false, false),
                    0b001 => (AccessWidth::Half, false, false),
                    0b010 => (AccessWidth::Byte, false, false),
                    0b011 => (AccessWidth::Byte, true, true),
                    0b100 => (AccessWidth::Word, false, true),
                    0b101 => (AccessWidth::Half, false, true),
                    0b110 => (AccessWidth::Byte, false, true),
                    _ => (AccessWidth::Half, true, true),
                };
                let addr = self.regs.get(rn).wrapping_add(self.regs.get(rm));
                self.t32_transfer(
                    Xfer {
                        width: xfer.0,
                        signed: xfer.1,
                        load: xfer.2,
                    },
                    rt,
                    addr,
                    platform,
                )
            }
            0b0110 | 0b0111 => {
                let byte = bit!(insn, 12);
                let imm5 = bits!(insn, 10, 6);
                let (width, offset) = if byte {
                    (AccessWidth::Byte, imm5)
                } else {
                    (AccessWidth::Word, imm5 << 2)
                };
                let addr = self.regs.get(rn).wrapping_add(offset);
                let xfer = Xfer {
                    width,
                    signed: false,
                    load: bit!(insn, 11),
                };
                self.t32_transfer(xfer, rt, addr, platform)
            }
            0b1000 => {
                let addr = self.regs.get(rn).wrapping_add(bits!(insn, 10, 6) << 1);
                let xfer = Xfer {
                    width: AccessWidth::Half,
                    signed: false,
                    load: bit!(insn, 11),
                };
                self.t32_transfer(xfer, rt, addr, platform)
            }
            0b1001 => {
                let rt = bits!(insn, 10, 8) as usize;
                let addr = self.regs.get(13).wrapping_add(bits!(insn, 7, 0) << 2);
                let xfer = Xfer {
                    width: AccessWidth::Word,
                    signed: false,
                    load: bit!(insn, 11),
                };
                self.t32_transfer(xfer, rt, addr, platform)
            }
            0b1100 => {
                let rn = bits!(insn, 10, 8) as usize;
                let list = bits!(insn, 7, 0) as u16;
                let load = bit!(insn, 11);
                let wback = !load || list & (1 << rn) == 0;
                self.transfer_multiple(insn, rn, list, false, true, wback, load, platform)
            }
            0b1011 if bits!(insn, 10, 9) == 0b10 => {
                let load = bit!(insn, 11);
                let mut list = bits!(insn, 7, 0) as u16;
                if bit!(insn, 8) {
                    list |= if load { 1 << 15 } else { 1 << 14 };
                }
                if load {
                    // POP = LDMIA SP!
                    self.transfer_multiple(insn, 13, list, false, true, true, true, platform)
                } else {
                    // PUSH = STMDB SP!
                    self.transfer_multiple(insn, 13, list, true, false, true, false, platform)
                }
            }
            _ => Err(unsupported(insn)),
        }
    }

    fn t32_wide(
        &mut self,
        insn: u32,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<bool> {
        let hw1 = insn >> 16;
        let hw2 = insn & 0xffff;
        let rn = bits!(hw1, 3, 0) as usize;
        let rt = bits!(hw2, 15, 12) as usize;

        if hw1 & 0xfe40 == 0xe800 {
            // LDM/STM (T2)
            let mode = bits!(hw1, 8, 7);
            if mode != 0b01 && mode != 0b10 {
                return Err(unsupported(insn));
            }
            if bit!(hw2, 13) {
                return Err(unpredictable(insn, "SP in register list"));
            }
            let load = bit!(hw1, 4);
            return self.transfer_multiple(
                insn,
                rn,
                hw2 as u16,
                mode == 0b10,
                mode == 0b01,
                bit!(hw1, 5),
                load,
                platform,
            );
        }

        if hw1 & 0xfe40 == 0xe840 {
            // LDRD/STRD immediate (T1)
            let p = bit!(hw1, 8);
            let u = bit!(hw1, 7);
            let w = bit!(hw1, 5);
            let load = bit!(hw1, 4);
            let rt2 = bits!(hw2, 11, 8) as usize;
            if !p && !w {
                // Exclusive and table branch encodings.
                return Err(unsupported(insn));
            }
            if rn == 15 || rt == 15 || rt2 == 15 || (w && (rn == rt || rn == rt2)) {
                return Err(unpredictable(insn, "LDRD/STRD register use"));
            }
            let offset = bits!(hw2, 7, 0) << 2;
            let base = self.regs.get(rn);
            let offset_addr = if u {
                base.wrapping_add(offset)
            } else {
                base.wrapping_sub(offset)
            };
            let addr = if p { offset_addr } else { base };
            self.check_alignment(addr, 4, true)?;
            if load {
                let lo = self.load(platform, addr, AccessWidth::Word)?;
                let hi = self.load(platform, addr.wrapping_add(4), AccessWidth::Word)?;
                self.regs.set(rt, lo);
                self.regs.set(rt2, hi);
            } else {
                let lo = self.regs.get(rt);
                let hi = self.regs.get(rt2);
                self.store(platform, addr, AccessWidth::Word, lo)?;
                self.store(platform, addr.wrapping_add(4), AccessWidth::Word, hi)?;
            }
            if w {
                self.regs.set(rn, offset_addr);
            }
            return Ok(false);
        }

        if hw1 & 0xfe00 != 0xf800 {
            return Err(unsupported(insn));
        }

        // Single load/store: 1111 100 S imm12 size L Rn
        let signed = bit!(hw1, 8);
        let load = bit!(hw1, 4);
        let width = match bits!(hw1, 6, 5) {
            0b00 => AccessWidth::Byte,
            0b01 => AccessWidth::Half,
            0b10 if !signed => AccessWidth::Word,
            _ => return Err(unsupported(insn)),
        };
        if rn == 15 {
            // Literal pool loads do not fault on MMIO.
            return Err(unsupported(insn));
        }
        if signed && !load {
            return Err(unsupported(insn));
        }
        let xfer = Xfer {
            width,
            signed,
            load,
        };
        let base = self.regs.get(rn);

        if bit!(hw1, 7) {
            // imm12
            let addr = base.wrapping_add(bits!(hw2, 11, 0));
            return self.t32_transfer(xfer, rt, addr, platform);
        }

        if bit!(hw2, 11) {
            // imm8 with P/U/W
            let p = bit!(hw2, 10);
            let u = bit!(hw2, 9);
            let w = bit!(hw2, 8);
            if p && u && !w {
                // LDRT/STRT
                return Err(unsupported(insn));
            }
            if !p && !w {
                return Err(unpredictable(insn, "post-index without writeback"));
            }
            if w && rn == rt {
                return Err(unpredictable(insn, "writeback with Rt as base"));
            }
            let offset = bits!(hw2, 7, 0);
            let offset_addr = if u {
                base.wrapping_add(offset)
            } else {
                base.wrapping_sub(offset)
            };
            let addr = if p { offset_addr } else { base };
            let branch = self.t32_transfer(xfer, rt, addr, platform)?;
            if w {
                self.regs.set(rn, offset_addr);
            }
            return Ok(branch);
        }

        if bits!(hw2, 11, 6) == 0 {
            // Register offset with LSL #imm2
            let rm = bits!(hw2, 3, 0) as usize;
            if rm == 13 || rm == 15 {
                return Err(unpredictable(insn, "SP or PC as offset register"));
            }
            let addr = base.wrapping_add(self.regs.get(rm) << bits!(hw2, 5, 4));
            return self.t32_transfer(xfer, rt, addr, platform);
        }

        Err(unsupported(insn))
    }

    fn t32_transfer(
        &mut self,
        xfer: Xfer,
        rt: usize,
        addr: u32,
        platform: &mut dyn PlatformEmulator,
    ) -> EmulationResult<bool> {
        self.check_alignment(addr, xfer.width.bytes() as u32, false)?;
        if xfer.load {
            let mut value = self.load(platform, addr, xfer.width)?;
            if xfer.signed {
                value = xfer.width.sign_extend(u64::from(value)) as u32;
            }
            Ok(self.write_reg(rt, value))
        } else {
            let value = (u64::from(self.regs.get(rt)) & xfer.width.mask()) as u32;
            self.store(platform, addr, xfer.width, value)?;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::regs::CPSR_T;
    use super::*;
    use crate::arch::emulator::testing::FlatPlatform;

    const DEV: u64 = 0x1c09_0000;

    fn thumb(code: &[u16]) -> (Arm32Vcpu, FlatPlatform) {
        let mut vcpu = Arm32Vcpu::new(0, 0x8000);
        vcpu.regs.cpsr |= CPSR_T;
        let mut platform = FlatPlatform {
            device_base: DEV,
            device_len: 0x1000,
            device_value: 0xa5a5_1234,
            ..Default::default()
        };
        let bytes: Vec<u8> = code.iter().flat_map(|hw| hw.to_le_bytes()).collect();
        platform.load(0x8000, &bytes);
        (vcpu, platform)
    }

    #[test]
    fn narrow_ldr_imm() {
        // ldr r0, [r1, #4]
        let (mut vcpu, mut platform) = thumb(&[0x6848]);
        vcpu.regs.set(1, DEV as u32);
        vcpu.emulate_instruction(&mut platform).unwrap();
        assert_eq!(vcpu.regs.get(0), 0xa5a5_1234);
        assert_eq!(vcpu.regs.pc, 0x8002);
        assert_eq!(platform.device_log[0].1, DEV + 4);
    }

    #[test]
    fn narrow_strh_and_ldrsb() {
        // strh r2, [r3, #2]
        let (mut vcpu, mut platform) = thumb(&[0x805a]);
        vcpu.regs.set(2, 0x1_beef);
        vcpu.regs.set(3, DEV as u32);
        vcpu.emulate_instruction(&mut platform).unwrap();
        assert_eq!(
            platform.device_log,
            vec![(true, DEV + 2, AccessWidth::Half, 0xbeef)]
        );

        // ldrsb r0, [r1, r2]
        let (mut vcpu, mut platform) = thumb(&[0x5688]);
        platform.device_value = 0x80;
        vcpu.regs.set(1, DEV as u32);
        vcpu.regs.set(2, 3);
        vcpu.emulate_instruction(&mut platform).unwrap();
        assert_eq!(vcpu.regs.get(0), 0xffff_ff80);
    }

    #[test]
    fn wide_ldr_imm12() {
        // ldr.w r4, [r5, #0x18]
        let (mut vcpu, mut platform) = thumb(&[0xf8d5, 0x4018]);
        vcpu.regs.set(5, DEV as u32);
        vcpu.emulate_instruction(&mut platform).unwrap();
        assert_eq!(vcpu.regs.get(4), 0xa5a5_1234);
        assert_eq!(vcpu.regs.pc, 0x8004);
    }

    #[test]
    fn wide_str_post_index() {
        // str r1, [r0], #4
        let (mut vcpu, mut platform) = thumb(&[0xf840, 0x1b04]);
        vcpu.regs.set(0, DEV as u32);
        vcpu.regs.set(1, 7);
        vcpu.emulate_instruction(&mut platform).unwrap();
        assert_eq!(platform.device_log, vec![(true, DEV, AccessWidth::Word, 7)]);
        assert_eq!(vcpu.regs.get(0), (DEV + 4) as u32);
    }

    #[test]
    fn it_block_skips_and_advances() {
        // Inside "ITE EQ", second slot (NE) with Z set: skipped.
        let (mut vcpu, mut platform) = thumb(&[0x6808]);
        vcpu.regs.cpsr |= super::super::regs::CPSR_Z;
        vcpu.regs.set_itstate(0x18);
        vcpu.regs.set(1, DEV as u32);
        vcpu.emulate_instruction(&mut platform).unwrap();
        assert!(platform.device_log.is_empty());
        assert_eq!(vcpu.regs.pc, 0x8002);
        assert_eq!(vcpu.regs.itstate(), 0);
    }

    #[test]
    fn push_to_device_stack() {
        // push {r0, lr}
        let (mut vcpu, mut platform) = thumb(&[0xb501]);
        vcpu.regs.set(13, (DEV + 0x100) as u32);
        vcpu.regs.set(0, 1);
        vcpu.regs.set(14, 0x8001);
        vcpu.emulate_instruction(&mut platform).unwrap();
        assert_eq!(
            platform.device_log,
            vec![
                (true, DEV + 0xf8, AccessWidth::Word, 1),
                (true, DEV + 0xfc, AccessWidth::Word, 0x8001),
            ]
        );
        assert_eq!(vcpu.regs.get(13), (DEV + 0xf8) as u32);
    }

    #[test]
    fn length_decode() {
        assert_eq!(instruction_len(0x6848), 2);
        assert_eq!(instruction_len(0xf8d5), 4);
        assert_eq!(instruction_len(0xe892), 4);
        assert_eq!(instruction_len(0xe7fe), 2);
    }
}
