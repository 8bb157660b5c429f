// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2019 Intel Corporation
//

//! ARMv7 banked register file.

// CPSR bits
pub const CPSR_N: u32 = 1 << 31;
pub const CPSR_Z: u32 = 1 << 30;
pub const CPSR_C: u32 = 1 << 29;
pub const CPSR_V: u32 = 1 << 28;
pub const CPSR_J: u32 = 1 << 24;
pub const CPSR_E: u32 = 1 << 9;
pub const CPSR_A: u32 = 1 << 8;
pub const CPSR_I: u32 = 1 << 7;
pub const CPSR_F: u32 = 1 << 6;
pub const CPSR_T: u32 = 1 << 5;
pub const CPSR_MODE_MASK: u32 = 0x1f;
pub const CPSR_IT_MASK: u32 = 0x0600_fc00;

// Processor modes
pub const MODE_USR: u32 = 0x10;
pub const MODE_FIQ: u32 = 0x11;
pub const MODE_IRQ: u32 = 0x12;
pub const MODE_SVC: u32 = 0x13;
pub const MODE_ABT: u32 = 0x17;
pub const MODE_UND: u32 = 0x1b;
pub const MODE_SYS: u32 = 0x1f;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Bank {
    Usr,
    Fiq,
    Irq,
    Svc,
    Abt,
    Und,
}

impl Bank {
    fn of(mode: u32) -> Bank {
        match mode {
            MODE_FIQ => Bank::Fiq,
            MODE_IRQ => Bank::Irq,
            MODE_SVC => Bank::Svc,
            MODE_ABT => Bank::Abt,
            MODE_UND => Bank::Und,
            _ => Bank::Usr,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Banked {
    sp: u32,
    lr: u32,
    spsr: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arm32Regs {
    /// r0-r7, shared by every mode.
    low: [u32; 8],
    /// r8-r12 outside FIQ mode.
    high_usr: [u32; 5],
    /// r8-r12 in FIQ mode.
    high_fiq: [u32; 5],
    banked: [Banked; 6],
    pub pc: u32,
    pub cpsr: u32,
}

impl Default for Arm32Regs {
    fn default() -> Self {
        Arm32Regs {
            low: [0; 8],
            high_usr: [0; 5],
            high_fiq: [0; 5],
            banked: [Banked::default(); 6],
            pc: 0,
            cpsr: MODE_SVC | CPSR_A | CPSR_I | CPSR_F,
        }
    }
}

impl Arm32Regs {
    pub fn mode(&self) -> u32 {
        self.cpsr & CPSR_MODE_MASK
    }

    pub fn thumb(&self) -> bool {
        self.cpsr & CPSR_T != 0
    }

    fn bank(&self) -> Bank {
        Bank::of(self.mode())
    }

    /// Read r0-r14 as seen by the current mode. r15 returns the raw PC.
    pub fn get(&self, reg: usize) -> u32 {
        match reg {
            0..=7 => self.low[reg],
            8..=12 if self.mode() == MODE_FIQ => self.high_fiq[reg - 8],
            8..=12 => self.high_usr[reg - 8],
            13 => self.banked[self.bank().index()].sp,
            14 => self.banked[self.bank().index()].lr,
            _ => self.pc,
        }
    }

    pub fn set(&mut self, reg: usize, value: u32) {
        let bank = self.bank().index();
        match reg {
            0..=7 => self.low[reg] = value,
            8..=12 if self.mode() == MODE_FIQ => self.high_fiq[reg - 8] = value,
            8..=12 => self.high_usr[reg - 8] = value,
            13 => self.banked[bank].sp = value,
            14 => self.banked[bank].lr = value,
            _ => self.pc = value,
        }
    }

    /// Banked LR of `mode`, independent of the current mode.
    pub fn lr_of(&self, mode: u32) -> u32 {
        self.banked[Bank::of(mode).index()].lr
    }

    pub fn set_lr_of(&mut self, mode: u32, value: u32) {
        self.banked[Bank::of(mode).index()].lr = value;
    }

    pub fn spsr_of(&self, mode: u32) -> u32 {
        self.banked[Bank::of(mode).index()].spsr
    }

    pub fn set_spsr_of(&mut self, mode: u32, value: u32) {
        self.banked[Bank::of(mode).index()].spsr = value;
    }

    /// IT[7:0] from CPSR[15:10] and CPSR[26:25].
    pub fn itstate(&self) -> u8 {
        (((self.cpsr >> 8) & 0xfc) | ((self.cpsr >> 25) & 0x3)) as u8
    }

    pub fn set_itstate(&mut self, it: u8) {
        let it = u32::from(it);
        self.cpsr &= !CPSR_IT_MASK;
        self.cpsr |= ((it & 0xfc) << 8) | ((it & 0x3) << 25);
    }

    /// Move to the next slot of an IT block.
    pub fn advance_itstate(&mut self) {
        let it = self.itstate();
        if it & 0x7 == 0 {
            self.set_itstate(0);
        } else {
            self.set_itstate((it & 0xe0) | ((it << 1) & 0x1f));
        }
    }

    /// Condition of the current IT slot, `AL` outside an IT block.
    pub fn it_condition(&self) -> u8 {
        let it = self.itstate();
        if it & 0xf == 0 {
            0xe
        } else {
            it >> 4
        }
    }

    /// Evaluate a 4-bit condition code against NZCV.
    pub fn condition_passed(&self, cond: u8) -> bool {
        let n = self.cpsr & CPSR_N != 0;
        let z = self.cpsr & CPSR_Z != 0;
        let c = self.cpsr & CPSR_C != 0;
        let v = self.cpsr & CPSR_V != 0;
        let result = match cond >> 1 {
            0 => z,
            1 => c,
            2 => n,
            3 => v,
            4 => c && !z,
            5 => n == v,
            6 => !z && n == v,
            _ => true,
        };
        if cond & 1 == 1 && cond != 0xf {
            !result
        } else {
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banked_sp_lr() {
        let mut r = Arm32Regs::default();
        r.set(13, 0x8000);
        r.set(14, 0x1234);
        r.set(8, 8);
        r.cpsr = (r.cpsr & !CPSR_MODE_MASK) | MODE_FIQ;
        assert_eq!(r.get(13), 0);
        assert_eq!(r.get(8), 0);
        r.set(8, 88);
        r.cpsr = (r.cpsr & !CPSR_MODE_MASK) | MODE_SVC;
        assert_eq!(r.get(13), 0x8000);
        assert_eq!(r.get(14), 0x1234);
        assert_eq!(r.get(8), 8);
        assert_eq!(r.lr_of(MODE_SVC), 0x1234);
    }

    #[test]
    fn itstate_advance() {
        let mut r = Arm32Regs::default();
        // ITTE EQ: firstcond=0000, mask=0110
        r.set_itstate(0x06);
        assert_eq!(r.it_condition(), 0x0);
        r.advance_itstate();
        assert_eq!(r.itstate(), 0x0c);
        r.advance_itstate();
        assert_eq!(r.itstate(), 0x18);
        assert_eq!(r.it_condition(), 0x1);
        r.advance_itstate();
        assert_eq!(r.itstate(), 0);
        assert_eq!(r.it_condition(), 0xe);
    }

    #[test]
    fn conditions() {
        let mut r = Arm32Regs::default();
        r.cpsr |= CPSR_Z;
        assert!(r.condition_passed(0x0));
        assert!(!r.condition_passed(0x1));
        assert!(r.condition_passed(0xe));
        assert!(!r.condition_passed(0x8));
        r.cpsr |= CPSR_N | CPSR_V;
        r.cpsr &= !CPSR_Z;
        assert!(r.condition_passed(0xc));
    }
}
