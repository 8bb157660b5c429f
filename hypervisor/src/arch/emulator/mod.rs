//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width of a single guest data access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessWidth {
    Byte,
    Half,
    Word,
    Double,
}

impl AccessWidth {
    pub fn from_bytes(len: usize) -> Option<Self> {
        match len {
            1 => Some(AccessWidth::Byte),
            2 => Some(AccessWidth::Half),
            4 => Some(AccessWidth::Word),
            8 => Some(AccessWidth::Double),
            _ => None,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Half => 2,
            AccessWidth::Word => 4,
            AccessWidth::Double => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    /// Mask covering the low `self.bits()` bits.
    pub fn mask(self) -> u64 {
        match self {
            AccessWidth::Double => u64::MAX,
            w => (1u64 << w.bits()) - 1,
        }
    }

    /// Sign extend the low `self.bits()` bits of `value` to 64 bits.
    pub fn sign_extend(self, value: u64) -> u64 {
        let shift = 64 - self.bits();
        (((value << shift) as i64) >> shift) as u64
    }

    /// Reverse the byte order of the low `self.bytes()` bytes.
    pub fn swap(self, value: u64) -> u64 {
        match self {
            AccessWidth::Byte => value & 0xff,
            AccessWidth::Half => u64::from((value as u16).swap_bytes()),
            AccessWidth::Word => u64::from((value as u32).swap_bytes()),
            AccessWidth::Double => value.swap_bytes(),
        }
    }

    pub fn is_aligned(self, addr: u64) -> bool {
        addr % self.bytes() as u64 == 0
    }
}

impl Display for AccessWidth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-byte", self.bytes())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    /// Convert a value produced in `self` byte order into `to` byte order.
    pub fn convert(self, to: Endianness, width: AccessWidth, value: u64) -> u64 {
        if self == to {
            value & width.mask()
        } else {
            width.swap(value)
        }
    }
}

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Invalid address: {0}")]
    InvalidAddress(#[source] anyhow::Error),

    #[error("Invalid register: {0}")]
    InvalidRegister(#[source] anyhow::Error),

    #[error("Invalid operand: {0}")]
    InvalidOperand(#[source] anyhow::Error),

    #[error("Bad guest access at {0:#x}")]
    BadGuestAccess(u64),

    #[error("Unaligned access at {0:#x}")]
    Alignment(u64),

    #[error("Memory read failure: {0}")]
    MemoryReadFailure(#[source] anyhow::Error),

    #[error("Memory write failure: {0}")]
    MemoryWriteFailure(#[source] anyhow::Error),

    #[error("Emulator failure: {0}")]
    EmulatorFailure(#[source] anyhow::Error),

    #[error("Host failure: {0}")]
    HostFailure(#[source] anyhow::Error),

    #[error("Translate virtual address: {0}")]
    TranslateVirtualAddress(#[source] anyhow::Error),

    #[error("Unsupported CPU Mode: {0}")]
    UnsupportedCpuMode(#[source] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum EmulationError {
    #[error("Unsupported instruction: {0}")]
    UnsupportedInstruction(#[source] anyhow::Error),

    #[error("Unpredictable instruction: {0}")]
    Unpredictable(#[source] anyhow::Error),

    #[error("Unsupported memory size: {0}")]
    UnsupportedMemorySize(#[source] anyhow::Error),

    #[error("Invalid operand: {0}")]
    InvalidOperand(#[source] anyhow::Error),

    #[error("Instruction fetching error: {0}")]
    InstructionFetchingError(#[source] anyhow::Error),

    #[error("Platform emulation error: {0}")]
    PlatformEmulationError(#[source] PlatformError),

    #[error(transparent)]
    EmulationError(#[from] anyhow::Error),
}

/// The PlatformEmulator trait emulates a guest platform for instruction
/// emulators. It routes every data access of an emulated instruction to
/// guest RAM or to a device emulator.
///
/// Addresses are guest virtual addresses; translation to guest physical is
/// the platform's business.
pub trait PlatformEmulator {
    /// Read `width` bytes at `gva`, returned as the guest would see it in a
    /// register.
    ///
    /// # Arguments
    ///
    /// * `gva` - Guest virtual address to read from.
    /// * `width` - Access width.
    ///
    fn read_memory(&mut self, gva: u64, width: AccessWidth) -> Result<u64, PlatformError>;

    /// Write the low `width` bytes of `value` at `gva`.
    ///
    /// # Arguments
    ///
    /// * `gva` - Guest virtual address to write into.
    /// * `width` - Access width.
    /// * `value` - Value to be written.
    ///
    fn write_memory(&mut self, gva: u64, width: AccessWidth, value: u64)
        -> Result<(), PlatformError>;

    /// Store `value` at `gva` and return the previous content, as one
    /// indivisible operation from the target's point of view.
    fn swap_memory(
        &mut self,
        gva: u64,
        width: AccessWidth,
        value: u64,
    ) -> Result<u64, PlatformError>;

    /// Fetch instruction bytes from memory.
    ///
    /// # Arguments
    ///
    /// * `ip` - Instruction pointer virtual address to start fetching instructions from.
    ///
    fn fetch(&mut self, ip: u64, instruction_bytes: &mut [u8]) -> Result<(), PlatformError>;
}

pub type EmulationResult<S> = std::result::Result<S, EmulationError>;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_helpers() {
        assert_eq!(AccessWidth::from_bytes(4), Some(AccessWidth::Word));
        assert_eq!(AccessWidth::from_bytes(3), None);
        assert_eq!(AccessWidth::Half.mask(), 0xffff);
        assert_eq!(AccessWidth::Byte.sign_extend(0x80), 0xffff_ffff_ffff_ff80);
        assert_eq!(AccessWidth::Word.sign_extend(0x7fff_ffff), 0x7fff_ffff);
        assert_eq!(AccessWidth::Word.swap(0x1122_3344), 0x4433_2211);
        assert!(AccessWidth::Double.is_aligned(0x1000));
        assert!(!AccessWidth::Half.is_aligned(0x1001));
    }

    #[test]
    fn endianness_conversion() {
        let le = Endianness::Little;
        let be = Endianness::Big;
        assert_eq!(le.convert(le, AccessWidth::Half, 0x1234), 0x1234);
        assert_eq!(le.convert(be, AccessWidth::Half, 0x1234), 0x3412);
        assert_eq!(be.convert(le, AccessWidth::Byte, 0x1ab), 0xab);
    }
}
