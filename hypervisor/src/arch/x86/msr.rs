// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Emulated model specific registers.

use std::collections::BTreeMap;

use crate::cpu::{SysRegError, SysRegId};

pub const MSR_IA32_TSC: u32 = 0x10;
pub const MSR_IA32_APICBASE: u32 = 0x1b;
pub const MSR_MTRRCAP: u32 = 0xfe;
pub const MSR_IA32_SYSENTER_CS: u32 = 0x174;
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x175;
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x176;
pub const MSR_IA32_MISC_ENABLE: u32 = 0x1a0;
pub const MSR_IA32_CR_PAT: u32 = 0x277;
pub const MSR_EFER: u32 = 0xc000_0080;
pub const MSR_STAR: u32 = 0xc000_0081;
pub const MSR_LSTAR: u32 = 0xc000_0082;
pub const MSR_SYSCALL_MASK: u32 = 0xc000_0084;
pub const MSR_FS_BASE: u32 = 0xc000_0100;
pub const MSR_GS_BASE: u32 = 0xc000_0101;
pub const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;

pub const APIC_DEFAULT_PHYS_BASE: u64 = 0xfee0_0000;
pub const APIC_BASE_BSP: u64 = 1 << 8;
pub const APIC_BASE_ENABLE: u64 = 1 << 11;

const MTRRCAP_VALUE: u64 = 0x508;
const PAT_RESET: u64 = 0x0007_0406_0007_0406;
const EFER_VALID: u64 = 0xd01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MsrAccess {
    ReadOnly,
    ReadWrite,
}

fn access(index: u32) -> Option<MsrAccess> {
    match index {
        MSR_MTRRCAP => Some(MsrAccess::ReadOnly),
        MSR_IA32_TSC
        | MSR_IA32_APICBASE
        | MSR_IA32_SYSENTER_CS..=MSR_IA32_SYSENTER_EIP
        | MSR_IA32_MISC_ENABLE
        | MSR_IA32_CR_PAT
        | MSR_EFER
        | MSR_STAR
        | MSR_LSTAR
        | MSR_SYSCALL_MASK
        | MSR_FS_BASE..=MSR_KERNEL_GS_BASE => Some(MsrAccess::ReadWrite),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsrTable {
    values: BTreeMap<u32, u64>,
}

impl MsrTable {
    pub fn new(bsp: bool) -> Self {
        let mut values = BTreeMap::new();
        let mut apic_base = APIC_DEFAULT_PHYS_BASE | APIC_BASE_ENABLE;
        if bsp {
            apic_base |= APIC_BASE_BSP;
        }
        values.insert(MSR_IA32_APICBASE, apic_base);
        values.insert(MSR_MTRRCAP, MTRRCAP_VALUE);
        values.insert(MSR_IA32_MISC_ENABLE, 1);
        values.insert(MSR_IA32_CR_PAT, PAT_RESET);
        MsrTable { values }
    }

    pub fn read(&self, index: u32) -> Result<u64, SysRegError> {
        match access(index) {
            Some(_) => Ok(self.values.get(&index).copied().unwrap_or(0)),
            None => Err(SysRegError::Unknown(SysRegId::Msr(index))),
        }
    }

    pub fn write(&mut self, index: u32, value: u64) -> Result<(), SysRegError> {
        match access(index) {
            Some(MsrAccess::ReadWrite) => {
                let value = match index {
                    MSR_EFER => value & EFER_VALID,
                    MSR_IA32_APICBASE => {
                        // BSP flag is fixed at reset.
                        let bsp = self.values.get(&index).copied().unwrap_or(0) & APIC_BASE_BSP;
                        (value & !APIC_BASE_BSP) | bsp
                    }
                    _ => value,
                };
                self.values.insert(index, value);
                Ok(())
            }
            Some(MsrAccess::ReadOnly) => Err(SysRegError::ReadOnly(SysRegId::Msr(index))),
            None => Err(SysRegError::Unknown(SysRegId::Msr(index))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apic_base_reset() {
        let bsp = MsrTable::new(true);
        let ap = MsrTable::new(false);
        assert_eq!(bsp.read(MSR_IA32_APICBASE).unwrap(), 0xfee0_0900);
        assert_eq!(ap.read(MSR_IA32_APICBASE).unwrap(), 0xfee0_0800);
    }

    #[test]
    fn read_only_and_unknown() {
        let mut msrs = MsrTable::new(true);
        assert!(matches!(
            msrs.write(MSR_MTRRCAP, 0),
            Err(SysRegError::ReadOnly(_))
        ));
        assert_eq!(msrs.read(MSR_MTRRCAP).unwrap(), MTRRCAP_VALUE);
        assert!(matches!(msrs.read(0x3a), Err(SysRegError::Unknown(_))));
    }

    #[test]
    fn efer_and_syscall_msrs() {
        let mut msrs = MsrTable::new(false);
        msrs.write(MSR_EFER, 0xffff).unwrap();
        assert_eq!(msrs.read(MSR_EFER).unwrap(), EFER_VALID);
        msrs.write(MSR_LSTAR, 0xffff_ffff_8100_0000).unwrap();
        assert_eq!(msrs.read(MSR_LSTAR).unwrap(), 0xffff_ffff_8100_0000);
        msrs.write(MSR_KERNEL_GS_BASE, 0x1000).unwrap();
        assert_eq!(msrs.read(MSR_KERNEL_GS_BASE).unwrap(), 0x1000);
    }
}
