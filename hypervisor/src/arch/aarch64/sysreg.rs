// Copyright 2022 Arm Limited (or its affiliates). All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use crate::cpu::{SysRegError, SysRegId};

pub const SCTLR_M: u64 = 1 << 0;
pub const SCTLR_E0E: u64 = 1 << 24;
pub const SCTLR_EE: u64 = 1 << 25;

const SCTLR_EL1_RESET: u64 = 0x30d0_0800;
// Cortex-A57 r1p0
const MIDR_EL1_DEFAULT: u64 = 0x411f_d070;
const ID_AA64PFR0_EL1: u64 = 0x0000_0000_0000_0011;
const ID_AA64MMFR0_EL1: u64 = 0x0000_0000_0000_1124;

macro_rules! sysreg {
    ($op0:expr, $op1:expr, $crn:expr, $crm:expr, $op2:expr) => {
        SysRegId::Aarch64 {
            op0: $op0,
            op1: $op1,
            crn: $crn,
            crm: $crm,
            op2: $op2,
        }
    };
}

const MIDR: SysRegId = sysreg!(3, 0, 0, 0, 0);
const MPIDR: SysRegId = sysreg!(3, 0, 0, 0, 5);
const REVIDR: SysRegId = sysreg!(3, 0, 0, 0, 6);
const PFR0: SysRegId = sysreg!(3, 0, 0, 4, 0);
const MMFR0: SysRegId = sysreg!(3, 0, 0, 7, 0);
const SCTLR: SysRegId = sysreg!(3, 0, 1, 0, 0);
const ACTLR: SysRegId = sysreg!(3, 0, 1, 0, 1);
const CPACR: SysRegId = sysreg!(3, 0, 1, 0, 2);
const TTBR0: SysRegId = sysreg!(3, 0, 2, 0, 0);
const TTBR1: SysRegId = sysreg!(3, 0, 2, 0, 1);
const TCR: SysRegId = sysreg!(3, 0, 2, 0, 2);
const AFSR0: SysRegId = sysreg!(3, 0, 5, 1, 0);
const AFSR1: SysRegId = sysreg!(3, 0, 5, 1, 1);
const ESR: SysRegId = sysreg!(3, 0, 5, 2, 0);
const FAR: SysRegId = sysreg!(3, 0, 6, 0, 0);
const PAR: SysRegId = sysreg!(3, 0, 7, 4, 0);
const MAIR: SysRegId = sysreg!(3, 0, 10, 2, 0);
const AMAIR: SysRegId = sysreg!(3, 0, 10, 3, 0);
const VBAR: SysRegId = sysreg!(3, 0, 12, 0, 0);
const CONTEXTIDR: SysRegId = sysreg!(3, 0, 13, 0, 1);
const TPIDR_EL1: SysRegId = sysreg!(3, 0, 13, 0, 4);
const CNTKCTL: SysRegId = sysreg!(3, 0, 14, 1, 0);
const TPIDR_EL0: SysRegId = sysreg!(3, 3, 13, 0, 2);
const TPIDRRO_EL0: SysRegId = sysreg!(3, 3, 13, 0, 3);
const OSLAR: SysRegId = sysreg!(2, 0, 1, 0, 4);
const OSLSR: SysRegId = sysreg!(2, 0, 1, 1, 4);
const OSDLR: SysRegId = sysreg!(2, 0, 1, 3, 4);

/// EL1 system registers of one VCPU.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Aarch64SysRegs {
    pub midr_el1: u64,
    pub mpidr_el1: u64,
    pub sctlr_el1: u64,
    pub actlr_el1: u64,
    pub cpacr_el1: u64,
    pub ttbr0_el1: u64,
    pub ttbr1_el1: u64,
    pub tcr_el1: u64,
    pub afsr0_el1: u64,
    pub afsr1_el1: u64,
    pub esr_el1: u64,
    pub far_el1: u64,
    pub par_el1: u64,
    pub mair_el1: u64,
    pub amair_el1: u64,
    pub vbar_el1: u64,
    pub contextidr_el1: u64,
    pub tpidr_el1: u64,
    pub cntkctl_el1: u64,
    pub tpidr_el0: u64,
    pub tpidrro_el0: u64,
    pub oslsr_el1: u64,
    pub osdlr_el1: u64,
    /// Set/way cache maintenance requests.
    pub set_way_ops: u64,
}

impl Aarch64SysRegs {
    pub fn new(subid: usize) -> Self {
        let aff0 = subid as u64 & 0xf;
        let aff1 = (subid as u64 >> 4) & 0xff;
        Aarch64SysRegs {
            midr_el1: MIDR_EL1_DEFAULT,
            mpidr_el1: (1 << 31) | (aff1 << 8) | aff0,
            sctlr_el1: SCTLR_EL1_RESET,
            oslsr_el1: 0x8,
            ..Default::default()
        }
    }

    pub fn read(&self, id: SysRegId) -> Result<u64, SysRegError> {
        Ok(match id {
            MIDR => self.midr_el1,
            MPIDR => self.mpidr_el1,
            REVIDR => 0,
            PFR0 => ID_AA64PFR0_EL1,
            MMFR0 => ID_AA64MMFR0_EL1,
            SCTLR => self.sctlr_el1,
            ACTLR => self.actlr_el1,
            CPACR => self.cpacr_el1,
            TTBR0 => self.ttbr0_el1,
            TTBR1 => self.ttbr1_el1,
            TCR => self.tcr_el1,
            AFSR0 => self.afsr0_el1,
            AFSR1 => self.afsr1_el1,
            ESR => self.esr_el1,
            FAR => self.far_el1,
            PAR => self.par_el1,
            MAIR => self.mair_el1,
            AMAIR => self.amair_el1,
            VBAR => self.vbar_el1,
            CONTEXTIDR => self.contextidr_el1,
            TPIDR_EL1 => self.tpidr_el1,
            CNTKCTL => self.cntkctl_el1,
            TPIDR_EL0 => self.tpidr_el0,
            TPIDRRO_EL0 => self.tpidrro_el0,
            OSLSR => self.oslsr_el1,
            OSDLR => self.osdlr_el1,
            _ => return Err(SysRegError::Unknown(id)),
        })
    }

    pub fn write(&mut self, id: SysRegId, value: u64) -> Result<(), SysRegError> {
        match id {
            MIDR | MPIDR | REVIDR | PFR0 | MMFR0 | OSLSR => return Err(SysRegError::ReadOnly(id)),
            SCTLR => self.sctlr_el1 = value,
            ACTLR => self.actlr_el1 = value,
            CPACR => self.cpacr_el1 = value,
            TTBR0 => self.ttbr0_el1 = value,
            TTBR1 => self.ttbr1_el1 = value,
            TCR => self.tcr_el1 = value,
            AFSR0 => self.afsr0_el1 = value,
            AFSR1 => self.afsr1_el1 = value,
            ESR => self.esr_el1 = value,
            FAR => self.far_el1 = value,
            PAR => self.par_el1 = value,
            MAIR => self.mair_el1 = value,
            AMAIR => self.amair_el1 = value,
            VBAR => self.vbar_el1 = value & !0x7ff,
            CONTEXTIDR => self.contextidr_el1 = value,
            TPIDR_EL1 => self.tpidr_el1 = value,
            CNTKCTL => self.cntkctl_el1 = value,
            TPIDR_EL0 => self.tpidr_el0 = value,
            TPIDRRO_EL0 => self.tpidrro_el0 = value,
            OSLAR => {
                // OSLK mirrors OSLAR.OSLK
                self.oslsr_el1 = (self.oslsr_el1 & !0x2) | ((value & 1) << 1);
            }
            OSDLR => self.osdlr_el1 = value & 1,
            SysRegId::Aarch64 {
                op0: 1,
                op1: 0,
                crn: 7,
                crm: 6 | 10 | 14,
                op2: 2,
            } => self.set_way_ops += 1,
            _ => return Err(SysRegError::Unknown(id)),
        }
        Ok(())
    }
}
