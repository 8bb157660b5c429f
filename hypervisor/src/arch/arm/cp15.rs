// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2019 Intel Corporation
//

use crate::cpu::{SysRegError, SysRegId};

// SCTLR bits
pub const SCTLR_M: u32 = 1 << 0;
pub const SCTLR_A: u32 = 1 << 1;
pub const SCTLR_C: u32 = 1 << 2;
pub const SCTLR_V: u32 = 1 << 13;
pub const SCTLR_EE: u32 = 1 << 25;
pub const SCTLR_TE: u32 = 1 << 30;

// Cortex-A15 r2p1
const MIDR_DEFAULT: u32 = 0x412f_c0f1;
const CTR_DEFAULT: u32 = 0x8444_c004;
const CLIDR_DEFAULT: u32 = 0x0a20_0023;
const CCSIDR_DEFAULT: u32 = 0x701f_e00a;
const SCTLR_RESET: u32 = 0x00c5_0078;

const fn cp15(opc1: u8, crn: u8, crm: u8, opc2: u8) -> SysRegId {
    SysRegId::Cp15 {
        opc1,
        crn,
        crm,
        opc2,
    }
}

const MIDR: SysRegId = cp15(0, 0, 0, 0);
const CTR: SysRegId = cp15(0, 0, 0, 1);
const MPIDR: SysRegId = cp15(0, 0, 0, 5);
const CCSIDR: SysRegId = cp15(1, 0, 0, 0);
const CLIDR: SysRegId = cp15(1, 0, 0, 1);
const CSSELR: SysRegId = cp15(2, 0, 0, 0);
const SCTLR: SysRegId = cp15(0, 1, 0, 0);
const ACTLR: SysRegId = cp15(0, 1, 0, 1);
const CPACR: SysRegId = cp15(0, 1, 0, 2);
const TTBR0: SysRegId = cp15(0, 2, 0, 0);
const TTBR1: SysRegId = cp15(0, 2, 0, 1);
const TTBCR: SysRegId = cp15(0, 2, 0, 2);
const DACR: SysRegId = cp15(0, 3, 0, 0);
const DFSR: SysRegId = cp15(0, 5, 0, 0);
const IFSR: SysRegId = cp15(0, 5, 0, 1);
const DFAR: SysRegId = cp15(0, 6, 0, 0);
const IFAR: SysRegId = cp15(0, 6, 0, 2);
const PAR: SysRegId = cp15(0, 7, 4, 0);
const PRRR: SysRegId = cp15(0, 10, 2, 0);
const NMRR: SysRegId = cp15(0, 10, 2, 1);
const VBAR: SysRegId = cp15(0, 12, 0, 0);
const CONTEXTIDR: SysRegId = cp15(0, 13, 0, 1);
const TPIDRURW: SysRegId = cp15(0, 13, 0, 2);
const TPIDRURO: SysRegId = cp15(0, 13, 0, 3);
const TPIDRPRW: SysRegId = cp15(0, 13, 0, 4);

const TTBR0_64: SysRegId = SysRegId::Cp15Wide { opc1: 0, crm: 2 };
const TTBR1_64: SysRegId = SysRegId::Cp15Wide { opc1: 1, crm: 2 };
const PAR_64: SysRegId = SysRegId::Cp15Wide { opc1: 0, crm: 7 };

/// Emulated CP15 state of one VCPU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cp15State {
    pub midr: u32,
    pub mpidr: u32,
    pub csselr: u32,
    pub sctlr: u32,
    pub actlr: u32,
    pub cpacr: u32,
    pub ttbr0: u64,
    pub ttbr1: u64,
    pub ttbcr: u32,
    pub dacr: u32,
    pub dfsr: u32,
    pub ifsr: u32,
    pub dfar: u32,
    pub ifar: u32,
    pub par: u64,
    pub prrr: u32,
    pub nmrr: u32,
    pub vbar: u32,
    pub contextidr: u32,
    pub tpidrurw: u32,
    pub tpidruro: u32,
    pub tpidrprw: u32,
    /// Cache and TLB maintenance operations seen since reset.
    pub maintenance_ops: u64,
}

impl Cp15State {
    pub fn new(subid: usize) -> Self {
        Cp15State {
            midr: MIDR_DEFAULT,
            mpidr: 0x8000_0000 | (subid as u32 & 0xff),
            csselr: 0,
            sctlr: SCTLR_RESET,
            actlr: 0,
            cpacr: 0,
            ttbr0: 0,
            ttbr1: 0,
            ttbcr: 0,
            dacr: 0,
            dfsr: 0,
            ifsr: 0,
            dfar: 0,
            ifar: 0,
            par: 0,
            prrr: 0x000a_81a8,
            nmrr: 0x44e0_48e0,
            vbar: 0,
            contextidr: 0,
            tpidrurw: 0,
            tpidruro: 0,
            tpidrprw: 0,
            maintenance_ops: 0,
        }
    }

    fn is_maintenance(id: SysRegId) -> bool {
        matches!(id, SysRegId::Cp15 { opc1: 0, crn: 7 | 8, .. }) && id != PAR
    }

    pub fn read(&self, id: SysRegId) -> Result<u64, SysRegError> {
        let value = match id {
            MIDR => self.midr,
            CTR => CTR_DEFAULT,
            MPIDR => self.mpidr,
            CCSIDR => CCSIDR_DEFAULT,
            CLIDR => CLIDR_DEFAULT,
            CSSELR => self.csselr,
            SCTLR => self.sctlr,
            ACTLR => self.actlr,
            CPACR => self.cpacr,
            TTBR0 => self.ttbr0 as u32,
            TTBR1 => self.ttbr1 as u32,
            TTBCR => self.ttbcr,
            DACR => self.dacr,
            DFSR => self.dfsr,
            IFSR => self.ifsr,
            DFAR => self.dfar,
            IFAR => self.ifar,
            PAR => self.par as u32,
            PRRR => self.prrr,
            NMRR => self.nmrr,
            VBAR => self.vbar,
            CONTEXTIDR => self.contextidr,
            TPIDRURW => self.tpidrurw,
            TPIDRURO => self.tpidruro,
            TPIDRPRW => self.tpidrprw,
            TTBR0_64 => return Ok(self.ttbr0),
            TTBR1_64 => return Ok(self.ttbr1),
            PAR_64 => return Ok(self.par),
            _ => return Err(SysRegError::Unknown(id)),
        };
        Ok(u64::from(value))
    }

    pub fn write(&mut self, id: SysRegId, value: u64) -> Result<(), SysRegError> {
        let v = value as u32;
        match id {
            MIDR | CTR | MPIDR | CCSIDR | CLIDR => return Err(SysRegError::ReadOnly(id)),
            CSSELR => self.csselr = v & 0xf,
            SCTLR => self.sctlr = v,
            ACTLR => self.actlr = v,
            CPACR => self.cpacr = v,
            TTBR0 => self.ttbr0 = u64::from(v),
            TTBR1 => self.ttbr1 = u64::from(v),
            TTBCR => self.ttbcr = v,
            DACR => self.dacr = v,
            DFSR => self.dfsr = v,
            IFSR => self.ifsr = v,
            DFAR => self.dfar = v,
            IFAR => self.ifar = v,
            PAR => self.par = u64::from(v),
            PRRR => self.prrr = v,
            NMRR => self.nmrr = v,
            VBAR => self.vbar = v & !0x1f,
            CONTEXTIDR => self.contextidr = v,
            TPIDRURW => self.tpidrurw = v,
            TPIDRURO => self.tpidruro = v,
            TPIDRPRW => self.tpidrprw = v,
            TTBR0_64 => self.ttbr0 = value,
            TTBR1_64 => self.ttbr1 = value,
            PAR_64 => self.par = value,
            id if Self::is_maintenance(id) => {
                // Cache and TLB maintenance: stage-2 keeps the guest coherent.
                self.maintenance_ops += 1;
            }
            _ => return Err(SysRegError::Unknown(id)),
        }
        Ok(())
    }
}
