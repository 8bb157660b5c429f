// Copyright © 2024 Institute of Software, CAS. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! VS-level CSRs as the guest sees them through its S-mode names.

use std::sync::OnceLock;
use std::time::Instant;

use crate::cpu::{SysRegError, SysRegId};

// Supervisor CSR numbers
pub const CSR_SSTATUS: u16 = 0x100;
pub const CSR_SIE: u16 = 0x104;
pub const CSR_STVEC: u16 = 0x105;
pub const CSR_SCOUNTEREN: u16 = 0x106;
pub const CSR_SENVCFG: u16 = 0x10a;
pub const CSR_SSCRATCH: u16 = 0x140;
pub const CSR_SEPC: u16 = 0x141;
pub const CSR_SCAUSE: u16 = 0x142;
pub const CSR_STVAL: u16 = 0x143;
pub const CSR_SIP: u16 = 0x144;
pub const CSR_SATP: u16 = 0x180;
pub const CSR_CYCLE: u16 = 0xc00;
pub const CSR_TIME: u16 = 0xc01;
pub const CSR_INSTRET: u16 = 0xc02;

// sstatus bits
pub const SSTATUS_SIE: u64 = 1 << 1;
pub const SSTATUS_SPIE: u64 = 1 << 5;
pub const SSTATUS_SPP: u64 = 1 << 8;

// hvip bits
pub const HVIP_VSSIP: u64 = 1 << 2;
pub const HVIP_VSTIP: u64 = 1 << 6;
pub const HVIP_VSEIP: u64 = 1 << 10;

/// Timebase advertised to guests.
pub const TIMEBASE_FREQUENCY: u64 = 10_000_000;

const SIP_WRITABLE: u64 = 1 << 1;

/// Guest view of `time`, `cycle` and `instret`: ticks since the first query.
pub fn timebase_ticks() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let elapsed = START.get_or_init(Instant::now).elapsed();
    (elapsed.as_nanos() * u128::from(TIMEBASE_FREQUENCY) / 1_000_000_000) as u64
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RiscvCsrs {
    pub vsstatus: u64,
    pub vsie: u64,
    pub vstvec: u64,
    pub vsscratch: u64,
    pub vsepc: u64,
    pub vscause: u64,
    pub vstval: u64,
    pub vsatp: u64,
    pub hvip: u64,
    pub scounteren: u64,
    pub senvcfg: u64,
    pub htimedelta: u64,
}

impl RiscvCsrs {
    /// sip as the guest reads it: VS bits of hvip shifted down to S positions.
    pub fn sip(&self) -> u64 {
        (self.hvip & (HVIP_VSSIP | HVIP_VSTIP | HVIP_VSEIP)) >> 1
    }

    pub fn read(&self, id: SysRegId) -> Result<u64, SysRegError> {
        let SysRegId::Csr(csr) = id else {
            return Err(SysRegError::Unknown(id));
        };
        Ok(match csr {
            CSR_SSTATUS => self.vsstatus,
            CSR_SIE => self.vsie,
            CSR_STVEC => self.vstvec,
            CSR_SCOUNTEREN => self.scounteren,
            CSR_SENVCFG => self.senvcfg,
            CSR_SSCRATCH => self.vsscratch,
            CSR_SEPC => self.vsepc,
            CSR_SCAUSE => self.vscause,
            CSR_STVAL => self.vstval,
            CSR_SIP => self.sip(),
            CSR_SATP => self.vsatp,
            CSR_CYCLE | CSR_TIME | CSR_INSTRET => {
                timebase_ticks().wrapping_add(self.htimedelta)
            }
            _ => return Err(SysRegError::Unknown(id)),
        })
    }

    pub fn write(&mut self, id: SysRegId, value: u64) -> Result<(), SysRegError> {
        let SysRegId::Csr(csr) = id else {
            return Err(SysRegError::Unknown(id));
        };
        // csr[11:10] == 0b11 is the read-only space
        if csr >> 10 == 0b11 {
            return Err(SysRegError::ReadOnly(id));
        }
        match csr {
            CSR_SSTATUS => self.vsstatus = value,
            CSR_SIE => self.vsie = value,
            CSR_STVEC => self.vstvec = value,
            CSR_SCOUNTEREN => self.scounteren = value,
            CSR_SENVCFG => self.senvcfg = value,
            CSR_SSCRATCH => self.vsscratch = value,
            CSR_SEPC => self.vsepc = value,
            CSR_SCAUSE => self.vscause = value,
            CSR_STVAL => self.vstval = value,
            // only SSIP is guest writable
            CSR_SIP => {
                self.hvip = (self.hvip & !HVIP_VSSIP) | ((value & SIP_WRITABLE) << 1);
            }
            CSR_SATP => self.vsatp = value,
            _ => return Err(SysRegError::Unknown(id)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sip_reflects_hvip() {
        let mut csrs = RiscvCsrs {
            hvip: HVIP_VSTIP | HVIP_VSEIP,
            ..Default::default()
        };
        assert_eq!(csrs.read(SysRegId::Csr(CSR_SIP)).unwrap(), (1 << 5) | (1 << 9));
        csrs.write(SysRegId::Csr(CSR_SIP), 0x222).unwrap();
        assert_eq!(csrs.hvip, HVIP_VSSIP | HVIP_VSTIP | HVIP_VSEIP);
    }

    #[test]
    fn counters_are_read_only_and_monotonic() {
        let mut csrs = RiscvCsrs::default();
        let t0 = csrs.read(SysRegId::Csr(CSR_TIME)).unwrap();
        let t1 = csrs.read(SysRegId::Csr(CSR_TIME)).unwrap();
        assert!(t1 >= t0);
        assert!(matches!(
            csrs.write(SysRegId::Csr(CSR_TIME), 0),
            Err(SysRegError::ReadOnly(_))
        ));
        assert!(matches!(
            csrs.read(SysRegId::Csr(0x5a8)),
            Err(SysRegError::Unknown(_))
        ));
    }
}
