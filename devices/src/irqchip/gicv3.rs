// Copyright 2021 Arm Limited (or its affiliates). All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! GICv3 with affinity routing: a distributor window, one redistributor
//! frame pair per CPU and the system register CPU interface.

use hypervisor::{AccessWidth, SysRegId};
use vm_device::{EmulatorError, IrqError, Result};

use super::gic::{byte_of, BitBank, GicCore, GIC_NR_PRIVATE, GIC_SPURIOUS};
use super::{Ack, ChipOutput};

pub const GICD_SIZE: u64 = 0x10000;
pub const GICR_SIZE: u64 = 0x20000;
pub(crate) const GICR_DEFAULT_OFFSET: u64 = 0xa0000;

const GICD_CTLR: u64 = 0x0000;
const GICD_TYPER: u64 = 0x0004;
const GICD_IIDR: u64 = 0x0008;
const GICD_IGROUPR: u64 = 0x0080;
const GICD_ISENABLER: u64 = 0x0100;
const GICD_ICENABLER: u64 = 0x0180;
const GICD_ISPENDR: u64 = 0x0200;
const GICD_ICPENDR: u64 = 0x0280;
const GICD_ISACTIVER: u64 = 0x0300;
const GICD_ICACTIVER: u64 = 0x0380;
const GICD_IPRIORITYR: u64 = 0x0400;
const GICD_ICFGR: u64 = 0x0c00;
const GICD_IROUTER: u64 = 0x6000;
const GICD_PIDR2: u64 = 0xffe8;

const GICR_CTLR: u64 = 0x0000;
const GICR_IIDR: u64 = 0x0004;
const GICR_TYPER: u64 = 0x0008;
const GICR_WAKER: u64 = 0x0014;
const GICR_PIDR2: u64 = 0xffe8;
const GICR_SGI_BASE: u64 = 0x10000;

const GICD_CTLR_ENABLE_G0: u32 = 1 << 0;
const GICD_CTLR_ENABLE_G1NS: u32 = 1 << 1;
const GICD_CTLR_ARE_NS: u32 = 1 << 4;
const GICD_CTLR_DS: u32 = 1 << 6;
const GICR_WAKER_PROCESSOR_SLEEP: u32 = 1 << 1;
const GICR_WAKER_CHILDREN_ASLEEP: u32 = 1 << 2;
const GICR_TYPER_LAST: u64 = 1 << 4;
const GIC_PIDR2_ARCH_GICV3: u32 = 0x3 << 4;
const GIC_IIDR_VALUE: u32 = 0x0300_043b;
const GICD_IROUTER_IRM: u64 = 1 << 31;

// ICC_*_EL1 as (crn, crm, op2) with op0 = 3, op1 = 0.
const ICC_PMR: (u8, u8, u8) = (4, 6, 0);
const ICC_DIR: (u8, u8, u8) = (12, 11, 1);
const ICC_RPR: (u8, u8, u8) = (12, 11, 3);
const ICC_SGI1R: (u8, u8, u8) = (12, 11, 5);
const ICC_IAR1: (u8, u8, u8) = (12, 12, 0);
const ICC_EOIR1: (u8, u8, u8) = (12, 12, 1);
const ICC_HPPIR1: (u8, u8, u8) = (12, 12, 2);
const ICC_BPR1: (u8, u8, u8) = (12, 12, 3);
const ICC_CTLR: (u8, u8, u8) = (12, 12, 4);
const ICC_SRE: (u8, u8, u8) = (12, 12, 5);
const ICC_IGRPEN1: (u8, u8, u8) = (12, 12, 7);

fn icc_reg(id: SysRegId) -> Option<(u8, u8, u8)> {
    match id {
        SysRegId::Aarch64 {
            op0: 3,
            op1: 0,
            crn,
            crm,
            op2,
        } => Some((crn, crm, op2)),
        _ => None,
    }
}

pub struct GicV3 {
    core: GicCore,
    redist_offset: u64,
    ctlr: u32,
    irouter: Vec<u64>,
    waker: Vec<u32>,
    icc_ctlr: Vec<u64>,
}

impl GicV3 {
    pub fn new(num_cpu: usize, num_irq: u32, redist_offset: u64) -> Result<Self> {
        if redist_offset < GICD_SIZE {
            return Err(EmulatorError::InvalidConfig(format!(
                "redistributors at {:#x} overlap the distributor",
                redist_offset
            )));
        }
        let core = GicCore::new(num_cpu, num_irq, 0)?;
        Ok(GicV3 {
            core,
            redist_offset,
            ctlr: 0,
            irouter: vec![0; num_irq as usize],
            waker: vec![GICR_WAKER_PROCESSOR_SLEEP | GICR_WAKER_CHILDREN_ASLEEP; num_cpu],
            icc_ctlr: vec![0; num_cpu],
        })
    }

    pub fn set_irq(
        &mut self,
        line: u32,
        cpu_hint: Option<usize>,
        level: bool,
        out: &mut ChipOutput,
    ) -> std::result::Result<(), IrqError> {
        self.core.set_irq(line, cpu_hint, level, out)
    }

    pub fn reset(&mut self, out: &mut ChipOutput) {
        let num_cpu = self.core.num_cpu();
        self.ctlr = 0;
        self.irouter.iter_mut().for_each(|r| *r = 0);
        self.waker = vec![GICR_WAKER_PROCESSOR_SLEEP | GICR_WAKER_CHILDREN_ASLEEP; num_cpu];
        self.icc_ctlr = vec![0; num_cpu];
        self.core.reset(out);
    }

    pub fn acknowledge_vector(&mut self, cpu: usize, out: &mut ChipOutput) -> Ack {
        match self.core.acknowledge(cpu, out) {
            GIC_SPURIOUS => Ack::None,
            irq => Ack::Vector(irq & 0x3ff),
        }
    }

    fn set_router(&mut self, irq: u32, value: u64) {
        if irq < GIC_NR_PRIVATE || irq >= self.core.num_irq() {
            return;
        }
        self.irouter[irq as usize] = value & (GICD_IROUTER_IRM | 0xff_00ff_ffff);
        let mask = if value & GICD_IROUTER_IRM != 0 {
            self.core.all_cpu_mask()
        } else {
            let aff0 = (value & 0xff) as usize;
            let upper = value & 0xff_00ff_ff00;
            if upper == 0 && aff0 < self.core.num_cpu() {
                1 << aff0
            } else {
                0
            }
        };
        self.core.set_target(irq, mask);
    }

    /// Bitmap, priority and configuration bytes. Private interrupts are
    /// reserved in the distributor under affinity routing.
    fn bank_readb(&self, cpu: usize, offset: u64, private: bool) -> Option<u8> {
        let reserved = |irq: u32| (irq < GIC_NR_PRIVATE) != private;
        let core = &self.core;
        let v = match offset {
            GICD_IGROUPR..=0x0ff => 0xff,
            GICD_ISENABLER..=0x1ff => {
                let irq = ((offset - GICD_ISENABLER) % 0x80) as u32 * 8;
                if reserved(irq) {
                    0
                } else {
                    core.read_bits(BitBank::Enabled, irq, cpu)
                }
            }
            GICD_ISPENDR..=0x2ff => {
                let irq = ((offset - GICD_ISPENDR) % 0x80) as u32 * 8;
                if reserved(irq) {
                    0
                } else {
                    core.read_bits(BitBank::Pending, irq, cpu)
                }
            }
            GICD_ISACTIVER..=0x3ff => {
                let irq = ((offset - GICD_ISACTIVER) % 0x80) as u32 * 8;
                if reserved(irq) {
                    0
                } else {
                    core.read_bits(BitBank::Active, irq, cpu)
                }
            }
            GICD_IPRIORITYR..=0x7ff => {
                let irq = (offset - GICD_IPRIORITYR) as u32;
                if reserved(irq) || irq >= core.num_irq() {
                    0
                } else {
                    core.priority(irq, cpu)
                }
            }
            GICD_ICFGR..=0xcff => {
                let irq = (offset - GICD_ICFGR) as u32 * 4;
                if reserved(irq) {
                    0
                } else {
                    core.read_config(irq)
                }
            }
            _ => return None,
        };
        Some(v)
    }

    fn bank_writeb(&mut self, cpu: usize, offset: u64, value: u8, private: bool) -> bool {
        let reserved = |irq: u32| (irq < GIC_NR_PRIVATE) != private;
        let core = &mut self.core;
        let (bank, base, set) = match offset {
            GICD_IGROUPR..=0x0ff => return true,
            GICD_ISENABLER..=0x17f => (BitBank::Enabled, GICD_ISENABLER, true),
            GICD_ICENABLER..=0x1ff => (BitBank::Enabled, GICD_ICENABLER, false),
            GICD_ISPENDR..=0x27f => (BitBank::Pending, GICD_ISPENDR, true),
            GICD_ICPENDR..=0x2ff => (BitBank::Pending, GICD_ICPENDR, false),
            GICD_ISACTIVER..=0x37f => (BitBank::Active, GICD_ISACTIVER, true),
            GICD_ICACTIVER..=0x3ff => (BitBank::Active, GICD_ICACTIVER, false),
            GICD_IPRIORITYR..=0x7ff => {
                let irq = (offset - GICD_IPRIORITYR) as u32;
                if !reserved(irq) {
                    core.set_priority(irq, cpu, value);
                }
                return true;
            }
            GICD_ICFGR..=0xcff => {
                let irq = (offset - GICD_ICFGR) as u32 * 4;
                if !reserved(irq) {
                    core.write_config(irq, value);
                }
                return true;
            }
            _ => return false,
        };
        let irq = (offset - base) as u32 * 8;
        if !reserved(irq) {
            core.write_bits(bank, irq, cpu, value, set);
        }
        true
    }

    fn bank_read(&self, cpu: usize, offset: u64, width: AccessWidth, private: bool) -> Option<u64> {
        let mut v = 0u64;
        for i in 0..width.bytes() as u64 {
            v |= u64::from(self.bank_readb(cpu, offset + i, private)?) << (8 * i);
        }
        Some(v)
    }

    fn bank_write(
        &mut self,
        cpu: usize,
        offset: u64,
        width: AccessWidth,
        value: u64,
        private: bool,
    ) -> bool {
        (0..width.bytes() as u64)
            .all(|i| self.bank_writeb(cpu, offset + i, (value >> (8 * i)) as u8, private))
    }

    fn dist_read(&self, offset: u64, width: AccessWidth) -> Option<u64> {
        let core = &self.core;
        match offset {
            GICD_CTLR => Some(u64::from(self.ctlr | GICD_CTLR_ARE_NS | GICD_CTLR_DS)),
            GICD_TYPER => {
                // 10 INTID bits.
                let typer = (9 << 19) | ((core.num_cpu() as u32 - 1) << 5) | (core.num_irq() / 32 - 1);
                Some(u64::from(typer))
            }
            GICD_IIDR => Some(u64::from(GIC_IIDR_VALUE)),
            GICD_PIDR2 => Some(u64::from(GIC_PIDR2_ARCH_GICV3)),
            o if (GICD_IROUTER..GICD_IROUTER + 8 * 1024).contains(&o) => {
                let irq = ((o - GICD_IROUTER) / 8) as usize;
                let v = self.irouter.get(irq).copied().unwrap_or(0);
                Some(match (width, o & 4) {
                    (AccessWidth::Double, 0) => v,
                    (_, 0) => v & 0xffff_ffff,
                    _ => v >> 32,
                })
            }
            0x0001..=0x0fff => self.bank_read(0, offset, width, false),
            0xffd0..=0xfffc => Some(0),
            _ => None,
        }
    }

    fn dist_write(&mut self, offset: u64, width: AccessWidth, value: u64) -> bool {
        match offset {
            GICD_CTLR => {
                self.ctlr = value as u32 & (GICD_CTLR_ENABLE_G0 | GICD_CTLR_ENABLE_G1NS);
                self.core.enabled = self.ctlr != 0;
                true
            }
            GICD_TYPER | GICD_IIDR => true,
            o if (GICD_IROUTER..GICD_IROUTER + 8 * 1024).contains(&o) => {
                let irq = ((o - GICD_IROUTER) / 8) as u32;
                let old = self.irouter.get(irq as usize).copied().unwrap_or(0);
                let new = match (width, o & 4) {
                    (AccessWidth::Double, 0) => value,
                    (_, 0) => (old & !0xffff_ffff) | (value & 0xffff_ffff),
                    _ => (old & 0xffff_ffff) | (value << 32),
                };
                self.set_router(irq, new);
                true
            }
            0x0001..=0x0fff => self.bank_write(0, offset, width, value, false),
            _ => false,
        }
    }

    fn redist_read(&self, cpu: usize, offset: u64, width: AccessWidth) -> Option<u64> {
        match offset {
            GICR_CTLR => Some(0),
            GICR_IIDR => Some(u64::from(GIC_IIDR_VALUE)),
            GICR_TYPER | 0x000c => {
                let mut typer = ((cpu as u64) << 32) | ((cpu as u64) << 8);
                if cpu + 1 == self.core.num_cpu() {
                    typer |= GICR_TYPER_LAST;
                }
                Some(match (width, offset) {
                    (AccessWidth::Double, GICR_TYPER) => typer,
                    (_, GICR_TYPER) => typer & 0xffff_ffff,
                    _ => typer >> 32,
                })
            }
            GICR_WAKER => Some(u64::from(self.waker[cpu])),
            GICR_PIDR2 => Some(u64::from(GIC_PIDR2_ARCH_GICV3)),
            o if o >= GICR_SGI_BASE && o < GICR_SGI_BASE + 0x1000 => {
                self.bank_read(cpu, o - GICR_SGI_BASE, width, true)
            }
            o if o < GICR_SIZE => Some(0),
            _ => None,
        }
    }

    fn redist_write(&mut self, cpu: usize, offset: u64, width: AccessWidth, value: u64) -> bool {
        match offset {
            GICR_WAKER => {
                self.waker[cpu] = if value as u32 & GICR_WAKER_PROCESSOR_SLEEP != 0 {
                    GICR_WAKER_PROCESSOR_SLEEP | GICR_WAKER_CHILDREN_ASLEEP
                } else {
                    0
                };
                true
            }
            o if o >= GICR_SGI_BASE && o < GICR_SGI_BASE + 0x1000 => {
                self.bank_write(cpu, o - GICR_SGI_BASE, width, value, true)
            }
            o => o < GICR_SIZE,
        }
    }

    /// Redistributor frame and offset within it for a window offset.
    fn redist_frame(&self, offset: u64) -> Option<(usize, u64)> {
        let off = offset.checked_sub(self.redist_offset)?;
        let cpu = (off / GICR_SIZE) as usize;
        (cpu < self.core.num_cpu()).then_some((cpu, off % GICR_SIZE))
    }

    pub fn read(
        &mut self,
        vcpu: usize,
        offset: u64,
        width: AccessWidth,
        _out: &mut ChipOutput,
    ) -> Result<u64> {
        if vcpu >= self.core.num_cpu() {
            return Err(EmulatorError::Irq(IrqError::InvalidCpu(vcpu)));
        }
        let v = if offset < GICD_SIZE {
            self.dist_read(offset, width)
        } else {
            self.redist_frame(offset)
                .and_then(|(cpu, off)| self.redist_read(cpu, off, width))
        };
        v.ok_or(EmulatorError::BadAccess { offset, width })
    }

    pub fn write(
        &mut self,
        vcpu: usize,
        offset: u64,
        width: AccessWidth,
        value: u64,
        out: &mut ChipOutput,
    ) -> Result<()> {
        if vcpu >= self.core.num_cpu() {
            return Err(EmulatorError::Irq(IrqError::InvalidCpu(vcpu)));
        }
        let ok = if offset < GICD_SIZE {
            self.dist_write(offset, width, value)
        } else {
            match self.redist_frame(offset) {
                Some((cpu, off)) => self.redist_write(cpu, off, width, value),
                None => false,
            }
        };
        if !ok {
            return Err(EmulatorError::BadAccess { offset, width });
        }
        self.core.update(out);
        Ok(())
    }

    pub fn read_icc(&mut self, cpu: usize, id: SysRegId, out: &mut ChipOutput) -> Option<u64> {
        let reg = icc_reg(id)?;
        if cpu >= self.core.num_cpu() {
            return None;
        }
        let core = &mut self.core;
        let v = match reg {
            ICC_IAR1 => u64::from(core.acknowledge(cpu, out) & 0x3ff),
            ICC_HPPIR1 => u64::from(core.highest_pending(cpu)),
            ICC_BPR1 => u64::from(core.bpr(cpu)),
            ICC_CTLR => self.icc_ctlr[cpu],
            // SRE, DFB and DIB.
            ICC_SRE => 0x7,
            ICC_IGRPEN1 => u64::from(core.cpu_enabled(cpu)),
            ICC_PMR => u64::from(core.priority_mask(cpu).min(0xff)),
            ICC_RPR => u64::from(core.running_priority(cpu)),
            _ => return None,
        };
        Some(v)
    }

    pub fn write_icc(&mut self, cpu: usize, id: SysRegId, value: u64, out: &mut ChipOutput) -> bool {
        let Some(reg) = icc_reg(id) else {
            return false;
        };
        if cpu >= self.core.num_cpu() {
            return false;
        }
        let core = &mut self.core;
        match reg {
            ICC_EOIR1 => {
                core.complete(cpu, (value & 0xff_ffff) as u32, out);
                return true;
            }
            ICC_SGI1R => {
                let intid = ((value >> 24) & 0xf) as u32;
                let mask = if value & (1 << 40) != 0 {
                    core.all_cpu_mask() & !(1 << cpu)
                } else if (value >> 16) & 0xff == 0 {
                    (value & 0xff) as u8
                } else {
                    0
                };
                core.send_sgi(cpu, intid, mask, out);
                return true;
            }
            ICC_BPR1 => core.set_bpr(cpu, value as u32),
            ICC_CTLR => self.icc_ctlr[cpu] = value & 0x3,
            ICC_SRE | ICC_DIR => {}
            ICC_IGRPEN1 => core.set_cpu_enabled(cpu, value & 1 != 0),
            ICC_PMR => core.set_priority_mask(cpu, value as u8),
            _ => return false,
        }
        self.core.update(out);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REDIST: u64 = GICR_DEFAULT_OFFSET;

    fn icc(reg: (u8, u8, u8)) -> SysRegId {
        SysRegId::Aarch64 {
            op0: 3,
            op1: 0,
            crn: reg.0,
            crm: reg.1,
            op2: reg.2,
        }
    }

    fn w(gic: &mut GicV3, offset: u64, width: AccessWidth, value: u64) -> ChipOutput {
        let mut out = ChipOutput::default();
        gic.write(0, offset, width, value, &mut out).unwrap();
        out
    }

    fn r(gic: &mut GicV3, offset: u64, width: AccessWidth) -> u64 {
        let mut out = ChipOutput::default();
        gic.read(0, offset, width, &mut out).unwrap()
    }

    fn enabled_gic(num_cpu: usize) -> GicV3 {
        let mut gic = GicV3::new(num_cpu, 96, REDIST).unwrap();
        w(&mut gic, GICD_CTLR, AccessWidth::Word, 0x12);
        let mut out = ChipOutput::default();
        for cpu in 0..num_cpu {
            assert!(gic.write_icc(cpu, icc(ICC_PMR), 0xff, &mut out));
            assert!(gic.write_icc(cpu, icc(ICC_IGRPEN1), 1, &mut out));
        }
        gic
    }

    #[test]
    fn spi_routed_by_affinity() {
        let mut gic = enabled_gic(2);
        w(&mut gic, GICD_IROUTER + 40 * 8, AccessWidth::Double, 1);
        w(&mut gic, GICD_ISENABLER + 4, AccessWidth::Word, 1 << 8);
        assert_eq!(r(&mut gic, GICD_IROUTER + 40 * 8, AccessWidth::Double), 1);

        let mut out = ChipOutput::default();
        gic.set_irq(40, None, true, &mut out).unwrap();
        let u = out.virqs()[0];
        assert_eq!((u.vcpu, u.line, u.level), (1, 40, true));

        let mut out = ChipOutput::default();
        assert_eq!(gic.read_icc(1, icc(ICC_IAR1), &mut out), Some(40));
        assert_eq!(gic.read_icc(0, icc(ICC_IAR1), &mut out), Some(1023));

        let mut out = ChipOutput::default();
        gic.set_irq(40, None, false, &mut out).unwrap();
        assert!(gic.write_icc(1, icc(ICC_EOIR1), 40, &mut out));
        assert_eq!(out.eois, vec![40]);
        assert_eq!(gic.read_icc(1, icc(ICC_RPR), &mut out), Some(0xff));
    }

    #[test]
    fn redistributor_frames() {
        let mut gic = GicV3::new(2, 96, REDIST).unwrap();
        assert_eq!(r(&mut gic, REDIST + GICR_TYPER, AccessWidth::Double), 0);
        assert_eq!(
            r(&mut gic, REDIST + GICR_SIZE + GICR_TYPER, AccessWidth::Double),
            (1 << 32) | (1 << 8) | GICR_TYPER_LAST
        );
        assert_eq!(r(&mut gic, REDIST + GICR_WAKER, AccessWidth::Word), 0x6);
        w(&mut gic, REDIST + GICR_WAKER, AccessWidth::Word, 0);
        assert_eq!(r(&mut gic, REDIST + GICR_WAKER, AccessWidth::Word), 0);
        assert_eq!(
            r(&mut gic, REDIST + GICR_PIDR2, AccessWidth::Word),
            u64::from(GIC_PIDR2_ARCH_GICV3)
        );
        // Nothing behind the last frame.
        let mut out = ChipOutput::default();
        assert!(gic
            .read(0, REDIST + 2 * GICR_SIZE, AccessWidth::Word, &mut out)
            .is_err());
        // SGIs and PPIs live in the redistributor only.
        assert_eq!(r(&mut gic, GICD_ISENABLER, AccessWidth::Word), 0);
        assert_eq!(
            r(&mut gic, REDIST + GICR_SGI_BASE + GICD_ISENABLER, AccessWidth::Word),
            0xffff
        );
    }

    #[test]
    fn ppi_enabled_in_redistributor() {
        let mut gic = enabled_gic(2);
        // Timer PPI 27 on CPU 1.
        w(
            &mut gic,
            REDIST + GICR_SIZE + GICR_SGI_BASE + GICD_ISENABLER,
            AccessWidth::Word,
            1 << 27,
        );
        let mut out = ChipOutput::default();
        gic.set_irq(27, Some(0), true, &mut out).unwrap();
        assert!(out.virqs().is_empty());
        gic.set_irq(27, Some(1), true, &mut out).unwrap();
        assert_eq!(out.virqs()[0].vcpu, 1);
        assert_eq!(out.virqs()[0].line, 27);
    }

    #[test]
    fn sgi1r_targets_list() {
        let mut gic = enabled_gic(3);
        let mut out = ChipOutput::default();
        assert!(gic.write_icc(0, icc(ICC_SGI1R), (1 << 24) | 0b110, &mut out));
        let mut vcpus: Vec<usize> = out.virqs().iter().map(|u| u.vcpu).collect();
        vcpus.sort();
        assert_eq!(vcpus, vec![1, 2]);
        assert_eq!(gic.read_icc(2, icc(ICC_IAR1), &mut out), Some(1));
        assert_eq!(gic.read_icc(0, icc(ICC_SRE), &mut out), Some(0x7));
        assert_eq!(
            gic.read_icc(0, SysRegId::Msr(0x1b), &mut out),
            None
        );
    }
}
