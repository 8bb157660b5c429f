// Copyright 2021 Arm Limited (or its affiliates). All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! ARM Generic Interrupt Controller v2.
//!
//! [`GicCore`] holds the interrupt state machine shared with the GICv3
//! model: per interrupt enable/pending/active/level bits as CPU masks, a
//! priority (banked per CPU below 32) and a target mask.

use hypervisor::{AccessWidth, VirqKind};
use vm_device::{EmulatorError, IrqError, Result};

use super::{Ack, ChipOutput};

pub const GIC_MAX_NCPU: usize = 8;
pub const GIC_MAX_NIRQ: u32 = 1020;
pub const GIC_DEFAULT_NIRQ: u32 = 96;
pub const GIC_SPURIOUS: u32 = 1023;
const GIC_IDLE_PRIORITY: u16 = 0x100;
const GIC_NR_SGIS: u32 = 16;
pub const GIC_NR_PRIVATE: u32 = 32;

// Distributor
const GICD_CTLR: u64 = 0x000;
const GICD_TYPER: u64 = 0x004;
const GICD_IIDR: u64 = 0x008;
const GICD_ISENABLER: u64 = 0x100;
const GICD_ICENABLER: u64 = 0x180;
const GICD_ISPENDR: u64 = 0x200;
const GICD_ICPENDR: u64 = 0x280;
const GICD_ISACTIVER: u64 = 0x300;
const GICD_ICACTIVER: u64 = 0x380;
const GICD_IPRIORITYR: u64 = 0x400;
const GICD_ITARGETSR: u64 = 0x800;
const GICD_ICFGR: u64 = 0xc00;
const GICD_SGIR: u64 = 0xf00;
const GICD_ID: u64 = 0xfe0;
const GICD_IIDR_VALUE: u32 = 0x0200_043b;
const GICD_ID_VALUES: [u8; 8] = [0x90, 0xb4, 0x2b, 0x00, 0x0d, 0xf0, 0x05, 0xb1];

// CPU interface
const GICC_CTLR: u64 = 0x00;
const GICC_PMR: u64 = 0x04;
const GICC_BPR: u64 = 0x08;
const GICC_IAR: u64 = 0x0c;
const GICC_EOIR: u64 = 0x10;
const GICC_RPR: u64 = 0x14;
const GICC_HPPIR: u64 = 0x18;
const GICC_IIDR: u64 = 0xfc;
const GICC_DIR: u64 = 0x1000;
const GICC_IIDR_VALUE: u32 = 0x0202_043b;

#[derive(Clone, Copy, Default)]
struct IrqState {
    enabled: u8,
    pending: u8,
    active: u8,
    level: u8,
    target: u8,
    priority: u8,
    /// 1:N model: acknowledging on one CPU clears it everywhere.
    model: bool,
    edge: bool,
}

#[derive(Clone)]
struct CpuState {
    enabled: bool,
    priority_mask: u16,
    bpr: u32,
    running_irq: u32,
    running_priority: u16,
    current_pending: u32,
    last_active: Vec<u32>,
    priority: [u8; GIC_NR_PRIVATE as usize],
    sgi_source: [u8; GIC_NR_SGIS as usize],
    /// Line currently driven into the VCPU.
    asserted: Option<u32>,
}

impl CpuState {
    fn new(num_irq: u32) -> Self {
        CpuState {
            enabled: false,
            priority_mask: 0,
            bpr: 0,
            running_irq: GIC_SPURIOUS,
            running_priority: GIC_IDLE_PRIORITY,
            current_pending: GIC_SPURIOUS,
            last_active: vec![GIC_SPURIOUS; num_irq as usize],
            priority: [0; GIC_NR_PRIVATE as usize],
            sgi_source: [0; GIC_NR_SGIS as usize],
            asserted: None,
        }
    }
}

pub(crate) struct GicCore {
    num_cpu: usize,
    num_irq: u32,
    base_irq: u32,
    pub(crate) enabled: bool,
    irqs: Vec<IrqState>,
    cpus: Vec<CpuState>,
}

impl GicCore {
    pub(crate) fn new(num_cpu: usize, num_irq: u32, base_irq: u32) -> Result<Self> {
        if num_cpu == 0 || num_cpu > GIC_MAX_NCPU {
            return Err(EmulatorError::InvalidConfig(format!(
                "GIC supports 1 to {} CPUs, not {}",
                GIC_MAX_NCPU, num_cpu
            )));
        }
        if !(GIC_NR_PRIVATE..=GIC_MAX_NIRQ).contains(&num_irq) {
            return Err(EmulatorError::InvalidConfig(format!(
                "GIC cannot have {} interrupts",
                num_irq
            )));
        }
        let mut core = GicCore {
            num_cpu,
            num_irq,
            base_irq,
            enabled: false,
            irqs: vec![IrqState::default(); num_irq as usize],
            cpus: vec![CpuState::new(num_irq); num_cpu],
        };
        core.clear();
        Ok(core)
    }

    pub(crate) fn num_cpu(&self) -> usize {
        self.num_cpu
    }

    pub(crate) fn num_irq(&self) -> u32 {
        self.num_irq
    }

    pub(crate) fn all_cpu_mask(&self) -> u8 {
        ((1u16 << self.num_cpu) - 1) as u8
    }

    /// CPU mask an access of `cpu` to `irq` is banked on.
    fn bank(&self, irq: u32, cpu: usize) -> u8 {
        if irq < GIC_NR_PRIVATE {
            1 << cpu
        } else {
            self.all_cpu_mask()
        }
    }

    // Levels survive a reset: a host line may already be raised.
    fn clear(&mut self) {
        let level: Vec<u8> = self.irqs.iter().map(|s| s.level).collect();
        let num_irq = self.num_irq;
        for (s, level) in self.irqs.iter_mut().zip(level) {
            *s = IrqState {
                level,
                ..Default::default()
            };
        }
        for cpu in self.cpus.iter_mut() {
            let asserted = cpu.asserted;
            *cpu = CpuState::new(num_irq);
            cpu.asserted = asserted;
        }
        let all = self.all_cpu_mask();
        for irq in 0..GIC_NR_SGIS as usize {
            self.irqs[irq].enabled = all;
            self.irqs[irq].edge = true;
        }
        self.enabled = false;
    }

    pub(crate) fn reset(&mut self, out: &mut ChipOutput) {
        self.clear();
        self.update(out);
    }

    pub(crate) fn priority(&self, irq: u32, cpu: usize) -> u8 {
        if irq < GIC_NR_PRIVATE {
            self.cpus[cpu].priority[irq as usize]
        } else {
            self.irqs[irq as usize].priority
        }
    }

    pub(crate) fn set_priority(&mut self, irq: u32, cpu: usize, priority: u8) {
        if irq < GIC_NR_PRIVATE {
            self.cpus[cpu].priority[irq as usize] = priority;
        } else if irq < self.num_irq {
            self.irqs[irq as usize].priority = priority;
        }
    }

    pub(crate) fn target(&self, irq: u32) -> u8 {
        self.irqs[irq as usize].target
    }

    pub(crate) fn set_target(&mut self, irq: u32, mask: u8) {
        if (GIC_NR_PRIVATE..self.num_irq).contains(&irq) {
            self.irqs[irq as usize].target = mask & self.all_cpu_mask();
        }
    }

    /// Recompute the highest priority pending interrupt of every CPU
    /// interface and drive the VCPU inputs accordingly.
    pub(crate) fn update(&mut self, out: &mut ChipOutput) {
        for cpu in 0..self.num_cpu {
            let cm = 1u8 << cpu;
            let mut best_prio = GIC_IDLE_PRIORITY;
            let mut best_irq = GIC_SPURIOUS;

            self.cpus[cpu].current_pending = GIC_SPURIOUS;
            let mut level = false;
            if self.enabled && self.cpus[cpu].enabled {
                for irq in 0..self.num_irq {
                    let s = &self.irqs[irq as usize];
                    if s.enabled & cm != 0 && s.pending & cm != 0 {
                        let prio = u16::from(self.priority(irq, cpu));
                        if prio < best_prio {
                            best_prio = prio;
                            best_irq = irq;
                        }
                    }
                }
                let state = &mut self.cpus[cpu];
                if best_prio < state.priority_mask {
                    state.current_pending = best_irq;
                    level = best_prio < state.running_priority;
                }
            }

            let line = best_irq + self.base_irq;
            let state = &mut self.cpus[cpu];
            match (state.asserted, level) {
                (Some(old), true) if old == line => {}
                (old, true) => {
                    if let Some(old) = old {
                        out.set_virq(cpu, old, VirqKind::Irq, false);
                    }
                    out.set_virq(cpu, line, VirqKind::Irq, true);
                    state.asserted = Some(line);
                }
                (Some(old), false) => {
                    out.set_virq(cpu, old, VirqKind::Irq, false);
                    state.asserted = None;
                }
                (None, false) => {}
            }
        }
    }

    /// A device drove input `line` to `level`.
    pub(crate) fn set_irq(
        &mut self,
        line: u32,
        cpu_hint: Option<usize>,
        level: bool,
        out: &mut ChipOutput,
    ) -> std::result::Result<(), IrqError> {
        let irq = line
            .checked_sub(self.base_irq)
            .filter(|irq| *irq < self.num_irq)
            .ok_or(IrqError::InvalidLine(line))?;

        let (cm, target) = if irq < GIC_NR_PRIVATE {
            let cpu = cpu_hint.unwrap_or(0);
            if cpu >= self.num_cpu {
                return Err(IrqError::InvalidCpu(cpu));
            }
            (1u8 << cpu, 1u8 << cpu)
        } else {
            (self.all_cpu_mask(), self.irqs[irq as usize].target)
        };

        let s = &mut self.irqs[irq as usize];
        if level == (s.level & cm != 0) {
            return Ok(());
        }
        if level {
            s.level |= cm;
            if s.edge || s.enabled & cm != 0 {
                s.pending |= target;
            }
        } else {
            s.level &= !cm;
        }
        self.update(out);
        Ok(())
    }

    /// Inject a software generated interrupt from `src` to the CPUs in `mask`.
    pub(crate) fn send_sgi(&mut self, src: usize, irq: u32, mask: u8, out: &mut ChipOutput) {
        if irq >= GIC_NR_SGIS {
            return;
        }
        let mask = mask & self.all_cpu_mask();
        self.irqs[irq as usize].pending |= mask;
        for cpu in 0..self.num_cpu {
            if mask & (1 << cpu) != 0 {
                self.cpus[cpu].sgi_source[irq as usize] = src as u8;
            }
        }
        self.update(out);
    }

    fn set_running_irq(&mut self, cpu: usize, irq: u32) {
        let prio = if irq == GIC_SPURIOUS {
            GIC_IDLE_PRIORITY
        } else {
            u16::from(self.priority(irq, cpu))
        };
        let state = &mut self.cpus[cpu];
        state.running_irq = irq;
        state.running_priority = prio;
    }

    /// Interrupt acknowledge on behalf of `cpu`; 1023 when nothing can be
    /// delivered. SGIs carry their source CPU in bits [12:10].
    pub(crate) fn acknowledge(&mut self, cpu: usize, out: &mut ChipOutput) -> u32 {
        if cpu >= self.num_cpu {
            return GIC_SPURIOUS;
        }
        let cm = 1u8 << cpu;
        let irq = self.cpus[cpu].current_pending;
        if irq == GIC_SPURIOUS
            || u16::from(self.priority(irq, cpu)) >= self.cpus[cpu].running_priority
        {
            return GIC_SPURIOUS;
        }

        let running = self.cpus[cpu].running_irq;
        self.cpus[cpu].last_active[irq as usize] = running;

        // Level triggered interrupts are pending again once they complete.
        let all = self.all_cpu_mask();
        let s = &mut self.irqs[irq as usize];
        s.pending &= !if s.model { all } else { cm };
        s.active |= cm;

        self.set_running_irq(cpu, irq);
        self.update(out);

        if irq < GIC_NR_SGIS {
            irq | (u32::from(self.cpus[cpu].sgi_source[irq as usize]) << 10)
        } else {
            irq
        }
    }

    pub(crate) fn complete(&mut self, cpu: usize, irq: u32, out: &mut ChipOutput) {
        if cpu >= self.num_cpu || irq >= self.num_irq {
            return;
        }
        let cm = 1u8 << cpu;
        if self.cpus[cpu].running_irq == GIC_SPURIOUS {
            return;
        }

        let mut update = false;
        let s = &mut self.irqs[irq as usize];
        s.active &= !cm;
        if !s.edge
            && s.enabled & cm != 0
            && s.level & cm != 0
            && (irq < GIC_NR_PRIVATE || s.target & cm != 0)
        {
            s.pending |= cm;
            update = true;
        }

        let state = &mut self.cpus[cpu];
        if irq != state.running_irq {
            // Completing an interrupt that was preempted: unlink it.
            let mut tmp = state.running_irq;
            while state.last_active[tmp as usize] != GIC_SPURIOUS {
                if state.last_active[tmp as usize] == irq {
                    state.last_active[tmp as usize] = state.last_active[irq as usize];
                    break;
                }
                tmp = state.last_active[tmp as usize];
            }
        } else {
            let prev = state.last_active[irq as usize];
            self.set_running_irq(cpu, prev);
            update = true;
        }

        out.eoi(irq + self.base_irq);
        if update {
            self.update(out);
        }
    }

    pub(crate) fn cpu_enabled(&self, cpu: usize) -> bool {
        self.cpus[cpu].enabled
    }

    pub(crate) fn set_cpu_enabled(&mut self, cpu: usize, enabled: bool) {
        self.cpus[cpu].enabled = enabled;
    }

    pub(crate) fn priority_mask(&self, cpu: usize) -> u16 {
        self.cpus[cpu].priority_mask
    }

    pub(crate) fn set_priority_mask(&mut self, cpu: usize, mask: u8) {
        self.cpus[cpu].priority_mask = u16::from(mask);
    }

    pub(crate) fn bpr(&self, cpu: usize) -> u32 {
        self.cpus[cpu].bpr
    }

    pub(crate) fn set_bpr(&mut self, cpu: usize, bpr: u32) {
        self.cpus[cpu].bpr = bpr & 7;
    }

    pub(crate) fn running_priority(&self, cpu: usize) -> u32 {
        u32::from(self.cpus[cpu].running_priority.min(0xff))
    }

    pub(crate) fn highest_pending(&self, cpu: usize) -> u32 {
        self.cpus[cpu].current_pending
    }

    /// 8 one-bit fields starting at `irq` of the enable, pending or active
    /// bank, as seen from `cpu`.
    pub(crate) fn read_bits(&self, bank: BitBank, irq: u32, cpu: usize) -> u8 {
        let mut v = 0u8;
        for i in 0..8 {
            let n = irq + i;
            if n >= self.num_irq {
                break;
            }
            let s = &self.irqs[n as usize];
            let cm = self.bank(n, cpu);
            let bits = match bank {
                BitBank::Enabled => s.enabled,
                BitBank::Pending => s.pending,
                BitBank::Active => s.active,
            };
            if bits & cm != 0 {
                v |= 1 << i;
            }
        }
        v
    }

    /// Set (`set == true`) or clear the bits of `value` in 8 fields
    /// starting at `irq`.
    pub(crate) fn write_bits(&mut self, bank: BitBank, irq: u32, cpu: usize, value: u8, set: bool) {
        for i in 0..8 {
            let n = irq + i;
            if n >= self.num_irq {
                break;
            }
            if value & (1 << i) == 0 {
                continue;
            }
            // SGIs are always enabled and only pended through SGIR.
            if n < GIC_NR_SGIS && bank != BitBank::Active {
                continue;
            }
            let cm = self.bank(n, cpu);
            let target = if n < GIC_NR_PRIVATE {
                cm
            } else {
                self.irqs[n as usize].target
            };
            let s = &mut self.irqs[n as usize];
            match (bank, set) {
                (BitBank::Enabled, true) => {
                    if s.enabled & cm == 0 && s.level & cm != 0 && !s.edge {
                        s.pending |= target;
                    }
                    s.enabled |= cm;
                }
                (BitBank::Enabled, false) => s.enabled &= !cm,
                (BitBank::Pending, true) => s.pending |= target,
                (BitBank::Pending, false) => s.pending &= !cm,
                (BitBank::Active, true) => s.active |= cm,
                (BitBank::Active, false) => s.active &= !cm,
            }
        }
    }

    /// ICFGR byte covering 4 interrupts starting at `irq`.
    pub(crate) fn read_config(&self, irq: u32) -> u8 {
        let mut v = 0u8;
        for i in 0..4 {
            let n = irq + i;
            if n >= self.num_irq {
                break;
            }
            let s = &self.irqs[n as usize];
            if s.model {
                v |= 1 << (i * 2);
            }
            if s.edge {
                v |= 2 << (i * 2);
            }
        }
        v
    }

    pub(crate) fn write_config(&mut self, irq: u32, value: u8) {
        for i in 0..4 {
            let n = irq + i;
            if n < GIC_NR_SGIS || n >= self.num_irq {
                continue;
            }
            let s = &mut self.irqs[n as usize];
            s.model = value & (1 << (i * 2)) != 0;
            s.edge = value & (2 << (i * 2)) != 0;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BitBank {
    Enabled,
    Pending,
    Active,
}

/// Byte `index` of the little endian encoding of `value`.
pub(crate) fn byte_of(value: u32, index: u64) -> u8 {
    value.to_le_bytes()[(index & 3) as usize]
}

pub struct GicV2 {
    core: GicCore,
    dist_offset: u64,
    cpu_offset: u64,
}

impl GicV2 {
    pub fn new(
        num_cpu: usize,
        num_irq: u32,
        base_irq: u32,
        dist_offset: u64,
        cpu_offset: u64,
    ) -> Result<Self> {
        Ok(GicV2 {
            core: GicCore::new(num_cpu, num_irq, base_irq)?,
            dist_offset,
            cpu_offset,
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
        self.core.reset(out);
    }

    pub fn acknowledge_vector(&mut self, cpu: usize, out: &mut ChipOutput) -> Ack {
        match self.core.acknowledge(cpu, out) {
            GIC_SPURIOUS => Ack::None,
            irq => Ack::Vector(irq & 0x3ff),
        }
    }

    fn dist_readb(&self, cpu: usize, offset: u64) -> Option<u8> {
        let core = &self.core;
        let v = match offset {
            GICD_CTLR..=0x003 => byte_of(u32::from(core.enabled), offset),
            GICD_TYPER..=0x007 => {
                let typer = ((core.num_cpu() as u32 - 1) << 5) | (core.num_irq() / 32 - 1);
                byte_of(typer, offset)
            }
            GICD_IIDR..=0x00b => byte_of(GICD_IIDR_VALUE, offset),
            GICD_ISENABLER..=0x1ff => {
                let irq = ((offset - GICD_ISENABLER) % 0x80) as u32 * 8;
                core.read_bits(BitBank::Enabled, irq, cpu)
            }
            GICD_ISPENDR..=0x2ff => {
                let irq = ((offset - GICD_ISPENDR) % 0x80) as u32 * 8;
                core.read_bits(BitBank::Pending, irq, cpu)
            }
            GICD_ISACTIVER..=0x3ff => {
                let irq = ((offset - GICD_ISACTIVER) % 0x80) as u32 * 8;
                core.read_bits(BitBank::Active, irq, cpu)
            }
            GICD_IPRIORITYR..=0x7ff => {
                let irq = (offset - GICD_IPRIORITYR) as u32;
                if irq >= core.num_irq() {
                    return Some(0);
                }
                core.priority(irq, cpu)
            }
            GICD_ITARGETSR..=0xbff => {
                let irq = (offset - GICD_ITARGETSR) as u32;
                if irq < GIC_NR_PRIVATE {
                    1 << cpu
                } else if irq < core.num_irq() {
                    core.target(irq)
                } else {
                    0
                }
            }
            GICD_ICFGR..=0xcff => core.read_config((offset - GICD_ICFGR) as u32 * 4),
            GICD_SGIR..=0xf03 => 0,
            GICD_ID..=0xfff => {
                if offset & 3 == 0 {
                    GICD_ID_VALUES[((offset - GICD_ID) >> 2) as usize]
                } else {
                    0
                }
            }
            _ => return None,
        };
        Some(v)
    }

    fn dist_writeb(&mut self, cpu: usize, offset: u64, value: u8) -> bool {
        let core = &mut self.core;
        match offset {
            GICD_CTLR => core.enabled = value & 1 != 0,
            0x001..=0x00b => {}
            GICD_ISENABLER..=0x17f => {
                let irq = (offset - GICD_ISENABLER) as u32 * 8;
                core.write_bits(BitBank::Enabled, irq, cpu, value, true);
            }
            GICD_ICENABLER..=0x1ff => {
                let irq = (offset - GICD_ICENABLER) as u32 * 8;
                core.write_bits(BitBank::Enabled, irq, cpu, value, false);
            }
            GICD_ISPENDR..=0x27f => {
                let irq = (offset - GICD_ISPENDR) as u32 * 8;
                core.write_bits(BitBank::Pending, irq, cpu, value, true);
            }
            GICD_ICPENDR..=0x2ff => {
                let irq = (offset - GICD_ICPENDR) as u32 * 8;
                core.write_bits(BitBank::Pending, irq, cpu, value, false);
            }
            GICD_ISACTIVER..=0x37f => {
                let irq = (offset - GICD_ISACTIVER) as u32 * 8;
                core.write_bits(BitBank::Active, irq, cpu, value, true);
            }
            GICD_ICACTIVER..=0x3ff => {
                let irq = (offset - GICD_ICACTIVER) as u32 * 8;
                core.write_bits(BitBank::Active, irq, cpu, value, false);
            }
            GICD_IPRIORITYR..=0x7ff => {
                core.set_priority((offset - GICD_IPRIORITYR) as u32, cpu, value);
            }
            GICD_ITARGETSR..=0xbff => core.set_target((offset - GICD_ITARGETSR) as u32, value),
            GICD_ICFGR..=0xcff => core.write_config((offset - GICD_ICFGR) as u32 * 4, value),
            GICD_ID..=0xfff => {}
            _ => return false,
        }
        true
    }

    fn dist_read(&self, cpu: usize, offset: u64, width: AccessWidth) -> Result<u64> {
        let mut v = 0u64;
        for i in 0..width.bytes() as u64 {
            let b = self
                .dist_readb(cpu, offset + i)
                .ok_or(EmulatorError::BadAccess { offset, width })?;
            v |= u64::from(b) << (8 * i);
        }
        Ok(v)
    }

    fn dist_write(
        &mut self,
        cpu: usize,
        offset: u64,
        width: AccessWidth,
        value: u64,
        out: &mut ChipOutput,
    ) -> Result<()> {
        if offset == GICD_SGIR {
            if width != AccessWidth::Word {
                return Err(EmulatorError::BadAccess { offset, width });
            }
            let value = value as u32;
            let irq = value & 0x3ff;
            let mask = match (value >> 24) & 3 {
                0 => ((value >> 16) & 0xff) as u8,
                1 => self.core.all_cpu_mask() & !(1 << cpu),
                2 => 1 << cpu,
                _ => {
                    warn!("GICD_SGIR: bad target filter in {:#x}", value);
                    return Ok(());
                }
            };
            self.core.send_sgi(cpu, irq, mask, out);
            return Ok(());
        }

        for i in 0..width.bytes() as u64 {
            if !self.dist_writeb(cpu, offset + i, (value >> (8 * i)) as u8) {
                return Err(EmulatorError::BadAccess { offset, width });
            }
        }
        self.core.update(out);
        Ok(())
    }

    fn cpu_read(&mut self, cpu: usize, offset: u64, out: &mut ChipOutput) -> Option<u32> {
        let core = &mut self.core;
        let v = match offset {
            GICC_CTLR => u32::from(core.cpu_enabled(cpu)),
            GICC_PMR => u32::from(core.priority_mask(cpu)),
            GICC_BPR => core.bpr(cpu),
            GICC_IAR => core.acknowledge(cpu, out),
            GICC_RPR => core.running_priority(cpu),
            GICC_HPPIR => core.highest_pending(cpu),
            GICC_IIDR => GICC_IIDR_VALUE,
            _ => return None,
        };
        Some(v)
    }

    fn cpu_write(&mut self, cpu: usize, offset: u64, value: u32, out: &mut ChipOutput) -> bool {
        let core = &mut self.core;
        match offset {
            GICC_CTLR => core.set_cpu_enabled(cpu, value & 1 != 0),
            GICC_PMR => core.set_priority_mask(cpu, value as u8),
            GICC_BPR => core.set_bpr(cpu, value),
            GICC_EOIR => {
                core.complete(cpu, value & 0x3ff, out);
                return true;
            }
            GICC_DIR => {}
            _ => return false,
        }
        core.update(out);
        true
    }

    pub fn read(
        &mut self,
        vcpu: usize,
        offset: u64,
        width: AccessWidth,
        out: &mut ChipOutput,
    ) -> Result<u64> {
        if vcpu >= self.core.num_cpu() {
            return Err(EmulatorError::Irq(IrqError::InvalidCpu(vcpu)));
        }
        if let Some(off) = offset.checked_sub(self.cpu_offset).filter(|o| *o < 0x2000) {
            if width != AccessWidth::Word {
                return Err(EmulatorError::BadAccess { offset, width });
            }
            return self
                .cpu_read(vcpu, off, out)
                .map(u64::from)
                .ok_or(EmulatorError::BadAccess { offset, width });
        }
        match offset.checked_sub(self.dist_offset).filter(|o| *o < 0x1000) {
            Some(off) => self.dist_read(vcpu, off, width),
            None => Err(EmulatorError::BadAccess { offset, width }),
        }
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
        if let Some(off) = offset.checked_sub(self.cpu_offset).filter(|o| *o < 0x2000) {
            if width != AccessWidth::Word || !self.cpu_write(vcpu, off, value as u32, out) {
                return Err(EmulatorError::BadAccess { offset, width });
            }
            return Ok(());
        }
        match offset.checked_sub(self.dist_offset).filter(|o| *o < 0x1000) {
            Some(off) => self.dist_write(vcpu, off, width, value, out),
            None => Err(EmulatorError::BadAccess { offset, width }),
        }
    }
}
