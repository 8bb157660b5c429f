// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! x86 local APIC, one per VCPU behind a single register window.
//!
//! Input line `n` below 256 delivers vector `n` as a fixed interrupt.
//! The APIC timer counts in nanoseconds scaled by the divide configuration.

use std::sync::{Arc, Weak};

use hypervisor::VirqKind;
use vm_device::{
    AccessWidth, EmulatorError, GuestTimerService, IrqError, IrqRouter, Result, TimerToken,
};

use super::{Ack, ChipOutput};

/// Per-CPU line the timer events of a LAPIC come back on.
pub const LAPIC_TIMER_LINE: u32 = 0x100;

const APIC_VERSION: u32 = 0x14;
const APIC_LVT_NB: usize = 6;
const APIC_LVT_TIMER: usize = 0;
const APIC_LVT_LINT0: usize = 3;
const APIC_LVT_MASKED: u32 = 1 << 16;
const APIC_LVT_TIMER_PERIODIC: u32 = 1 << 17;
const APIC_LVT_LEVEL_TRIGGER: u32 = 1 << 15;
const APIC_SV_ENABLE: u32 = 1 << 8;
const APIC_ESR_ILLEGAL_ADDRESS: u32 = 1 << 7;
const APIC_NMI_VECTOR: u32 = 2;

const APIC_DM_FIXED: u32 = 0;
const APIC_DM_LOWPRI: u32 = 1;
const APIC_DM_SMI: u32 = 2;
const APIC_DM_NMI: u32 = 4;
const APIC_DM_INIT: u32 = 5;
const APIC_DM_SIPI: u32 = 6;
const APIC_DM_EXTINT: u32 = 7;

// Register indexes, offset >> 4.
const APIC_ID: u64 = 0x02;
const APIC_LVR: u64 = 0x03;
const APIC_TPR: u64 = 0x08;
const APIC_APR: u64 = 0x09;
const APIC_PPR: u64 = 0x0a;
const APIC_EOI: u64 = 0x0b;
const APIC_LDR: u64 = 0x0d;
const APIC_DFR: u64 = 0x0e;
const APIC_SVR: u64 = 0x0f;
const APIC_ISR: u64 = 0x10;
const APIC_TMR: u64 = 0x18;
const APIC_IRR: u64 = 0x20;
const APIC_ESR: u64 = 0x28;
const APIC_ICR_LO: u64 = 0x30;
const APIC_ICR_HI: u64 = 0x31;
const APIC_LVT: u64 = 0x32;
const APIC_TMICT: u64 = 0x38;
const APIC_TMCCT: u64 = 0x39;
const APIC_TDCR: u64 = 0x3e;

#[derive(Clone, Copy, Default)]
struct VectorSet([u32; 8]);

impl VectorSet {
    fn set(&mut self, v: u32) {
        self.0[(v / 32) as usize] |= 1 << (v % 32);
    }

    fn clear(&mut self, v: u32) {
        self.0[(v / 32) as usize] &= !(1 << (v % 32));
    }

    fn get(&self, v: u32) -> bool {
        self.0[(v / 32) as usize] & (1 << (v % 32)) != 0
    }

    fn highest(&self) -> Option<u32> {
        (0..8)
            .rev()
            .find(|i| self.0[*i] != 0)
            .map(|i| i as u32 * 32 + 31 - self.0[i].leading_zeros())
    }
}

struct ApicState {
    id: u32,
    tpr: u32,
    spurious_vec: u32,
    log_dest: u32,
    dest_mode: u32,
    isr: VectorSet,
    tmr: VectorSet,
    irr: VectorSet,
    esr: u32,
    icr: [u32; 2],
    lvt: [u32; APIC_LVT_NB],
    divide_conf: u32,
    count_shift: u32,
    initial_count: u32,
    load_time: u64,
    next_time: Option<u64>,
    timer: Option<TimerToken>,
    nmi_pending: bool,
    /// Vector currently driven into the VCPU.
    asserted: Option<u32>,
}

impl ApicState {
    fn new(id: u32) -> Self {
        let mut s = ApicState {
            id,
            tpr: 0,
            spurious_vec: 0,
            log_dest: 0,
            dest_mode: 0,
            isr: VectorSet::default(),
            tmr: VectorSet::default(),
            irr: VectorSet::default(),
            esr: 0,
            icr: [0; 2],
            lvt: [0; APIC_LVT_NB],
            divide_conf: 0,
            count_shift: 0,
            initial_count: 0,
            load_time: 0,
            next_time: None,
            timer: None,
            nmi_pending: false,
            asserted: None,
        };
        s.init_reset();
        s
    }

    fn init_reset(&mut self) {
        self.tpr = 0;
        self.spurious_vec = 0xff;
        self.log_dest = 0;
        self.dest_mode = 0xf;
        self.isr = VectorSet::default();
        self.tmr = VectorSet::default();
        self.irr = VectorSet::default();
        self.lvt = [APIC_LVT_MASKED; APIC_LVT_NB];
        self.esr = 0;
        self.icr = [0; 2];
        self.divide_conf = 0;
        self.count_shift = 0;
        self.initial_count = 0;
        self.load_time = 0;
        self.next_time = None;
        self.nmi_pending = false;
        // ExtINT on the BSP so the 8259 gets through.
        if self.id == 0 {
            self.lvt[APIC_LVT_LINT0] = 0x700;
        }
    }

    fn ppr(&self) -> u32 {
        let isrv = self.isr.highest().unwrap_or(0) & 0xf0;
        if (self.tpr & 0xf0) >= isrv {
            self.tpr & 0xff
        } else {
            isrv
        }
    }

    /// Highest requested vector that beats the processor priority.
    fn deliverable(&self) -> Option<u32> {
        if self.spurious_vec & APIC_SV_ENABLE == 0 {
            return None;
        }
        let irrv = self.irr.highest()?;
        let ppr = self.ppr();
        (ppr == 0 || (irrv & 0xf0) > (ppr & 0xf0)).then_some(irrv)
    }

    fn current_count(&self, now: u64) -> u32 {
        let d = now.saturating_sub(self.load_time) >> self.count_shift;
        let initial = u64::from(self.initial_count);
        if self.lvt[APIC_LVT_TIMER] & APIC_LVT_TIMER_PERIODIC != 0 {
            (initial - d % (initial + 1)) as u32
        } else if d >= initial {
            0
        } else {
            (initial - d) as u32
        }
    }

    /// Deadline of the next timer expiry after `now`.
    fn next_timer(&self, now: u64) -> Option<u64> {
        if self.lvt[APIC_LVT_TIMER] & APIC_LVT_MASKED != 0 || self.initial_count == 0 {
            return None;
        }
        let d = now.saturating_sub(self.load_time) >> self.count_shift;
        let initial = u64::from(self.initial_count);
        let d = if self.lvt[APIC_LVT_TIMER] & APIC_LVT_TIMER_PERIODIC != 0 {
            (d / (initial + 1) + 1) * (initial + 1)
        } else if d >= initial {
            return None;
        } else {
            initial
        };
        Some(self.load_time + (d << self.count_shift))
    }
}

pub struct Lapic {
    apics: Vec<ApicState>,
    timers: Arc<dyn GuestTimerService>,
    router: Weak<IrqRouter>,
    name: String,
}

impl Lapic {
    pub fn new(
        num_vcpus: usize,
        timers: Arc<dyn GuestTimerService>,
        router: Weak<IrqRouter>,
        name: String,
    ) -> Self {
        Lapic {
            apics: (0..num_vcpus).map(|i| ApicState::new(i as u32)).collect(),
            timers,
            router,
            name,
        }
    }

    fn update(&mut self, cpu: usize, out: &mut ChipOutput) {
        let s = &mut self.apics[cpu];
        let vector = s.deliverable();
        if vector == s.asserted {
            return;
        }
        if let Some(old) = s.asserted {
            out.set_virq(cpu, old, VirqKind::Irq, false);
        }
        if let Some(new) = vector {
            out.set_virq(cpu, new, VirqKind::Irq, true);
        }
        s.asserted = vector;
    }

    fn accept(&mut self, cpu: usize, vector: u32, level: bool, out: &mut ChipOutput) {
        let s = &mut self.apics[cpu];
        s.irr.set(vector);
        if level {
            s.tmr.set(vector);
        } else {
            s.tmr.clear(vector);
        }
        self.update(cpu, out);
    }

    fn nmi(&mut self, cpu: usize, out: &mut ChipOutput) {
        let s = &mut self.apics[cpu];
        if !s.nmi_pending {
            s.nmi_pending = true;
            out.set_virq(cpu, APIC_NMI_VECTOR, VirqKind::Fiq, true);
        }
    }

    /// CPUs addressed by `dest` in physical or flat logical mode.
    fn destinations(&self, dest: u32, logical: bool) -> Vec<usize> {
        (0..self.apics.len())
            .filter(|i| {
                let s = &self.apics[*i];
                if logical {
                    s.log_dest & dest != 0
                } else {
                    dest == 0xff || s.id == dest
                }
            })
            .collect()
    }

    fn bus_deliver(
        &mut self,
        targets: &[usize],
        mode: u32,
        vector: u32,
        level: bool,
        out: &mut ChipOutput,
    ) {
        match mode {
            APIC_DM_FIXED => {
                for cpu in targets {
                    self.accept(*cpu, vector, level, out);
                }
            }
            APIC_DM_LOWPRI => {
                if let Some(cpu) = targets.first() {
                    self.accept(*cpu, vector, level, out);
                }
            }
            APIC_DM_NMI => {
                for cpu in targets {
                    self.nmi(*cpu, out);
                }
            }
            APIC_DM_INIT | APIC_DM_SIPI => {
                debug!("{}: INIT/SIPI to {:?} ignored", self.name, targets);
            }
            _ => warn!("{}: delivery mode {} not supported", self.name, mode),
        }
    }

    fn send_ipi(&mut self, cpu: usize, out: &mut ChipOutput) {
        let [lo, hi] = self.apics[cpu].icr;
        let vector = lo & 0xff;
        let mode = (lo >> 8) & 7;
        let logical = (lo >> 11) & 1 != 0;
        let level = (lo >> 15) & 1 != 0;
        let assert = (lo >> 14) & 1 != 0;
        let targets: Vec<usize> = match (lo >> 18) & 3 {
            0 => self.destinations(hi >> 24, logical),
            1 => vec![cpu],
            2 => (0..self.apics.len()).collect(),
            _ => (0..self.apics.len()).filter(|i| *i != cpu).collect(),
        };
        // INIT level de-assert only resynchronises arbitration IDs.
        if mode == APIC_DM_INIT && level && !assert {
            return;
        }
        self.bus_deliver(&targets, mode, vector, level, out);
    }

    fn local_deliver(&mut self, cpu: usize, lvt_index: usize, out: &mut ChipOutput) {
        let lvt = self.apics[cpu].lvt[lvt_index];
        if lvt & APIC_LVT_MASKED != 0 {
            return;
        }
        match (lvt >> 8) & 7 {
            APIC_DM_FIXED => {
                let level = lvt_index == APIC_LVT_LINT0 && lvt & APIC_LVT_LEVEL_TRIGGER != 0;
                self.accept(cpu, lvt & 0xff, level, out);
            }
            APIC_DM_NMI => self.nmi(cpu, out),
            APIC_DM_SMI | APIC_DM_EXTINT => {
                debug!("{}: LVT{} mode not delivered locally", self.name, lvt_index)
            }
            _ => {}
        }
    }

    fn arm_timer(&mut self, cpu: usize, now: u64) {
        let s = &mut self.apics[cpu];
        if let Some(token) = s.timer.take() {
            self.timers.cancel(token);
        }
        s.next_time = s.next_timer(now);
        if let Some(deadline) = s.next_time {
            let router = self.router.clone();
            let name = self.name.clone();
            let token = self.timers.start(
                deadline,
                Box::new(move || {
                    let Some(router) = router.upgrade() else {
                        return;
                    };
                    if let Err(e) = router.handle_percpu(Some(&name), LAPIC_TIMER_LINE, cpu, true)
                    {
                        warn!("{}: timer event for CPU {} lost: {}", name, cpu, e);
                    }
                }),
            );
            s.timer = Some(token);
        }
    }

    fn timer_expired(&mut self, cpu: usize, out: &mut ChipOutput) {
        let now = self.timers.now_ns();
        // Stale events of a reprogrammed timer.
        match self.apics[cpu].next_time {
            Some(deadline) if deadline <= now => {}
            _ => return,
        }
        self.apics[cpu].timer = None;
        self.local_deliver(cpu, APIC_LVT_TIMER, out);
        let next = self.apics[cpu].next_time.unwrap_or(now);
        self.arm_timer(cpu, next);
    }

    pub fn set_irq(
        &mut self,
        line: u32,
        cpu_hint: Option<usize>,
        level: bool,
        out: &mut ChipOutput,
    ) -> std::result::Result<(), IrqError> {
        let cpu = cpu_hint.unwrap_or(0);
        self.set_percpu_irq(line, cpu, level, out)
    }

    pub fn set_percpu_irq(
        &mut self,
        line: u32,
        cpu: usize,
        level: bool,
        out: &mut ChipOutput,
    ) -> std::result::Result<(), IrqError> {
        if cpu >= self.apics.len() {
            return Err(IrqError::InvalidCpu(cpu));
        }
        match line {
            LAPIC_TIMER_LINE => {
                if level {
                    self.timer_expired(cpu, out);
                }
            }
            16..=255 => {
                if level {
                    self.accept(cpu, line, false, out);
                }
            }
            _ => return Err(IrqError::InvalidLine(line)),
        }
        Ok(())
    }

    /// Interrupt acknowledge: a pending NMI first, then the highest
    /// deliverable vector moves from IRR to ISR.
    pub fn acknowledge(&mut self, cpu: usize, out: &mut ChipOutput) -> Ack {
        let Some(s) = self.apics.get_mut(cpu) else {
            return Ack::None;
        };
        if s.nmi_pending {
            s.nmi_pending = false;
            out.set_virq(cpu, APIC_NMI_VECTOR, VirqKind::Fiq, false);
            return Ack::Vector(APIC_NMI_VECTOR);
        }
        if s.spurious_vec & APIC_SV_ENABLE == 0 {
            return Ack::None;
        }
        let ack = match s.deliverable() {
            Some(v) => {
                s.irr.clear(v);
                s.isr.set(v);
                Ack::Vector(v)
            }
            None if s.irr.highest().is_some() => Ack::Vector(s.spurious_vec & 0xff),
            None => Ack::None,
        };
        self.update(cpu, out);
        ack
    }

    fn eoi(&mut self, cpu: usize, out: &mut ChipOutput) {
        let s = &mut self.apics[cpu];
        let Some(isrv) = s.isr.highest() else {
            return;
        };
        s.isr.clear(isrv);
        if s.tmr.get(isrv) {
            out.eoi(isrv);
        }
        self.update(cpu, out);
    }

    pub fn reset(&mut self, out: &mut ChipOutput) {
        for cpu in 0..self.apics.len() {
            let s = &mut self.apics[cpu];
            if let Some(token) = s.timer.take() {
                self.timers.cancel(token);
            }
            if s.nmi_pending {
                out.set_virq(cpu, APIC_NMI_VECTOR, VirqKind::Fiq, false);
            }
            s.init_reset();
            self.update(cpu, out);
        }
    }

    pub fn read(&mut self, vcpu: usize, offset: u64, _out: &mut ChipOutput) -> Result<u64> {
        if vcpu >= self.apics.len() {
            return Err(EmulatorError::Irq(IrqError::InvalidCpu(vcpu)));
        }
        if offset & 0xf != 0 {
            return Err(EmulatorError::BadAccess {
                offset,
                width: AccessWidth::Word,
            });
        }
        let now = self.timers.now_ns();
        let s = &mut self.apics[vcpu];
        let index = (offset >> 4) & 0xff;
        let v = match index {
            APIC_ID => s.id << 24,
            APIC_LVR => APIC_VERSION | ((APIC_LVT_NB as u32 - 1) << 16),
            APIC_TPR => s.tpr,
            APIC_APR => 0,
            APIC_PPR => s.ppr(),
            APIC_EOI => 0,
            APIC_LDR => s.log_dest << 24,
            APIC_DFR => (s.dest_mode << 28) | 0x0fff_ffff,
            APIC_SVR => s.spurious_vec,
            0x10..=0x17 => s.isr.0[(index - APIC_ISR) as usize],
            0x18..=0x1f => s.tmr.0[(index - APIC_TMR) as usize],
            0x20..=0x27 => s.irr.0[(index - APIC_IRR) as usize],
            APIC_ESR => s.esr,
            APIC_ICR_LO => s.icr[0] & !(1 << 12),
            APIC_ICR_HI => s.icr[1],
            0x32..=0x37 => s.lvt[(index - APIC_LVT) as usize],
            APIC_TMICT => s.initial_count,
            APIC_TMCCT => s.current_count(now),
            APIC_TDCR => s.divide_conf,
            _ => {
                s.esr |= APIC_ESR_ILLEGAL_ADDRESS;
                0
            }
        };
        Ok(u64::from(v))
    }

    pub fn write(&mut self, vcpu: usize, offset: u64, value: u32, out: &mut ChipOutput) -> Result<()> {
        if vcpu >= self.apics.len() {
            return Err(EmulatorError::Irq(IrqError::InvalidCpu(vcpu)));
        }
        if offset & 0xf != 0 {
            return Err(EmulatorError::BadAccess {
                offset,
                width: AccessWidth::Word,
            });
        }
        let index = (offset >> 4) & 0xff;
        let s = &mut self.apics[vcpu];
        match index {
            APIC_ID => s.id = value >> 24,
            APIC_TPR => {
                s.tpr = value & 0xff;
                self.update(vcpu, out);
            }
            APIC_EOI => self.eoi(vcpu, out),
            APIC_LDR => s.log_dest = value >> 24,
            APIC_DFR => s.dest_mode = value >> 28,
            APIC_SVR => {
                s.spurious_vec = value & 0x1ff;
                self.update(vcpu, out);
            }
            APIC_ESR => s.esr = 0,
            APIC_ICR_LO => {
                s.icr[0] = value;
                self.send_ipi(vcpu, out);
            }
            APIC_ICR_HI => s.icr[1] = value,
            0x32..=0x37 => {
                let n = (index - APIC_LVT) as usize;
                s.lvt[n] = value;
                if n == APIC_LVT_TIMER {
                    let now = self.timers.now_ns();
                    self.arm_timer(vcpu, now);
                }
            }
            APIC_TMICT => {
                let now = self.timers.now_ns();
                s.initial_count = value;
                s.load_time = now;
                self.arm_timer(vcpu, now);
            }
            APIC_TDCR => {
                s.divide_conf = value & 0xb;
                let v = (s.divide_conf & 3) | ((s.divide_conf >> 1) & 4);
                s.count_shift = (v + 1) & 7;
            }
            APIC_LVR | APIC_APR | APIC_PPR | APIC_TMCCT | 0x10..=0x27 => {}
            _ => s.esr |= APIC_ESR_ILLEGAL_ADDRESS,
        }
        Ok(())
    }
}

impl Drop for Lapic {
    fn drop(&mut self) {
        for s in self.apics.iter_mut() {
            if let Some(token) = s.timer.take() {
                self.timers.cancel(token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irqchip::{SharedChip, VirqChip};
    use crate::testing::{ManualTimers, RecordingSink};
    use vm_device::IrqChip;

    fn lapic(vcpus: usize, timers: Arc<ManualTimers>) -> Lapic {
        let router = Arc::new(IrqRouter::new());
        Lapic::new(vcpus, timers, Arc::downgrade(&router), "lapic".to_string())
    }

    fn w(l: &mut Lapic, cpu: usize, index: u64, value: u32) -> ChipOutput {
        let mut out = ChipOutput::default();
        l.write(cpu, index << 4, value, &mut out).unwrap();
        out
    }

    fn r(l: &mut Lapic, cpu: usize, index: u64) -> u32 {
        let mut out = ChipOutput::default();
        l.read(cpu, index << 4, &mut out).unwrap() as u32
    }

    #[test]
    fn registers_after_reset() {
        let mut l = lapic(2, ManualTimers::new());
        assert_eq!(r(&mut l, 1, APIC_ID), 1 << 24);
        assert_eq!(r(&mut l, 0, APIC_LVR), 0x50014);
        assert_eq!(r(&mut l, 0, APIC_SVR), 0xff);
        assert_eq!(r(&mut l, 0, APIC_LVT + 3), 0x700);
        assert_eq!(r(&mut l, 1, APIC_LVT + 3), APIC_LVT_MASKED);
        r(&mut l, 0, 0x3a);
        assert_eq!(r(&mut l, 0, APIC_ESR), APIC_ESR_ILLEGAL_ADDRESS);
        let mut out = ChipOutput::default();
        assert!(l.read(0, 0x304, &mut out).is_err());
        assert!(l.read(2, 0x300, &mut out).is_err());
    }

    #[test]
    fn fixed_vector_acknowledge_eoi() {
        let mut l = lapic(1, ManualTimers::new());
        let mut out = ChipOutput::default();
        // Software disabled: requests are held.
        l.set_irq(0x31, None, true, &mut out).unwrap();
        assert!(out.virqs().is_empty());

        let out = w(&mut l, 0, APIC_SVR, APIC_SV_ENABLE | 0xff);
        assert_eq!(out.virqs()[0].line, 0x31);

        let mut out = ChipOutput::default();
        assert_eq!(l.acknowledge(0, &mut out), Ack::Vector(0x31));
        assert_eq!(r(&mut l, 0, APIC_ISR + 1), 1 << 17);

        // Same priority class is blocked by the one in service.
        let mut out = ChipOutput::default();
        l.set_irq(0x35, None, true, &mut out).unwrap();
        assert!(out.virqs().is_empty());
        l.set_irq(0x41, None, true, &mut out).unwrap();
        assert_eq!(out.virqs()[0].line, 0x41);
        assert_eq!(r(&mut l, 0, APIC_PPR), 0x30);

        let mut out = ChipOutput::default();
        assert_eq!(l.acknowledge(0, &mut out), Ack::Vector(0x41));
        w(&mut l, 0, APIC_EOI, 0);
        w(&mut l, 0, APIC_EOI, 0);
        assert_eq!(r(&mut l, 0, APIC_ISR + 1), 0);
        assert_eq!(l.acknowledge(0, &mut out), Ack::Vector(0x35));
        assert!(l.set_irq(3, None, true, &mut out).is_err());
    }

    #[test]
    fn ipi_shorthands() {
        let mut l = lapic(3, ManualTimers::new());
        for cpu in 0..3 {
            w(&mut l, cpu, APIC_SVR, APIC_SV_ENABLE | 0xff);
        }
        // All excluding self, fixed vector 0xfd.
        let out = w(&mut l, 1, APIC_ICR_LO, (3 << 18) | 0xfd);
        let mut cpus: Vec<usize> = out.virqs().iter().map(|u| u.vcpu).collect();
        cpus.sort();
        assert_eq!(cpus, vec![0, 2]);

        // Physical destination 2, NMI.
        w(&mut l, 0, APIC_ICR_HI, 2 << 24);
        let out = w(&mut l, 0, APIC_ICR_LO, APIC_DM_NMI << 8);
        assert_eq!(
            (out.virqs()[0].vcpu, out.virqs()[0].kind),
            (2, VirqKind::Fiq)
        );
        let mut out = ChipOutput::default();
        assert_eq!(l.acknowledge(2, &mut out), Ack::Vector(APIC_NMI_VECTOR));
        assert_eq!(l.acknowledge(2, &mut out), Ack::Vector(0xfd));
    }

    #[test]
    fn one_shot_timer() {
        let timers = ManualTimers::new();
        let router = Arc::new(IrqRouter::new());
        let sink = RecordingSink::new(1);
        let l = Lapic::new(1, timers.clone(), Arc::downgrade(&router), "lapic".to_string());
        let shared = SharedChip::new("lapic", VirqChip::Lapic(l), sink.clone(), router.clone(), None);
        router.register_chip("lapic", shared.clone()).unwrap();

        shared.run(|chip, out| {
            chip.write(0, APIC_SVR << 4, AccessWidth::Word, 0x1ff, out)
                .unwrap();
            // Divide by 2, vector 0xec, one-shot, 1000 ticks.
            chip.write(0, APIC_TDCR << 4, AccessWidth::Word, 0, out)
                .unwrap();
            chip.write(0, APIC_LVT << 4, AccessWidth::Word, 0xec, out)
                .unwrap();
            chip.write(0, APIC_TMICT << 4, AccessWidth::Word, 1000, out)
                .unwrap();
        });
        assert_eq!(timers.armed(), vec![2000]);

        timers.advance_to(1000);
        let count = shared.run(|chip, out| chip.read(0, APIC_TMCCT << 4, AccessWidth::Word, out));
        assert_eq!(count.unwrap(), 500);
        assert!(sink.lines(0, VirqKind::Irq).is_empty());

        timers.advance_to(2000);
        assert_eq!(sink.lines(0, VirqKind::Irq), vec![0xec]);
        assert!(timers.armed().is_empty());
        assert_eq!(shared.acknowledge(0), Some(0xec));
        router.unregister_chip("lapic");
    }

    #[test]
    fn periodic_timer_rearms() {
        let timers = ManualTimers::new();
        let mut l = lapic(1, timers.clone());
        w(&mut l, 0, APIC_SVR, 0x1ff);
        w(&mut l, 0, APIC_TDCR, 0xb);
        w(&mut l, 0, APIC_LVT, APIC_LVT_TIMER_PERIODIC | 0xe0);
        w(&mut l, 0, APIC_TMICT, 99);
        assert_eq!(timers.armed(), vec![100]);

        // The router is gone: the event itself is dropped.
        timers.advance_to(100);
        let mut out = ChipOutput::default();
        l.set_percpu_irq(LAPIC_TIMER_LINE, 0, true, &mut out).unwrap();
        assert_eq!(out.virqs()[0].line, 0xe0);
        assert_eq!(timers.armed(), vec![200]);

        // Masking stops it.
        w(&mut l, 0, APIC_LVT, APIC_LVT_MASKED | APIC_LVT_TIMER_PERIODIC | 0xe0);
        assert!(timers.armed().is_empty());
    }
}
