// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! RISC-V platform level interrupt controller.
//!
//! Each hart owns two contexts (M and S mode). Sources are level
//! triggered; a claimed source is not offered again until it completes.

use hypervisor::{AccessWidth, VirqKind};
use vm_device::{EmulatorError, IrqError, Result};

use super::{Ack, ChipOutput};

pub(crate) const PLIC_MAX_DEVICES: u32 = 1024;
pub(crate) const PLIC_MAX_PRIORITY: u32 = 1 << 4;

const PRIORITY_BASE: u64 = 0x0;
const PENDING_BASE: u64 = 0x1000;
const ENABLE_BASE: u64 = 0x2000;
const ENABLE_PER_HART: u64 = 0x80;
const CONTEXT_BASE: u64 = 0x20_0000;
const CONTEXT_PER_HART: u64 = 0x1000;
const CONTEXT_THRESHOLD: u64 = 0;
const CONTEXT_CLAIM: u64 = 4;
pub const PLIC_REG_SIZE: u64 = 0x400_0000;

const CONTEXTS_PER_HART: usize = 2;

#[derive(Clone, Default)]
struct Context {
    threshold: u32,
    enable: Vec<u32>,
}

pub struct Plic {
    num_vcpus: usize,
    num_irq: u32,
    base_irq: u32,
    max_priority: u32,
    priority: Vec<u32>,
    level: Vec<u32>,
    claimed: Vec<u32>,
    contexts: Vec<Context>,
    /// Source currently driven into each hart.
    asserted: Vec<Option<u32>>,
}

fn bit(bits: &[u32], irq: u32) -> bool {
    bits[(irq / 32) as usize] & (1 << (irq % 32)) != 0
}

fn assign(bits: &mut [u32], irq: u32, value: bool) {
    let word = &mut bits[(irq / 32) as usize];
    if value {
        *word |= 1 << (irq % 32);
    } else {
        *word &= !(1 << (irq % 32));
    }
}

impl Plic {
    pub fn new(num_vcpus: usize, num_irq: u32, base_irq: u32, max_priority: u32) -> Result<Self> {
        if num_irq == 0 || num_irq > PLIC_MAX_DEVICES {
            return Err(EmulatorError::InvalidConfig(format!(
                "PLIC cannot have {} sources",
                num_irq
            )));
        }
        if max_priority > PLIC_MAX_PRIORITY {
            return Err(EmulatorError::InvalidConfig(format!(
                "PLIC priority {} above {}",
                max_priority, PLIC_MAX_PRIORITY
            )));
        }
        let words = num_irq.div_ceil(32) as usize;
        Ok(Plic {
            num_vcpus,
            num_irq,
            base_irq,
            max_priority,
            priority: vec![0; num_irq as usize],
            level: vec![0; words],
            claimed: vec![0; words],
            contexts: vec![
                Context {
                    threshold: 0,
                    enable: vec![0; words],
                };
                num_vcpus * CONTEXTS_PER_HART
            ],
            asserted: vec![None; num_vcpus],
        })
    }

    fn words(&self) -> usize {
        self.level.len()
    }

    /// Highest priority pending source above the context threshold.
    /// Source 0 does not exist.
    fn best_pending(&self, ctx: usize) -> Option<u32> {
        let c = &self.contexts[ctx];
        let mut best: Option<(u32, u32)> = None;
        for word in 0..self.words() {
            let candidates = self.level[word] & c.enable[word] & !self.claimed[word];
            if candidates == 0 {
                continue;
            }
            for b in 0..32 {
                let irq = word as u32 * 32 + b;
                if candidates & (1 << b) == 0 || irq == 0 || irq >= self.num_irq {
                    continue;
                }
                let prio = self.priority[irq as usize];
                if prio > c.threshold && best.is_none_or(|(_, p)| prio > p) {
                    best = Some((irq, prio));
                }
            }
        }
        best.map(|(irq, _)| irq)
    }

    fn update(&mut self, out: &mut ChipOutput) {
        for vcpu in 0..self.num_vcpus {
            let line = (0..CONTEXTS_PER_HART)
                .find_map(|i| self.best_pending(vcpu * CONTEXTS_PER_HART + i))
                .map(|irq| irq + self.base_irq);
            if line == self.asserted[vcpu] {
                continue;
            }
            if let Some(old) = self.asserted[vcpu] {
                out.set_virq(vcpu, old, VirqKind::Irq, false);
            }
            if let Some(new) = line {
                out.set_virq(vcpu, new, VirqKind::Irq, true);
            }
            self.asserted[vcpu] = line;
        }
    }

    pub fn set_irq(
        &mut self,
        line: u32,
        level: bool,
        out: &mut ChipOutput,
    ) -> std::result::Result<(), IrqError> {
        let irq = line
            .checked_sub(self.base_irq)
            .filter(|irq| *irq > 0 && *irq < self.num_irq)
            .ok_or(IrqError::InvalidLine(line))?;
        if bit(&self.level, irq) == level {
            return Ok(());
        }
        assign(&mut self.level, irq, level);
        self.update(out);
        Ok(())
    }

    fn claim(&mut self, ctx: usize, out: &mut ChipOutput) -> u32 {
        let irq = self.best_pending(ctx);
        if let Some(irq) = irq {
            assign(&mut self.claimed, irq, true);
        }
        self.update(out);
        irq.unwrap_or(0)
    }

    fn complete(&mut self, ctx: usize, irq: u32, out: &mut ChipOutput) {
        if irq == 0 || irq >= self.num_irq || !bit(&self.contexts[ctx].enable, irq) {
            return;
        }
        assign(&mut self.claimed, irq, false);
        out.eoi(irq + self.base_irq);
        self.update(out);
    }

    /// Claim on behalf of the S mode context of `cpu`.
    pub fn acknowledge(&mut self, cpu: usize, out: &mut ChipOutput) -> Ack {
        if cpu >= self.num_vcpus {
            return Ack::None;
        }
        match self.claim(cpu * CONTEXTS_PER_HART + 1, out) {
            0 => Ack::None,
            irq => Ack::Vector(irq + self.base_irq),
        }
    }

    pub fn reset(&mut self, out: &mut ChipOutput) {
        self.priority.iter_mut().for_each(|p| *p = 0);
        self.claimed.iter_mut().for_each(|w| *w = 0);
        for c in self.contexts.iter_mut() {
            c.threshold = 0;
            c.enable.iter_mut().for_each(|w| *w = 0);
        }
        self.update(out);
    }

    fn context_of(&self, offset: u64, base: u64, stride: u64) -> Option<(usize, u64)> {
        let ctx = ((offset - base) / stride) as usize;
        (ctx < self.contexts.len()).then_some((ctx, (offset - base) % stride))
    }

    fn read_reg(&mut self, offset: u64, out: &mut ChipOutput) -> Option<u32> {
        match offset {
            o if o < PENDING_BASE => {
                let irq = ((o - PRIORITY_BASE) >> 2) as u32;
                (irq > 0 && irq < self.num_irq).then(|| self.priority[irq as usize])
            }
            o if o < ENABLE_BASE => {
                let word = ((o - PENDING_BASE) >> 2) as usize;
                (word < self.words()).then(|| self.level[word] & !self.claimed[word])
            }
            o if o < CONTEXT_BASE => {
                let (ctx, off) = self.context_of(o, ENABLE_BASE, ENABLE_PER_HART)?;
                self.contexts[ctx].enable.get((off >> 2) as usize).copied()
            }
            o if o < PLIC_REG_SIZE => {
                let (ctx, off) = self.context_of(o, CONTEXT_BASE, CONTEXT_PER_HART)?;
                match off {
                    CONTEXT_THRESHOLD => Some(self.contexts[ctx].threshold),
                    CONTEXT_CLAIM => Some(self.claim(ctx, out)),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32, out: &mut ChipOutput) -> bool {
        match offset {
            o if o < PENDING_BASE => {
                let irq = ((o - PRIORITY_BASE) >> 2) as u32;
                if irq == 0 || irq >= self.num_irq {
                    return false;
                }
                self.priority[irq as usize] = value.min(self.max_priority);
            }
            o if o < ENABLE_BASE => return true,
            o if o < CONTEXT_BASE => {
                let Some((ctx, off)) = self.context_of(o, ENABLE_BASE, ENABLE_PER_HART) else {
                    return false;
                };
                let word = (off >> 2) as usize;
                if word >= self.words() {
                    return false;
                }
                let mut value = value;
                if word == 0 {
                    value &= !1;
                }
                self.contexts[ctx].enable[word] = value;
            }
            o if o < PLIC_REG_SIZE => {
                let Some((ctx, off)) = self.context_of(o, CONTEXT_BASE, CONTEXT_PER_HART) else {
                    return false;
                };
                match off {
                    CONTEXT_THRESHOLD => {
                        if value > self.max_priority {
                            return false;
                        }
                        self.contexts[ctx].threshold = value;
                    }
                    CONTEXT_CLAIM => {
                        self.complete(ctx, value, out);
                        return true;
                    }
                    _ => return false,
                }
            }
            _ => return false,
        }
        self.update(out);
        true
    }

    pub fn read(&mut self, offset: u64, width: AccessWidth, out: &mut ChipOutput) -> Result<u64> {
        self.read_reg(offset & !3, out)
            .map(u64::from)
            .ok_or(EmulatorError::BadAccess { offset, width })
    }

    pub fn write(&mut self, offset: u64, value: u32, out: &mut ChipOutput) -> Result<()> {
        if self.write_reg(offset & !3, value, out) {
            Ok(())
        } else {
            Err(EmulatorError::BadAccess {
                offset,
                width: AccessWidth::Word,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(plic: &mut Plic, offset: u64) -> u32 {
        let mut out = ChipOutput::default();
        plic.read(offset, AccessWidth::Word, &mut out).unwrap() as u32
    }

    fn w(plic: &mut Plic, offset: u64, value: u32) -> ChipOutput {
        let mut out = ChipOutput::default();
        plic.write(offset, value, &mut out).unwrap();
        out
    }

    // S mode context of hart 1.
    const CTX: u64 = 3;

    #[test]
    fn claim_and_complete() {
        let mut plic = Plic::new(2, 64, 0, PLIC_MAX_PRIORITY).unwrap();
        w(&mut plic, 10 * 4, 3);
        w(&mut plic, 11 * 4, 5);
        w(&mut plic, ENABLE_BASE + CTX * ENABLE_PER_HART, (1 << 10) | (1 << 11));

        let mut out = ChipOutput::default();
        plic.set_irq(10, true, &mut out).unwrap();
        plic.set_irq(11, true, &mut out).unwrap();
        let lines: Vec<(usize, u32, bool)> =
            out.virqs().iter().map(|u| (u.vcpu, u.line, u.level)).collect();
        assert_eq!(lines, vec![(1, 10, true), (1, 10, false), (1, 11, true)]);
        assert_eq!(r(&mut plic, PENDING_BASE), (1 << 10) | (1 << 11));

        let claim = CONTEXT_BASE + CTX * CONTEXT_PER_HART + CONTEXT_CLAIM;
        assert_eq!(r(&mut plic, claim), 11);
        assert_eq!(r(&mut plic, claim), 10);
        assert_eq!(r(&mut plic, claim), 0);

        // Still high after completion: offered again.
        let out = w(&mut plic, claim, 11);
        assert_eq!(out.eois, vec![11]);
        assert_eq!(out.virqs()[0].line, 11);
        assert_eq!(r(&mut plic, claim), 11);
    }

    #[test]
    fn threshold_masks_low_priority() {
        let mut plic = Plic::new(1, 32, 0, 7).unwrap();
        w(&mut plic, 4 * 4, 2);
        w(&mut plic, ENABLE_BASE + ENABLE_PER_HART, 1 << 4);
        w(&mut plic, CONTEXT_BASE + CONTEXT_PER_HART, 2);

        let mut out = ChipOutput::default();
        plic.set_irq(4, true, &mut out).unwrap();
        assert!(out.virqs().is_empty());
        assert_eq!(plic.acknowledge(0, &mut out), Ack::None);

        let out = w(&mut plic, CONTEXT_BASE + CONTEXT_PER_HART, 1);
        assert_eq!(out.virqs()[0].line, 4);
        let mut out = ChipOutput::default();
        assert_eq!(plic.acknowledge(0, &mut out), Ack::Vector(4));

        // Thresholds beyond the maximum priority are rejected.
        let mut out = ChipOutput::default();
        assert!(plic
            .write(CONTEXT_BASE + CONTEXT_PER_HART, 8, &mut out)
            .is_err());
    }

    #[test]
    fn source_zero_and_bounds() {
        let mut plic = Plic::new(1, 32, 32, PLIC_MAX_PRIORITY).unwrap();
        let mut out = ChipOutput::default();
        assert_eq!(plic.set_irq(32, true, &mut out), Err(IrqError::InvalidLine(32)));
        assert_eq!(plic.set_irq(64, true, &mut out), Err(IrqError::InvalidLine(64)));
        assert!(plic.set_irq(33, true, &mut out).is_ok());
        // Bit 0 of the first enable word is hardwired to zero.
        w(&mut plic, ENABLE_BASE, 0xffff_ffff);
        assert_eq!(r(&mut plic, ENABLE_BASE), 0xffff_fffe);
        assert!(plic.read(0, AccessWidth::Word, &mut out).is_err());
        assert!(plic
            .read(CONTEXT_BASE + 2 * CONTEXT_PER_HART, AccessWidth::Word, &mut out)
            .is_err());
        assert!(Plic::new(1, 2048, 0, PLIC_MAX_PRIORITY).is_err());
    }
}
