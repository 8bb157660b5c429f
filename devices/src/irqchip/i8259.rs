// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Intel 8259A programmable interrupt controller.
//!
//! A chip without a parent drives the INTR input of VCPU 0. A cascaded
//! chip drives the input of its parent it is wired to, and supplies the
//! vector when the parent acknowledges that input.

use hypervisor::{AccessWidth, VirqKind};
use vm_device::{EmulatorError, IrqError, Result};

use super::{Ack, ChipOutput};

const PIC_NR_IRQS: u32 = 8;
const PIC_CASCADE_IRQ: u32 = 2;
const PIC_SPURIOUS_IRQ: u8 = 7;

const ICW1_INIT: u8 = 0x10;
const ICW1_IC4: u8 = 0x01;
const ICW1_SNGL: u8 = 0x02;
const ICW1_LTIM: u8 = 0x08;
const OCW3_SEL: u8 = 0x08;
const OCW3_POLL: u8 = 0x04;
const OCW3_RR: u8 = 0x02;
const OCW3_ESMM: u8 = 0x40;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InitState {
    Ready,
    Icw2,
    Icw3,
    Icw4,
}

pub struct I8259 {
    base_irq: u32,
    cascaded: bool,
    last_irr: u8,
    irr: u8,
    imr: u8,
    isr: u8,
    elcr: u8,
    priority_add: u8,
    int_base: u8,
    read_isr: bool,
    poll: bool,
    special_mask: bool,
    init_state: InitState,
    init4: bool,
    single_mode: bool,
    auto_eoi: bool,
    rotate_on_auto_eoi: bool,
    special_fully_nested: bool,
    /// VCPU line or parent input currently raised.
    asserted: Option<u32>,
}

impl I8259 {
    pub fn new(base_irq: u32, cascaded: bool) -> Self {
        let mut pic = I8259 {
            base_irq,
            cascaded,
            last_irr: 0,
            irr: 0,
            imr: 0,
            isr: 0,
            elcr: 0,
            priority_add: 0,
            int_base: 0,
            read_isr: false,
            poll: false,
            special_mask: false,
            init_state: InitState::Ready,
            init4: false,
            single_mode: false,
            auto_eoi: false,
            rotate_on_auto_eoi: false,
            special_fully_nested: false,
            asserted: None,
        };
        pic.init_reset();
        pic
    }

    fn init_reset(&mut self) {
        self.elcr = 0;
        self.last_irr = 0;
        self.irr &= self.elcr;
        self.imr = 0;
        self.isr = 0;
        self.priority_add = 0;
        self.read_isr = false;
        self.poll = false;
        self.special_mask = false;
        self.init_state = InitState::Ready;
        self.auto_eoi = false;
        self.rotate_on_auto_eoi = false;
        self.special_fully_nested = false;
        self.init4 = false;
        self.single_mode = false;
    }

    /// Priority of the highest priority bit in `mask`, 8 when empty.
    fn priority(&self, mask: u8) -> u8 {
        if mask == 0 {
            return 8;
        }
        let mut priority = 0;
        while mask & (1 << ((priority + self.priority_add) & 7)) == 0 {
            priority += 1;
        }
        priority
    }

    /// Input to deliver, if any beats the ones in service.
    fn pending_irq(&self) -> Option<u8> {
        let priority = self.priority(self.irr & !self.imr);
        if priority == 8 {
            return None;
        }
        let mut mask = self.isr;
        if self.special_mask {
            mask &= !self.imr;
        }
        // The slave input does not block itself in special fully nested mode.
        if self.special_fully_nested && !self.cascaded {
            mask &= !(1 << PIC_CASCADE_IRQ);
        }
        (priority < self.priority(mask)).then_some((priority + self.priority_add) & 7)
    }

    fn update(&mut self, out: &mut ChipOutput) {
        let irq = self.pending_irq();
        if self.cascaded {
            let level = irq.is_some();
            if level != self.asserted.is_some() {
                self.asserted = irq.map(u32::from);
                out.set_parent(level);
            }
            return;
        }
        let line = irq.map(|irq| u32::from(irq) + self.base_irq);
        if line == self.asserted {
            return;
        }
        if let Some(old) = self.asserted {
            out.set_virq(0, old, VirqKind::Irq, false);
        }
        if let Some(new) = line {
            out.set_virq(0, new, VirqKind::Irq, true);
        }
        self.asserted = line;
    }

    pub fn set_irq(
        &mut self,
        line: u32,
        level: bool,
        out: &mut ChipOutput,
    ) -> std::result::Result<(), IrqError> {
        let irq = line
            .checked_sub(self.base_irq)
            .filter(|irq| *irq < PIC_NR_IRQS)
            .ok_or(IrqError::InvalidLine(line))?;
        let mask = 1u8 << irq;

        if self.elcr & mask != 0 {
            if level {
                self.irr |= mask;
                self.last_irr |= mask;
            } else {
                self.irr &= !mask;
                self.last_irr &= !mask;
            }
        } else if level {
            if self.last_irr & mask == 0 {
                self.irr |= mask;
            }
            self.last_irr |= mask;
        } else {
            self.last_irr &= !mask;
        }
        self.update(out);
        Ok(())
    }

    fn intack(&mut self, irq: u8, out: &mut ChipOutput) {
        if self.auto_eoi {
            if self.rotate_on_auto_eoi {
                self.priority_add = (irq + 1) & 7;
            }
        } else {
            self.isr |= 1 << irq;
        }
        // Level sensitive inputs stay requested.
        if self.elcr & (1 << irq) == 0 {
            self.irr &= !(1 << irq);
        }
        self.update(out);
    }

    /// INTA cycle. The cascade input of the master hands over to the slave.
    pub fn acknowledge(&mut self, out: &mut ChipOutput) -> Ack {
        match self.pending_irq() {
            Some(irq) => {
                self.intack(irq, out);
                if u32::from(irq) == PIC_CASCADE_IRQ && !self.cascaded && !self.single_mode {
                    Ack::Cascade(PIC_CASCADE_IRQ + self.base_irq)
                } else {
                    Ack::Vector(u32::from(self.int_base + irq))
                }
            }
            None => Ack::Vector(u32::from(self.int_base + PIC_SPURIOUS_IRQ)),
        }
    }

    pub fn reset(&mut self, out: &mut ChipOutput) {
        self.init_reset();
        self.update(out);
    }

    fn end_of_interrupt(&mut self, irq: u8) {
        self.isr &= !(1 << irq);
    }

    fn write_command(&mut self, val: u8, out: &mut ChipOutput) {
        if val & ICW1_INIT != 0 {
            self.init_reset();
            self.init_state = InitState::Icw2;
            self.init4 = val & ICW1_IC4 != 0;
            self.single_mode = val & ICW1_SNGL != 0;
            if val & ICW1_LTIM != 0 {
                self.elcr = 0xff;
            }
            self.update(out);
        } else if val & OCW3_SEL != 0 {
            if val & OCW3_POLL != 0 {
                self.poll = true;
            }
            if val & OCW3_RR != 0 {
                self.read_isr = val & 1 != 0;
            }
            if val & OCW3_ESMM != 0 {
                self.special_mask = (val >> 5) & 1 != 0;
            }
        } else {
            let cmd = val >> 5;
            match cmd {
                0 | 4 => self.rotate_on_auto_eoi = cmd >> 2 != 0,
                // Non-specific EOI, optionally rotating.
                1 | 5 => {
                    let priority = self.priority(self.isr);
                    if priority != 8 {
                        let irq = (priority + self.priority_add) & 7;
                        self.end_of_interrupt(irq);
                        if cmd == 5 {
                            self.priority_add = (irq + 1) & 7;
                        }
                        self.update(out);
                    }
                }
                3 => {
                    self.end_of_interrupt(val & 7);
                    self.update(out);
                }
                6 => {
                    self.priority_add = (val + 1) & 7;
                    self.update(out);
                }
                7 => {
                    let irq = val & 7;
                    self.end_of_interrupt(irq);
                    self.priority_add = (irq + 1) & 7;
                    self.update(out);
                }
                _ => {}
            }
        }
    }

    fn write_data(&mut self, val: u8, out: &mut ChipOutput) {
        match self.init_state {
            InitState::Ready => {
                self.imr = val;
                self.update(out);
            }
            InitState::Icw2 => {
                self.int_base = val & 0xf8;
                self.init_state = match (self.single_mode, self.init4) {
                    (false, _) => InitState::Icw3,
                    (true, true) => InitState::Icw4,
                    (true, false) => InitState::Ready,
                };
            }
            InitState::Icw3 => {
                self.init_state = if self.init4 {
                    InitState::Icw4
                } else {
                    InitState::Ready
                };
            }
            InitState::Icw4 => {
                self.special_fully_nested = (val >> 4) & 1 != 0;
                self.auto_eoi = (val >> 1) & 1 != 0;
                self.init_state = InitState::Ready;
            }
        }
    }

    pub fn write(&mut self, offset: u64, value: u8, out: &mut ChipOutput) -> Result<()> {
        match offset {
            0 => self.write_command(value, out),
            1 => self.write_data(value, out),
            _ => {
                return Err(EmulatorError::BadAccess {
                    offset,
                    width: AccessWidth::Byte,
                })
            }
        }
        Ok(())
    }

    pub fn read(&mut self, offset: u64, out: &mut ChipOutput) -> Result<u64> {
        if offset > 1 {
            return Err(EmulatorError::BadAccess {
                offset,
                width: AccessWidth::Byte,
            });
        }
        let v = if self.poll {
            self.poll = false;
            match self.pending_irq() {
                Some(irq) => {
                    self.intack(irq, out);
                    irq | 0x80
                }
                None => 0,
            }
        } else if offset == 0 {
            if self.read_isr {
                self.isr
            } else {
                self.irr
            }
        } else {
            self.imr
        };
        Ok(u64::from(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(pic: &mut I8259, vector_base: u8, out: &mut ChipOutput) {
        for (port, v) in [(0, 0x11), (1, vector_base), (1, 0x04), (1, 0x01), (1, 0x00)] {
            pic.write(port, v, out).unwrap();
        }
    }

    fn levels(out: &ChipOutput) -> Vec<(u32, bool)> {
        out.virqs().iter().map(|u| (u.line, u.level)).collect()
    }

    #[test]
    fn edge_irq_acknowledge_and_eoi() {
        let mut pic = I8259::new(0, false);
        let mut out = ChipOutput::default();
        init(&mut pic, 0x20, &mut out);

        let mut out = ChipOutput::default();
        pic.set_irq(3, true, &mut out).unwrap();
        // Held high: no second request.
        pic.set_irq(3, true, &mut out).unwrap();
        assert_eq!(levels(&out), vec![(3, true)]);

        let mut out = ChipOutput::default();
        assert_eq!(pic.acknowledge(&mut out), Ack::Vector(0x23));
        assert_eq!(levels(&out), vec![(3, false)]);

        // OCW3: read ISR.
        pic.write(0, 0x0b, &mut out).unwrap();
        assert_eq!(pic.read(0, &mut out).unwrap(), 0x08);
        // Non-specific EOI.
        pic.write(0, 0x20, &mut out).unwrap();
        assert_eq!(pic.read(0, &mut out).unwrap(), 0);
        assert_eq!(pic.acknowledge(&mut out), Ack::Vector(0x27));
    }

    #[test]
    fn mask_and_priority() {
        let mut pic = I8259::new(0, false);
        let mut out = ChipOutput::default();
        init(&mut pic, 0x08, &mut out);
        pic.write(1, 0x02, &mut out).unwrap();

        let mut out = ChipOutput::default();
        pic.set_irq(1, true, &mut out).unwrap();
        assert!(out.virqs().is_empty());
        assert_eq!(pic.read(0, &mut out).unwrap(), 0x02);

        pic.set_irq(5, true, &mut out).unwrap();
        pic.write(1, 0x00, &mut out).unwrap();
        assert_eq!(levels(&out), vec![(5, true), (5, false), (1, true)]);
        assert_eq!(pic.acknowledge(&mut out), Ack::Vector(0x09));
        // IRQ 5 is lower priority than the one in service.
        assert_eq!(pic.pending_irq(), None);
        // Specific EOI for IRQ 1.
        pic.write(0, 0x61, &mut out).unwrap();
        assert_eq!(pic.acknowledge(&mut out), Ack::Vector(0x0d));
    }

    #[test]
    fn slave_drives_parent() {
        let mut master = I8259::new(0, false);
        let mut slave = I8259::new(8, true);
        let mut out = ChipOutput::default();
        init(&mut master, 0x08, &mut out);
        init(&mut slave, 0x70, &mut out);

        let mut out = ChipOutput::default();
        slave.set_irq(12, true, &mut out).unwrap();
        assert_eq!(out.parent_level, Some(true));
        assert!(out.virqs().is_empty());
        assert!(slave.set_irq(3, true, &mut out).is_err());

        master.set_irq(2, true, &mut out).unwrap();
        assert_eq!(master.acknowledge(&mut out), Ack::Cascade(2));

        let mut out = ChipOutput::default();
        assert_eq!(slave.acknowledge(&mut out), Ack::Vector(0x74));
        assert_eq!(out.parent_level, Some(false));
    }

    #[test]
    fn poll_and_auto_eoi() {
        let mut pic = I8259::new(0, false);
        let mut out = ChipOutput::default();
        for (port, v) in [(0, 0x13), (1, 0x20), (1, 0x03)] {
            pic.write(port, v, &mut out).unwrap();
        }
        pic.set_irq(4, true, &mut out).unwrap();
        pic.write(0, 0x0c, &mut out).unwrap();
        assert_eq!(pic.read(0, &mut out).unwrap(), 0x84);
        // Auto EOI leaves nothing in service.
        pic.write(0, 0x0b, &mut out).unwrap();
        assert_eq!(pic.read(0, &mut out).unwrap(), 0);
        assert!(pic.read(2, &mut out).is_err());
    }
}
