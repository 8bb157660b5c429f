// Copyright 2021 Arm Limited (or its affiliates). All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! ARM PrimeCell UART(PL011)
//!
//! This module implements an ARM PrimeCell UART(PL011).
//!

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use hypervisor::AccessWidth;
use vm_device::{Emulator, EmulatorError, IrqLine, ProbeContext, Result};

/* Registers */
const UARTDR: u64 = 0;
const UARTRSR_UARTECR: u64 = 1;
const UARTFR: u64 = 6;
const UARTILPR: u64 = 8;
const UARTIBRD: u64 = 9;
const UARTFBRD: u64 = 10;
const UARTLCR_H: u64 = 11;
const UARTCR: u64 = 12;
const UARTIFLS: u64 = 13;
const UARTIMSC: u64 = 14;
const UARTRIS: u64 = 15;
const UARTMIS: u64 = 16;
const UARTICR: u64 = 17;
const UARTDMACR: u64 = 18;

const PL011_INT_TX: u32 = 0x20;
const PL011_INT_RX: u32 = 0x10;

const PL011_FLAG_RXFF: u32 = 0x40;
const PL011_FLAG_RXFE: u32 = 0x10;

const PL011_FIFO_DEPTH: u32 = 16;

const PL011_ID: [u8; 8] = [0x11, 0x10, 0x14, 0x00, 0x0d, 0xf0, 0x05, 0xb1];
// We are only interested in the margins.
const AMBA_ID_LOW: u64 = 0x3f8;
const AMBA_ID_HIGH: u64 = 0x401;

pub const PL011_COMPATIBLE: &[&str] = &["arm,pl011", "arm,primecell"];

/// A PL011 device following the PL011 specification.
pub struct Pl011 {
    id: String,
    flags: u32,
    lcr: u32,
    rsr: u32,
    cr: u32,
    dmacr: u32,
    int_enabled: u32,
    int_level: u32,
    read_fifo: VecDeque<u8>,
    ilpr: u32,
    ibrd: u32,
    fbrd: u32,
    ifl: u32,
    read_count: u32,
    read_trigger: u32,
    irq: Option<IrqLine>,
    irq_level: bool,
    out: Option<Box<dyn io::Write + Send>>,
}

impl Pl011 {
    /// Constructs an AMBA PL011 UART device.
    pub fn new(id: String, irq: Option<IrqLine>, out: Option<Box<dyn io::Write + Send>>) -> Self {
        let mut pl011 = Self {
            id,
            flags: 0,
            lcr: 0,
            rsr: 0,
            cr: 0,
            dmacr: 0,
            int_enabled: 0,
            int_level: 0,
            read_fifo: VecDeque::new(),
            ilpr: 0,
            ibrd: 0,
            fbrd: 0,
            ifl: 0,
            read_count: 0,
            read_trigger: 1,
            irq,
            irq_level: false,
            out,
        };
        pl011.reset_registers();
        pl011
    }

    pub fn probe(ctx: &ProbeContext) -> Result<Arc<Mutex<dyn Emulator>>> {
        let irq = ctx.irq_lines().into_iter().next();
        let out = ctx
            .console
            .clone()
            .map(|w| Box::new(w) as Box<dyn io::Write + Send>);
        let id = format!("{}/{}", ctx.guest, ctx.node.name);
        Ok(Arc::new(Mutex::new(Pl011::new(id, irq, out))))
    }

    fn reset_registers(&mut self) {
        self.flags = 0x90;
        self.lcr = 0;
        self.rsr = 0;
        self.cr = 0x300;
        self.dmacr = 0;
        self.int_enabled = 0;
        self.int_level = 0;
        self.read_fifo.clear();
        self.ilpr = 0;
        self.ibrd = 0;
        self.fbrd = 0;
        self.ifl = 0x12;
        self.read_count = 0;
        self.read_trigger = 1;
    }

    /// Queues raw bytes for the guest to read and signals the interrupt
    pub fn queue_input_bytes(&mut self, c: &[u8]) -> Result<()> {
        self.read_fifo.extend(c);
        self.read_count += c.len() as u32;
        self.flags &= !PL011_FLAG_RXFE;

        if ((self.lcr & 0x10) == 0) || (self.read_count >= PL011_FIFO_DEPTH) {
            self.flags |= PL011_FLAG_RXFF;
        }

        if self.read_count >= self.read_trigger {
            self.int_level |= PL011_INT_RX;
        }

        self.update_interrupt()
    }

    fn pl011_get_baudrate(&self) -> u32 {
        if self.fbrd == 0 {
            return 0;
        }

        let clk = 24_000_000; // We set the APB_PLCK to 24M in device tree
        (clk / ((self.ibrd << 6) + self.fbrd)) << 2
    }

    fn pl011_trace_baudrate_change(&self) {
        debug!(
            "{}: new baudrate {} (ibrd: {}, fbrd: {})",
            self.id,
            self.pl011_get_baudrate(),
            self.ibrd,
            self.fbrd
        );
    }

    fn pl011_set_read_trigger(&mut self) {
        self.read_trigger = 1;
    }

    fn handle_read(&mut self, offset: u64) -> Option<u32> {
        if (AMBA_ID_LOW..AMBA_ID_HIGH).contains(&(offset >> 2)) {
            let index = ((offset - 0xfe0) >> 2) as usize;
            return PL011_ID.get(index).map(|id| u32::from(*id));
        }

        let v = match offset >> 2 {
            UARTDR => {
                self.flags &= !PL011_FLAG_RXFF;
                let c: u32 = self.read_fifo.pop_front().unwrap_or_default().into();
                if self.read_count > 0 {
                    self.read_count -= 1;
                }
                if self.read_count == 0 {
                    self.flags |= PL011_FLAG_RXFE;
                }
                if self.read_count == (self.read_trigger - 1) {
                    self.int_level &= !PL011_INT_RX;
                }
                self.rsr = c >> 8;
                c
            }
            UARTRSR_UARTECR => self.rsr,
            UARTFR => self.flags,
            UARTILPR => self.ilpr,
            UARTIBRD => self.ibrd,
            UARTFBRD => self.fbrd,
            UARTLCR_H => self.lcr,
            UARTCR => self.cr,
            UARTIFLS => self.ifl,
            UARTIMSC => self.int_enabled,
            UARTRIS => self.int_level,
            UARTMIS => self.int_level & self.int_enabled,
            UARTDMACR => self.dmacr,
            _ => return None,
        };
        Some(v)
    }

    fn handle_write(&mut self, offset: u64, val: u32) -> Result<()> {
        match offset >> 2 {
            UARTDR => {
                self.int_level |= PL011_INT_TX;
                if let Some(out) = self.out.as_mut() {
                    out.write_all(&[val.to_le_bytes()[0]])
                        .map_err(EmulatorError::Io)?;
                    out.flush().map_err(EmulatorError::Io)?;
                }
            }
            UARTRSR_UARTECR => {
                self.rsr = 0;
            }
            UARTFR => { /* Writes to Flag register are ignored.*/ }
            UARTILPR => {
                self.ilpr = val;
            }
            UARTIBRD => {
                self.ibrd = val;
                self.pl011_trace_baudrate_change();
            }
            UARTFBRD => {
                self.fbrd = val;
                self.pl011_trace_baudrate_change();
            }
            UARTLCR_H => {
                /* Reset the FIFO state on FIFO enable or disable */
                if ((self.lcr ^ val) & 0x10) != 0 {
                    self.read_count = 0;
                }
                self.lcr = val;
                self.pl011_set_read_trigger();
            }
            UARTCR => {
                self.cr = val;
            }
            UARTIFLS => {
                self.ifl = val;
                self.pl011_set_read_trigger();
            }
            UARTIMSC => {
                self.int_enabled = val;
            }
            UARTICR => {
                self.int_level &= !val;
            }
            UARTDMACR => {
                self.dmacr = val;
                if (val & 3) != 0 {
                    warn!("{}: DMA not implemented", self.id);
                }
            }
            _ => {
                return Err(EmulatorError::BadAccess {
                    offset,
                    width: AccessWidth::Word,
                });
            }
        }
        self.update_interrupt()
    }

    // The output is a level: raised while an enabled interrupt is pending.
    fn update_interrupt(&mut self) -> Result<()> {
        let level = self.int_level & self.int_enabled != 0;
        if level != self.irq_level {
            self.irq_level = level;
            if let Some(irq) = &self.irq {
                irq.set_level(level)?;
            }
        }
        Ok(())
    }
}

impl Emulator for Pl011 {
    fn read(&mut self, _vcpu: usize, offset: u64, width: AccessWidth) -> Result<u64> {
        match self.handle_read(offset & !3) {
            Some(v) => {
                self.update_interrupt()?;
                Ok(u64::from(v) & width.mask())
            }
            None => {
                warn!("{}: invalid read at offset {:#x}", self.id, offset);
                Err(EmulatorError::BadAccess { offset, width })
            }
        }
    }

    fn write(&mut self, _vcpu: usize, offset: u64, _width: AccessWidth, value: u64) -> Result<()> {
        self.handle_write(offset & !3, value as u32)
    }

    fn reset(&mut self) -> Result<()> {
        self.reset_registers();
        self.update_interrupt()
    }

    fn supports_width(&self, width: AccessWidth) -> bool {
        width != AccessWidth::Double
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ChipRecorder, SharedBuffer};
    use std::sync::Arc;
    use vm_device::IrqRouter;

    const SERIAL_NAME: &str = "serial";

    fn pl011_with_irq() -> (Pl011, Arc<ChipRecorder>, SharedBuffer) {
        let router = Arc::new(IrqRouter::new());
        let chip = Arc::new(ChipRecorder::default());
        router.register_chip("gic", chip.clone()).unwrap();
        let out = SharedBuffer::new();
        let pl011 = Pl011::new(
            String::from(SERIAL_NAME),
            Some(IrqLine::new(router, None, 33)),
            Some(Box::new(out.clone())),
        );
        (pl011, chip, out)
    }

    #[test]
    fn pl011_flags_after_reset() {
        let (mut pl011, _, _) = pl011_with_irq();
        assert_eq!(pl011.read(0, 0x18, AccessWidth::Word).unwrap(), 0x90);
        assert_eq!(pl011.read(0, 0xfe0, AccessWidth::Word).unwrap(), 0x11);
        assert_eq!(pl011.read(0, 0xffc, AccessWidth::Word).unwrap(), 0xb1);
        assert!(pl011.read(0, 0x800, AccessWidth::Word).is_err());
    }

    #[test]
    fn pl011_output() {
        let (mut pl011, _, out) = pl011_with_irq();
        for c in b"xabc" {
            pl011
                .write(0, UARTDR, AccessWidth::Byte, u64::from(*c))
                .unwrap();
        }
        assert_eq!(out.contents(), b"xabc");
    }

    #[test]
    fn pl011_input_raises_level() {
        let (mut pl011, chip, _) = pl011_with_irq();
        pl011
            .write(0, UARTIMSC << 2, AccessWidth::Word, u64::from(PL011_INT_RX))
            .unwrap();
        pl011.queue_input_bytes(b"abc").unwrap();
        assert_eq!(chip.events(), vec![(33, true)]);

        let mut data = Vec::new();
        for _ in 0..3 {
            data.push(pl011.read(0, UARTDR, AccessWidth::Byte).unwrap() as u8);
        }
        assert_eq!(data, b"abc");
        assert_eq!(chip.events(), vec![(33, true), (33, false)]);
        assert_eq!(
            pl011.read(0, UARTFR << 2, AccessWidth::Word).unwrap() as u32 & PL011_FLAG_RXFE,
            PL011_FLAG_RXFE
        );
    }
}
