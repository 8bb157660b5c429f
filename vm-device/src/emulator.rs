// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::io;
use std::sync::{Arc, Mutex};

use hypervisor::{AccessWidth, Endianness};
use thiserror::Error;

use crate::interrupt::IrqError;
use crate::memory::MemoryAccessError;

#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("Bad {width} access at offset {offset:#x}")]
    BadAccess { offset: u64, width: AccessWidth },
    #[error("Emulator does not handle {0} accesses")]
    UnsupportedWidth(AccessWidth),
    #[error("Missing or invalid attribute: {0}")]
    InvalidConfig(String),
    #[error("Interrupt delivery failed: {0}")]
    Irq(#[from] IrqError),
    #[error("Guest memory access failed: {0}")]
    Memory(#[from] MemoryAccessError),
    #[error("Host I/O failed: {0}")]
    Io(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, EmulatorError>;

/// Index of an emulator instance in its guest's emulation arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EmulatorId(pub usize);

/// Code servicing the reads and writes of one VIRTUAL region.
///
/// Offsets are relative to the region start; `vcpu` is the guest-local
/// index of the VCPU performing the access. Each instance sits behind its
/// own lock.
pub trait Emulator: Send {
    fn read(&mut self, vcpu: usize, offset: u64, width: AccessWidth) -> Result<u64>;

    fn write(&mut self, vcpu: usize, offset: u64, width: AccessWidth, value: u64) -> Result<()>;

    /// Return to the power-on state.
    fn reset(&mut self) -> Result<()>;

    /// Byte order the register values are expressed in.
    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn supports_width(&self, _width: AccessWidth) -> bool {
        true
    }

    /// Called before the instance is dropped with its region.
    fn remove(&mut self) {}
}

/// Read `width` bytes at `offset`, converted to the guest's byte order.
pub fn dispatch_read(
    emulator: &Mutex<dyn Emulator>,
    vcpu: usize,
    offset: u64,
    width: AccessWidth,
    guest: Endianness,
) -> Result<u64> {
    let mut emulator = emulator.lock().unwrap();
    if !emulator.supports_width(width) {
        return Err(EmulatorError::UnsupportedWidth(width));
    }
    let value = emulator.read(vcpu, offset, width)?;
    Ok(emulator.endianness().convert(guest, width, value))
}

/// Write the low `width` bytes of the guest value `value` at `offset`.
pub fn dispatch_write(
    emulator: &Mutex<dyn Emulator>,
    vcpu: usize,
    offset: u64,
    width: AccessWidth,
    value: u64,
    guest: Endianness,
) -> Result<()> {
    let mut emulator = emulator.lock().unwrap();
    if !emulator.supports_width(width) {
        return Err(EmulatorError::UnsupportedWidth(width));
    }
    let value = guest.convert(emulator.endianness(), width, value);
    emulator.write(vcpu, offset, width, value)
}

/// Cloneable handle on a host output stream shared by several emulators.
#[derive(Clone)]
pub struct SharedWriter(Arc<Mutex<dyn io::Write + Send>>);

impl SharedWriter {
    pub fn new<W: io::Write + Send + 'static>(writer: W) -> Self {
        SharedWriter(Arc::new(Mutex::new(writer)))
    }
}

impl io::Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}
