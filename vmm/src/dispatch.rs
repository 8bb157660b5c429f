// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Trap dispatch.
//!
//! Runs on the host CPU of the trapping VCPU with its register file locked.
//! Faults the guest is responsible for become synchronous exceptions in the
//! guest; host failures pause the guest.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use hypervisor::{
    AbortKind, AccessKind, AccessWidth, ArchVcpu, EmulationError, EmulationResult, Endianness,
    Fault, GuestException, PlatformEmulator, PlatformError, PortIo, PortIoBus, Stage2Fault,
    SysRegAccess, SysRegId, TrapInfo, WaitEvent,
};
use vm_device::{dispatch_read, dispatch_write, Emulator, EmulatorError};

use crate::cpu::Vcpu;
use crate::error::{Error, ErrorKind, Result};
use crate::memory_manager::{AddressKind, Region, RegionFlags, Stage2Fill};
use crate::vm::Guest;

/// What the VCPU does once its trap is handled.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TrapOutcome {
    Resume,
    /// Wait for interrupt.
    Park,
    Yield,
    /// Too many failed emulations: stop the guest.
    Throttle,
    Inspect(String),
}

/// Sliding window of instruction emulation failures.
pub(crate) struct FaultThrottle {
    limit: usize,
    window_ns: u64,
    failures: Mutex<VecDeque<u64>>,
}

impl FaultThrottle {
    pub fn new(limit: usize, window_ns: u64) -> Self {
        FaultThrottle {
            limit,
            window_ns,
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a failure at `now_ns`; returns whether the limit is exceeded.
    pub fn record(&self, now_ns: u64) -> bool {
        let mut failures = self.failures.lock().unwrap();
        while failures
            .front()
            .is_some_and(|&t| now_ns.saturating_sub(t) > self.window_ns)
        {
            failures.pop_front();
        }
        failures.push_back(now_ns);
        failures.len() > self.limit
    }

    pub fn reset(&self) {
        self.failures.lock().unwrap().clear();
    }
}

fn gpr_error(e: hypervisor::HypervisorCpuError) -> Error {
    Error::DecodeFailure(e.into())
}

fn emulator_error(addr: u64, e: EmulatorError) -> PlatformError {
    match e {
        EmulatorError::BadAccess { .. }
        | EmulatorError::UnsupportedWidth(_)
        | EmulatorError::Memory(_) => PlatformError::BadGuestAccess(addr),
        e => PlatformError::EmulatorFailure(e.into()),
    }
}

fn port_error(port: u16, e: EmulatorError) -> EmulationError {
    EmulationError::PlatformEmulationError(emulator_error(u64::from(port), e))
}

impl Guest {
    pub(crate) fn handle_trap(&self, vcpu: &Arc<Vcpu>, info: TrapInfo) {
        let Some(arch) = vcpu.arch() else {
            return;
        };
        let mut state = arch.lock().unwrap();
        let outcome = match state.decode_fault(&info) {
            Ok(fault) => {
                trace!("{}: {:?} at pc {:#x}", vcpu.name, fault, state.pc());
                self.dispatch_fault(vcpu, &mut state, fault)
            }
            Err(e) => Ok(TrapOutcome::Inspect(format!("undecodable trap {:?}: {}", info, e))),
        };
        drop(state);

        match outcome {
            Ok(TrapOutcome::Resume) => {}
            Ok(TrapOutcome::Park) => {
                self.scheduler().vcpu_park(vcpu);
            }
            Ok(TrapOutcome::Yield) => self.scheduler().vcpu_yield(vcpu),
            Ok(TrapOutcome::Throttle) => {
                warn!("{}: repeated emulation failures, pausing guest", self.name);
                self.pause_for_inspection("repeated emulation failures");
            }
            Ok(TrapOutcome::Inspect(reason)) => {
                error!("{}: {}", vcpu.name, reason);
                self.pause_for_inspection(&reason);
            }
            Err(e) => {
                error!("{}: host failure while handling trap: {}", vcpu.name, e);
                self.pause_for_inspection(&e.to_string());
            }
        }
    }

    fn dispatch_fault(
        &self,
        vcpu: &Vcpu,
        state: &mut ArchVcpu,
        fault: Fault,
    ) -> Result<TrapOutcome> {
        match fault {
            Fault::Stage2(f) => self.stage2_fault(vcpu, state, &f),
            Fault::Wait {
                event,
                instruction_len,
            } => {
                state.advance_pc(instruction_len);
                Ok(match event {
                    WaitEvent::Interrupt => TrapOutcome::Park,
                    WaitEvent::Event => TrapOutcome::Yield,
                })
            }
            Fault::Hypercall {
                imm,
                instruction_len,
            } => {
                debug!("{}: hypercall {:#x}", vcpu.name, imm);
                state.advance_pc(instruction_len);
                Ok(TrapOutcome::Yield)
            }
            Fault::SysReg(access) => self.sysreg_access(vcpu, state, &access),
            Fault::PortIo(io) => self.port_io(vcpu, state, &io),
            Fault::Cpuid { instruction_len } => {
                state.emulate_cpuid(instruction_len)?;
                Ok(TrapOutcome::Resume)
            }
            // The host takes its interrupt on the way back to the run loop.
            Fault::Interrupt => Ok(TrapOutcome::Resume),
            Fault::ConditionFailed { instruction_len } => {
                state.advance_pc(instruction_len);
                Ok(TrapOutcome::Resume)
            }
            Fault::Undefined { instruction_len } => {
                warn!(
                    "{}: undefined instruction at pc {:#x}",
                    vcpu.name,
                    state.pc()
                );
                state.inject_sync_exception(GuestException::Undefined { instruction_len });
                Ok(self.charge_failure())
            }
            Fault::Unrecoverable(reason) => Ok(TrapOutcome::Inspect(reason)),
        }
    }

    fn stage2_fault(
        &self,
        vcpu: &Vcpu,
        state: &mut ArchVcpu,
        fault: &Stage2Fault,
    ) -> Result<TrapOutcome> {
        let result = match self.memory().stage2_fill(fault.ipa, fault.access) {
            Ok(Stage2Fill::Mapped { .. }) => return Ok(TrapOutcome::Resume),
            Ok(Stage2Fill::Virtual { region, offset }) => {
                self.emulate_mmio(vcpu, state, fault, &region, offset)
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                // Interrupts raised by the access are visible before the
                // guest moves past it.
                self.hal().memory_barrier();
                Ok(TrapOutcome::Resume)
            }
            Err(e) => self.guest_abort(vcpu, state, fault, e),
        }
    }

    fn emulate_mmio(
        &self,
        vcpu: &Vcpu,
        state: &mut ArchVcpu,
        fault: &Stage2Fault,
        region: &Region,
        offset: u64,
    ) -> Result<()> {
        if fault.access == AccessKind::Execute {
            return Err(Error::BadGuestAccess { gpa: fault.ipa });
        }
        let emulator = region
            .emulator
            .and_then(|id| self.devices().get(id))
            .ok_or(Error::BadGuestAccess { gpa: fault.ipa })?;
        let endianness = state.endianness();

        let Some(syndrome) = fault.syndrome else {
            let snapshot = state.clone();
            let mut platform = GuestPlatform::new(self, vcpu.subid, &snapshot);
            state.emulate_instruction(fault, &mut platform)?;
            return Ok(());
        };

        let width = syndrome.width;
        if !width.is_aligned(fault.ipa) {
            return Err(Error::Alignment(fault.ipa));
        }
        if fault.access == AccessKind::Write {
            let value = state.read_gpr(syndrome.reg).map_err(gpr_error)? & width.mask();
            dispatch_write(&emulator, vcpu.subid, offset, width, value, endianness)?;
        } else {
            let mut value = dispatch_read(&emulator, vcpu.subid, offset, width, endianness)?;
            if syndrome.sign_extend {
                value = width.sign_extend(value);
                if !syndrome.sixty_four {
                    value &= 0xffff_ffff;
                }
            }
            state.write_gpr(syndrome.reg, value).map_err(gpr_error)?;
        }
        state.advance_pc(syndrome.instruction_len);
        Ok(())
    }

    /// Turn a failed guest memory access into an abort in the guest.
    fn guest_abort(
        &self,
        vcpu: &Vcpu,
        state: &mut ArchVcpu,
        fault: &Stage2Fault,
        error: Error,
    ) -> Result<TrapOutcome> {
        let kind = match (&error, error.kind()) {
            (Error::WriteToReadOnly { .. }, _) => AbortKind::Permission,
            (_, ErrorKind::Alignment) => AbortKind::Alignment,
            (_, ErrorKind::BadGuestAccess) | (_, ErrorKind::DecodeFailure) => AbortKind::External,
            _ => return Err(error),
        };
        warn!(
            "{}: {:?} access at {:#x} (pc {:#x}): {}",
            vcpu.name,
            fault.access,
            fault.ipa,
            state.pc(),
            error
        );

        let va = fault.va.unwrap_or(fault.ipa);
        state.inject_sync_exception(match fault.access {
            AccessKind::Execute => GuestException::PrefetchAbort { va, kind },
            access => GuestException::DataAbort {
                va,
                ipa: fault.ipa,
                write: access == AccessKind::Write,
                kind,
            },
        });

        if error.kind() == ErrorKind::DecodeFailure {
            return Ok(self.charge_failure());
        }
        Ok(TrapOutcome::Resume)
    }

    /// Count an instruction the guest could not have executed.
    fn charge_failure(&self) -> TrapOutcome {
        if self.throttle().record(self.hal().monotonic_ns()) {
            TrapOutcome::Throttle
        } else {
            TrapOutcome::Resume
        }
    }

    fn read_cpu_reg(&self, cpu: usize, state: &mut ArchVcpu, id: SysRegId) -> Option<u64> {
        if let Some(value) = self.router().chip(None).and_then(|c| c.read_cpu_reg(cpu, id)) {
            return Some(value);
        }
        state.read_system_reg(id).ok()
    }

    fn write_cpu_reg(&self, cpu: usize, state: &mut ArchVcpu, id: SysRegId, value: u64) -> bool {
        if self
            .router()
            .chip(None)
            .is_some_and(|c| c.write_cpu_reg(cpu, id, value))
        {
            return true;
        }
        state.write_system_reg(id, value).is_ok()
    }

    fn sysreg_access(
        &self,
        vcpu: &Vcpu,
        state: &mut ArchVcpu,
        access: &SysRegAccess,
    ) -> Result<TrapOutcome> {
        let cpu = vcpu.subid;
        let id = access.id;

        let done = if let Some((funct3, source)) = access.csr_op {
            match self.read_cpu_reg(cpu, state, id) {
                Some(old) => {
                    let new = match funct3 & 0x3 {
                        1 => source,
                        2 => old | source,
                        _ => old & !source,
                    };
                    let written = !access.write || self.write_cpu_reg(cpu, state, id, new);
                    if written {
                        state.write_gpr(access.rt, old).map_err(gpr_error)?;
                    }
                    written
                }
                None => false,
            }
        } else if access.write {
            let low = state.read_gpr(access.rt).map_err(gpr_error)?;
            let value = match access.rt2 {
                Some(rt2) => {
                    let high = state.read_gpr(rt2).map_err(gpr_error)?;
                    (high << 32) | (low & 0xffff_ffff)
                }
                None => low,
            };
            self.write_cpu_reg(cpu, state, id, value)
        } else {
            match self.read_cpu_reg(cpu, state, id) {
                Some(value) => {
                    match access.rt2 {
                        Some(rt2) => {
                            state.write_gpr(access.rt, value & 0xffff_ffff).map_err(gpr_error)?;
                            state.write_gpr(rt2, value >> 32).map_err(gpr_error)?;
                        }
                        None => state.write_gpr(access.rt, value).map_err(gpr_error)?,
                    }
                    true
                }
                None => false,
            }
        };

        if done {
            state.advance_pc(access.instruction_len);
        } else {
            warn!(
                "{}: unhandled {} of {:?} at pc {:#x}",
                vcpu.name,
                if access.write { "write" } else { "read" },
                id,
                state.pc()
            );
            state.inject_sync_exception(match id {
                // #GP for MSRs
                SysRegId::Msr(_) => GuestException::DataAbort {
                    va: 0,
                    ipa: 0,
                    write: access.write,
                    kind: AbortKind::External,
                },
                _ => GuestException::Undefined {
                    instruction_len: access.instruction_len,
                },
            });
        }
        Ok(TrapOutcome::Resume)
    }

    fn port_io(&self, vcpu: &Vcpu, state: &mut ArchVcpu, io: &PortIo) -> Result<TrapOutcome> {
        let snapshot = state.clone();
        let mut platform = GuestPlatform::new(self, vcpu.subid, &snapshot);
        let mut bus = GuestPortBus {
            guest: self,
            vcpu: vcpu.subid,
        };
        match state.emulate_port_io(io, &mut bus, &mut platform) {
            Ok(()) => {
                self.hal().memory_barrier();
                Ok(TrapOutcome::Resume)
            }
            Err(e) => {
                let error = Error::from(e);
                if !matches!(
                    error.kind(),
                    ErrorKind::BadGuestAccess | ErrorKind::Alignment | ErrorKind::DecodeFailure
                ) {
                    return Err(error);
                }
                warn!("{}: port {:#x}: {}", vcpu.name, io.port, error);
                state.inject_sync_exception(GuestException::DataAbort {
                    va: u64::from(io.port),
                    ipa: u64::from(io.port),
                    write: io.write,
                    kind: AbortKind::External,
                });
                Ok(TrapOutcome::Resume)
            }
        }
    }
}

/// Guest memory as seen by the instruction emulators: virtual addresses
/// are translated with the register state at the time of the trap, RAM is
/// accessed directly and VIRTUAL regions go to their emulator.
struct GuestPlatform<'a> {
    guest: &'a Guest,
    vcpu: usize,
    state: &'a ArchVcpu,
    endianness: Endianness,
}

enum Target {
    Ram(u64),
    Emulated(Arc<Mutex<dyn Emulator>>, u64),
}

impl<'a> GuestPlatform<'a> {
    fn new(guest: &'a Guest, vcpu: usize, state: &'a ArchVcpu) -> Self {
        GuestPlatform {
            guest,
            vcpu,
            state,
            endianness: state.endianness(),
        }
    }

    fn target(&self, gva: u64, access: AccessKind) -> std::result::Result<Target, PlatformError> {
        let ipa = self
            .guest
            .hal()
            .translate_guest_va(self.state, gva, access)
            .map_err(|_| PlatformError::BadGuestAccess(gva))?;
        let (region, target) = self
            .guest
            .memory()
            .aspace()
            .resolve(AddressKind::Memory, ipa)
            .map_err(|_| PlatformError::BadGuestAccess(ipa))?;

        if region.flags.contains(RegionFlags::VIRTUAL) && access != AccessKind::Execute {
            let emulator = region
                .emulator
                .and_then(|id| self.guest.devices().get(id))
                .ok_or(PlatformError::BadGuestAccess(ipa))?;
            return Ok(Target::Emulated(emulator, target - region.gpa));
        }
        if !region.is_ram()
            || (access == AccessKind::Write && region.flags.contains(RegionFlags::READONLY))
        {
            return Err(PlatformError::BadGuestAccess(ipa));
        }
        Ok(Target::Ram(ipa))
    }

    fn ram_read(&self, ipa: u64, width: AccessWidth) -> std::result::Result<u64, PlatformError> {
        let n = width.bytes();
        let mut buf = [0u8; 8];
        self.guest
            .memory()
            .guest_read(ipa, &mut buf[..n])
            .map_err(|_| PlatformError::BadGuestAccess(ipa))?;
        Ok(match self.endianness {
            Endianness::Little => u64::from_le_bytes(buf),
            Endianness::Big => u64::from_be_bytes(buf) >> (8 * (8 - n)),
        })
    }

    fn ram_write(
        &self,
        ipa: u64,
        width: AccessWidth,
        value: u64,
    ) -> std::result::Result<(), PlatformError> {
        let n = width.bytes();
        let bytes = match self.endianness {
            Endianness::Little => value.to_le_bytes(),
            Endianness::Big => (value << (8 * (8 - n))).to_be_bytes(),
        };
        self.guest
            .memory()
            .guest_write(ipa, &bytes[..n])
            .map_err(|_| PlatformError::BadGuestAccess(ipa))
    }
}

impl PlatformEmulator for GuestPlatform<'_> {
    fn read_memory(
        &mut self,
        gva: u64,
        width: AccessWidth,
    ) -> std::result::Result<u64, PlatformError> {
        match self.target(gva, AccessKind::Read)? {
            Target::Ram(ipa) => self.ram_read(ipa, width),
            Target::Emulated(emulator, offset) => {
                if !width.is_aligned(offset) {
                    return Err(PlatformError::Alignment(gva));
                }
                dispatch_read(&emulator, self.vcpu, offset, width, self.endianness)
                    .map_err(|e| emulator_error(gva, e))
            }
        }
    }

    fn write_memory(
        &mut self,
        gva: u64,
        width: AccessWidth,
        value: u64,
    ) -> std::result::Result<(), PlatformError> {
        match self.target(gva, AccessKind::Write)? {
            Target::Ram(ipa) => self.ram_write(ipa, width, value),
            Target::Emulated(emulator, offset) => {
                if !width.is_aligned(offset) {
                    return Err(PlatformError::Alignment(gva));
                }
                dispatch_write(&emulator, self.vcpu, offset, width, value, self.endianness)
                    .map_err(|e| emulator_error(gva, e))
            }
        }
    }

    fn swap_memory(
        &mut self,
        gva: u64,
        width: AccessWidth,
        value: u64,
    ) -> std::result::Result<u64, PlatformError> {
        match self.target(gva, AccessKind::Write)? {
            Target::Ram(ipa) => {
                let _swap = self.guest.swap_lock().lock().unwrap();
                let old = self.ram_read(ipa, width)?;
                self.ram_write(ipa, width, value)?;
                Ok(old)
            }
            Target::Emulated(emulator, offset) => {
                // One lock hold for both halves.
                let mut emulator = emulator.lock().unwrap();
                if !emulator.supports_width(width) {
                    return Err(PlatformError::BadGuestAccess(gva));
                }
                let device = emulator.endianness();
                let old = emulator
                    .read(self.vcpu, offset, width)
                    .map_err(|e| emulator_error(gva, e))?;
                emulator
                    .write(
                        self.vcpu,
                        offset,
                        width,
                        self.endianness.convert(device, width, value),
                    )
                    .map_err(|e| emulator_error(gva, e))?;
                Ok(device.convert(self.endianness, width, old))
            }
        }
    }

    fn fetch(
        &mut self,
        ip: u64,
        instruction_bytes: &mut [u8],
    ) -> std::result::Result<(), PlatformError> {
        match self.target(ip, AccessKind::Execute)? {
            Target::Ram(ipa) => self
                .guest
                .memory()
                .guest_read(ipa, instruction_bytes)
                .map_err(|_| PlatformError::BadGuestAccess(ip)),
            Target::Emulated(..) => Err(PlatformError::BadGuestAccess(ip)),
        }
    }
}

/// The guest's I/O port space. Ports nobody decodes read as all ones and
/// ignore writes.
struct GuestPortBus<'a> {
    guest: &'a Guest,
    vcpu: usize,
}

impl GuestPortBus<'_> {
    fn emulator(&self, port: u16) -> Option<(Arc<Mutex<dyn Emulator>>, u64)> {
        let (region, target) = self
            .guest
            .memory()
            .aspace()
            .resolve(AddressKind::Io, u64::from(port))
            .ok()?;
        let emulator = region.emulator.and_then(|id| self.guest.devices().get(id))?;
        Some((emulator, target - region.gpa))
    }
}

impl PortIoBus for GuestPortBus<'_> {
    fn pio_read(&mut self, port: u16, width: AccessWidth) -> EmulationResult<u64> {
        match self.emulator(port) {
            Some((emulator, offset)) => {
                dispatch_read(&emulator, self.vcpu, offset, width, Endianness::Little)
                    .map_err(|e| port_error(port, e))
            }
            None => {
                trace!("{}: read of unclaimed port {:#x}", self.guest.name, port);
                Ok(width.mask())
            }
        }
    }

    fn pio_write(&mut self, port: u16, width: AccessWidth, value: u64) -> EmulationResult<()> {
        match self.emulator(port) {
            Some((emulator, offset)) => {
                dispatch_write(&emulator, self.vcpu, offset, width, value, Endianness::Little)
                    .map_err(|e| port_error(port, e))
            }
            None => {
                trace!("{}: write to unclaimed port {:#x}", self.guest.name, port);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_counts_failures_inside_the_window() {
        let throttle = FaultThrottle::new(2, 1_000);
        assert!(!throttle.record(0));
        assert!(!throttle.record(100));
        assert!(throttle.record(200));
        // The first two failures have left the window.
        assert!(!throttle.record(1_150));
        throttle.reset();
        assert!(!throttle.record(1_200));
    }
}
