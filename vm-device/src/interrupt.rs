// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Virtual interrupt routing.
//!
//! Device emulators drive [`IrqLine`]s. The per-guest [`IrqRouter`] hands
//! line changes to the vIRQ chip named by the line's interrupt parent, and
//! the chip decides which VCPU input to drive through a [`VcpuIrqSink`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use hypervisor::{SysRegId, VirqKind};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IrqError {
    #[error("No interrupt controller {0:?}")]
    NoChip(Option<String>),
    #[error("Interrupt controller {0} already registered")]
    DuplicateChip(String),
    #[error("Invalid interrupt line {0}")]
    InvalidLine(u32),
    #[error("Invalid target VCPU {0}")]
    InvalidCpu(usize),
}

/// A virtual interrupt controller as seen by the devices wired to it.
pub trait IrqChip: Send + Sync {
    /// The output of the device wired to `line` changed to `level`.
    fn handle(&self, line: u32, cpu_hint: Option<usize>, level: bool) -> Result<(), IrqError>;

    /// Change of a banked per-CPU line (PPI, local timer) of VCPU `cpu`.
    fn handle_percpu(&self, line: u32, cpu: usize, level: bool) -> Result<(), IrqError> {
        self.handle(line, Some(cpu), level)
    }

    /// Interrupt acknowledge cycle on behalf of VCPU `cpu`: returns the
    /// vector now in service, if any.
    fn acknowledge(&self, _cpu: usize) -> Option<u32> {
        None
    }

    /// CPU interface register reached through a system register trap.
    /// `None` when the chip does not implement `id`.
    fn read_cpu_reg(&self, _cpu: usize, _id: SysRegId) -> Option<u64> {
        None
    }

    /// Returns whether the chip implements `id`.
    fn write_cpu_reg(&self, _cpu: usize, _id: SysRegId, _value: u64) -> bool {
        false
    }

    /// `child` is cascaded into input `line` of this chip.
    fn attach_cascade(&self, _line: u32, _child: Arc<dyn IrqChip>) {}
}

/// Where vIRQ chips deliver their outputs.
pub trait VcpuIrqSink: Send + Sync {
    fn vcpu_count(&self) -> usize;

    /// Drive the `kind` input of guest VCPU `vcpu` on behalf of `line`.
    ///
    /// The input stays asserted while at least one line holds it. A rising
    /// edge wakes the VCPU if it waits for an interrupt.
    fn set_virq(&self, vcpu: usize, line: u32, kind: VirqKind, level: bool);

    /// The guest signalled end of interrupt for `line`.
    fn virq_eoi(&self, _line: u32) {}
}

type EoiListener = Arc<dyn Fn(u32) + Send + Sync>;

struct RoutedChip {
    name: String,
    chip: Arc<dyn IrqChip>,
}

/// Per-guest line-to-chip router.
#[derive(Default)]
pub struct IrqRouter {
    chips: RwLock<Vec<RoutedChip>>,
    eoi_listeners: Mutex<HashMap<u32, Vec<EoiListener>>>,
}

impl IrqRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first chip registered is the default interrupt parent.
    pub fn register_chip(&self, name: &str, chip: Arc<dyn IrqChip>) -> Result<(), IrqError> {
        let mut chips = self.chips.write().unwrap();
        if chips.iter().any(|c| c.name == name) {
            return Err(IrqError::DuplicateChip(name.to_string()));
        }
        debug!("vIRQ chip {} registered", name);
        chips.push(RoutedChip {
            name: name.to_string(),
            chip,
        });
        Ok(())
    }

    pub fn unregister_chip(&self, name: &str) {
        self.chips.write().unwrap().retain(|c| c.name != name);
    }

    pub fn chip(&self, parent: Option<&str>) -> Option<Arc<dyn IrqChip>> {
        let chips = self.chips.read().unwrap();
        match parent {
            Some(name) => chips.iter().find(|c| c.name == name),
            None => chips.first(),
        }
        .map(|c| c.chip.clone())
    }

    pub fn chip_names(&self) -> Vec<String> {
        self.chips
            .read()
            .unwrap()
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn handle(
        &self,
        parent: Option<&str>,
        line: u32,
        cpu_hint: Option<usize>,
        level: bool,
    ) -> Result<(), IrqError> {
        let chip = self
            .chip(parent)
            .ok_or_else(|| IrqError::NoChip(parent.map(str::to_string)))?;
        chip.handle(line, cpu_hint, level)
    }

    pub fn handle_percpu(
        &self,
        parent: Option<&str>,
        line: u32,
        cpu: usize,
        level: bool,
    ) -> Result<(), IrqError> {
        let chip = self
            .chip(parent)
            .ok_or_else(|| IrqError::NoChip(parent.map(str::to_string)))?;
        chip.handle_percpu(line, cpu, level)
    }

    /// Run `listener` every time the guest EOIs `line`.
    pub fn add_eoi_listener(&self, line: u32, listener: EoiListener) {
        self.eoi_listeners
            .lock()
            .unwrap()
            .entry(line)
            .or_default()
            .push(listener);
    }

    pub fn clear_eoi_listeners(&self, line: u32) {
        self.eoi_listeners.lock().unwrap().remove(&line);
    }

    pub fn notify_eoi(&self, line: u32) {
        let listeners = self
            .eoi_listeners
            .lock()
            .unwrap()
            .get(&line)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener(line);
        }
    }
}

/// Output line of a device emulator.
#[derive(Clone)]
pub struct IrqLine {
    router: Arc<IrqRouter>,
    parent: Option<String>,
    line: u32,
}

impl IrqLine {
    pub fn new(router: Arc<IrqRouter>, parent: Option<String>, line: u32) -> Self {
        IrqLine {
            router,
            parent,
            line,
        }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn set_level(&self, level: bool) -> Result<(), IrqError> {
        self.router
            .handle(self.parent.as_deref(), self.line, None, level)
    }

    pub fn assert(&self) -> Result<(), IrqError> {
        self.set_level(true)
    }

    pub fn deassert(&self) -> Result<(), IrqError> {
        self.set_level(false)
    }

    /// Edge: assert then deassert.
    pub fn pulse(&self) -> Result<(), IrqError> {
        self.set_level(true)?;
        self.set_level(false)
    }

    pub fn set_percpu_level(&self, cpu: usize, level: bool) -> Result<(), IrqError> {
        self.router
            .handle_percpu(self.parent.as_deref(), self.line, cpu, level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(u32, Option<usize>, bool)>>);

    impl IrqChip for Recorder {
        fn handle(&self, line: u32, cpu_hint: Option<usize>, level: bool) -> Result<(), IrqError> {
            if line > 100 {
                return Err(IrqError::InvalidLine(line));
            }
            self.0.lock().unwrap().push((line, cpu_hint, level));
            Ok(())
        }
    }

    #[test]
    fn lines_reach_named_parent() {
        let router = Arc::new(IrqRouter::new());
        let gic = Arc::new(Recorder::default());
        let pic = Arc::new(Recorder::default());
        router.register_chip("gic", gic.clone()).unwrap();
        router.register_chip("pic", pic.clone()).unwrap();
        assert_eq!(
            router.register_chip("gic", gic.clone()),
            Err(IrqError::DuplicateChip("gic".to_string()))
        );

        IrqLine::new(router.clone(), None, 33).pulse().unwrap();
        IrqLine::new(router.clone(), Some("pic".to_string()), 4)
            .set_percpu_level(1, true)
            .unwrap();

        assert_eq!(
            *gic.0.lock().unwrap(),
            vec![(33, None, true), (33, None, false)]
        );
        assert_eq!(*pic.0.lock().unwrap(), vec![(4, Some(1), true)]);
        assert_eq!(
            IrqLine::new(router.clone(), Some("nope".to_string()), 1).assert(),
            Err(IrqError::NoChip(Some("nope".to_string())))
        );
        assert_eq!(
            IrqLine::new(router, None, 101).assert(),
            Err(IrqError::InvalidLine(101))
        );
    }

    #[test]
    fn eoi_listeners() {
        let router = IrqRouter::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        router.add_eoi_listener(40, Arc::new(move |line| {
            h.fetch_add(line, Ordering::SeqCst);
        }));
        router.notify_eoi(40);
        router.notify_eoi(41);
        assert_eq!(hits.load(Ordering::SeqCst), 40);
        router.clear_eoi_listeners(40);
        router.notify_eoi(40);
        assert_eq!(hits.load(Ordering::SeqCst), 40);
    }
}
