// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Emulator registry.
//!
//! Emulator kinds are registered once with a name and the compatible
//! strings they implement; instances are probed from configuration nodes.

use std::sync::{Arc, Mutex, RwLock};

use hypervisor::Endianness;
use thiserror::Error;

use crate::device_tree::DeviceNode;
use crate::emulator::{Emulator, EmulatorError, Result, SharedWriter};
use crate::interrupt::{IrqLine, IrqRouter, VcpuIrqSink};
use crate::memory::GuestMemoryAccess;
use crate::timer::GuestTimerService;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Emulator {0} already registered")]
    Exists(String),
    #[error("No emulator named {0}")]
    NotFound(String),
}

/// What an emulator probe gets to know about its instance.
pub struct ProbeContext<'a> {
    pub guest: &'a str,
    pub node: &'a DeviceNode,
    /// Start of the region the instance serves.
    pub base: u64,
    pub size: u64,
    pub endianness: Endianness,
    pub router: Arc<IrqRouter>,
    /// Resolved `interrupt-parent` of the node.
    pub irq_parent: Option<String>,
    pub memory: Arc<dyn GuestMemoryAccess>,
    pub sink: Arc<dyn VcpuIrqSink>,
    pub timers: Arc<dyn GuestTimerService>,
    pub console: Option<SharedWriter>,
}

impl ProbeContext<'_> {
    /// Lines listed in the node's `interrupts` attribute.
    pub fn irq_lines(&self) -> Vec<IrqLine> {
        self.node
            .attr_u32_list("interrupts")
            .unwrap_or_default()
            .into_iter()
            .map(|line| IrqLine::new(self.router.clone(), self.irq_parent.clone(), line))
            .collect()
    }

    pub fn irq_line(&self, index: usize) -> Result<IrqLine> {
        self.irq_lines().into_iter().nth(index).ok_or_else(|| {
            EmulatorError::InvalidConfig(format!("{}: interrupts[{}]", self.node.name, index))
        })
    }

    pub fn vcpu_count(&self) -> usize {
        self.sink.vcpu_count()
    }
}

pub type ProbeFn = fn(&ProbeContext) -> Result<Arc<Mutex<dyn Emulator>>>;

#[derive(Clone, Copy)]
pub struct EmulatorKind {
    pub name: &'static str,
    pub compatible: &'static [&'static str],
    pub probe: ProbeFn,
}

#[derive(Default)]
pub struct EmulatorRegistry {
    kinds: RwLock<Vec<EmulatorKind>>,
}

impl EmulatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: EmulatorKind) -> std::result::Result<(), RegistryError> {
        let mut kinds = self.kinds.write().unwrap();
        if kinds.iter().any(|k| k.name == kind.name) {
            return Err(RegistryError::Exists(kind.name.to_string()));
        }
        debug!("emulator {} registered", kind.name);
        kinds.push(kind);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> std::result::Result<(), RegistryError> {
        let mut kinds = self.kinds.write().unwrap();
        let before = kinds.len();
        kinds.retain(|k| k.name != name);
        if kinds.len() == before {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<EmulatorKind> {
        self.kinds
            .read()
            .unwrap()
            .iter()
            .find(|k| k.name == name)
            .copied()
    }

    /// First kind implementing one of `compatible`, in the node's order of
    /// preference.
    pub fn find_compatible(&self, compatible: &[String]) -> Option<EmulatorKind> {
        let kinds = self.kinds.read().unwrap();
        compatible.iter().find_map(|c| {
            kinds
                .iter()
                .find(|k| k.compatible.iter().any(|kc| kc == c))
                .copied()
        })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.kinds.read().unwrap().iter().map(|k| k.name).collect()
    }
}
