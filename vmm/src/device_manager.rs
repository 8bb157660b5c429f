// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

//! Per guest emulator arena.
//!
//! Emulator instances are owned by their guest and addressed by
//! [`EmulatorId`]; regions only keep the id.

use std::sync::{Arc, Mutex, RwLock};

use vm_device::{Emulator, EmulatorId, EmulatorRegistry, ProbeContext};

use crate::error::{Error, Result};

struct EmulatorSlot {
    name: String,
    kind: &'static str,
    emulator: Arc<Mutex<dyn Emulator>>,
}

pub struct DeviceManager {
    guest: String,
    slots: RwLock<Vec<Option<EmulatorSlot>>>,
}

impl DeviceManager {
    pub fn new(guest: &str) -> Self {
        DeviceManager {
            guest: guest.to_string(),
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Instantiate the emulator kind matching the node's compatible list.
    pub fn probe(&self, registry: &EmulatorRegistry, ctx: &ProbeContext) -> Result<EmulatorId> {
        let kind = registry.find_compatible(&ctx.node.compatible).ok_or_else(|| {
            Error::NotFound(format!(
                "emulator for {}/{} ({})",
                self.guest,
                ctx.node.name,
                ctx.node.compatible.join(", ")
            ))
        })?;
        let emulator = (kind.probe)(ctx)?;
        debug!(
            "{}: {} probed as {} at {:#x}",
            self.guest, ctx.node.name, kind.name, ctx.base
        );
        Ok(self.insert(&ctx.node.name, kind.name, emulator))
    }

    pub fn insert(
        &self,
        name: &str,
        kind: &'static str,
        emulator: Arc<Mutex<dyn Emulator>>,
    ) -> EmulatorId {
        let mut slots = self.slots.write().unwrap();
        let slot = Some(EmulatorSlot {
            name: name.to_string(),
            kind,
            emulator,
        });
        match slots.iter().position(Option::is_none) {
            Some(free) => {
                slots[free] = slot;
                EmulatorId(free)
            }
            None => {
                slots.push(slot);
                EmulatorId(slots.len() - 1)
            }
        }
    }

    pub fn get(&self, id: EmulatorId) -> Option<Arc<Mutex<dyn Emulator>>> {
        self.slots
            .read()
            .unwrap()
            .get(id.0)
            .and_then(Option::as_ref)
            .map(|s| s.emulator.clone())
    }

    pub fn name(&self, id: EmulatorId) -> Option<String> {
        self.slots
            .read()
            .unwrap()
            .get(id.0)
            .and_then(Option::as_ref)
            .map(|s| format!("{} ({})", s.name, s.kind))
    }

    pub fn remove(&self, id: EmulatorId) -> Result<()> {
        let slot = self
            .slots
            .write()
            .unwrap()
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| Error::NotFound(format!("emulator {}", id.0)))?;
        slot.emulator.lock().unwrap().remove();
        Ok(())
    }

    /// Reset every instance; the first failure is returned after all ran.
    pub fn reset_all(&self) -> Result<()> {
        let emulators: Vec<(String, Arc<Mutex<dyn Emulator>>)> = self
            .slots
            .read()
            .unwrap()
            .iter()
            .flatten()
            .map(|s| (s.name.clone(), s.emulator.clone()))
            .collect();
        let mut first = None;
        for (name, emulator) in emulators {
            if let Err(e) = emulator.lock().unwrap().reset() {
                warn!("{}: cannot reset {}: {}", self.guest, name, e);
                first.get_or_insert(Error::from(e));
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Remove every instance, newest first.
    pub fn teardown(&self) {
        let ids: Vec<EmulatorId> = {
            let slots = self.slots.read().unwrap();
            (0..slots.len())
                .rev()
                .filter(|&i| slots[i].is_some())
                .map(EmulatorId)
                .collect()
        };
        for id in ids {
            let _ = self.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypervisor::AccessWidth;

    struct Probe {
        tag: u64,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Emulator for Probe {
        fn read(
            &mut self,
            _vcpu: usize,
            _offset: u64,
            _width: AccessWidth,
        ) -> vm_device::Result<u64> {
            Ok(self.tag)
        }

        fn write(
            &mut self,
            _vcpu: usize,
            _offset: u64,
            _width: AccessWidth,
            value: u64,
        ) -> vm_device::Result<()> {
            self.tag = value;
            Ok(())
        }

        fn reset(&mut self) -> vm_device::Result<()> {
            self.log.lock().unwrap().push(format!("reset {}", self.tag));
            self.tag = 0;
            Ok(())
        }

        fn remove(&mut self) {
            self.log.lock().unwrap().push(format!("remove {}", self.tag));
        }
    }

    fn probe(tag: u64, log: &Arc<Mutex<Vec<String>>>) -> Arc<Mutex<dyn Emulator>> {
        Arc::new(Mutex::new(Probe {
            tag,
            log: log.clone(),
        }))
    }

    #[test]
    fn slots_are_reused_and_torn_down_newest_first() {
        let dm = DeviceManager::new("g0");
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = dm.insert("a", "probe", probe(1, &log));
        let b = dm.insert("b", "probe", probe(2, &log));
        assert_eq!((a, b), (EmulatorId(0), EmulatorId(1)));
        assert_eq!(dm.name(b).as_deref(), Some("b (probe)"));

        dm.remove(a).unwrap();
        assert!(dm.get(a).is_none());
        assert!(dm.remove(a).is_err());
        assert_eq!(dm.insert("c", "probe", probe(3, &log)), EmulatorId(0));

        dm.teardown();
        assert!(dm.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["remove 1", "remove 2", "remove 3"]);
    }

    #[test]
    fn reset_reaches_every_instance() {
        let dm = DeviceManager::new("g0");
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = dm.insert("a", "probe", probe(7, &log));
        dm.insert("b", "probe", probe(8, &log));
        dm.reset_all().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["reset 7", "reset 8"]);
        let emulator = dm.get(a).unwrap();
        assert_eq!(emulator.lock().unwrap().read(0, 0, AccessWidth::Word).unwrap(), 0);
    }
}
