// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use hypervisor::Hal;
use vm_allocator::IomemMapper;
use vm_device::device_tree::DeviceNode;
use vm_device::{EmulatorRegistry, SharedWriter};

pub mod config;
mod cpu;
pub mod device_manager;
mod dispatch;
pub mod error;
pub mod interrupt;
pub mod memory_manager;
pub mod scheduler;
pub mod stage2;
pub mod timer;
pub mod vm;

pub use crate::config::{GuestConfig, RegionConfig, VcpuConfig, VmmConfig};
pub use crate::cpu::{OrphanStep, Vcpu, VcpuState, VcpuStats};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::interrupt::{HostIrqChip, HostIrqFabric, IrqReturn, IrqType, RoutedState};
pub use crate::memory_manager::{HostRam, RegionFlags, RegionInfo};
pub use crate::scheduler::Scheduler;
pub use crate::vm::{Guest, GuestInfo};

use crate::cpu::HostCpuLoop;
use crate::vm::GuestResources;

/// The hypervisor: host CPUs, the scheduler, the host IRQ fabric and the
/// set of guests.
pub struct Vmm {
    config: VmmConfig,
    hal: Arc<dyn Hal>,
    scheduler: Arc<Scheduler>,
    fabric: Arc<HostIrqFabric>,
    registry: EmulatorRegistry,
    host: Arc<HostRam>,
    iomem: Arc<IomemMapper>,
    console: Option<SharedWriter>,
    guests: RwLock<BTreeMap<String, Arc<Guest>>>,
    next_guest_id: AtomicU64,
    irq_senders: Vec<flume::Sender<u32>>,
    irq_receivers: Mutex<Vec<Option<flume::Receiver<u32>>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Vmm {
    pub fn new(config: VmmConfig, hal: Arc<dyn Hal>) -> Result<Self> {
        Self::with_console(config, hal, None)
    }

    /// `console` receives the output of the emulated UARTs and consoles.
    pub fn with_console(
        config: VmmConfig,
        hal: Arc<dyn Hal>,
        console: Option<SharedWriter>,
    ) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::new(hal.clone(), &config)?;
        let cpus = scheduler.cpu_count();
        let host = Arc::new(HostRam::new(config.host_ram_base, config.host_ram_size)?);
        let iomem = IomemMapper::new(
            config.iomem_va_base,
            config.iomem_va_size,
            config::PAGE_SIZE,
        )
        .ok_or_else(|| Error::Invalid("empty IOMEM window".to_string()))?;

        let registry = EmulatorRegistry::new();
        for kind in devices::emulator_kinds()
            .into_iter()
            .chain(virtio_devices::emulator_kinds())
        {
            registry.register(kind)?;
        }

        let (irq_senders, irq_receivers): (Vec<_>, Vec<_>) =
            (0..cpus).map(|_| flume::unbounded()).map(|(s, r)| (s, Some(r))).unzip();

        info!(
            "{:?} hypervisor with {} host CPUs, {} MiB host RAM, emulators: {}",
            config.arch,
            cpus,
            config.host_ram_size >> 20,
            registry.names().join(" ")
        );
        Ok(Vmm {
            config,
            hal,
            fabric: HostIrqFabric::new(cpus),
            scheduler,
            registry,
            host,
            iomem: Arc::new(iomem),
            console,
            guests: RwLock::new(BTreeMap::new()),
            next_guest_id: AtomicU64::new(0),
            irq_senders,
            irq_receivers: Mutex::new(irq_receivers),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &VmmConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn fabric(&self) -> &Arc<HostIrqFabric> {
        &self.fabric
    }

    pub fn registry(&self) -> &EmulatorRegistry {
        &self.registry
    }

    pub fn host_ram(&self) -> &Arc<HostRam> {
        &self.host
    }

    /// Bring up one run loop thread per host CPU.
    pub fn start(&self) -> Result<()> {
        let mut threads = self.threads.lock().unwrap();
        if !threads.is_empty() {
            return Err(Error::Invalid("host CPUs already running".to_string()));
        }
        let mut receivers = self.irq_receivers.lock().unwrap();
        for (cpu, slot) in receivers.iter_mut().enumerate() {
            let Some(irqs) = slot.take() else {
                return Err(Error::Invalid("host CPUs cannot be restarted".to_string()));
            };
            let run_loop = HostCpuLoop {
                cpu,
                hal: self.hal.clone(),
                scheduler: self.scheduler.clone(),
                fabric: self.fabric.clone(),
                irqs,
            };
            let thread = thread::Builder::new()
                .name(format!("hcpu{}", cpu))
                .spawn(move || run_loop.run())
                .map_err(Error::Io)?;
            threads.push(thread);
        }
        Ok(())
    }

    /// Stop the run loops and wait for their threads.
    pub fn shutdown(&self) {
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        if threads.is_empty() {
            return;
        }
        self.scheduler.stop();
        for thread in threads {
            if thread.join().is_err() {
                error!("host CPU thread panicked");
            }
        }
        info!("hypervisor stopped");
    }

    /// Deliver host IRQ `hirq` on host CPU `cpu`, as the host interrupt
    /// controller driver would.
    pub fn raise_host_irq(&self, hirq: u32, cpu: usize) -> Result<()> {
        let sender = self
            .irq_senders
            .get(cpu)
            .ok_or_else(|| Error::Invalid(format!("host CPU {}", cpu)))?;
        sender
            .send(hirq)
            .map_err(|_| Error::Invalid(format!("host CPU {} is offline", cpu)))?;
        self.hal.send_ipi(cpu);
        Ok(())
    }

    pub fn guest_create(&self, node: &DeviceNode) -> Result<Arc<Guest>> {
        let config = GuestConfig::from_node(node)?;
        let mut guests = self.guests.write().unwrap();
        if guests.contains_key(&config.name) {
            return Err(Error::AlreadyExists(format!("guest {}", config.name)));
        }
        let resources = GuestResources {
            id: self.next_guest_id.fetch_add(1, Ordering::SeqCst),
            arch: self.config.arch,
            hal: self.hal.clone(),
            scheduler: self.scheduler.clone(),
            fabric: self.fabric.clone(),
            registry: &self.registry,
            host: self.host.clone(),
            iomem: self.iomem.clone(),
            console: self.console.clone(),
            decode_failure_limit: self.config.decode_failure_limit,
            decode_failure_window: self.config.decode_failure_window,
        };
        let guest = Guest::create(config, resources)?;
        guests.insert(guest.name.clone(), guest.clone());
        Ok(guest)
    }

    /// Create every guest listed under `/guests`, stopping at the first
    /// failure.
    pub fn guests_create(&self, tree: &DeviceNode) -> Result<Vec<Arc<Guest>>> {
        config::guest_nodes(tree)
            .into_iter()
            .map(|node| self.guest_create(node))
            .collect()
    }

    pub fn guest(&self, name: &str) -> Result<Arc<Guest>> {
        self.guests
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("guest {}", name)))
    }

    pub fn guest_destroy(&self, name: &str) -> Result<()> {
        let mut guests = self.guests.write().unwrap();
        let guest = guests
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("guest {}", name)))?;
        guest.destroy()?;
        guests.remove(name);
        Ok(())
    }

    pub fn guest_reset(&self, name: &str) -> Result<()> {
        self.guest(name)?.reset()
    }

    pub fn guest_kick(&self, name: &str) -> Result<()> {
        self.guest(name)?.kick()
    }

    pub fn guest_pause(&self, name: &str) -> Result<()> {
        self.guest(name)?.pause()
    }

    pub fn guest_resume(&self, name: &str) -> Result<()> {
        self.guest(name)?.resume()
    }

    pub fn guest_halt(&self, name: &str) -> Result<()> {
        self.guest(name)?.halt()
    }

    pub fn vcpu_dumpreg(&self, guest: &str, vcpu: &str) -> Result<String> {
        self.guest(guest)?.vcpu_dumpreg(vcpu)
    }

    pub fn vcpu_stats(&self, guest: &str) -> Result<Vec<VcpuStats>> {
        Ok(self.guest(guest)?.vcpu_stats())
    }

    pub fn region_list(&self, guest: &str) -> Result<Vec<RegionInfo>> {
        Ok(self.guest(guest)?.region_list())
    }

    pub fn guest_list(&self) -> Vec<GuestInfo> {
        self.guests
            .read()
            .unwrap()
            .values()
            .map(|g| g.info())
            .collect()
    }
}

impl Drop for Vmm {
    fn drop(&mut self) {
        self.shutdown();
    }
}
