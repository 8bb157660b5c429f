// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guests.
//!
//! A guest owns its VCPUs, its address space with the stage-2 table, the
//! arena of its emulators, its vIRQ router and its timer service. It is
//! built from a [`GuestConfig`] and torn down in reverse order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hypervisor::{Arch, ArchVcpu, CpuMask, Endianness, Hal, VirqKind};
use serde::Serialize;
use vm_allocator::IomemMapper;
use vm_device::{
    EmulatorId, EmulatorRegistry, GuestMemoryAccess, GuestTimerService, IrqRouter, ProbeContext,
    SharedWriter, VcpuIrqSink,
};

use crate::config::{GuestConfig, RegionConfig};
use crate::cpu::{VirqState, Vcpu, VcpuKind, VcpuParams, VcpuState, VcpuStats};
use crate::device_manager::DeviceManager;
use crate::dispatch::FaultThrottle;
use crate::error::{Error, Result};
use crate::interrupt::HostIrqFabric;
use crate::memory_manager::{HostRam, MemoryManager, RegionFlags, RegionInfo};
use crate::scheduler::Scheduler;
use crate::stage2::Stage2Table;
use crate::timer::GuestTimers;

/// Emulator kinds that act as interrupt parents; they are probed first.
const IRQ_CHIP_KINDS: &[&str] = &["gic-v2", "gic-v3", "i8259", "lapic", "plic"];

/// Drives the vIRQ inputs of the guest's VCPUs.
struct GuestIrqSink {
    vcpus: Vec<Arc<Vcpu>>,
    scheduler: Arc<Scheduler>,
}

impl VcpuIrqSink for GuestIrqSink {
    fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    fn set_virq(&self, vcpu: usize, line: u32, kind: VirqKind, level: bool) {
        let Some(target) = self.vcpus.get(vcpu) else {
            warn!("vIRQ {} for missing VCPU {}", line, vcpu);
            return;
        };
        let Some(virq) = target.virq() else {
            return;
        };
        // The input is updated before the wakeup so a concurrent park sees it.
        if virq.set(line, kind, level) {
            self.scheduler.virq_notify(target);
        }
    }
}

/// What a guest borrows from the hypervisor.
pub(crate) struct GuestResources<'a> {
    pub id: u64,
    pub arch: Arch,
    pub hal: Arc<dyn Hal>,
    pub scheduler: Arc<Scheduler>,
    pub fabric: Arc<HostIrqFabric>,
    pub registry: &'a EmulatorRegistry,
    pub host: Arc<HostRam>,
    pub iomem: Arc<IomemMapper>,
    pub console: Option<SharedWriter>,
    pub decode_failure_limit: usize,
    pub decode_failure_window: Duration,
}

/// One line of `guest_list`.
#[derive(Clone, Debug, Serialize)]
pub struct GuestInfo {
    pub id: u64,
    pub name: String,
    pub vcpus: Vec<(String, VcpuState)>,
    pub regions: usize,
    pub emulators: usize,
    pub paused_for: Option<String>,
}

pub struct Guest {
    pub id: u64,
    pub name: String,
    endianness: Endianness,
    hal: Arc<dyn Hal>,
    scheduler: Arc<Scheduler>,
    fabric: Arc<HostIrqFabric>,
    vcpus: Vec<Arc<Vcpu>>,
    memory: MemoryManager,
    devices: DeviceManager,
    router: Arc<IrqRouter>,
    sink: Arc<GuestIrqSink>,
    timers: Arc<GuestTimers>,
    throttle: FaultThrottle,
    swap_lock: Mutex<()>,
    paused_for: Mutex<Option<String>>,
    config: GuestConfig,
}

fn create_vcpus(
    config: &GuestConfig,
    arch: Arch,
    scheduler: &Scheduler,
) -> Result<Vec<Arc<Vcpu>>> {
    let mut vcpus = Vec::with_capacity(config.vcpus.len());
    for (subid, vc) in config.vcpus.iter().enumerate() {
        let params = VcpuParams {
            name: format!("{}/{}", config.name, vc.name),
            subid,
            priority: vc.priority,
            time_slice_ns: vc.time_slice_ns,
            affinity: vc.affinity.unwrap_or_else(|| scheduler.all_cpus()),
        };
        let kind = VcpuKind::Normal {
            arch: Mutex::new(ArchVcpu::new(arch, subid, vc.start_pc)),
            start_pc: vc.start_pc,
            virq: VirqState::default(),
            guest: Default::default(),
        };
        match scheduler.vcpu_create(params, kind) {
            Ok(vcpu) => vcpus.push(vcpu),
            Err(e) => {
                for vcpu in vcpus.iter().rev() {
                    let _ = scheduler.vcpu_destroy(vcpu);
                }
                return Err(e);
            }
        }
    }
    Ok(vcpus)
}

fn is_irq_chip(registry: &EmulatorRegistry, region: &RegionConfig) -> bool {
    region.node.attr("interrupt-controller").is_some()
        || registry
            .find_compatible(&region.node.compatible)
            .is_some_and(|k| IRQ_CHIP_KINDS.contains(&k.name))
}

impl Guest {
    pub(crate) fn create(config: GuestConfig, res: GuestResources) -> Result<Arc<Guest>> {
        let vcpus = create_vcpus(&config, res.arch, &res.scheduler)?;

        let mut cpus = CpuMask::empty();
        for vcpu in &vcpus {
            for cpu in vcpu.affinity().iter() {
                cpus.set(cpu);
            }
        }
        let stage2 = match Stage2Table::new(res.id as u32 + 1, res.host.clone(), res.hal.clone(), cpus)
        {
            Ok(stage2) => stage2,
            Err(e) => {
                for vcpu in vcpus.iter().rev() {
                    let _ = res.scheduler.vcpu_destroy(vcpu);
                }
                return Err(e);
            }
        };

        let home = vcpus[0].hcpu();
        let timers = Arc::new(GuestTimers::new(
            res.id,
            home,
            res.scheduler.cpu(home).timers().clone(),
            res.hal.clone(),
        ));
        let sink = Arc::new(GuestIrqSink {
            vcpus: vcpus.clone(),
            scheduler: res.scheduler.clone(),
        });
        let guest = Arc::new(Guest {
            id: res.id,
            name: config.name.clone(),
            endianness: config.endianness,
            hal: res.hal.clone(),
            scheduler: res.scheduler.clone(),
            fabric: res.fabric.clone(),
            vcpus,
            memory: MemoryManager::new(&config.name, stage2, res.host.clone(), res.iomem.clone()),
            devices: DeviceManager::new(&config.name),
            router: Arc::new(IrqRouter::new()),
            sink,
            timers,
            throttle: FaultThrottle::new(
                res.decode_failure_limit,
                res.decode_failure_window.as_nanos() as u64,
            ),
            swap_lock: Mutex::new(()),
            paused_for: Mutex::new(None),
            config,
        });

        if let Err(e) = guest.populate(res.registry, res.console.as_ref()) {
            error!("{}: creation failed: {}", guest.name, e);
            guest.teardown();
            return Err(e);
        }
        for vcpu in &guest.vcpus {
            vcpu.bind_guest(Arc::downgrade(&guest));
        }
        info!(
            "guest {} created: {} VCPUs, {} regions",
            guest.name,
            guest.vcpus.len(),
            guest.region_list().len()
        );
        Ok(guest)
    }

    /// Build the regions, interrupt controllers first so that every other
    /// emulator finds its interrupt parent.
    fn populate(&self, registry: &EmulatorRegistry, console: Option<&SharedWriter>) -> Result<()> {
        let mut regions: Vec<&RegionConfig> = self.config.regions.iter().collect();
        regions.sort_by_key(|r| match (is_irq_chip(registry, r), r.node.attr("interrupts")) {
            (true, None) => 0,
            (true, Some(_)) => 1,
            (false, _) => 2,
        });

        for region in regions {
            let emulator = if region.flags.contains(RegionFlags::VIRTUAL) {
                Some(self.probe(registry, region, console)?)
            } else {
                None
            };
            if let Err(e) = self.memory.region_add(region, emulator) {
                if let Some(id) = emulator {
                    let _ = self.devices.remove(id);
                }
                return Err(e);
            }
            if region.flags.contains(RegionFlags::REAL) {
                self.route_host_irqs(region)?;
            }
        }
        Ok(())
    }

    fn probe(
        &self,
        registry: &EmulatorRegistry,
        region: &RegionConfig,
        console: Option<&SharedWriter>,
    ) -> Result<EmulatorId> {
        let memory: Arc<dyn GuestMemoryAccess> = self.memory.guest_memory();
        let timers: Arc<dyn GuestTimerService> = self.timers.clone();
        let ctx = ProbeContext {
            guest: &self.name,
            node: &region.node,
            base: region.gpa,
            size: region.size,
            endianness: self.endianness,
            router: self.router.clone(),
            irq_parent: self.interrupt_parent(region)?,
            memory,
            sink: self.sink.clone(),
            timers,
            console: console.cloned(),
        };
        self.devices.probe(registry, &ctx)
    }

    /// `interrupt-parent` is a phandle or the name of the chip node.
    fn interrupt_parent(&self, region: &RegionConfig) -> Result<Option<String>> {
        let Some(value) = region.node.attr("interrupt-parent") else {
            return Ok(None);
        };
        if let Some(phandle) = value.as_u64() {
            return self
                .config
                .node
                .find_phandle(phandle as u32)
                .map(|n| Some(n.name.clone()))
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "{}: interrupt parent with phandle {}",
                        region.name, phandle
                    ))
                });
        }
        value
            .as_str()
            .map(|name| Some(name.to_string()))
            .ok_or_else(|| Error::Invalid(format!("{}: bad interrupt-parent", region.name)))
    }

    /// Pass through the host IRQs listed in `host_interrupts` to the
    /// matching `interrupts` lines of a REAL region.
    fn route_host_irqs(&self, region: &RegionConfig) -> Result<()> {
        let Some(hirqs) = region.node.attr_u32_list("host_interrupts") else {
            return Ok(());
        };
        let lines = region.node.attr_u32_list("interrupts").unwrap_or_default();
        if lines.len() != hirqs.len() {
            return Err(Error::Invalid(format!(
                "{}: {} host interrupts for {} guest lines",
                region.name,
                hirqs.len(),
                lines.len()
            )));
        }
        for (hirq, line) in hirqs.into_iter().zip(lines) {
            self.fabric.route_to_guest(hirq, &self.name, &self.router, line)?;
        }
        Ok(())
    }

    /// Release everything but the VCPUs' scheduler slots, newest first.
    fn teardown(&self) {
        self.fabric.unroute_guest(&self.name);
        self.timers.cancel_all();
        for region in self.memory.teardown() {
            if let Some(id) = region.emulator {
                if let Err(e) = self.devices.remove(id) {
                    warn!("{}: {}", self.name, e);
                }
                virtio_devices::release_host_handle(&format!("{}/{}", self.name, region.name));
            }
        }
        self.devices.teardown();
        for vcpu in self.vcpus.iter().rev() {
            if let Err(e) = self.scheduler.vcpu_destroy(vcpu) {
                warn!("{}: {}", vcpu.name, e);
            }
        }
    }

    pub(crate) fn hal(&self) -> &Arc<dyn Hal> {
        &self.hal
    }

    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    pub fn router(&self) -> &Arc<IrqRouter> {
        &self.router
    }

    pub(crate) fn throttle(&self) -> &FaultThrottle {
        &self.throttle
    }

    pub(crate) fn swap_lock(&self) -> &Mutex<()> {
        &self.swap_lock
    }

    pub fn config(&self) -> &GuestConfig {
        &self.config
    }

    pub fn vcpus(&self) -> &[Arc<Vcpu>] {
        &self.vcpus
    }

    /// Look a VCPU up by its name inside the guest or by its index.
    pub fn vcpu(&self, name: &str) -> Option<&Arc<Vcpu>> {
        let full = format!("{}/{}", self.name, name);
        self.vcpus
            .iter()
            .find(|v| v.name == full || v.name == name)
            .or_else(|| name.parse::<usize>().ok().and_then(|i| self.vcpus.get(i)))
    }

    /// Start every VCPU that is not halted.
    pub fn kick(&self) -> Result<()> {
        self.paused_for.lock().unwrap().take();
        let mut started = 0;
        for vcpu in &self.vcpus {
            match self.scheduler.vcpu_kick(vcpu) {
                Ok(()) => started += 1,
                Err(Error::VcpuGone(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if started == 0 {
            return Err(Error::VcpuGone(format!("every VCPU of {}", self.name)));
        }
        Ok(())
    }

    /// Pause every started VCPU; returns once none of them runs.
    pub fn pause(&self) -> Result<()> {
        for vcpu in &self.vcpus {
            if matches!(vcpu.state(), VcpuState::Created | VcpuState::Halted) {
                continue;
            }
            self.scheduler.vcpu_pause(vcpu)?;
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.paused_for.lock().unwrap().take();
        self.throttle.reset();
        for vcpu in &self.vcpus {
            if vcpu.state() == VcpuState::Paused {
                self.scheduler.vcpu_resume(vcpu)?;
            }
        }
        Ok(())
    }

    pub fn halt(&self) -> Result<()> {
        for vcpu in &self.vcpus {
            if vcpu.state() != VcpuState::Halted {
                self.scheduler.vcpu_halt(vcpu, true)?;
            }
        }
        Ok(())
    }

    /// Back to the power-on state: VCPUs CREATED at their start PC, no
    /// stage-2 translations, every emulator reset. RAM contents are kept.
    pub fn reset(&self) -> Result<()> {
        for vcpu in &self.vcpus {
            self.scheduler.vcpu_reset(vcpu, true)?;
        }
        self.timers.cancel_all();
        self.memory.reset();
        self.throttle.reset();
        self.paused_for.lock().unwrap().take();
        self.devices.reset_all()?;
        info!("guest {} reset", self.name);
        Ok(())
    }

    /// Only a guest whose VCPUs are all HALTED or CREATED can go.
    pub(crate) fn destroy(&self) -> Result<()> {
        if let Some(busy) = self
            .vcpus
            .iter()
            .find(|v| !matches!(v.state(), VcpuState::Halted | VcpuState::Created))
        {
            return Err(Error::Invalid(format!(
                "{} is {}, halt the guest first",
                busy.name,
                busy.state()
            )));
        }
        self.teardown();
        info!("guest {} destroyed", self.name);
        Ok(())
    }

    /// Stop the guest for an operator to look at. Callable from the guest's
    /// own trap path.
    pub fn pause_for_inspection(&self, reason: &str) {
        warn!("guest {} paused: {}", self.name, reason);
        *self.paused_for.lock().unwrap() = Some(reason.to_string());
        for vcpu in &self.vcpus {
            if matches!(vcpu.state(), VcpuState::Ready | VcpuState::Running) {
                if let Err(e) = self.scheduler.vcpu_pause_nowait(vcpu) {
                    debug!("{}: {}", vcpu.name, e);
                }
            }
        }
    }

    pub fn paused_for(&self) -> Option<String> {
        self.paused_for.lock().unwrap().clone()
    }

    pub fn region_list(&self) -> Vec<RegionInfo> {
        self.memory.region_list(|id| self.devices.name(id))
    }

    pub fn vcpu_dumpreg(&self, name: &str) -> Result<String> {
        self.vcpu(name)
            .map(|v| v.dump())
            .ok_or_else(|| Error::NotFound(format!("VCPU {}/{}", self.name, name)))
    }

    pub fn vcpu_stats(&self) -> Vec<VcpuStats> {
        self.vcpus.iter().map(|v| v.stats()).collect()
    }

    pub fn info(&self) -> GuestInfo {
        GuestInfo {
            id: self.id,
            name: self.name.clone(),
            vcpus: self
                .vcpus
                .iter()
                .map(|v| (v.name.clone(), v.state()))
                .collect(),
            regions: self.region_list().len(),
            emulators: self.devices.len(),
            paused_for: self.paused_for(),
        }
    }
}
