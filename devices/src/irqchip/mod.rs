// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Virtual interrupt controllers.
//!
//! A chip is one [`VirqChip`] variant guarded by the lock of its
//! [`SharedChip`]. Chip code never calls out while that lock is held: the
//! effects of an operation are collected in a [`ChipOutput`] and applied by
//! the [`SharedChip`] once the lock is released, so a chip may be entered
//! again from the VCPU input it drives.

mod gic;
mod gicv3;
mod i8259;
mod lapic;
mod plic;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hypervisor::{AccessWidth, SysRegId, VirqKind};
use vm_device::{
    Emulator, EmulatorError, IrqChip, IrqError, IrqLine, IrqRouter, ProbeContext, Result,
    VcpuIrqSink,
};

pub use self::gic::GicV2;
pub use self::gicv3::GicV3;
pub use self::i8259::I8259;
pub use self::lapic::{Lapic, LAPIC_TIMER_LINE};
pub use self::plic::Plic;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirqUpdate {
    pub vcpu: usize,
    pub line: u32,
    pub kind: VirqKind,
    pub level: bool,
}

/// Side effects of one chip operation.
#[derive(Debug, Default)]
pub struct ChipOutput {
    virqs: Vec<VirqUpdate>,
    eois: Vec<u32>,
    parent_level: Option<bool>,
}

impl ChipOutput {
    pub fn set_virq(&mut self, vcpu: usize, line: u32, kind: VirqKind, level: bool) {
        self.virqs.push(VirqUpdate {
            vcpu,
            line,
            kind,
            level,
        });
    }

    pub fn eoi(&mut self, line: u32) {
        self.eois.push(line);
    }

    /// Level of the chip output when it is cascaded into another chip.
    pub fn set_parent(&mut self, level: bool) {
        self.parent_level = Some(level);
    }

    pub fn virqs(&self) -> &[VirqUpdate] {
        &self.virqs
    }
}

/// Outcome of an interrupt acknowledge cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
    None,
    Vector(u32),
    /// The winning input is a cascaded chip, which supplies the vector.
    Cascade(u32),
}

pub enum VirqChip {
    GicV2(GicV2),
    GicV3(GicV3),
    I8259(I8259),
    Plic(Plic),
    Lapic(Lapic),
}

impl VirqChip {
    pub fn kind(&self) -> &'static str {
        match self {
            VirqChip::GicV2(_) => "gic-v2",
            VirqChip::GicV3(_) => "gic-v3",
            VirqChip::I8259(_) => "i8259",
            VirqChip::Plic(_) => "plic",
            VirqChip::Lapic(_) => "lapic",
        }
    }

    pub fn handle(
        &mut self,
        line: u32,
        cpu_hint: Option<usize>,
        level: bool,
        out: &mut ChipOutput,
    ) -> std::result::Result<(), IrqError> {
        match self {
            VirqChip::GicV2(c) => c.set_irq(line, cpu_hint, level, out),
            VirqChip::GicV3(c) => c.set_irq(line, cpu_hint, level, out),
            VirqChip::I8259(c) => c.set_irq(line, level, out),
            VirqChip::Plic(c) => c.set_irq(line, level, out),
            VirqChip::Lapic(c) => c.set_irq(line, cpu_hint, level, out),
        }
    }

    pub fn handle_percpu(
        &mut self,
        line: u32,
        cpu: usize,
        level: bool,
        out: &mut ChipOutput,
    ) -> std::result::Result<(), IrqError> {
        match self {
            VirqChip::Lapic(c) => c.set_percpu_irq(line, cpu, level, out),
            chip => chip.handle(line, Some(cpu), level, out),
        }
    }

    pub fn read(
        &mut self,
        vcpu: usize,
        offset: u64,
        width: AccessWidth,
        out: &mut ChipOutput,
    ) -> Result<u64> {
        match self {
            VirqChip::GicV2(c) => c.read(vcpu, offset, width, out),
            VirqChip::GicV3(c) => c.read(vcpu, offset, width, out),
            VirqChip::I8259(c) => c.read(offset, out),
            VirqChip::Plic(c) => c.read(offset, width, out),
            VirqChip::Lapic(c) => c.read(vcpu, offset, out),
        }
    }

    pub fn write(
        &mut self,
        vcpu: usize,
        offset: u64,
        width: AccessWidth,
        value: u64,
        out: &mut ChipOutput,
    ) -> Result<()> {
        match self {
            VirqChip::GicV2(c) => c.write(vcpu, offset, width, value, out),
            VirqChip::GicV3(c) => c.write(vcpu, offset, width, value, out),
            VirqChip::I8259(c) => c.write(offset, value as u8, out),
            VirqChip::Plic(c) => c.write(offset, value as u32, out),
            VirqChip::Lapic(c) => c.write(vcpu, offset, value as u32, out),
        }
    }

    pub fn reset(&mut self, out: &mut ChipOutput) {
        match self {
            VirqChip::GicV2(c) => c.reset(out),
            VirqChip::GicV3(c) => c.reset(out),
            VirqChip::I8259(c) => c.reset(out),
            VirqChip::Plic(c) => c.reset(out),
            VirqChip::Lapic(c) => c.reset(out),
        }
    }

    pub fn acknowledge(&mut self, cpu: usize, out: &mut ChipOutput) -> Ack {
        match self {
            VirqChip::GicV2(c) => c.acknowledge_vector(cpu, out),
            VirqChip::GicV3(c) => c.acknowledge_vector(cpu, out),
            VirqChip::I8259(c) => c.acknowledge(out),
            VirqChip::Plic(c) => c.acknowledge(cpu, out),
            VirqChip::Lapic(c) => c.acknowledge(cpu, out),
        }
    }

    pub fn read_cpu_reg(&mut self, cpu: usize, id: SysRegId, out: &mut ChipOutput) -> Option<u64> {
        match self {
            VirqChip::GicV3(c) => c.read_icc(cpu, id, out),
            _ => None,
        }
    }

    pub fn write_cpu_reg(
        &mut self,
        cpu: usize,
        id: SysRegId,
        value: u64,
        out: &mut ChipOutput,
    ) -> bool {
        match self {
            VirqChip::GicV3(c) => c.write_icc(cpu, id, value, out),
            _ => false,
        }
    }

    pub fn supports_width(&self, width: AccessWidth) -> bool {
        match self {
            VirqChip::I8259(_) => width == AccessWidth::Byte,
            VirqChip::GicV2(_) | VirqChip::GicV3(_) => width != AccessWidth::Double,
            VirqChip::Plic(_) | VirqChip::Lapic(_) => width == AccessWidth::Word,
        }
    }
}

/// A chip bound to a guest: its lock, its VCPU sink and its place in the
/// guest's IRQ router.
pub struct SharedChip {
    name: String,
    chip: Mutex<VirqChip>,
    sink: Arc<dyn VcpuIrqSink>,
    router: Arc<IrqRouter>,
    parent: Option<IrqLine>,
    children: Mutex<HashMap<u32, Arc<dyn IrqChip>>>,
}

impl SharedChip {
    pub fn new(
        name: &str,
        chip: VirqChip,
        sink: Arc<dyn VcpuIrqSink>,
        router: Arc<IrqRouter>,
        parent: Option<IrqLine>,
    ) -> Arc<Self> {
        Arc::new(SharedChip {
            name: name.to_string(),
            chip: Mutex::new(chip),
            sink,
            router,
            parent,
            children: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` on the chip, then apply what it produced.
    pub fn run<R>(&self, f: impl FnOnce(&mut VirqChip, &mut ChipOutput) -> R) -> R {
        let mut out = ChipOutput::default();
        let ret = {
            let mut chip = self.chip.lock().unwrap();
            f(&mut chip, &mut out)
        };
        self.apply(out);
        ret
    }

    fn apply(&self, out: ChipOutput) {
        for u in out.virqs {
            self.sink.set_virq(u.vcpu, u.line, u.kind, u.level);
        }
        for line in out.eois {
            self.sink.virq_eoi(line);
            self.router.notify_eoi(line);
        }
        if let (Some(level), Some(parent)) = (out.parent_level, &self.parent) {
            if let Err(e) = parent.set_level(level) {
                warn!("{}: cascade output lost: {}", self.name, e);
            }
        }
    }
}

impl IrqChip for SharedChip {
    fn handle(
        &self,
        line: u32,
        cpu_hint: Option<usize>,
        level: bool,
    ) -> std::result::Result<(), IrqError> {
        self.run(|chip, out| chip.handle(line, cpu_hint, level, out))
    }

    fn handle_percpu(&self, line: u32, cpu: usize, level: bool) -> std::result::Result<(), IrqError> {
        self.run(|chip, out| chip.handle_percpu(line, cpu, level, out))
    }

    fn acknowledge(&self, cpu: usize) -> Option<u32> {
        match self.run(|chip, out| chip.acknowledge(cpu, out)) {
            Ack::None => None,
            Ack::Vector(v) => Some(v),
            Ack::Cascade(line) => {
                let child = self.children.lock().unwrap().get(&line).cloned();
                child.and_then(|c| c.acknowledge(cpu))
            }
        }
    }

    fn read_cpu_reg(&self, cpu: usize, id: SysRegId) -> Option<u64> {
        self.run(|chip, out| chip.read_cpu_reg(cpu, id, out))
    }

    fn write_cpu_reg(&self, cpu: usize, id: SysRegId, value: u64) -> bool {
        self.run(|chip, out| chip.write_cpu_reg(cpu, id, value, out))
    }

    fn attach_cascade(&self, line: u32, child: Arc<dyn IrqChip>) {
        debug!("{}: cascade on line {}", self.name, line);
        self.children.lock().unwrap().insert(line, child);
    }
}

/// Register window of a [`SharedChip`].
pub struct ChipEmulator(pub Arc<SharedChip>);

impl Emulator for ChipEmulator {
    fn read(&mut self, vcpu: usize, offset: u64, width: AccessWidth) -> Result<u64> {
        self.0.run(|chip, out| chip.read(vcpu, offset, width, out))
    }

    fn write(&mut self, vcpu: usize, offset: u64, width: AccessWidth, value: u64) -> Result<()> {
        self.0
            .run(|chip, out| chip.write(vcpu, offset, width, value, out))
    }

    fn reset(&mut self) -> Result<()> {
        self.0.run(|chip, out| chip.reset(out));
        Ok(())
    }

    fn supports_width(&self, width: AccessWidth) -> bool {
        self.0.chip.lock().unwrap().supports_width(width)
    }

    fn remove(&mut self) {
        self.0.children.lock().unwrap().clear();
        self.0.router.unregister_chip(&self.0.name);
    }
}

fn attr_u32(ctx: &ProbeContext, name: &str, default: u32) -> u32 {
    ctx.node.attr_u32(name).unwrap_or(default)
}

/// Register `chip` under the node name and cascade it into its parent when
/// the node lists an input line of another chip.
fn install(ctx: &ProbeContext, chip: VirqChip) -> Result<Arc<Mutex<dyn Emulator>>> {
    let parent = ctx.irq_lines().into_iter().next();
    let cascade = parent.as_ref().map(|p| p.line());
    let shared = SharedChip::new(
        &ctx.node.name,
        chip,
        ctx.sink.clone(),
        ctx.router.clone(),
        parent,
    );
    ctx.router.register_chip(&ctx.node.name, shared.clone())?;
    if let Some(line) = cascade {
        match ctx.router.chip(ctx.irq_parent.as_deref()) {
            Some(p) => p.attach_cascade(line, shared.clone()),
            None => {
                ctx.router.unregister_chip(&ctx.node.name);
                return Err(EmulatorError::Irq(IrqError::NoChip(ctx.irq_parent.clone())));
            }
        }
    }
    info!(
        "{}: {} vIRQ chip at {:#x} for {} VCPUs",
        ctx.node.name,
        shared.chip.lock().unwrap().kind(),
        ctx.base,
        ctx.vcpu_count()
    );
    Ok(Arc::new(Mutex::new(ChipEmulator(shared))))
}

pub fn probe_gicv2(ctx: &ProbeContext) -> Result<Arc<Mutex<dyn Emulator>>> {
    let gic = GicV2::new(
        ctx.vcpu_count(),
        attr_u32(ctx, "num_irq", gic::GIC_DEFAULT_NIRQ),
        attr_u32(ctx, "base_irq", 0),
        ctx.node.attr_u64("dist_offset").unwrap_or(0),
        ctx.node.attr_u64("cpu_offset").unwrap_or(0x1000),
    )?;
    install(ctx, VirqChip::GicV2(gic))
}

pub fn probe_gicv3(ctx: &ProbeContext) -> Result<Arc<Mutex<dyn Emulator>>> {
    let gic = GicV3::new(
        ctx.vcpu_count(),
        attr_u32(ctx, "num_irq", gic::GIC_DEFAULT_NIRQ),
        ctx.node.attr_u64("redist_offset").unwrap_or(gicv3::GICR_DEFAULT_OFFSET),
    )?;
    install(ctx, VirqChip::GicV3(gic))
}

pub fn probe_i8259(ctx: &ProbeContext) -> Result<Arc<Mutex<dyn Emulator>>> {
    let cascaded = !ctx.irq_lines().is_empty();
    let pic = I8259::new(attr_u32(ctx, "base_irq", 0), cascaded);
    install(ctx, VirqChip::I8259(pic))
}

pub fn probe_plic(ctx: &ProbeContext) -> Result<Arc<Mutex<dyn Emulator>>> {
    let plic = Plic::new(
        ctx.vcpu_count(),
        attr_u32(ctx, "num_irq", plic::PLIC_MAX_DEVICES),
        attr_u32(ctx, "base_irq", 0),
        attr_u32(ctx, "max_priority", plic::PLIC_MAX_PRIORITY),
    )?;
    install(ctx, VirqChip::Plic(plic))
}

pub fn probe_lapic(ctx: &ProbeContext) -> Result<Arc<Mutex<dyn Emulator>>> {
    let lapic = Lapic::new(
        ctx.vcpu_count(),
        ctx.timers.clone(),
        Arc::downgrade(&ctx.router),
        ctx.node.name.clone(),
    );
    install(ctx, VirqChip::Lapic(lapic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;

    #[test]
    fn effects_applied_after_unlock() {
        let router = Arc::new(IrqRouter::new());
        let sink = RecordingSink::new(1);
        let shared = SharedChip::new(
            "pic",
            VirqChip::I8259(I8259::new(0, false)),
            sink.clone(),
            router.clone(),
            None,
        );
        router.register_chip("pic", shared.clone()).unwrap();

        let mut emu = ChipEmulator(shared.clone());
        // ICW1..ICW4, vector base 0x20, then unmask everything.
        for (port, v) in [(0, 0x11), (1, 0x20), (1, 0x04), (1, 0x01), (1, 0x00)] {
            emu.write(0, port, AccessWidth::Byte, v).unwrap();
        }
        router.handle(None, 3, None, true).unwrap();
        assert_eq!(sink.lines(0, VirqKind::Irq), vec![3]);
        assert_eq!(shared.acknowledge(0), Some(0x23));

        emu.remove();
        assert!(router.chip(Some("pic")).is_none());
    }
}
