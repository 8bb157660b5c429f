// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use hypervisor::arch::arm::{
    EC_DABT_LOW, EC_UNKNOWN, EC_WFI_WFE, HSR_EC_SHIFT, HSR_IL, HSR_ISV, HSR_WNR,
};
use hypervisor::{
    AccessKind, AccessWidth, ArchVcpu, GuestExecutor, Hal, SoftHal, Stage2FaultKind, TrapInfo,
    VmExit,
};
use vm_device::device_tree::DeviceNode;
use vm_device::Emulator;
use vmm::memory_manager::AddressKind;
use vmm::{Guest, Vmm, VmmConfig};

pub const RAM_BASE: u64 = 0x4000_0000;
pub const RAM_SIZE: u64 = 0x20_0000;

/// One instruction, or a block of them, of a scripted guest.
pub enum Op {
    /// Word load into `reg` through the stage-2 table; traps while the page
    /// is not mapped.
    Load { gpa: u64, reg: usize },
    /// Take this trap.
    Trap(TrapInfo),
    /// Host code standing in for straight-line guest code.
    Exec(Box<dyn FnOnce(&mut ArchVcpu) + Send>),
    /// Straight-line code forever: the PC moves on every step.
    Spin,
}

impl Op {
    pub fn exec(f: impl FnOnce(&mut ArchVcpu) + Send + 'static) -> Op {
        Op::Exec(Box::new(f))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadRecord {
    pub gpa: u64,
    pub value: u32,
    /// The load trapped before it completed.
    pub trapped: bool,
}

#[derive(Default)]
struct Program {
    ops: VecDeque<Op>,
    trapped: bool,
}

/// Guest executor replaying per-VCPU scripts on the hosted HAL.
#[derive(Default)]
pub struct ScriptedGuest {
    guest: OnceLock<Weak<Guest>>,
    programs: Mutex<HashMap<usize, Program>>,
    loads: Mutex<Vec<LoadRecord>>,
}

impl ScriptedGuest {
    pub fn bind(&self, guest: &Arc<Guest>) {
        let _ = self.guest.set(Arc::downgrade(guest));
    }

    pub fn push(&self, vcpu: usize, op: Op) {
        self.programs
            .lock()
            .unwrap()
            .entry(vcpu)
            .or_default()
            .ops
            .push_back(op);
    }

    pub fn pending(&self, vcpu: usize) -> usize {
        self.programs
            .lock()
            .unwrap()
            .get(&vcpu)
            .map_or(0, |p| p.ops.len())
    }

    pub fn loads(&self) -> Vec<LoadRecord> {
        self.loads.lock().unwrap().clone()
    }

    fn load(
        &self,
        program: &mut Program,
        gpa: u64,
        reg: usize,
        state: &mut ArchVcpu,
    ) -> Option<VmExit> {
        let Some(guest) = self.guest.get().and_then(Weak::upgrade) else {
            program.ops.push_front(Op::Load { gpa, reg });
            return None;
        };
        match guest.memory().stage2().walk(gpa, AccessKind::Read) {
            Ok(mapping) => {
                let mut bytes = [0u8; 4];
                guest.memory().host().read(mapping.hpa, &mut bytes).unwrap();
                let value = u32::from_le_bytes(bytes);
                self.loads.lock().unwrap().push(LoadRecord {
                    gpa,
                    value,
                    trapped: program.trapped,
                });
                program.trapped = false;
                state.write_gpr(reg, u64::from(value)).unwrap();
                state.advance_pc(4);
                None
            }
            Err(kind) => {
                program.trapped = true;
                program.ops.push_front(Op::Load { gpa, reg });
                Some(VmExit::Trap(data_abort(gpa, false, reg, AccessWidth::Word, kind)))
            }
        }
    }
}

impl GuestExecutor for ScriptedGuest {
    fn step(&self, _cpu: usize, vcpu: usize, state: &mut ArchVcpu) -> Option<VmExit> {
        let mut programs = self.programs.lock().unwrap();
        let program = programs.entry(vcpu).or_default();
        let Some(op) = program.ops.pop_front() else {
            drop(programs);
            thread::sleep(Duration::from_micros(50));
            return None;
        };
        match op {
            Op::Trap(info) => Some(VmExit::Trap(info)),
            Op::Load { gpa, reg } => self.load(program, gpa, reg, state),
            Op::Spin => {
                program.ops.push_front(Op::Spin);
                drop(programs);
                state.advance_pc(4);
                thread::sleep(Duration::from_micros(20));
                None
            }
            Op::Exec(f) => {
                drop(programs);
                f(state);
                None
            }
        }
    }
}

fn fault_status(kind: Stage2FaultKind) -> u32 {
    match kind {
        Stage2FaultKind::Translation => 0x07,
        Stage2FaultKind::AccessFlag => 0x0b,
        Stage2FaultKind::Permission => 0x0f,
    }
}

/// Stage-2 data abort with a valid instruction syndrome.
pub fn data_abort(
    ipa: u64,
    write: bool,
    reg: usize,
    width: AccessWidth,
    kind: Stage2FaultKind,
) -> TrapInfo {
    let sas = width.bytes().trailing_zeros();
    let mut hsr = (EC_DABT_LOW << HSR_EC_SHIFT)
        | HSR_IL
        | HSR_ISV
        | (sas << 22)
        | ((reg as u32) << 16)
        | fault_status(kind);
    if write {
        hsr |= HSR_WNR;
    }
    arm32_trap(hsr, ipa)
}

/// Stage-2 data abort the hardware could not describe: the dispatcher must
/// decode the instruction itself.
pub fn data_abort_no_syndrome(ipa: u64, write: bool) -> TrapInfo {
    let mut hsr =
        (EC_DABT_LOW << HSR_EC_SHIFT) | HSR_IL | fault_status(Stage2FaultKind::Translation);
    if write {
        hsr |= HSR_WNR;
    }
    arm32_trap(hsr, ipa)
}

pub fn wfi() -> TrapInfo {
    arm32_trap((EC_WFI_WFE << HSR_EC_SHIFT) | HSR_IL, 0)
}

pub fn undefined() -> TrapInfo {
    arm32_trap((EC_UNKNOWN << HSR_EC_SHIFT) | HSR_IL, 0)
}

fn arm32_trap(hsr: u32, ipa: u64) -> TrapInfo {
    TrapInfo::Arm32 {
        hsr,
        hdfar: ipa as u32,
        hifar: 0,
        hpfar: ((ipa >> 12) << 4) as u32,
    }
}

pub struct TestVmm {
    pub vmm: Vmm,
    pub hal: Arc<SoftHal>,
    pub guest_code: Arc<ScriptedGuest>,
}

impl TestVmm {
    pub fn new(cpus: usize) -> Self {
        let hal = Arc::new(SoftHal::with_tick(cpus, Duration::from_millis(1)));
        let guest_code = Arc::new(ScriptedGuest::default());
        hal.set_executor(guest_code.clone());
        let config = VmmConfig {
            host_cpus: cpus,
            host_ram_size: 64 << 20,
            ..Default::default()
        };
        let vmm = Vmm::new(config, hal.clone() as Arc<dyn Hal>).unwrap();
        TestVmm {
            vmm,
            hal,
            guest_code,
        }
    }

    pub fn create(&self, node: &DeviceNode) -> Arc<Guest> {
        let guest = self.vmm.guest_create(node).unwrap();
        self.guest_code.bind(&guest);
        guest
    }
}

pub fn vcpu_node(name: &str, start_pc: u64) -> DeviceNode {
    DeviceNode::new(name).with_u64("start_pc", start_pc)
}

pub fn ram_node(name: &str, gpa: u64, size: u64) -> DeviceNode {
    DeviceNode::new(name)
        .with_str("manifest_type", "real")
        .with_str("address_type", "memory")
        .with_u64("guest_physical_addr", gpa)
        .with_u64("physical_size", size)
        .with_u32s("cacheable", &[1])
        .with_u32s("bufferable", &[1])
}

pub fn emulated_node(name: &str, compatible: &str, gpa: u64, size: u64) -> DeviceNode {
    DeviceNode::new(name)
        .with_compatible(compatible)
        .with_str("manifest_type", "virtual")
        .with_str("address_type", "memory")
        .with_u64("guest_physical_addr", gpa)
        .with_u64("physical_size", size)
}

pub fn guest_node(name: &str, vcpus: Vec<DeviceNode>, regions: Vec<DeviceNode>) -> DeviceNode {
    let vcpus = vcpus
        .into_iter()
        .fold(DeviceNode::new("vcpus"), DeviceNode::with_child);
    let aspace = regions
        .into_iter()
        .fold(DeviceNode::new("aspace"), DeviceNode::with_child);
    DeviceNode::new(name).with_child(vcpus).with_child(aspace)
}

/// A one-VCPU guest with RAM at [`RAM_BASE`] plus `regions`.
pub fn simple_guest(name: &str, regions: Vec<DeviceNode>) -> DeviceNode {
    let mut all = vec![ram_node("ram", RAM_BASE, RAM_SIZE)];
    all.extend(regions);
    guest_node(name, vec![vcpu_node("vcpu0", RAM_BASE)], all)
}

pub fn emulator_at(guest: &Guest, gpa: u64) -> Arc<Mutex<dyn Emulator>> {
    let region = guest
        .memory()
        .region_find(AddressKind::Memory, gpa)
        .expect("no region");
    guest
        .devices()
        .get(region.emulator.expect("not an emulated region"))
        .expect("emulator gone")
}

pub fn mmio_write(emulator: &Arc<Mutex<dyn Emulator>>, offset: u64, value: u64) {
    emulator
        .lock()
        .unwrap()
        .write(0, offset, AccessWidth::Word, value)
        .unwrap();
}

pub fn mmio_read(emulator: &Arc<Mutex<dyn Emulator>>, offset: u64) -> u64 {
    emulator
        .lock()
        .unwrap()
        .read(0, offset, AccessWidth::Word)
        .unwrap()
}

pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}
