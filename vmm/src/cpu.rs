// Copyright © 2020, Oracle and/or its affiliates.
//
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

//! VCPUs and the per host CPU run loop.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use hypervisor::{ArchVcpu, CpuMask, Hal, VirqKind, VmExit};
use serde::Serialize;

use crate::interrupt::HostIrqFabric;
use crate::scheduler::Scheduler;
use crate::vm::Guest;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum VcpuState {
    Created,
    Ready,
    Running,
    Paused,
    Halted,
}

impl fmt::Display for VcpuState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            VcpuState::Created => "created",
            VcpuState::Ready => "ready",
            VcpuState::Running => "running",
            VcpuState::Paused => "paused",
            VcpuState::Halted => "halted",
        };
        write!(f, "{}", s)
    }
}

/// What an orphan body asks the scheduler to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrphanStep {
    /// Give up the CPU but stay runnable.
    Yield,
    /// Sleep until something else becomes runnable or a timer is due.
    Wait,
    Exit,
}

pub type OrphanBody = Box<dyn FnMut() -> OrphanStep + Send>;

/// Scheduler bookkeeping of a VCPU, only touched with its owning run
/// queue locked.
pub(crate) struct SchedInfo {
    pub state: VcpuState,
    /// Paused by a wait-for-interrupt rather than by the operator.
    pub parked: bool,
    pub state_since_ns: u64,
    pub ready_ns: u64,
    pub running_ns: u64,
    pub paused_ns: u64,
    pub halted_ns: u64,
    pub switches: u64,
    pub resets: u64,
}

impl SchedInfo {
    fn new(now_ns: u64) -> Self {
        SchedInfo {
            state: VcpuState::Created,
            parked: false,
            state_since_ns: now_ns,
            ready_ns: 0,
            running_ns: 0,
            paused_ns: 0,
            halted_ns: 0,
            switches: 0,
            resets: 0,
        }
    }

    /// Enter `state`, charging the time spent in the previous one.
    pub fn set_state(&mut self, state: VcpuState, now_ns: u64) {
        let spent = now_ns.saturating_sub(self.state_since_ns);
        match self.state {
            VcpuState::Ready => self.ready_ns += spent,
            VcpuState::Running => self.running_ns += spent,
            VcpuState::Paused => self.paused_ns += spent,
            VcpuState::Halted => self.halted_ns += spent,
            VcpuState::Created => {}
        }
        self.state = state;
        self.state_since_ns = now_ns;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VcpuStats {
    pub name: String,
    pub state: VcpuState,
    pub priority: u8,
    pub hcpu: usize,
    pub ready_ns: u64,
    pub running_ns: u64,
    pub paused_ns: u64,
    pub halted_ns: u64,
    pub switches: u64,
    pub resets: u64,
}

impl fmt::Display for VcpuStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:<20} {:<8} prio {} hcpu {} ready {}us running {}us paused {}us switches {}",
            self.name,
            self.state,
            self.priority,
            self.hcpu,
            self.ready_ns / 1000,
            self.running_ns / 1000,
            self.paused_ns / 1000,
            self.switches
        )
    }
}

/// Lines held on each virtual interrupt input of a VCPU.
#[derive(Default)]
pub struct VirqState {
    lines: Mutex<[BTreeSet<u32>; 4]>,
}

fn kind_index(kind: VirqKind) -> usize {
    match kind {
        VirqKind::Irq => 0,
        VirqKind::Fiq => 1,
        VirqKind::Timer => 2,
        VirqKind::Software => 3,
    }
}

const VIRQ_KINDS: [VirqKind; 4] = [
    VirqKind::Irq,
    VirqKind::Fiq,
    VirqKind::Timer,
    VirqKind::Software,
];

impl VirqState {
    /// Returns whether the input went from idle to asserted.
    pub fn set(&self, line: u32, kind: VirqKind, level: bool) -> bool {
        let mut lines = self.lines.lock().unwrap();
        let held = &mut lines[kind_index(kind)];
        let was = !held.is_empty();
        if level {
            held.insert(line);
        } else {
            held.remove(&line);
        }
        !was && !held.is_empty()
    }

    pub fn asserted(&self, kind: VirqKind) -> bool {
        !self.lines.lock().unwrap()[kind_index(kind)].is_empty()
    }

    pub fn any_asserted(&self) -> bool {
        self.lines.lock().unwrap().iter().any(|l| !l.is_empty())
    }

    /// Pending lines of every input, ascending.
    pub fn pending_lines(&self) -> Vec<u32> {
        let lines = self.lines.lock().unwrap();
        let all: BTreeSet<u32> = lines.iter().flatten().copied().collect();
        all.into_iter().collect()
    }

    pub fn clear(&self) {
        for held in self.lines.lock().unwrap().iter_mut() {
            held.clear();
        }
    }

    /// Mirror the inputs into the register file before guest entry.
    pub fn sync_into(&self, arch: &mut ArchVcpu) {
        let lines = self.lines.lock().unwrap();
        for kind in VIRQ_KINDS {
            arch.set_pending_virq(kind, !lines[kind_index(kind)].is_empty());
        }
    }
}

pub enum VcpuKind {
    Normal {
        arch: Mutex<ArchVcpu>,
        start_pc: u64,
        virq: VirqState,
        guest: OnceLock<Weak<Guest>>,
    },
    Orphan {
        body: Mutex<OrphanBody>,
    },
}

pub struct Vcpu {
    /// System wide id.
    pub id: usize,
    /// Index inside the owning guest.
    pub subid: usize,
    pub name: String,
    pub priority: u8,
    pub time_slice_ns: u64,
    affinity: Mutex<CpuMask>,
    pub(crate) hcpu: AtomicUsize,
    pub(crate) sched: Mutex<SchedInfo>,
    pub(crate) kind: VcpuKind,
}

/// Parameters of a new VCPU.
pub struct VcpuParams {
    pub name: String,
    pub subid: usize,
    pub priority: u8,
    pub time_slice_ns: u64,
    pub affinity: CpuMask,
}

impl Vcpu {
    pub(crate) fn new(id: usize, params: VcpuParams, hcpu: usize, kind: VcpuKind, now: u64) -> Self {
        Vcpu {
            id,
            subid: params.subid,
            name: params.name,
            priority: params.priority,
            time_slice_ns: params.time_slice_ns,
            affinity: Mutex::new(params.affinity),
            hcpu: AtomicUsize::new(hcpu),
            sched: Mutex::new(SchedInfo::new(now)),
            kind,
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self.kind, VcpuKind::Normal { .. })
    }

    pub fn affinity(&self) -> CpuMask {
        *self.affinity.lock().unwrap()
    }

    pub(crate) fn set_affinity_mask(&self, mask: CpuMask) {
        *self.affinity.lock().unwrap() = mask;
    }

    /// Host CPU the VCPU is assigned to.
    pub fn hcpu(&self) -> usize {
        self.hcpu.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> VcpuState {
        self.sched.lock().unwrap().state
    }

    pub fn arch(&self) -> Option<&Mutex<ArchVcpu>> {
        match &self.kind {
            VcpuKind::Normal { arch, .. } => Some(arch),
            VcpuKind::Orphan { .. } => None,
        }
    }

    pub fn virq(&self) -> Option<&VirqState> {
        match &self.kind {
            VcpuKind::Normal { virq, .. } => Some(virq),
            VcpuKind::Orphan { .. } => None,
        }
    }

    pub fn guest(&self) -> Option<Arc<Guest>> {
        match &self.kind {
            VcpuKind::Normal { guest, .. } => guest.get().and_then(Weak::upgrade),
            VcpuKind::Orphan { .. } => None,
        }
    }

    pub(crate) fn bind_guest(&self, owner: Weak<Guest>) {
        if let VcpuKind::Normal { guest, .. } = &self.kind {
            let _ = guest.set(owner);
        }
    }

    /// Guest program counter.
    pub fn pc(&self) -> Option<u64> {
        self.arch().map(|a| a.lock().unwrap().pc())
    }

    /// Register file back to its power-on state.
    pub(crate) fn reset_registers(&self) {
        if let VcpuKind::Normal {
            arch,
            start_pc,
            virq,
            ..
        } = &self.kind
        {
            arch.lock().unwrap().reset(*start_pc);
            virq.clear();
        }
    }

    pub fn stats(&self) -> VcpuStats {
        let s = self.sched.lock().unwrap();
        VcpuStats {
            name: self.name.clone(),
            state: s.state,
            priority: self.priority,
            hcpu: self.hcpu(),
            ready_ns: s.ready_ns,
            running_ns: s.running_ns,
            paused_ns: s.paused_ns,
            halted_ns: s.halted_ns,
            switches: s.switches,
            resets: s.resets,
        }
    }

    /// Register dump plus scheduler statistics.
    pub fn dump(&self) -> String {
        let mut out = format!("{}\n", self.stats());
        match &self.kind {
            VcpuKind::Normal { arch, virq, .. } => {
                out.push_str(&arch.lock().unwrap().dump());
                let pending = virq.pending_lines();
                if !pending.is_empty() {
                    out.push_str(&format!("\npending vIRQs {:?}", pending));
                }
            }
            VcpuKind::Orphan { .. } => out.push_str("orphan"),
        }
        out
    }
}

impl fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("hcpu", &self.hcpu())
            .finish()
    }
}

/// Everything the run loop of one host CPU needs.
pub(crate) struct HostCpuLoop {
    pub cpu: usize,
    pub hal: Arc<dyn Hal>,
    pub scheduler: Arc<Scheduler>,
    pub fabric: Arc<HostIrqFabric>,
    pub irqs: flume::Receiver<u32>,
}

impl HostCpuLoop {
    pub fn run(self) {
        self.hal.bind_current_cpu(Some(self.cpu));
        info!("host CPU {} online", self.cpu);

        while !self.scheduler.is_stopping() {
            self.expire_timers();
            let vcpu = self.scheduler.schedule(self.cpu);
            match &vcpu.kind {
                VcpuKind::Normal { .. } => self.run_normal(&vcpu),
                VcpuKind::Orphan { body } => self.run_orphan(&vcpu, body),
            }
            self.scheduler.rebalance(self.cpu, &vcpu);
        }

        self.scheduler.deschedule_current(self.cpu);
        self.hal.bind_current_cpu(None);
        info!("host CPU {} offline", self.cpu);
    }

    fn expire_timers(&self) {
        let now = self.hal.monotonic_ns();
        self.scheduler.cpu(self.cpu).timers().expire(now);
    }

    /// Host interrupt context: timers and queued host IRQs.
    fn service_interrupts(&self) {
        self.scheduler.irq_enter(self.cpu);
        self.expire_timers();
        for hirq in self.irqs.try_iter() {
            if let Err(e) = self.fabric.handle_irq(hirq, self.cpu) {
                warn!("host CPU {}: IRQ {}: {}", self.cpu, hirq, e);
            }
        }
        self.scheduler.irq_exit(self.cpu);
    }

    fn run_normal(&self, vcpu: &Arc<Vcpu>) {
        let VcpuKind::Normal { arch, virq, .. } = &vcpu.kind else {
            return;
        };
        let Some(guest) = vcpu.guest() else {
            warn!("{} has no guest, halting", vcpu.name);
            let _ = self.scheduler.vcpu_halt(vcpu, false);
            return;
        };

        while !self.scheduler.need_resched(self.cpu, vcpu) {
            virq.sync_into(&mut arch.lock().unwrap());
            match self.hal.run_vcpu(self.cpu, vcpu.subid, arch) {
                Ok(VmExit::Trap(info)) => guest.handle_trap(vcpu, info),
                Ok(VmExit::Irq) | Ok(VmExit::Ipi) => self.service_interrupts(),
                Err(e) => {
                    error!("{}: cannot run guest code: {}", vcpu.name, e);
                    guest.pause_for_inspection(&format!("{}", e));
                }
            }
        }
    }

    fn run_orphan(&self, vcpu: &Arc<Vcpu>, body: &Mutex<OrphanBody>) {
        while !self.scheduler.need_resched(self.cpu, vcpu) {
            let step = (body.lock().unwrap().as_mut())();
            match step {
                OrphanStep::Yield => self.scheduler.yield_current(self.cpu),
                OrphanStep::Wait => {
                    self.scheduler.idle_wait(self.cpu);
                    self.hal.take_ipi(self.cpu);
                    self.service_interrupts();
                }
                OrphanStep::Exit => {
                    debug!("orphan {} exited", vcpu.name);
                    let _ = self.scheduler.vcpu_halt(vcpu, false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virq_inputs_track_lines() {
        let virq = VirqState::default();
        assert!(virq.set(33, VirqKind::Irq, true));
        assert!(!virq.set(34, VirqKind::Irq, true));
        assert!(!virq.set(33, VirqKind::Irq, false));
        assert!(virq.asserted(VirqKind::Irq));
        assert!(!virq.asserted(VirqKind::Fiq));
        assert_eq!(virq.pending_lines(), vec![34]);

        let mut arch = ArchVcpu::new(hypervisor::Arch::Arm32, 0, 0);
        virq.sync_into(&mut arch);
        assert!(arch.virq_pending(VirqKind::Irq));
        virq.clear();
        virq.sync_into(&mut arch);
        assert!(!arch.virq_pending(VirqKind::Irq));
    }

    #[test]
    fn state_time_is_charged() {
        let mut s = SchedInfo::new(0);
        s.set_state(VcpuState::Ready, 10);
        s.set_state(VcpuState::Running, 25);
        s.set_state(VcpuState::Paused, 125);
        s.set_state(VcpuState::Ready, 130);
        assert_eq!(s.ready_ns, 15);
        assert_eq!(s.running_ns, 100);
        assert_eq!(s.paused_ns, 5);
        assert_eq!(s.state, VcpuState::Ready);
    }
}
