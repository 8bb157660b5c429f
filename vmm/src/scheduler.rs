// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! VCPU scheduler.
//!
//! Each host CPU has one run queue: strict priority between levels,
//! round robin inside a level, and an idle orphan that runs when nothing
//! else is ready. A VCPU belongs to the run queue of its `hcpu`; its
//! scheduler fields are only changed with that run queue locked. Lock order
//! is run queue, then VCPU. Two run queues are locked in index order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use hypervisor::{CpuMask, Hal, IpiHandler};
use vm_device::TimerToken;

use crate::config::{
    VmmConfig, IDLE_VCPU_PRIORITY, IDLE_VCPU_TIME_SLICE_NS, VCPU_MAX_PRIORITY,
};
use crate::cpu::{OrphanBody, OrphanStep, Vcpu, VcpuKind, VcpuParams, VcpuState};
use crate::error::{Error, Result};
use crate::timer::TimerQueue;

const PRIORITY_LEVELS: usize = VCPU_MAX_PRIORITY as usize + 1;

/// Timer owner tag of scheduler events.
const SCHED_TIMER_OWNER: u64 = u64::MAX;

struct RunQueue {
    ready: [VecDeque<Arc<Vcpu>>; PRIORITY_LEVELS],
    current: Option<Arc<Vcpu>>,
    idle: Arc<Vcpu>,
    preempt_count: u32,
    resched: bool,
    irq_context: bool,
    yield_on_irq_exit: bool,
    deferred: bool,
    slice_timer: Option<TimerToken>,
}

impl RunQueue {
    fn new(idle: Arc<Vcpu>) -> Self {
        RunQueue {
            ready: Default::default(),
            current: None,
            idle,
            preempt_count: 0,
            resched: false,
            irq_context: false,
            yield_on_irq_exit: false,
            deferred: false,
            slice_timer: None,
        }
    }

    fn is_current(&self, vcpu: &Arc<Vcpu>) -> bool {
        self.current.as_ref().is_some_and(|c| Arc::ptr_eq(c, vcpu))
    }

    fn is_idle(&self, vcpu: &Arc<Vcpu>) -> bool {
        Arc::ptr_eq(&self.idle, vcpu)
    }

    fn dequeue(&mut self, vcpu: &Arc<Vcpu>) -> bool {
        let level = &mut self.ready[vcpu.priority as usize];
        let before = level.len();
        level.retain(|v| !Arc::ptr_eq(v, vcpu));
        level.len() != before
    }

    fn pop_highest(&mut self) -> Option<Arc<Vcpu>> {
        self.ready.iter_mut().rev().find_map(|level| level.pop_front())
    }

    fn nr_ready(&self) -> usize {
        self.ready.iter().map(|l| l.len()).sum()
    }

    /// Whether `vcpu` becoming ready should preempt the current VCPU.
    fn preempted_by(&self, vcpu: &Vcpu) -> bool {
        match &self.current {
            None => true,
            Some(cur) => self.is_idle(cur) || cur.priority < vcpu.priority,
        }
    }
}

/// Scheduling domain of one host CPU.
pub struct HostCpu {
    pub id: usize,
    rq: Mutex<RunQueue>,
    wakeup: Condvar,
    timers: Arc<TimerQueue>,
    // VCPUs assigned to this CPU, for placement.
    load: AtomicUsize,
}

impl HostCpu {
    fn new(id: usize, idle: Arc<Vcpu>) -> Self {
        HostCpu {
            id,
            rq: Mutex::new(RunQueue::new(idle)),
            wakeup: Condvar::new(),
            timers: Arc::new(TimerQueue::new()),
            load: AtomicUsize::new(1),
        }
    }

    pub fn timers(&self) -> &Arc<TimerQueue> {
        &self.timers
    }

    /// VCPU currently owning the CPU.
    pub fn current(&self) -> Option<Arc<Vcpu>> {
        self.rq.lock().unwrap().current.clone()
    }

    pub fn nr_ready(&self) -> usize {
        self.rq.lock().unwrap().nr_ready()
    }
}

struct IpiForwarder(Weak<Scheduler>);

impl IpiHandler for IpiForwarder {
    fn handle_ipi(&self, cpu: usize) {
        if let Some(sched) = self.0.upgrade() {
            if let Some(hc) = sched.cpus.get(cpu) {
                let _rq = hc.rq.lock().unwrap();
                hc.wakeup.notify_all();
            }
        }
    }
}

/// How a transition requested on a running VCPU completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Completion {
    /// Return once the target CPU has switched away from the VCPU.
    Wait,
    NoWait,
}

pub struct Scheduler {
    hal: Arc<dyn Hal>,
    cpus: Vec<Arc<HostCpu>>,
    vcpus: RwLock<BTreeMap<usize, Arc<Vcpu>>>,
    max_vcpus: usize,
    tick: Duration,
    pause_timeout: Duration,
    stopping: AtomicBool,
    weak_self: Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(hal: Arc<dyn Hal>, config: &VmmConfig) -> Result<Arc<Self>> {
        let ncpus = config.host_cpus.min(hal.cpu_count());
        if ncpus == 0 {
            return Err(Error::Invalid("no host CPUs".to_string()));
        }
        let now = hal.monotonic_ns();
        let mut vcpus = BTreeMap::new();
        let cpus = (0..ncpus)
            .map(|cpu| {
                let idle = Arc::new(Vcpu::new(
                    cpu,
                    VcpuParams {
                        name: format!("idle/{}", cpu),
                        subid: cpu,
                        priority: IDLE_VCPU_PRIORITY,
                        time_slice_ns: IDLE_VCPU_TIME_SLICE_NS,
                        affinity: CpuMask::single(cpu),
                    },
                    cpu,
                    VcpuKind::Orphan {
                        body: Mutex::new(Box::new(|| OrphanStep::Wait)),
                    },
                    now,
                ));
                idle.sched
                    .lock()
                    .unwrap()
                    .set_state(VcpuState::Ready, now);
                vcpus.insert(cpu, idle.clone());
                Arc::new(HostCpu::new(cpu, idle))
            })
            .collect();

        let sched = Arc::new_cyclic(|weak_self| Scheduler {
            hal: hal.clone(),
            cpus,
            vcpus: RwLock::new(vcpus),
            max_vcpus: config.max_vcpus,
            tick: config.tick,
            pause_timeout: config.pause_timeout,
            stopping: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });

        hal.set_ipi_handler(Arc::new(IpiForwarder(Arc::downgrade(&sched))));
        info!("scheduler up on {} host CPUs", ncpus);
        Ok(sched)
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, cpu: usize) -> &Arc<HostCpu> {
        &self.cpus[cpu]
    }

    /// Every host CPU of the scheduler.
    pub fn all_cpus(&self) -> CpuMask {
        CpuMask::first_n(self.cpus.len())
    }

    pub fn now_ns(&self) -> u64 {
        self.hal.monotonic_ns()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Ask every run loop to exit.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for hc in &self.cpus {
            hc.rq.lock().unwrap().resched = true;
            hc.wakeup.notify_all();
        }
        for cpu in 0..self.cpus.len() {
            self.hal.send_ipi(cpu);
        }
    }

    pub fn vcpu(&self, id: usize) -> Option<Arc<Vcpu>> {
        self.vcpus.read().unwrap().get(&id).cloned()
    }

    pub fn vcpus(&self) -> Vec<Arc<Vcpu>> {
        self.vcpus.read().unwrap().values().cloned().collect()
    }

    /// Register a new VCPU in state CREATED on the least loaded CPU of its
    /// affinity.
    pub fn vcpu_create(&self, params: VcpuParams, kind: VcpuKind) -> Result<Arc<Vcpu>> {
        if params.priority > VCPU_MAX_PRIORITY {
            return Err(Error::Invalid(format!(
                "{}: priority {}",
                params.name, params.priority
            )));
        }
        let affinity = params.affinity.and(self.all_cpus());
        if affinity.is_empty() {
            return Err(Error::Invalid(format!(
                "{}: affinity {:?} has no usable host CPU",
                params.name, params.affinity
            )));
        }
        let hcpu = affinity
            .iter()
            .min_by_key(|&c| self.cpus[c].load.load(Ordering::SeqCst))
            .unwrap_or(0);

        let mut vcpus = self.vcpus.write().unwrap();
        if vcpus.len() >= self.max_vcpus {
            return Err(Error::OutOfMemory(format!(
                "no VCPU slot for {} ({} in use)",
                params.name,
                vcpus.len()
            )));
        }
        let id = (0..).find(|id| !vcpus.contains_key(id)).unwrap_or(vcpus.len());
        let params = VcpuParams { affinity, ..params };
        let vcpu = Arc::new(Vcpu::new(id, params, hcpu, kind, self.now_ns()));
        vcpus.insert(id, vcpu.clone());
        self.cpus[hcpu].load.fetch_add(1, Ordering::SeqCst);
        debug!("VCPU {} ({}) created on host CPU {}", id, vcpu.name, hcpu);
        Ok(vcpu)
    }

    /// Forget a VCPU; it is halted first.
    pub fn vcpu_destroy(&self, vcpu: &Arc<Vcpu>) -> Result<()> {
        match self.vcpu_halt(vcpu, true) {
            Ok(()) | Err(Error::VcpuGone(_)) => {}
            Err(e) => return Err(e),
        }
        if self.vcpus.write().unwrap().remove(&vcpu.id).is_some() {
            self.cpus[vcpu.hcpu()].load.fetch_sub(1, Ordering::SeqCst);
            debug!("VCPU {} ({}) destroyed", vcpu.id, vcpu.name);
        }
        Ok(())
    }

    /// Create and start a hypervisor thread.
    pub fn orphan_create(
        &self,
        name: &str,
        priority: u8,
        time_slice_ns: u64,
        affinity: CpuMask,
        body: OrphanBody,
    ) -> Result<Arc<Vcpu>> {
        let vcpu = self.vcpu_create(
            VcpuParams {
                name: name.to_string(),
                subid: 0,
                priority,
                time_slice_ns,
                affinity,
            },
            VcpuKind::Orphan {
                body: Mutex::new(body),
            },
        )?;
        self.vcpu_kick(&vcpu)?;
        Ok(vcpu)
    }

    pub fn orphan_destroy(&self, vcpu: &Arc<Vcpu>) -> Result<()> {
        if vcpu.is_normal() {
            return Err(Error::Invalid(format!("{} is not an orphan", vcpu.name)));
        }
        self.vcpu_destroy(vcpu)
    }

    /// Lock the run queue owning `vcpu`.
    fn lock_owner(&self, vcpu: &Vcpu) -> (usize, MutexGuard<'_, RunQueue>) {
        loop {
            let cpu = vcpu.hcpu();
            let rq = self.cpus[cpu].rq.lock().unwrap();
            if vcpu.hcpu() == cpu {
                return (cpu, rq);
            }
        }
    }

    /// Note a reschedule request for `cpu`. Returns whether an IPI must be
    /// sent once the run queue is unlocked.
    fn request_resched(&self, cpu: usize, rq: &mut RunQueue) -> bool {
        self.cpus[cpu].wakeup.notify_all();
        if self.hal.current_cpu() != Some(cpu) {
            rq.resched = true;
            return true;
        }
        if rq.preempt_count > 0 {
            rq.deferred = true;
        } else if rq.irq_context {
            rq.yield_on_irq_exit = true;
        } else {
            rq.resched = true;
        }
        false
    }

    /// Put a CREATED or PAUSED VCPU back into play on its run queue.
    fn make_ready(&self, cpu: usize, rq: &mut RunQueue, vcpu: &Arc<Vcpu>) -> bool {
        let now = self.now_ns();
        let mut s = vcpu.sched.lock().unwrap();
        s.parked = false;
        if rq.is_current(vcpu) {
            // Not switched out yet.
            s.set_state(VcpuState::Running, now);
            return false;
        }
        s.set_state(VcpuState::Ready, now);
        drop(s);
        rq.ready[vcpu.priority as usize].push_back(vcpu.clone());
        self.cpus[cpu].wakeup.notify_all();
        if rq.preempted_by(vcpu) {
            return self.request_resched(cpu, rq);
        }
        false
    }

    fn send_ipi_if(&self, cpu: usize, needed: bool) {
        if needed {
            self.hal.send_ipi(cpu);
        }
    }

    /// CREATED or PAUSED to READY. A no-op on READY and RUNNING VCPUs.
    pub fn vcpu_kick(&self, vcpu: &Arc<Vcpu>) -> Result<()> {
        self.place_for_wakeup(vcpu);
        let (cpu, mut rq) = self.lock_owner(vcpu);
        let state = vcpu.state();
        let ipi = match state {
            VcpuState::Created | VcpuState::Paused => self.make_ready(cpu, &mut rq, vcpu),
            VcpuState::Ready | VcpuState::Running => false,
            VcpuState::Halted => return Err(Error::VcpuGone(vcpu.name.clone())),
        };
        drop(rq);
        debug!("{} kicked ({} -> ready)", vcpu.name, state);
        self.send_ipi_if(cpu, ipi);
        Ok(())
    }

    /// PAUSED to READY.
    pub fn vcpu_resume(&self, vcpu: &Arc<Vcpu>) -> Result<()> {
        self.place_for_wakeup(vcpu);
        let (cpu, mut rq) = self.lock_owner(vcpu);
        let ipi = match vcpu.state() {
            VcpuState::Paused => self.make_ready(cpu, &mut rq, vcpu),
            VcpuState::Ready | VcpuState::Running => false,
            VcpuState::Created => {
                return Err(Error::Invalid(format!("{} was never started", vcpu.name)))
            }
            VcpuState::Halted => return Err(Error::VcpuGone(vcpu.name.clone())),
        };
        drop(rq);
        self.send_ipi_if(cpu, ipi);
        Ok(())
    }

    /// Take `vcpu` off its run queue and leave it in `state`.
    fn deschedule(
        &self,
        vcpu: &Arc<Vcpu>,
        state: VcpuState,
        completion: Completion,
    ) -> Result<()> {
        let (cpu, mut rq) = self.lock_owner(vcpu);
        let now = self.now_ns();
        let mut s = vcpu.sched.lock().unwrap();
        let was = s.state;
        if was == VcpuState::Ready {
            rq.dequeue(vcpu);
        }
        s.parked = false;
        s.set_state(state, now);
        drop(s);

        let current = rq.is_current(vcpu);
        let ipi = if current {
            self.request_resched(cpu, &mut rq)
        } else {
            false
        };
        drop(rq);
        debug!("{}: {} -> {}", vcpu.name, was, state);
        self.send_ipi_if(cpu, ipi);

        if current && ipi && completion == Completion::Wait {
            self.wait_switched_out(cpu, vcpu)?;
        }
        Ok(())
    }

    fn wait_switched_out(&self, cpu: usize, vcpu: &Arc<Vcpu>) -> Result<()> {
        let hc = &self.cpus[cpu];
        let deadline = Instant::now() + self.pause_timeout;
        let mut rq = hc.rq.lock().unwrap();
        while rq.is_current(vcpu) {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!(
                    "{} to leave host CPU {}",
                    vcpu.name, cpu
                )));
            }
            rq = hc.wakeup.wait_timeout(rq, deadline - now).unwrap().0;
        }
        Ok(())
    }

    fn pause(&self, vcpu: &Arc<Vcpu>, completion: Completion) -> Result<()> {
        match vcpu.state() {
            VcpuState::Ready | VcpuState::Running => {
                self.deschedule(vcpu, VcpuState::Paused, completion)
            }
            VcpuState::Paused => {
                // An operator pause overrides a wait-for-interrupt park.
                let _rq = self.lock_owner(vcpu);
                vcpu.sched.lock().unwrap().parked = false;
                Ok(())
            }
            VcpuState::Created => Err(Error::Invalid(format!(
                "{} was never started",
                vcpu.name
            ))),
            VcpuState::Halted => Err(Error::VcpuGone(vcpu.name.clone())),
        }
    }

    /// READY or RUNNING to PAUSED. Waits for a remote CPU to switch away.
    pub fn vcpu_pause(&self, vcpu: &Arc<Vcpu>) -> Result<()> {
        self.pause(vcpu, Completion::Wait)
    }

    /// Pause requested from guest context; never waits.
    pub fn vcpu_pause_nowait(&self, vcpu: &Arc<Vcpu>) -> Result<()> {
        self.pause(vcpu, Completion::NoWait)
    }

    /// Any state to HALTED.
    pub fn vcpu_halt(&self, vcpu: &Arc<Vcpu>, wait: bool) -> Result<()> {
        if vcpu.state() == VcpuState::Halted {
            return Err(Error::VcpuGone(vcpu.name.clone()));
        }
        let completion = if wait {
            Completion::Wait
        } else {
            Completion::NoWait
        };
        self.deschedule(vcpu, VcpuState::Halted, completion)
    }

    /// Back to CREATED with the power-on register file. The only way out of
    /// HALTED.
    pub fn vcpu_reset(&self, vcpu: &Arc<Vcpu>, wait: bool) -> Result<()> {
        let completion = if wait {
            Completion::Wait
        } else {
            Completion::NoWait
        };
        self.deschedule(vcpu, VcpuState::Created, completion)?;
        vcpu.reset_registers();
        let _rq = self.lock_owner(vcpu);
        vcpu.sched.lock().unwrap().resets += 1;
        Ok(())
    }

    /// Restrict `vcpu` to `mask`, moving it when its host CPU is excluded.
    pub fn vcpu_set_affinity(&self, vcpu: &Arc<Vcpu>, mask: CpuMask) -> Result<()> {
        let mask = mask.and(self.all_cpus());
        if mask.is_empty() {
            return Err(Error::Invalid(format!("{}: empty affinity", vcpu.name)));
        }
        if !vcpu.is_normal() && vcpu.name.starts_with("idle/") {
            return Err(Error::Invalid(format!("{} is pinned", vcpu.name)));
        }
        vcpu.set_affinity_mask(mask);
        if mask.contains(vcpu.hcpu()) {
            return Ok(());
        }
        let (cpu, mut rq) = self.lock_owner(vcpu);
        if rq.is_current(vcpu) {
            // Moved by the run loop once switched out.
            let ipi = self.request_resched(cpu, &mut rq);
            drop(rq);
            self.send_ipi_if(cpu, ipi);
            return Ok(());
        }
        drop(rq);
        self.migrate(vcpu);
        Ok(())
    }

    /// Move a VCPU that is not current anywhere to the least loaded CPU of
    /// its affinity.
    fn migrate(&self, vcpu: &Arc<Vcpu>) {
        loop {
            let from = vcpu.hcpu();
            let affinity = vcpu.affinity();
            if affinity.contains(from) {
                return;
            }
            let Some(to) = affinity
                .iter()
                .min_by_key(|&c| self.cpus[c].load.load(Ordering::SeqCst))
            else {
                return;
            };

            let (lo, hi) = (from.min(to), from.max(to));
            let mut rq_lo = self.cpus[lo].rq.lock().unwrap();
            let mut rq_hi = self.cpus[hi].rq.lock().unwrap();
            if vcpu.hcpu() != from {
                continue;
            }
            let (src, dst) = if from == lo {
                (&mut *rq_lo, &mut *rq_hi)
            } else {
                (&mut *rq_hi, &mut *rq_lo)
            };
            if src.is_current(vcpu) {
                return;
            }
            let queued = src.dequeue(vcpu);
            vcpu.hcpu.store(to, Ordering::SeqCst);
            self.cpus[from].load.fetch_sub(1, Ordering::SeqCst);
            self.cpus[to].load.fetch_add(1, Ordering::SeqCst);
            let ipi = if queued {
                dst.ready[vcpu.priority as usize].push_back(vcpu.clone());
                self.cpus[to].wakeup.notify_all();
                dst.preempted_by(vcpu) && self.request_resched(to, dst)
            } else {
                false
            };
            drop(rq_hi);
            drop(rq_lo);
            debug!("{} migrated from host CPU {} to {}", vcpu.name, from, to);
            self.send_ipi_if(to, ipi);
            return;
        }
    }

    /// Priority of the work `cpu` is running; an idle CPU ranks below
    /// every VCPU.
    fn running_priority(&self, cpu: usize) -> i32 {
        let rq = self.cpus[cpu].rq.lock().unwrap();
        match &rq.current {
            Some(cur) if !rq.is_idle(cur) => i32::from(cur.priority),
            _ => -1,
        }
    }

    /// Before a CREATED or PAUSED VCPU becomes ready, move it to the CPU of
    /// its affinity running the lowest priority work. Its own CPU wins ties.
    fn place_for_wakeup(&self, vcpu: &Arc<Vcpu>) {
        if !matches!(vcpu.state(), VcpuState::Created | VcpuState::Paused) {
            return;
        }
        let from = vcpu.hcpu();
        let affinity = vcpu.affinity();
        let home = affinity
            .contains(from)
            .then(|| self.running_priority(from));
        let Some((to, rank)) = affinity
            .iter()
            .filter(|&c| c != from)
            .map(|c| (c, self.running_priority(c)))
            .min_by_key(|&(c, rank)| (rank, self.cpus[c].load.load(Ordering::SeqCst)))
        else {
            return;
        };
        if home.is_some_and(|home| home <= rank) {
            return;
        }

        let (lo, hi) = (from.min(to), from.max(to));
        let rq_lo = self.cpus[lo].rq.lock().unwrap();
        let rq_hi = self.cpus[hi].rq.lock().unwrap();
        let src = if from == lo { &*rq_lo } else { &*rq_hi };
        if vcpu.hcpu() != from
            || src.is_current(vcpu)
            || !matches!(vcpu.state(), VcpuState::Created | VcpuState::Paused)
        {
            return;
        }
        vcpu.hcpu.store(to, Ordering::SeqCst);
        self.cpus[from].load.fetch_sub(1, Ordering::SeqCst);
        self.cpus[to].load.fetch_add(1, Ordering::SeqCst);
        drop(rq_hi);
        drop(rq_lo);
        debug!("{} placed on host CPU {} (was {})", vcpu.name, to, from);
    }

    /// Called by the run loop after `prev` stopped running on `cpu`.
    pub fn rebalance(&self, cpu: usize, prev: &Arc<Vcpu>) {
        if prev.hcpu() == cpu && !prev.affinity().contains(cpu) {
            self.migrate(prev);
        }
    }

    /// Pick the next VCPU of `cpu` and make it current. A RUNNING current
    /// VCPU goes to the tail of its level.
    pub fn schedule(&self, cpu: usize) -> Arc<Vcpu> {
        let hc = &self.cpus[cpu];
        let now = self.now_ns();
        let mut rq = hc.rq.lock().unwrap();

        let prev = rq.current.take();
        if let Some(prev) = &prev {
            let mut s = prev.sched.lock().unwrap();
            if s.state == VcpuState::Running {
                s.set_state(VcpuState::Ready, now);
                drop(s);
                if !rq.is_idle(prev) {
                    rq.ready[prev.priority as usize].push_back(prev.clone());
                }
            }
        }

        let next = rq.pop_highest().unwrap_or_else(|| rq.idle.clone());
        {
            let mut s = next.sched.lock().unwrap();
            s.set_state(VcpuState::Running, now);
            if !prev.as_ref().is_some_and(|p| Arc::ptr_eq(p, &next)) {
                s.switches += 1;
            }
        }

        if let Some(token) = rq.slice_timer.take() {
            hc.timers.cancel(token);
        }
        let weak = self.weak_self.clone();
        let (token, _) = hc.timers.start(
            SCHED_TIMER_OWNER,
            now + next.time_slice_ns,
            Box::new(move || {
                if let Some(sched) = weak.upgrade() {
                    sched.slice_expired(cpu);
                }
            }),
        );
        rq.slice_timer = Some(token);
        rq.current = Some(next.clone());
        rq.resched = false;
        rq.yield_on_irq_exit = false;
        hc.wakeup.notify_all();
        drop(rq);

        if prev.as_ref().is_some_and(|p| !Arc::ptr_eq(p, &next)) {
            trace!("host CPU {}: switch to {}", cpu, next.name);
        }
        next
    }

    fn slice_expired(&self, cpu: usize) {
        let hc = &self.cpus[cpu];
        let mut rq = hc.rq.lock().unwrap();
        rq.slice_timer = None;
        let ipi = self.request_resched(cpu, &mut rq);
        drop(rq);
        self.send_ipi_if(cpu, ipi);
    }

    /// Run loop exit: the current VCPU stops running.
    pub fn deschedule_current(&self, cpu: usize) {
        let hc = &self.cpus[cpu];
        let now = self.now_ns();
        let mut rq = hc.rq.lock().unwrap();
        if let Some(prev) = rq.current.take() {
            let mut s = prev.sched.lock().unwrap();
            if s.state == VcpuState::Running {
                s.set_state(VcpuState::Ready, now);
                drop(s);
                if !rq.is_idle(&prev) {
                    rq.ready[prev.priority as usize].push_front(prev.clone());
                }
            }
        }
        if let Some(token) = rq.slice_timer.take() {
            hc.timers.cancel(token);
        }
        hc.wakeup.notify_all();
    }

    /// Whether the run loop of `cpu` must stop running `vcpu`.
    pub fn need_resched(&self, cpu: usize, vcpu: &Arc<Vcpu>) -> bool {
        if self.is_stopping() {
            return true;
        }
        let rq = self.cpus[cpu].rq.lock().unwrap();
        rq.resched || !rq.is_current(vcpu) || vcpu.state() != VcpuState::Running
    }

    /// The current VCPU of `cpu` gives up the rest of its slice.
    pub fn yield_current(&self, cpu: usize) {
        let mut rq = self.cpus[cpu].rq.lock().unwrap();
        let ipi = self.request_resched(cpu, &mut rq);
        drop(rq);
        self.send_ipi_if(cpu, ipi);
    }

    /// Yield on behalf of a guest VCPU, from its own trap context.
    pub fn vcpu_yield(&self, vcpu: &Arc<Vcpu>) {
        self.yield_current(vcpu.hcpu());
    }

    pub fn preempt_disable(&self, cpu: usize) {
        self.cpus[cpu].rq.lock().unwrap().preempt_count += 1;
    }

    pub fn preempt_enable(&self, cpu: usize) {
        let mut rq = self.cpus[cpu].rq.lock().unwrap();
        rq.preempt_count = rq.preempt_count.saturating_sub(1);
        if rq.preempt_count == 0 && rq.deferred {
            rq.deferred = false;
            rq.resched = true;
        }
    }

    pub fn irq_enter(&self, cpu: usize) {
        self.cpus[cpu].rq.lock().unwrap().irq_context = true;
    }

    /// Apply reschedule requests raised while in IRQ context.
    pub fn irq_exit(&self, cpu: usize) {
        let mut rq = self.cpus[cpu].rq.lock().unwrap();
        rq.irq_context = false;
        let current_running = rq
            .current
            .as_ref()
            .is_some_and(|c| c.state() == VcpuState::Running);
        if rq.yield_on_irq_exit || !current_running {
            rq.yield_on_irq_exit = false;
            if rq.preempt_count > 0 {
                rq.deferred = true;
            } else {
                rq.resched = true;
            }
        }
    }

    /// Idle until a VCPU is ready, a reschedule is requested, an IPI
    /// arrives or the next timer event is due.
    pub fn idle_wait(&self, cpu: usize) {
        let hc = &self.cpus[cpu];
        let now = self.now_ns();
        let tick_deadline = now + self.tick.as_nanos() as u64;
        let deadline = hc
            .timers
            .next_deadline()
            .map_or(tick_deadline, |d| d.min(tick_deadline));
        let rq = hc.rq.lock().unwrap();
        if rq.resched || rq.nr_ready() > 0 || self.is_stopping() {
            return;
        }
        let timeout = Duration::from_nanos(deadline.saturating_sub(now));
        let _ = hc.wakeup.wait_timeout(rq, timeout).unwrap();
    }

    /// Park a RUNNING VCPU until one of its vIRQ inputs is asserted. Returns
    /// whether it parked.
    pub fn vcpu_park(&self, vcpu: &Arc<Vcpu>) -> bool {
        let Some(virq) = vcpu.virq() else {
            return false;
        };
        let (cpu, mut rq) = self.lock_owner(vcpu);
        let mut s = vcpu.sched.lock().unwrap();
        if s.state != VcpuState::Running || virq.any_asserted() {
            return false;
        }
        s.set_state(VcpuState::Paused, self.now_ns());
        s.parked = true;
        drop(s);
        let ipi = rq.is_current(vcpu) && self.request_resched(cpu, &mut rq);
        drop(rq);
        self.send_ipi_if(cpu, ipi);
        trace!("{} parked", vcpu.name);
        true
    }

    /// A vIRQ input of `vcpu` was asserted: unpark it, or make a remote
    /// running VCPU re-enter the guest.
    pub fn virq_notify(&self, vcpu: &Arc<Vcpu>) {
        let (cpu, mut rq) = self.lock_owner(vcpu);
        let (state, parked) = {
            let s = vcpu.sched.lock().unwrap();
            (s.state, s.parked)
        };
        let ipi = match state {
            VcpuState::Paused if parked => self.make_ready(cpu, &mut rq, vcpu),
            VcpuState::Running => rq.is_current(vcpu) && self.hal.current_cpu() != Some(cpu),
            _ => false,
        };
        drop(rq);
        self.send_ipi_if(cpu, ipi);
    }

    /// VCPUs in state RUNNING, by host CPU. Holds every run queue so the
    /// snapshot is consistent.
    pub fn running(&self) -> Vec<Vec<String>> {
        let _rqs: Vec<_> = self.cpus.iter().map(|hc| hc.rq.lock().unwrap()).collect();
        let mut out = vec![Vec::new(); self.cpus.len()];
        for vcpu in self.vcpus.read().unwrap().values() {
            if vcpu.state() == VcpuState::Running {
                out[vcpu.hcpu()].push(vcpu.name.clone());
            }
        }
        out
    }
}
