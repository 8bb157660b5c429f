// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Hosted HAL: every host CPU is a host thread.
//!
//! Guest execution is delegated to a [`GuestExecutor`]. Between two
//! executor steps the HAL checks for pending IPIs and for the end of the
//! host timer period, which turn into `VmExit::Ipi` and `VmExit::Irq`.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::arch::ArchVcpu;
use crate::cpu::{AccessKind, VmExit};
use crate::hal::{CpuMask, GuestExecutor, Hal, HalError, IpiHandler};

const DEFAULT_TICK: Duration = Duration::from_millis(2);

thread_local! {
    static CURRENT_CPU: Cell<Option<usize>> = const { Cell::new(None) };
}

/// One recorded stage-2 TLB invalidation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbFlush {
    pub cpus: CpuMask,
    pub vmid: u32,
    pub ipa: Option<u64>,
}

struct HostCpuSlot {
    ipi_pending: AtomicBool,
    ipi_count: AtomicU64,
    lock: Mutex<()>,
    wakeup: Condvar,
}

pub struct SoftHal {
    epoch: Instant,
    tick: Duration,
    cpus: Vec<HostCpuSlot>,
    ipi_handler: RwLock<Option<Arc<dyn IpiHandler>>>,
    executor: RwLock<Option<Arc<dyn GuestExecutor>>>,
    tlb_flushes: Mutex<Vec<TlbFlush>>,
}

impl SoftHal {
    pub fn new(cpu_count: usize) -> Self {
        Self::with_tick(cpu_count, DEFAULT_TICK)
    }

    /// `tick` is the host timer period after which a running guest exits
    /// with `VmExit::Irq`.
    pub fn with_tick(cpu_count: usize, tick: Duration) -> Self {
        let cpus = (0..cpu_count.max(1))
            .map(|_| HostCpuSlot {
                ipi_pending: AtomicBool::new(false),
                ipi_count: AtomicU64::new(0),
                lock: Mutex::new(()),
                wakeup: Condvar::new(),
            })
            .collect();

        SoftHal {
            epoch: Instant::now(),
            tick,
            cpus,
            ipi_handler: RwLock::new(None),
            executor: RwLock::new(None),
            tlb_flushes: Mutex::new(Vec::new()),
        }
    }

    pub fn set_executor(&self, executor: Arc<dyn GuestExecutor>) {
        *self.executor.write().unwrap() = Some(executor);
    }

    /// Mark the calling thread as host CPU `cpu`.
    pub fn bind_current_thread(cpu: Option<usize>) {
        CURRENT_CPU.with(|c| c.set(cpu));
    }

    pub fn tlb_flushes(&self) -> Vec<TlbFlush> {
        self.tlb_flushes.lock().unwrap().clone()
    }

    pub fn ipi_count(&self, cpu: usize) -> u64 {
        self.cpus
            .get(cpu)
            .map(|c| c.ipi_count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn wait_for_ipi(&self, cpu: usize, timeout: Duration) {
        let slot = &self.cpus[cpu];
        let guard = slot.lock.lock().unwrap();
        if !slot.ipi_pending.load(Ordering::SeqCst) {
            let _ = slot.wakeup.wait_timeout(guard, timeout).unwrap();
        }
    }
}

impl Hal for SoftHal {
    fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn current_cpu(&self) -> Option<usize> {
        CURRENT_CPU.with(|c| c.get())
    }

    fn bind_current_cpu(&self, cpu: Option<usize>) {
        SoftHal::bind_current_thread(cpu);
    }

    fn send_ipi(&self, cpu: usize) {
        let Some(slot) = self.cpus.get(cpu) else {
            warn!("IPI to non-existent host CPU {}", cpu);
            return;
        };
        {
            let _guard = slot.lock.lock().unwrap();
            slot.ipi_pending.store(true, Ordering::SeqCst);
            slot.ipi_count.fetch_add(1, Ordering::SeqCst);
            slot.wakeup.notify_all();
        }
        let handler = self.ipi_handler.read().unwrap().clone();
        if let Some(handler) = handler {
            handler.handle_ipi(cpu);
        }
    }

    fn take_ipi(&self, cpu: usize) -> bool {
        self.cpus
            .get(cpu)
            .map(|c| c.ipi_pending.swap(false, Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn set_ipi_handler(&self, handler: Arc<dyn IpiHandler>) {
        *self.ipi_handler.write().unwrap() = Some(handler);
    }

    fn flush_stage2_tlb(&self, cpus: CpuMask, vmid: u32, ipa: Option<u64>) {
        debug!(
            "stage-2 TLB flush vmid {} cpus {:?} ipa {:x?}",
            vmid, cpus, ipa
        );
        self.memory_barrier();
        self.tlb_flushes
            .lock()
            .unwrap()
            .push(TlbFlush { cpus, vmid, ipa });
    }

    fn monotonic_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn run_vcpu(
        &self,
        cpu: usize,
        vcpu: usize,
        state: &Mutex<ArchVcpu>,
    ) -> Result<VmExit, HalError> {
        if cpu >= self.cpus.len() {
            return Err(HalError::InvalidCpu(cpu));
        }

        let start = Instant::now();
        loop {
            if self.take_ipi(cpu) {
                return Ok(VmExit::Ipi);
            }
            let elapsed = start.elapsed();
            if elapsed >= self.tick {
                return Ok(VmExit::Irq);
            }

            let executor = self.executor.read().unwrap().clone();
            match executor {
                Some(executor) => {
                    let mut state = state.lock().unwrap();
                    if let Some(exit) = executor.step(cpu, vcpu, &mut state) {
                        return Ok(exit);
                    }
                }
                None => self.wait_for_ipi(cpu, self.tick - elapsed),
            }
        }
    }

    fn translate_guest_va(
        &self,
        state: &ArchVcpu,
        va: u64,
        _access: AccessKind,
    ) -> Result<u64, HalError> {
        // Only the flat (MMU off) guest view is modelled.
        if state.mmu_enabled() {
            Err(HalError::Translation(va))
        } else {
            Ok(va)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;

    struct StepCounter;

    impl GuestExecutor for StepCounter {
        fn step(&self, _cpu: usize, _vcpu: usize, state: &mut ArchVcpu) -> Option<VmExit> {
            let pc = state.pc();
            state.set_pc(pc + 4);
            std::thread::sleep(Duration::from_micros(100));
            None
        }
    }

    #[test]
    fn ipi_interrupts_guest() {
        let hal = Arc::new(SoftHal::with_tick(2, Duration::from_secs(5)));
        hal.set_executor(Arc::new(StepCounter));
        let state = Arc::new(Mutex::new(ArchVcpu::new(Arch::Arm32, 0, 0x1000)));

        let h = hal.clone();
        let s = state.clone();
        let runner = std::thread::spawn(move || h.run_vcpu(1, 0, &s).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        hal.send_ipi(1);
        assert_eq!(runner.join().unwrap(), VmExit::Ipi);
        assert!(state.lock().unwrap().pc() > 0x1000);
        assert_eq!(hal.ipi_count(1), 1);
    }

    #[test]
    fn tick_expires_without_executor() {
        let hal = SoftHal::with_tick(1, Duration::from_millis(1));
        let state = Mutex::new(ArchVcpu::new(Arch::Aarch64, 0, 0));
        assert_eq!(hal.run_vcpu(0, 0, &state).unwrap(), VmExit::Irq);
        assert!(hal.run_vcpu(3, 0, &state).is_err());
    }

    #[test]
    fn flat_translation() {
        let hal = SoftHal::new(1);
        let state = ArchVcpu::new(Arch::Arm32, 0, 0);
        assert_eq!(
            hal.translate_guest_va(&state, 0x4000_0010, AccessKind::Read)
                .unwrap(),
            0x4000_0010
        );
        hal.flush_stage2_tlb(CpuMask::single(0), 3, Some(0x1000));
        assert_eq!(hal.tlb_flushes()[0].vmid, 3);
    }
}
