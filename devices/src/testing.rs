// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Test doubles for the interrupt and timer seams.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hypervisor::VirqKind;
use vm_device::{
    GuestTimerService, IrqChip, IrqError, TimerCallback, TimerToken, VcpuIrqSink,
};

#[derive(Default)]
pub struct ChipRecorder(Mutex<Vec<(u32, bool)>>);

impl ChipRecorder {
    pub fn events(&self) -> Vec<(u32, bool)> {
        self.0.lock().unwrap().clone()
    }
}

impl IrqChip for ChipRecorder {
    fn handle(&self, line: u32, _cpu_hint: Option<usize>, level: bool) -> Result<(), IrqError> {
        self.0.lock().unwrap().push((line, level));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Records the lines held on each VCPU input.
pub struct RecordingSink {
    vcpus: usize,
    lines: Mutex<HashMap<(usize, VirqKind), Vec<u32>>>,
    pub eois: Mutex<Vec<u32>>,
}

impl RecordingSink {
    pub fn new(vcpus: usize) -> Arc<Self> {
        Arc::new(RecordingSink {
            vcpus,
            lines: Mutex::new(HashMap::new()),
            eois: Mutex::new(Vec::new()),
        })
    }

    pub fn lines(&self, vcpu: usize, kind: VirqKind) -> Vec<u32> {
        self.lines
            .lock()
            .unwrap()
            .get(&(vcpu, kind))
            .cloned()
            .unwrap_or_default()
    }

    pub fn eois(&self) -> Vec<u32> {
        self.eois.lock().unwrap().clone()
    }
}

impl VcpuIrqSink for RecordingSink {
    fn vcpu_count(&self) -> usize {
        self.vcpus
    }

    fn set_virq(&self, vcpu: usize, line: u32, kind: VirqKind, level: bool) {
        let mut lines = self.lines.lock().unwrap();
        let held = lines.entry((vcpu, kind)).or_default();
        held.retain(|l| *l != line);
        if level {
            held.push(line);
        }
    }

    fn virq_eoi(&self, line: u32) {
        self.eois.lock().unwrap().push(line);
    }
}

/// Timer service with a clock advanced by hand.
#[derive(Default)]
pub struct ManualTimers {
    now: AtomicU64,
    next: AtomicU64,
    armed: Mutex<BTreeMap<TimerToken, (u64, TimerCallback)>>,
}

impl ManualTimers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn armed(&self) -> Vec<u64> {
        self.armed.lock().unwrap().values().map(|(d, _)| *d).collect()
    }

    /// Move the clock to `now` and run every expired callback.
    pub fn advance_to(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
        let expired: Vec<TimerCallback> = {
            let mut armed = self.armed.lock().unwrap();
            let tokens: Vec<TimerToken> = armed
                .iter()
                .filter(|(_, (d, _))| *d <= now)
                .map(|(t, _)| *t)
                .collect();
            tokens
                .into_iter()
                .filter_map(|t| armed.remove(&t).map(|(_, cb)| cb))
                .collect()
        };
        for cb in expired {
            cb();
        }
    }
}

impl GuestTimerService for ManualTimers {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn start(&self, deadline_ns: u64, callback: TimerCallback) -> TimerToken {
        let token = TimerToken(self.next.fetch_add(1, Ordering::SeqCst));
        self.armed
            .lock()
            .unwrap()
            .insert(token, (deadline_ns, callback));
        token
    }

    fn cancel(&self, token: TimerToken) -> bool {
        self.armed.lock().unwrap().remove(&token).is_some()
    }
}
