// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Queue plumbing shared by the device models: an activated queue with its
//! memory and interrupt, and a buffer of host data waiting for the driver to
//! supply receive buffers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use vm_device::GuestMemoryAccess;
use vm_virtio::{DescriptorChain, Queue, QueueError, VirtioInterrupt, VirtioInterruptType};

pub(crate) struct ActiveQueue {
    pub index: u16,
    pub queue: Queue,
    pub mem: Arc<dyn GuestMemoryAccess>,
    pub interrupt: Arc<dyn VirtioInterrupt>,
}

impl ActiveQueue {
    pub fn new(
        index: u16,
        queue: Queue,
        mem: Arc<dyn GuestMemoryAccess>,
        interrupt: Arc<dyn VirtioInterrupt>,
    ) -> Self {
        ActiveQueue {
            index,
            queue,
            mem,
            interrupt,
        }
    }

    pub fn pop(&mut self) -> Result<Option<DescriptorChain>, QueueError> {
        self.queue.pop(self.mem.as_ref())
    }

    pub fn add_used(&mut self, head: u16, len: u32) -> Result<(), QueueError> {
        self.queue.add_used(self.mem.as_ref(), head, len)
    }

    /// Interrupts the driver unless it asked not to be.
    pub fn signal_used_queue(&self) {
        match self.queue.needs_notification(self.mem.as_ref()) {
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => warn!("queue {}: cannot read avail flags: {}", self.index, e),
        }
        if let Err(e) = self
            .interrupt
            .trigger(VirtioInterruptType::Queue(self.index))
        {
            error!("Failed to signal used queue {}: {}", self.index, e);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// One message per chain; messages that do not fit are dropped.
    Datagram,
    /// A byte stream split over as many chains as needed.
    Stream,
}

struct InboxState {
    pending: VecDeque<Vec<u8>>,
    active: Option<ActiveQueue>,
}

/// Host to guest queue with its backlog. It has its own lock so that host
/// producers never take the emulator lock of the device.
pub(crate) struct Inbox {
    name: String,
    framing: Framing,
    capacity: usize,
    state: Mutex<InboxState>,
}

impl Inbox {
    pub fn new(name: String, framing: Framing, capacity: usize) -> Arc<Self> {
        Arc::new(Inbox {
            name,
            framing,
            capacity,
            state: Mutex::new(InboxState {
                pending: VecDeque::new(),
                active: None,
            }),
        })
    }

    /// Queues `data` for the guest. Returns false when the backlog is full
    /// and the data was dropped.
    pub fn push(&self, data: Vec<u8>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.pending.len() >= self.capacity {
            warn!("{}: receive backlog full, dropping {} bytes", self.name, data.len());
            return false;
        }
        state.pending.push_back(data);
        self.flush_locked(&mut state);
        true
    }

    pub fn activate(&self, active: ActiveQueue) {
        let mut state = self.state.lock().unwrap();
        state.active = Some(active);
        self.flush_locked(&mut state);
    }

    pub fn deactivate(&self, drop_pending: bool) {
        let mut state = self.state.lock().unwrap();
        state.active = None;
        if drop_pending {
            state.pending.clear();
        }
    }

    /// The driver made receive buffers available.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        self.flush_locked(&mut state);
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    fn flush_locked(&self, state: &mut InboxState) {
        let InboxState { pending, active } = state;
        let Some(active) = active.as_mut() else {
            return;
        };

        let mut used = false;
        while let Some(message) = pending.front_mut() {
            let chain = match active.pop() {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(e) => {
                    error!("{}: cannot pop receive buffer: {}", self.name, e);
                    break;
                }
            };

            let written = match self.framing {
                Framing::Datagram if chain.writable_len() < message.len() => {
                    warn!(
                        "{}: {} byte message does not fit a {} byte buffer",
                        self.name,
                        message.len(),
                        chain.writable_len()
                    );
                    pending.pop_front();
                    0
                }
                _ => match chain.write_all(active.mem.as_ref(), message) {
                    Ok(written) => {
                        if self.framing == Framing::Stream && written < message.len() {
                            message.drain(..written);
                        } else {
                            pending.pop_front();
                        }
                        written
                    }
                    Err(e) => {
                        error!("{}: cannot write receive buffer: {}", self.name, e);
                        pending.pop_front();
                        0
                    }
                },
            };

            if let Err(e) = active.add_used(chain.head, written as u32) {
                error!("{}: cannot return receive buffer: {}", self.name, e);
                break;
            }
            used = true;
        }

        if used {
            active.signal_used_queue();
        }
    }
}
