// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Split virtqueue walker.
//!
//! The rings live in guest RAM and are only reached through
//! [`GuestMemoryAccess`], the same way a device doing DMA would.

use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};

use thiserror::Error;
use virtio_bindings::virtio_ring::{
    VRING_AVAIL_F_NO_INTERRUPT, VRING_DESC_F_INDIRECT, VRING_DESC_F_NEXT, VRING_DESC_F_WRITE,
};
use vm_device::{GuestMemoryAccess, GuestMemoryExt, MemoryAccessError};

pub const DESCRIPTOR_SIZE: u64 = 16;
const USED_ELEMENT_SIZE: u64 = 8;
const RING_HEADER_SIZE: u64 = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Guest memory access failed: {0}")]
    Memory(#[from] MemoryAccessError),
    #[error("Queue is not ready")]
    NotReady,
    #[error("Descriptor index {0} out of range")]
    InvalidIndex(u16),
    #[error("Available index moved by {0} entries, more than the queue holds")]
    InvalidAvailIdx(u16),
    #[error("Descriptor chain is looping or too long")]
    ChainTooLong,
    #[error("Invalid indirect descriptor table")]
    InvalidIndirect,
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// One entry of a descriptor table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    fn load(mem: &dyn GuestMemoryAccess, addr: u64) -> Result<Self> {
        let mut raw = [0u8; DESCRIPTOR_SIZE as usize];
        mem.read(addr, &mut raw)?;
        Ok(Descriptor {
            addr: u64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]),
            len: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            flags: u16::from_le_bytes([raw[12], raw[13]]),
            next: u16::from_le_bytes([raw[14], raw[15]]),
        })
    }

    pub fn has_next(&self) -> bool {
        self.flags & VRING_DESC_F_NEXT as u16 != 0
    }

    /// Device writable.
    pub fn is_write_only(&self) -> bool {
        self.flags & VRING_DESC_F_WRITE as u16 != 0
    }

    pub fn is_indirect(&self) -> bool {
        self.flags & VRING_DESC_F_INDIRECT as u16 != 0
    }
}

/// A descriptor chain taken off the available ring, with indirect tables
/// already flattened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorChain {
    /// Index of the head descriptor, returned through the used ring.
    pub head: u16,
    pub descriptors: Vec<Descriptor>,
}

impl DescriptorChain {
    pub fn readable(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(|d| !d.is_write_only())
    }

    pub fn writable(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(|d| d.is_write_only())
    }

    pub fn writable_len(&self) -> usize {
        self.writable().map(|d| d.len as usize).sum()
    }

    /// Gathers every driver-written buffer of the chain.
    pub fn read_all(&self, mem: &dyn GuestMemoryAccess) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for desc in self.readable() {
            let start = out.len();
            out.resize(start + desc.len as usize, 0);
            mem.read(desc.addr, &mut out[start..])?;
        }
        Ok(out)
    }

    /// Scatters `data` over the device writable buffers. Returns the
    /// number of bytes written, which is short when the buffers are.
    pub fn write_all(&self, mem: &dyn GuestMemoryAccess, mut data: &[u8]) -> Result<usize> {
        let mut written = 0;
        for desc in self.writable() {
            if data.is_empty() {
                break;
            }
            let count = data.len().min(desc.len as usize);
            mem.write(desc.addr, &data[..count])?;
            data = &data[count..];
            written += count;
        }
        Ok(written)
    }
}

/// Driver programmed state of one split virtqueue plus the device side
/// ring positions.
#[derive(Clone, Debug)]
pub struct Queue {
    max_size: u16,
    /// Queue size chosen by the driver.
    pub size: u16,
    pub ready: bool,
    pub desc_table: u64,
    pub avail_ring: u64,
    pub used_ring: u64,
    /// Legacy page frame number the rings were derived from.
    pub pfn: u32,
    next_avail: Wrapping<u16>,
    next_used: Wrapping<u16>,
}

impl Queue {
    pub fn new(max_size: u16) -> Self {
        Queue {
            max_size,
            size: max_size,
            ready: false,
            desc_table: 0,
            avail_ring: 0,
            used_ring: 0,
            pfn: 0,
            next_avail: Wrapping(0),
            next_used: Wrapping(0),
        }
    }

    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    /// Forgets the driver configuration.
    pub fn reset(&mut self) {
        *self = Queue::new(self.max_size);
    }

    /// Legacy layout: the three parts sit contiguously from `pfn`, the used
    /// ring aligned to `align`. A zero `pfn` releases the queue.
    pub fn set_legacy_pfn(&mut self, pfn: u32, page_size: u32, align: u32) {
        self.pfn = pfn;
        if pfn == 0 {
            self.ready = false;
            return;
        }

        let size = u64::from(self.size);
        let align = u64::from(align.max(1));
        self.desc_table = u64::from(pfn) * u64::from(page_size);
        self.avail_ring = self.desc_table + DESCRIPTOR_SIZE * size;
        let avail_end = self.avail_ring + RING_HEADER_SIZE + 2 * size + 2;
        self.used_ring = avail_end.div_ceil(align) * align;
        self.ready = true;
    }

    pub fn is_valid(&self) -> bool {
        if !self.ready {
            return false;
        }
        if self.size == 0 || self.size > self.max_size || !self.size.is_power_of_two() {
            error!(
                "virtio queue with invalid size: {} (max {})",
                self.size, self.max_size
            );
            return false;
        }
        if self.desc_table & 0xf != 0 || self.avail_ring & 0x1 != 0 || self.used_ring & 0x3 != 0
        {
            error!("virtio queue rings are misaligned");
            return false;
        }
        true
    }

    fn avail_idx(&self, mem: &dyn GuestMemoryAccess) -> Result<Wrapping<u16>> {
        let idx = mem.read_u16(self.avail_ring + 2)?;
        fence(Ordering::Acquire);
        Ok(Wrapping(idx))
    }

    /// Whether the driver made buffers available that are not consumed yet.
    pub fn has_available(&self, mem: &dyn GuestMemoryAccess) -> Result<bool> {
        if !self.ready {
            return Ok(false);
        }
        Ok(self.avail_idx(mem)? != self.next_avail)
    }

    /// Takes the next available chain.
    pub fn pop(&mut self, mem: &dyn GuestMemoryAccess) -> Result<Option<DescriptorChain>> {
        if !self.ready {
            return Err(QueueError::NotReady);
        }

        let avail_idx = self.avail_idx(mem)?;
        let pending = (avail_idx - self.next_avail).0;
        if pending == 0 {
            return Ok(None);
        }
        if pending > self.size {
            return Err(QueueError::InvalidAvailIdx(pending));
        }

        let slot = u64::from(self.next_avail.0 % self.size);
        let head = mem.read_u16(self.avail_ring + RING_HEADER_SIZE + 2 * slot)?;
        self.next_avail += Wrapping(1);

        let descriptors = self.walk(mem, head)?;
        Ok(Some(DescriptorChain { head, descriptors }))
    }

    /// Puts the most recently popped chain back.
    pub fn undo_pop(&mut self) {
        self.next_avail -= Wrapping(1);
    }

    fn walk(&self, mem: &dyn GuestMemoryAccess, head: u16) -> Result<Vec<Descriptor>> {
        let mut chain = Vec::new();
        let mut table = self.desc_table;
        let mut table_size = self.size;
        let mut index = head;
        let mut indirect = false;
        let mut ttl = self.size;

        loop {
            if index >= table_size {
                return Err(QueueError::InvalidIndex(index));
            }
            let desc = Descriptor::load(mem, table + DESCRIPTOR_SIZE * u64::from(index))?;

            if desc.is_indirect() {
                // Only one level, and not mixed with direct descriptors.
                if indirect || desc.has_next() || desc.len == 0 {
                    return Err(QueueError::InvalidIndirect);
                }
                if u64::from(desc.len) % DESCRIPTOR_SIZE != 0 {
                    return Err(QueueError::InvalidIndirect);
                }
                let count = u64::from(desc.len) / DESCRIPTOR_SIZE;
                table_size = u16::try_from(count).map_err(|_| QueueError::InvalidIndirect)?;
                table = desc.addr;
                ttl = table_size;
                index = 0;
                indirect = true;
                continue;
            }

            chain.push(desc);
            if !desc.has_next() {
                return Ok(chain);
            }
            ttl = ttl.checked_sub(1).ok_or(QueueError::ChainTooLong)?;
            if ttl == 0 {
                return Err(QueueError::ChainTooLong);
            }
            index = desc.next;
        }
    }

    /// Returns chain `head` to the driver with `len` bytes written.
    pub fn add_used(&mut self, mem: &dyn GuestMemoryAccess, head: u16, len: u32) -> Result<()> {
        if head >= self.size {
            return Err(QueueError::InvalidIndex(head));
        }

        let slot = u64::from(self.next_used.0 % self.size);
        let elem = self.used_ring + RING_HEADER_SIZE + USED_ELEMENT_SIZE * slot;
        mem.write_u32(elem, u32::from(head))?;
        mem.write_u32(elem + 4, len)?;
        self.next_used += Wrapping(1);

        // The element must be visible before the index that publishes it.
        fence(Ordering::Release);
        mem.write_u16(self.used_ring + 2, self.next_used.0)?;
        Ok(())
    }

    /// Whether the driver wants an interrupt for used buffers.
    pub fn needs_notification(&self, mem: &dyn GuestMemoryAccess) -> Result<bool> {
        fence(Ordering::SeqCst);
        let flags = mem.read_u16(self.avail_ring)?;
        Ok(flags & VRING_AVAIL_F_NO_INTERRUPT as u16 == 0)
    }

    pub fn next_avail(&self) -> u16 {
        self.next_avail.0
    }

    pub fn next_used(&self) -> u16 {
        self.next_used.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestQueue, VecMemory};
    use virtio_bindings::virtio_ring::{VRING_DESC_F_NEXT, VRING_DESC_F_WRITE};

    const NEXT: u16 = VRING_DESC_F_NEXT as u16;
    const WRITE: u16 = VRING_DESC_F_WRITE as u16;

    #[test]
    fn chains_and_used_ring() {
        let mem = VecMemory::new(0x1000, 0x10000);
        let vq = TestQueue::new(&mem, 0x1000, 8);
        let mut queue = vq.queue();
        assert!(queue.is_valid());
        assert!(queue.pop(&mem).unwrap().is_none());

        let head = vq.add_chain(&[(0x8000, 16, 0), (0x9000, 512, WRITE), (0xa000, 1, WRITE)]);
        assert!(queue.has_available(&mem).unwrap());
        let chain = queue.pop(&mem).unwrap().unwrap();
        assert_eq!(chain.head, head);
        assert_eq!(chain.descriptors.len(), 3);
        assert_eq!(chain.readable().count(), 1);
        assert_eq!(chain.writable_len(), 513);
        assert!(queue.pop(&mem).unwrap().is_none());

        queue.add_used(&mem, chain.head, 513).unwrap();
        assert_eq!(vq.used(), vec![(u32::from(head), 513)]);
        assert!(queue.needs_notification(&mem).unwrap());
        vq.suppress_interrupts(true);
        assert!(!queue.needs_notification(&mem).unwrap());
    }

    #[test]
    fn scatter_gather() {
        let mem = VecMemory::new(0x1000, 0x10000);
        let vq = TestQueue::new(&mem, 0x1000, 4);
        let mut queue = vq.queue();

        mem.write(0x8000, b"hello ").unwrap();
        mem.write(0x8100, b"world").unwrap();
        vq.add_chain(&[(0x8000, 6, 0), (0x8100, 5, 0), (0x9000, 4, WRITE), (0x9100, 4, WRITE)]);
        let chain = queue.pop(&mem).unwrap().unwrap();
        assert_eq!(chain.read_all(&mem).unwrap(), b"hello world");
        assert_eq!(chain.write_all(&mem, b"0123456789").unwrap(), 8);
        let mut out = [0u8; 4];
        mem.read(0x9100, &mut out).unwrap();
        assert_eq!(&out, b"4567");
    }

    #[test]
    fn indirect_tables() {
        let mem = VecMemory::new(0x1000, 0x10000);
        let vq = TestQueue::new(&mem, 0x1000, 4);
        let mut queue = vq.queue();

        vq.write_descriptor(0x6000, 0, (0x8000, 16, NEXT, 1));
        vq.write_descriptor(0x6000, 1, (0x9000, 64, WRITE, 0));
        vq.add_chain(&[(0x6000, 32, VRING_DESC_F_INDIRECT as u16)]);
        let chain = queue.pop(&mem).unwrap().unwrap();
        assert_eq!(chain.descriptors.len(), 2);
        assert_eq!(chain.descriptors[1].addr, 0x9000);

        // Nested indirection is rejected.
        vq.write_descriptor(0x6000, 0, (0x6000, 32, VRING_DESC_F_INDIRECT as u16, 0));
        vq.add_chain(&[(0x6000, 32, VRING_DESC_F_INDIRECT as u16)]);
        assert_eq!(queue.pop(&mem), Err(QueueError::InvalidIndirect));
    }

    #[test]
    fn malformed_chains() {
        let mem = VecMemory::new(0x1000, 0x10000);
        let vq = TestQueue::new(&mem, 0x1000, 4);
        let mut queue = vq.queue();

        // Descriptor 0 points to itself.
        let head = vq.add_chain(&[(0x8000, 16, NEXT)]);
        vq.write_descriptor(0x1000, head, (0x8000, 16, NEXT, head));
        assert_eq!(queue.pop(&mem), Err(QueueError::ChainTooLong));

        vq.write_descriptor(0x1000, 1, (0x8000, 16, NEXT, 9));
        vq.publish(1);
        assert_eq!(queue.pop(&mem), Err(QueueError::InvalidIndex(9)));

        queue.ready = false;
        assert_eq!(queue.pop(&mem), Err(QueueError::NotReady));
    }

    #[test]
    fn pop_can_be_undone() {
        let mem = VecMemory::new(0x1000, 0x10000);
        let vq = TestQueue::new(&mem, 0x1000, 4);
        let mut queue = vq.queue();
        let head = vq.add_chain(&[(0x8000, 16, 0)]);
        assert_eq!(queue.pop(&mem).unwrap().unwrap().head, head);
        queue.undo_pop();
        assert_eq!(queue.pop(&mem).unwrap().unwrap().head, head);
        assert_eq!(queue.next_avail(), 1);
    }

    #[test]
    fn legacy_layout() {
        let mut queue = Queue::new(256);
        queue.size = 16;
        queue.set_legacy_pfn(0x40, 4096, 4096);
        assert_eq!(queue.desc_table, 0x40000);
        assert_eq!(queue.avail_ring, 0x40100);
        assert_eq!(queue.used_ring, 0x41000);
        assert!(queue.is_valid());

        queue.set_legacy_pfn(0, 4096, 4096);
        assert!(!queue.is_valid());

        queue.size = 12;
        queue.set_legacy_pfn(0x40, 4096, 4096);
        assert!(!queue.is_valid());
    }
}
