// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Helpers laying out virtqueues in a flat test memory, standing in for a
//! guest driver.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

use vm_device::{GuestMemoryAccess, GuestMemoryExt, MemoryAccessError};

use crate::queue::{Queue, DESCRIPTOR_SIZE};

/// Guest RAM made of one contiguous buffer starting at `base`.
pub struct VecMemory {
    base: u64,
    bytes: Mutex<Vec<u8>>,
}

impl VecMemory {
    pub fn new(base: u64, size: usize) -> Self {
        VecMemory {
            base,
            bytes: Mutex::new(vec![0; size]),
        }
    }

    fn range(&self, gpa: u64, len: usize) -> Result<std::ops::Range<usize>, MemoryAccessError> {
        let size = self.bytes.lock().unwrap().len() as u64;
        let bad = MemoryAccessError::BadGuestAccess { gpa, len };
        let start = gpa.checked_sub(self.base).ok_or(bad)?;
        let end = start.checked_add(len as u64).ok_or(bad)?;
        if end > size {
            return Err(bad);
        }
        Ok(start as usize..end as usize)
    }
}

impl GuestMemoryAccess for VecMemory {
    fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<(), MemoryAccessError> {
        let range = self.range(gpa, buf.len())?;
        buf.copy_from_slice(&self.bytes.lock().unwrap()[range]);
        Ok(())
    }

    fn write(&self, gpa: u64, buf: &[u8]) -> Result<(), MemoryAccessError> {
        let range = self.range(gpa, buf.len())?;
        self.bytes.lock().unwrap()[range].copy_from_slice(buf);
        Ok(())
    }
}

/// Driver side view of a split queue placed at `start`: descriptor table,
/// then the available ring, then the used ring aligned to 4 bytes.
pub struct TestQueue<'a> {
    mem: &'a dyn GuestMemoryAccess,
    size: u16,
    desc_table: u64,
    avail_ring: u64,
    used_ring: u64,
    next_desc: AtomicU16,
    avail_idx: AtomicU16,
}

impl<'a> TestQueue<'a> {
    pub fn new(mem: &'a dyn GuestMemoryAccess, start: u64, size: u16) -> Self {
        assert!(size.is_power_of_two());
        assert_eq!(start & 0xf, 0);

        let desc_table = start;
        let avail_ring = desc_table + DESCRIPTOR_SIZE * u64::from(size);
        let avail_end = avail_ring + 6 + 2 * u64::from(size);
        let used_ring = (avail_end + 3) & !3;
        mem.write_u16(avail_ring, 0).unwrap();
        mem.write_u16(avail_ring + 2, 0).unwrap();
        mem.write_u16(used_ring, 0).unwrap();
        mem.write_u16(used_ring + 2, 0).unwrap();

        TestQueue {
            mem,
            size,
            desc_table,
            avail_ring,
            used_ring,
            next_desc: AtomicU16::new(0),
            avail_idx: AtomicU16::new(0),
        }
    }

    /// Device side queue, as programmed by the driver.
    pub fn queue(&self) -> Queue {
        let mut q = Queue::new(self.size);
        q.size = self.size;
        q.desc_table = self.desc_table;
        q.avail_ring = self.avail_ring;
        q.used_ring = self.used_ring;
        q.ready = true;
        q
    }

    pub fn desc_table(&self) -> u64 {
        self.desc_table
    }

    pub fn avail_ring(&self) -> u64 {
        self.avail_ring
    }

    pub fn used_ring(&self) -> u64 {
        self.used_ring
    }

    pub fn write_descriptor(&self, table: u64, index: u16, desc: (u64, u32, u16, u16)) {
        let (addr, len, flags, next) = desc;
        let at = table + DESCRIPTOR_SIZE * u64::from(index);
        self.mem.write_u64(at, addr).unwrap();
        self.mem.write_u32(at + 8, len).unwrap();
        self.mem.write_u16(at + 12, flags).unwrap();
        self.mem.write_u16(at + 14, next).unwrap();
    }

    /// Writes `(addr, len, flags)` descriptors linked in order into free
    /// table slots and makes the chain available. Returns its head.
    pub fn add_chain(&self, parts: &[(u64, u32, u16)]) -> u16 {
        let count = parts.len() as u16;
        let head = self.next_desc.fetch_add(count, Ordering::SeqCst) % self.size;
        for (i, (addr, len, flags)) in parts.iter().enumerate() {
            let index = (head + i as u16) % self.size;
            let last = i + 1 == parts.len();
            let flags = if last {
                *flags
            } else {
                *flags | virtio_bindings::virtio_ring::VRING_DESC_F_NEXT as u16
            };
            self.write_descriptor(
                self.desc_table,
                index,
                (*addr, *len, flags, (index + 1) % self.size),
            );
        }
        self.publish(head);
        head
    }

    /// Appends `head` to the available ring.
    pub fn publish(&self, head: u16) {
        let idx = self.avail_idx.fetch_add(1, Ordering::SeqCst);
        let slot = u64::from(idx % self.size);
        self.mem
            .write_u16(self.avail_ring + 4 + 2 * slot, head)
            .unwrap();
        self.mem
            .write_u16(self.avail_ring + 2, idx.wrapping_add(1))
            .unwrap();
    }

    /// Used ring entries `(id, len)` published so far.
    pub fn used(&self) -> Vec<(u32, u32)> {
        let idx = self.mem.read_u16(self.used_ring + 2).unwrap();
        (0..idx)
            .map(|i| {
                let at = self.used_ring + 4 + 8 * u64::from(i % self.size);
                (
                    self.mem.read_u32(at).unwrap(),
                    self.mem.read_u32(at + 4).unwrap(),
                )
            })
            .collect()
    }

    pub fn suppress_interrupts(&self, suppress: bool) {
        let flags = if suppress {
            virtio_bindings::virtio_ring::VRING_AVAIL_F_NO_INTERRUPT as u16
        } else {
            0
        };
        self.mem.write_u16(self.avail_ring, flags).unwrap();
    }
}
