// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Virtio block device.
//!
//! Requests are parsed on the trapping VCPU and handed to a per-device
//! worker thread over a bounded channel; the worker runs them against the
//! disk, publishes the used entries and raises the interrupt. Resetting the
//! device bumps a generation counter: requests of an older generation still
//! run to completion on the disk but never touch guest memory again.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use byteorder::{ByteOrder, LittleEndian};
use flume::{Receiver, Sender, TrySendError};
use thiserror::Error;
use virtio_bindings::virtio_blk::*;
use vm_device::{GuestMemoryAccess, GuestMemoryExt, MemoryAccessError};
use vm_virtio::{
    ActivateError, ActivateResult, Descriptor, DescriptorChain, Queue, QueueError, VirtioCommon,
    VirtioDevice, VirtioDeviceType, VirtioInterrupt, VirtioInterruptType,
};

use crate::disk::{build_disk_image_id, DiskBackend, SECTOR_SHIFT, SECTOR_SIZE};
use crate::thread_helper::spawn_virtio_thread;

pub const QUEUE_SIZE: u16 = 128;
/// Requests in flight between the trap path and the worker.
pub const REQUEST_CHANNEL_DEPTH: usize = 64;
const SEG_MAX: u32 = 126;
const CONFIG_SIZE: usize = 24;
const REQUEST_HEADER_SIZE: u32 = 16;

#[derive(Error, Debug)]
pub enum Error {
    /// Guest gave us bad memory addresses.
    #[error("Guest memory access failed: {0}")]
    GuestMemory(#[from] MemoryAccessError),
    /// Guest gave us a write only descriptor that protocol says to read from.
    #[error("Unexpected write only descriptor")]
    UnexpectedWriteOnlyDescriptor,
    /// Guest gave us a read only descriptor that protocol says to write to.
    #[error("Unexpected read only descriptor")]
    UnexpectedReadOnlyDescriptor,
    /// Guest gave us too few descriptors in a descriptor chain.
    #[error("Descriptor chain too short")]
    DescriptorChainTooShort,
    /// Guest gave us a descriptor that was too short to use.
    #[error("Descriptor length too small")]
    DescriptorLengthTooSmall,
    /// The requested operation would cause a seek beyond disk end.
    #[error("Request beyond the end of the disk")]
    InvalidOffset,
    #[error("Write to a read only disk")]
    ReadOnly,
    #[error("Disk I/O failed: {0}")]
    Io(#[source] io::Error),
    #[error("Unsupported request type {0}")]
    Unsupported(u32),
}

impl Error {
    fn status(&self) -> u8 {
        match self {
            Error::Unsupported(_) => VIRTIO_BLK_S_UNSUPP as u8,
            _ => VIRTIO_BLK_S_IOERR as u8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    In,
    Out,
    Flush,
    GetDeviceId,
    Unsupported(u32),
}

impl From<u32> for RequestType {
    fn from(value: u32) -> Self {
        match value {
            VIRTIO_BLK_T_IN => RequestType::In,
            VIRTIO_BLK_T_OUT => RequestType::Out,
            VIRTIO_BLK_T_FLUSH => RequestType::Flush,
            VIRTIO_BLK_T_GET_ID => RequestType::GetDeviceId,
            t => RequestType::Unsupported(t),
        }
    }
}

/// A parsed request: header, data buffers and status byte location.
#[derive(Clone, Debug)]
pub struct Request {
    pub head: u16,
    pub request_type: RequestType,
    pub sector: u64,
    pub data: Vec<Descriptor>,
    pub status_addr: u64,
}

impl Request {
    pub fn parse(chain: &DescriptorChain, mem: &dyn GuestMemoryAccess) -> Result<Request, Error> {
        let (header, rest) = chain
            .descriptors
            .split_first()
            .ok_or(Error::DescriptorChainTooShort)?;
        if header.is_write_only() {
            return Err(Error::UnexpectedWriteOnlyDescriptor);
        }
        if header.len < REQUEST_HEADER_SIZE {
            return Err(Error::DescriptorLengthTooSmall);
        }
        let (status, data) = rest.split_last().ok_or(Error::DescriptorChainTooShort)?;
        if !status.is_write_only() {
            return Err(Error::UnexpectedReadOnlyDescriptor);
        }
        if status.len < 1 {
            return Err(Error::DescriptorLengthTooSmall);
        }

        let request_type = RequestType::from(mem.read_u32(header.addr)?);
        let sector = mem.read_u64(header.addr + 8)?;

        let expect_write_only = match request_type {
            RequestType::In | RequestType::GetDeviceId => Some(true),
            RequestType::Out => Some(false),
            _ => None,
        };
        if let Some(write_only) = expect_write_only {
            for desc in data {
                match (write_only, desc.is_write_only()) {
                    (true, false) => return Err(Error::UnexpectedReadOnlyDescriptor),
                    (false, true) => return Err(Error::UnexpectedWriteOnlyDescriptor),
                    _ => {}
                }
            }
        }

        Ok(Request {
            head: chain.head,
            request_type,
            sector,
            data: data.to_vec(),
            status_addr: status.addr,
        })
    }

    pub fn data_len(&self) -> u64 {
        self.data.iter().map(|d| u64::from(d.len)).sum()
    }

    /// Copies the buffers of a write request out of guest memory.
    pub fn gather(&self, mem: &dyn GuestMemoryAccess) -> Result<Vec<u8>, Error> {
        if self.request_type != RequestType::Out {
            return Ok(Vec::new());
        }
        let mut data = vec![0u8; self.data_len() as usize];
        let mut at = 0;
        for desc in &self.data {
            let len = desc.len as usize;
            mem.read(desc.addr, &mut data[at..at + len])?;
            at += len;
        }
        Ok(data)
    }

    /// Runs the request against `disk`. `out` holds the gathered payload of
    /// a write. Returns the bytes to hand back to the guest.
    pub fn execute(
        &self,
        disk: &mut dyn DiskBackend,
        disk_nsectors: u64,
        read_only: bool,
        out: &[u8],
        disk_id: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let check_range = || {
            let sectors = self.data_len().div_ceil(SECTOR_SIZE);
            match self.sector.checked_add(sectors) {
                Some(end) if end <= disk_nsectors => Ok(self.sector << SECTOR_SHIFT),
                _ => Err(Error::InvalidOffset),
            }
        };

        match self.request_type {
            RequestType::In => {
                let offset = check_range()?;
                let mut buf = vec![0u8; self.data_len() as usize];
                disk.read_at(&mut buf, offset).map_err(Error::Io)?;
                Ok(buf)
            }
            RequestType::Out => {
                if read_only {
                    return Err(Error::ReadOnly);
                }
                let offset = check_range()?;
                disk.write_at(out, offset).map_err(Error::Io)?;
                Ok(Vec::new())
            }
            RequestType::Flush => {
                disk.flush().map_err(Error::Io)?;
                Ok(Vec::new())
            }
            RequestType::GetDeviceId => {
                let mut id = vec![0u8; VIRTIO_BLK_ID_BYTES as usize];
                let len = disk_id.len().min(id.len());
                id[..len].copy_from_slice(&disk_id[..len]);
                Ok(id)
            }
            RequestType::Unsupported(t) => Err(Error::Unsupported(t)),
        }
    }

    /// Spreads `data` over the guest buffers. Returns the bytes written.
    pub fn scatter(&self, mem: &dyn GuestMemoryAccess, data: &[u8]) -> Result<u32, Error> {
        let mut remaining = data;
        let mut written = 0;
        for desc in &self.data {
            if remaining.is_empty() {
                break;
            }
            let count = remaining.len().min(desc.len as usize);
            mem.write(desc.addr, &remaining[..count])?;
            remaining = &remaining[count..];
            written += count;
        }
        Ok(written as u32)
    }
}

/// Queue state of one activation, shared with the worker.
struct BlockQueue {
    queue: Mutex<Queue>,
    mem: Arc<dyn GuestMemoryAccess>,
    interrupt: Arc<dyn VirtioInterrupt>,
    generation: u64,
}

enum Work {
    Request(Arc<BlockQueue>, Request),
    /// The channel overflowed: the worker pulls the rest off the ring.
    Drain(Arc<BlockQueue>),
}

#[derive(Default, Clone)]
pub struct BlockCounters {
    read_bytes: Arc<AtomicU64>,
    read_ops: Arc<AtomicU64>,
    write_bytes: Arc<AtomicU64>,
    write_ops: Arc<AtomicU64>,
    revoked: Arc<AtomicU64>,
}

impl BlockCounters {
    pub fn read_ops(&self) -> u64 {
        self.read_ops.load(Ordering::Acquire)
    }

    pub fn write_ops(&self) -> u64 {
        self.write_ops.load(Ordering::Acquire)
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Acquire)
    }

    pub fn write_bytes(&self) -> u64 {
        self.write_bytes.load(Ordering::Acquire)
    }

    /// Requests that completed after their activation was reset.
    pub fn revoked(&self) -> u64 {
        self.revoked.load(Ordering::Acquire)
    }
}

struct BlockWorker {
    id: String,
    disk: Box<dyn DiskBackend>,
    disk_nsectors: u64,
    disk_id: Vec<u8>,
    read_only: bool,
    generation: Arc<AtomicU64>,
    backlog: Arc<AtomicBool>,
    counters: BlockCounters,
}

impl BlockWorker {
    fn run(mut self, rx: Receiver<Work>) {
        for work in rx.iter() {
            match work {
                Work::Request(bq, request) => {
                    self.complete(&bq, &request);
                    if self.backlog.swap(false, Ordering::SeqCst) {
                        self.drain(&bq);
                    }
                }
                Work::Drain(bq) => self.drain(&bq),
            }
        }
        debug!("{}: block worker exiting", self.id);
    }

    fn revoked(&self, bq: &BlockQueue) -> bool {
        self.generation.load(Ordering::Acquire) != bq.generation
    }

    fn drain(&mut self, bq: &BlockQueue) {
        loop {
            let chain = {
                let mut queue = bq.queue.lock().unwrap();
                if self.revoked(bq) {
                    return;
                }
                match queue.pop(bq.mem.as_ref()) {
                    Ok(Some(chain)) => chain,
                    Ok(None) => return,
                    Err(e) => {
                        error!("{}: failed to pop request: {}", self.id, e);
                        return;
                    }
                }
            };
            match Request::parse(&chain, bq.mem.as_ref()) {
                Ok(request) => self.complete(bq, &request),
                Err(e) => {
                    error!("{}: failed to parse available descriptor chain: {}", self.id, e);
                    let mut queue = bq.queue.lock().unwrap();
                    if !self.revoked(bq) {
                        return_unparsed(&self.id, bq, &mut queue, chain.head);
                    }
                }
            }
        }
    }

    fn complete(&mut self, bq: &BlockQueue, request: &Request) {
        // Guest memory is only touched while holding the queue lock of a
        // live activation.
        let out = {
            let _queue = bq.queue.lock().unwrap();
            if self.revoked(bq) {
                self.counters.revoked.fetch_add(1, Ordering::AcqRel);
                return;
            }
            request.gather(bq.mem.as_ref())
        };

        let result = out.and_then(|out| {
            request.execute(
                self.disk.as_mut(),
                self.disk_nsectors,
                self.read_only,
                &out,
                &self.disk_id,
            )
        });

        let mut queue = bq.queue.lock().unwrap();
        if self.revoked(bq) {
            debug!("{}: dropping completion of revoked request", self.id);
            self.counters.revoked.fetch_add(1, Ordering::AcqRel);
            return;
        }

        let (status, len) = match result.and_then(|data| request.scatter(bq.mem.as_ref(), &data))
        {
            Ok(len) => {
                match request.request_type {
                    RequestType::In => {
                        self.counters
                            .read_bytes
                            .fetch_add(request.data_len(), Ordering::AcqRel);
                        self.counters.read_ops.fetch_add(1, Ordering::AcqRel);
                    }
                    RequestType::Out => {
                        self.counters
                            .write_bytes
                            .fetch_add(request.data_len(), Ordering::AcqRel);
                        self.counters.write_ops.fetch_add(1, Ordering::AcqRel);
                    }
                    _ => {}
                }
                (VIRTIO_BLK_S_OK as u8, len)
            }
            Err(e) => {
                warn!("{}: failed to execute request: {}", self.id, e);
                (e.status(), 0)
            }
        };

        if let Err(e) = bq.mem.write_u8(request.status_addr, status) {
            error!("{}: cannot write request status: {}", self.id, e);
        }
        // We need at least 1 byte for the status.
        if let Err(e) = queue.add_used(bq.mem.as_ref(), request.head, len + 1) {
            error!("{}: cannot return request: {}", self.id, e);
            return;
        }
        signal_used_queue(&self.id, bq, &queue);
    }
}

fn signal_used_queue(id: &str, bq: &BlockQueue, queue: &Queue) {
    match queue.needs_notification(bq.mem.as_ref()) {
        Ok(false) => return,
        Ok(true) => {}
        Err(e) => warn!("{}: cannot read avail flags: {}", id, e),
    }
    if let Err(e) = bq.interrupt.trigger(VirtioInterruptType::Queue(0)) {
        error!("{}: failed to signal used queue: {}", id, e);
    }
}

fn return_unparsed(id: &str, bq: &BlockQueue, queue: &mut Queue, head: u16) {
    match queue.add_used(bq.mem.as_ref(), head, 0) {
        Ok(()) => signal_used_queue(id, bq, queue),
        Err(e) => error!("{}: cannot return request: {}", id, e),
    }
}

/// Virtio device for exposing block level read/write operations on a disk
/// backend.
pub struct Block {
    id: String,
    common: VirtioCommon,
    disk: Option<Box<dyn DiskBackend>>,
    disk_id: Vec<u8>,
    disk_nsectors: u64,
    read_only: bool,
    config: [u8; CONFIG_SIZE],
    generation: Arc<AtomicU64>,
    counters: BlockCounters,
    active: Option<Arc<BlockQueue>>,
    request_tx: Option<Sender<Work>>,
    request_rx: Option<Receiver<Work>>,
    backlog: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Block {
    /// Create a new virtio block device that operates on the given disk.
    pub fn new(id: String, disk: Box<dyn DiskBackend>, read_only: bool) -> Self {
        let disk_nsectors = disk.size() / SECTOR_SIZE;
        let disk_id = build_disk_image_id(disk.as_ref());

        let mut avail_features = (1u64 << VIRTIO_BLK_F_FLUSH)
            | (1u64 << VIRTIO_BLK_F_SEG_MAX)
            | (1u64 << VIRTIO_BLK_F_BLK_SIZE);
        if read_only {
            avail_features |= 1u64 << VIRTIO_BLK_F_RO;
        }

        let mut config = [0u8; CONFIG_SIZE];
        LittleEndian::write_u64(&mut config[0..8], disk_nsectors);
        LittleEndian::write_u32(&mut config[12..16], SEG_MAX);
        LittleEndian::write_u32(&mut config[20..24], SECTOR_SIZE as u32);

        Block {
            id,
            common: VirtioCommon::new(VirtioDeviceType::Block, avail_features, vec![QUEUE_SIZE]),
            disk: Some(disk),
            disk_id,
            disk_nsectors,
            read_only,
            config,
            generation: Arc::new(AtomicU64::new(0)),
            counters: BlockCounters::default(),
            active: None,
            request_tx: None,
            request_rx: None,
            backlog: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn counters(&self) -> BlockCounters {
        self.counters.clone()
    }

    pub fn capacity(&self) -> u64 {
        self.disk_nsectors
    }

    fn start_worker(&mut self) -> ActivateResult {
        if self.worker.is_some() {
            return Ok(());
        }
        let disk = self.disk.take().ok_or(ActivateError::BadActivate)?;
        let (tx, rx) = flume::bounded(REQUEST_CHANNEL_DEPTH);
        let worker = BlockWorker {
            id: self.id.clone(),
            disk,
            disk_nsectors: self.disk_nsectors,
            disk_id: self.disk_id.clone(),
            read_only: self.read_only,
            generation: self.generation.clone(),
            backlog: self.backlog.clone(),
            counters: self.counters.clone(),
        };
        let worker_rx = rx.clone();
        self.worker = Some(spawn_virtio_thread(
            &format!("{}_blk", self.id),
            move || worker.run(worker_rx),
        )?);
        self.request_tx = Some(tx);
        self.request_rx = Some(rx);
        Ok(())
    }

    fn process_queue(&self) -> Result<(), QueueError> {
        let (Some(bq), Some(tx)) = (self.active.clone(), self.request_tx.clone()) else {
            return Ok(());
        };

        let mut queue = bq.queue.lock().unwrap();
        loop {
            if tx.is_full() {
                self.defer_to_worker(&tx, &bq);
                return Ok(());
            }
            let Some(chain) = queue.pop(bq.mem.as_ref())? else {
                return Ok(());
            };

            let request = match Request::parse(&chain, bq.mem.as_ref()) {
                Ok(request) => request,
                Err(e) => {
                    error!("{}: failed to parse available descriptor chain: {}", self.id, e);
                    return_unparsed(&self.id, &bq, &mut queue, chain.head);
                    continue;
                }
            };

            match tx.try_send(Work::Request(bq.clone(), request)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    queue.undo_pop();
                    self.defer_to_worker(&tx, &bq);
                    return Ok(());
                }
                Err(TrySendError::Disconnected(_)) => {
                    queue.undo_pop();
                    error!("{}: block worker is gone", self.id);
                    return Ok(());
                }
            }
        }
    }

    // The ring still holds requests the channel had no room for. Either a
    // drain order gets queued, or the channel is still full and the worker
    // sees the flag once it gets to the requests ahead of it.
    fn defer_to_worker(&self, tx: &Sender<Work>, bq: &Arc<BlockQueue>) {
        self.backlog.store(true, Ordering::SeqCst);
        if tx.try_send(Work::Drain(bq.clone())).is_ok() {
            self.backlog.store(false, Ordering::SeqCst);
        }
    }

    fn revoke_in_flight(&mut self) {
        if let Some(bq) = self.active.take() {
            let _queue = bq.queue.lock().unwrap();
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            debug!("{}: revoking requests, generation {}", self.id, generation);
        }
        if let Some(rx) = &self.request_rx {
            let dropped = rx.drain().count();
            if dropped > 0 {
                debug!("{}: dropped {} queued requests", self.id, dropped);
            }
        }
        self.backlog.store(false, Ordering::SeqCst);
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.revoke_in_flight();
        // Dropping the last sender stops the worker.
        self.request_tx = None;
        self.request_rx = None;
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.join() {
                error!("{}: error joining block worker: {:?}", self.id, e);
            }
        }
    }
}

impl VirtioDevice for Block {
    fn device_type(&self) -> u32 {
        self.common.device_type
    }

    fn queue_max_sizes(&self) -> &[u16] {
        self.common.queue_sizes.as_slice()
    }

    fn features(&self) -> u64 {
        self.common.avail_features
    }

    fn ack_features(&mut self, value: u64) {
        self.common.ack_features(value)
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        self.read_config_from_slice(&self.config, offset, data);
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) {
        error!(
            "{}: attempt to write to read-only config: offset {:x} length {}",
            self.id,
            offset,
            data.len()
        );
    }

    fn activate(
        &mut self,
        mem: Arc<dyn GuestMemoryAccess>,
        interrupt: Arc<dyn VirtioInterrupt>,
        mut queues: Vec<Queue>,
    ) -> ActivateResult {
        self.common.check_queues(&queues)?;
        self.start_worker()?;

        let bq = Arc::new(BlockQueue {
            queue: Mutex::new(queues.remove(0)),
            mem,
            interrupt,
            generation: self.generation.load(Ordering::Acquire),
        });
        self.active = Some(bq);
        Ok(())
    }

    fn queue_notify(&mut self, index: u16) {
        if index != 0 {
            warn!("{}: notify for unknown queue {}", self.id, index);
            return;
        }
        if let Err(e) = self.process_queue() {
            error!("{}: failed to process queue: {}", self.id, e);
        }
    }

    fn reset(&mut self) {
        self.revoke_in_flight();
        self.common.reset();
    }
}
