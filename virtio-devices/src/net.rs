// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Virtio network device with in-process backends.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use virtio_bindings::virtio_net::{VIRTIO_NET_F_MAC, VIRTIO_NET_F_STATUS, VIRTIO_NET_S_LINK_UP};
use vm_device::GuestMemoryAccess;
use vm_virtio::{
    ActivateResult, Queue, QueueError, VirtioCommon, VirtioDevice, VirtioDeviceType,
    VirtioInterrupt, VIRTIO_F_VERSION_1,
};

use crate::queue_helper::{ActiveQueue, Framing, Inbox};

pub const QUEUE_SIZE: u16 = 256;
pub const RX_BACKLOG: usize = 256;
const MAC_ADDR_LEN: usize = 6;
const CONFIG_SIZE: usize = 8;
// struct virtio_net_hdr, plus num_buffers once VIRTIO_F_VERSION_1 is acked.
const NET_HDR_LEN: usize = 10;
const NET_HDR_V1_LEN: usize = 12;

const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MacAddr {
    bytes: [u8; MAC_ADDR_LEN],
}

impl MacAddr {
    pub fn from_bytes(bytes: [u8; MAC_ADDR_LEN]) -> Self {
        MacAddr { bytes }
    }

    pub fn parse_str(s: &str) -> Result<MacAddr, io::Error> {
        let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("invalid MAC {s}"));
        let mut bytes = [0u8; MAC_ADDR_LEN];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(MacAddr { bytes })
    }

    /// Locally administered address derived from `seed`, stable across runs.
    pub fn local_from_seed(seed: &str) -> MacAddr {
        // FNV-1a
        let hash = seed.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        });
        let h = hash.to_le_bytes();
        MacAddr {
            bytes: [0x52, 0x54, 0x00, h[0], h[1], h[2]],
        }
    }

    pub fn get_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Receive side of a network device, handed to its backend. Frames are
/// buffered until the driver posts receive buffers.
#[derive(Clone)]
pub struct RxPort {
    inbox: Arc<Inbox>,
    hdr_len: Arc<AtomicUsize>,
}

impl RxPort {
    /// Queues an ethernet frame for the guest. Returns false if it was
    /// dropped because the backlog is full.
    pub fn deliver(&self, frame: &[u8]) -> bool {
        let hdr_len = self.hdr_len.load(Ordering::Acquire);
        let mut buf = vec![0u8; hdr_len];
        if hdr_len == NET_HDR_V1_LEN {
            // num_buffers
            buf[10] = 1;
        }
        buf.extend_from_slice(frame);
        self.inbox.push(buf)
    }
}

/// Where transmitted frames go and received frames come from.
pub trait NetBackend: Send {
    fn transmit(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Called once when the device is created.
    fn connect(&mut self, rx: RxPort);
}

type PortSlot = Arc<Mutex<Option<RxPort>>>;

/// Backend wiring two devices back to back, or one device to itself.
pub struct Loopback {
    own: PortSlot,
    peer: PortSlot,
}

/// Two backends such that frames sent on one are received on the other.
pub fn loopback_pair() -> (Loopback, Loopback) {
    let a: PortSlot = Arc::new(Mutex::new(None));
    let b: PortSlot = Arc::new(Mutex::new(None));
    (
        Loopback {
            own: a.clone(),
            peer: b.clone(),
        },
        Loopback { own: b, peer: a },
    )
}

impl Loopback {
    /// A backend returning every transmitted frame to the sender.
    pub fn reflect() -> Loopback {
        let slot: PortSlot = Arc::new(Mutex::new(None));
        Loopback {
            own: slot.clone(),
            peer: slot,
        }
    }
}

impl NetBackend for Loopback {
    fn transmit(&mut self, frame: &[u8]) -> io::Result<()> {
        let peer = self.peer.lock().unwrap().clone();
        match peer {
            Some(port) => {
                if !port.deliver(frame) {
                    debug!("loopback peer dropped a {} byte frame", frame.len());
                }
            }
            None => debug!("loopback peer not connected, dropping frame"),
        }
        Ok(())
    }

    fn connect(&mut self, rx: RxPort) {
        *self.own.lock().unwrap() = Some(rx);
    }
}

const CAPTURE_DEPTH: usize = 256;

#[derive(Default)]
struct CaptureShared {
    frames: Mutex<VecDeque<Vec<u8>>>,
    port: Mutex<Option<RxPort>>,
}

/// Backend recording what the guest sends, with a handle to inject frames.
pub struct Capture {
    shared: Arc<CaptureShared>,
}

#[derive(Clone)]
pub struct CaptureHandle {
    shared: Arc<CaptureShared>,
}

impl Capture {
    pub fn new() -> (Capture, CaptureHandle) {
        let shared = Arc::new(CaptureShared::default());
        (
            Capture {
                shared: shared.clone(),
            },
            CaptureHandle { shared },
        )
    }
}

impl CaptureHandle {
    /// The most recent transmitted frames, oldest first.
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.shared.frames.lock().unwrap().iter().cloned().collect()
    }

    pub fn inject(&self, frame: &[u8]) -> bool {
        match self.shared.port.lock().unwrap().as_ref() {
            Some(port) => port.deliver(frame),
            None => false,
        }
    }
}

impl NetBackend for Capture {
    fn transmit(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut frames = self.shared.frames.lock().unwrap();
        if frames.len() == CAPTURE_DEPTH {
            frames.pop_front();
        }
        frames.push_back(frame.to_vec());
        Ok(())
    }

    fn connect(&mut self, rx: RxPort) {
        *self.shared.port.lock().unwrap() = Some(rx);
    }
}

#[derive(Default, Clone)]
pub struct NetCounters {
    pub tx_bytes: Arc<AtomicU64>,
    pub tx_frames: Arc<AtomicU64>,
    pub tx_errors: Arc<AtomicU64>,
}

pub struct Net {
    id: String,
    common: VirtioCommon,
    config: [u8; CONFIG_SIZE],
    backend: Box<dyn NetBackend>,
    rx: Arc<Inbox>,
    hdr_len: Arc<AtomicUsize>,
    tx: Option<ActiveQueue>,
    counters: NetCounters,
}

impl Net {
    pub fn new(id: String, mac: Option<MacAddr>, mut backend: Box<dyn NetBackend>) -> Self {
        let mac = mac.unwrap_or_else(|| MacAddr::local_from_seed(&id));
        info!("{}: MAC address {}", id, mac);

        let mut config = [0u8; CONFIG_SIZE];
        config[..MAC_ADDR_LEN].copy_from_slice(mac.get_bytes());
        config[MAC_ADDR_LEN..].copy_from_slice(&(VIRTIO_NET_S_LINK_UP as u16).to_le_bytes());

        let avail_features = 1u64 << VIRTIO_NET_F_MAC | 1u64 << VIRTIO_NET_F_STATUS;

        let rx = Inbox::new(format!("{id}_rx"), Framing::Datagram, RX_BACKLOG);
        let hdr_len = Arc::new(AtomicUsize::new(NET_HDR_LEN));
        backend.connect(RxPort {
            inbox: rx.clone(),
            hdr_len: hdr_len.clone(),
        });

        Net {
            id,
            common: VirtioCommon::new(
                VirtioDeviceType::Net,
                avail_features,
                vec![QUEUE_SIZE, QUEUE_SIZE],
            ),
            config,
            backend,
            rx,
            hdr_len,
            tx: None,
            counters: NetCounters::default(),
        }
    }

    pub fn mac(&self) -> MacAddr {
        let mut bytes = [0u8; MAC_ADDR_LEN];
        bytes.copy_from_slice(&self.config[..MAC_ADDR_LEN]);
        MacAddr::from_bytes(bytes)
    }

    pub fn counters(&self) -> NetCounters {
        self.counters.clone()
    }

    /// A port delivering frames to this device, as its backend sees it.
    pub fn rx_port(&self) -> RxPort {
        RxPort {
            inbox: self.rx.clone(),
            hdr_len: self.hdr_len.clone(),
        }
    }

    fn process_tx(&mut self) -> Result<(), QueueError> {
        let Some(txq) = self.tx.as_mut() else {
            warn!("{}: transmit notify before activation", self.id);
            return Ok(());
        };
        let hdr_len = self.hdr_len.load(Ordering::Acquire);

        let mut used = false;
        while let Some(chain) = txq.pop()? {
            let frame = chain.read_all(txq.mem.as_ref())?;
            if frame.len() < hdr_len {
                warn!("{}: runt frame of {} bytes", self.id, frame.len());
                self.counters.tx_errors.fetch_add(1, Ordering::AcqRel);
            } else if let Err(e) = self.backend.transmit(&frame[hdr_len..]) {
                error!("{}: backend failed to transmit: {}", self.id, e);
                self.counters.tx_errors.fetch_add(1, Ordering::AcqRel);
            } else {
                self.counters
                    .tx_bytes
                    .fetch_add((frame.len() - hdr_len) as u64, Ordering::AcqRel);
                self.counters.tx_frames.fetch_add(1, Ordering::AcqRel);
            }
            txq.add_used(chain.head, 0)?;
            used = true;
        }

        if used {
            txq.signal_used_queue();
        }
        Ok(())
    }
}

impl VirtioDevice for Net {
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
        // Only the MAC address is writable.
        if offset + data.len() as u64 > MAC_ADDR_LEN as u64 {
            warn!(
                "{}: write to read-only config: offset {:x} length {}",
                self.id,
                offset,
                data.len()
            );
            return;
        }
        let mut mac = self.config;
        self.write_config_helper(&mut mac[..MAC_ADDR_LEN], offset, data);
        self.config = mac;
    }

    fn activate(
        &mut self,
        mem: Arc<dyn GuestMemoryAccess>,
        interrupt: Arc<dyn VirtioInterrupt>,
        mut queues: Vec<Queue>,
    ) -> ActivateResult {
        self.common.check_queues(&queues)?;

        let hdr_len = if self.common.feature_acked(VIRTIO_F_VERSION_1.into()) {
            NET_HDR_V1_LEN
        } else {
            NET_HDR_LEN
        };
        self.hdr_len.store(hdr_len, Ordering::Release);

        let tx = queues.remove(TX_QUEUE as usize);
        let rx = queues.remove(RX_QUEUE as usize);
        self.tx = Some(ActiveQueue::new(TX_QUEUE, tx, mem.clone(), interrupt.clone()));
        self.rx
            .activate(ActiveQueue::new(RX_QUEUE, rx, mem, interrupt));
        debug!("{}: activated, header length {}", self.id, hdr_len);
        Ok(())
    }

    fn queue_notify(&mut self, index: u16) {
        match index {
            RX_QUEUE => self.rx.flush(),
            TX_QUEUE => {
                if let Err(e) = self.process_tx() {
                    error!("{}: failed to process transmit queue: {}", self.id, e);
                }
            }
            _ => warn!("{}: notify for unknown queue {}", self.id, index),
        }
    }

    fn reset(&mut self) {
        self.rx.deactivate(true);
        self.tx = None;
        self.hdr_len.store(NET_HDR_LEN, Ordering::Release);
        self.common.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use virtio_bindings::virtio_ring::VRING_DESC_F_WRITE;
    use vm_device::{GuestMemoryAccess, IrqError};
    use vm_virtio::testing::{TestQueue, VecMemory};
    use vm_virtio::VirtioInterruptType;

    const WRITE: u16 = VRING_DESC_F_WRITE as u16;

    #[derive(Default)]
    struct CountingInterrupt(AtomicUsize);

    impl VirtioInterrupt for CountingInterrupt {
        fn trigger(&self, _int_type: VirtioInterruptType) -> Result<(), IrqError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn frame(tag: u8) -> Vec<u8> {
        let mut f = vec![0xff; 6];
        f.extend_from_slice(&[0x52, 0x54, 0, 0, 0, tag]);
        f.extend_from_slice(&[0x08, 0x00]);
        f.extend(std::iter::repeat(tag).take(46));
        f
    }

    #[test]
    fn mac_parsing_and_config() {
        let mac = MacAddr::parse_str("52:54:00:aa:bb:cc").unwrap();
        assert_eq!(mac.to_string(), "52:54:00:aa:bb:cc");
        assert!(MacAddr::parse_str("52:54:00:aa:bb").is_err());
        assert!(MacAddr::parse_str("52:54:00:aa:bb:cc:dd").is_err());
        assert!(MacAddr::parse_str("zz:54:00:aa:bb:cc").is_err());
        assert_eq!(MacAddr::local_from_seed("a"), MacAddr::local_from_seed("a"));

        let (backend, _handle) = Capture::new();
        let mut net = Net::new("net0".to_string(), Some(mac), Box::new(backend));
        let mut config = [0u8; 8];
        net.read_config(0, &mut config);
        assert_eq!(&config[..6], mac.get_bytes());
        assert_eq!(u16::from_le_bytes([config[6], config[7]]), 1);

        net.write_config(5, &[0xdd]);
        net.write_config(6, &[0, 0]);
        assert_eq!(net.mac().to_string(), "52:54:00:aa:bb:dd");
        net.read_config(6, &mut config[..2]);
        assert_eq!(&config[..2], &[1, 0]);
    }

    #[test]
    fn transmit_strips_header() {
        let mem = Arc::new(VecMemory::new(0, 0x20000));
        let interrupt = Arc::new(CountingInterrupt::default());
        let (backend, handle) = Capture::new();
        let mut net = Net::new("net0".to_string(), None, Box::new(backend));
        net.ack_features(1 << VIRTIO_F_VERSION_1);

        let rxq = TestQueue::new(mem.as_ref(), 0x1000, 16);
        let txq = TestQueue::new(mem.as_ref(), 0x2000, 16);
        net.activate(mem.clone(), interrupt.clone(), vec![rxq.queue(), txq.queue()])
            .unwrap();

        let f = frame(7);
        mem.write(0x8000, &[0u8; NET_HDR_V1_LEN]).unwrap();
        mem.write(0x8000 + NET_HDR_V1_LEN as u64, &f).unwrap();
        // Header and payload in separate descriptors.
        let head = txq.add_chain(&[(0x8000, 4, 0), (0x8004, (8 + f.len()) as u32, 0)]);
        net.queue_notify(TX_QUEUE);

        assert_eq!(handle.transmitted(), vec![f.clone()]);
        assert_eq!(txq.used(), vec![(u32::from(head), 0)]);
        assert_eq!(interrupt.0.load(Ordering::SeqCst), 1);
        assert_eq!(net.counters().tx_frames.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn receive_waits_for_buffers() {
        let mem = Arc::new(VecMemory::new(0, 0x20000));
        let interrupt = Arc::new(CountingInterrupt::default());
        let (backend, handle) = Capture::new();
        let mut net = Net::new("net0".to_string(), None, Box::new(backend));

        // Nothing is lost before the driver is up.
        assert!(handle.inject(&frame(1)));
        let rxq = TestQueue::new(mem.as_ref(), 0x1000, 16);
        let txq = TestQueue::new(mem.as_ref(), 0x2000, 16);
        net.activate(mem.clone(), interrupt.clone(), vec![rxq.queue(), txq.queue()])
            .unwrap();
        assert!(handle.inject(&frame(2)));
        assert!(rxq.used().is_empty());

        rxq.add_chain(&[(0x8000, 1526, WRITE)]);
        rxq.add_chain(&[(0x9000, 1526, WRITE)]);
        net.queue_notify(RX_QUEUE);

        let used = rxq.used();
        assert_eq!(used.len(), 2);
        assert_eq!(used[0].1 as usize, NET_HDR_LEN + 60);
        let mut got = vec![0u8; 60];
        mem.read(0x9000 + NET_HDR_LEN as u64, &mut got).unwrap();
        assert_eq!(got, frame(2));

        // Reset drops what the guest has not taken yet.
        assert!(handle.inject(&frame(3)));
        net.reset();
        assert_eq!(net.rx.pending(), 0);
    }

    #[test]
    fn loopback_pair_connects_two_devices() {
        let mem = Arc::new(VecMemory::new(0, 0x40000));
        let interrupt = Arc::new(CountingInterrupt::default());
        let (a, b) = loopback_pair();
        let mut net_a = Net::new("a".to_string(), None, Box::new(a));
        let mut net_b = Net::new("b".to_string(), None, Box::new(b));
        assert_ne!(net_a.mac(), net_b.mac());

        let a_rx = TestQueue::new(mem.as_ref(), 0x1000, 16);
        let a_tx = TestQueue::new(mem.as_ref(), 0x2000, 16);
        let b_rx = TestQueue::new(mem.as_ref(), 0x3000, 16);
        let b_tx = TestQueue::new(mem.as_ref(), 0x4000, 16);
        net_a
            .activate(mem.clone(), interrupt.clone(), vec![a_rx.queue(), a_tx.queue()])
            .unwrap();
        net_b
            .activate(mem.clone(), interrupt.clone(), vec![b_rx.queue(), b_tx.queue()])
            .unwrap();
        b_rx.add_chain(&[(0x10000, 1526, WRITE)]);
        net_b.queue_notify(RX_QUEUE);

        let f = frame(9);
        mem.write(0x8000 + NET_HDR_LEN as u64, &f).unwrap();
        a_tx.add_chain(&[(0x8000, (NET_HDR_LEN + f.len()) as u32, 0)]);
        net_a.queue_notify(TX_QUEUE);

        assert_eq!(b_rx.used().len(), 1);
        let mut got = vec![0u8; f.len()];
        mem.read(0x10000 + NET_HDR_LEN as u64, &mut got).unwrap();
        assert_eq!(got, f);

        let mut reflect = Loopback::reflect();
        let port = net_a.rx_port();
        reflect.connect(port);
        reflect.transmit(&f).unwrap();
        assert_eq!(net_a.rx.pending(), 1);
    }
}
