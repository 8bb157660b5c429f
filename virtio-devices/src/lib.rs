// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Implements virtio devices behind the virtio-mmio transport.

#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use vm_device::{Emulator, EmulatorError, EmulatorKind, ProbeContext, Result};
use vm_virtio::transport::MmioTransport;
use vm_virtio::{VirtioDevice, VirtioDeviceType};

pub mod block;
pub mod console;
pub mod disk;
pub mod input;
pub mod net;
mod queue_helper;
mod thread_helper;

pub use self::block::{Block, BlockCounters};
pub use self::console::{Console, ConsoleInput};
pub use self::disk::{DiskBackend, FileDisk, MemDisk};
pub use self::input::{Input, InputEvent, InputHandle};
pub use self::net::{
    loopback_pair, Capture, CaptureHandle, Loopback, MacAddr, Net, NetBackend, NetCounters, RxPort,
};

pub const VIRTIO_MMIO_COMPATIBLE: &[&str] = &["virtio,mmio"];

/// Host side of a probed device, reachable by instance id `guest/node`.
#[derive(Clone)]
pub enum HostHandle {
    Block(BlockCounters),
    Console(ConsoleInput),
    Input(InputHandle),
    NetCapture(CaptureHandle),
    Net(NetCounters),
}

fn host_handles() -> &'static Mutex<HashMap<String, HostHandle>> {
    static HANDLES: OnceLock<Mutex<HashMap<String, HostHandle>>> = OnceLock::new();
    HANDLES.get_or_init(|| Mutex::new(HashMap::new()))
}

// One end of a loopback pair whose peer has not been probed yet, per group.
fn loopback_groups() -> &'static Mutex<HashMap<String, Loopback>> {
    static GROUPS: OnceLock<Mutex<HashMap<String, Loopback>>> = OnceLock::new();
    GROUPS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the host handle of the device instance `id`.
pub fn host_handle(id: &str) -> Option<HostHandle> {
    host_handles().lock().unwrap().get(id).cloned()
}

/// Forgets the handle of a removed device instance.
pub fn release_host_handle(id: &str) {
    host_handles().lock().unwrap().remove(id);
}

fn publish(id: &str, handle: HostHandle) {
    host_handles().lock().unwrap().insert(id.to_string(), handle);
}

fn net_backend(ctx: &ProbeContext, id: &str) -> Result<Box<dyn NetBackend>> {
    let node = ctx.node;
    match node.attr_str("net_backend").unwrap_or("capture") {
        "capture" => {
            let (backend, handle) = Capture::new();
            publish(id, HostHandle::NetCapture(handle));
            Ok(Box::new(backend))
        }
        "loopback" => match node.attr_str("loopback_group") {
            None => Ok(Box::new(Loopback::reflect())),
            Some(group) => {
                let key = format!("{}/{}", ctx.guest, group);
                let mut groups = loopback_groups().lock().unwrap();
                match groups.remove(&key) {
                    Some(peer) => Ok(Box::new(peer)),
                    None => {
                        let (end, peer) = loopback_pair();
                        groups.insert(key, peer);
                        Ok(Box::new(end))
                    }
                }
            }
        },
        other => Err(EmulatorError::InvalidConfig(format!(
            "{}: unknown net backend {}",
            id, other
        ))),
    }
}

fn virtio_device(ctx: &ProbeContext, id: &str) -> Result<Box<dyn VirtioDevice>> {
    let node = ctx.node;
    let device_type = match (node.attr_u32("virtio_type"), node.attr_str("virtio_device")) {
        (Some(t), _) => VirtioDeviceType::from(t),
        (None, Some(name)) => VirtioDeviceType::from(name),
        (None, None) => {
            return Err(EmulatorError::InvalidConfig(format!(
                "{}: missing virtio_type",
                id
            )))
        }
    };

    let device: Box<dyn VirtioDevice> = match device_type {
        VirtioDeviceType::Block => {
            let read_only = node.flag("disk_read_only");
            let disk: Box<dyn DiskBackend> =
                match (node.attr_str("disk_path"), node.attr_u64("disk_size")) {
                    (Some(path), _) => {
                        let disk = FileDisk::open(Path::new(path), read_only).map_err(|e| {
                            EmulatorError::InvalidConfig(format!(
                                "{}: cannot open {}: {}",
                                id, path, e
                            ))
                        })?;
                        Box::new(disk)
                    }
                    (None, Some(size)) => Box::new(MemDisk::new(size)),
                    (None, None) => {
                        return Err(EmulatorError::InvalidConfig(format!(
                            "{}: block device needs disk_path or disk_size",
                            id
                        )))
                    }
                };
            let block = Block::new(id.to_string(), disk, read_only);
            publish(id, HostHandle::Block(block.counters()));
            Box::new(block)
        }
        VirtioDeviceType::Net => {
            let mac = node
                .attr_str("mac")
                .map(MacAddr::parse_str)
                .transpose()
                .map_err(|e| EmulatorError::InvalidConfig(format!("{}: {}", id, e)))?;
            let backend = net_backend(ctx, id)?;
            let net = Net::new(id.to_string(), mac, backend);
            if host_handle(id).is_none() {
                publish(id, HostHandle::Net(net.counters()));
            }
            Box::new(net)
        }
        VirtioDeviceType::Console => {
            let (console, input) = Console::new(id.to_string(), ctx.console.clone());
            publish(id, HostHandle::Console(input));
            Box::new(console)
        }
        VirtioDeviceType::Input => {
            let name = node.attr_str("input_name").map(str::to_string);
            let (input, handle) = Input::new(id.to_string(), name);
            publish(id, HostHandle::Input(handle));
            Box::new(input)
        }
        other => {
            return Err(EmulatorError::InvalidConfig(format!(
                "{}: unsupported virtio device {}",
                id, other
            )))
        }
    };
    Ok(device)
}

/// Probe for `virtio,mmio` nodes.
pub fn probe_virtio_mmio(ctx: &ProbeContext) -> Result<Arc<Mutex<dyn Emulator>>> {
    let id = format!("{}/{}", ctx.guest, ctx.node.name);
    let version = ctx.node.attr_u32("virtio_version").unwrap_or(1);
    let irq = ctx.irq_line(0)?;
    let device = virtio_device(ctx, &id)?;
    let transport = MmioTransport::new(id, version, device, ctx.memory.clone(), irq)?;
    Ok(Arc::new(Mutex::new(transport)))
}

/// Emulators implemented by this crate, ready to be registered.
pub fn emulator_kinds() -> Vec<EmulatorKind> {
    vec![EmulatorKind {
        name: "virtio-mmio",
        compatible: VIRTIO_MMIO_COMPATIBLE,
        probe: probe_virtio_mmio,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_device::device_tree::DeviceNode;
    use vm_device::{
        AccessWidth, Endianness, GuestMemoryAccess, GuestTimerService, IrqChip, IrqError,
        IrqRouter, TimerCallback, TimerToken, VcpuIrqSink, VirqKind,
    };
    use vm_virtio::testing::VecMemory;
    use vm_virtio::transport::{MMIO_MAGIC_VALUE, MMIO_VENDOR_ID};

    struct NoChip;

    impl IrqChip for NoChip {
        fn handle(
            &self,
            _line: u32,
            _cpu_hint: Option<usize>,
            _level: bool,
        ) -> std::result::Result<(), IrqError> {
            Ok(())
        }
    }

    struct OneVcpu;

    impl VcpuIrqSink for OneVcpu {
        fn vcpu_count(&self) -> usize {
            1
        }

        fn set_virq(&self, _vcpu: usize, _line: u32, _kind: VirqKind, _level: bool) {}
    }

    struct NoTimers;

    impl GuestTimerService for NoTimers {
        fn now_ns(&self) -> u64 {
            0
        }

        fn start(&self, _deadline_ns: u64, _callback: TimerCallback) -> TimerToken {
            TimerToken(0)
        }

        fn cancel(&self, _token: TimerToken) -> bool {
            false
        }
    }

    fn probe(guest: &str, node: DeviceNode) -> Result<Arc<Mutex<dyn Emulator>>> {
        let router = Arc::new(IrqRouter::new());
        router.register_chip("gic", Arc::new(NoChip)).unwrap();
        let memory: Arc<dyn GuestMemoryAccess> = Arc::new(VecMemory::new(0, 0x1000));
        let ctx = ProbeContext {
            guest,
            node: &node,
            base: 0x0a00_0000,
            size: 0x1000,
            endianness: Endianness::Little,
            router,
            irq_parent: None,
            memory,
            sink: Arc::new(OneVcpu),
            timers: Arc::new(NoTimers),
            console: None,
        };
        probe_virtio_mmio(&ctx)
    }

    fn read(dev: &Arc<Mutex<dyn Emulator>>, offset: u64) -> u64 {
        dev.lock().unwrap().read(0, offset, AccessWidth::Word).unwrap()
    }

    fn node(name: &str) -> DeviceNode {
        DeviceNode::new(name)
            .with_compatible("virtio,mmio")
            .with_u32s("interrupts", &[16])
    }

    #[test]
    fn probes_each_device_type() {
        let nodes = [
            node("blk")
                .with_str("virtio_device", "block")
                .with_u64("disk_size", 4096),
            node("net")
                .with_u32s("virtio_type", &[1])
                .with_str("mac", "52:54:00:00:00:01"),
            node("con").with_str("virtio_device", "console"),
            node("in")
                .with_u32s("virtio_type", &[18])
                .with_u32s("virtio_version", &[2]),
        ];
        let expected = [(2, 1), (1, 1), (3, 1), (18, 2)];
        for (node, (device_id, version)) in nodes.into_iter().zip(expected) {
            let name = node.name.clone();
            let dev = probe("vm0", node).unwrap();
            assert_eq!(read(&dev, 0x0), u64::from(MMIO_MAGIC_VALUE), "{name}");
            assert_eq!(read(&dev, 0x4), version, "{name}");
            assert_eq!(read(&dev, 0x8), device_id, "{name}");
            assert_eq!(read(&dev, 0xc), u64::from(MMIO_VENDOR_ID), "{name}");
        }

        assert!(matches!(host_handle("vm0/blk"), Some(HostHandle::Block(_))));
        assert!(matches!(host_handle("vm0/net"), Some(HostHandle::NetCapture(_))));
        assert!(matches!(host_handle("vm0/con"), Some(HostHandle::Console(_))));
        assert!(matches!(host_handle("vm0/in"), Some(HostHandle::Input(_))));
        release_host_handle("vm0/in");
        assert!(host_handle("vm0/in").is_none());
    }

    #[test]
    fn rejects_bad_nodes() {
        let no_type = node("a");
        assert!(probe("vm1", no_type).is_err());
        let no_disk = node("b").with_str("virtio_device", "block");
        assert!(probe("vm1", no_disk).is_err());
        let no_irq = DeviceNode::new("c").with_str("virtio_device", "console");
        assert!(probe("vm1", no_irq).is_err());
        let bad_version = node("d")
            .with_str("virtio_device", "console")
            .with_u32s("virtio_version", &[3]);
        assert!(probe("vm1", bad_version).is_err());
        let bad_mac = node("e")
            .with_str("virtio_device", "net")
            .with_str("mac", "nope");
        assert!(probe("vm1", bad_mac).is_err());
        let rng = node("f").with_str("virtio_device", "rng");
        assert!(probe("vm1", rng).is_err());
    }

    #[test]
    fn loopback_groups_pair_up() {
        let a = node("a")
            .with_str("virtio_device", "net")
            .with_str("net_backend", "loopback")
            .with_str("loopback_group", "lan");
        let b = a.clone();
        probe("vm2", a).unwrap();
        assert!(loopback_groups().lock().unwrap().contains_key("vm2/lan"));
        probe("vm2", b).unwrap();
        assert!(!loopback_groups().lock().unwrap().contains_key("vm2/lan"));
        assert!(matches!(host_handle("vm2/a"), Some(HostHandle::Net(_))));
    }
}
