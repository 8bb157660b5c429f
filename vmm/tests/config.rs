// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

mod common;

use std::io::Write;

use common::*;
use vm_fdt::FdtWriter;
use vmm::config::load_tree;
use vmm::{RegionFlags, VcpuState};
use vmm_sys_util::tempfile::TempFile;

fn guests_blob() -> Vec<u8> {
    let mut fdt = FdtWriter::new().unwrap();
    let root = fdt.begin_node("").unwrap();
    let guests = fdt.begin_node("guests").unwrap();
    for (name, base) in [("g0", 0x4000_0000u32), ("g1", 0x6000_0000)] {
        let guest = fdt.begin_node(name).unwrap();
        let vcpus = fdt.begin_node("vcpus").unwrap();
        let vcpu = fdt.begin_node("vcpu0").unwrap();
        fdt.property_array_u32("start_pc", &[0, base]).unwrap();
        fdt.end_node(vcpu).unwrap();
        fdt.end_node(vcpus).unwrap();

        let aspace = fdt.begin_node("aspace").unwrap();
        let mem = fdt.begin_node("mem").unwrap();
        fdt.property_string("manifest_type", "real").unwrap();
        fdt.property_string("address_type", "memory").unwrap();
        fdt.property_array_u32("guest_physical_addr", &[0, base])
            .unwrap();
        fdt.property_u32("physical_size", 0x10_0000).unwrap();
        fdt.property_null("cacheable").unwrap();
        fdt.end_node(mem).unwrap();
        let uart = fdt.begin_node("uart0").unwrap();
        fdt.property_string("compatible", "arm,pl011").unwrap();
        fdt.property_string("manifest_type", "virtual").unwrap();
        fdt.property_string("address_type", "memory").unwrap();
        fdt.property_array_u32("guest_physical_addr", &[0, 0x0900_0000])
            .unwrap();
        fdt.property_u32("physical_size", 0x1000).unwrap();
        fdt.end_node(uart).unwrap();
        fdt.end_node(aspace).unwrap();
        fdt.end_node(guest).unwrap();
    }
    fdt.end_node(guests).unwrap();
    fdt.end_node(root).unwrap();
    fdt.finish().unwrap()
}

#[test]
fn guests_from_a_device_tree_blob() {
    let file = TempFile::new().unwrap();
    file.as_file().write_all(&guests_blob()).unwrap();
    let tree = load_tree(file.as_path(), true).unwrap();

    let t = TestVmm::new(1);
    let guests = t.vmm.guests_create(&tree).unwrap();
    assert_eq!(guests.len(), 2);

    let regions = t.vmm.region_list("g1").unwrap();
    assert_eq!(regions.len(), 2);
    let mem = regions.iter().find(|r| r.name == "mem").unwrap();
    assert_eq!((mem.gpa, mem.size), (0x6000_0000, 0x10_0000));
    assert!(mem.flags.contains(RegionFlags::REAL | RegionFlags::CACHEABLE));
    assert!(mem.hpa.is_some());
    let uart = regions.iter().find(|r| r.name == "uart0").unwrap();
    assert!(uart.flags.contains(RegionFlags::VIRTUAL));
    assert!(uart.emulator.as_deref().unwrap().contains("pl011"));

    let g1 = t.vmm.guest("g1").unwrap();
    assert_eq!(g1.vcpus()[0].pc(), 0x6000_0000);
    let listed: Vec<_> = t.vmm.guest_list().into_iter().map(|g| g.name).collect();
    assert_eq!(listed, vec!["g0", "g1"]);

    // A second pass collides on the first guest name.
    assert!(t.vmm.guests_create(&tree).is_err());
}

#[test]
fn guests_from_json() {
    let json = r#"{
        "name": "",
        "children": [{
            "name": "guests",
            "children": [{
                "name": "j0",
                "attrs": { "endianness": "little" },
                "children": [
                    { "name": "vcpus", "children": [
                        { "name": "vcpu0", "attrs": { "start_pc": 1073741824, "priority": 2 } },
                        { "name": "vcpu1", "attrs": { "start_pc": 1073741824 } }
                    ]},
                    { "name": "aspace", "children": [
                        { "name": "ram", "attrs": {
                            "manifest_type": "real",
                            "address_type": "memory",
                            "guest_physical_addr": 1073741824,
                            "physical_size": 1048576
                        }}
                    ]}
                ]
            }]
        }]
    }"#;
    let file = TempFile::new().unwrap();
    file.as_file().write_all(json.as_bytes()).unwrap();
    let tree = load_tree(file.as_path(), false).unwrap();

    let t = TestVmm::new(2);
    t.vmm.guests_create(&tree).unwrap();
    let info = t.vmm.guest_list().remove(0);
    assert_eq!(info.name, "j0");
    assert_eq!(
        info.vcpus,
        vec![
            ("j0/vcpu0".to_string(), VcpuState::Created),
            ("j0/vcpu1".to_string(), VcpuState::Created),
        ]
    );
    let stats = t.vmm.vcpu_stats("j0").unwrap();
    assert_eq!(stats[0].priority, 2);
    assert!(t.vmm.vcpu_dumpreg("j0", "vcpu1").unwrap().contains("pc"));
    assert!(t.vmm.vcpu_dumpreg("j0", "vcpu7").is_err());
}

#[test]
fn block_device_backed_by_a_file() {
    let disk = TempFile::new().unwrap();
    disk.as_file().set_len(8192).unwrap();
    let gic = emulated_node("gic", "arm,cortex-a15-gic", 0x0800_0000, 0x3000)
        .with_u32s("interrupt-controller", &[]);
    let blk = emulated_node("blk", "virtio,mmio", 0x0a00_0000, 0x1000)
        .with_str("virtio_device", "block")
        .with_str("disk_path", disk.as_path().to_str().unwrap())
        .with_u32s("interrupts", &[40])
        .with_str("interrupt-parent", "gic");

    let t = TestVmm::new(1);
    let guest = t.create(&simple_guest("disk", vec![gic, blk]));
    let dev = emulator_at(&guest, 0x0a00_0000);
    assert_eq!(mmio_read(&dev, 0x8), 2);
    // Legacy layout: capacity in 512 byte sectors at the start of config.
    assert_eq!(mmio_read(&dev, 0x100), 16);

    t.vmm.guest_destroy("disk").unwrap();
    assert!(virtio_devices::host_handle("disk/blk").is_none());
}

#[test]
fn missing_files_are_io_errors() {
    let err = load_tree(std::path::Path::new("/nonexistent/guests.dtb"), true).unwrap_err();
    assert_eq!(err.kind(), vmm::ErrorKind::IoError);
}

#[test]
fn sub_page_ram_is_rejected() {
    let t = TestVmm::new(1);
    let half_page = guest_node(
        "half",
        vec![vcpu_node("vcpu0", RAM_BASE)],
        vec![
            ram_node("ram", RAM_BASE, 0x800),
            emulated_node("zero", "xvisor,zero", RAM_BASE + 0x800, 0x800),
        ],
    );
    let err = t.vmm.guest_create(&half_page).unwrap_err();
    assert_eq!(err.kind(), vmm::ErrorKind::Invalid);

    let shifted = guest_node(
        "shifted",
        vec![vcpu_node("vcpu0", RAM_BASE)],
        vec![ram_node("ram", RAM_BASE + 0x800, 0x1000)],
    );
    assert_eq!(
        t.vmm.guest_create(&shifted).unwrap_err().kind(),
        vmm::ErrorKind::Invalid
    );
    assert!(t.vmm.guest_list().is_empty());
}
