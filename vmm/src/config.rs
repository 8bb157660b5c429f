// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs;
use std::path::Path;
use std::time::Duration;

use hypervisor::{Arch, CpuMask, Endianness};
use serde::{Deserialize, Serialize};
use vm_device::device_tree::DeviceNode;

use crate::error::{Error, Result};
use crate::memory_manager::RegionFlags;

pub const DEFAULT_HOST_CPUS: usize = 2;
pub const DEFAULT_HOST_RAM_BASE: u64 = 0x8000_0000;
pub const DEFAULT_HOST_RAM_SIZE: u64 = 256 << 20;
pub const DEFAULT_IOMEM_VA_BASE: u64 = 0xffff_8000_0000;
pub const DEFAULT_IOMEM_VA_SIZE: u64 = 1 << 30;
pub const DEFAULT_TICK: Duration = Duration::from_millis(2);
pub const DEFAULT_DECODE_FAILURE_LIMIT: usize = 8;
pub const DEFAULT_DECODE_FAILURE_WINDOW: Duration = Duration::from_secs(1);
pub const DEFAULT_PAUSE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_VCPUS: usize = 256;

pub const VCPU_MIN_PRIORITY: u8 = 0;
pub const VCPU_MAX_PRIORITY: u8 = 7;
pub const VCPU_DEFAULT_PRIORITY: u8 = 3;
pub const VCPU_DEFAULT_TIME_SLICE_NS: u64 = 10_000_000;
pub const IDLE_VCPU_PRIORITY: u8 = VCPU_MIN_PRIORITY;
pub const IDLE_VCPU_TIME_SLICE_NS: u64 = 100_000_000;

/// Hypervisor-wide settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct VmmConfig {
    pub host_cpus: usize,
    pub host_ram_base: u64,
    pub host_ram_size: u64,
    pub iomem_va_base: u64,
    pub iomem_va_size: u64,
    pub arch: Arch,
    /// Host timer period; every tick a running guest exits to the scheduler.
    pub tick: Duration,
    /// More decode failures than this within `decode_failure_window`
    /// pause the guest.
    pub decode_failure_limit: usize,
    pub decode_failure_window: Duration,
    /// Bound on waiting for a remote VCPU to leave a host CPU.
    pub pause_timeout: Duration,
    pub max_vcpus: usize,
}

impl Default for VmmConfig {
    fn default() -> Self {
        VmmConfig {
            host_cpus: DEFAULT_HOST_CPUS,
            host_ram_base: DEFAULT_HOST_RAM_BASE,
            host_ram_size: DEFAULT_HOST_RAM_SIZE,
            iomem_va_base: DEFAULT_IOMEM_VA_BASE,
            iomem_va_size: DEFAULT_IOMEM_VA_SIZE,
            arch: Arch::Arm32,
            tick: DEFAULT_TICK,
            decode_failure_limit: DEFAULT_DECODE_FAILURE_LIMIT,
            decode_failure_window: DEFAULT_DECODE_FAILURE_WINDOW,
            pause_timeout: DEFAULT_PAUSE_TIMEOUT,
            max_vcpus: DEFAULT_MAX_VCPUS,
        }
    }
}

impl VmmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host_cpus == 0 || self.host_cpus > hypervisor::MAX_HOST_CPUS {
            return Err(Error::Invalid(format!(
                "host CPU count {} out of range",
                self.host_cpus
            )));
        }
        if self.host_ram_size == 0 || self.host_ram_size % PAGE_SIZE != 0 {
            return Err(Error::Invalid(format!(
                "host RAM size {:#x} is not a page multiple",
                self.host_ram_size
            )));
        }
        if self.host_ram_base % PAGE_SIZE != 0 {
            return Err(Error::Invalid(format!(
                "host RAM base {:#x} is not page aligned",
                self.host_ram_base
            )));
        }
        if self.tick.is_zero() {
            return Err(Error::Invalid("zero scheduler tick".to_string()));
        }
        Ok(())
    }
}

pub const PAGE_SIZE: u64 = 0x1000;

/// One `vcpus/<vcpu>` node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VcpuConfig {
    pub name: String,
    pub start_pc: u64,
    pub priority: u8,
    pub time_slice_ns: u64,
    pub affinity: Option<CpuMask>,
}

impl VcpuConfig {
    pub fn from_node(node: &DeviceNode) -> Result<Self> {
        let priority = match node.attr_u32("priority") {
            Some(p) if p > u32::from(VCPU_MAX_PRIORITY) => {
                return Err(Error::Invalid(format!(
                    "{}: priority {} above {}",
                    node.name, p, VCPU_MAX_PRIORITY
                )))
            }
            Some(p) => p as u8,
            None => VCPU_DEFAULT_PRIORITY,
        };
        let time_slice_ns = node
            .attr_u64("time_slice")
            .unwrap_or(VCPU_DEFAULT_TIME_SLICE_NS);
        if time_slice_ns == 0 {
            return Err(Error::Invalid(format!("{}: zero time slice", node.name)));
        }

        Ok(VcpuConfig {
            name: node.name.clone(),
            start_pc: node.attr_u64("start_pc").unwrap_or(0),
            priority,
            time_slice_ns,
            affinity: node.attr_u64("affinity").map(CpuMask::from_bits),
        })
    }
}

/// One `aspace/<region>` node.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionConfig {
    pub name: String,
    pub flags: RegionFlags,
    pub gpa: u64,
    pub size: u64,
    /// Pinned host physical address of a REAL region.
    pub hpa: Option<u64>,
    /// Target guest physical address of an ALIAS region.
    pub alias_gpa: Option<u64>,
    pub node: DeviceNode,
}

impl RegionConfig {
    pub fn from_node(node: &DeviceNode) -> Result<Self> {
        let invalid = |what: &str| Error::Invalid(format!("{}: {}", node.name, what));

        let mut flags = match node.attr_str("manifest_type") {
            Some("real") => RegionFlags::REAL,
            Some("alias") => RegionFlags::ALIAS,
            Some("virtual") => RegionFlags::VIRTUAL,
            Some(other) => return Err(invalid(&format!("unknown manifest_type {:?}", other))),
            None => return Err(invalid("missing manifest_type")),
        };
        flags |= match node.attr_str("address_type") {
            Some("memory") | None => RegionFlags::MEMORY,
            Some("io") => RegionFlags::IO,
            Some(other) => return Err(invalid(&format!("unknown address_type {:?}", other))),
        };
        if node.flag("cacheable") {
            flags |= RegionFlags::CACHEABLE;
        }
        if node.flag("bufferable") {
            flags |= RegionFlags::BUFFERABLE;
        }
        if node.flag("read_only") {
            flags |= RegionFlags::READONLY;
        }

        let gpa = node
            .attr_u64("guest_physical_addr")
            .ok_or_else(|| invalid("missing guest_physical_addr"))?;
        let size = node
            .attr_u64("physical_size")
            .ok_or_else(|| invalid("missing physical_size"))?;
        if size == 0 || gpa.checked_add(size).is_none() {
            return Err(invalid("empty or wrapping range"));
        }

        let alias_gpa = node.attr_u64("alias_phys_addr");
        if flags.contains(RegionFlags::ALIAS) && alias_gpa.is_none() {
            return Err(invalid("alias without alias_phys_addr"));
        }
        if flags.contains(RegionFlags::VIRTUAL) && node.compatible.is_empty() {
            return Err(invalid("virtual region without compatible"));
        }

        let config = RegionConfig {
            name: node.name.clone(),
            flags,
            gpa,
            size,
            hpa: node.attr_u64("host_physical_addr"),
            alias_gpa,
            node: node.clone(),
        };
        config.check_alignment()?;
        Ok(config)
    }

    /// REAL and ALIAS memory regions reach the guest in whole stage-2 pages:
    /// their guest range, host address and alias target must be page
    /// aligned.
    pub fn check_alignment(&self) -> Result<()> {
        if !self.flags.contains(RegionFlags::MEMORY)
            || !self.flags.intersects(RegionFlags::REAL | RegionFlags::ALIAS)
        {
            return Ok(());
        }
        let fields = [
            ("guest_physical_addr", Some(self.gpa)),
            ("physical_size", Some(self.size)),
            ("host_physical_addr", self.hpa),
            ("alias_phys_addr", self.alias_gpa),
        ];
        for (what, value) in fields {
            if let Some(value) = value.filter(|v| v % PAGE_SIZE != 0) {
                return Err(Error::Invalid(format!(
                    "{}: {} {:#x} is not page aligned",
                    self.name, what, value
                )));
            }
        }
        Ok(())
    }
}

/// A `/guests/<name>` node.
#[derive(Clone, Debug, PartialEq)]
pub struct GuestConfig {
    pub name: String,
    pub endianness: Endianness,
    pub vcpus: Vec<VcpuConfig>,
    pub regions: Vec<RegionConfig>,
    pub node: DeviceNode,
}

impl GuestConfig {
    pub fn from_node(node: &DeviceNode) -> Result<Self> {
        if node.name.is_empty() || node.name.contains('/') {
            return Err(Error::Invalid(format!("bad guest name {:?}", node.name)));
        }
        let endianness = match node.attr_str("endianness") {
            None | Some("little") => Endianness::Little,
            Some("big") => Endianness::Big,
            Some(other) => {
                return Err(Error::Invalid(format!(
                    "{}: unknown endianness {:?}",
                    node.name, other
                )))
            }
        };

        let vcpus: Vec<VcpuConfig> = node
            .child("vcpus")
            .map(|v| v.children.iter().map(VcpuConfig::from_node).collect())
            .transpose()?
            .unwrap_or_default();
        if vcpus.is_empty() {
            return Err(Error::Invalid(format!("{}: no VCPUs", node.name)));
        }

        let regions = node
            .child("aspace")
            .map(|a| a.children.iter().map(RegionConfig::from_node).collect())
            .transpose()?
            .unwrap_or_default();

        Ok(GuestConfig {
            name: node.name.clone(),
            endianness,
            vcpus,
            regions,
            node: node.clone(),
        })
    }
}

/// Read a configuration tree from a JSON document or a flattened device
/// tree blob.
pub fn load_tree(path: &Path, dtb: bool) -> Result<DeviceNode> {
    let tree = if dtb {
        let blob = fs::read(path).map_err(Error::Io)?;
        DeviceNode::from_fdt(&blob)
    } else {
        let json = fs::read_to_string(path).map_err(Error::Io)?;
        DeviceNode::from_json(&json)
    };
    tree.map_err(|e| Error::Invalid(format!("{}: {}", path.display(), e)))
}

/// Guest nodes under `/guests`.
pub fn guest_nodes(tree: &DeviceNode) -> Vec<&DeviceNode> {
    tree.find("guests")
        .map(|g| g.children.iter().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_device::device_tree::AttrValue;

    fn ram(name: &str, gpa: u64, size: u64) -> DeviceNode {
        DeviceNode::new(name)
            .with_str("manifest_type", "real")
            .with_str("address_type", "memory")
            .with_u64("guest_physical_addr", gpa)
            .with_u64("physical_size", size)
    }

    #[test]
    fn region_flags_from_node() {
        let node = ram("mem0", 0x4000_0000, 0x20_0000).with_u32s("cacheable", &[1]);
        let r = RegionConfig::from_node(&node).unwrap();
        assert_eq!(
            r.flags,
            RegionFlags::REAL | RegionFlags::MEMORY | RegionFlags::CACHEABLE
        );
        assert_eq!(r.hpa, None);

        let node = DeviceNode::new("uart0")
            .with_compatible("arm,pl011")
            .with_str("manifest_type", "virtual")
            .with_u64("guest_physical_addr", 0x0900_0000)
            .with_u64("physical_size", 0x1000)
            .with_attr("read_only", AttrValue::Bytes(vec![]));
        let r = RegionConfig::from_node(&node).unwrap();
        assert!(r.flags.contains(RegionFlags::VIRTUAL | RegionFlags::READONLY));
    }

    #[test]
    fn bad_region_nodes() {
        let node = ram("mem0", 0, 0);
        assert!(RegionConfig::from_node(&node).is_err());
        let node = DeviceNode::new("a")
            .with_str("manifest_type", "alias")
            .with_u64("guest_physical_addr", 0)
            .with_u64("physical_size", 0x1000);
        assert!(RegionConfig::from_node(&node).is_err());
        let node = DeviceNode::new("v")
            .with_str("manifest_type", "virtual")
            .with_u64("guest_physical_addr", 0)
            .with_u64("physical_size", 0x1000);
        assert!(RegionConfig::from_node(&node).is_err());
    }

    #[test]
    fn misaligned_regions_are_rejected() {
        let bad = [
            ram("gpa", 0x4000_0800, 0x1000),
            ram("size", 0x4000_0000, 0x800),
            ram("hpa", 0x4000_0000, 0x1000).with_u64("host_physical_addr", 0x8000_0100),
            DeviceNode::new("alias")
                .with_str("manifest_type", "alias")
                .with_u64("guest_physical_addr", 0)
                .with_u64("physical_size", 0x1000)
                .with_u64("alias_phys_addr", 0x4000_0010),
        ];
        for node in &bad {
            let err = RegionConfig::from_node(node).unwrap_err();
            assert!(matches!(err, Error::Invalid(_)), "{}: {:?}", node.name, err);
        }

        // Emulated registers and I/O ports have no page granularity.
        let uart = DeviceNode::new("uart")
            .with_compatible("arm,pl011")
            .with_str("manifest_type", "virtual")
            .with_u64("guest_physical_addr", 0x0900_0800)
            .with_u64("physical_size", 0x100);
        RegionConfig::from_node(&uart).unwrap();
        let ports = ram("pio", 0x3f8, 8).with_str("address_type", "io");
        RegionConfig::from_node(&ports).unwrap();
    }

    #[test]
    fn guest_node_shape() {
        let guest = DeviceNode::new("guest0")
            .with_str("endianness", "big")
            .with_child(
                DeviceNode::new("vcpus").with_child(
                    DeviceNode::new("vcpu0")
                        .with_u64("start_pc", 0x4000_0000)
                        .with_u32s("priority", &[5])
                        .with_u64("affinity", 0b10),
                ),
            )
            .with_child(DeviceNode::new("aspace").with_child(ram("mem0", 0x4000_0000, 0x1000)));
        let g = GuestConfig::from_node(&guest).unwrap();
        assert_eq!(g.endianness, Endianness::Big);
        assert_eq!(g.vcpus[0].start_pc, 0x4000_0000);
        assert_eq!(g.vcpus[0].priority, 5);
        assert_eq!(g.vcpus[0].time_slice_ns, VCPU_DEFAULT_TIME_SLICE_NS);
        assert_eq!(g.vcpus[0].affinity, Some(CpuMask::single(1)));
        assert_eq!(g.regions.len(), 1);

        let no_vcpus = DeviceNode::new("guest1");
        assert!(GuestConfig::from_node(&no_vcpus).is_err());
    }

    #[test]
    fn default_config_is_valid() {
        let config = VmmConfig::default();
        config.validate().unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: VmmConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        let partial: VmmConfig = serde_json::from_str(r#"{"host_cpus": 4}"#).unwrap();
        assert_eq!(partial.host_cpus, 4);
        assert_eq!(partial.max_vcpus, DEFAULT_MAX_VCPUS);

        let bad = VmmConfig {
            host_cpus: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
