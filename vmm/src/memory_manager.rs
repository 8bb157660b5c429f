// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest physical address spaces.
//!
//! Every guest owns an ordered set of non-overlapping regions in each of its
//! two spaces (memory and I/O ports). REAL memory regions are backed by host
//! RAM handed out by [`HostRam`] and reach the guest through lazily filled
//! stage-2 entries; VIRTUAL regions always trap to their emulator.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use bitflags::bitflags;
use hypervisor::AccessKind;
use vm_allocator::{AddressAllocator, IomemMapper, IomemMapping};
use vm_device::{EmulatorId, GuestMemoryAccess, MemoryAccessError};
use vm_memory::{GuestAddress, GuestUsize};

use crate::config::{RegionConfig, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::stage2::{MemAttr, Stage2Attrs, Stage2Perm, Stage2Table};

/// Alias chains longer than this are configuration loops.
const MAX_ALIAS_DEPTH: usize = 4;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u32 {
        const REAL = 1 << 0;
        const VIRTUAL = 1 << 1;
        const ALIAS = 1 << 2;
        const MEMORY = 1 << 3;
        const IO = 1 << 4;
        const CACHEABLE = 1 << 5;
        const BUFFERABLE = 1 << 6;
        const READONLY = 1 << 7;
    }
}

impl RegionFlags {
    pub fn space(&self) -> AddressKind {
        if self.contains(RegionFlags::IO) {
            AddressKind::Io
        } else {
            AddressKind::Memory
        }
    }
}

impl fmt::Display for RegionFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<String> = self
            .iter_names()
            .map(|(name, _)| name.to_lowercase())
            .collect();
        write!(f, "{}", names.join(","))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Memory,
    Io,
}

/// Physical memory of the host, shared by every guest and by the stage-2
/// tables.
pub struct HostRam {
    base: u64,
    size: u64,
    bytes: RwLock<Vec<u8>>,
    allocator: Mutex<AddressAllocator>,
}

fn allocator_error(e: vm_allocator::Error, what: &str) -> Error {
    match e {
        vm_allocator::Error::Exhausted(_) => Error::OutOfMemory(what.to_string()),
        vm_allocator::Error::Overlap => Error::AlreadyExists(what.to_string()),
        vm_allocator::Error::NotAllocated(_) => Error::NotFound(what.to_string()),
        e => Error::Invalid(format!("{}: {}", what, e)),
    }
}

impl HostRam {
    pub fn new(base: u64, size: u64) -> Result<Self> {
        let allocator = AddressAllocator::new(GuestAddress(base), size, Some(PAGE_SIZE))
            .ok_or_else(|| Error::Invalid(format!("host RAM [{:#x}, +{:#x})", base, size)))?;
        let len = usize::try_from(size)
            .map_err(|_| Error::OutOfMemory(format!("{:#x} bytes of host RAM", size)))?;
        info!("host RAM [{:#x}, +{:#x})", base, size);
        Ok(HostRam {
            base,
            size,
            bytes: RwLock::new(vec![0u8; len]),
            allocator: Mutex::new(allocator),
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn contains(&self, hpa: u64, len: u64) -> bool {
        hpa >= self.base
            && hpa
                .checked_add(len)
                .is_some_and(|end| end <= self.base + self.size)
    }

    /// Zeroed pages taken first fit from the pool.
    pub fn alloc(&self, size: GuestUsize) -> Result<u64> {
        let hpa = self
            .allocator
            .lock()
            .unwrap()
            .allocate(None, page_align(size))
            .map_err(|e| allocator_error(e, &format!("{:#x} bytes of host RAM", size)))?
            .0;
        self.zero(hpa, page_align(size));
        Ok(hpa)
    }

    /// Claim the exact range `[hpa, hpa + size)`.
    pub fn reserve(&self, hpa: u64, size: GuestUsize) -> Result<()> {
        self.allocator
            .lock()
            .unwrap()
            .allocate(Some(GuestAddress(hpa)), page_align(size))
            .map_err(|e| allocator_error(e, &format!("host RAM at {:#x}", hpa)))?;
        Ok(())
    }

    pub fn free(&self, hpa: u64) -> Result<GuestUsize> {
        self.allocator
            .lock()
            .unwrap()
            .free(GuestAddress(hpa))
            .map_err(|e| allocator_error(e, &format!("host RAM at {:#x}", hpa)))
    }

    pub fn allocated(&self) -> GuestUsize {
        self.allocator.lock().unwrap().allocated()
    }

    fn span(&self, hpa: u64, len: usize) -> Result<std::ops::Range<usize>> {
        if !self.contains(hpa, len as u64) {
            return Err(Error::BadGuestAccess { gpa: hpa });
        }
        let start = (hpa - self.base) as usize;
        Ok(start..start + len)
    }

    pub fn read(&self, hpa: u64, buf: &mut [u8]) -> Result<()> {
        let span = self.span(hpa, buf.len())?;
        buf.copy_from_slice(&self.bytes.read().unwrap()[span]);
        Ok(())
    }

    pub fn write(&self, hpa: u64, buf: &[u8]) -> Result<()> {
        let span = self.span(hpa, buf.len())?;
        self.bytes.write().unwrap()[span].copy_from_slice(buf);
        Ok(())
    }

    pub fn read_u64(&self, hpa: u64) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read(hpa, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn write_u64(&self, hpa: u64, value: u64) -> Result<()> {
        self.write(hpa, &value.to_le_bytes())
    }

    fn zero(&self, hpa: u64, len: u64) {
        if let Ok(span) = self.span(hpa, len as usize) {
            self.bytes.write().unwrap()[span].fill(0);
        }
    }
}

fn page_align(size: u64) -> u64 {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Where the contents of a region come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backing {
    None,
    /// Host RAM; `owned` when the range was allocated for this region.
    HostRam { hpa: u64, owned: bool },
    /// Host device memory mapped through the IOMEM mapper.
    Iomem(IomemMapping),
}

#[derive(Clone, Debug)]
pub struct Region {
    pub name: String,
    pub gpa: u64,
    pub size: u64,
    pub flags: RegionFlags,
    pub alias_gpa: Option<u64>,
    pub emulator: Option<EmulatorId>,
    pub backing: Backing,
}

impl Region {
    pub fn end(&self) -> u64 {
        self.gpa + self.size
    }

    pub fn contains(&self, gpa: u64) -> bool {
        gpa >= self.gpa && gpa < self.end()
    }

    /// Guest RAM: REAL memory backed by host RAM.
    pub fn is_ram(&self) -> bool {
        self.flags.contains(RegionFlags::REAL | RegionFlags::MEMORY)
            && matches!(self.backing, Backing::HostRam { .. })
    }

    pub fn hpa(&self) -> Option<u64> {
        match &self.backing {
            Backing::HostRam { hpa, .. } => Some(*hpa),
            Backing::Iomem(m) => Some(m.hpa),
            Backing::None => None,
        }
    }

    /// Stage-2 attributes of pages of this region.
    pub fn stage2_attrs(&self) -> Stage2Attrs {
        let cacheable = self.flags.contains(RegionFlags::CACHEABLE);
        let bufferable = self.flags.contains(RegionFlags::BUFFERABLE);
        let mem = match (&self.backing, cacheable, bufferable) {
            (Backing::HostRam { .. }, true, true) => MemAttr::NormalWriteBack,
            (Backing::HostRam { .. }, true, false) => MemAttr::NormalWriteThrough,
            (Backing::HostRam { .. }, false, true) => MemAttr::NormalNonCacheable,
            _ => MemAttr::Device,
        };
        Stage2Attrs {
            perm: if self.flags.contains(RegionFlags::READONLY) {
                Stage2Perm::ReadOnly
            } else {
                Stage2Perm::ReadWrite
            },
            mem,
            exec: mem != MemAttr::Device,
        }
    }
}

/// One line of `region_list`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    pub name: String,
    pub gpa: u64,
    pub size: u64,
    pub flags: RegionFlags,
    pub hpa: Option<u64>,
    pub alias_gpa: Option<u64>,
    pub emulator: Option<String>,
}

impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:<16} {:#018x} {:#012x} {:<32}",
            self.name, self.gpa, self.size, self.flags
        )?;
        match (&self.emulator, self.hpa, self.alias_gpa) {
            (Some(emu), _, _) => write!(f, " emulator {}", emu),
            (None, Some(hpa), _) => write!(f, " hpa {:#x}", hpa),
            (None, None, Some(alias)) => write!(f, " alias {:#x}", alias),
            _ => Ok(()),
        }
    }
}

type RegionMap = BTreeMap<u64, Arc<Region>>;

/// Region database of one guest.
#[derive(Default)]
pub struct AddressSpace {
    memory: RwLock<RegionMap>,
    io: RwLock<RegionMap>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, space: AddressKind) -> &RwLock<RegionMap> {
        match space {
            AddressKind::Memory => &self.memory,
            AddressKind::Io => &self.io,
        }
    }

    fn overlapping(map: &RegionMap, gpa: u64, size: u64) -> Option<Arc<Region>> {
        let last = gpa + size - 1;
        map.range(..=last)
            .next_back()
            .filter(|(_, r)| r.end() > gpa)
            .map(|(_, r)| r.clone())
    }

    pub fn insert(&self, region: Region) -> Result<Arc<Region>> {
        let mut map = self.map(region.flags.space()).write().unwrap();
        if let Some(other) = Self::overlapping(&map, region.gpa, region.size) {
            return Err(Error::AlreadyExists(format!(
                "region overlapping {} [{:#x}, {:#x})",
                other.name,
                other.gpa,
                other.end()
            )));
        }
        let region = Arc::new(region);
        map.insert(region.gpa, region.clone());
        Ok(region)
    }

    pub fn remove(&self, space: AddressKind, gpa: u64) -> Result<Arc<Region>> {
        self.map(space)
            .write()
            .unwrap()
            .remove(&gpa)
            .ok_or_else(|| Error::NotFound(format!("region at {:#x}", gpa)))
    }

    /// Region containing `gpa`, in O(log n).
    pub fn find(&self, space: AddressKind, gpa: u64) -> Option<Arc<Region>> {
        self.map(space)
            .read()
            .unwrap()
            .range(..=gpa)
            .next_back()
            .map(|(_, r)| r.clone())
            .filter(|r| r.contains(gpa))
    }

    /// Follow aliases from `gpa`; returns the final region and the address
    /// inside it.
    pub fn resolve(&self, space: AddressKind, gpa: u64) -> Result<(Arc<Region>, u64)> {
        self.resolve_chain(space, gpa)
            .map(|(region, addr, _)| (region, addr))
    }

    /// [`resolve`](Self::resolve), plus the READONLY flag of any region
    /// crossed on the way: an alias cannot grant more than it is given.
    pub fn resolve_chain(
        &self,
        space: AddressKind,
        gpa: u64,
    ) -> Result<(Arc<Region>, u64, RegionFlags)> {
        let mut addr = gpa;
        let mut restrict = RegionFlags::empty();
        for _ in 0..=MAX_ALIAS_DEPTH {
            let region = self
                .find(space, addr)
                .ok_or(Error::BadGuestAccess { gpa })?;
            restrict |= region.flags & RegionFlags::READONLY;
            match region.alias_gpa {
                Some(target) if region.flags.contains(RegionFlags::ALIAS) => {
                    addr = target + (addr - region.gpa);
                }
                _ => return Ok((region, addr, restrict)),
            }
        }
        warn!("alias chain too deep at {:#x}", gpa);
        Err(Error::BadGuestAccess { gpa })
    }

    pub fn regions(&self, space: AddressKind) -> Vec<Arc<Region>> {
        self.map(space).read().unwrap().values().cloned().collect()
    }

    /// Copy between guest RAM and `buf`, region by region.
    fn for_each_ram_chunk(
        &self,
        gpa: u64,
        len: usize,
        mut f: impl FnMut(u64, std::ops::Range<usize>) -> Result<()>,
    ) -> Result<()> {
        let mut done = 0usize;
        while done < len {
            let addr = gpa + done as u64;
            let (region, target) = self.resolve(AddressKind::Memory, addr)?;
            let Backing::HostRam { hpa, .. } = region.backing else {
                return Err(Error::BadGuestAccess { gpa: addr });
            };
            if !region.is_ram() {
                return Err(Error::BadGuestAccess { gpa: addr });
            }
            let chunk = ((region.end() - target) as usize).min(len - done);
            f(hpa + (target - region.gpa), done..done + chunk)?;
            done += chunk;
        }
        Ok(())
    }
}

/// DMA view of a guest's RAM for emulators.
pub struct GuestMemory {
    aspace: Arc<AddressSpace>,
    host: Arc<HostRam>,
}

impl GuestMemory {
    pub fn new(aspace: Arc<AddressSpace>, host: Arc<HostRam>) -> Self {
        GuestMemory { aspace, host }
    }

    pub fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        self.aspace
            .for_each_ram_chunk(gpa, len, |hpa, range| self.host.read(hpa, &mut buf[range]))
    }

    pub fn write(&self, gpa: u64, buf: &[u8]) -> Result<()> {
        self.aspace
            .for_each_ram_chunk(gpa, buf.len(), |hpa, range| self.host.write(hpa, &buf[range]))
    }
}

impl GuestMemoryAccess for GuestMemory {
    fn read(&self, gpa: u64, buf: &mut [u8]) -> std::result::Result<(), MemoryAccessError> {
        GuestMemory::read(self, gpa, buf).map_err(|_| MemoryAccessError::BadGuestAccess {
            gpa,
            len: buf.len(),
        })
    }

    fn write(&self, gpa: u64, buf: &[u8]) -> std::result::Result<(), MemoryAccessError> {
        GuestMemory::write(self, gpa, buf).map_err(|_| MemoryAccessError::BadGuestAccess {
            gpa,
            len: buf.len(),
        })
    }
}

/// Outcome of a stage-2 fault on guest memory.
#[derive(Clone, Debug)]
pub enum Stage2Fill {
    /// A translation was installed; the guest can retry the access.
    Mapped { gpa: u64, hpa: u64 },
    /// The address belongs to an emulated region.
    Virtual { region: Arc<Region>, offset: u64 },
}

/// Address space, stage-2 table and backing store of one guest.
pub struct MemoryManager {
    guest: String,
    aspace: Arc<AddressSpace>,
    stage2: Stage2Table,
    host: Arc<HostRam>,
    iomem: Arc<IomemMapper>,
    memory: Arc<GuestMemory>,
    // Region updates exclude stage-2 fills; fills run concurrently.
    update: RwLock<()>,
}

impl MemoryManager {
    pub fn new(
        guest: &str,
        stage2: Stage2Table,
        host: Arc<HostRam>,
        iomem: Arc<IomemMapper>,
    ) -> Self {
        let aspace = Arc::new(AddressSpace::new());
        let memory = Arc::new(GuestMemory::new(aspace.clone(), host.clone()));
        MemoryManager {
            guest: guest.to_string(),
            aspace,
            stage2,
            host,
            iomem,
            memory,
            update: RwLock::new(()),
        }
    }

    pub fn aspace(&self) -> &Arc<AddressSpace> {
        &self.aspace
    }

    pub fn stage2(&self) -> &Stage2Table {
        &self.stage2
    }

    pub fn guest_memory(&self) -> Arc<GuestMemory> {
        self.memory.clone()
    }

    pub fn host(&self) -> &Arc<HostRam> {
        &self.host
    }

    /// Add a region described by `config`, acquiring its backing.
    pub fn region_add(
        &self,
        config: &RegionConfig,
        emulator: Option<EmulatorId>,
    ) -> Result<Arc<Region>> {
        config.check_alignment()?;
        let _guard = self.update.write().unwrap();

        if self
            .aspace
            .find(config.flags.space(), config.gpa)
            .is_some()
        {
            return Err(Error::AlreadyExists(format!(
                "{}: region at {:#x}",
                self.guest, config.gpa
            )));
        }

        let backing = self.acquire_backing(config)?;
        let region = Region {
            name: config.name.clone(),
            gpa: config.gpa,
            size: config.size,
            flags: config.flags,
            alias_gpa: config.alias_gpa,
            emulator,
            backing: backing.clone(),
        };
        match self.aspace.insert(region) {
            Ok(region) => {
                debug!(
                    "{}: region {} [{:#x}, {:#x}) {}",
                    self.guest,
                    region.name,
                    region.gpa,
                    region.end(),
                    region.flags
                );
                Ok(region)
            }
            Err(e) => {
                self.release_backing(&backing);
                Err(e)
            }
        }
    }

    fn acquire_backing(&self, config: &RegionConfig) -> Result<Backing> {
        if !config.flags.contains(RegionFlags::REAL) {
            return Ok(Backing::None);
        }
        match config.hpa {
            None if config.flags.contains(RegionFlags::MEMORY) => Ok(Backing::HostRam {
                hpa: self.host.alloc(config.size)?,
                owned: true,
            }),
            None => Err(Error::Invalid(format!(
                "{}: {} needs host_physical_addr",
                self.guest, config.name
            ))),
            Some(hpa) if self.host.contains(hpa, config.size) => {
                self.host.reserve(hpa, config.size)?;
                Ok(Backing::HostRam { hpa, owned: true })
            }
            Some(hpa) => {
                let mapping = self
                    .iomem
                    .map(hpa, config.size)
                    .map_err(|e| allocator_error(e, &format!("IOMEM at {:#x}", hpa)))?;
                Ok(Backing::Iomem(mapping))
            }
        }
    }

    fn release_backing(&self, backing: &Backing) {
        let result = match backing {
            Backing::None | Backing::HostRam { owned: false, .. } => Ok(()),
            Backing::HostRam { hpa, owned: true } => self.host.free(*hpa).map(|_| ()),
            Backing::Iomem(m) => self
                .iomem
                .unmap(m.hpa, m.size)
                .map(|_| ())
                .map_err(|e| allocator_error(e, "IOMEM mapping")),
        };
        if let Err(e) = result {
            error!("{}: cannot release region backing: {}", self.guest, e);
        }
    }

    /// Remove the region starting at `gpa`: its stage-2 entries go first,
    /// then its backing.
    pub fn region_del(&self, space: AddressKind, gpa: u64) -> Result<Arc<Region>> {
        let _guard = self.update.write().unwrap();
        let region = self.aspace.remove(space, gpa)?;
        if space == AddressKind::Memory {
            let dropped = self.unmap_region(&region);
            debug!(
                "{}: region {} removed, {} stage-2 pages dropped",
                self.guest, region.name, dropped
            );
        }
        self.release_backing(&region.backing);
        Ok(region)
    }

    /// Stage-2 entries of `region` and of every alias onto it.
    fn unmap_region(&self, region: &Region) -> usize {
        let mut dropped = self.stage2.unmap_range(region.gpa, region.size);
        for alias in self.aspace.regions(AddressKind::Memory) {
            let Some(target) = alias.alias_gpa else {
                continue;
            };
            if target < region.end() && target + alias.size > region.gpa {
                dropped += self.stage2.unmap_range(alias.gpa, alias.size);
            }
        }
        dropped
    }

    pub fn region_find(&self, space: AddressKind, gpa: u64) -> Option<Arc<Region>> {
        self.aspace.find(space, gpa)
    }

    /// Resolve a stage-2 fault at `ipa`, installing a translation for RAM.
    pub fn stage2_fill(&self, ipa: u64, access: AccessKind) -> Result<Stage2Fill> {
        let _guard = self.update.read().unwrap();
        let (region, target, restrict) = self.aspace.resolve_chain(AddressKind::Memory, ipa)?;

        if region.flags.contains(RegionFlags::VIRTUAL) {
            return Ok(Stage2Fill::Virtual {
                offset: target - region.gpa,
                region,
            });
        }
        let Some(base) = region.hpa() else {
            return Err(Error::BadGuestAccess { gpa: ipa });
        };
        let mut attrs = region.stage2_attrs();
        if restrict.contains(RegionFlags::READONLY) {
            attrs.perm = Stage2Perm::ReadOnly;
        }
        if access == AccessKind::Write && attrs.perm == Stage2Perm::ReadOnly {
            return Err(Error::WriteToReadOnly { gpa: ipa });
        }
        if access == AccessKind::Execute && !attrs.exec {
            return Err(Error::BadGuestAccess { gpa: ipa });
        }

        let gpa = ipa & !(PAGE_SIZE - 1);
        let hpa = (base + (target - region.gpa)) & !(PAGE_SIZE - 1);
        self.stage2.map_page(gpa, hpa, attrs)?;
        Ok(Stage2Fill::Mapped { gpa, hpa })
    }

    pub fn guest_read(&self, gpa: u64, buf: &mut [u8]) -> Result<()> {
        self.memory.read(gpa, buf)
    }

    pub fn guest_write(&self, gpa: u64, buf: &[u8]) -> Result<()> {
        self.memory.write(gpa, buf)
    }

    /// Forget every stage-2 translation. RAM contents are kept.
    pub fn reset(&self) {
        let _guard = self.update.write().unwrap();
        self.stage2.clear();
    }

    pub fn region_list(
        &self,
        emulator_name: impl Fn(EmulatorId) -> Option<String>,
    ) -> Vec<RegionInfo> {
        [AddressKind::Memory, AddressKind::Io]
            .into_iter()
            .flat_map(|space| self.aspace.regions(space))
            .map(|r| RegionInfo {
                name: r.name.clone(),
                gpa: r.gpa,
                size: r.size,
                flags: r.flags,
                hpa: r.hpa(),
                alias_gpa: r.alias_gpa,
                emulator: r.emulator.and_then(&emulator_name),
            })
            .collect()
    }

    /// Remove every region, last added first.
    pub fn teardown(&self) -> Vec<Arc<Region>> {
        let mut removed = Vec::new();
        for space in [AddressKind::Io, AddressKind::Memory] {
            for region in self.aspace.regions(space).into_iter().rev() {
                match self.region_del(space, region.gpa) {
                    Ok(r) => removed.push(r),
                    Err(e) => error!("{}: cannot remove {}: {}", self.guest, region.name, e),
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;
    use hypervisor::{CpuMask, Hal, SoftHal};
    use vm_device::device_tree::DeviceNode;

    fn region(name: &str, kind: &str, gpa: u64, size: u64) -> RegionConfig {
        let mut node = DeviceNode::new(name)
            .with_str("manifest_type", kind)
            .with_u64("guest_physical_addr", gpa)
            .with_u64("physical_size", size);
        if kind == "virtual" {
            node = node.with_compatible("xvisor,zero");
        }
        if kind == "alias" {
            node = node.with_u64("alias_phys_addr", 0);
        }
        RegionConfig::from_node(&node).unwrap()
    }

    fn manager() -> MemoryManager {
        let host = Arc::new(HostRam::new(0x8000_0000, 0x100_0000).unwrap());
        let hal: Arc<dyn Hal> = Arc::new(SoftHal::new(2));
        let stage2 = Stage2Table::new(1, host.clone(), hal, CpuMask::first_n(2)).unwrap();
        let iomem = Arc::new(IomemMapper::new(0xffff_8000_0000, 0x100_0000, PAGE_SIZE).unwrap());
        MemoryManager::new("g0", stage2, host, iomem)
    }

    #[test]
    fn regions_never_overlap() {
        let mm = manager();
        mm.region_add(&region("ram", "real", 0x4000_0000, 0x10_0000), None)
            .unwrap();
        let err = mm
            .region_add(&region("ram2", "real", 0x400f_f000, 0x2000), None)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);
        mm.region_add(&region("ram3", "real", 0x4010_0000, 0x1000), None)
            .unwrap();

        assert_eq!(
            mm.region_find(AddressKind::Memory, 0x400f_ffff)
                .unwrap()
                .name,
            "ram"
        );
        assert!(mm.region_find(AddressKind::Memory, 0x3fff_ffff).is_none());
        assert!(mm.region_find(AddressKind::Io, 0x4000_0000).is_none());
    }

    #[test]
    fn guest_access_spans_adjacent_ram() {
        let mm = manager();
        mm.region_add(&region("lo", "real", 0x4000_0000, 0x1000), None)
            .unwrap();
        mm.region_add(&region("hi", "real", 0x4000_1000, 0x1000), None)
            .unwrap();
        mm.region_add(&region("dev", "virtual", 0x4000_2000, 0x1000), None)
            .unwrap();

        let data: Vec<u8> = (0..32u8).collect();
        mm.guest_write(0x4000_0ff0, &data).unwrap();
        let mut back = [0u8; 32];
        mm.guest_read(0x4000_0ff0, &mut back).unwrap();
        assert_eq!(&back[..], &data[..]);

        let err = mm.guest_write(0x4000_1ff0, &data).unwrap_err();
        assert!(matches!(err, Error::BadGuestAccess { gpa: 0x4000_2000 }));
    }

    #[test]
    fn alias_resolves_to_target() {
        let mm = manager();
        mm.region_add(&region("ram", "real", 0x4000_0000, 0x2000), None)
            .unwrap();
        let mut alias = region("alias", "alias", 0x0, 0x1000);
        alias.alias_gpa = Some(0x4000_1000);
        mm.region_add(&alias, None).unwrap();

        mm.guest_write(0x10, b"xv").unwrap();
        let mut b = [0u8; 2];
        mm.guest_read(0x4000_1010, &mut b).unwrap();
        assert_eq!(&b, b"xv");

        match mm.stage2_fill(0x10, AccessKind::Read).unwrap() {
            Stage2Fill::Mapped { gpa, hpa } => {
                assert_eq!(gpa, 0);
                let ram = mm.region_find(AddressKind::Memory, 0x4000_0000).unwrap();
                assert_eq!(hpa, ram.hpa().unwrap() + 0x1000);
            }
            f => panic!("unexpected {:?}", f),
        }
    }

    #[test]
    fn read_only_alias_of_writable_ram() {
        let mm = manager();
        mm.region_add(&region("ram", "real", 0x4000_0000, 0x2000), None)
            .unwrap();
        let mut alias = region("view", "alias", 0x0, 0x1000);
        alias.alias_gpa = Some(0x4000_0000);
        alias.flags |= RegionFlags::READONLY;
        mm.region_add(&alias, None).unwrap();

        assert!(matches!(
            mm.stage2_fill(0x20, AccessKind::Write),
            Err(Error::WriteToReadOnly { gpa: 0x20 })
        ));
        mm.stage2_fill(0x20, AccessKind::Read).unwrap();
        assert_eq!(
            mm.stage2().walk(0x20, AccessKind::Read).unwrap().attrs.perm,
            Stage2Perm::ReadOnly
        );
        assert!(mm.stage2().walk(0x20, AccessKind::Write).is_err());

        mm.stage2_fill(0x4000_0020, AccessKind::Write).unwrap();
        assert!(mm.stage2().walk(0x4000_0020, AccessKind::Write).is_ok());
    }

    #[test]
    fn fills_do_not_exclude_each_other() {
        let mm = manager();
        mm.region_add(&region("ram", "real", 0x4000_0000, 0x2000), None)
            .unwrap();
        let _in_flight = mm.update.read().unwrap();
        std::thread::scope(|s| {
            s.spawn(|| mm.stage2_fill(0x4000_1000, AccessKind::Read).unwrap())
                .join()
                .unwrap();
        });
        assert_eq!(mm.stage2().mappings().len(), 1);
        assert!(mm.update.try_write().is_err());
    }

    #[test]
    fn misaligned_ram_is_refused() {
        let mm = manager();
        let mut ram = region("ram", "real", 0x4000_0000, 0x1000);
        ram.size = 0x800;
        assert!(matches!(mm.region_add(&ram, None), Err(Error::Invalid(_))));
        ram.size = 0x1000;
        ram.gpa = 0x4000_0800;
        assert!(matches!(mm.region_add(&ram, None), Err(Error::Invalid(_))));
        assert!(mm.region_list(|_| None).is_empty());

        // A sub-page emulated neighbour never becomes RAM.
        mm.region_add(&region("ram", "real", 0x4000_0000, 0x1000), None)
            .unwrap();
        let mut dev = region("dev", "virtual", 0x4000_1000, 0x1000);
        dev.size = 0x800;
        mm.region_add(&dev, Some(EmulatorId(0))).unwrap();
        mm.stage2_fill(0x4000_0000, AccessKind::Write).unwrap();
        assert!(mm.stage2().walk(0x4000_1000, AccessKind::Write).is_err());
        assert!(matches!(
            mm.stage2_fill(0x4000_1010, AccessKind::Write).unwrap(),
            Stage2Fill::Virtual { offset: 0x10, .. }
        ));
    }

    #[test]
    fn delete_releases_host_ram_and_mappings() {
        let mm = manager();
        let before = mm.host().allocated();
        mm.region_add(&region("ram", "real", 0x4000_0000, 0x4000), None)
            .unwrap();
        for page in 0..4u64 {
            mm.stage2_fill(0x4000_0000 + page * PAGE_SIZE, AccessKind::Write)
                .unwrap();
        }
        assert_eq!(mm.stage2().mappings().len(), 4);

        mm.region_del(AddressKind::Memory, 0x4000_0000).unwrap();
        assert!(mm.stage2().mappings().is_empty());
        assert_eq!(mm.host().allocated(), before);
        assert!(mm.region_del(AddressKind::Memory, 0x4000_0000).is_err());
    }

    #[test]
    fn read_only_and_virtual_fills() {
        let mm = manager();
        let mut rom = region("rom", "real", 0x0, 0x1000);
        rom.flags |= RegionFlags::READONLY;
        mm.region_add(&rom, None).unwrap();
        mm.region_add(&region("dev", "virtual", 0x0900_0000, 0x1000), Some(EmulatorId(0)))
            .unwrap();

        assert!(matches!(
            mm.stage2_fill(0x10, AccessKind::Write),
            Err(Error::WriteToReadOnly { gpa: 0x10 })
        ));
        match mm.stage2_fill(0x0900_0018, AccessKind::Read).unwrap() {
            Stage2Fill::Virtual { region, offset } => {
                assert_eq!(region.emulator, Some(EmulatorId(0)));
                assert_eq!(offset, 0x18);
            }
            f => panic!("unexpected {:?}", f),
        }
        assert!(matches!(
            mm.stage2_fill(0x2000_0000, AccessKind::Read),
            Err(Error::BadGuestAccess { .. })
        ));
    }

    #[test]
    fn passthrough_iomem_is_refcounted() {
        let mm = manager();
        let mut dev = region("pt", "real", 0x1c09_0000, 0x1000);
        dev.hpa = Some(0x1c09_0000);
        mm.region_add(&dev, None).unwrap();
        assert_eq!(mm.iomem.refcount(0x1c09_0000, 0x1000), 1);
        match mm.stage2_fill(0x1c09_0004, AccessKind::Read).unwrap() {
            Stage2Fill::Mapped { hpa, .. } => assert_eq!(hpa, 0x1c09_0000),
            f => panic!("unexpected {:?}", f),
        }
        assert_eq!(mm.stage2().mappings()[0].attrs.mem, MemAttr::Device);
        assert!(mm.guest_read(0x1c09_0000, &mut [0u8; 4]).is_err());

        mm.teardown();
        assert_eq!(mm.iomem.refcount(0x1c09_0000, 0x1000), 0);
    }

    #[test]
    fn region_list_shows_backing() {
        let mm = manager();
        mm.region_add(&region("ram", "real", 0x4000_0000, 0x1000), None)
            .unwrap();
        mm.region_add(&region("dev", "virtual", 0x0900_0000, 0x1000), Some(EmulatorId(3)))
            .unwrap();
        let list = mm.region_list(|id| Some(format!("emu{}", id.0)));
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "dev");
        assert_eq!(list[0].emulator.as_deref(), Some("emu3"));
        assert!(list[1].hpa.is_some());
        assert!(list[1].to_string().contains("real,memory"));
    }
}
