// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Stage-2 (guest physical to host physical) translation tables.
//!
//! Three-level LPAE format with 4 KiB granule and a 39-bit IPA space. The
//! table pages live in host RAM.

use std::sync::{Arc, Mutex};

use hypervisor::{AccessKind, CpuMask, Hal, Stage2FaultKind};

use crate::config::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::memory_manager::HostRam;

pub const IPA_BITS: u32 = 39;

const LEVELS: usize = 3;
const ENTRIES: u64 = 512;
const PAGE_SHIFT: u32 = 12;

const DESC_VALID: u64 = 1 << 0;
const DESC_TABLE: u64 = 1 << 1;
const DESC_MEMATTR_SHIFT: u64 = 2;
const DESC_MEMATTR_MASK: u64 = 0xf << DESC_MEMATTR_SHIFT;
const DESC_S2AP_READ: u64 = 1 << 6;
const DESC_S2AP_WRITE: u64 = 1 << 7;
const DESC_SH_INNER: u64 = 0b11 << 8;
const DESC_AF: u64 = 1 << 10;
const DESC_XN: u64 = 1 << 54;
const DESC_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage2Perm {
    ReadOnly,
    ReadWrite,
}

/// Stage-2 MemAttr[3:0] encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum MemAttr {
    Device = 0b0001,
    NormalNonCacheable = 0b0101,
    NormalWriteThrough = 0b1010,
    NormalWriteBack = 0b1111,
}

impl MemAttr {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0b0101 => MemAttr::NormalNonCacheable,
            0b1010 => MemAttr::NormalWriteThrough,
            0b1111 => MemAttr::NormalWriteBack,
            _ => MemAttr::Device,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stage2Attrs {
    pub perm: Stage2Perm,
    pub mem: MemAttr,
    pub exec: bool,
}

impl Stage2Attrs {
    fn leaf(&self, hpa: u64) -> u64 {
        let mut desc = (hpa & DESC_ADDR_MASK)
            | DESC_VALID
            | DESC_TABLE
            | DESC_AF
            | DESC_S2AP_READ
            | ((self.mem as u64) << DESC_MEMATTR_SHIFT);
        if self.perm == Stage2Perm::ReadWrite {
            desc |= DESC_S2AP_WRITE;
        }
        if self.mem != MemAttr::Device {
            desc |= DESC_SH_INNER;
        }
        if !self.exec {
            desc |= DESC_XN;
        }
        desc
    }

    fn from_leaf(desc: u64) -> Self {
        Stage2Attrs {
            perm: if desc & DESC_S2AP_WRITE != 0 {
                Stage2Perm::ReadWrite
            } else {
                Stage2Perm::ReadOnly
            },
            mem: MemAttr::from_bits((desc & DESC_MEMATTR_MASK) >> DESC_MEMATTR_SHIFT),
            exec: desc & DESC_XN == 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stage2Mapping {
    pub gpa: u64,
    pub hpa: u64,
    pub attrs: Stage2Attrs,
}

struct TableState {
    root: u64,
    // Every table page but the root.
    tables: Vec<u64>,
}

pub struct Stage2Table {
    vmid: u32,
    host: Arc<HostRam>,
    hal: Arc<dyn Hal>,
    cpus: CpuMask,
    state: Mutex<TableState>,
}

fn index(gpa: u64, level: usize) -> u64 {
    let shift = PAGE_SHIFT + 9 * (LEVELS - 1 - level) as u32;
    (gpa >> shift) & (ENTRIES - 1)
}

fn check_ipa(gpa: u64) -> Result<()> {
    if gpa >> IPA_BITS != 0 {
        return Err(Error::Invalid(format!(
            "IPA {:#x} beyond {} bits",
            gpa, IPA_BITS
        )));
    }
    Ok(())
}

impl Stage2Table {
    /// `cpus` are the host CPUs whose TLBs may hold translations of `vmid`.
    pub fn new(vmid: u32, host: Arc<HostRam>, hal: Arc<dyn Hal>, cpus: CpuMask) -> Result<Self> {
        let root = host.alloc(PAGE_SIZE)?;
        Ok(Stage2Table {
            vmid,
            host,
            hal,
            cpus,
            state: Mutex::new(TableState {
                root,
                tables: Vec::new(),
            }),
        })
    }

    pub fn vmid(&self) -> u32 {
        self.vmid
    }

    /// Host physical address of the level 1 table.
    pub fn root(&self) -> u64 {
        self.state.lock().unwrap().root
    }

    fn entry(table: u64, gpa: u64, level: usize) -> u64 {
        table + index(gpa, level) * 8
    }

    /// Map the page at `gpa` to the host page at `hpa`.
    pub fn map_page(&self, gpa: u64, hpa: u64, attrs: Stage2Attrs) -> Result<()> {
        check_ipa(gpa)?;
        let mut state = self.state.lock().unwrap();
        let mut table = state.root;
        for level in 0..LEVELS - 1 {
            let slot = Self::entry(table, gpa, level);
            let desc = self.host.read_u64(slot)?;
            table = if desc & DESC_VALID != 0 {
                desc & DESC_ADDR_MASK
            } else {
                let next = self.host.alloc(PAGE_SIZE)?;
                state.tables.push(next);
                self.host
                    .write_u64(slot, next | DESC_VALID | DESC_TABLE)?;
                next
            };
        }

        let slot = Self::entry(table, gpa, LEVELS - 1);
        let old = self.host.read_u64(slot)?;
        let new = attrs.leaf(hpa);
        if old == new {
            return Ok(());
        }
        self.host.write_u64(slot, new)?;
        drop(state);

        if old & DESC_VALID != 0 {
            self.hal
                .flush_stage2_tlb(self.cpus, self.vmid, Some(gpa & !(PAGE_SIZE - 1)));
        }
        Ok(())
    }

    fn leaf_slot(&self, state: &TableState, gpa: u64) -> Result<Option<u64>> {
        let mut table = state.root;
        for level in 0..LEVELS - 1 {
            let desc = self.host.read_u64(Self::entry(table, gpa, level))?;
            if desc & DESC_VALID == 0 {
                return Ok(None);
            }
            table = desc & DESC_ADDR_MASK;
        }
        Ok(Some(Self::entry(table, gpa, LEVELS - 1)))
    }

    fn clear_leaf(&self, state: &TableState, gpa: u64) -> bool {
        match self.leaf_slot(state, gpa) {
            Ok(Some(slot)) => match self.host.read_u64(slot) {
                Ok(desc) if desc & DESC_VALID != 0 => self.host.write_u64(slot, 0).is_ok(),
                _ => false,
            },
            _ => false,
        }
    }

    /// Returns whether a translation was removed.
    pub fn unmap_page(&self, gpa: u64) -> bool {
        let state = self.state.lock().unwrap();
        let removed = self.clear_leaf(&state, gpa);
        drop(state);
        if removed {
            self.hal
                .flush_stage2_tlb(self.cpus, self.vmid, Some(gpa & !(PAGE_SIZE - 1)));
        }
        removed
    }

    /// Remove every translation in `[gpa, gpa + size)` with a single
    /// invalidation; returns the number of pages dropped.
    pub fn unmap_range(&self, gpa: u64, size: u64) -> usize {
        let state = self.state.lock().unwrap();
        let start = gpa & !(PAGE_SIZE - 1);
        let end = gpa.saturating_add(size);
        let mut removed = 0;
        let mut page = start;
        while page < end && page >> IPA_BITS == 0 {
            if self.clear_leaf(&state, page) {
                removed += 1;
            }
            page += PAGE_SIZE;
        }
        drop(state);
        if removed > 0 {
            self.hal.flush_stage2_tlb(self.cpus, self.vmid, None);
        }
        removed
    }

    /// Translate `gpa` for `access` the way the MMU would.
    pub fn walk(
        &self,
        gpa: u64,
        access: AccessKind,
    ) -> std::result::Result<Stage2Mapping, Stage2FaultKind> {
        if gpa >> IPA_BITS != 0 {
            return Err(Stage2FaultKind::Translation);
        }
        let state = self.state.lock().unwrap();
        let slot = match self.leaf_slot(&state, gpa) {
            Ok(Some(slot)) => slot,
            _ => return Err(Stage2FaultKind::Translation),
        };
        let desc = self
            .host
            .read_u64(slot)
            .map_err(|_| Stage2FaultKind::Translation)?;
        if desc & DESC_VALID == 0 {
            return Err(Stage2FaultKind::Translation);
        }
        if desc & DESC_AF == 0 {
            return Err(Stage2FaultKind::AccessFlag);
        }
        let allowed = match access {
            AccessKind::Read => desc & DESC_S2AP_READ != 0,
            AccessKind::Write => desc & DESC_S2AP_WRITE != 0,
            AccessKind::Execute => desc & DESC_XN == 0,
        };
        if !allowed {
            return Err(Stage2FaultKind::Permission);
        }
        let offset = gpa & (PAGE_SIZE - 1);
        Ok(Stage2Mapping {
            gpa: gpa & !(PAGE_SIZE - 1),
            hpa: (desc & DESC_ADDR_MASK) | offset,
            attrs: Stage2Attrs::from_leaf(desc),
        })
    }

    fn collect(&self, table: u64, level: usize, base: u64, out: &mut Vec<Stage2Mapping>) {
        let shift = PAGE_SHIFT + 9 * (LEVELS - 1 - level) as u32;
        for i in 0..ENTRIES {
            let Ok(desc) = self.host.read_u64(table + i * 8) else {
                return;
            };
            if desc & DESC_VALID == 0 {
                continue;
            }
            let gpa = base | (i << shift);
            if level == LEVELS - 1 {
                out.push(Stage2Mapping {
                    gpa,
                    hpa: desc & DESC_ADDR_MASK,
                    attrs: Stage2Attrs::from_leaf(desc),
                });
            } else {
                self.collect(desc & DESC_ADDR_MASK, level + 1, gpa, out);
            }
        }
    }

    /// Every live translation, by ascending guest address.
    pub fn mappings(&self) -> Vec<Stage2Mapping> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        self.collect(state.root, 0, 0, &mut out);
        out
    }

    /// Drop every translation and every table page but the root.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        for table in state.tables.drain(..) {
            if let Err(e) = self.host.free(table) {
                error!("stage-2 table {:#x}: {}", table, e);
            }
        }
        let root = state.root;
        for i in 0..ENTRIES {
            if let Err(e) = self.host.write_u64(root + i * 8, 0) {
                error!("stage-2 root {:#x}: {}", root, e);
                break;
            }
        }
        drop(state);
        self.hal.flush_stage2_tlb(self.cpus, self.vmid, None);
    }
}

impl Drop for Stage2Table {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        for table in state.tables.drain(..).chain(std::iter::once(state.root)) {
            if let Err(e) = self.host.free(table) {
                error!("stage-2 table {:#x}: {}", table, e);
            }
        }
    }
}
