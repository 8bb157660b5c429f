// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::BTreeMap;
use std::sync::Mutex;

use vm_memory::{Address, GuestAddress, GuestUsize};

use crate::address::{AddressAllocator, Error, Result};

/// A host IOMEM range mapped into the hypervisor's virtual address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IomemMapping {
    pub hpa: u64,
    pub size: u64,
    pub va: u64,
}

struct IomemEntry {
    mapping: IomemMapping,
    refs: usize,
}

/// Reference-counted host IOMEM mapper.
///
/// Mapping the same physical range twice hands back the existing mapping;
/// the virtual range is only released when the last user unmaps it.
pub struct IomemMapper {
    window: Mutex<AddressAllocator>,
    entries: Mutex<BTreeMap<(u64, u64), IomemEntry>>,
    page_size: u64,
}

impl IomemMapper {
    /// `va_base`/`va_size` describe the virtual window mappings are placed in.
    pub fn new(va_base: u64, va_size: GuestUsize, page_size: u64) -> Option<Self> {
        let window = AddressAllocator::new(GuestAddress(va_base), va_size, Some(page_size))?;
        Some(IomemMapper {
            window: Mutex::new(window),
            entries: Mutex::new(BTreeMap::new()),
            page_size,
        })
    }

    fn page_span(&self, hpa: u64, size: u64) -> (u64, u64) {
        let start = hpa & !(self.page_size - 1);
        let end = (hpa + size + self.page_size - 1) & !(self.page_size - 1);
        (start, end - start)
    }

    pub fn map(&self, hpa: u64, size: u64) -> Result<IomemMapping> {
        if size == 0 {
            return Err(Error::Exhausted(0));
        }
        let (start, span) = self.page_span(hpa, size);

        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&(start, span)) {
            entry.refs += 1;
            let va = entry.mapping.va + (hpa - start);
            return Ok(IomemMapping { hpa, size, va });
        }

        let va = self.window.lock().unwrap().allocate(None, span)?;
        let mapping = IomemMapping {
            hpa: start,
            size: span,
            va: va.raw_value(),
        };
        debug!(
            "iomem map hpa {:#x} size {:#x} at va {:#x}",
            start, span, mapping.va
        );
        entries.insert((start, span), IomemEntry { mapping, refs: 1 });

        Ok(IomemMapping {
            hpa,
            size,
            va: mapping.va + (hpa - start),
        })
    }

    /// Drop one reference; returns `true` when the mapping went away.
    pub fn unmap(&self, hpa: u64, size: u64) -> Result<bool> {
        let key = self.page_span(hpa, size);
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&key).ok_or(Error::NotAllocated(hpa))?;

        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(false);
        }

        let va = entry.mapping.va;
        entries.remove(&key);
        self.window.lock().unwrap().free(GuestAddress(va))?;
        debug!("iomem unmap hpa {:#x} from va {:#x}", key.0, va);
        Ok(true)
    }

    pub fn refcount(&self, hpa: u64, size: u64) -> usize {
        self.entries
            .lock()
            .unwrap()
            .get(&self.page_span(hpa, size))
            .map(|e| e.refs)
            .unwrap_or(0)
    }
}
