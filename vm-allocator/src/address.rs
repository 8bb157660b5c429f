// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Copyright © 2019 Intel Corporation
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::btree_map::BTreeMap;
use std::result;

use thiserror::Error;
use vm_memory::{Address, GuestAddress, GuestUsize};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Range is outside of the managed pool")]
    Overflow,
    #[error("Range overlaps an allocated range")]
    Overlap,
    #[error("Address {0:#x} is not aligned")]
    UnalignedAddress(u64),
    #[error("Not enough free space for {0:#x} bytes")]
    Exhausted(u64),
    #[error("No range allocated at {0:#x}")]
    NotAllocated(u64),
}

pub type Result<T> = result::Result<T, Error>;

/// Manages allocating address ranges.
///
/// Ranges handed out without an explicit address are taken first fit from
/// the bottom of the pool.
///
/// # Examples
///
/// ```
/// # use vm_allocator::AddressAllocator;
/// # use vm_memory::GuestAddress;
///   AddressAllocator::new(GuestAddress(0x1000), 0x10000, Some(0x100)).map(|mut pool| {
///       assert_eq!(pool.allocate(None, 0x110), Ok(GuestAddress(0x1000)));
///       assert_eq!(pool.allocate(None, 0x100), Ok(GuestAddress(0x1200)));
///   });
/// ```
#[derive(Debug, Eq, PartialEq)]
pub struct AddressAllocator {
    base: GuestAddress,
    end: GuestAddress,
    alignment: GuestUsize,
    ranges: BTreeMap<GuestAddress, GuestUsize>,
}

impl AddressAllocator {
    /// Creates a new `AddressAllocator` for managing a range of addresses.
    /// Can return `None` if `base` + `size` overflows a u64 or if alignment isn't a power
    /// of two.
    ///
    /// * `base` - The starting address of the range to manage.
    /// * `size` - The size of the address range in bytes.
    /// * `align_size` - The minimum size of an address region to align to, defaults to four.
    pub fn new(
        base: GuestAddress,
        size: GuestUsize,
        align_size: Option<GuestUsize>,
    ) -> Option<Self> {
        if size == 0 {
            return None;
        }

        let end = base.checked_add(size - 1)?;
        let alignment = align_size.unwrap_or(4);
        if !alignment.is_power_of_two() {
            return None;
        }

        Some(AddressAllocator {
            base,
            end,
            alignment,
            ranges: BTreeMap::new(),
        })
    }

    pub fn base(&self) -> GuestAddress {
        self.base
    }

    /// Last address of the pool.
    pub fn end(&self) -> GuestAddress {
        self.end
    }

    fn align_address(&self, address: GuestAddress) -> Option<GuestAddress> {
        let rem = address.raw_value() % self.alignment;
        if rem == 0 {
            Some(address)
        } else {
            address.checked_add(self.alignment - rem)
        }
    }

    fn fits(&self, start: GuestAddress, size: GuestUsize) -> bool {
        start >= self.base
            && start
                .checked_add(size - 1)
                .is_some_and(|last| last <= self.end)
    }

    fn overlaps(&self, start: GuestAddress, size: GuestUsize) -> bool {
        let last = start.unchecked_add(size - 1);
        // The only candidates are the closest range below `last`.
        self.ranges
            .range(..=last)
            .next_back()
            .is_some_and(|(addr, len)| addr.unchecked_add(*len - 1) >= start)
    }

    fn available_range(&self, req_address: GuestAddress, req_size: GuestUsize) -> Result<()> {
        if self.align_address(req_address) != Some(req_address) {
            return Err(Error::UnalignedAddress(req_address.raw_value()));
        }

        if !self.fits(req_address, req_size) {
            return Err(Error::Overflow);
        }

        if self.overlaps(req_address, req_size) {
            return Err(Error::Overlap);
        }

        Ok(())
    }

    fn first_available_range(&self, req_size: GuestUsize) -> Option<GuestAddress> {
        let mut candidate = self.base;

        for (address, size) in self.ranges.iter() {
            let aligned = self.align_address(candidate)?;
            if *address > aligned && address.unchecked_sub(aligned.raw_value()).raw_value() >= req_size
            {
                return Some(aligned);
            }
            candidate = candidate.max(address.checked_add(*size)?);
        }

        let aligned = self.align_address(candidate)?;
        self.fits(aligned, req_size).then_some(aligned)
    }

    /// Allocates a range of addresses from the managed region, at `address`
    /// when one is given.
    pub fn allocate(
        &mut self,
        address: Option<GuestAddress>,
        size: GuestUsize,
    ) -> Result<GuestAddress> {
        if size == 0 {
            return Err(Error::Exhausted(0));
        }

        let new_addr = match address {
            Some(req_address) => {
                self.available_range(req_address, size)?;
                req_address
            }
            None => self
                .first_available_range(size)
                .ok_or(Error::Exhausted(size))?,
        };

        debug!("allocated [{:#x}, +{:#x})", new_addr.raw_value(), size);
        self.ranges.insert(new_addr, size);

        Ok(new_addr)
    }

    /// Frees the range starting at `address`, returning its size.
    pub fn free(&mut self, address: GuestAddress) -> Result<GuestUsize> {
        let size = self
            .ranges
            .remove(&address)
            .ok_or(Error::NotAllocated(address.raw_value()))?;
        debug!("freed [{:#x}, +{:#x})", address.raw_value(), size);
        Ok(size)
    }

    /// Bytes currently handed out.
    pub fn allocated(&self) -> GuestUsize {
        self.ranges.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_fails_overflow() {
        assert_eq!(
            AddressAllocator::new(GuestAddress(u64::MAX), 0x100, None),
            None
        );
    }

    #[test]
    fn new_fails_size_zero() {
        assert_eq!(AddressAllocator::new(GuestAddress(0x1000), 0, None), None);
    }

    #[test]
    fn new_fails_alignment_zero() {
        assert_eq!(
            AddressAllocator::new(GuestAddress(0x1000), 0x10000, Some(0)),
            None
        );
    }

    #[test]
    fn new_fails_alignment_non_power_of_two() {
        assert_eq!(
            AddressAllocator::new(GuestAddress(0x1000), 0x10000, Some(200)),
            None
        );
    }

    #[test]
    fn allocate_fails_not_enough_space() {
        let mut pool = AddressAllocator::new(GuestAddress(0x1000), 0x1000, Some(0x100)).unwrap();
        assert_eq!(pool.allocate(None, 0x800), Ok(GuestAddress(0x1000)));
        assert_eq!(pool.allocate(None, 0x900), Err(Error::Exhausted(0x900)));
        assert_eq!(pool.allocate(None, 0x400), Ok(GuestAddress(0x1800)));
    }

    #[test]
    fn allocate_alignment() {
        let mut pool = AddressAllocator::new(GuestAddress(0x1000), 0x10000, Some(0x100)).unwrap();
        assert_eq!(pool.allocate(None, 0x110), Ok(GuestAddress(0x1000)));
        assert_eq!(pool.allocate(None, 0x100), Ok(GuestAddress(0x1200)));
        assert_eq!(pool.allocate(None, 0x10), Ok(GuestAddress(0x1300)));
    }

    #[test]
    fn allocate_address() {
        let mut pool = AddressAllocator::new(GuestAddress(0x1000), 0x1000, None).unwrap();
        assert_eq!(
            pool.allocate(Some(GuestAddress(0x1200)), 0x800),
            Ok(GuestAddress(0x1200))
        );
        assert_eq!(
            pool.allocate(Some(GuestAddress(0x1a00)), 0x100),
            Ok(GuestAddress(0x1a00))
        );
        assert_eq!(
            pool.allocate(Some(GuestAddress(0x1f00)), 0x200),
            Err(Error::Overflow)
        );
    }

    #[test]
    fn allocate_address_alignment() {
        let mut pool = AddressAllocator::new(GuestAddress(0x1000), 0x1000, Some(0x100)).unwrap();
        assert_eq!(
            pool.allocate(Some(GuestAddress(0x1200)), 0x800),
            Ok(GuestAddress(0x1200))
        );

        // Unaligned request
        assert_eq!(
            pool.allocate(Some(GuestAddress(0x1210)), 0x800),
            Err(Error::UnalignedAddress(0x1210))
        );

        // Aligned request
        assert_eq!(
            pool.allocate(Some(GuestAddress(0x1b00)), 0x100),
            Ok(GuestAddress(0x1b00))
        );
    }

    #[test]
    fn allocate_address_not_enough_space() {
        let mut pool = AddressAllocator::new(GuestAddress(0x1000), 0x1000, Some(0x100)).unwrap();

        // First range is [0x1200:0x1a00]
        assert!(pool.allocate(Some(GuestAddress(0x1200)), 0x800).is_ok());
        // Second range is [0x1c00:0x1e00]
        assert!(pool.allocate(Some(GuestAddress(0x1c00)), 0x200).is_ok());

        // There is 0x200 between the first 2 ranges.
        assert_eq!(
            pool.allocate(Some(GuestAddress(0x1b00)), 0x800),
            Err(Error::Overlap)
        );
        assert_eq!(
            pool.allocate(Some(GuestAddress(0x1b00)), 0x100),
            Ok(GuestAddress(0x1b00))
        );
    }

    #[test]
    fn first_fit_reuses_freed_hole() {
        let mut pool = AddressAllocator::new(GuestAddress(0), 0x4000, Some(0x1000)).unwrap();
        let a = pool.allocate(None, 0x1000).unwrap();
        let b = pool.allocate(None, 0x2000).unwrap();
        let c = pool.allocate(None, 0x1000).unwrap();
        assert_eq!((a, b, c), (GuestAddress(0), GuestAddress(0x1000), GuestAddress(0x3000)));
        assert_eq!(pool.allocate(None, 0x1000), Err(Error::Exhausted(0x1000)));

        assert_eq!(pool.free(b), Ok(0x2000));
        assert_eq!(pool.allocate(None, 0x1000), Ok(GuestAddress(0x1000)));
        assert_eq!(pool.allocate(None, 0x1000), Ok(GuestAddress(0x2000)));
        assert_eq!(pool.allocated(), 0x4000);
        assert_eq!(pool.free(GuestAddress(0x800)), Err(Error::NotAllocated(0x800)));
    }
}
