// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccessError {
    /// The range is not entirely backed by guest RAM.
    #[error("Guest physical range [{gpa:#x}, +{len:#x}) is not RAM")]
    BadGuestAccess { gpa: u64, len: usize },
}

/// DMA-like access to a guest's RAM, by guest physical address.
pub trait GuestMemoryAccess: Send + Sync {
    fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<(), MemoryAccessError>;

    fn write(&self, gpa: u64, buf: &[u8]) -> Result<(), MemoryAccessError>;
}

macro_rules! le_accessors {
    ($read:ident, $write:ident, $ty:ty) => {
        fn $read(&self, gpa: u64) -> Result<$ty, MemoryAccessError> {
            let mut bytes = [0u8; std::mem::size_of::<$ty>()];
            self.read(gpa, &mut bytes)?;
            Ok(<$ty>::from_le_bytes(bytes))
        }

        fn $write(&self, gpa: u64, value: $ty) -> Result<(), MemoryAccessError> {
            self.write(gpa, &value.to_le_bytes())
        }
    };
}

/// Little endian scalar helpers on top of [`GuestMemoryAccess`].
pub trait GuestMemoryExt: GuestMemoryAccess {
    le_accessors!(read_u8, write_u8, u8);
    le_accessors!(read_u16, write_u16, u16);
    le_accessors!(read_u32, write_u32, u32);
    le_accessors!(read_u64, write_u64, u64);
}

impl<T: GuestMemoryAccess + ?Sized> GuestMemoryExt for T {}
