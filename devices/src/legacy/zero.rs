// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};

use hypervisor::AccessWidth;
use vm_device::{Emulator, ProbeContext, Result};

/// Reads as zero, ignores writes.
#[derive(Default)]
pub struct Zero;

impl Zero {
    pub fn probe(_ctx: &ProbeContext) -> Result<Arc<Mutex<dyn Emulator>>> {
        Ok(Arc::new(Mutex::new(Zero)))
    }
}

impl Emulator for Zero {
    fn read(&mut self, _vcpu: usize, _offset: u64, _width: AccessWidth) -> Result<u64> {
        Ok(0)
    }

    fn write(&mut self, _vcpu: usize, offset: u64, width: AccessWidth, value: u64) -> Result<()> {
        debug!("zero: dropped {} write {:#x} at {:#x}", width, value, offset);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}
