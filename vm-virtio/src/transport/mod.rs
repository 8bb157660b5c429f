// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

mod mmio;

pub use mmio::{MmioInterrupt, MmioTransport, MMIO_MAGIC_VALUE, MMIO_VENDOR_ID, QUEUE_NUM_MAX};

pub const NOTIFY_REG_OFFSET: u64 = 0x50;
