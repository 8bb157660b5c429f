// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Implements virtio queues, the device seam and the MMIO transport.

#[macro_use]
extern crate log;

use std::fmt;

mod device;
pub mod queue;
pub mod testing;
pub mod transport;

pub use self::device::*;
pub use self::queue::{Descriptor, DescriptorChain, Queue, QueueError};

pub use virtio_bindings::virtio_config::{
    VIRTIO_CONFIG_S_ACKNOWLEDGE as DEVICE_ACKNOWLEDGE, VIRTIO_CONFIG_S_DRIVER as DEVICE_DRIVER,
    VIRTIO_CONFIG_S_DRIVER_OK as DEVICE_DRIVER_OK, VIRTIO_CONFIG_S_FAILED as DEVICE_FAILED,
    VIRTIO_CONFIG_S_FEATURES_OK as DEVICE_FEATURES_OK,
};

pub const DEVICE_INIT: u32 = 0x00;

pub const VIRTIO_F_VERSION_1: u32 = virtio_bindings::virtio_config::VIRTIO_F_VERSION_1;

pub const INTERRUPT_STATUS_USED_RING: u32 = 0x1;
pub const INTERRUPT_STATUS_CONFIG_CHANGED: u32 = 0x2;

// Types taken from linux/virtio_ids.h
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub enum VirtioDeviceType {
    Net = 1,
    Block = 2,
    Console = 3,
    Rng = 4,
    Balloon = 5,
    Input = 18,
    Unknown = 0xFF,
}

impl From<u32> for VirtioDeviceType {
    fn from(t: u32) -> Self {
        match t {
            1 => VirtioDeviceType::Net,
            2 => VirtioDeviceType::Block,
            3 => VirtioDeviceType::Console,
            4 => VirtioDeviceType::Rng,
            5 => VirtioDeviceType::Balloon,
            18 => VirtioDeviceType::Input,
            _ => VirtioDeviceType::Unknown,
        }
    }
}

impl From<&str> for VirtioDeviceType {
    fn from(name: &str) -> Self {
        match name {
            "net" => VirtioDeviceType::Net,
            "block" | "blk" => VirtioDeviceType::Block,
            "console" => VirtioDeviceType::Console,
            "rng" => VirtioDeviceType::Rng,
            "balloon" => VirtioDeviceType::Balloon,
            "input" => VirtioDeviceType::Input,
            _ => VirtioDeviceType::Unknown,
        }
    }
}

impl fmt::Display for VirtioDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let output = match *self {
            VirtioDeviceType::Net => "net",
            VirtioDeviceType::Block => "block",
            VirtioDeviceType::Console => "console",
            VirtioDeviceType::Rng => "rng",
            VirtioDeviceType::Balloon => "balloon",
            VirtioDeviceType::Input => "input",
            VirtioDeviceType::Unknown => "unknown",
        };
        write!(f, "{}", output)
    }
}
