// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::io::Write;
use std::sync::Arc;

use thiserror::Error;
use vm_device::{GuestMemoryAccess, IrqError};

use crate::queue::Queue;
use crate::{VirtioDeviceType, VIRTIO_F_VERSION_1};

pub enum VirtioInterruptType {
    Config,
    Queue(u16),
}

/// Interrupt path from a device model back to its driver.
pub trait VirtioInterrupt: Send + Sync {
    fn trigger(&self, int_type: VirtioInterruptType) -> std::result::Result<(), IrqError>;
}

#[derive(Error, Debug)]
pub enum ActivateError {
    #[error("Bad activation request")]
    BadActivate,
    #[error("Expected {expected} queues, got {got}")]
    BadQueueNum { expected: usize, got: usize },
    #[error("Failed to spawn device worker: {0}")]
    SpawnWorker(#[source] std::io::Error),
}

pub type ActivateResult = std::result::Result<(), ActivateError>;

/// Trait for virtio devices to be driven by a virtio transport.
///
/// The transport owns the device. Once the guest driver has configured the
/// device, `VirtioDevice::activate` is called and the queues, the guest
/// memory and the interrupt path move into the device. `reset` takes them
/// back and returns the device to its initial state.
pub trait VirtioDevice: Send {
    /// The virtio device type.
    fn device_type(&self) -> u32;

    /// The maximum size of each queue that this device supports.
    fn queue_max_sizes(&self) -> &[u16];

    /// The set of feature bits that this device supports.
    fn features(&self) -> u64 {
        0
    }

    /// Acknowledges that this set of features should be enabled.
    fn ack_features(&mut self, value: u64) {
        let _ = value;
    }

    /// Reads this device configuration space at `offset`.
    fn read_config(&self, _offset: u64, _data: &mut [u8]) {
        warn!(
            "No readable configuration fields for {}",
            VirtioDeviceType::from(self.device_type())
        );
    }

    /// Writes to this device configuration space at `offset`.
    fn write_config(&mut self, _offset: u64, _data: &[u8]) {
        warn!(
            "No writable configuration fields for {}",
            VirtioDeviceType::from(self.device_type())
        );
    }

    /// Activates this device for real usage.
    fn activate(
        &mut self,
        mem: Arc<dyn GuestMemoryAccess>,
        interrupt: Arc<dyn VirtioInterrupt>,
        queues: Vec<Queue>,
    ) -> ActivateResult;

    /// The driver wrote `index` to the queue notify register. Runs on the
    /// trapping VCPU and must not block.
    fn queue_notify(&mut self, index: u16);

    /// Deactivates the device. Work still in flight is revoked: it completes
    /// without touching guest memory. Calling it twice is harmless.
    fn reset(&mut self);

    /// Helper to allow common implementation of read_config
    fn read_config_from_slice(&self, config: &[u8], offset: u64, mut data: &mut [u8]) {
        let config_len = config.len() as u64;
        let data_len = data.len() as u64;
        if offset + data_len > config_len {
            error!(
                "Out-of-bound access to configuration: config_len = {} offset = {:x} length = {} for {}",
                config_len,
                offset,
                data_len,
                VirtioDeviceType::from(self.device_type())
            );
            return;
        }
        let _ = data.write_all(&config[offset as usize..(offset + data_len) as usize]);
    }

    /// Helper to allow common implementation of write_config
    fn write_config_helper(&self, config: &mut [u8], offset: u64, data: &[u8]) {
        let config_len = config.len() as u64;
        let data_len = data.len() as u64;
        if offset + data_len > config_len {
            error!(
                "Out-of-bound access to configuration: config_len = {} offset = {:x} length = {} for {}",
                config_len,
                offset,
                data_len,
                VirtioDeviceType::from(self.device_type())
            );
            return;
        }
        config[offset as usize..(offset + data_len) as usize].copy_from_slice(data);
    }
}

/// Feature bookkeeping shared by the device models.
#[derive(Default)]
pub struct VirtioCommon {
    pub avail_features: u64,
    pub acked_features: u64,
    pub queue_sizes: Vec<u16>,
    pub device_type: u32,
}

impl VirtioCommon {
    pub fn new(device_type: VirtioDeviceType, avail_features: u64, queue_sizes: Vec<u16>) -> Self {
        VirtioCommon {
            avail_features,
            acked_features: 0,
            queue_sizes,
            device_type: device_type as u32,
        }
    }

    pub fn feature_acked(&self, feature: u64) -> bool {
        self.acked_features & 1 << feature == 1 << feature
    }

    pub fn ack_features(&mut self, value: u64) {
        let mut v = value;
        // Check if the guest is ACK'ing a feature that we didn't claim to have.
        // VIRTIO_F_VERSION_1 is offered by the transport.
        let offered = self.avail_features | 1u64 << VIRTIO_F_VERSION_1;
        let unrequested_features = v & !offered;
        if unrequested_features != 0 {
            warn!("Received acknowledge request for unknown feature.");

            // Don't count these features as acked.
            v &= !unrequested_features;
        }
        self.acked_features |= v;
    }

    pub fn check_queues(&self, queues: &[Queue]) -> ActivateResult {
        if queues.len() != self.queue_sizes.len() {
            error!(
                "Number of enabled queues does not match: {} vs {}",
                queues.len(),
                self.queue_sizes.len()
            );
            return Err(ActivateError::BadQueueNum {
                expected: self.queue_sizes.len(),
                got: queues.len(),
            });
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.acked_features = 0;
    }
}
