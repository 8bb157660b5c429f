// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

//! Emulates virtual and hardware devices.

#[macro_use]
extern crate log;

pub mod irqchip;
pub mod legacy;
#[cfg(test)]
pub(crate) mod testing;

use vm_device::EmulatorKind;

pub use self::irqchip::{ChipEmulator, SharedChip, VirqChip};

/// Emulators implemented by this crate, ready to be registered.
pub fn emulator_kinds() -> Vec<EmulatorKind> {
    vec![
        EmulatorKind {
            name: "pl011",
            compatible: legacy::PL011_COMPATIBLE,
            probe: legacy::Pl011::probe,
        },
        EmulatorKind {
            name: "zero",
            compatible: &["xvisor,zero"],
            probe: legacy::Zero::probe,
        },
        EmulatorKind {
            name: "gic-v2",
            compatible: &["arm,cortex-a15-gic", "arm,gic-v2", "arm,gic-400"],
            probe: irqchip::probe_gicv2,
        },
        EmulatorKind {
            name: "gic-v3",
            compatible: &["arm,gic-v3"],
            probe: irqchip::probe_gicv3,
        },
        EmulatorKind {
            name: "i8259",
            compatible: &["intel,i8259", "i8259a"],
            probe: irqchip::probe_i8259,
        },
        EmulatorKind {
            name: "lapic",
            compatible: &["intel,lapic"],
            probe: irqchip::probe_lapic,
        },
        EmulatorKind {
            name: "plic",
            compatible: &["sifive,plic0", "riscv,plic0"],
            probe: irqchip::probe_plic,
        },
    ]
}
