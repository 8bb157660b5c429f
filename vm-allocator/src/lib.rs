// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Copyright © 2019 Intel Corporation
// SPDX-License-Identifier: Apache-2.0 OR MIT
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Manages host resources handed out to guests: host RAM pages and
//! host IOMEM mappings.

#[macro_use]
extern crate log;

mod address;
mod iomem;

pub use crate::address::{AddressAllocator, Error, Result};
pub use crate::iomem::{IomemMapper, IomemMapping};
