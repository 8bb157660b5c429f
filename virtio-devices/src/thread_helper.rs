// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::thread::{self, JoinHandle};

use vm_virtio::ActivateError;

pub(crate) fn spawn_virtio_thread<F>(name: &str, f: F) -> Result<JoinHandle<()>, ActivateError>
where
    F: FnOnce(),
    F: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| {
            error!("Failed to spawn thread for {}: {}", name, e);
            ActivateError::SpawnWorker(e)
        })
}
