// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

/// Handle on an armed guest timer event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(pub u64);

pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// One-shot timers on the hypervisor monotonic clock, owned by a guest.
pub trait GuestTimerService: Send + Sync {
    fn now_ns(&self) -> u64;

    /// Run `callback` once the clock reaches `deadline_ns`. Callbacks run on
    /// the service's own thread, never from within `start`.
    fn start(&self, deadline_ns: u64, callback: TimerCallback) -> TimerToken;

    /// Returns whether the event was still armed.
    fn cancel(&self, token: TimerToken) -> bool;
}
