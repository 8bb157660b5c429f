// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Per host CPU timer event queues.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hypervisor::Hal;
use vm_device::{GuestTimerService, TimerCallback, TimerToken};

struct Event {
    owner: u64,
    callback: TimerCallback,
}

#[derive(Default)]
struct Events {
    by_deadline: BTreeMap<(u64, u64), Event>,
    deadlines: HashMap<u64, u64>,
}

/// One-shot events ordered by deadline, expired by the run loop of the
/// owning host CPU.
#[derive(Default)]
pub struct TimerQueue {
    events: Mutex<Events>,
    next_token: AtomicU64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm an event; also returns whether it is now the earliest one.
    pub fn start(&self, owner: u64, deadline_ns: u64, callback: TimerCallback) -> (TimerToken, bool) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut events = self.events.lock().unwrap();
        let earliest = events
            .by_deadline
            .keys()
            .next()
            .is_none_or(|&(d, _)| deadline_ns < d);
        events
            .by_deadline
            .insert((deadline_ns, token), Event { owner, callback });
        events.deadlines.insert(token, deadline_ns);
        (TimerToken(token), earliest)
    }

    pub fn cancel(&self, token: TimerToken) -> bool {
        let mut events = self.events.lock().unwrap();
        match events.deadlines.remove(&token.0) {
            Some(deadline) => events.by_deadline.remove(&(deadline, token.0)).is_some(),
            None => false,
        }
    }

    /// Disarm every event of `owner`.
    pub fn cancel_owner(&self, owner: u64) -> usize {
        let mut events = self.events.lock().unwrap();
        let keys: Vec<(u64, u64)> = events
            .by_deadline
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            events.by_deadline.remove(key);
            events.deadlines.remove(&key.1);
        }
        keys.len()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.events
            .lock()
            .unwrap()
            .by_deadline
            .keys()
            .next()
            .map(|&(d, _)| d)
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().by_deadline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every event due at `now_ns`. Callbacks run with the queue
    /// unlocked and may arm new events.
    pub fn expire(&self, now_ns: u64) -> usize {
        let mut fired = 0;
        loop {
            let event = {
                let mut events = self.events.lock().unwrap();
                match events.by_deadline.first_key_value() {
                    Some((&(deadline, token), _)) if deadline <= now_ns => {
                        events.deadlines.remove(&token);
                        events.by_deadline.remove(&(deadline, token))
                    }
                    _ => None,
                }
            };
            match event {
                Some(event) => {
                    (event.callback)();
                    fired += 1;
                }
                None => return fired,
            }
        }
    }
}

/// Timer service of one guest, backed by the queue of its home host CPU.
pub struct GuestTimers {
    owner: u64,
    cpu: usize,
    queue: Arc<TimerQueue>,
    hal: Arc<dyn Hal>,
}

impl GuestTimers {
    pub fn new(owner: u64, cpu: usize, queue: Arc<TimerQueue>, hal: Arc<dyn Hal>) -> Self {
        GuestTimers {
            owner,
            cpu,
            queue,
            hal,
        }
    }

    /// Disarm everything the guest's emulators left armed.
    pub fn cancel_all(&self) -> usize {
        self.queue.cancel_owner(self.owner)
    }
}

impl GuestTimerService for GuestTimers {
    fn now_ns(&self) -> u64 {
        self.hal.monotonic_ns()
    }

    fn start(&self, deadline_ns: u64, callback: TimerCallback) -> TimerToken {
        let (token, earliest) = self.queue.start(self.owner, deadline_ns, callback);
        // The home CPU may be sleeping until a later deadline.
        if earliest && self.hal.current_cpu() != Some(self.cpu) {
            self.hal.send_ipi(self.cpu);
        }
        token
    }

    fn cancel(&self, token: TimerToken) -> bool {
        self.queue.cancel(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypervisor::SoftHal;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> TimerCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            let c = c.clone();
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn events_fire_in_deadline_order() {
        let q = Arc::new(TimerQueue::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for deadline in [30u64, 10, 20] {
            let order = order.clone();
            q.start(1, deadline, Box::new(move || order.lock().unwrap().push(deadline)));
        }
        assert_eq!(q.next_deadline(), Some(10));
        assert_eq!(q.expire(5), 0);
        assert_eq!(q.expire(25), 2);
        assert_eq!(*order.lock().unwrap(), vec![10, 20]);
        assert_eq!(q.expire(100), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn cancel_and_owner_cleanup() {
        let q = TimerQueue::new();
        let (count, cb) = counter();
        let (t1, earliest) = q.start(1, 10, cb());
        assert!(earliest);
        let (_, earliest) = q.start(2, 20, cb());
        assert!(!earliest);
        q.start(2, 30, cb());

        assert!(q.cancel(t1));
        assert!(!q.cancel(t1));
        assert_eq!(q.cancel_owner(2), 2);
        assert_eq!(q.expire(u64::MAX), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callbacks_may_rearm() {
        let q = Arc::new(TimerQueue::new());
        let q2 = q.clone();
        let (count, cb) = counter();
        let next = cb();
        q.start(
            1,
            10,
            Box::new(move || {
                q2.start(1, 20, next);
            }),
        );
        assert_eq!(q.expire(15), 1);
        assert_eq!(q.next_deadline(), Some(20));
        q.expire(20);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn earlier_guest_deadline_kicks_home_cpu() {
        let hal = Arc::new(SoftHal::new(2));
        let q = Arc::new(TimerQueue::new());
        let timers = GuestTimers::new(9, 1, q.clone(), hal.clone());
        let (_, cb) = counter();

        timers.start(1_000, cb());
        assert_eq!(hal.ipi_count(1), 1);
        timers.start(2_000, cb());
        assert_eq!(hal.ipi_count(1), 1);
        assert_eq!(timers.cancel_all(), 2);
    }
}
