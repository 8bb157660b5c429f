// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Virtio input device presenting a keyboard with relative pointer axes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use vm_device::GuestMemoryAccess;
use vm_virtio::{
    ActivateResult, Queue, QueueError, VirtioCommon, VirtioDevice, VirtioDeviceType,
    VirtioInterrupt,
};

use crate::queue_helper::{ActiveQueue, Framing, Inbox};

const QUEUE_SIZE: u16 = 128;
const EVENT_QUEUE: u16 = 0;
const STATUS_QUEUE: u16 = 1;
const EVENT_BACKLOG: usize = 256;

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_LED: u16 = 0x11;

pub const REL_X: u16 = 0x00;
pub const REL_Y: u16 = 0x01;
pub const REL_Z: u16 = 0x02;

pub const LED_NUML: u16 = 0x00;
pub const LED_CAPSL: u16 = 0x01;
pub const LED_SCROLLL: u16 = 0x02;

const KEY_CNT: usize = 0x300;
const REL_CNT: usize = 0x10;
const LED_CNT: usize = 0x10;
const BUS_VIRTUAL: u16 = 0x06;

const CFG_UNSET: u8 = 0x00;
const CFG_ID_NAME: u8 = 0x01;
const CFG_ID_SERIAL: u8 = 0x02;
const CFG_ID_DEVIDS: u8 = 0x03;
const CFG_EV_BITS: u8 = 0x11;
const CFG_ABS_INFO: u8 = 0x12;

const CONFIG_SELECT: usize = 0;
const CONFIG_SUBSEL: usize = 1;
const CONFIG_SIZE_FIELD: usize = 2;
const CONFIG_UNION: usize = 8;
const CONFIG_UNION_SIZE: usize = 128;
const CONFIG_SIZE: usize = CONFIG_UNION + CONFIG_UNION_SIZE;

pub const EVENT_SIZE: usize = 8;

/// `struct virtio_input_event`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputEvent {
    pub type_: u16,
    pub code: u16,
    pub value: u32,
}

impl InputEvent {
    pub fn new(type_: u16, code: u16, value: u32) -> Self {
        InputEvent { type_, code, value }
    }

    pub fn to_bytes(self) -> [u8; EVENT_SIZE] {
        let mut b = [0u8; EVENT_SIZE];
        LittleEndian::write_u16(&mut b[0..2], self.type_);
        LittleEndian::write_u16(&mut b[2..4], self.code);
        LittleEndian::write_u32(&mut b[4..8], self.value);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < EVENT_SIZE {
            return None;
        }
        Some(InputEvent {
            type_: LittleEndian::read_u16(&b[0..2]),
            code: LittleEndian::read_u16(&b[2..4]),
            value: LittleEndian::read_u32(&b[4..8]),
        })
    }
}

/// Host side of an input device: injects events and observes the LED
/// state the driver reports back.
#[derive(Clone)]
pub struct InputHandle {
    events: Arc<Inbox>,
    leds: Arc<AtomicU32>,
}

impl InputHandle {
    /// Queues one raw event. Returns false if the backlog is full.
    pub fn inject(&self, type_: u16, code: u16, value: u32) -> bool {
        self.events
            .push(InputEvent::new(type_, code, value).to_bytes().to_vec())
    }

    fn sync(&self) -> bool {
        self.inject(EV_SYN, 0, 0)
    }

    pub fn key(&self, code: u16, pressed: bool) -> bool {
        self.inject(EV_KEY, code, u32::from(pressed)) && self.sync()
    }

    pub fn key_press_release(&self, code: u16) -> bool {
        self.key(code, true) && self.key(code, false)
    }

    pub fn motion(&self, dx: i32, dy: i32) -> bool {
        self.inject(EV_REL, REL_X, dx as u32)
            && self.inject(EV_REL, REL_Y, dy as u32)
            && self.sync()
    }

    /// Bit `LED_*` is set when the driver switched that LED on.
    pub fn led_state(&self) -> u32 {
        self.leds.load(Ordering::Acquire)
    }
}

fn set_bits(bitmap: &mut [u8], bits: &[u16]) {
    for &bit in bits {
        bitmap[usize::from(bit) / 8] |= 1 << (bit % 8);
    }
}

pub struct Input {
    id: String,
    common: VirtioCommon,
    name: String,
    serial: String,
    config: [u8; CONFIG_SIZE],
    events: Arc<Inbox>,
    status: Option<ActiveQueue>,
    leds: Arc<AtomicU32>,
}

impl Input {
    pub fn new(id: String, name: Option<String>) -> (Input, InputHandle) {
        let events = Inbox::new(format!("{id}_events"), Framing::Datagram, EVENT_BACKLOG);
        let leds = Arc::new(AtomicU32::new(0));
        let mut input = Input {
            id,
            common: VirtioCommon::new(VirtioDeviceType::Input, 0, vec![QUEUE_SIZE, QUEUE_SIZE]),
            name: name.unwrap_or_else(|| "Xvisor VirtIO Input".to_string()),
            serial: "0000-0000-0000-0000".to_string(),
            config: [0u8; CONFIG_SIZE],
            events: events.clone(),
            status: None,
            leds: leds.clone(),
        };
        input.update_config();
        (input, InputHandle { events, leds })
    }

    fn update_config(&mut self) {
        let select = self.config[CONFIG_SELECT];
        let subsel = self.config[CONFIG_SUBSEL];
        let union = &mut self.config[CONFIG_UNION..];
        union.fill(0);

        let size = match (select, subsel) {
            (CFG_ID_NAME, 0) | (CFG_ID_SERIAL, 0) => {
                let s = if select == CFG_ID_NAME {
                    &self.name
                } else {
                    &self.serial
                };
                let len = s.len().min(CONFIG_UNION_SIZE);
                union[..len].copy_from_slice(&s.as_bytes()[..len]);
                len
            }
            (CFG_EV_BITS, s) if u16::from(s) == EV_KEY => {
                union[..KEY_CNT / 8].fill(0xff);
                KEY_CNT / 8
            }
            (CFG_EV_BITS, s) if u16::from(s) == EV_REL => {
                set_bits(union, &[REL_X, REL_Y, REL_Z]);
                REL_CNT / 8
            }
            (CFG_EV_BITS, s) if u16::from(s) == EV_LED => {
                set_bits(union, &[LED_NUML, LED_CAPSL, LED_SCROLLL]);
                LED_CNT / 8
            }
            (CFG_ID_DEVIDS, 0) => {
                LittleEndian::write_u16(&mut union[0..2], BUS_VIRTUAL);
                LittleEndian::write_u16(&mut union[2..4], 0x0627);
                LittleEndian::write_u16(&mut union[4..6], 0x0001);
                LittleEndian::write_u16(&mut union[6..8], 0x0001);
                8
            }
            // No properties and no absolute axes.
            _ => 0,
        };
        self.config[CONFIG_SIZE_FIELD] = size as u8;
    }

    fn process_status_queue(&mut self) -> Result<(), QueueError> {
        let Some(sq) = self.status.as_mut() else {
            warn!("{}: status notify before activation", self.id);
            return Ok(());
        };

        let mut leds = self.leds.load(Ordering::Acquire);
        let mut used = false;
        while let Some(chain) = sq.pop()? {
            let bytes = chain.read_all(sq.mem.as_ref())?;
            for event in bytes.chunks_exact(EVENT_SIZE).filter_map(InputEvent::from_bytes) {
                debug!("{}: status event {:?}", self.id, event);
                if event.type_ != EV_LED {
                    continue;
                }
                let mask = match event.code {
                    LED_NUML | LED_CAPSL | LED_SCROLLL => 1u32 << event.code,
                    _ => 0,
                };
                if event.value != 0 {
                    leds |= mask;
                } else {
                    leds &= !mask;
                }
            }
            sq.add_used(chain.head, bytes.len() as u32)?;
            used = true;
        }
        self.leds.store(leds, Ordering::Release);

        if used {
            sq.signal_used_queue();
        }
        Ok(())
    }
}

impl VirtioDevice for Input {
    fn device_type(&self) -> u32 {
        self.common.device_type
    }

    fn queue_max_sizes(&self) -> &[u16] {
        self.common.queue_sizes.as_slice()
    }

    fn features(&self) -> u64 {
        self.common.avail_features
    }

    fn ack_features(&mut self, value: u64) {
        self.common.ack_features(value)
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        self.read_config_from_slice(&self.config, offset, data);
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) {
        match (offset as usize, data) {
            (CONFIG_SELECT, &[select]) => self.config[CONFIG_SELECT] = select,
            (CONFIG_SUBSEL, &[subsel]) => self.config[CONFIG_SUBSEL] = subsel,
            _ => {
                warn!(
                    "{}: invalid config write: offset {:x} length {}",
                    self.id,
                    offset,
                    data.len()
                );
                return;
            }
        }
        self.update_config();
    }

    fn activate(
        &mut self,
        mem: Arc<dyn GuestMemoryAccess>,
        interrupt: Arc<dyn VirtioInterrupt>,
        mut queues: Vec<Queue>,
    ) -> ActivateResult {
        self.common.check_queues(&queues)?;

        let status = queues.remove(STATUS_QUEUE as usize);
        let events = queues.remove(EVENT_QUEUE as usize);
        self.status = Some(ActiveQueue::new(
            STATUS_QUEUE,
            status,
            mem.clone(),
            interrupt.clone(),
        ));
        self.events
            .activate(ActiveQueue::new(EVENT_QUEUE, events, mem, interrupt));
        Ok(())
    }

    fn queue_notify(&mut self, index: u16) {
        match index {
            EVENT_QUEUE => self.events.flush(),
            STATUS_QUEUE => {
                if let Err(e) = self.process_status_queue() {
                    error!("{}: failed to process status queue: {}", self.id, e);
                }
            }
            _ => warn!("{}: notify for unknown queue {}", self.id, index),
        }
    }

    fn reset(&mut self) {
        self.events.deactivate(true);
        self.status = None;
        self.config[CONFIG_SELECT] = CFG_UNSET;
        self.config[CONFIG_SUBSEL] = 0;
        self.update_config();
        self.common.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use virtio_bindings::virtio_ring::VRING_DESC_F_WRITE;
    use vm_device::IrqError;
    use vm_virtio::testing::{TestQueue, VecMemory};
    use vm_virtio::VirtioInterruptType;

    const WRITE: u16 = VRING_DESC_F_WRITE as u16;
    const KEY_A: u16 = 30;

    #[derive(Default)]
    struct CountingInterrupt(AtomicUsize);

    impl VirtioInterrupt for CountingInterrupt {
        fn trigger(&self, _int_type: VirtioInterruptType) -> Result<(), IrqError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn select(input: &mut Input, select: u8, subsel: u8) -> (u8, Vec<u8>) {
        input.write_config(0, &[select]);
        input.write_config(1, &[subsel]);
        let mut size = [0u8];
        input.read_config(2, &mut size);
        let mut union = vec![0u8; size[0] as usize];
        input.read_config(8, &mut union);
        (size[0], union)
    }

    #[test]
    fn config_records() {
        let (mut input, _handle) = Input::new("input0".to_string(), Some("kbd".to_string()));

        assert_eq!(select(&mut input, CFG_ID_NAME, 0), (3, b"kbd".to_vec()));
        assert_eq!(select(&mut input, CFG_ID_NAME, 1).0, 0);
        let (size, serial) = select(&mut input, CFG_ID_SERIAL, 0);
        assert_eq!(size, 19);
        assert_eq!(serial, b"0000-0000-0000-0000");

        let (size, bits) = select(&mut input, CFG_EV_BITS, EV_KEY as u8);
        assert_eq!(size as usize, KEY_CNT / 8);
        assert!(bits.iter().all(|&b| b == 0xff));
        assert_eq!(select(&mut input, CFG_EV_BITS, EV_REL as u8), (2, vec![0x7, 0]));
        assert_eq!(select(&mut input, CFG_EV_BITS, EV_LED as u8), (2, vec![0x7, 0]));
        assert_eq!(select(&mut input, CFG_EV_BITS, 0x05).0, 0);

        let (size, ids) = select(&mut input, CFG_ID_DEVIDS, 0);
        assert_eq!(size, 8);
        assert_eq!(u16::from_le_bytes([ids[0], ids[1]]), BUS_VIRTUAL);
        assert_eq!(select(&mut input, CFG_ABS_INFO, 0).0, 0);

        // Only single byte writes to select and subsel are accepted.
        input.write_config(0, &[CFG_ID_NAME, 0]);
        let mut selected = [0u8];
        input.read_config(0, &mut selected);
        assert_eq!(selected[0], CFG_ABS_INFO);

        input.reset();
        input.read_config(0, &mut selected);
        assert_eq!(selected[0], CFG_UNSET);
    }

    #[test]
    fn events_and_led_status() {
        let mem = Arc::new(VecMemory::new(0, 0x20000));
        let interrupt = Arc::new(CountingInterrupt::default());
        let (mut input, handle) = Input::new("input0".to_string(), None);

        let eventq = TestQueue::new(mem.as_ref(), 0x1000, 16);
        let statusq = TestQueue::new(mem.as_ref(), 0x2000, 16);
        input
            .activate(
                mem.clone(),
                interrupt.clone(),
                vec![eventq.queue(), statusq.queue()],
            )
            .unwrap();

        for i in 0..4u64 {
            eventq.add_chain(&[(0x8000 + 8 * i, 8, WRITE)]);
        }
        input.queue_notify(EVENT_QUEUE);
        assert!(handle.key_press_release(KEY_A));

        let used = eventq.used();
        assert_eq!(used.len(), 4);
        assert!(used.iter().all(|&(_, len)| len == 8));
        let mut raw = [0u8; 32];
        mem.read(0x8000, &mut raw).unwrap();
        let events: Vec<_> = raw.chunks(8).filter_map(InputEvent::from_bytes).collect();
        assert_eq!(
            events,
            vec![
                InputEvent::new(EV_KEY, KEY_A, 1),
                InputEvent::new(EV_SYN, 0, 0),
                InputEvent::new(EV_KEY, KEY_A, 0),
                InputEvent::new(EV_SYN, 0, 0),
            ]
        );

        let mut status = Vec::new();
        status.extend(InputEvent::new(EV_LED, LED_CAPSL, 1).to_bytes());
        status.extend(InputEvent::new(EV_LED, LED_SCROLLL, 1).to_bytes());
        mem.write(0x9000, &status).unwrap();
        statusq.add_chain(&[(0x9000, 16, 0)]);
        input.queue_notify(STATUS_QUEUE);
        assert_eq!(handle.led_state(), 0b110);
        assert_eq!(statusq.used(), vec![(0, 16)]);

        mem.write(0x9100, &InputEvent::new(EV_LED, LED_CAPSL, 0).to_bytes())
            .unwrap();
        statusq.add_chain(&[(0x9100, 8, 0)]);
        input.queue_notify(STATUS_QUEUE);
        assert_eq!(handle.led_state(), 0b100);
    }
}
