// Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::{Arc, Mutex};

use hypervisor::AccessWidth;
use vm_device::{Emulator, EmulatorError, GuestMemoryAccess, IrqError, IrqLine, Result};

use super::NOTIFY_REG_OFFSET;
use crate::{
    Queue, VirtioDevice, VirtioDeviceType, VirtioInterrupt, VirtioInterruptType,
    DEVICE_ACKNOWLEDGE, DEVICE_DRIVER, DEVICE_DRIVER_OK, DEVICE_FAILED, DEVICE_FEATURES_OK,
    DEVICE_INIT, INTERRUPT_STATUS_CONFIG_CHANGED, INTERRUPT_STATUS_USED_RING, VIRTIO_F_VERSION_1,
};

pub const MMIO_MAGIC_VALUE: u32 = 0x7472_6976;
/// "XVSR"
pub const MMIO_VENDOR_ID: u32 = 0x5253_5658;
pub const QUEUE_NUM_MAX: u16 = 256;

const MAGIC_VALUE: u64 = 0x000;
const VERSION: u64 = 0x004;
const DEVICE_ID: u64 = 0x008;
const VENDOR_ID: u64 = 0x00c;
const DEVICE_FEATURES: u64 = 0x010;
const DEVICE_FEATURES_SEL: u64 = 0x014;
const DRIVER_FEATURES: u64 = 0x020;
const DRIVER_FEATURES_SEL: u64 = 0x024;
const GUEST_PAGE_SIZE: u64 = 0x028;
const QUEUE_SEL: u64 = 0x030;
const QUEUE_NUM_MAX_REG: u64 = 0x034;
const QUEUE_NUM: u64 = 0x038;
const QUEUE_ALIGN: u64 = 0x03c;
const QUEUE_PFN: u64 = 0x040;
const QUEUE_READY: u64 = 0x044;
const INTERRUPT_STATUS: u64 = 0x060;
const INTERRUPT_ACK: u64 = 0x064;
const STATUS: u64 = 0x070;
const QUEUE_DESC_LOW: u64 = 0x080;
const QUEUE_DESC_HIGH: u64 = 0x084;
const QUEUE_AVAIL_LOW: u64 = 0x090;
const QUEUE_AVAIL_HIGH: u64 = 0x094;
const QUEUE_USED_LOW: u64 = 0x0a0;
const QUEUE_USED_HIGH: u64 = 0x0a4;
const CONFIG_GENERATION: u64 = 0x0fc;
const CONFIG: u64 = 0x100;
const MMIO_SIZE: u64 = 0x1000;

const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Level interrupt of an MMIO transport, held while any status bit is set.
pub struct MmioInterrupt {
    status: Mutex<u32>,
    irq: IrqLine,
}

impl MmioInterrupt {
    pub fn new(irq: IrqLine) -> Self {
        MmioInterrupt {
            status: Mutex::new(0),
            irq,
        }
    }

    pub fn status(&self) -> u32 {
        *self.status.lock().unwrap()
    }

    fn ack(&self, bits: u32) -> std::result::Result<(), IrqError> {
        let mut status = self.status.lock().unwrap();
        *status &= !bits;
        if *status == 0 {
            self.irq.deassert()?;
        }
        Ok(())
    }

    fn clear(&self) -> std::result::Result<(), IrqError> {
        let mut status = self.status.lock().unwrap();
        if *status != 0 {
            *status = 0;
            self.irq.deassert()?;
        }
        Ok(())
    }
}

impl VirtioInterrupt for MmioInterrupt {
    fn trigger(&self, int_type: VirtioInterruptType) -> std::result::Result<(), IrqError> {
        let bit = match int_type {
            VirtioInterruptType::Config => INTERRUPT_STATUS_CONFIG_CHANGED,
            VirtioInterruptType::Queue(_) => INTERRUPT_STATUS_USED_RING,
        };
        let mut status = self.status.lock().unwrap();
        *status |= bit;
        self.irq.assert()
    }
}

/// Implements the
/// [MMIO](http://docs.oasis-open.org/virtio/virtio/v1.0/cs04/virtio-v1.0-cs04.html#x1-1090002)
/// transport for virtio devices, in its legacy (version 1) and modern
/// (version 2) register layouts.
///
/// The transport is the emulator of the VIRTUAL region the device is
/// mapped at; one page of address space covers the registers and the
/// device configuration window.
pub struct MmioTransport {
    id: String,
    version: u32,
    device: Box<dyn VirtioDevice>,
    device_activated: bool,
    mem: Arc<dyn GuestMemoryAccess>,
    interrupt: Arc<MmioInterrupt>,

    features_select: u32,
    acked_features_select: u32,
    queue_select: u32,
    guest_page_size: u32,
    queue_align: u32,
    driver_status: u32,
    config_generation: u32,
    queues: Vec<Queue>,
}

impl MmioTransport {
    /// Constructs a new MMIO transport for the given virtio device.
    pub fn new(
        id: String,
        version: u32,
        device: Box<dyn VirtioDevice>,
        mem: Arc<dyn GuestMemoryAccess>,
        irq: IrqLine,
    ) -> Result<Self> {
        if !(1..=2).contains(&version) {
            return Err(EmulatorError::InvalidConfig(format!(
                "{}: unsupported virtio-mmio version {}",
                id, version
            )));
        }

        let queues = device
            .queue_max_sizes()
            .iter()
            .map(|&s| Queue::new(s.min(QUEUE_NUM_MAX)))
            .collect();
        debug!(
            "{}: virtio-{} on mmio v{}",
            id,
            VirtioDeviceType::from(device.device_type()),
            version
        );

        Ok(MmioTransport {
            id,
            version,
            device,
            device_activated: false,
            mem,
            interrupt: Arc::new(MmioInterrupt::new(irq)),
            features_select: 0,
            acked_features_select: 0,
            queue_select: 0,
            guest_page_size: DEFAULT_PAGE_SIZE,
            queue_align: DEFAULT_PAGE_SIZE,
            driver_status: DEVICE_INIT,
            config_generation: 0,
            queues,
        })
    }

    pub fn device_activated(&self) -> bool {
        self.device_activated
    }

    pub fn interrupt_status(&self) -> u32 {
        self.interrupt.status()
    }

    fn is_driver_ready(&self) -> bool {
        let mut ready_bits = DEVICE_ACKNOWLEDGE | DEVICE_DRIVER | DEVICE_DRIVER_OK;
        if self.version > 1 {
            ready_bits |= DEVICE_FEATURES_OK;
        }
        self.driver_status & ready_bits == ready_bits && self.driver_status & DEVICE_FAILED == 0
    }

    fn are_queues_valid(&self) -> bool {
        self.queues.iter().all(|q| q.is_valid())
    }

    fn with_queue<U, F>(&self, d: U, f: F) -> U
    where
        F: FnOnce(&Queue) -> U,
    {
        match self.queues.get(self.queue_select as usize) {
            Some(queue) => f(queue),
            None => d,
        }
    }

    fn with_queue_mut<F: FnOnce(&mut Queue)>(&mut self, f: F) -> bool {
        if let Some(queue) = self.queues.get_mut(self.queue_select as usize) {
            f(queue);
            true
        } else {
            false
        }
    }

    fn device_features(&self) -> u64 {
        let features = self.device.features();
        if self.version == 1 {
            features & !(1u64 << VIRTIO_F_VERSION_1)
        } else {
            features | 1u64 << VIRTIO_F_VERSION_1
        }
    }

    fn reset_transport(&mut self) {
        if self.device_activated {
            debug!("{}: device reset", self.id);
        }
        self.device.reset();
        self.device_activated = false;
        self.features_select = 0;
        self.acked_features_select = 0;
        self.queue_select = 0;
        self.driver_status = DEVICE_INIT;
        self.config_generation = self.config_generation.wrapping_add(1);
        for queue in self.queues.iter_mut() {
            queue.reset();
        }
        if let Err(e) = self.interrupt.clear() {
            warn!("{}: cannot lower interrupt: {}", self.id, e);
        }
    }

    fn maybe_activate(&mut self) {
        if self.device_activated || !self.is_driver_ready() {
            return;
        }
        if !self.are_queues_valid() {
            warn!("{}: driver ready with unconfigured queues", self.id);
            return;
        }

        let interrupt: Arc<dyn VirtioInterrupt> = self.interrupt.clone();
        match self
            .device
            .activate(self.mem.clone(), interrupt, self.queues.clone())
        {
            Ok(()) => {
                debug!("{}: device activated", self.id);
                self.device_activated = true;
            }
            Err(e) => {
                error!("{}: failed to activate device: {}", self.id, e);
                self.driver_status |= DEVICE_FAILED;
            }
        }
    }

    fn read_register(&self, offset: u64) -> u32 {
        let legacy = self.version == 1;
        match offset {
            MAGIC_VALUE => MMIO_MAGIC_VALUE,
            VERSION => self.version,
            DEVICE_ID => self.device.device_type(),
            VENDOR_ID => MMIO_VENDOR_ID,
            DEVICE_FEATURES => match self.features_select {
                0 => self.device_features() as u32,
                1 => (self.device_features() >> 32) as u32,
                _ => 0,
            },
            DEVICE_FEATURES_SEL => self.features_select,
            DRIVER_FEATURES_SEL => self.acked_features_select,
            GUEST_PAGE_SIZE if legacy => self.guest_page_size,
            QUEUE_SEL => self.queue_select,
            QUEUE_NUM_MAX_REG => self.with_queue(0, |q| u32::from(q.max_size())),
            QUEUE_NUM => self.with_queue(0, |q| u32::from(q.size)),
            QUEUE_ALIGN if legacy => self.queue_align,
            QUEUE_PFN if legacy => self.with_queue(0, |q| q.pfn),
            QUEUE_READY if !legacy => self.with_queue(0, |q| q.ready as u32),
            INTERRUPT_STATUS => self.interrupt.status(),
            STATUS => self.driver_status,
            QUEUE_DESC_LOW if !legacy => self.with_queue(0, |q| q.desc_table as u32),
            QUEUE_DESC_HIGH if !legacy => self.with_queue(0, |q| (q.desc_table >> 32) as u32),
            QUEUE_AVAIL_LOW if !legacy => self.with_queue(0, |q| q.avail_ring as u32),
            QUEUE_AVAIL_HIGH if !legacy => self.with_queue(0, |q| (q.avail_ring >> 32) as u32),
            QUEUE_USED_LOW if !legacy => self.with_queue(0, |q| q.used_ring as u32),
            QUEUE_USED_HIGH if !legacy => self.with_queue(0, |q| (q.used_ring >> 32) as u32),
            CONFIG_GENERATION if !legacy => self.config_generation,
            _ => {
                warn!("{}: unknown virtio mmio register read: {:#x}", self.id, offset);
                0
            }
        }
    }

    fn write_register(&mut self, offset: u64, v: u32) {
        fn hi(addr: &mut u64, x: u32) {
            *addr = (*addr & 0xffff_ffff) | (u64::from(x) << 32)
        }

        fn lo(addr: &mut u64, x: u32) {
            *addr = (*addr & !0xffff_ffff) | u64::from(x)
        }

        let legacy = self.version == 1;
        let mut mut_q = false;
        match offset {
            DEVICE_FEATURES_SEL => self.features_select = v,
            DRIVER_FEATURES => match self.acked_features_select {
                0 => self.device.ack_features(u64::from(v)),
                1 => self.device.ack_features(u64::from(v) << 32),
                _ => warn!("{}: invalid driver features select", self.id),
            },
            DRIVER_FEATURES_SEL => self.acked_features_select = v,
            GUEST_PAGE_SIZE if legacy => self.guest_page_size = v,
            QUEUE_SEL => self.queue_select = v,
            QUEUE_NUM => {
                mut_q = self.with_queue_mut(|q| {
                    if v <= u32::from(q.max_size()) {
                        q.size = v as u16;
                    }
                });
            }
            QUEUE_ALIGN if legacy => self.queue_align = v,
            QUEUE_PFN if legacy => {
                let (page_size, align) = (self.guest_page_size, self.queue_align);
                mut_q = self.with_queue_mut(|q| q.set_legacy_pfn(v, page_size, align));
            }
            QUEUE_READY if !legacy => mut_q = self.with_queue_mut(|q| q.ready = v == 1),
            NOTIFY_REG_OFFSET => {
                if self.device_activated {
                    self.device.queue_notify(v as u16);
                } else {
                    warn!("{}: queue {} notified before activation", self.id, v);
                }
            }
            INTERRUPT_ACK => {
                if let Err(e) = self.interrupt.ack(v) {
                    warn!("{}: cannot lower interrupt: {}", self.id, e);
                }
            }
            STATUS => {
                if v == DEVICE_INIT {
                    self.reset_transport();
                } else {
                    self.driver_status = v;
                }
            }
            QUEUE_DESC_LOW if !legacy => mut_q = self.with_queue_mut(|q| lo(&mut q.desc_table, v)),
            QUEUE_DESC_HIGH if !legacy => {
                mut_q = self.with_queue_mut(|q| hi(&mut q.desc_table, v))
            }
            QUEUE_AVAIL_LOW if !legacy => {
                mut_q = self.with_queue_mut(|q| lo(&mut q.avail_ring, v))
            }
            QUEUE_AVAIL_HIGH if !legacy => {
                mut_q = self.with_queue_mut(|q| hi(&mut q.avail_ring, v))
            }
            QUEUE_USED_LOW if !legacy => mut_q = self.with_queue_mut(|q| lo(&mut q.used_ring, v)),
            QUEUE_USED_HIGH if !legacy => {
                mut_q = self.with_queue_mut(|q| hi(&mut q.used_ring, v))
            }
            MAGIC_VALUE | VERSION | DEVICE_ID | VENDOR_ID | DEVICE_FEATURES | QUEUE_NUM_MAX_REG
            | INTERRUPT_STATUS | CONFIG_GENERATION => {
                warn!("{}: write to read-only register {:#x}", self.id, offset);
                return;
            }
            _ => {
                warn!("{}: unknown virtio mmio register write: {:#x}", self.id, offset);
                return;
            }
        }

        if self.device_activated && mut_q {
            warn!("{}: virtio queue was changed after device was activated", self.id);
        }

        self.maybe_activate();
    }
}

impl Emulator for MmioTransport {
    fn read(&mut self, _vcpu: usize, offset: u64, width: AccessWidth) -> Result<u64> {
        match offset {
            0..CONFIG if width == AccessWidth::Word => Ok(u64::from(self.read_register(offset))),
            CONFIG..MMIO_SIZE => {
                let mut data = [0u8; 8];
                self.device
                    .read_config(offset - CONFIG, &mut data[..width.bytes()]);
                Ok(u64::from_le_bytes(data))
            }
            _ => Err(EmulatorError::BadAccess { offset, width }),
        }
    }

    fn write(&mut self, _vcpu: usize, offset: u64, width: AccessWidth, value: u64) -> Result<()> {
        match offset {
            0..CONFIG if width == AccessWidth::Word => {
                self.write_register(offset, value as u32);
                Ok(())
            }
            CONFIG..MMIO_SIZE => {
                let data = value.to_le_bytes();
                self.device
                    .write_config(offset - CONFIG, &data[..width.bytes()]);
                self.config_generation = self.config_generation.wrapping_add(1);
                Ok(())
            }
            _ => Err(EmulatorError::BadAccess { offset, width }),
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.reset_transport();
        Ok(())
    }

    fn remove(&mut self) {
        self.device.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::VecMemory;
    use crate::ActivateResult;
    use vm_device::{IrqChip, IrqRouter};

    #[derive(Default)]
    struct Lines(Mutex<Vec<bool>>);

    impl IrqChip for Lines {
        fn handle(
            &self,
            _line: u32,
            _cpu_hint: Option<usize>,
            level: bool,
        ) -> std::result::Result<(), IrqError> {
            self.0.lock().unwrap().push(level);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Probe {
        config: [u8; 8],
        acked: Arc<Mutex<u64>>,
        notified: Arc<Mutex<Vec<u16>>>,
        activated: Arc<Mutex<Option<Vec<Queue>>>>,
        interrupt: Option<Arc<dyn VirtioInterrupt>>,
    }

    impl VirtioDevice for Probe {
        fn device_type(&self) -> u32 {
            VirtioDeviceType::Console as u32
        }

        fn queue_max_sizes(&self) -> &[u16] {
            &[64, 1024]
        }

        fn features(&self) -> u64 {
            0x5
        }

        fn ack_features(&mut self, value: u64) {
            *self.acked.lock().unwrap() |= value & (self.features() | 1 << VIRTIO_F_VERSION_1);
        }

        fn read_config(&self, offset: u64, data: &mut [u8]) {
            self.read_config_from_slice(&self.config, offset, data);
        }

        fn write_config(&mut self, offset: u64, data: &[u8]) {
            let mut config = self.config;
            self.write_config_helper(&mut config, offset, data);
            self.config = config;
        }

        fn activate(
            &mut self,
            _mem: Arc<dyn GuestMemoryAccess>,
            interrupt: Arc<dyn VirtioInterrupt>,
            queues: Vec<Queue>,
        ) -> ActivateResult {
            *self.activated.lock().unwrap() = Some(queues);
            self.interrupt = Some(interrupt);
            Ok(())
        }

        fn queue_notify(&mut self, index: u16) {
            self.notified.lock().unwrap().push(index);
            if let Some(interrupt) = &self.interrupt {
                interrupt.trigger(VirtioInterruptType::Queue(index)).unwrap();
            }
        }

        fn reset(&mut self) {
            *self.activated.lock().unwrap() = None;
            self.interrupt = None;
        }
    }

    struct Setup {
        mmio: MmioTransport,
        lines: Arc<Lines>,
        acked: Arc<Mutex<u64>>,
        notified: Arc<Mutex<Vec<u16>>>,
        activated: Arc<Mutex<Option<Vec<Queue>>>>,
    }

    fn setup(version: u32) -> Setup {
        let router = Arc::new(IrqRouter::new());
        let lines = Arc::new(Lines::default());
        router.register_chip("gic", lines.clone()).unwrap();
        let probe = Probe::default();
        let (acked, notified, activated) = (
            probe.acked.clone(),
            probe.notified.clone(),
            probe.activated.clone(),
        );
        let mem = Arc::new(VecMemory::new(0, 0x10000));
        let mmio = MmioTransport::new(
            "vio0".to_string(),
            version,
            Box::new(probe),
            mem,
            IrqLine::new(router, None, 40),
        )
        .unwrap();
        Setup {
            mmio,
            lines,
            acked,
            notified,
            activated,
        }
    }

    fn rd(mmio: &mut MmioTransport, offset: u64) -> u32 {
        mmio.read(0, offset, AccessWidth::Word).unwrap() as u32
    }

    fn wr(mmio: &mut MmioTransport, offset: u64, value: u32) {
        mmio.write(0, offset, AccessWidth::Word, u64::from(value))
            .unwrap();
    }

    #[test]
    fn identification() {
        let mut s = setup(2);
        assert_eq!(rd(&mut s.mmio, MAGIC_VALUE), 0x7472_6976);
        assert_eq!(rd(&mut s.mmio, VERSION), 2);
        assert_eq!(rd(&mut s.mmio, DEVICE_ID), 3);
        assert_eq!(rd(&mut s.mmio, VENDOR_ID), 0x5253_5658);

        // Writes to identification registers are dropped.
        wr(&mut s.mmio, DEVICE_ID, 7);
        assert_eq!(rd(&mut s.mmio, DEVICE_ID), 3);

        // Queue sizes are capped.
        wr(&mut s.mmio, QUEUE_SEL, 1);
        assert_eq!(rd(&mut s.mmio, QUEUE_NUM_MAX_REG), 256);
        wr(&mut s.mmio, QUEUE_SEL, 2);
        assert_eq!(rd(&mut s.mmio, QUEUE_NUM_MAX_REG), 0);

        assert!(s.mmio.read(0, MAGIC_VALUE, AccessWidth::Byte).is_err());
        assert!(s.mmio.read(0, MMIO_SIZE, AccessWidth::Word).is_err());
    }

    #[test]
    fn unknown_version_rejected() {
        let router = Arc::new(IrqRouter::new());
        assert!(MmioTransport::new(
            "bad".to_string(),
            3,
            Box::new(Probe::default()),
            Arc::new(VecMemory::new(0, 16)),
            IrqLine::new(router, None, 1),
        )
        .is_err());
    }

    #[test]
    fn feature_negotiation() {
        let mut s = setup(2);
        assert_eq!(rd(&mut s.mmio, DEVICE_FEATURES), 0x5);
        wr(&mut s.mmio, DEVICE_FEATURES_SEL, 1);
        assert_eq!(rd(&mut s.mmio, DEVICE_FEATURES), 1);

        wr(&mut s.mmio, DRIVER_FEATURES, 0x7);
        wr(&mut s.mmio, DRIVER_FEATURES_SEL, 1);
        wr(&mut s.mmio, DRIVER_FEATURES, 1);
        assert_eq!(*s.acked.lock().unwrap(), 0x1_0000_0005);

        let mut legacy = setup(1);
        wr(&mut legacy.mmio, DEVICE_FEATURES_SEL, 1);
        assert_eq!(rd(&mut legacy.mmio, DEVICE_FEATURES), 0);
    }

    #[test]
    fn modern_activation_and_interrupts() {
        let mut s = setup(2);
        for (index, base) in [(0u32, 0x1000u32), (1, 0x4000)] {
            wr(&mut s.mmio, QUEUE_SEL, index);
            wr(&mut s.mmio, QUEUE_NUM, 16);
            wr(&mut s.mmio, QUEUE_DESC_LOW, base);
            wr(&mut s.mmio, QUEUE_AVAIL_LOW, base + 0x100);
            wr(&mut s.mmio, QUEUE_USED_LOW, base + 0x200);
            wr(&mut s.mmio, QUEUE_READY, 1);
        }
        assert_eq!(rd(&mut s.mmio, QUEUE_AVAIL_LOW), 0x4100);

        wr(&mut s.mmio, NOTIFY_REG_OFFSET, 0);
        assert!(s.notified.lock().unwrap().is_empty());

        wr(&mut s.mmio, STATUS, DEVICE_ACKNOWLEDGE | DEVICE_DRIVER);
        wr(&mut s.mmio, STATUS, DEVICE_ACKNOWLEDGE | DEVICE_DRIVER | DEVICE_FEATURES_OK);
        assert!(!s.mmio.device_activated());
        wr(
            &mut s.mmio,
            STATUS,
            DEVICE_ACKNOWLEDGE | DEVICE_DRIVER | DEVICE_FEATURES_OK | DEVICE_DRIVER_OK,
        );
        assert!(s.mmio.device_activated());
        let queues = s.activated.lock().unwrap().clone().unwrap();
        assert_eq!(queues[1].desc_table, 0x4000);
        assert_eq!(queues[1].size, 16);

        wr(&mut s.mmio, NOTIFY_REG_OFFSET, 1);
        assert_eq!(*s.notified.lock().unwrap(), vec![1]);
        assert_eq!(rd(&mut s.mmio, INTERRUPT_STATUS), INTERRUPT_STATUS_USED_RING);
        assert_eq!(*s.lines.0.lock().unwrap(), vec![true]);

        wr(&mut s.mmio, INTERRUPT_ACK, INTERRUPT_STATUS_USED_RING);
        assert_eq!(rd(&mut s.mmio, INTERRUPT_STATUS), 0);
        assert_eq!(*s.lines.0.lock().unwrap(), vec![true, false]);

        let generation = rd(&mut s.mmio, CONFIG_GENERATION);
        wr(&mut s.mmio, STATUS, 0);
        assert!(!s.mmio.device_activated());
        assert!(s.activated.lock().unwrap().is_none());
        assert_eq!(rd(&mut s.mmio, QUEUE_READY), 0);
        assert_ne!(rd(&mut s.mmio, CONFIG_GENERATION), generation);
    }

    #[test]
    fn legacy_activation() {
        let mut s = setup(1);
        wr(&mut s.mmio, GUEST_PAGE_SIZE, 4096);
        for (index, pfn) in [(0u32, 1u32), (1, 3)] {
            wr(&mut s.mmio, QUEUE_SEL, index);
            wr(&mut s.mmio, QUEUE_NUM, 16);
            wr(&mut s.mmio, QUEUE_ALIGN, 4096);
            wr(&mut s.mmio, QUEUE_PFN, pfn);
        }
        assert_eq!(rd(&mut s.mmio, QUEUE_PFN), 3);
        // Modern queue registers do not exist in the legacy layout.
        assert_eq!(rd(&mut s.mmio, QUEUE_READY), 0);

        wr(&mut s.mmio, STATUS, DEVICE_ACKNOWLEDGE | DEVICE_DRIVER | DEVICE_DRIVER_OK);
        assert!(s.mmio.device_activated());
        let queues = s.activated.lock().unwrap().clone().unwrap();
        assert_eq!(queues[0].desc_table, 0x1000);
        assert_eq!(queues[0].used_ring, 0x2000);
        assert_eq!(queues[1].desc_table, 0x3000);
    }

    #[test]
    fn config_window() {
        let mut s = setup(2);
        s.mmio
            .write(0, CONFIG + 2, AccessWidth::Half, 0xbeef)
            .unwrap();
        assert_eq!(s.mmio.read(0, CONFIG + 2, AccessWidth::Half).unwrap(), 0xbeef);
        assert_eq!(s.mmio.read(0, CONFIG + 3, AccessWidth::Byte).unwrap(), 0xbe);
        assert_eq!(
            s.mmio.read(0, CONFIG, AccessWidth::Double).unwrap(),
            0xbeef_0000
        );
        // Past the end of the device configuration.
        assert_eq!(s.mmio.read(0, CONFIG + 8, AccessWidth::Word).unwrap(), 0);
    }
}
