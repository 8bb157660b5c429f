// Copyright 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io::{self, Write};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use vm_device::{GuestMemoryAccess, SharedWriter};
use vm_virtio::{
    ActivateResult, Queue, QueueError, VirtioCommon, VirtioDevice, VirtioDeviceType,
    VirtioInterrupt, VirtioInterruptType,
};

use crate::queue_helper::{ActiveQueue, Framing, Inbox};

const QUEUE_SIZE: u16 = 256;
const RECEIVE_QUEUE: u16 = 0;
const TRANSMIT_QUEUE: u16 = 1;
// Chunks of guest input waiting for receive buffers.
const INPUT_BACKLOG: usize = 1024;

const VIRTIO_CONSOLE_F_SIZE: u64 = 0;
const CONFIG_SIZE: usize = 8;
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 25;

/// Feeds host input to a console device.
#[derive(Clone)]
pub struct ConsoleInput {
    inbox: Arc<Inbox>,
}

impl ConsoleInput {
    /// Returns false if the input was dropped because the backlog is full.
    pub fn queue_input(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        self.inbox.push(bytes.to_vec())
    }
}

/// Virtio device for exposing console to the guest OS through virtio.
pub struct Console {
    id: String,
    common: VirtioCommon,
    config: [u8; CONFIG_SIZE],
    out: Box<dyn Write + Send>,
    input: Arc<Inbox>,
    tx: Option<ActiveQueue>,
    interrupt: Option<Arc<dyn VirtioInterrupt>>,
}

impl Console {
    /// Create a new virtio console device. Guest output goes to `out`, or
    /// nowhere.
    pub fn new(id: String, out: Option<SharedWriter>) -> (Console, ConsoleInput) {
        let input = Inbox::new(format!("{id}_rx"), Framing::Stream, INPUT_BACKLOG);
        let out: Box<dyn Write + Send> = match out {
            Some(writer) => Box::new(writer),
            None => Box::new(io::sink()),
        };

        let mut config = [0u8; CONFIG_SIZE];
        LittleEndian::write_u16(&mut config[0..2], DEFAULT_COLS);
        LittleEndian::write_u16(&mut config[2..4], DEFAULT_ROWS);
        LittleEndian::write_u32(&mut config[4..8], 1);

        let console = Console {
            id,
            common: VirtioCommon::new(
                VirtioDeviceType::Console,
                1u64 << VIRTIO_CONSOLE_F_SIZE,
                vec![QUEUE_SIZE, QUEUE_SIZE],
            ),
            config,
            out,
            input: input.clone(),
            tx: None,
            interrupt: None,
        };
        (console, ConsoleInput { inbox: input })
    }

    pub fn size(&self) -> (u16, u16) {
        (
            LittleEndian::read_u16(&self.config[0..2]),
            LittleEndian::read_u16(&self.config[2..4]),
        )
    }

    /// Updates the console geometry and tells the driver if it asked to know.
    pub fn update_console_size(&mut self, cols: u16, rows: u16) {
        LittleEndian::write_u16(&mut self.config[0..2], cols);
        LittleEndian::write_u16(&mut self.config[2..4], rows);
        if !self.common.feature_acked(VIRTIO_CONSOLE_F_SIZE) {
            return;
        }
        if let Some(interrupt) = &self.interrupt {
            if let Err(e) = interrupt.trigger(VirtioInterruptType::Config) {
                error!("{}: failed to signal console driver: {}", self.id, e);
            }
        }
    }

    fn process_output_queue(&mut self) -> Result<(), QueueError> {
        let Some(txq) = self.tx.as_mut() else {
            warn!("{}: transmit notify before activation", self.id);
            return Ok(());
        };

        let mut used = false;
        while let Some(chain) = txq.pop()? {
            let bytes = chain.read_all(txq.mem.as_ref())?;
            if let Err(e) = self.out.write_all(&bytes).and_then(|_| self.out.flush()) {
                error!("{}: failed to write console output: {}", self.id, e);
            }
            txq.add_used(chain.head, 0)?;
            used = true;
        }
        if used {
            txq.signal_used_queue();
        }
        Ok(())
    }
}

impl VirtioDevice for Console {
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

    fn activate(
        &mut self,
        mem: Arc<dyn GuestMemoryAccess>,
        interrupt: Arc<dyn VirtioInterrupt>,
        mut queues: Vec<Queue>,
    ) -> ActivateResult {
        self.common.check_queues(&queues)?;

        let tx = queues.remove(TRANSMIT_QUEUE as usize);
        let rx = queues.remove(RECEIVE_QUEUE as usize);
        self.tx = Some(ActiveQueue::new(
            TRANSMIT_QUEUE,
            tx,
            mem.clone(),
            interrupt.clone(),
        ));
        self.input
            .activate(ActiveQueue::new(RECEIVE_QUEUE, rx, mem, interrupt.clone()));
        self.interrupt = Some(interrupt);
        Ok(())
    }

    fn queue_notify(&mut self, index: u16) {
        match index {
            RECEIVE_QUEUE => self.input.flush(),
            TRANSMIT_QUEUE => {
                if let Err(e) = self.process_output_queue() {
                    error!("{}: failed to process output queue: {}", self.id, e);
                }
            }
            _ => warn!("{}: notify for unknown queue {}", self.id, index),
        }
    }

    fn reset(&mut self) {
        // Keep typed-ahead input for the next driver.
        self.input.deactivate(false);
        self.tx = None;
        self.interrupt = None;
        self.common.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use virtio_bindings::virtio_ring::VRING_DESC_F_WRITE;
    use vm_device::IrqError;
    use vm_virtio::testing::{TestQueue, VecMemory};

    const WRITE: u16 = VRING_DESC_F_WRITE as u16;

    #[derive(Default)]
    struct Interrupts(Mutex<Vec<String>>, AtomicUsize);

    impl VirtioInterrupt for Interrupts {
        fn trigger(&self, int_type: VirtioInterruptType) -> Result<(), IrqError> {
            let name = match int_type {
                VirtioInterruptType::Config => "config".to_string(),
                VirtioInterruptType::Queue(q) => format!("queue{q}"),
            };
            self.0.lock().unwrap().push(name);
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Output(Arc<Mutex<Vec<u8>>>);

    impl Write for Output {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Rig {
        mem: Arc<VecMemory>,
        interrupts: Arc<Interrupts>,
        output: Output,
        console: Console,
        input: ConsoleInput,
    }

    fn rig() -> Rig {
        let output = Output::default();
        let (console, input) =
            Console::new("console0".to_string(), Some(SharedWriter::new(output.clone())));
        Rig {
            mem: Arc::new(VecMemory::new(0, 0x20000)),
            interrupts: Arc::new(Interrupts::default()),
            output,
            console,
            input,
        }
    }

    #[test]
    fn output_reaches_writer() {
        let mut r = rig();
        let rxq = TestQueue::new(r.mem.as_ref(), 0x1000, 16);
        let txq = TestQueue::new(r.mem.as_ref(), 0x2000, 16);
        r.console
            .activate(
                r.mem.clone(),
                r.interrupts.clone(),
                vec![rxq.queue(), txq.queue()],
            )
            .unwrap();

        r.mem.write(0x8000, b"hello, ").unwrap();
        r.mem.write(0x9000, b"world\n").unwrap();
        txq.add_chain(&[(0x8000, 7, 0), (0x9000, 6, 0)]);
        r.console.queue_notify(TRANSMIT_QUEUE);

        assert_eq!(&*r.output.0.lock().unwrap(), b"hello, world\n");
        assert_eq!(txq.used().len(), 1);
        assert_eq!(*r.interrupts.0.lock().unwrap(), vec!["queue1".to_string()]);
    }

    #[test]
    fn input_is_streamed_across_buffers() {
        let mut r = rig();
        assert!(r.input.queue_input(b"typed early "));
        let rxq = TestQueue::new(r.mem.as_ref(), 0x1000, 16);
        let txq = TestQueue::new(r.mem.as_ref(), 0x2000, 16);
        r.console
            .activate(
                r.mem.clone(),
                r.interrupts.clone(),
                vec![rxq.queue(), txq.queue()],
            )
            .unwrap();
        assert!(r.input.queue_input(b"and late"));

        rxq.add_chain(&[(0x8000, 8, WRITE)]);
        rxq.add_chain(&[(0x9000, 8, WRITE)]);
        rxq.add_chain(&[(0xa000, 8, WRITE)]);
        r.console.queue_notify(RECEIVE_QUEUE);

        let used = rxq.used();
        assert_eq!(used.iter().map(|&(_, len)| len).collect::<Vec<_>>(), vec![8, 4, 8]);
        let mut got = Vec::new();
        for (addr, (_, len)) in [0x8000u64, 0x9000, 0xa000].iter().zip(used) {
            let mut buf = vec![0u8; len as usize];
            r.mem.read(*addr, &mut buf).unwrap();
            got.extend(buf);
        }
        assert_eq!(got, b"typed early and late");
    }

    #[test]
    fn resize_raises_config_interrupt_once_negotiated() {
        let mut r = rig();
        assert_eq!(r.console.size(), (80, 25));
        let rxq = TestQueue::new(r.mem.as_ref(), 0x1000, 16);
        let txq = TestQueue::new(r.mem.as_ref(), 0x2000, 16);
        r.console
            .activate(
                r.mem.clone(),
                r.interrupts.clone(),
                vec![rxq.queue(), txq.queue()],
            )
            .unwrap();

        r.console.update_console_size(132, 43);
        assert_eq!(r.interrupts.1.load(Ordering::SeqCst), 0);

        r.console.ack_features(1 << VIRTIO_CONSOLE_F_SIZE);
        r.console.update_console_size(100, 30);
        assert_eq!(*r.interrupts.0.lock().unwrap(), vec!["config".to_string()]);
        let mut cols = [0u8; 2];
        r.console.read_config(0, &mut cols);
        assert_eq!(u16::from_le_bytes(cols), 100);
    }
}
