// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CPU-side sequencer for the host-DMA port.
//!
//! The external-memory controller maps the DSP's host-DP engine onto two
//! 16-bit locations in the async address space: a data port (the FIFO) and
//! a config port (descriptor loads and status reads). The CPU is the bus
//! master — every transfer in either direction is clocked by this side
//! writing a 7-word descriptor and then moving words through the data port:
//!
//! - outbound (host write): [`EmifaSequencer::submit`] pushes the header
//!   burst; each later [`service`](EmifaSequencer::service) call pushes one
//!   payload block once the previous block's DMA has completed;
//! - inbound (host read): the DSP raises `HSHK`; `service` notices, drains
//!   the header burst (hardware drops `HSHK` with the last header word),
//!   then drains one payload block per call, landing words in local memory
//!   through [`LinkRam`].
//!
//! Descriptor acceptance has a hazard window: `ALLOW_CNFG` rises after the
//! last descriptor word while `DMA_RDY` is still clear for one more cycle.
//! `ALLOW_CNFG`-set-and-`DMA_RDY`-clear is an intermediate state, so after
//! the final word the sequencer spins on `DMA_RDY` (bounded) before
//! touching the data port. Exhausting either spin is a local DMA fault:
//! the sequencer halts, asserts the `BTE` back channel, and stays down
//! until the DSP acknowledges with a status interrupt.

#![cfg_attr(not(test), no_std)]

use drv_hostdp_link_api::{
    EventKind, Header, HostStatus, LinkEvent, LinkRam, Mode, RawEnvelope, SeqError, SeqEvent,
    Sequencer, DSP_TO_HOST_HEADER_BASE, EVENT_QUEUE_SLOTS, FIFO_WORDS16, HEADER_WIRE_WORDS,
    HOST_TO_DSP_HEADER_BASE,
};
use ringq::SpscRing;
use tracebuf::{trace_entry, tracebuf};

/// Register-level operations of the EMIFA-mapped host port. The real
/// implementation reads and writes the two memory-mapped 16-bit ports;
/// tests substitute a software model of the DSP end.
pub trait EmifaPort {
    /// Reads the host status register (a config-port read).
    fn status(&self) -> HostStatus;

    /// Writes one word of a descriptor into the config port.
    fn write_config(&mut self, word: u16);

    /// Reads one word from the data port (FIFO).
    fn read_data(&mut self) -> u16;

    /// Writes one word into the data port (FIFO).
    fn write_data(&mut self, word: u16);

    /// Raises the host status interrupt at the DSP.
    fn send_host_irq(&mut self);

    /// Drives the back-channel bit that tells the DSP this side faulted.
    fn set_bte(&mut self, on: bool);
}

/// First descriptor word: linear transfer, 16-bit words, stop mode.
const CONFIG_BASE: u16 = 0x00A9;
/// Direction bit in the first descriptor word: set = host write.
const CONFIG_WNR: u16 = 1 << 1;
/// Address stride between 16-bit words.
const XMODIFY: u16 = 2;

/// Bound on the descriptor-acceptance spins. Generous against the
/// one-cycle hardware latency; exhausting it means the DSP end is gone.
const SPIN_LIMIT: u32 = 0x1_0000;

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    LinkUp,
    Submit { words: u16 },
    BlockOut { sent: u16 },
    HeaderIn { words: u16 },
    BlockIn { done: u16 },
    WriteComplete,
    ReadComplete,
    ConfigTimeout,
    PeerFault,
    Restart,
    EventOverflow,
}

tracebuf!(Trace, 32, Trace::None);

struct TxState {
    header: Header,
    payload: Option<&'static [u32]>,
    /// 16-bit words already pushed, header excluded.
    sent16: u16,
}

struct RxState {
    header: Header,
    /// 16-bit words already drained, header excluded.
    done16: u16,
}

/// The CPU-side sequencer. `service` must run from the mainline at least
/// as often as blocks complete; `on_status_irq` is the entry for the
/// DSP-raised status interrupt (back-channel traffic).
pub struct EmifaSequencer<P: EmifaPort, R: LinkRam> {
    port: P,
    ram: R,
    mode: Mode,
    /// Whether the DSP has brought its host port up yet.
    link_up: bool,
    tx: TxState,
    rx: RxState,
    events: SpscRing<SeqEvent, EVENT_QUEUE_SLOTS>,
    overflow_fault: bool,
}

impl<P: EmifaPort, R: LinkRam> EmifaSequencer<P, R> {
    pub fn new(port: P, ram: R) -> Self {
        let blank = Header {
            word_count: 0,
            _rsvd: 0,
            remote_addr: 0,
            local_addr: 0,
            meta: RawEnvelope::ZERO,
        };
        Self {
            port,
            ram,
            mode: Mode::Off,
            link_up: false,
            tx: TxState {
                header: blank,
                payload: None,
                sent16: 0,
            },
            rx: RxState {
                header: blank,
                done16: 0,
            },
            events: SpscRing::new(),
            overflow_fault: false,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn init(&mut self) {
        // The EMIFA timing registers are set up by board init; nothing to
        // program here until the DSP end appears.
        self.mode = Mode::Idle;
    }

    /// True once the DSP has initialized its host port. Until then the
    /// status register shows FIFO-full and FIFO-empty at once — an
    /// impossible state that only the unconfigured engine produces.
    fn check_link_up(&mut self) -> bool {
        if self.link_up {
            return true;
        }
        let status = self.port.status();
        if status.contains(HostStatus::FIFO_FULL) && status.contains(HostStatus::FIFO_EMPTY) {
            return false;
        }
        self.link_up = true;
        trace_entry!(Trace::LinkUp);
        true
    }

    /// Attempts to start a host write. Pushes the header burst; payload
    /// blocks follow from `service`. The DSP's pending handshake takes
    /// priority: its transfers block on us, ours merely queue.
    pub fn submit(
        &mut self,
        remote_addr: u32,
        words: Option<&'static [u32]>,
        word_count16: u16,
        meta: RawEnvelope,
    ) -> Result<(), SeqError> {
        if self.mode == Mode::Off || !self.check_link_up() {
            return Err(SeqError::Uninitialised);
        }
        if self.mode != Mode::Idle {
            return Err(SeqError::BusOccupied);
        }
        if self.port.status().contains(HostStatus::HSHK) {
            return Err(SeqError::BusOccupied);
        }
        debug_assert_eq!(words.map_or(0, |w| 2 * w.len()), word_count16 as usize);

        let header = Header {
            word_count: word_count16,
            _rsvd: 0,
            remote_addr,
            local_addr: words.map_or(0, |w| w.as_ptr() as u32),
            meta,
        };
        if self
            .write_descriptor(HOST_TO_DSP_HEADER_BASE, HEADER_WIRE_WORDS as u16, true)
            .is_err()
        {
            self.fault(meta);
            return Err(SeqError::Uninitialised);
        }
        for word in header.to_wire() {
            self.port.write_data(word);
        }

        self.tx = TxState {
            header,
            payload: words,
            sent16: 0,
        };
        self.mode = Mode::HostWrite;
        trace_entry!(Trace::Submit {
            words: word_count16
        });
        Ok(())
    }

    /// Mainline pump: advances the active transfer by one block, or picks
    /// up a DSP-initiated host read. Never blocks beyond the bounded
    /// descriptor spins.
    pub fn service(&mut self) {
        if self.mode == Mode::Off || !self.check_link_up() {
            return;
        }
        match self.mode {
            Mode::HostWrite => {
                if self.port.status().contains(HostStatus::DMA_CMPLT) {
                    self.advance_tx();
                }
            }
            Mode::HostReadApproved => {
                if self.port.status().contains(HostStatus::DMA_CMPLT) {
                    self.drain_rx_block();
                }
            }
            Mode::Idle => {
                if self.port.status().contains(HostStatus::HSHK) {
                    self.begin_host_read();
                }
            }
            Mode::Off => {}
        }
    }

    /// Status interrupt from the DSP. Either the acknowledgment that lets
    /// us out of a fault halt, or notice (via `BTE`) that the DSP end
    /// faulted and wants a restart.
    pub fn on_status_irq(&mut self) {
        if self.mode == Mode::Off {
            // Peer acknowledged our fault.
            self.mode = Mode::Idle;
            self.tx.sent16 = 0;
            self.rx.done16 = 0;
            self.port.set_bte(false);
            trace_entry!(Trace::Restart);
            return;
        }

        if self.port.status().contains(HostStatus::BTE) {
            trace_entry!(Trace::PeerFault);
            if self.mode != Mode::Idle {
                let meta = match self.mode {
                    Mode::HostWrite => self.tx.header.meta,
                    Mode::HostReadApproved => self.rx.header.meta,
                    _ => RawEnvelope::ZERO,
                };
                self.enqueue(EventKind::Error, meta);
            }
            self.mode = Mode::Idle;
            self.tx.sent16 = 0;
            self.rx.done16 = 0;
            // Ack: the DSP restarts its port and drops BTE on this.
            self.port.send_host_irq();
        }
    }

    fn advance_tx(&mut self) {
        let remaining = self.tx.header.word_count - self.tx.sent16;
        if remaining == 0 {
            self.mode = Mode::Idle;
            let meta = self.tx.header.meta;
            self.enqueue(EventKind::HostWriteComplete, meta);
            trace_entry!(Trace::WriteComplete);
            return;
        }

        let n = remaining.min(FIFO_WORDS16 as u16);
        let block_addr = self.tx.header.remote_addr + 2 * self.tx.sent16 as u32;
        if self.write_descriptor(block_addr, n, true).is_err() {
            let meta = self.tx.header.meta;
            self.fault(meta);
            return;
        }

        // Payload words are 32-bit; the port carries 16-bit halves, low
        // half first.
        let payload = self.tx.payload.unwrap_or(&[]);
        for i in 0..n {
            let idx = (self.tx.sent16 + i) as usize;
            let word = payload[idx / 2];
            let half = if idx % 2 == 0 { word } else { word >> 16 };
            self.port.write_data(half as u16);
        }
        self.tx.sent16 += n;
        trace_entry!(Trace::BlockOut {
            sent: self.tx.sent16
        });
    }

    fn begin_host_read(&mut self) {
        if self
            .write_descriptor(DSP_TO_HOST_HEADER_BASE, HEADER_WIRE_WORDS as u16, false)
            .is_err()
        {
            self.fault(RawEnvelope::ZERO);
            return;
        }

        let mut words = [0u16; HEADER_WIRE_WORDS];
        for w in words.iter_mut() {
            *w = self.port.read_data();
        }
        // HSHK drops in hardware as the last header word leaves the FIFO.
        let header = Header::from_wire(words);
        trace_entry!(Trace::HeaderIn {
            words: header.word_count
        });

        if header.word_count == 0 {
            self.enqueue(EventKind::HostReadComplete, header.meta);
            trace_entry!(Trace::ReadComplete);
            return;
        }

        self.rx = RxState { header, done16: 0 };
        self.mode = Mode::HostReadApproved;
    }

    fn drain_rx_block(&mut self) {
        let remaining = self.rx.header.word_count - self.rx.done16;
        let n = remaining.min(FIFO_WORDS16 as u16);
        let block_addr = self
            .rx
            .header
            .local_addr
            .wrapping_add(2 * self.rx.done16 as u32);
        if self.write_descriptor(block_addr, n, false).is_err() {
            let meta = self.rx.header.meta;
            self.fault(meta);
            return;
        }

        // Payload word counts are even (32-bit words doubled), so halves
        // always pair up within a block.
        let mut i = 0;
        while i < n {
            let lo = self.port.read_data() as u32;
            let hi = self.port.read_data() as u32;
            let dest = self.rx.header.remote_addr + 2 * (self.rx.done16 + i) as u32;
            self.ram.deposit(dest, lo | hi << 16);
            i += 2;
        }
        self.rx.done16 += n;
        trace_entry!(Trace::BlockIn {
            done: self.rx.done16
        });

        if self.rx.done16 == self.rx.header.word_count {
            self.mode = Mode::Idle;
            let meta = self.rx.header.meta;
            self.enqueue(EventKind::HostReadComplete, meta);
            trace_entry!(Trace::ReadComplete);
        }
    }

    /// Loads one 7-word descriptor. Waits for `ALLOW_CNFG`, streams the
    /// words, then holds off until `DMA_RDY` confirms the engine latched
    /// it. Both waits are bounded; timing out means the DSP end died.
    fn write_descriptor(
        &mut self,
        start_address: u32,
        word_count: u16,
        write: bool,
    ) -> Result<(), ConfigTimeout> {
        self.spin_on(HostStatus::ALLOW_CNFG)?;

        let flags = if write { CONFIG_WNR } else { 0 };
        self.port.write_config(CONFIG_BASE | flags);
        self.port.write_config(start_address as u16);
        self.port.write_config((start_address >> 16) as u16);
        self.port.write_config(word_count); // XCOUNT
        self.port.write_config(XMODIFY);
        self.port.write_config(1); // YCOUNT
        self.port.write_config(1); // YMODIFY

        // ALLOW_CNFG may already read as set here while DMA_RDY is still
        // clear; only DMA_RDY says the descriptor was latched.
        self.spin_on(HostStatus::DMA_RDY)
    }

    fn spin_on(&mut self, bit: HostStatus) -> Result<(), ConfigTimeout> {
        for _ in 0..SPIN_LIMIT {
            if self.port.status().contains(bit) {
                return Ok(());
            }
        }
        trace_entry!(Trace::ConfigTimeout);
        Err(ConfigTimeout)
    }

    /// Local fault: halt and raise the back channel; the DSP's status
    /// interrupt is the only way back to `Idle`.
    fn fault(&mut self, meta: RawEnvelope) {
        self.mode = Mode::Off;
        self.port.set_bte(true);
        self.enqueue(EventKind::Error, meta);
    }

    fn enqueue(&mut self, kind: EventKind, meta: RawEnvelope) {
        if self.events.push(SeqEvent { kind, meta }).is_err() {
            // Same halting policy as the DSP end: never drop a completion.
            trace_entry!(Trace::EventOverflow);
            self.overflow_fault = true;
            self.mode = Mode::Off;
            self.port.set_bte(true);
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct ConfigTimeout;

impl<P: EmifaPort, R: LinkRam> Sequencer for EmifaSequencer<P, R> {
    fn init(&mut self) {
        EmifaSequencer::init(self);
    }

    fn service(&mut self) {
        EmifaSequencer::service(self);
    }

    fn submit(
        &mut self,
        remote_addr: u32,
        words: Option<&'static [u32]>,
        word_count16: u16,
        meta: RawEnvelope,
    ) -> Result<(), SeqError> {
        EmifaSequencer::submit(self, remote_addr, words, word_count16, meta)
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        if let Some(ev) = self.events.pop() {
            return Some(match ev.kind {
                // Host writes carry our data out: that is our tx.
                EventKind::HostWriteComplete => LinkEvent::TxDone(ev.meta),
                EventKind::HostReadComplete => LinkEvent::RxDone(ev.meta),
                EventKind::Error => LinkEvent::Fault(ev.meta),
            });
        }
        if self.overflow_fault {
            self.overflow_fault = false;
            return Some(LinkEvent::Fault(RawEnvelope::ZERO));
        }
        None
    }

    fn is_idle(&self) -> bool {
        self.mode == Mode::Idle
    }

    fn request_target(&self) -> u32 {
        HOST_TO_DSP_HEADER_BASE
    }
}
