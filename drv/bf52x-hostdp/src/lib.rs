// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DSP-side sequencer for the host-DMA port.
//!
//! The host-DP peripheral couples the DSP to the CPU's external-memory
//! controller. The CPU is the bus master: it streams descriptors and data
//! through two 16-bit ports, while on this side a DMA channel moves words
//! between the FIFO and DSP memory and raises interrupts per block. This
//! crate owns those interrupts and presents the block-level state machine:
//!
//! - a host write (CPU→DSP) arrives unannounced; the first DMA-done
//!   interrupt carries the header, each later one retires a payload block;
//! - a host read (DSP→CPU) starts here: [`HostdpSequencer::submit`] stages
//!   the header, raises the handshake line and then counts host-read-done
//!   interrupts as the CPU drains the FIFO;
//! - a DMA interrupt without `DMA_DONE` is a fault: the sequencer halts,
//!   masks its interrupts and raises the `BTE` back-channel bit so the CPU
//!   restarts it with a status interrupt.
//!
//! Interrupt handlers never run user code; they push `{kind, envelope}`
//! events into a lock-free ring that the owning driver drains from its
//! mainline tick.
//!
//! Register access goes through [`HostdpPort`] so the state machine can be
//! exercised off-target.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use drv_hostdp_link_api::{
    EventKind, Header, HostStatus, LinkEvent, Mode, RawEnvelope, SeqError, SeqEvent, Sequencer,
    DSP_TO_HOST_HEADER_BASE, EVENT_QUEUE_SLOTS,
};
use ringq::SpscRing;
use tracebuf::{trace_entry, tracebuf};

bitflags! {
    /// The host-DP control register (DSP-local).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct HostControl: u16 {
        const HOSTDP_EN  = 1 << 0;
        const INT_MODE   = 1 << 1;
        /// Enable host writes.
        const EHW        = 1 << 2;
        /// Enable host reads.
        const EHR        = 1 << 3;
        /// 16-bit data port width.
        const DATA_SIZE  = 1 << 4;
        /// Burst data requests (power-of-two FIFO bursts only).
        const BDR        = 1 << 5;
        /// Drives the `BTE` status bit seen by the host.
        const BT_EN      = 1 << 6;
        const HOSTDP_RST = 1 << 7;
    }
}

bitflags! {
    /// DMA channel interrupt status.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct DmaIrq: u16 {
        const DMA_DONE = 1 << 0;
        const DMA_ERR  = 1 << 1;
    }
}

/// Register-level operations of the host-DP peripheral. The real
/// implementation wraps the memory-mapped registers; tests substitute a
/// software model.
pub trait HostdpPort {
    fn status(&self) -> HostStatus;

    /// Raises `HSHK` to request the bus for a host read.
    fn raise_handshake(&mut self);
    fn clear_handshake(&mut self);

    /// Acknowledges the host's status interrupt (`HIRQ`).
    fn ack_host_irq(&mut self);

    /// Retires one host-write block: clears `DMA_DONE` and raises
    /// `DMA_CMPLT`, preserving a live `HSHK`.
    fn ack_write_block(&mut self);

    /// Retires one host-read block: clears `HOSTRD_DONE` and raises
    /// `DMA_CMPLT`, preserving a live `HSHK`.
    fn ack_read_block(&mut self);

    fn dma_irq(&self) -> DmaIrq;
    fn ack_dma_error(&mut self);

    fn write_control(&mut self, control: HostControl);

    fn enable_dma_irqs(&mut self);
    fn disable_dma_irqs(&mut self);

    /// Pulses `HOSTDP_RST`.
    fn reset_port(&mut self);

    /// Asks the peer to restart after it signalled an error over `BTE`.
    fn signal_peer_restart(&mut self);

    /// Reads the inbound header region.
    fn read_header(&self) -> Header;

    /// Publishes an outbound header (and the payload the DMA engine will
    /// serve from `header.local_addr`). Real hardware only needs the
    /// header written to the outbound region; the payload slice lets a
    /// software model serve the data.
    fn stage_outbound(&mut self, header: &Header, payload: Option<&'static [u32]>);
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    Submit { words: u16 },
    HeaderIn { words: u16 },
    BlockIn { remaining: u16 },
    BlockOut { remaining: u16 },
    WriteComplete,
    ReadComplete,
    DmaFault,
    ReadFault,
    PeerFault,
    Restart,
    EventOverflow,
}

tracebuf!(Trace, 32, Trace::None);

const BASE_CONTROL: HostControl = HostControl::HOSTDP_EN
    .union(HostControl::INT_MODE)
    .union(HostControl::EHW)
    .union(HostControl::EHR)
    .union(HostControl::DATA_SIZE);

/// The DSP-side sequencer. One instance exists per system, owned by the
/// IPC driver; the platform's interrupt vectors call the three `on_*_irq`
/// entry points.
pub struct HostdpSequencer<P: HostdpPort> {
    port: P,
    mode: Mode,
    /// Bursts the host still has to drain for the outbound transfer.
    tx_blocks_remaining: u16,
    tx_meta: RawEnvelope,
    /// Whether an inbound transfer is past its header. Tracked separately
    /// from `mode`: the host may start a write while our own transfer is
    /// staged behind the handshake line, and both must progress.
    rx_active: bool,
    /// Bursts still expected for the inbound transfer.
    rx_blocks_remaining: u16,
    rx_meta: RawEnvelope,
    events: SpscRing<SeqEvent, EVENT_QUEUE_SLOTS>,
    /// Set when the event ring overflowed; surfaces as a fault once the
    /// surviving events have drained.
    overflow_fault: bool,
}

impl<P: HostdpPort> HostdpSequencer<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            mode: Mode::Off,
            tx_blocks_remaining: 0,
            tx_meta: RawEnvelope::ZERO,
            rx_active: false,
            rx_blocks_remaining: 0,
            rx_meta: RawEnvelope::ZERO,
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

    /// Brings the port up: burst mode on, interrupts armed, `Off → Idle`.
    pub fn init(&mut self) {
        self.port.enable_dma_irqs();
        self.host_control(true, HostControl::empty());
        self.mode = Mode::Idle;
    }

    /// Attempts to start a transfer to the host. Stages the header, raises
    /// the handshake line and waits for the host to drain blocks; refuses
    /// if the port is halted, a transfer is active, or a previous
    /// handshake is still pending.
    pub fn submit(
        &mut self,
        remote_addr: u32,
        words: Option<&'static [u32]>,
        word_count16: u16,
        meta: RawEnvelope,
    ) -> Result<(), SeqError> {
        if self.mode == Mode::Off {
            return Err(SeqError::Uninitialised);
        }
        if self.mode != Mode::Idle || self.port.status().contains(HostStatus::HSHK) {
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
        self.port.stage_outbound(&header, words);
        self.tx_blocks_remaining = header.blocks();
        self.tx_meta = meta;
        self.port.raise_handshake();
        self.mode = Mode::HostReadApproved;
        trace_entry!(Trace::Submit {
            words: word_count16
        });
        Ok(())
    }

    /// Host-read-done interrupt: the host emptied the FIFO — first the
    /// header burst, then one per payload block. Firing without
    /// `HOSTRD_DONE` set signals a DMA fault instead.
    pub fn on_host_read_done_irq(&mut self) {
        if !self.port.status().contains(HostStatus::HOSTRD_DONE) {
            trace_entry!(Trace::ReadFault);
            let meta = self.tx_meta;
            self.fault(meta);
            return;
        }

        match self.tx_blocks_remaining {
            0 => {
                // Final burst drained.
                self.mode = Mode::Idle;
                self.host_control(true, HostControl::empty());
                self.port.clear_handshake();
                self.enqueue(EventKind::HostReadComplete, self.tx_meta);
                trace_entry!(Trace::ReadComplete);
            }
            1 => {
                // One burst left; it may be partial, so burst mode must be
                // off before the DMA engine loads it.
                self.host_control(false, HostControl::empty());
                self.tx_blocks_remaining = 0;
            }
            n => {
                self.tx_blocks_remaining = n - 1;
                trace_entry!(Trace::BlockOut { remaining: n - 1 });
            }
        }

        self.port.ack_read_block();
    }

    /// DMA-channel interrupt: a block finished moving between the FIFO and
    /// DSP memory. Carries host writes forward; firing without `DMA_DONE`
    /// is a fault.
    pub fn on_dma_irq(&mut self) {
        if !self.port.dma_irq().contains(DmaIrq::DMA_DONE) {
            trace_entry!(Trace::DmaFault);
            self.port.ack_dma_error();
            let meta = self.rx_meta;
            self.fault(meta);
            return;
        }

        if self.mode == Mode::Off {
            self.port.ack_write_block();
            return;
        }

        if !self.rx_active {
            // The header burst just landed. This can also happen while our
            // own transfer sits staged behind the handshake line; the
            // inbound side is tracked on its own so neither is lost.
            let header = self.port.read_header();
            self.rx_meta = header.meta;
            self.rx_blocks_remaining = header.blocks();
            trace_entry!(Trace::HeaderIn {
                words: header.word_count
            });

            if header.word_count == 0 {
                // Header-only transfer, nothing follows.
                self.host_control(true, HostControl::empty());
                self.enqueue(EventKind::HostWriteComplete, self.rx_meta);
                trace_entry!(Trace::WriteComplete);
            } else {
                self.rx_active = true;
                if self.mode == Mode::Idle {
                    self.mode = Mode::HostWrite;
                }
                self.host_control(self.rx_blocks_remaining > 1, HostControl::empty());
            }
        } else {
            self.rx_blocks_remaining -= 1;
            match self.rx_blocks_remaining {
                0 => {
                    self.rx_active = false;
                    if self.mode == Mode::HostWrite {
                        self.mode = Mode::Idle;
                    }
                    self.host_control(true, HostControl::empty());
                    self.enqueue(EventKind::HostWriteComplete, self.rx_meta);
                    trace_entry!(Trace::WriteComplete);
                }
                1 => {
                    // Next block is the last; it may be partial.
                    self.host_control(false, HostControl::empty());
                }
                n => {
                    trace_entry!(Trace::BlockIn { remaining: n });
                }
            }
        }

        self.port.ack_write_block();
    }

    /// Host status interrupt. Two meanings: if we are halted, the host is
    /// acknowledging our fault and we restart; otherwise the host is
    /// telling us *it* faulted (we saw its `BTE` as this interrupt), so we
    /// fail whatever was on the wire and send the restart ack back.
    pub fn on_status_irq(&mut self) {
        self.port.ack_host_irq();

        if self.mode == Mode::Off {
            self.mode = Mode::Idle;
            self.tx_blocks_remaining = 0;
            self.rx_active = false;
            self.rx_blocks_remaining = 0;
            self.port.enable_dma_irqs();
            self.port.reset_port();
            // Dropping BT_EN green-lights the host.
            self.host_control(true, HostControl::empty());
            trace_entry!(Trace::Restart);
            return;
        }

        if self.port.status().contains(HostStatus::BTE) {
            trace_entry!(Trace::PeerFault);
            if self.mode != Mode::Idle {
                let meta = match self.mode {
                    Mode::HostWrite => self.rx_meta,
                    Mode::HostReadApproved => self.tx_meta,
                    _ => RawEnvelope::ZERO,
                };
                self.enqueue(EventKind::Error, meta);
            }
            self.mode = Mode::Idle;
            self.tx_blocks_remaining = 0;
            self.rx_active = false;
            self.rx_blocks_remaining = 0;
            self.port.clear_handshake();
            self.host_control(true, HostControl::empty());
            self.port.signal_peer_restart();
        }
    }

    fn host_control(&mut self, burst: bool, extra: HostControl) {
        let mut control = BASE_CONTROL | extra;
        if burst {
            control |= HostControl::BDR;
        }
        self.port.write_control(control);
    }

    /// Local fault: halt, mask interrupts, raise the back channel, defer
    /// the error to the mainline.
    fn fault(&mut self, meta: RawEnvelope) {
        self.mode = Mode::Off;
        self.port.disable_dma_irqs();
        self.host_control(true, HostControl::BT_EN);
        self.enqueue(EventKind::Error, meta);
    }

    fn enqueue(&mut self, kind: EventKind, meta: RawEnvelope) {
        if self.events.push(SeqEvent { kind, meta }).is_err() {
            // The mainline stopped pumping long enough to overrun the
            // ring. Dropping a completion would strand a user callback,
            // so halt instead and surface the overflow as a fault once
            // the surviving events drain.
            trace_entry!(Trace::EventOverflow);
            self.overflow_fault = true;
            self.mode = Mode::Off;
            self.port.disable_dma_irqs();
            self.host_control(true, HostControl::BT_EN);
        }
    }
}

impl<P: HostdpPort> Sequencer for HostdpSequencer<P> {
    fn init(&mut self) {
        HostdpSequencer::init(self);
    }

    fn service(&mut self) {
        // Fully interrupt driven; nothing to poll.
    }

    fn submit(
        &mut self,
        remote_addr: u32,
        words: Option<&'static [u32]>,
        word_count16: u16,
        meta: RawEnvelope,
    ) -> Result<(), SeqError> {
        HostdpSequencer::submit(self, remote_addr, words, word_count16, meta)
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        if let Some(ev) = self.events.pop() {
            return Some(match ev.kind {
                // Host reads carry our data out: that is our tx.
                EventKind::HostReadComplete => LinkEvent::TxDone(ev.meta),
                EventKind::HostWriteComplete => LinkEvent::RxDone(ev.meta),
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
        DSP_TO_HOST_HEADER_BASE
    }
}
