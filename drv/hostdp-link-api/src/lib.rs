// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared types for the CPU↔DSP host-DMA link.
//!
//! The two processors of the device are joined by a 16-bit parallel port:
//! the CPU's asynchronous external-memory controller is wired to the DSP's
//! host-DMA engine. This crate defines everything both ends must agree on —
//! the wire header, the metadata envelope carried in it, the shared status
//! bits, and the seam between the queued IPC driver (`drv-hostdp-link`) and
//! the two hardware sequencers (`drv-am18x-emifa`, `drv-bf52x-hostdp`).

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use num_derive::FromPrimitive;
use static_assertions::{const_assert, const_assert_eq};

mod wire;

pub use wire::{
    blocks_for, Envelope, Header, OpKind, RawEnvelope, ReadReq, ReadView,
    TransferView, UnknownOpKind, ENVELOPE_WORDS, HEADER_WIRE_WORDS,
};

/// FIFO depth of the host data port, in 16-bit words. Payloads move in
/// bursts of this size; the last burst of a transfer may be shorter and is
/// sent with burst mode disabled.
pub const FIFO_WORDS16: usize = 16;

/// Header regions in DSP address space. The CPU writes inbound headers to
/// the first; the DSP stages outbound headers in the second for the CPU to
/// drain.
pub const HOST_TO_DSP_HEADER_BASE: u32 = 0x0000_0000;
pub const DSP_TO_HOST_HEADER_BASE: u32 = 0x0000_0020;

/// Exclusive upper bound on the 32-bit word count of one submission. The
/// wire carries a 16-bit count of 16-bit words, so 32768 doubled would not
/// fit.
pub const MAX_TRANSFER_WORDS: usize = 32768;

/// Slot counts for the driver's request and in-flight rings and the
/// sequencers' deferred-event rings. Rings store one entry fewer than their
/// slot count. The event ring must absorb every event a full request queue
/// can generate in a burst.
pub const REQUEST_QUEUE_SLOTS: usize = 32;
pub const EVENT_QUEUE_SLOTS: usize = 64;
const_assert!(EVENT_QUEUE_SLOTS - 1 >= 2 * (REQUEST_QUEUE_SLOTS - 1));

bitflags! {
    /// The host-port status register, visible from both sides of the link.
    ///
    /// The CPU reads it through the config port; the DSP reads and writes
    /// it directly. `HSHK` is raised by the DSP to request the bus and
    /// cleared by hardware when the CPU drains the last header word. `BTE`
    /// is the back-channel: a side that has taken a DMA fault asserts it to
    /// ask the peer for a restart.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct HostStatus: u16 {
        const DMA_RDY     = 1 << 0;
        const FIFO_FULL   = 1 << 1;
        const FIFO_EMPTY  = 1 << 2;
        const DMA_CMPLT   = 1 << 3;
        const HSHK        = 1 << 4;
        const HOSTDP_TOUT = 1 << 5;
        const HIRQ        = 1 << 6;
        const ALLOW_CNFG  = 1 << 7;
        const DMA_DIR     = 1 << 8;
        const HOSTRD_DONE = 1 << 9;
        const BTE         = 1 << 10;
    }
}

/// Verdict delivered to a submission's completion hook. Every accepted
/// submission gets exactly one of these; a submission that was rejected
/// gets none.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    Complete,
    Failed,
}

/// Completion hook: a plain function pointer plus an opaque context word
/// the driver hands back untouched.
pub type CompletionFn = fn(ctx: u32, outcome: Outcome);

/// Rejections at the driver layer. A submission that returns one of these
/// had no effect.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum SubmitError {
    /// Word count out of range.
    InvalidArgument = 1,
    /// Request queue (or in-flight ring, for reads) has no room.
    QueueFull = 2,
    /// Driver is locked after an error and has not recovered yet.
    DriverLocked = 3,
}

/// Rejections at the sequencer layer. The driver treats both as "queue it
/// and retry later"; they are not user-visible.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeqError {
    /// Link not brought up (or halted after an error).
    Uninitialised,
    /// A transfer is active, or the peer holds (or is asking for) the bus.
    BusOccupied,
}

/// Sequencer operating mode. `Off` is the post-error halt; the only way
/// out is the peer's status IRQ.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    Off,
    Idle,
    /// A host-write (CPU→DSP payload) is progressing block by block.
    HostWrite,
    /// A host-read (DSP→CPU payload) was granted and is draining.
    HostReadApproved,
}

/// Event kinds a sequencer defers from interrupt context to its mainline
/// pump. Named in bus terms; each side maps them onto [`LinkEvent`]
/// according to its role.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventKind {
    HostReadComplete,
    HostWriteComplete,
    Error,
}

/// One deferred event: the kind plus the envelope of the transfer it
/// belongs to.
#[derive(Copy, Clone, Debug)]
pub struct SeqEvent {
    pub kind: EventKind,
    pub meta: RawEnvelope,
}

/// Role-neutral event stream a sequencer presents to the driver.
#[derive(Copy, Clone, Debug)]
pub enum LinkEvent {
    /// Our outbound transfer left the wire.
    TxDone(RawEnvelope),
    /// An inbound transfer landed in local memory.
    RxDone(RawEnvelope),
    /// The sequencer halted; the envelope is the active transfer's, or
    /// zeroed if none was on the wire.
    Fault(RawEnvelope),
}

/// The seam between the queued IPC driver and a hardware sequencer.
///
/// One transfer is on the wire at a time per side; `submit` claims the bus
/// non-blockingly or refuses. Events are pulled, never pushed: the driver
/// calls `poll_event` from its mainline tick, so no user code ever runs in
/// interrupt context.
pub trait Sequencer {
    /// Programs the peripheral and arms the interrupt sources. Mode goes
    /// `Off → Idle`.
    fn init(&mut self);

    /// Side-specific mainline work (e.g. watching the handshake line).
    /// Called from the driver's tick; must not block.
    fn service(&mut self);

    /// Attempts to launch one transfer: a wire header carrying `meta`,
    /// followed by `word_count16` 16-bit words from `words`. `words` is
    /// `None` for a header-only transfer.
    fn submit(
        &mut self,
        remote_addr: u32,
        words: Option<&'static [u32]>,
        word_count16: u16,
        meta: RawEnvelope,
    ) -> Result<(), SeqError>;

    /// Pulls the next deferred event, if any.
    fn poll_event(&mut self) -> Option<LinkEvent>;

    /// True when no transfer is active and the sequencer can accept work.
    fn is_idle(&self) -> bool;

    /// Wire target address for header-only transfers (the peer-facing
    /// header region of this side).
    fn request_target(&self) -> u32;
}

/// Local memory as reachable through the link.
///
/// Peers name payload locations by 32-bit addresses. Implementations map
/// those addresses onto real memory: firmware uses the actual memory map,
/// tests use leaked regions. `source` hands out `'static` slices because
/// the borrow must outlive a queued transfer; implementations must only
/// serve addresses whose backing storage actually lives forever.
pub trait LinkRam {
    /// Borrows `count` 32-bit words starting at byte address `addr`, for
    /// outbound payloads. `None` if the range is not link-visible.
    fn source(&self, addr: u32, count: usize) -> Option<&'static [u32]>;

    /// Deposits one 32-bit word at byte address `addr` (inbound landing).
    fn deposit(&mut self, addr: u32, word: u32);
}

// Wire views must exactly tile the envelope, and the op-kind prefix must
// alias across them.
const_assert_eq!(
    core::mem::size_of::<TransferView>(),
    core::mem::size_of::<RawEnvelope>()
);
const_assert_eq!(
    core::mem::size_of::<ReadView>(),
    core::mem::size_of::<RawEnvelope>()
);
const_assert_eq!(core::mem::offset_of!(TransferView, op_kind), 0);
const_assert_eq!(core::mem::offset_of!(ReadView, op_kind), 0);
const_assert_eq!(core::mem::size_of::<Header>(), 2 * HEADER_WIRE_WORDS);

/// Headers occupy exactly one FIFO burst.
const_assert_eq!(HEADER_WIRE_WORDS, FIFO_WORDS16);
