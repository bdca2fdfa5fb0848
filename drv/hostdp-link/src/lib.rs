// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queued IPC driver for the CPU↔DSP host-DMA link.
//!
//! Both processors run the same driver over their side's sequencer; only
//! the sequencer differs. The driver owns a request queue, serializes
//! submissions onto the single-transfer sequencer, books read requests
//! while their responses are outstanding, and routes completions and
//! errors back to the submitters' hooks. All hook invocations happen in
//! [`LinkDriver::tick`], from the mainline.
//!
//! Three message kinds cross the wire, discriminated by the envelope:
//!
//! - `Transfer`: a payload write; the receiving driver hands the carried
//!   context to its receive handler.
//! - `Request`: header-only; the receiving driver answers it with a
//!   `Response` write built from its own memory, no user code involved.
//! - `Response`: a payload write echoing the request's envelope. The
//!   requester matches it to the oldest in-flight record — sound because
//!   both sides serve one transfer at a time, so requests are answered in
//!   order — and fires that record's hook.
//!
//! On a sequencer fault the driver locks, fails every queued, active and
//! in-flight submission exactly once, and stays locked until it sees the
//! sequencer idle again (the peer's restart acknowledgment brings it
//! back). While locked nothing is accepted, no event is dispatched and no
//! queued transfer advances.

#![cfg_attr(not(test), no_std)]

use drv_hostdp_link_api::{
    CompletionFn, Envelope, LinkEvent, LinkRam, Outcome, RawEnvelope, ReadReq, Sequencer,
    SubmitError, MAX_TRANSFER_WORDS, REQUEST_QUEUE_SLOTS,
};
use ringq::Ring;
use tracebuf::{trace_entry, tracebuf};

/// Handler for inbound `Transfer` messages: receives the token and
/// context words the sender put in the envelope. The payload itself has
/// already landed at the address the sender named.
pub type ReceiveFn = fn(token: u32, ctx: u32);

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    SubmitWrite { count: u16 },
    SubmitRead { count: u16 },
    Launched { count: u16 },
    TxDone,
    RxTransfer,
    RxResponse { token: u32 },
    RxRequest { count: u16 },
    CtxMismatch { got: u32, want: u32 },
    OrphanResponse,
    BadRequestAddr { addr: u32 },
    ResponseDropped,
    UnknownOp { op: u16 },
    Fault,
    Drained { failed: u16 },
    Unlocked,
}

tracebuf!(Trace, 64, Trace::None);

/// One queued submission. The same shape is stored in the request queue
/// and copied into the in-flight ring when a request launches.
#[derive(Copy, Clone)]
struct QueueEntry {
    remote_addr: u32,
    buffer: Option<&'static [u32]>,
    /// Payload length in 32-bit words.
    count: u16,
    hook: Option<CompletionFn>,
    ctx: u32,
    meta: RawEnvelope,
}

impl QueueEntry {
    fn is_request(&self) -> bool {
        matches!(Envelope::decode(self.meta), Ok(Envelope::Request(_)))
    }
}

/// The queued IPC driver for one side of the link.
pub struct LinkDriver<S: Sequencer, R: LinkRam> {
    seq: S,
    ram: R,
    queue: Ring<QueueEntry, REQUEST_QUEUE_SLOTS>,
    /// Launched read requests awaiting their responses, oldest first.
    /// Needed to deliver each hook exactly once, response or error.
    inflight: Ring<QueueEntry, REQUEST_QUEUE_SLOTS>,
    /// The transfer currently on the wire.
    active: Option<QueueEntry>,
    /// Set by the error drain; cleared when the sequencer is seen idle
    /// again after recovery.
    locked: bool,
    rx_handler: Option<ReceiveFn>,
    /// Rolling submission serial, echoed through envelopes as the token.
    serial: u32,
}

impl<S: Sequencer, R: LinkRam> LinkDriver<S, R> {
    pub fn new(seq: S, ram: R) -> Self {
        Self {
            seq,
            ram,
            queue: Ring::new(),
            inflight: Ring::new(),
            active: None,
            locked: false,
            rx_handler: None,
            serial: 0,
        }
    }

    /// Brings the sequencer up and registers the inbound-transfer handler.
    pub fn init(&mut self, rx_handler: Option<ReceiveFn>) {
        self.rx_handler = rx_handler;
        self.seq.init();
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// The owning context needs the sequencer to wire up interrupt
    /// delivery.
    pub fn sequencer_mut(&mut self) -> &mut S {
        &mut self.seq
    }

    pub fn sequencer(&self) -> &S {
        &self.seq
    }

    /// Mainline pump: recovers from a lock once the sequencer is idle
    /// again, drains deferred events into hook invocations, then launches
    /// the next queued transfer if the wire is free.
    pub fn tick(&mut self) {
        if self.locked {
            if !self.seq.is_idle() {
                return;
            }
            self.locked = false;
            trace_entry!(Trace::Unlocked);
        }

        self.seq.service();

        while let Some(event) = self.seq.poll_event() {
            match event {
                LinkEvent::TxDone(meta) => self.on_tx_done(meta),
                LinkEvent::RxDone(meta) => self.on_rx_done(meta),
                LinkEvent::Fault(meta) => self.on_fault(meta),
            }
            if self.locked {
                // The fault drain ran; hold everything else until
                // recovery.
                return;
            }
        }

        self.serve_queued();
    }

    /// Submits a payload write to `remote_addr` in the peer's memory. An
    /// empty `buffer` sends a header-only transfer. The buffer must stay
    /// valid until the hook fires.
    pub fn submit_write(
        &mut self,
        remote_addr: u32,
        buffer: &'static [u32],
        hook: Option<CompletionFn>,
        ctx: u32,
    ) -> Result<(), SubmitError> {
        if self.locked {
            return Err(SubmitError::DriverLocked);
        }
        if buffer.len() >= MAX_TRANSFER_WORDS {
            return Err(SubmitError::InvalidArgument);
        }
        let count = buffer.len() as u16;
        let token = self.next_token();
        let entry = QueueEntry {
            remote_addr,
            buffer: if buffer.is_empty() {
                None
            } else {
                Some(buffer)
            },
            count,
            hook,
            ctx,
            meta: Envelope::Transfer { token, ctx }.encode(),
        };
        trace_entry!(Trace::SubmitWrite { count });
        self.start_or_enqueue(entry)
    }

    /// Submits a read of `count` words from `remote_src` in the peer's
    /// memory into `local_dest` here. Goes out as a header-only request;
    /// the hook fires when the peer's response lands (or the error drain
    /// runs).
    pub fn submit_read(
        &mut self,
        remote_src: u32,
        local_dest: u32,
        count: u16,
        hook: Option<CompletionFn>,
        ctx: u32,
    ) -> Result<(), SubmitError> {
        if self.locked {
            return Err(SubmitError::DriverLocked);
        }
        if count as usize >= MAX_TRANSFER_WORDS {
            return Err(SubmitError::InvalidArgument);
        }
        let token = self.next_token();
        let entry = QueueEntry {
            remote_addr: self.seq.request_target(),
            buffer: None,
            count: 0,
            hook,
            ctx,
            meta: Envelope::Request(ReadReq {
                count,
                remote_src,
                local_dest,
                token,
                ctx,
            })
            .encode(),
        };
        trace_entry!(Trace::SubmitRead { count });
        self.start_or_enqueue(entry)
    }

    fn next_token(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        self.serial
    }

    fn start_or_enqueue(&mut self, entry: QueueEntry) -> Result<(), SubmitError> {
        if self.try_launch(entry) {
            return Ok(());
        }
        self.queue
            .push(entry)
            .map_err(|_| SubmitError::QueueFull)
    }

    /// Attempts to put `entry` on the wire right now. Refusal is not an
    /// error: the entry just waits in the queue.
    fn try_launch(&mut self, entry: QueueEntry) -> bool {
        if self.active.is_some() {
            return false;
        }
        let is_request = entry.is_request();
        if is_request && self.inflight.is_full() {
            // No room to book the request; launching anyway could strand
            // its hook on an error.
            return false;
        }

        let words16 = 2 * entry.count;
        if self
            .seq
            .submit(entry.remote_addr, entry.buffer, words16, entry.meta)
            .is_err()
        {
            return false;
        }

        self.active = Some(entry);
        if is_request {
            // Checked for room above.
            let _ = self.inflight.push(entry);
        }
        trace_entry!(Trace::Launched { count: entry.count });
        true
    }

    fn serve_queued(&mut self) {
        if self.active.is_some() {
            return;
        }
        if let Some(entry) = self.queue.peek() {
            if self.try_launch(entry) {
                self.queue.pop();
            }
        }
    }

    /// Our transfer left the wire. Requests complete later, on their
    /// response; everything else completes here.
    fn on_tx_done(&mut self, _meta: RawEnvelope) {
        trace_entry!(Trace::TxDone);
        let Some(done) = self.active.take() else {
            return;
        };
        if done.is_request() {
            return;
        }
        if let Some(hook) = done.hook {
            hook(done.ctx, Outcome::Complete);
        }
    }

    /// An inbound transfer landed; the envelope says what it was.
    fn on_rx_done(&mut self, meta: RawEnvelope) {
        match Envelope::decode(meta) {
            Ok(Envelope::Transfer { token, ctx }) => {
                trace_entry!(Trace::RxTransfer);
                if let Some(handler) = self.rx_handler {
                    handler(token, ctx);
                }
            }
            Ok(Envelope::Response(r)) => self.on_response(r),
            Ok(Envelope::Request(r)) => self.on_request(r),
            Err(e) => {
                trace_entry!(Trace::UnknownOp { op: e.0 });
            }
        }
    }

    /// The reply to our oldest outstanding read request.
    fn on_response(&mut self, r: ReadReq) {
        trace_entry!(Trace::RxResponse { token: r.token });
        let Some(record) = self.inflight.pop() else {
            trace_entry!(Trace::OrphanResponse);
            return;
        };
        if record.ctx != r.ctx {
            // FIFO matching should make this impossible; note it for the
            // debugger rather than guessing which record was right.
            trace_entry!(Trace::CtxMismatch {
                got: r.ctx,
                want: record.ctx
            });
        }
        if let Some(hook) = record.hook {
            hook(record.ctx, Outcome::Complete);
        }
    }

    /// The peer asked for data: turn the request around into a response
    /// write from our memory. No user code is involved; the requester's
    /// side books the completion.
    fn on_request(&mut self, r: ReadReq) {
        trace_entry!(Trace::RxRequest { count: r.count });
        let buffer = if r.count == 0 {
            None
        } else {
            match self.ram.source(r.remote_src, r.count as usize) {
                Some(buf) => Some(buf),
                None => {
                    // The peer named memory we cannot serve. There is no
                    // error kind on the wire; its request will surface as
                    // Failed whenever the link next drains.
                    trace_entry!(Trace::BadRequestAddr { addr: r.remote_src });
                    return;
                }
            }
        };
        let entry = QueueEntry {
            remote_addr: r.local_dest,
            buffer,
            count: r.count,
            hook: None,
            ctx: 0,
            meta: Envelope::Response(r).encode(),
        };
        if self.start_or_enqueue(entry).is_err() {
            trace_entry!(Trace::ResponseDropped);
        }
    }

    /// The sequencer halted. Fail everything that still owes a hook,
    /// exactly once each, and lock until recovery. Queued entries first,
    /// then the active transfer, then in-flight reads — an active request
    /// is skipped in favor of its in-flight record.
    fn on_fault(&mut self, _meta: RawEnvelope) {
        trace_entry!(Trace::Fault);
        self.locked = true;

        let mut failed: u16 = 0;
        while let Some(entry) = self.queue.pop() {
            if let Some(hook) = entry.hook {
                hook(entry.ctx, Outcome::Failed);
            }
            failed += 1;
        }

        if let Some(active) = self.active.take() {
            if !active.is_request() {
                if let Some(hook) = active.hook {
                    hook(active.ctx, Outcome::Failed);
                }
                failed += 1;
            }
        }

        while let Some(record) = self.inflight.pop() {
            if let Some(hook) = record.hook {
                hook(record.ctx, Outcome::Failed);
            }
            failed += 1;
        }

        trace_entry!(Trace::Drained { failed });
    }
}
