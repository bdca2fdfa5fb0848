// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-wire formats: the transfer header and the metadata envelope.
//!
//! Every transfer begins with a 32-byte header — one full FIFO burst —
//! carrying the payload length, the target address, the source address (for
//! host reads), and a five-word metadata envelope. The envelope is opaque
//! to the sequencers; the driver overlays typed views on it, discriminated
//! by a 16-bit operation kind that sits at offset 0 in every view.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size of the metadata envelope, in 32-bit words.
pub const ENVELOPE_WORDS: usize = 5;

/// Size of the header on the wire, in 16-bit words.
pub const HEADER_WIRE_WORDS: usize = 16;

/// Operation kind, the low 16 bits of envelope word 0.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u16)]
pub enum OpKind {
    /// Fire-and-forget payload write.
    Transfer = 0,
    /// Header-only message asking the peer to send data back.
    Request = 1,
    /// The payload write answering a `Request`.
    Response = 2,
}

/// The envelope as carried on the wire: five opaque 32-bit words.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct RawEnvelope(pub [u32; ENVELOPE_WORDS]);

impl RawEnvelope {
    pub const ZERO: Self = Self([0; ENVELOPE_WORDS]);
}

/// Envelope view for standalone transfers. Only the op kind and the two
/// opaque trailing words are meaningful; the middle is padding kept so the
/// trailing words line up with [`ReadView`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TransferView {
    pub op_kind: u16,
    pub _rsvd0: u16,
    pub _rsvd1: u32,
    pub _rsvd2: u32,
    pub token: u32,
    pub ctx: u32,
}

/// Envelope view for read requests and their responses. Addresses are in
/// the *requester's* terms: `remote_src` names peer memory to read,
/// `local_dest` names requester memory the response must land in. The peer
/// echoes the whole view back, with the op kind flipped to `Response`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ReadView {
    pub op_kind: u16,
    pub count: u16,
    pub remote_src: u32,
    pub local_dest: u32,
    pub token: u32,
    pub ctx: u32,
}

/// Decoded read-request parameters.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReadReq {
    /// Payload length in 32-bit words.
    pub count: u16,
    pub remote_src: u32,
    pub local_dest: u32,
    pub token: u32,
    pub ctx: u32,
}

/// An envelope the driver could not type.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UnknownOpKind(pub u16);

/// Typed form of the envelope.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Envelope {
    Transfer { token: u32, ctx: u32 },
    Request(ReadReq),
    Response(ReadReq),
}

impl Envelope {
    pub fn op_kind(&self) -> OpKind {
        match self {
            Envelope::Transfer { .. } => OpKind::Transfer,
            Envelope::Request(_) => OpKind::Request,
            Envelope::Response(_) => OpKind::Response,
        }
    }

    pub fn encode(&self) -> RawEnvelope {
        match *self {
            Envelope::Transfer { token, ctx } => {
                let view = TransferView {
                    op_kind: OpKind::Transfer as u16,
                    _rsvd0: 0,
                    _rsvd1: 0,
                    _rsvd2: 0,
                    token,
                    ctx,
                };
                zerocopy::transmute!(view)
            }
            Envelope::Request(r) => encode_read(OpKind::Request, r),
            Envelope::Response(r) => encode_read(OpKind::Response, r),
        }
    }

    pub fn decode(raw: RawEnvelope) -> Result<Self, UnknownOpKind> {
        // Both views share the op-kind prefix, so the read view is enough
        // to discriminate.
        let view: ReadView = zerocopy::transmute!(raw);
        let read = ReadReq {
            count: view.count,
            remote_src: view.remote_src,
            local_dest: view.local_dest,
            token: view.token,
            ctx: view.ctx,
        };
        match OpKind::from_u16(view.op_kind) {
            Some(OpKind::Transfer) => Ok(Envelope::Transfer {
                token: view.token,
                ctx: view.ctx,
            }),
            Some(OpKind::Request) => Ok(Envelope::Request(read)),
            Some(OpKind::Response) => Ok(Envelope::Response(read)),
            None => Err(UnknownOpKind(view.op_kind)),
        }
    }
}

fn encode_read(kind: OpKind, r: ReadReq) -> RawEnvelope {
    let view = ReadView {
        op_kind: kind as u16,
        count: r.count,
        remote_src: r.remote_src,
        local_dest: r.local_dest,
        token: r.token,
        ctx: r.ctx,
    };
    zerocopy::transmute!(view)
}

/// The transfer header. Exactly one FIFO burst on the wire.
///
/// `local_addr` is the sender's payload source; the receiving hardware
/// ignores it for host writes but the host-DMA engine reads from it during
/// host reads. `word_count` counts 16-bit words and is zero for
/// header-only transfers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Header {
    pub word_count: u16,
    pub _rsvd: u16,
    pub remote_addr: u32,
    pub local_addr: u32,
    pub meta: RawEnvelope,
}

impl Header {
    /// Number of FIFO bursts the payload needs.
    pub fn blocks(&self) -> u16 {
        blocks_for(self.word_count)
    }

    /// Serializes to the 16-bit word stream the data port carries. Both
    /// ends of the link are little-endian, so reinterpreting the struct
    /// yields the low-half-first order the bus defines.
    pub fn to_wire(self) -> [u16; HEADER_WIRE_WORDS] {
        zerocopy::transmute!(self)
    }

    pub fn from_wire(words: [u16; HEADER_WIRE_WORDS]) -> Self {
        zerocopy::transmute!(words)
    }
}

/// Bursts needed for `word_count16` 16-bit words: `ceil(count / 16)`.
pub fn blocks_for(word_count16: u16) -> u16 {
    ((word_count16 as u32 + 15) / 16) as u16
}
