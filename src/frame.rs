//! The frame codec: a *frame* is one reliability-tagged unit of application data, a
//!  *frame set* is one datagram carrying a shared transport sequence number and one or
//!  more frames packed back to back.

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;

use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::{RaknetBufExt, RaknetBufMutExt};

/// Fixed worst-case byte budget for everything in a datagram that is not frame payload
///  (datagram header, frame header with all optional fields, fragment header). The
///  per-frame payload limit is `mtu` minus this.
pub const FRAME_OVERHEAD_BUDGET: usize = 60;

/// The id byte of a frame-set datagram has the high bit set; the remaining low bits are
///  flags, so any id in `0x80..=0x8d` is a frame set.
pub const FRAME_SET_ID_RANGE: std::ops::RangeInclusive<u8> = 0x80..=0x8d;

const ID_NEEDS_ACK: u8 = 0x04;
const ID_CONTINUOUS_SEND: u8 = 0x08;

const FLAG_FRAGMENT: u8 = 0x10;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum Reliability {
    Unreliable = 0x00,
    UnreliableSequenced = 0x01,
    Reliable = 0x02,
    ReliableOrdered = 0x03,
    ReliableSequenced = 0x04,
}

impl Reliability {
    /// Reliable modes carry a reliable index and are retransmitted until acknowledged.
    pub fn is_reliable(&self) -> bool {
        matches!(self, Reliability::Reliable | Reliability::ReliableOrdered | Reliability::ReliableSequenced)
    }

    /// Sequenced modes carry a sequenced index ("latest wins, drop stale").
    pub fn is_sequenced(&self) -> bool {
        matches!(self, Reliability::UnreliableSequenced | Reliability::ReliableSequenced)
    }

    /// Ordered modes carry an ordered index and an order channel on the wire.
    pub fn is_ordered(&self) -> bool {
        matches!(self, Reliability::UnreliableSequenced | Reliability::ReliableOrdered | Reliability::ReliableSequenced)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FragmentHeader {
    /// total number of fragments in the compound this frame belongs to
    pub compound_size: u32,
    pub compound_id: u16,
    pub fragment_index: u32,
}

/// One reliability-tagged unit of data. Which of the index fields are actually present
///  on the wire is derived from the reliability mode (and the fragment bit) - absent
///  fields are omitted from the serialized form entirely, and their in-memory value is
///  meaningless for modes that do not use them.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    /// per-datagram 24-bit counter, used purely for acknowledgment - shared by all
    ///  frames of a frame set, and re-assigned when a reliable frame is retransmitted
    pub sequence_number: u32,
    pub reliability: Reliability,
    pub reliable_index: u32,
    pub sequenced_index: u32,
    pub ordered_index: u32,
    pub order_channel: u8,
    pub fragment: Option<FragmentHeader>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(reliability: Reliability, payload: Bytes) -> Frame {
        Frame {
            sequence_number: 0,
            reliability,
            reliable_index: 0,
            sequenced_index: 0,
            ordered_index: 0,
            order_channel: 0,
            fragment: None,
            payload,
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = (self.reliability as u8) << 5;
        if self.fragment.is_some() {
            flags |= FLAG_FRAGMENT;
        }
        flags
    }

    fn ser_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.flags());
        // the length field is in *bits*
        buf.put_u16((self.payload.len() * 8).prechecked_cast());

        if self.reliability.is_reliable() {
            buf.put_u24_le(self.reliable_index);
        }
        if self.reliability.is_sequenced() {
            buf.put_u24_le(self.sequenced_index);
        }
        if self.reliability.is_ordered() {
            buf.put_u24_le(self.ordered_index);
            buf.put_u8(self.order_channel);
        }
        if let Some(fragment) = &self.fragment {
            buf.put_u32(fragment.compound_size);
            buf.put_u16(fragment.compound_id);
            buf.put_u32(fragment.fragment_index);
        }
        buf.put_slice(&self.payload);
    }

    fn deser_body(sequence_number: u32, buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let flags = buf.try_get_u8()?;
        let reliability = match Reliability::try_from(flags >> 5) {
            Ok(reliability) => reliability,
            Err(_) => bail!("invalid reliability mode {} in frame flags", flags >> 5),
        };
        let payload_len: usize = buf.try_get_u16()?.safe_cast();
        let payload_len = payload_len.div_ceil(8);

        let mut frame = Frame::new(reliability, Bytes::new());
        frame.sequence_number = sequence_number;

        if reliability.is_reliable() {
            frame.reliable_index = buf.try_get_u24_le()?;
        }
        if reliability.is_sequenced() {
            frame.sequenced_index = buf.try_get_u24_le()?;
        }
        if reliability.is_ordered() {
            frame.ordered_index = buf.try_get_u24_le()?;
            frame.order_channel = buf.try_get_u8()?;
        }
        if flags & FLAG_FRAGMENT != 0 {
            frame.fragment = Some(FragmentHeader {
                compound_size: buf.try_get_u32()?,
                compound_id: buf.try_get_u16()?,
                fragment_index: buf.try_get_u32()?,
            });
        }

        if buf.remaining() < payload_len {
            bail!("frame payload truncated: {} bytes declared, {} available", payload_len, buf.remaining());
        }
        frame.payload = buf.copy_to_bytes(payload_len);

        Ok(frame)
    }
}

/// One datagram's worth of frames behind a shared id byte and transport sequence number.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FrameSet {
    pub sequence_number: u32,
    pub frames: Vec<Frame>,
}

impl FrameSet {
    /// A frame set carrying a single frame, sequenced by that frame's own number - the
    ///  shape in which the send queue emits datagrams.
    pub fn single(frame: Frame) -> FrameSet {
        FrameSet {
            sequence_number: frame.sequence_number,
            frames: vec![frame],
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let mut id = 0x80 | ID_NEEDS_ACK;
        if self.frames.iter().any(|f| f.fragment.map(|fr| fr.fragment_index != 0).unwrap_or(false)) {
            id |= ID_CONTINUOUS_SEND;
        }

        buf.put_u8(id);
        buf.put_u24_le(self.sequence_number);
        for frame in &self.frames {
            frame.ser_body(buf);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameSet> {
        let id = buf.try_get_u8()?;
        if !FRAME_SET_ID_RANGE.contains(&id) {
            bail!("not a frame set datagram: id {:#04x}", id);
        }
        let sequence_number = buf.try_get_u24_le()?;

        let mut frames = Vec::new();
        while buf.has_remaining() {
            frames.push(Frame::deser_body(sequence_number, buf)?);
        }
        if frames.is_empty() {
            bail!("frame set datagram without frames");
        }

        Ok(FrameSet { sequence_number, frames })
    }
}
