//! Acknowledgment bookkeeping for received frame sets, and the ACK / NACK datagram codec.
//!
//! The tracker keeps two sets of coalesced sequence number ranges: what arrived (to be
//!  acked) and what was skipped over (to be nacked). A sequence number that arrives after
//!  having been reported missing moves from the nack side to the ack side, so the final
//!  state is independent of arrival order.

use bytes::{Buf, BufMut, BytesMut};

use crate::packets::PacketId;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::{u24_next, RaknetBufExt, RaknetBufMutExt};

use anyhow::bail;

/// An inclusive range of transport sequence numbers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AckRange {
    pub start: u32,
    pub end: u32,
}

impl AckRange {
    pub fn single(seq: u32) -> AckRange {
        AckRange { start: seq, end: seq }
    }
}

/// Insert a sequence number into a sorted, coalesced range list.
fn insert_into(ranges: &mut Vec<AckRange>, seq: u32) {
    for i in 0..ranges.len() {
        let range = ranges[i];
        if seq >= range.start && seq <= range.end {
            return;
        }
        if seq + 1 == range.start {
            ranges[i].start = seq;
            if i > 0 && ranges[i - 1].end + 1 == seq {
                ranges[i - 1].end = ranges[i].end;
                ranges.remove(i);
            }
            return;
        }
        if seq < range.start {
            ranges.insert(i, AckRange::single(seq));
            return;
        }
        if range.end + 1 == seq {
            ranges[i].end = seq;
            if i + 1 < ranges.len() && ranges[i + 1].start == seq + 1 {
                ranges[i].end = ranges[i + 1].end;
                ranges.remove(i + 1);
            }
            return;
        }
    }
    ranges.push(AckRange::single(seq));
}

/// Remove a sequence number from a sorted, coalesced range list, splitting a range if
///  the number falls in its interior.
fn remove_from(ranges: &mut Vec<AckRange>, seq: u32) {
    for i in 0..ranges.len() {
        let range = ranges[i];
        if seq < range.start || seq > range.end {
            continue;
        }
        if range.start == range.end {
            ranges.remove(i);
        }
        else if seq == range.start {
            ranges[i].start = seq + 1;
        }
        else if seq == range.end {
            ranges[i].end = seq - 1;
        }
        else {
            ranges[i].end = seq - 1;
            ranges.insert(i + 1, AckRange { start: seq + 1, end: range.end });
        }
        return;
    }
}

#[derive(Debug, Default)]
pub struct AckTracker {
    ack: Vec<AckRange>,
    nack: Vec<AckRange>,
    /// the lowest sequence number that has neither arrived nor been reported missing yet
    next_expected: u32,
}

impl AckTracker {
    pub fn new() -> AckTracker {
        AckTracker::default()
    }

    /// Register an arrived sequence number. Skipped-over numbers become nack candidates,
    ///  and a late arrival withdraws its earlier nack.
    pub fn register(&mut self, seq: u32) {
        if seq >= self.next_expected {
            let mut missing = self.next_expected;
            while missing < seq {
                insert_into(&mut self.nack, missing);
                missing = u24_next(missing);
            }
            self.next_expected = u24_next(seq);
        }
        else {
            remove_from(&mut self.nack, seq);
        }
        insert_into(&mut self.ack, seq);
    }

    /// The ranges to acknowledge, clearing them: each range is reported exactly once.
    pub fn drain_ack(&mut self) -> Vec<AckRange> {
        std::mem::take(&mut self.ack)
    }

    /// The ranges to report missing, clearing them: each gap is reported exactly once.
    pub fn drain_nack(&mut self) -> Vec<AckRange> {
        std::mem::take(&mut self.nack)
    }
}

/// Serialize ranges as an ACK or NACK datagram, depending on the id passed in.
pub fn ser_ack_datagram(id: PacketId, ranges: &[AckRange], buf: &mut BytesMut) {
    buf.put_u8(id as u8);
    buf.put_u16(ranges.len().prechecked_cast());
    for range in ranges {
        if range.start == range.end {
            buf.put_u8(0x01);
            buf.put_u24_le(range.start);
        }
        else {
            buf.put_u8(0x00);
            buf.put_u24_le(range.start);
            buf.put_u24_le(range.end);
        }
    }
}

/// Parse the ranges of an ACK or NACK datagram. The caller has dispatched on the id byte
///  already, but it is consumed (and sanity checked) here.
pub fn deser_ack_datagram(buf: &mut impl Buf) -> anyhow::Result<Vec<AckRange>> {
    let id = buf.try_get_u8()?;
    if id != PacketId::Ack as u8 && id != PacketId::Nack as u8 {
        bail!("not an ack / nack datagram: id {:#04x}", id);
    }

    let count: usize = buf.try_get_u16()?.safe_cast();
    let mut ranges = Vec::with_capacity(count);
    for _ in 0..count {
        let is_single = buf.try_get_u8()? == 0x01;
        let start = buf.try_get_u24_le()?;
        let end = if is_single { start } else { buf.try_get_u24_le()? };
        if end < start {
            bail!("ack range end {} precedes start {}", end, start);
        }
        ranges.push(AckRange { start, end });
    }
    Ok(ranges)
}
