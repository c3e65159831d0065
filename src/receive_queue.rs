//! The inbound half of a connection: deduplication, fragment reassembly, per-mode
//!  admission and the reordering buffers, plus the ack bookkeeping for everything that
//!  arrived.
//!
//! Frames go in as they arrive on the socket; `flush()` returns the frames that are due
//!  for delivery to the application, in delivery order.

use std::collections::BTreeMap;

use bit_set::BitSet;
use tracing::debug;

use crate::ack::{AckRange, AckTracker};
use crate::fragment::ReassemblyQueue;
use crate::frame::Frame;
use crate::safe_converter::SafeCast;
use crate::wire::u24_next;

#[derive(Debug, Default)]
pub struct ReceiveQueue {
    ack_tracker: AckTracker,
    /// reliable indices seen so far, for duplicate suppression of retransmissions
    seen_reliable: BitSet,
    reassembly: ReassemblyQueue,
    /// frames admitted for delivery, keyed by transport sequence number
    staged: BTreeMap<u32, Vec<Frame>>,
    /// ordered frames waiting for their predecessors, keyed by ordered index
    ordered_pending: BTreeMap<u32, Frame>,
    next_sequenced_index: u32,
    next_ordered_index: u32,
}

impl ReceiveQueue {
    pub fn new() -> ReceiveQueue {
        ReceiveQueue::default()
    }

    /// Register an arrived frame. Acknowledgment is recorded for every arrival, including
    ///  duplicates and frames that the admission rules then drop - the peer must learn
    ///  that the datagram made it regardless.
    pub fn insert(&mut self, frame: Frame) {
        self.ack_tracker.register(frame.sequence_number);

        if frame.reliability.is_reliable() {
            if self.seen_reliable.contains(frame.reliable_index.safe_cast()) {
                debug!("dropping duplicate of reliable frame {}", frame.reliable_index);
                return;
            }
            self.seen_reliable.insert(frame.reliable_index.safe_cast());
        }

        let frame = if frame.fragment.is_some() {
            match self.reassembly.insert(frame) {
                Some(merged) => merged,
                None => return,
            }
        }
        else {
            frame
        };

        if frame.reliability.is_sequenced() {
            if frame.sequenced_index < self.next_sequenced_index {
                debug!("dropping stale sequenced frame {}", frame.sequenced_index);
                return;
            }
            self.next_sequenced_index = u24_next(frame.sequenced_index);
            self.stage(frame);
        }
        else if frame.reliability.is_ordered() {
            if frame.ordered_index < self.next_ordered_index {
                debug!("dropping already delivered ordered frame {}", frame.ordered_index);
                return;
            }
            self.ordered_pending.insert(frame.ordered_index, frame);
        }
        else {
            self.stage(frame);
        }
    }

    fn stage(&mut self, frame: Frame) {
        self.staged.entry(frame.sequence_number).or_default().push(frame);
    }

    /// All frames that are due for delivery: the contiguous run of ordered frames, then
    ///  everything else in transport sequence order.
    pub fn flush(&mut self) -> Vec<Frame> {
        let mut result = Vec::new();

        while let Some(frame) = self.ordered_pending.remove(&self.next_ordered_index) {
            self.next_ordered_index = u24_next(frame.ordered_index);
            result.push(frame);
        }

        for (_, frames) in std::mem::take(&mut self.staged) {
            result.extend(frames);
        }

        result
    }

    pub fn drain_ack(&mut self) -> Vec<AckRange> {
        self.ack_tracker.drain_ack()
    }

    pub fn drain_nack(&mut self) -> Vec<AckRange> {
        self.ack_tracker.drain_nack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FragmentHeader, Reliability};
    use bytes::Bytes;

    fn frame(reliability: Reliability, sequence_number: u32, payload: &'static [u8]) -> Frame {
        let mut frame = Frame::new(reliability, Bytes::from_static(payload));
        frame.sequence_number = sequence_number;
        frame
    }

    fn payloads(frames: &[Frame]) -> Vec<&[u8]> {
        frames.iter().map(|f| f.payload.as_ref()).collect()
    }

    #[test]
    fn test_unreliable_delivered_in_sequence_order() {
        let mut queue = ReceiveQueue::new();
        queue.insert(frame(Reliability::Unreliable, 2, b"c"));
        queue.insert(frame(Reliability::Unreliable, 0, b"a"));
        queue.insert(frame(Reliability::Unreliable, 1, b"b"));

        let flushed = queue.flush();
        assert_eq!(payloads(&flushed), vec![b"a", b"b", b"c"]);
        assert!(queue.flush().is_empty());
    }

    #[test]
    fn test_reliable_duplicate_dropped_but_acked() {
        let mut queue = ReceiveQueue::new();

        let mut original = frame(Reliability::Reliable, 0, b"x");
        original.reliable_index = 17;
        let mut retransmitted = original.clone();
        retransmitted.sequence_number = 1;

        queue.insert(original);
        queue.insert(retransmitted);

        assert_eq!(queue.flush().len(), 1);
        // both datagrams carried the frame, both are acknowledged
        assert_eq!(queue.drain_ack(), vec![AckRange { start: 0, end: 1 }]);
    }

    #[test]
    fn test_sequenced_drops_stale() {
        let mut queue = ReceiveQueue::new();
        for (seq, sequenced_index, payload) in [(0, 0, b"a"), (1, 2, b"c"), (2, 1, b"b")] {
            let mut f = frame(Reliability::UnreliableSequenced, seq, payload);
            f.sequenced_index = sequenced_index;
            queue.insert(f);
        }

        // the frame with sequenced index 1 arrived after index 2 and is stale
        assert_eq!(payloads(&queue.flush()), vec![b"a", b"c"]);
    }

    #[test]
    fn test_ordered_holds_back_until_contiguous() {
        let mut queue = ReceiveQueue::new();

        let mut second = frame(Reliability::ReliableOrdered, 0, b"b");
        second.reliable_index = 1;
        second.ordered_index = 1;
        queue.insert(second);
        assert!(queue.flush().is_empty());

        let mut first = frame(Reliability::ReliableOrdered, 1, b"a");
        first.reliable_index = 0;
        first.ordered_index = 0;
        queue.insert(first);
        assert_eq!(payloads(&queue.flush()), vec![b"a", b"b"]);
    }

    #[test]
    fn test_ordered_frame_below_delivery_point_is_dropped() {
        let mut queue = ReceiveQueue::new();

        let mut first = frame(Reliability::ReliableOrdered, 0, b"a");
        first.reliable_index = 0;
        first.ordered_index = 0;
        queue.insert(first);
        assert_eq!(queue.flush().len(), 1);

        // same ordered slot again, e.g. from a spurious retransmission
        let mut stale = frame(Reliability::ReliableOrdered, 1, b"a");
        stale.reliable_index = 1;
        stale.ordered_index = 0;
        queue.insert(stale);
        assert!(queue.flush().is_empty());
    }

    #[test]
    fn test_fragments_reassemble_then_follow_ordering() {
        let mut queue = ReceiveQueue::new();

        for (seq, index, payload) in [(0u32, 0u32, b"aa"), (1, 1, b"bb")] {
            let mut f = frame(Reliability::ReliableOrdered, seq, payload);
            f.reliable_index = index;
            f.ordered_index = 0;
            f.fragment = Some(FragmentHeader {
                compound_size: 2,
                compound_id: 9,
                fragment_index: index,
            });
            queue.insert(f);
        }

        let flushed = queue.flush();
        assert_eq!(payloads(&flushed), vec![b"aabb"]);
        assert_eq!(flushed[0].fragment, None);
    }

    #[test]
    fn test_gap_shows_up_as_nack() {
        let mut queue = ReceiveQueue::new();
        queue.insert(frame(Reliability::Unreliable, 0, b"a"));
        queue.insert(frame(Reliability::Unreliable, 2, b"c"));

        assert_eq!(queue.drain_ack(), vec![
            AckRange { start: 0, end: 0 },
            AckRange { start: 2, end: 2 },
        ]);
        assert_eq!(queue.drain_nack(), vec![AckRange { start: 1, end: 1 }]);
    }
}
