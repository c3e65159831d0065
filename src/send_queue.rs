//! The outbound half of a connection: per-mode index assignment, fragmentation of big
//!  messages, retransmission of unacknowledged reliable frames with exponential backoff,
//!  and the RTT estimate driving the retransmission timeout.
//!
//! Messages go in via `insert()`; `flush()` returns the frames due for transmission,
//!  each to be sent as its own frame-set datagram.

use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::debug;

use crate::error::RaknetError;
use crate::frame::{FragmentHeader, Frame, Reliability};
use crate::safe_converter::PrecheckedCast;
use crate::wire::u24_next;

/// Floor and ceiling for the retransmission timeout. The floor doubles as the initial
///  value before any RTT sample exists.
const RTO_MIN: Duration = Duration::from_millis(50);
const RTO_MAX: Duration = Duration::from_millis(12_000);

/// A reliable frame that was sent and not acknowledged yet.
#[derive(Debug)]
struct PendingSend {
    frame: Frame,
    sent_at: Instant,
    /// cleared when a (explicit or implicit) nack asks for immediate retransmission
    transmitted: bool,
    retransmit_count: u32,
    /// every transport sequence number this frame was ever sent under - an ack for any
    ///  of them settles the frame
    sequence_numbers: Vec<u32>,
}

#[derive(Debug)]
pub struct SendQueue {
    max_frame_payload: usize,
    next_sequence_number: u32,
    next_reliable_index: u32,
    next_sequenced_index: u32,
    next_ordered_index: u32,
    next_compound_id: u16,
    queued: Vec<Frame>,
    in_flight: Vec<PendingSend>,
    srtt: Duration,
    rto: Duration,
}

impl SendQueue {
    pub fn new(max_frame_payload: usize) -> SendQueue {
        SendQueue {
            max_frame_payload,
            next_sequence_number: 0,
            next_reliable_index: 0,
            next_sequenced_index: 0,
            next_ordered_index: 0,
            next_compound_id: 0,
            queued: Vec::new(),
            in_flight: Vec::new(),
            srtt: RTO_MIN,
            rto: RTO_MIN,
        }
    }

    /// Enqueue a message. Messages exceeding the per-frame payload budget are split into
    ///  a fragment compound if the reliability mode supports reassembly on the other
    ///  side, and rejected otherwise.
    pub fn insert(&mut self, reliability: Reliability, payload: Bytes) -> anyhow::Result<()> {
        if payload.len() > self.max_frame_payload {
            if reliability != Reliability::ReliableOrdered {
                bail!(RaknetError::PayloadTooLarge {
                    len: payload.len(),
                    max: self.max_frame_payload,
                });
            }
            self.insert_fragmented(payload);
            return Ok(());
        }

        let mut frame = Frame::new(reliability, payload);
        self.assign_indices(&mut frame);
        self.queued.push(frame);
        Ok(())
    }

    fn assign_indices(&mut self, frame: &mut Frame) {
        if frame.reliability.is_reliable() {
            frame.reliable_index = self.next_reliable_index;
            self.next_reliable_index = u24_next(self.next_reliable_index);
        }
        if frame.reliability.is_sequenced() {
            frame.sequenced_index = self.next_sequenced_index;
            self.next_sequenced_index = u24_next(self.next_sequenced_index);
            // sequenced frames ride on the current ordered index without advancing it
            frame.ordered_index = self.next_ordered_index;
        }
        else if frame.reliability.is_ordered() {
            frame.ordered_index = self.next_ordered_index;
            self.next_ordered_index = u24_next(self.next_ordered_index);
        }
    }

    fn insert_fragmented(&mut self, payload: Bytes) {
        let compound_id = self.next_compound_id;
        self.next_compound_id = self.next_compound_id.wrapping_add(1);

        let num_fragments = payload.len().div_ceil(self.max_frame_payload);
        let ordered_index = self.next_ordered_index;
        self.next_ordered_index = u24_next(self.next_ordered_index);

        for index in 0..num_fragments {
            let start = index * self.max_frame_payload;
            let end = usize::min(start + self.max_frame_payload, payload.len());

            let mut frame = Frame::new(Reliability::ReliableOrdered, payload.slice(start..end));
            frame.reliable_index = self.next_reliable_index;
            self.next_reliable_index = u24_next(self.next_reliable_index);
            frame.ordered_index = ordered_index;
            frame.fragment = Some(FragmentHeader {
                compound_size: num_fragments.prechecked_cast(),
                compound_id,
                fragment_index: index.prechecked_cast(),
            });
            self.queued.push(frame);
        }
    }

    fn next_sequence_number(&mut self) -> u32 {
        let result = self.next_sequence_number;
        self.next_sequence_number = u24_next(result);
        result
    }

    /// All frames due for transmission now: overdue and nacked reliable frames first,
    ///  then everything newly enqueued. Each returned frame carries its final transport
    ///  sequence number and is meant to go out as a datagram of its own.
    pub fn flush(&mut self, now: Instant) -> Vec<Frame> {
        let mut result = Vec::new();

        // a frame whose retransmission timeout (with backoff) expired goes out again
        //  under a fresh sequence number
        for i in 0..self.in_flight.len() {
            let pending = &self.in_flight[i];
            if pending.transmitted && now.duration_since(pending.sent_at) >= backoff(self.rto, pending.retransmit_count) {
                self.rearm(i);
            }
        }

        for pending in self.in_flight.iter_mut() {
            if !pending.transmitted {
                pending.transmitted = true;
                pending.sent_at = now;
                pending.retransmit_count += 1;
                result.push(pending.frame.clone());
            }
        }

        for mut frame in std::mem::take(&mut self.queued) {
            frame.sequence_number = self.next_sequence_number();
            result.push(frame.clone());

            if frame.reliability.is_reliable() {
                self.in_flight.push(PendingSend {
                    sequence_numbers: vec![frame.sequence_number],
                    frame,
                    sent_at: now,
                    transmitted: true,
                    retransmit_count: 0,
                });
            }
        }

        result
    }

    /// The peer acknowledged a sequence number. Settles the matching in-flight frame (if
    ///  any - unreliable datagrams are acked too but not tracked) and treats older
    ///  in-flight datagrams that the ack skipped over as lost.
    pub fn ack(&mut self, seq: u32, now: Instant) {
        let mut i = 0;
        while i < self.in_flight.len() {
            if self.in_flight[i].sequence_numbers.contains(&seq) {
                let pending = self.in_flight.remove(i);
                // RTT samples only from frames that were never retransmitted, so that a
                //  late ack for the original transmission cannot skew the estimate
                if pending.retransmit_count == 0 {
                    self.update_rto(now.duration_since(pending.sent_at));
                }
            }
            else {
                i += 1;
            }
        }

        for i in 0..self.in_flight.len() {
            let pending = &self.in_flight[i];
            if pending.transmitted && pending.frame.sequence_number < seq {
                debug!("ack for {} skipped over in-flight sequence number {}", seq, pending.frame.sequence_number);
                self.rearm(i);
            }
        }
    }

    /// The peer reported a sequence number as missing: retransmit on the next flush
    ///  without waiting for the timeout.
    pub fn nack(&mut self, seq: u32) {
        for i in 0..self.in_flight.len() {
            let pending = &self.in_flight[i];
            if pending.transmitted && pending.frame.sequence_number == seq {
                self.rearm(i);
            }
        }
    }

    /// Mark an in-flight frame as due for retransmission, under a fresh transport
    ///  sequence number. The per-mode indices stay untouched.
    fn rearm(&mut self, i: usize) {
        let new_seq = self.next_sequence_number();
        let pending = &mut self.in_flight[i];
        debug!("retransmitting reliable frame {} as sequence number {}", pending.frame.reliable_index, new_seq);
        pending.frame.sequence_number = new_seq;
        pending.sequence_numbers.push(new_seq);
        pending.transmitted = false;
    }

    fn update_rto(&mut self, sample: Duration) {
        self.srtt = self.srtt.mul_f64(0.8) + sample.mul_f64(0.2);
        self.rto = self.srtt.mul_f64(1.5).clamp(RTO_MIN, RTO_MAX);
    }

    /// The current retransmission timeout (before per-frame backoff).
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// true once nothing is queued and nothing awaits acknowledgment
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.in_flight.is_empty()
    }
}

fn backoff(rto: Duration, retransmit_count: u32) -> Duration {
    rto.mul_f64(1.5f64.powi(retransmit_count.try_into().unwrap_or(i32::MAX)))
}
