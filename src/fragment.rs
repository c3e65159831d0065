//! Reassembly of fragmented messages. A message bigger than one frame's payload budget is
//!  split into a *compound* of fragment frames sharing a compound id; the receiving side
//!  collects them here until the compound is complete and can be merged back into a
//!  single frame.

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::frame::Frame;
use crate::safe_converter::SafeCast;

/// The fragments of one compound, keyed by fragment index.
#[derive(Debug)]
struct FragmentGroup {
    compound_size: u32,
    frames: FxHashMap<u32, Frame>,
}

impl FragmentGroup {
    fn new(compound_size: u32) -> FragmentGroup {
        FragmentGroup {
            compound_size,
            frames: FxHashMap::default(),
        }
    }

    fn is_full(&self) -> bool {
        self.frames.len() == self.compound_size.safe_cast()
    }

    fn insert(&mut self, fragment_index: u32, frame: Frame) {
        if self.is_full() || fragment_index >= self.compound_size {
            warn!("dropping fragment {} of a compound of {}", fragment_index, self.compound_size);
            return;
        }
        // a retransmitted duplicate carries the same payload, keep the first
        self.frames.entry(fragment_index).or_insert(frame);
    }

    /// Concatenate the fragments into a single frame. The merged frame inherits the
    ///  reliability attributes of the *last* fragment (all fragments of a compound share
    ///  them, except for the per-datagram sequence number) and loses its fragment header.
    fn merge(mut self) -> Frame {
        let last_index = self.compound_size - 1;
        let mut merged = self.frames.remove(&last_index)
            .expect("this is a bug: merge must only be called on a full group");

        let mut payload = BytesMut::new();
        for index in 0..last_index {
            let fragment = self.frames.remove(&index)
                .expect("this is a bug: merge must only be called on a full group");
            payload.extend_from_slice(&fragment.payload);
        }
        payload.extend_from_slice(&merged.payload);

        merged.payload = payload.freeze();
        merged.fragment = None;
        merged
    }
}

/// All partially received compounds of one connection.
#[derive(Debug, Default)]
pub struct ReassemblyQueue {
    groups: FxHashMap<u16, FragmentGroup>,
}

impl ReassemblyQueue {
    pub fn new() -> ReassemblyQueue {
        ReassemblyQueue::default()
    }

    /// Add a fragment frame. Returns the reassembled frame once its compound is
    ///  complete, at most once per compound.
    pub fn insert(&mut self, frame: Frame) -> Option<Frame> {
        let fragment = frame.fragment?;
        if fragment.compound_size == 0 {
            warn!("dropping fragment of a compound declared as empty");
            return None;
        }

        let group = self.groups.entry(fragment.compound_id)
            .or_insert_with(|| FragmentGroup::new(fragment.compound_size));
        group.insert(fragment.fragment_index, frame);

        if group.is_full() {
            let group = self.groups.remove(&fragment.compound_id)?;
            Some(group.merge())
        }
        else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
