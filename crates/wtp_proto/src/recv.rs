//! See [`SlidingWindowRxControl`].

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::seq::{Seq, SeqRange};

/// A buffered out-of-order receive fragment.
#[derive(Debug)]
struct RxFragment {
    seq_num: Seq,
    data: Bytes,
}

/// A declared message: the range `[begin, begin + size)` announced by a
/// `BEGIN_MSG` packet, marking where one reassembled message ends and the
/// next begins inside the contiguous byte accumulator.
#[derive(Debug, Clone, Copy)]
struct RxMsgInfo {
    begin: Seq,
    size: u16,
}

/// Sliding-window receive controller for one WTP connection.
///
/// Buffers out-of-order fragments inside the window
/// `[seq_num, seq_num + window_size)`, drains them as the head becomes
/// contiguous, and cuts the byte accumulator into messages along the
/// boundaries declared by `BEGIN_MSG` packets.
///
/// Both the fragment list and the declared-message list are kept strictly
/// ordered and non-overlapping under the cyclic order anchored at
/// `seq_num`; anything violating that is silently dropped and recovered by
/// the peer's retransmission.
#[derive(Debug)]
pub struct SlidingWindowRxControl {
    seq_num: Seq,
    window_size: u16,
    msg_data: BytesMut,
    fragments: Vec<RxFragment>,
    msg_info: Vec<RxMsgInfo>,
}

impl SlidingWindowRxControl {
    /// Creates a receive controller with the given window size.
    #[must_use]
    pub fn new(window_size: u16) -> Self {
        Self {
            seq_num: Seq(0),
            window_size,
            msg_data: BytesMut::new(),
            fragments: Vec::new(),
            msg_info: Vec::new(),
        }
    }

    /// Next in-order sequence number expected; what outgoing ACKs carry.
    #[must_use]
    pub const fn seq_num(&self) -> Seq {
        self.seq_num
    }

    /// Current receive window size in bytes.
    #[must_use]
    pub const fn window_size(&self) -> u16 {
        self.window_size
    }

    /// Updates the window size (`SET_PARAM WINDOW_SIZE` from the peer).
    pub fn set_window_size(&mut self, window_size: u16) {
        self.window_size = window_size;
    }

    /// Handles a data packet, returning any newly completed messages in
    /// order.
    ///
    /// `msg_size` is the declared message size of a `BEGIN_MSG` packet;
    /// continuation packets pass [`None`]. Out-of-window packets, overlaps
    /// with buffered fragments, and re-declarations of a message range are
    /// all dropped without effect.
    pub fn handle_packet(
        &mut self,
        seq_num: Seq,
        data: Bytes,
        msg_size: Option<u16>,
    ) -> Vec<Bytes> {
        let anchor = self.seq_num;
        let window = SeqRange::new(anchor, u32::from(self.window_size));
        let pkt_range = SeqRange::new(seq_num, data.len() as u32);
        if !window.contains(pkt_range) {
            trace!(seq = seq_num.0, len = data.len(), "packet outside window");
            return Vec::new();
        }
        // a BEGIN_MSG declares a message range; reject any overlap with
        // ranges already declared
        if let Some(msg_size) = msg_size.filter(|&size| size > 0) {
            let rel = |seq: Seq| seq.rel_to(anchor);
            let index = self
                .msg_info
                .iter()
                .position(|info| rel(seq_num) < rel(info.begin))
                .unwrap_or(self.msg_info.len());
            let overlaps_next = self
                .msg_info
                .get(index)
                .is_some_and(|next| u32::from(rel(seq_num)) + u32::from(msg_size) > u32::from(rel(next.begin)));
            let overlaps_prev = index.checked_sub(1).is_some_and(|prev| {
                let prev = &self.msg_info[prev];
                u32::from(rel(prev.begin)) + u32::from(prev.size) > u32::from(rel(seq_num))
            });
            if overlaps_next || overlaps_prev {
                trace!(seq = seq_num.0, msg_size, "message declaration overlaps");
                return Vec::new();
            }
            self.msg_info.insert(
                index,
                RxMsgInfo {
                    begin: seq_num,
                    size: msg_size,
                },
            );
        }
        // insert the fragment in anchored order, rejecting overlap with
        // its neighbors (a duplicate would wedge the drain forever)
        {
            let rel = |seq: Seq| seq.rel_to(anchor);
            let index = self
                .fragments
                .iter()
                .position(|fragment| rel(seq_num) < rel(fragment.seq_num))
                .unwrap_or(self.fragments.len());
            let end = u32::from(rel(seq_num)) + data.len() as u32;
            let overlaps_next = self
                .fragments
                .get(index)
                .is_some_and(|next| end > u32::from(rel(next.seq_num)));
            let overlaps_prev = index.checked_sub(1).is_some_and(|prev| {
                let prev = &self.fragments[prev];
                u32::from(rel(prev.seq_num)) + prev.data.len() as u32 > u32::from(rel(seq_num))
            });
            if overlaps_next || overlaps_prev {
                trace!(seq = seq_num.0, len = data.len(), "fragment overlaps");
                return Vec::new();
            }
            self.fragments.insert(index, RxFragment { seq_num, data });
        }
        // drain the contiguous prefix into the accumulator, cutting
        // messages along declared boundaries
        let mut new_msgs = Vec::new();
        let mut drained = 0;
        while let Some(fragment) = self.fragments.get(drained) {
            if fragment.seq_num != self.seq_num {
                break;
            }
            #[allow(clippy::cast_possible_truncation)] // fragment payloads are < 256 bytes
            let len = fragment.data.len() as u16;
            self.msg_data.extend_from_slice(&fragment.data);
            self.seq_num += len;
            drained += 1;
            if let Some(info) = self.msg_info.first() {
                if info.begin + info.size == self.seq_num {
                    new_msgs.push(self.msg_data.split().freeze());
                    self.msg_info.remove(0);
                }
            }
        }
        self.fragments.drain(..drained);
        new_msgs
    }
}
