//! See [`SlidingWindowTxControl`].

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::{
    checksum::{ChecksumFn, ChecksumStream},
    error::WtpError,
    packet::{CHECKSUM_LEN, PKT_BEGIN_MSG, PKT_CONT_MSG},
    seq::Seq,
};

/// One outstanding transmit fragment.
///
/// A fragment is created when [`SlidingWindowTxControl::get_write_data`]
/// allocates bytes from the front message, and removed only when the peer
/// acknowledges past its end. Caller-side cancellation never removes a
/// fragment: sequence-space integrity requires it to be retransmitted until
/// acknowledged.
#[derive(Debug)]
struct TxFragment {
    seq_num: Seq,
    /// Total message size; nonzero only on the first fragment of a message.
    msg_size: u16,
    data: Bytes,
    /// Set by a retransmit timeout; cleared when the fragment is re-emitted.
    need_send: bool,
    /// Armed on emission, disarmed when the timeout fires.
    resend_at: Option<Instant>,
}

impl TxFragment {
    fn end(&self) -> Seq {
        #[allow(clippy::cast_possible_truncation)] // fragment payloads are < 256 bytes
        let len = self.data.len() as u16;
        self.seq_num + len
    }

    const fn header_len(&self) -> usize {
        // BEGIN_MSG: type + msg_size + seq + payload_len; CONT_MSG drops msg_size
        if self.msg_size != 0 { 6 } else { 4 }
    }
}

/// Sliding-window transmit controller for one WTP connection.
///
/// Owns the outbound side of the reliability engine: a FIFO of whole
/// messages still being fragmented, a FIFO of self-contained control
/// packets that jump ahead of user data, and the ordered list of
/// outstanding fragments awaiting acknowledgement.
///
/// The controller is sans-IO: [`get_write_data`] packs bytes for the next
/// BlockWrite OpSpec and arms retransmit deadlines against the caller's
/// clock, [`poll_timeout`] trips them, and [`handle_ack`] advances the
/// window.
///
/// [`get_write_data`]: SlidingWindowTxControl::get_write_data
/// [`poll_timeout`]: SlidingWindowTxControl::poll_timeout
/// [`handle_ack`]: SlidingWindowTxControl::handle_ack
#[derive(Debug)]
pub struct SlidingWindowTxControl {
    /// Current BlockWrite payload budget in bytes; updated by the adaptive
    /// size controller.
    pub write_size: usize,
    window_size: u16,
    timeout: Duration,
    checksum_fn: ChecksumFn,
    /// Unacknowledged head of the window. Never advances past a gap.
    seq_num: Seq,
    packets: VecDeque<Bytes>,
    messages: VecDeque<Bytes>,
    /// Sequence number where the front message begins.
    msg_begin: Seq,
    /// Bytes of the front message already handed to fragments.
    msg_fragmented: u16,
    /// End sequence numbers of fully fragmented messages, oldest first.
    msg_ends: VecDeque<Seq>,
    fragments: VecDeque<TxFragment>,
}

impl SlidingWindowTxControl {
    /// Creates a transmit controller.
    #[must_use]
    pub fn new(
        write_size: usize,
        window_size: u16,
        timeout: Duration,
        checksum_fn: ChecksumFn,
    ) -> Self {
        Self {
            write_size,
            window_size,
            timeout,
            checksum_fn,
            seq_num: Seq(0),
            packets: VecDeque::new(),
            messages: VecDeque::new(),
            msg_begin: Seq(0),
            msg_fragmented: 0,
            msg_ends: VecDeque::new(),
            fragments: VecDeque::new(),
        }
    }

    /// Unacknowledged head of the transmit window.
    #[must_use]
    pub const fn seq_num(&self) -> Seq {
        self.seq_num
    }

    /// Appends a whole message to the outgoing message FIFO.
    ///
    /// # Errors
    ///
    /// [`WtpError::InvalidSize`] if the message cannot be declared in a
    /// 16-bit `BEGIN_MSG` size field.
    pub fn add_msg(&mut self, msg: Bytes) -> Result<(), WtpError> {
        if msg.is_empty() || msg.len() > usize::from(u16::MAX) {
            return Err(WtpError::InvalidSize);
        }
        self.messages.push_back(msg);
        Ok(())
    }

    /// Appends a self-contained control packet (ACK, OPEN, `SET_PARAM`...)
    /// that jumps ahead of user data. The packet bytes must not include the
    /// trailing checksum; it is framed when the packet is packed.
    pub fn add_packet(&mut self, packet: Bytes) {
        self.packets.push_back(packet);
    }

    /// Allocates a new fragment from the front message, given the space
    /// still available in the OpSpec being packed.
    #[allow(clippy::cast_possible_truncation)] // sizes bounded by add_msg
    fn make_fragment(&mut self, avail_size: usize) -> Option<TxFragment> {
        let msg = self.messages.front()?;
        let fragmented = usize::from(self.msg_fragmented);
        let seq_num = self.msg_begin + self.msg_fragmented;
        let header = if fragmented == 0 { 6 } else { 4 };
        // the fragment must fit with its header and checksum, stay within
        // the message, and not cross the far edge of the window
        let max_avail = avail_size.checked_sub(header + CHECKSUM_LEN)?;
        let max_msg = msg.len() - fragmented;
        let max_window =
            usize::from(self.window_size).checked_sub(usize::from(seq_num.rel_to(self.seq_num)))?;
        let size = max_avail.min(max_msg).min(max_window);
        if size == 0 {
            return None;
        }
        let data = msg.slice(fragmented..fragmented + size);
        let msg_size = if fragmented == 0 { msg.len() as u16 } else { 0 };
        self.msg_fragmented += size as u16;
        if usize::from(self.msg_fragmented) == msg.len() {
            // record the message end now: an acknowledgement may arrive
            // before the next allocation and must still count the message
            self.msg_begin += self.msg_fragmented;
            self.msg_fragmented = 0;
            self.msg_ends.push_back(self.msg_begin);
            self.messages.pop_front();
        }
        Some(TxFragment {
            seq_num,
            msg_size,
            data,
            need_send: false,
            resend_at: None,
        })
    }

    /// Packs bytes for the next BlockWrite OpSpec, at most `write_size`
    /// long: control packets first, then timed-out fragments re-emitted
    /// unchanged, then new fragments allocated from the front message.
    /// Every emitted fragment's retransmit deadline is armed at
    /// `now + timeout`. Returns an empty buffer when there is nothing to
    /// send.
    pub fn get_write_data(&mut self, now: Instant) -> Bytes {
        let mut stream = ChecksumStream::new().with_checksum_fn(self.checksum_fn);
        while let Some(packet) = self.packets.pop_front() {
            if stream.len() + packet.len() + CHECKSUM_LEN > self.write_size {
                // keep it for the next OpSpec; control packets are never dropped
                self.packets.push_front(packet);
                return stream.into_bytes();
            }
            stream.begin_checksum();
            stream.write(&packet);
            stream.write_checksum();
        }
        loop {
            let index = match self.fragments.iter().position(|frag| frag.need_send) {
                Some(index) => index,
                None => {
                    let avail = self.write_size.saturating_sub(stream.len());
                    match self.make_fragment(avail) {
                        Some(fragment) => {
                            self.fragments.push_back(fragment);
                            self.fragments.len() - 1
                        }
                        None => break,
                    }
                }
            };
            let Some(fragment) = self.fragments.get_mut(index) else {
                break;
            };
            if stream.len() + fragment.header_len() + fragment.data.len() + CHECKSUM_LEN
                > self.write_size
            {
                // a timed-out fragment that no longer fits stays flagged
                // for the next OpSpec
                break;
            }
            fragment.need_send = false;
            stream.begin_checksum();
            if fragment.msg_size != 0 {
                stream.write_u8(PKT_BEGIN_MSG);
                stream.write_u16(fragment.msg_size);
            } else {
                stream.write_u8(PKT_CONT_MSG);
            }
            stream.write_u16(fragment.seq_num.0);
            #[allow(clippy::cast_possible_truncation)] // bounded by write_size <= 30
            stream.write_u8(fragment.data.len() as u8);
            stream.write(&fragment.data);
            stream.write_checksum();
            fragment.resend_at = Some(now + self.timeout);
            trace!(
                seq = fragment.seq_num.0,
                len = fragment.data.len(),
                "emitted fragment"
            );
        }
        stream.into_bytes()
    }

    /// Handles an acknowledgement carrying the peer's next in-order
    /// sequence number, returning the number of messages it completed.
    ///
    /// The acknowledgement is dropped (returning 0) if it lies beyond the
    /// fragmented high-water mark or does not fall on a fragment boundary;
    /// otherwise the acknowledged prefix of fragments is retired and the
    /// window head advances to `ack`.
    pub fn handle_ack(&mut self, ack: Seq) -> usize {
        let anchor = self.seq_num;
        let rel_ack = ack.rel_to(anchor);
        let high_water = (self.msg_begin + self.msg_fragmented).rel_to(anchor);
        if rel_ack > high_water {
            trace!(ack = ack.0, "acknowledgement beyond high-water mark");
            return 0;
        }
        let n_acked = if self.fragments.is_empty() {
            0
        } else {
            let mut found = None;
            for (index, fragment) in self.fragments.iter().enumerate() {
                let end = fragment.end().rel_to(anchor);
                if end == rel_ack {
                    found = Some(index + 1);
                    break;
                }
                if end > rel_ack {
                    break;
                }
            }
            match found {
                Some(n) => n,
                None => {
                    trace!(ack = ack.0, "acknowledgement off a fragment boundary");
                    return 0;
                }
            }
        };
        let mut n_sent_msgs = 0;
        for fragment in self.fragments.drain(..n_acked) {
            let end = fragment.end().rel_to(anchor);
            if let Some(&msg_end) = self.msg_ends.front() {
                if msg_end.rel_to(anchor) <= end {
                    self.msg_ends.pop_front();
                    n_sent_msgs += 1;
                }
            }
            trace!(seq = fragment.seq_num.0, "fragment acknowledged");
        }
        self.seq_num = ack;
        n_sent_msgs
    }

    /// Trips every retransmit deadline at or before `now`, flagging the
    /// fragments for re-emission. Returns whether any fired, so the caller
    /// can schedule an AccessSpec.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        let mut fired = false;
        for fragment in &mut self.fragments {
            if fragment.resend_at.is_some_and(|at| at <= now) {
                debug!(
                    seq = fragment.seq_num.0,
                    len = fragment.data.len(),
                    "retransmit timeout"
                );
                fragment.need_send = true;
                fragment.resend_at = None;
                fired = true;
            }
        }
        fired
    }

    /// Earliest armed retransmit deadline, if any.
    #[must_use]
    pub fn next_timeout(&self) -> Option<Instant> {
        self.fragments
            .iter()
            .filter_map(|fragment| fragment.resend_at)
            .min()
    }

    /// Whether any message bytes or control packets are waiting to go out.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.packets.is_empty()
            || !self.messages.is_empty()
            || self.fragments.iter().any(|fragment| fragment.need_send)
    }
}

#[cfg(test)]
mod tests {
    use crate::checksum::xor_checksum;

    use super::*;

    const WRITE_SIZE: usize = 24;
    const WINDOW: u16 = 64;
    const TIMEOUT: Duration = Duration::from_secs(45);

    fn ctrl() -> SlidingWindowTxControl {
        SlidingWindowTxControl::new(WRITE_SIZE, WINDOW, TIMEOUT, xor_checksum)
    }

    fn framed(packet: &[u8]) -> Vec<u8> {
        let mut out = packet.to_vec();
        out.push(xor_checksum(packet));
        out
    }

    #[test]
    fn packs_control_packets_first() {
        let mut ctrl = ctrl();
        ctrl.add_msg(Bytes::from_static(b"AB")).unwrap();
        ctrl.add_packet(Bytes::from_static(&[0x03, 0x05, 0x00]));
        let data = ctrl.get_write_data(Instant::now());
        let mut expect = framed(&[0x03, 0x05, 0x00]);
        expect.extend(framed(&[PKT_BEGIN_MSG, 0x02, 0x00, 0x00, 0x00, 0x02, b'A', b'B']));
        assert_eq!(data.as_ref(), &expect[..]);
    }

    #[test]
    fn oversized_control_packet_is_kept() {
        let mut ctrl = ctrl();
        ctrl.write_size = 4;
        ctrl.add_packet(Bytes::from_static(&[0x03, 0x05, 0x00]));
        ctrl.add_packet(Bytes::from_static(&[0x01]));
        // ACK (3 bytes + checksum) fits exactly; OPEN must wait
        let first = ctrl.get_write_data(Instant::now());
        assert_eq!(first.as_ref(), &framed(&[0x03, 0x05, 0x00])[..]);
        let second = ctrl.get_write_data(Instant::now());
        assert_eq!(second.as_ref(), &framed(&[0x01])[..]);
    }

    #[test]
    fn fragments_message_across_opspecs() {
        let mut ctrl = ctrl();
        let msg = Bytes::from(vec![0x55; 40]);
        ctrl.add_msg(msg).unwrap();
        let now = Instant::now();
        // first OpSpec: BEGIN_MSG header (6) + checksum leaves 17 payload bytes
        let first = ctrl.get_write_data(now);
        assert_eq!(first.len(), WRITE_SIZE);
        assert_eq!(first[0], PKT_BEGIN_MSG);
        assert_eq!(u16::from_le_bytes([first[1], first[2]]), 40);
        assert_eq!(first[5], 17);
        // second OpSpec: CONT_MSG with seq 17
        let second = ctrl.get_write_data(now);
        assert_eq!(second[0], PKT_CONT_MSG);
        assert_eq!(u16::from_le_bytes([second[1], second[2]]), 17);
        assert_eq!(second[3], 19);
        // remaining 4 bytes
        let third = ctrl.get_write_data(now);
        assert_eq!(third[0], PKT_CONT_MSG);
        assert_eq!(u16::from_le_bytes([third[1], third[2]]), 36);
        assert_eq!(third[3], 4);
        assert!(ctrl.get_write_data(now).is_empty());
    }

    #[test]
    fn ack_advances_head_and_completes_messages() {
        let mut ctrl = ctrl();
        ctrl.add_msg(Bytes::from_static(b"hello")).unwrap();
        ctrl.add_msg(Bytes::from_static(b"yo")).unwrap();
        let now = Instant::now();
        let _ = ctrl.get_write_data(now);
        // both messages fit into one OpSpec; acking the first boundary
        // completes one message
        assert_eq!(ctrl.handle_ack(Seq(5)), 1);
        assert_eq!(ctrl.seq_num(), Seq(5));
        assert_eq!(ctrl.handle_ack(Seq(7)), 1);
        assert_eq!(ctrl.seq_num(), Seq(7));
    }

    #[test]
    fn ack_covering_both_messages_counts_per_fragment_boundary() {
        let mut ctrl = ctrl();
        ctrl.add_msg(Bytes::from_static(b"hello")).unwrap();
        let now = Instant::now();
        let _ = ctrl.get_write_data(now);
        assert_eq!(ctrl.handle_ack(Seq(5)), 1);
        // duplicate ack of the same head is a no-op
        assert_eq!(ctrl.handle_ack(Seq(5)), 0);
        assert_eq!(ctrl.seq_num(), Seq(5));
    }

    #[test]
    fn ack_beyond_high_water_rejected() {
        let mut ctrl = ctrl();
        ctrl.add_msg(Bytes::from_static(b"hello")).unwrap();
        let _ = ctrl.get_write_data(Instant::now());
        assert_eq!(ctrl.handle_ack(Seq(6)), 0);
        assert_eq!(ctrl.seq_num(), Seq(0));
    }

    #[test]
    fn ack_mid_fragment_rejected() {
        let mut ctrl = ctrl();
        ctrl.add_msg(Bytes::from_static(b"hello")).unwrap();
        let _ = ctrl.get_write_data(Instant::now());
        assert_eq!(ctrl.handle_ack(Seq(3)), 0);
        assert_eq!(ctrl.seq_num(), Seq(0));
    }

    #[test]
    fn timeout_marks_fragment_for_resend() {
        let mut ctrl = ctrl();
        ctrl.add_msg(Bytes::from_static(b"ABCD")).unwrap();
        let now = Instant::now();
        let first = ctrl.get_write_data(now);
        assert!(!first.is_empty());
        // nothing due before the deadline
        assert!(!ctrl.poll_timeout(now + TIMEOUT - Duration::from_secs(1)));
        assert!(ctrl.get_write_data(now).is_empty());
        // after the deadline the same bytes are re-emitted
        assert!(ctrl.poll_timeout(now + TIMEOUT));
        let again = ctrl.get_write_data(now + TIMEOUT);
        assert_eq!(first, again);
        // and the ack still resolves it
        assert_eq!(ctrl.handle_ack(Seq(4)), 1);
    }

    #[test]
    fn window_limits_outstanding_bytes() {
        let mut ctrl = SlidingWindowTxControl::new(WRITE_SIZE, 8, TIMEOUT, xor_checksum);
        ctrl.add_msg(Bytes::from(vec![0x11; 20])).unwrap();
        let now = Instant::now();
        let first = ctrl.get_write_data(now);
        // only 8 bytes may be outstanding
        assert_eq!(first[5], 8);
        assert!(ctrl.get_write_data(now).is_empty());
        // acking frees the window for the rest
        assert_eq!(ctrl.handle_ack(Seq(8)), 0);
        let second = ctrl.get_write_data(now);
        assert_eq!(second[0], PKT_CONT_MSG);
        assert_eq!(second[3], 8);
    }

    #[test]
    fn seq_wraps_across_the_boundary() {
        let mut ctrl = ctrl();
        ctrl.seq_num = Seq(0xFFFC);
        ctrl.msg_begin = Seq(0xFFFC);
        ctrl.add_msg(Bytes::from_static(b"12345678")).unwrap();
        let now = Instant::now();
        let data = ctrl.get_write_data(now);
        assert_eq!(u16::from_le_bytes([data[3], data[4]]), 0xFFFC);
        assert_eq!(ctrl.handle_ack(Seq(0x0004)), 1);
        assert_eq!(ctrl.seq_num(), Seq(0x0004));
    }

    #[test]
    fn rejects_unrepresentable_messages() {
        let mut ctrl = ctrl();
        assert_eq!(ctrl.add_msg(Bytes::new()), Err(WtpError::InvalidSize));
        assert_eq!(
            ctrl.add_msg(Bytes::from(vec![0; usize::from(u16::MAX) + 1])),
            Err(WtpError::InvalidSize)
        );
    }
}
