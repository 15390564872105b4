//! See [`WtpConnection`].

use std::collections::VecDeque;

use bytes::Bytes;
use futures::channel::oneshot;
use tracing::{debug, trace};
use web_time::{Duration, Instant};

use wtp_llrp::{
    LlrpClient,
    opspec::{LLRP_N_OPSPECS_MAX, OpSpec, read_opspec, write_opspec},
    report::{OpSpecOutcome, OpSpecResult},
};
use wtp_proto::{
    WtpError,
    checksum::{ChecksumStream, xor_checksum},
    packet::{PARAM_READ_SIZE, PKT_ACK, PKT_CLOSE, PKT_OPEN, PKT_SET_PARAM, Packet, Param},
    recv::SlidingWindowRxControl,
    send::SlidingWindowTxControl,
    seq::Seq,
    sizing::{OpSpecSizeControl, WTP_OPSPEC_INIT},
};

use crate::{ServerEvent, WispId, server::Shared};

/// Sliding window size of a fresh connection, in bytes.
pub(crate) const WTP_WINDOW_SIZE: u16 = 64;
/// Retransmit timeout for outstanding fragments.
pub(crate) const WTP_SEND_TIMEOUT: Duration = Duration::from_secs(45);

/// State of one half-link of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The half-link carries no traffic.
    Closed,
    /// An open has been sent and awaits acknowledgement.
    Opening,
    /// The half-link carries traffic.
    Opened,
    /// A close has been sent and awaits acknowledgement.
    Closing,
}

/// Per-WISP connection state machine.
///
/// Uplink (tag to host) and downlink (host to tag) open and close
/// independently; each direction owns one sliding-window controller. All
/// packet handlers run on the server's reactor task, so no handler ever
/// observes a half-applied state change.
#[derive(Debug)]
pub(crate) struct WtpConnection {
    pub(crate) wisp_id: WispId,
    pub(crate) uplink_state: LinkState,
    pub(crate) downlink_state: LinkState,
    tx_ctrl: SlidingWindowTxControl,
    rx_ctrl: SlidingWindowRxControl,
    opspec_ctrl: OpSpecSizeControl,
    /// Fully reassembled messages not yet claimed by a `recv`.
    recv_msgs: VecDeque<Bytes>,
    recv_waiters: VecDeque<oneshot::Sender<Bytes>>,
    send_waiters: VecDeque<oneshot::Sender<Result<(), WtpError>>>,
    close_waiters: Vec<oneshot::Sender<Result<(), WtpError>>>,
    /// Read OpSpec sizes the tag has asked for, oldest first.
    read_opspec_sizes: VecDeque<usize>,
    /// At-most-one in-flight AccessSpec guard.
    ongoing_access_spec: bool,
}

fn build_header(packet_type: u8) -> ChecksumStream {
    let mut stream = ChecksumStream::new();
    stream.write_u8(packet_type);
    stream
}

impl WtpConnection {
    pub(crate) fn new(wisp_id: WispId) -> Self {
        Self {
            wisp_id,
            uplink_state: LinkState::Closed,
            downlink_state: LinkState::Closed,
            tx_ctrl: SlidingWindowTxControl::new(
                WTP_OPSPEC_INIT,
                WTP_WINDOW_SIZE,
                WTP_SEND_TIMEOUT,
                xor_checksum,
            ),
            rx_ctrl: SlidingWindowRxControl::new(WTP_WINDOW_SIZE),
            opspec_ctrl: OpSpecSizeControl::default(),
            recv_msgs: VecDeque::new(),
            recv_waiters: VecDeque::new(),
            send_waiters: VecDeque::new(),
            close_waiters: Vec::new(),
            read_opspec_sizes: VecDeque::new(),
            ongoing_access_spec: false,
        }
    }

    pub(crate) fn fully_closed(&self) -> bool {
        self.uplink_state == LinkState::Closed && self.downlink_state == LinkState::Closed
    }

    fn build_ack(&self) -> Bytes {
        let mut stream = build_header(PKT_ACK);
        stream.write_u16(self.rx_ctrl.seq_num().0);
        stream.into_bytes()
    }

    /// Dispatches one decoded packet into the state machine.
    pub(crate) fn handle_packet<C: LlrpClient>(
        &mut self,
        packet: Packet,
        shared: &mut Shared<C>,
        now: Instant,
    ) {
        match packet {
            Packet::Open => self.handle_open(shared, now),
            Packet::Close => self.handle_close(shared, now),
            Packet::Ack { seq } => self.handle_ack(seq, shared, now),
            Packet::BeginMsg {
                msg_size,
                seq,
                payload,
            } => self.handle_data(seq, payload, Some(msg_size), shared, now),
            Packet::ContMsg { seq, payload } => self.handle_data(seq, payload, None, shared, now),
            Packet::ReqUplink { n_reads, read_size } => {
                self.handle_req_uplink(n_reads, read_size, shared, now);
            }
            Packet::SetParam { param } => {
                if let Err(err) = self.handle_set_param(param) {
                    debug!(wisp = self.wisp_id, %err, "SET_PARAM rejected");
                }
            }
        }
    }

    fn handle_open<C: LlrpClient>(&mut self, shared: &mut Shared<C>, now: Instant) {
        self.uplink_state = LinkState::Opened;
        if self.downlink_state == LinkState::Closed {
            self.downlink_state = LinkState::Opening;
        }
        // answer with an acknowledgement and our own open; a retransmitted
        // OPEN gets the same answer again
        self.tx_ctrl.add_packet(self.build_ack());
        self.tx_ctrl.add_packet(build_header(PKT_OPEN).into_bytes());
        self.request_access_spec(shared, now);
    }

    fn handle_close<C: LlrpClient>(&mut self, shared: &mut Shared<C>, now: Instant) {
        self.uplink_state = LinkState::Closed;
        match self.downlink_state {
            LinkState::Opened => shared.emit(ServerEvent::HalfClosed(self.wisp_id)),
            LinkState::Closed => shared.emit(ServerEvent::Closed(self.wisp_id)),
            LinkState::Opening | LinkState::Closing => {}
        }
        self.tx_ctrl.add_packet(self.build_ack());
        self.request_access_spec(shared, now);
    }

    fn handle_ack<C: LlrpClient>(&mut self, seq: Seq, shared: &mut Shared<C>, now: Instant) {
        if self.downlink_state == LinkState::Opening && seq == Seq(0) {
            trace!(wisp = self.wisp_id, "downlink opened");
            self.downlink_state = LinkState::Opened;
        } else if self.downlink_state == LinkState::Closing {
            trace!(wisp = self.wisp_id, "downlink closed");
            self.downlink_state = LinkState::Closed;
            for waiter in self.close_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
            if self.uplink_state == LinkState::Closed {
                shared.emit(ServerEvent::Closed(self.wisp_id));
            }
        } else {
            let n_sent_msgs = self.tx_ctrl.handle_ack(seq);
            for _ in 0..n_sent_msgs {
                if let Some(waiter) = self.send_waiters.pop_front() {
                    let _ = waiter.send(Ok(()));
                }
            }
            // the window may have slid open; flush whatever now fits
            self.request_access_spec(shared, now);
        }
    }

    fn handle_data<C: LlrpClient>(
        &mut self,
        seq: Seq,
        payload: Bytes,
        msg_size: Option<u16>,
        shared: &mut Shared<C>,
        now: Instant,
    ) {
        let new_msgs = self.rx_ctrl.handle_packet(seq, payload, msg_size);
        'deliver: for msg in new_msgs {
            let mut msg = msg;
            loop {
                match self.recv_waiters.pop_front() {
                    Some(waiter) => match waiter.send(msg) {
                        Ok(()) => continue 'deliver,
                        // the caller gave up on this receive; try the next
                        Err(returned) => msg = returned,
                    },
                    None => {
                        self.recv_msgs.push_back(msg);
                        continue 'deliver;
                    }
                }
            }
        }
        self.tx_ctrl.add_packet(self.build_ack());
        self.request_access_spec(shared, now);
    }

    fn handle_req_uplink<C: LlrpClient>(
        &mut self,
        n_reads: u8,
        read_size: u8,
        shared: &mut Shared<C>,
        now: Instant,
    ) {
        trace!(wisp = self.wisp_id, n_reads, read_size, "uplink requested");
        for _ in 0..n_reads {
            self.read_opspec_sizes.push_back(usize::from(read_size));
        }
        self.request_access_spec(shared, now);
    }

    fn handle_set_param(&mut self, param: Param) -> Result<(), WtpError> {
        match param {
            Param::WindowSize(window_size) => {
                trace!(wisp = self.wisp_id, window_size, "peer set window size");
                self.rx_ctrl.set_window_size(window_size);
                Ok(())
            }
            // only the tag honors READ_SIZE
            Param::ReadSize(_) => Err(WtpError::UnsupportedOp),
        }
    }

    /// Debounced AccessSpec scheduler: walks up to [`LLRP_N_OPSPECS_MAX`]
    /// OpSpec slots, alternating pending Reads with BlockWrite payloads,
    /// and submits the batch unless one is already in flight.
    pub(crate) fn request_access_spec<C: LlrpClient>(
        &mut self,
        shared: &mut Shared<C>,
        now: Instant,
    ) {
        if self.ongoing_access_spec {
            return;
        }
        self.ongoing_access_spec = true;
        let mut opspecs = Vec::new();
        let mut opspec_id: u16 = 0;
        loop {
            if let Some(read_size) = self.read_opspec_sizes.pop_front() {
                opspecs.push(OpSpec::Read(read_opspec(read_size, opspec_id)));
                self.opspec_ctrl.add_read(read_size);
                opspec_id += 1;
            }
            if usize::from(opspec_id) >= LLRP_N_OPSPECS_MAX {
                break;
            }
            let write_data = self.tx_ctrl.get_write_data(now);
            let wrote = !write_data.is_empty();
            if wrote {
                self.opspec_ctrl.add_write(write_data.len());
                opspecs.push(OpSpec::BlockWrite(write_opspec(&write_data, opspec_id)));
                opspec_id += 1;
            }
            if usize::from(opspec_id) >= LLRP_N_OPSPECS_MAX {
                break;
            }
            if self.read_opspec_sizes.is_empty() && !wrote {
                break;
            }
        }
        if opspecs.is_empty() {
            self.ongoing_access_spec = false;
            return;
        }
        if let Err(err) = shared.send_access_spec(self.wisp_id, opspecs) {
            debug!(wisp = self.wisp_id, %err, "AccessSpec submission failed");
            self.ongoing_access_spec = false;
        }
    }

    /// Feeds back the results of a completed AccessSpec, adjusts the
    /// adaptive sizes, and re-enters the scheduler.
    pub(crate) fn handle_opspec_results<C: LlrpClient>(
        &mut self,
        mut results: Vec<OpSpecResult>,
        shared: &mut Shared<C>,
        now: Instant,
    ) {
        self.ongoing_access_spec = false;
        results.sort_by_key(|result| result.opspec_id);
        for result in results {
            let succeeded = result.succeeded();
            match result.outcome {
                OpSpecOutcome::Write { words_written } => {
                    self.opspec_ctrl
                        .report_write_result(succeeded, usize::from(words_written) * 2);
                    self.tx_ctrl.write_size = self.opspec_ctrl.write_size();
                }
                OpSpecOutcome::Read { ref data } => {
                    let old_read_size = self.opspec_ctrl.read_size();
                    self.opspec_ctrl.report_read_result(succeeded, data.len());
                    let read_size = self.opspec_ctrl.read_size();
                    if read_size != old_read_size {
                        // tell the tag how much the next uplink may carry
                        let mut stream = build_header(PKT_SET_PARAM);
                        stream.write_u8(PARAM_READ_SIZE);
                        #[allow(clippy::cast_possible_truncation)] // <= WTP_OPSPEC_MAX
                        stream.write_u8(read_size as u8);
                        self.tx_ctrl.add_packet(stream.into_bytes());
                    }
                }
            }
        }
        self.request_access_spec(shared, now);
    }

    /// Earliest retransmit deadline among outstanding fragments.
    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.tx_ctrl.next_timeout()
    }

    /// Trips due retransmit timers; returns whether an AccessSpec should
    /// be scheduled.
    pub(crate) fn poll_timeout(&mut self, now: Instant) -> bool {
        self.tx_ctrl.poll_timeout(now)
    }

    /// Queues a message toward the tag; the waiter resolves once every
    /// byte is acknowledged.
    pub(crate) fn user_send<C: LlrpClient>(
        &mut self,
        msg: Bytes,
        done: oneshot::Sender<Result<(), WtpError>>,
        shared: &mut Shared<C>,
        now: Instant,
    ) {
        match self.tx_ctrl.add_msg(msg) {
            Ok(()) => {
                self.send_waiters.push_back(done);
                self.request_access_spec(shared, now);
            }
            Err(err) => {
                let _ = done.send(Err(err));
            }
        }
    }

    /// Claims the next reassembled message, or parks the waiter.
    pub(crate) fn user_recv(&mut self, done: oneshot::Sender<Bytes>) {
        if let Some(msg) = self.recv_msgs.pop_front() {
            if let Err(msg) = done.send(msg) {
                self.recv_msgs.push_front(msg);
            }
        } else {
            self.recv_waiters.push_back(done);
        }
    }

    /// Starts closing the downlink; the waiter resolves when the peer
    /// acknowledges the close.
    pub(crate) fn user_close<C: LlrpClient>(
        &mut self,
        done: oneshot::Sender<Result<(), WtpError>>,
        shared: &mut Shared<C>,
        now: Instant,
    ) {
        match self.downlink_state {
            LinkState::Closing => self.close_waiters.push(done),
            LinkState::Closed => {
                let _ = done.send(Err(WtpError::Already));
            }
            LinkState::Opening | LinkState::Opened => {
                self.downlink_state = LinkState::Closing;
                self.tx_ctrl.add_packet(build_header(PKT_CLOSE).into_bytes());
                self.close_waiters.push(done);
                self.request_access_spec(shared, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use wtp_llrp::{AccessRequest, report::RoAccessReport};

    use super::*;

    struct RecordingClient {
        submitted: Vec<AccessRequest>,
    }

    impl LlrpClient for RecordingClient {
        fn next_access(&mut self, access: AccessRequest) -> Result<(), WtpError> {
            self.submitted.push(access);
            Ok(())
        }

        async fn next_report(&mut self) -> Option<RoAccessReport> {
            None
        }
    }

    fn shared() -> (Shared<RecordingClient>, flume::Receiver<ServerEvent>) {
        let (event_tx, event_rx) = flume::unbounded();
        let client = RecordingClient {
            submitted: Vec::new(),
        };
        (Shared::new(client, event_tx), event_rx)
    }

    #[test]
    fn open_answers_with_ack_and_open() {
        let (mut shared, _events) = shared();
        let mut conn = WtpConnection::new(7);
        conn.handle_packet(Packet::Open, &mut shared, Instant::now());
        assert_eq!(conn.uplink_state, LinkState::Opened);
        assert_eq!(conn.downlink_state, LinkState::Opening);
        let access = assert_matches!(&shared.client.submitted[..], [access] => access);
        assert_eq!(access.access_spec_id, 7);
        assert_eq!(access.target.tag_data.as_ref(), &[0x07, 0x51]);
        // ACK(0) then OPEN, length-prefixed, padded and byte-swapped:
        // [06 03 00 00 03 01 01 00] on the host side
        let write = assert_matches!(&access.opspecs[..], [OpSpec::BlockWrite(write)] => write);
        assert_eq!(write.write_data.as_ref(), &[0x03, 0x06, 0x00, 0x00, 0x01, 0x03, 0x00, 0x01]);
    }

    #[test]
    fn scheduler_alternates_reads_and_writes_up_to_the_cap() {
        let (mut shared, _events) = shared();
        let mut conn = WtpConnection::new(1);
        let now = Instant::now();
        conn.handle_packet(Packet::Open, &mut shared, now);
        assert_eq!(shared.client.submitted.len(), 1);
        // queue data and reads while the first AccessSpec is in flight
        let (done, _pending) = oneshot::channel();
        conn.user_send(bytes::Bytes::from(vec![0x22; 100]), done, &mut shared, now);
        conn.handle_packet(
            Packet::ReqUplink {
                n_reads: 4,
                read_size: 24,
            },
            &mut shared,
            now,
        );
        assert_eq!(shared.client.submitted.len(), 1);
        // completing the cycle batches alternating Reads and BlockWrites
        conn.handle_opspec_results(
            vec![OpSpecResult {
                opspec_id: 0,
                result: 0,
                outcome: OpSpecOutcome::Write { words_written: 4 },
            }],
            &mut shared,
            now,
        );
        assert_eq!(shared.client.submitted.len(), 2);
        let access = &shared.client.submitted[1];
        assert_eq!(access.opspecs.len(), LLRP_N_OPSPECS_MAX);
        assert_matches!(access.opspecs[0], OpSpec::Read(_));
        assert_matches!(access.opspecs[1], OpSpec::BlockWrite(_));
        assert_matches!(access.opspecs[2], OpSpec::Read(_));
        assert_matches!(access.opspecs[3], OpSpec::BlockWrite(_));
    }

    #[test]
    fn set_param_updates_receive_window() {
        let (mut shared, _events) = shared();
        let mut conn = WtpConnection::new(1);
        conn.handle_packet(
            Packet::SetParam {
                param: Param::WindowSize(128),
            },
            &mut shared,
            Instant::now(),
        );
        assert_eq!(conn.rx_ctrl.window_size(), 128);
        // READ_SIZE only flows toward the tag; inbound it is rejected
        conn.handle_packet(
            Packet::SetParam {
                param: Param::ReadSize(20),
            },
            &mut shared,
            Instant::now(),
        );
        assert_eq!(conn.rx_ctrl.window_size(), 128);
    }
}
