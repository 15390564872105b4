//! See [`WtpServer`].

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use futures::channel::oneshot;
use tracing::{debug, trace};
use web_time::Instant;

use wtp_llrp::{
    AccessRequest, LlrpClient,
    opspec::{OpSpec, RFID_EPC_SIZE, RFID_WISP_CLASS, access_stop_param, wisp_target_info},
    report::{OpSpecOutcome, RoAccessReport},
};
use wtp_proto::{WtpError, checksum::ChecksumStream, packet::Packet};

use crate::{LinkState, ServerEvent, WispId, connection::WtpConnection};

/// Depth of the per-WISP seen-EPC history used for deduplication.
pub(crate) const WTP_PREV_EPC_SIZE: usize = 3;

/// Error returned by [`ConnectionHandle`] and [`ServerHandle`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    /// The server loop is no longer running.
    #[error("server stopped")]
    ServerStopped,
    /// The connection was removed before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,
    /// The protocol rejected the operation.
    #[error(transparent)]
    Wtp(#[from] WtpError),
}

/// State shared between the dispatch loop and the connection handlers:
/// the reader seam, the one-AccessSpec-per-WISP ledger, and the event
/// channel.
pub(crate) struct Shared<C> {
    pub(crate) client: C,
    pending_access: AHashSet<WispId>,
    event_tx: flume::Sender<ServerEvent>,
}

impl<C: LlrpClient> Shared<C> {
    pub(crate) fn new(client: C, event_tx: flume::Sender<ServerEvent>) -> Self {
        Self {
            client,
            pending_access: AHashSet::new(),
            event_tx,
        }
    }

    pub(crate) fn emit(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Submits an AccessSpec for this WISP to the reader.
    ///
    /// # Errors
    ///
    /// [`WtpError::OngoingAccessSpec`] while one is already pending, or
    /// whatever the client reports for the submission itself.
    pub(crate) fn send_access_spec(
        &mut self,
        wisp_id: WispId,
        opspecs: Vec<OpSpec>,
    ) -> Result<(), WtpError> {
        if !self.pending_access.insert(wisp_id) {
            return Err(WtpError::OngoingAccessSpec);
        }
        let request = AccessRequest {
            // the WISP ID doubles as the AccessSpec ID
            access_spec_id: u32::from(wisp_id),
            stop: access_stop_param(),
            opspecs,
            target: wisp_target_info(wisp_id),
        };
        self.client.next_access(request).inspect_err(|_| {
            self.pending_access.remove(&wisp_id);
        })
    }
}

enum Command {
    Send {
        wisp_id: WispId,
        msg: Bytes,
        done: oneshot::Sender<Result<(), WtpError>>,
    },
    Recv {
        wisp_id: WispId,
        done: oneshot::Sender<Bytes>,
    },
    Close {
        wisp_id: WispId,
        done: oneshot::Sender<Result<(), WtpError>>,
    },
    LinkStates {
        wisp_id: WispId,
        done: oneshot::Sender<Option<(LinkState, LinkState)>>,
    },
    Stop,
}

/// The WTP server: bridges one LLRP reader to per-WISP connections.
///
/// The server is a single cooperative task. [`run`](WtpServer::run) owns
/// every connection and the reader seam; it wakes on tag reports, on user
/// commands from the handles, and on retransmit deadlines. Nothing here
/// takes a lock - invariants hold between awaits, not within them.
pub struct WtpServer<C> {
    shared: Shared<C>,
    connections: AHashMap<WispId, WtpConnection>,
    /// Per-WISP history of recently seen EPC values. Inventory reports the
    /// same standing EPC payload every round; only a change carries new
    /// packets.
    prev_epcs: AHashMap<WispId, VecDeque<[u8; RFID_EPC_SIZE]>>,
    cmd_tx: flume::Sender<Command>,
    cmd_rx: flume::Receiver<Command>,
}

/// Cloneable entry point to a running [`WtpServer`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    cmd_tx: flume::Sender<Command>,
    event_rx: flume::Receiver<ServerEvent>,
}

/// Cloneable handle to one WISP's connection on a running [`WtpServer`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    wisp_id: WispId,
    cmd_tx: flume::Sender<Command>,
}

enum Wake {
    Report(Option<RoAccessReport>),
    Command(Option<Command>),
    Timeout,
}

fn now() -> Instant {
    // source time from the tokio clock so paused-clock tests stay coherent
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        }
        None => std::future::pending().await,
    }
}

impl<C: LlrpClient> WtpServer<C> {
    /// Creates a server over a reader client, returning the server and the
    /// handle callers use to reach it.
    #[must_use]
    pub fn new(client: C) -> (Self, ServerHandle) {
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        let server = Self {
            shared: Shared::new(client, event_tx),
            connections: AHashMap::new(),
            prev_epcs: AHashMap::new(),
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
        };
        let handle = ServerHandle { cmd_tx, event_rx };
        (server, handle)
    }

    /// Runs the dispatch loop until the reader connection ends or
    /// [`ServerHandle::stop`] is called.
    pub async fn run(mut self) {
        debug!("WTP server running");
        loop {
            let deadline = self
                .connections
                .values()
                .filter_map(WtpConnection::next_timeout)
                .min();
            let wake = tokio::select! {
                report = self.shared.client.next_report() => Wake::Report(report),
                cmd = self.cmd_rx.recv_async() => Wake::Command(cmd.ok()),
                () = sleep_until(deadline) => Wake::Timeout,
            };
            match wake {
                Wake::Report(Some(report)) => self.handle_tag_report(report),
                Wake::Report(None) => {
                    debug!("reader connection ended");
                    break;
                }
                Wake::Command(Some(Command::Stop)) | Wake::Command(None) => break,
                Wake::Command(Some(cmd)) => self.handle_command(cmd),
                Wake::Timeout => self.handle_timeouts(),
            }
        }
    }

    fn handle_tag_report(&mut self, report: RoAccessReport) {
        let now = now();
        for tag_report in report.tag_reports {
            let Some(epc) = tag_report.epc_bytes() else {
                continue;
            };
            let (wisp_id, wisp_class) = (epc[0], epc[1]);
            if wisp_class != RFID_WISP_CLASS {
                continue;
            }
            let prev_epcs = self.prev_epcs.entry(wisp_id).or_default();
            if !prev_epcs.contains(&epc) {
                trace!(wisp = wisp_id, epc = %tag_report.epc_96, "new EPC");
                if prev_epcs.len() == WTP_PREV_EPC_SIZE {
                    prev_epcs.pop_front();
                }
                prev_epcs.push_back(epc);
                self.handle_packets(&epc[2..], wisp_id, now);
            }
            if tag_report.opspec_results.is_empty() {
                continue;
            }
            // the in-flight AccessSpec for this WISP has completed
            if self.shared.pending_access.remove(&wisp_id) {
                if let Some(conn) = self.connections.get_mut(&wisp_id) {
                    conn.handle_opspec_results(
                        tag_report.opspec_results.clone(),
                        &mut self.shared,
                        now,
                    );
                }
            }
            // successful Reads carry uplink packet streams
            for result in &tag_report.opspec_results {
                if let OpSpecOutcome::Read { data } = &result.outcome {
                    if result.succeeded() && !data.is_empty() {
                        self.handle_packets(data, wisp_id, now);
                    }
                }
            }
        }
    }

    /// Parses a zero-terminated packet stream and dispatches each packet
    /// into the WISP's connection, creating it lazily on OPEN.
    fn handle_packets(&mut self, data: &[u8], wisp_id: WispId, now: Instant) {
        let mut stream = ChecksumStream::from_bytes(data.to_vec());
        loop {
            let packet = match Packet::read_from(&mut stream) {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(err) => {
                    debug!(wisp = wisp_id, %err, "dropping packet stream");
                    break;
                }
            };
            if packet == Packet::Open && !self.connections.contains_key(&wisp_id) {
                debug!(wisp = wisp_id, "new connection");
                self.connections.insert(wisp_id, WtpConnection::new(wisp_id));
                self.shared.emit(ServerEvent::Connected(ConnectionHandle {
                    wisp_id,
                    cmd_tx: self.cmd_tx.clone(),
                }));
            }
            let Some(conn) = self.connections.get_mut(&wisp_id) else {
                // nothing after this packet can be meaningful without a
                // connection
                trace!(wisp = wisp_id, "packet without connection");
                break;
            };
            conn.handle_packet(packet, &mut self.shared, now);
            if conn.fully_closed() {
                debug!(wisp = wisp_id, "connection closed");
                self.connections.remove(&wisp_id);
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        let now = now();
        match cmd {
            Command::Send { wisp_id, msg, done } => {
                if let Some(conn) = self.connections.get_mut(&wisp_id) {
                    conn.user_send(msg, done, &mut self.shared, now);
                }
            }
            Command::Recv { wisp_id, done } => {
                if let Some(conn) = self.connections.get_mut(&wisp_id) {
                    conn.user_recv(done);
                }
            }
            Command::Close { wisp_id, done } => {
                if let Some(conn) = self.connections.get_mut(&wisp_id) {
                    conn.user_close(done, &mut self.shared, now);
                }
            }
            Command::LinkStates { wisp_id, done } => {
                let states = self
                    .connections
                    .get(&wisp_id)
                    .map(|conn| (conn.uplink_state, conn.downlink_state));
                let _ = done.send(states);
            }
            Command::Stop => {}
        }
    }

    fn handle_timeouts(&mut self) {
        let now = now();
        for conn in self.connections.values_mut() {
            if conn.poll_timeout(now) {
                conn.request_access_spec(&mut self.shared, now);
            }
        }
    }
}

impl ServerHandle {
    /// Waits for the next connection lifecycle event. Returns [`None`]
    /// once the server has stopped.
    pub async fn next_event(&self) -> Option<ServerEvent> {
        self.event_rx.recv_async().await.ok()
    }

    /// Handle to the connection of a known WISP. Operations on an unknown
    /// WISP fail with [`HandleError::ConnectionClosed`].
    #[must_use]
    pub fn connection(&self, wisp_id: WispId) -> ConnectionHandle {
        ConnectionHandle {
            wisp_id,
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Stops the server loop.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }
}

impl ConnectionHandle {
    /// The WISP this handle talks to.
    #[must_use]
    pub const fn wisp_id(&self) -> WispId {
        self.wisp_id
    }

    /// Sends a message to the WISP, completing once the peer has
    /// acknowledged every byte.
    ///
    /// # Errors
    ///
    /// [`HandleError::Wtp`] if the message cannot go on the wire,
    /// [`HandleError::ConnectionClosed`] / [`HandleError::ServerStopped`]
    /// if the connection or server goes away first.
    pub async fn send(&self, msg: impl Into<Bytes>) -> Result<(), HandleError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                wisp_id: self.wisp_id,
                msg: msg.into(),
                done,
            })
            .map_err(|_| HandleError::ServerStopped)?;
        match rx.await {
            Ok(result) => Ok(result?),
            Err(oneshot::Canceled) => Err(HandleError::ConnectionClosed),
        }
    }

    /// Receives the next message from the WISP.
    ///
    /// # Errors
    ///
    /// [`HandleError::ConnectionClosed`] / [`HandleError::ServerStopped`]
    /// if the connection or server goes away first.
    pub async fn recv(&self) -> Result<Bytes, HandleError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Recv {
                wisp_id: self.wisp_id,
                done,
            })
            .map_err(|_| HandleError::ServerStopped)?;
        rx.await.map_err(|_| HandleError::ConnectionClosed)
    }

    /// Closes the downlink, completing once the peer acknowledges.
    ///
    /// # Errors
    ///
    /// [`WtpError::Already`] (as [`HandleError::Wtp`]) if the downlink is
    /// already closed, [`HandleError::ConnectionClosed`] /
    /// [`HandleError::ServerStopped`] if the connection or server goes
    /// away first.
    pub async fn close(&self) -> Result<(), HandleError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Close {
                wisp_id: self.wisp_id,
                done,
            })
            .map_err(|_| HandleError::ServerStopped)?;
        match rx.await {
            Ok(result) => Ok(result?),
            Err(oneshot::Canceled) => Err(HandleError::ConnectionClosed),
        }
    }

    /// Current `(uplink, downlink)` states of the connection.
    ///
    /// # Errors
    ///
    /// [`HandleError::ConnectionClosed`] if the WISP has no connection,
    /// [`HandleError::ServerStopped`] if the server is gone.
    pub async fn link_states(&self) -> Result<(LinkState, LinkState), HandleError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::LinkStates {
                wisp_id: self.wisp_id,
                done,
            })
            .map_err(|_| HandleError::ServerStopped)?;
        match rx.await {
            Ok(Some(states)) => Ok(states),
            Ok(None) => Err(HandleError::ConnectionClosed),
            Err(oneshot::Canceled) => Err(HandleError::ServerStopped),
        }
    }
}
