//! See [`LlrpClient`].

use wtp_proto::WtpError;

use crate::{
    opspec::{AccessSpecStopTrigger, OpSpec, TargetTag},
    report::RoAccessReport,
};

/// A request to execute a batch of OpSpecs against one WISP.
///
/// Corresponds to the reader client's "next access" slot: the reader holds
/// at most one of these at a time, retiring it per its stop trigger.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    /// AccessSpec ID; WTP uses the WISP ID.
    pub access_spec_id: u32,
    /// When the AccessSpec retires.
    pub stop: AccessSpecStopTrigger,
    /// OpSpecs to execute, in order.
    pub opspecs: Vec<OpSpec>,
    /// Which tag the OpSpecs run against.
    pub target: TargetTag,
}

/// The narrow seam to the LLRP reader client library.
///
/// The real implementation owns the TCP connection to the reader, keeps
/// inventory running, and turns `RO_ACCESS_REPORT` messages into
/// [`RoAccessReport`] values. Tests substitute a scripted client that
/// serves canned reports and records submitted [`AccessRequest`]s.
#[allow(async_fn_in_trait)] // consumed on a single-threaded reactor
pub trait LlrpClient {
    /// Submits an AccessSpec to the reader's next-access slot.
    ///
    /// # Errors
    ///
    /// Implementation-defined submission failures, surfaced as
    /// [`WtpError`]; the caller treats them as a dropped AccessSpec and
    /// relies on retransmission.
    fn next_access(&mut self, access: AccessRequest) -> Result<(), WtpError>;

    /// Waits for the next tag report.
    ///
    /// Returns [`None`] once the reader connection is gone. The returned
    /// future must be cancel-safe: the server polls it inside a `select!`
    /// loop and may drop it between reports.
    async fn next_report(&mut self) -> Option<RoAccessReport>;
}
