//! See [`WtpError`].

/// Protocol-level WTP error.
///
/// Every variant is fatal to the *current packet stream* only, never to the
/// process: the malformed bytes are dropped and the end-to-end ARQ layer is
/// the recovery mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WtpError {
    /// A packet's trailing checksum did not match its contents, or the
    /// stream ended before the checksum byte.
    #[error("invalid checksum")]
    InvalidChecksum,
    /// Unknown `SET_PARAM` code or an operation the peer does not support.
    #[error("unsupported operation")]
    UnsupportedOp,
    /// A builder was handed a size it cannot represent on the wire.
    #[error("invalid size")]
    InvalidSize,
    /// An AccessSpec was requested for a WISP that already has one in
    /// flight; the caller must back off until it completes.
    #[error("ongoing AccessSpec for this WISP")]
    OngoingAccessSpec,
    /// Reserved.
    #[error("busy")]
    Busy,
    /// Reserved.
    #[error("not acknowledged")]
    NotAcked,
    /// Reserved.
    #[error("invalid parameter")]
    InvalidParam,
    /// The requested state transition has already happened.
    #[error("already done")]
    Already,
}
