//! The LLRP side of the WISP Transmission Protocol.
//!
//! WTP does not speak LLRP itself; it rides on a reader client library that
//! runs inventory, delivers tag reports, and executes AccessSpecs. This
//! crate holds everything that crosses that seam:
//!
//! * [`opspec`] - builders for the Read/BlockWrite OpSpecs, the
//!   WISP-targeting tag spec, and the AccessSpec stop trigger
//! * [`report`] - the slice of the RO access report model WTP consumes
//! * [`client`] - the [`LlrpClient`](client::LlrpClient) trait the server
//!   is generic over; tests substitute a scripted implementation

pub mod client;
pub mod opspec;
pub mod report;

pub use client::{AccessRequest, LlrpClient};
