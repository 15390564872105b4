//! Sans-IO core of the WISP Transmission Protocol (WTP).
//!
//! WTP is a reliable, bidirectional, message-oriented transport layered on
//! top of the EPC Gen-2 air interface, using the 96-bit EPC field as an
//! implicit uplink channel and LLRP Read/BlockWrite payloads as a bulk
//! bidirectional channel between a WISP tag and the host.
//!
//! This crate holds everything that does not touch a reader:
//!
//! * [`seq`] - wrapping 16-bit sequence arithmetic with anchored ordering
//! * [`checksum`] - the checksum-framed byte stream used by every packet
//! * [`packet`] - the wire codec
//! * [`send`] / [`recv`] - the sliding-window reliability engines
//! * [`sizing`] - adaptive Read/BlockWrite payload sizing
//!
//! The controllers never perform IO and never take a lock; they are driven
//! by a caller that owns the clock and the reader connection.

pub mod checksum;
pub mod error;
pub mod packet;
pub mod recv;
pub mod send;
pub mod seq;
pub mod sizing;

pub use error::WtpError;
