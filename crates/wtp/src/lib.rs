//! Server core of the WISP Transmission Protocol (WTP).
//!
//! WTP turns an LLRP reader into a packet bearer between a host and a
//! fleet of WISP tags: routine inventory reports carry the uplink inside
//! the 96-bit EPC field, while Read and BlockWrite OpSpecs move bulk data
//! in both directions through the USER memory bank.
//!
//! [`WtpServer`] owns the reader seam and demultiplexes tag reports into
//! per-WISP connections; each connection runs the sliding-window
//! reliability engines from [`wtp_proto`] and schedules at most one
//! AccessSpec at a time. Everything runs on one cooperative reactor task;
//! callers interact through [`ServerHandle`] and [`ConnectionHandle`],
//! whose operations complete when the protocol does.
//!
//! ```no_run
//! # async fn run(client: impl wtp_llrp::LlrpClient + 'static) {
//! use wtp::{ServerEvent, WtpServer};
//!
//! let (server, handle) = WtpServer::new(client);
//! tokio::task::spawn_local(server.run());
//!
//! while let Some(event) = handle.next_event().await {
//!     if let ServerEvent::Connected(conn) = event {
//!         let msg = conn.recv().await.unwrap();
//!         conn.send(msg).await.unwrap();
//!     }
//! }
//! # }
//! ```

mod connection;
mod event;
mod server;

pub use connection::LinkState;
pub use event::ServerEvent;
pub use server::{ConnectionHandle, HandleError, ServerHandle, WtpServer};
pub use wtp_proto::WtpError;

/// Identifier of a WISP: the first byte of its EPC field.
pub type WispId = u8;
