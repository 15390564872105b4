//! See [`ServerEvent`].

use crate::{WispId, server::ConnectionHandle};

/// Connection lifecycle event, delivered through
/// [`ServerHandle::next_event`](crate::ServerHandle::next_event).
#[derive(Debug)]
pub enum ServerEvent {
    /// A previously unknown WISP opened a connection. Emitted before the
    /// OPEN packet is processed, so the handle observes every subsequent
    /// message.
    Connected(ConnectionHandle),
    /// The peer closed its uplink while our downlink is still open.
    HalfClosed(WispId),
    /// Both half-links are closed; the connection is gone.
    Closed(WispId),
}
