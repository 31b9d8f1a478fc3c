//! Connection events as seen by the consumer.

use crate::pipe::Segment;

/// Server-assigned connection identifier
pub type ConnectionId = u32;

/// What happened on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Data,
    Disconnected,
}

/// One event read off a connection
///
/// `Connected` and `Disconnected` never carry a payload; `Data` always does.
#[derive(Debug, Clone)]
pub struct Message {
    pub connection_id: ConnectionId,
    pub kind: EventKind,
    pub payload: Option<Segment>,
}

impl Message {
    pub fn connected(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            kind: EventKind::Connected,
            payload: None,
        }
    }

    pub fn data(connection_id: ConnectionId, payload: Segment) -> Self {
        Self {
            connection_id,
            kind: EventKind::Data,
            payload: Some(payload),
        }
    }

    pub fn disconnected(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            kind: EventKind::Disconnected,
            payload: None,
        }
    }

    /// Payload bytes, empty for connection edge events
    pub fn bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }
}
