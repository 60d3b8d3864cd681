use serde::{Deserialize, Serialize};

use crate::model::{MessageBody, PresenceEntry};

/// Signals sent FROM client TO relay over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientSignal {
    /// Bind this connection to an identity. Always succeeds; a later
    /// announce for the same identity silently replaces the binding.
    AnnounceIdentity {
        identity: String,
        #[serde(default)]
        avatar: Option<String>,
    },

    /// Route a point-to-point message to `to` if reachable. The durable
    /// write is a separate, client-initiated store append — the relay
    /// never persists.
    SendMessage {
        from: String,
        to: String,
        timestamp: i64,
        body: MessageBody,
    },

    /// Typing state change. No debouncing; callers pair start/stop.
    Typing {
        from: String,
        to: String,
        is_typing: bool,
    },

    /// Notify `to` that `from` has read their messages.
    Seen { from: String, to: String },
}

/// Events sent FROM relay TO clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RelayEvent {
    /// Full presence snapshot, sent to every session after any
    /// directory change. Order is registration order, stable across
    /// broadcasts.
    DirectorySnapshot { users: Vec<PresenceEntry> },

    /// Live copy of a routed message, delivered best-effort to the
    /// recipient's current connection.
    MessageReceived {
        from: String,
        to: String,
        timestamp: i64,
        body: MessageBody,
    },

    /// Best-effort acknowledgement back to the sender; drives the
    /// optimistic "sent" indicator.
    MessageDelivered { recipient: String, timestamp: i64 },

    /// Ephemeral typing indicator.
    Typing { from: String, is_typing: bool },

    /// Ephemeral read notification.
    Seen { from: String },
}
