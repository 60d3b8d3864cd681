use tracing::trace;

use parley_types::events::RelayEvent;
use parley_types::model::MessageBody;

use crate::directory::PresenceDirectory;

/// Transient, non-persisted signal kinds. Forwarded to the recipient's
/// current connection or dropped silently; never buffered.
#[derive(Debug, Clone)]
pub enum EphemeralSignal {
    Typing { is_typing: bool },
    Seen,
}

/// Routes point-to-point messages and ephemeral signals through the
/// presence directory. Purely a low-latency notification path: the
/// durable write is a parallel, client-initiated store append that this
/// router neither performs nor waits for.
#[derive(Clone)]
pub struct DeliveryRouter {
    directory: PresenceDirectory,
}

impl DeliveryRouter {
    pub fn new(directory: PresenceDirectory) -> Self {
        Self { directory }
    }

    /// Forward the canonical message record to the recipient and a
    /// delivery acknowledgement to the sender, each only if currently
    /// reachable. At-most-once, no retry, no queue; an absent peer is
    /// the expected offline steady state, not an error.
    pub async fn route(&self, from: &str, to: &str, timestamp: i64, body: MessageBody) {
        if let Some(recipient) = self.directory.lookup(to).await {
            recipient.send(RelayEvent::MessageReceived {
                from: from.to_string(),
                to: to.to_string(),
                timestamp,
                body,
            });
        } else {
            trace!("{} offline, live delivery skipped", to);
        }

        if let Some(sender) = self.directory.lookup(from).await {
            sender.send(RelayEvent::MessageDelivered {
                recipient: to.to_string(),
                timestamp,
            });
        }
    }

    /// Forward an ephemeral signal to `to`'s current connection, or
    /// drop it silently. No acknowledgement, no ordering guarantee
    /// across kinds.
    pub async fn relay(&self, from: &str, to: &str, signal: EphemeralSignal) {
        let Some(recipient) = self.directory.lookup(to).await else {
            trace!("{} offline, {} signal dropped", to, signal_kind(&signal));
            return;
        };

        let event = match signal {
            EphemeralSignal::Typing { is_typing } => RelayEvent::Typing {
                from: from.to_string(),
                is_typing,
            },
            EphemeralSignal::Seen => RelayEvent::Seen {
                from: from.to_string(),
            },
        };
        recipient.send(event);
    }
}

fn signal_kind(signal: &EphemeralSignal) -> &'static str {
    match signal {
        EphemeralSignal::Typing { .. } => "typing",
        EphemeralSignal::Seen => "seen",
    }
}
