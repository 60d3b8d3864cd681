use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use parley_types::events::RelayEvent;
use parley_types::model::PresenceEntry;

/// Handle to one live connection session: the session's targeted-event
/// channel plus a connection id. The id is what `release` compares
/// against, so a late disconnect from a superseded session never
/// evicts a newer binding for the same identity.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<RelayEvent>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            tx,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Best-effort delivery: a closed session channel is a silent drop.
    pub fn send(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }
}

struct PresenceRecord {
    handle: ConnectionHandle,
    avatar: Option<String>,
    /// Registration order; kept on re-announce so snapshot order stays
    /// stable across broadcasts.
    seq: u64,
}

struct Registry {
    records: HashMap<String, PresenceRecord>,
    next_seq: u64,
}

/// In-memory identity -> live-connection mapping. Holds no external
/// resources and is rebuilt empty on every relay restart; the only
/// side effect of mutation is the snapshot broadcast.
#[derive(Clone)]
pub struct PresenceDirectory {
    inner: Arc<DirectoryInner>,
}

struct DirectoryInner {
    /// Snapshot broadcasts go to every connected session, announced or
    /// not, so a freshly connected client sees who is online before it
    /// announces.
    broadcast_tx: broadcast::Sender<RelayEvent>,
    registry: RwLock<Registry>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DirectoryInner {
                broadcast_tx,
                registry: RwLock::new(Registry {
                    records: HashMap::new(),
                    next_seq: 0,
                }),
            }),
        }
    }

    /// Subscribe to directory snapshots. Every session subscribes once
    /// at connection time.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Register or overwrite the presence record for `identity` and
    /// broadcast the new snapshot. Always succeeds; a re-announce
    /// replaces the handle and avatar in place (last connection wins,
    /// with no eviction notice to the displaced session).
    pub async fn announce(&self, identity: &str, avatar: Option<String>, handle: ConnectionHandle) {
        {
            let mut registry = self.inner.registry.write().await;
            let seq = match registry.records.get(identity) {
                Some(existing) => existing.seq,
                None => {
                    let seq = registry.next_seq;
                    registry.next_seq += 1;
                    seq
                }
            };
            registry
                .records
                .insert(identity.to_string(), PresenceRecord { handle, avatar, seq });
        }
        debug!("{} announced", identity);
        self.broadcast_snapshot().await;
    }

    /// Current handle for `identity`, or None if offline. Never blocks
    /// beyond the registry lock.
    pub async fn lookup(&self, identity: &str) -> Option<ConnectionHandle> {
        self.inner
            .registry
            .read()
            .await
            .records
            .get(identity)
            .map(|record| record.handle.clone())
    }

    /// Remove the record bound to `conn_id`, if any, and broadcast the
    /// snapshot. A connection that was superseded by a rebind (or never
    /// announced) matches nothing and this is a no-op.
    pub async fn release(&self, conn_id: Uuid) {
        let removed = {
            let mut registry = self.inner.registry.write().await;
            let identity = registry
                .records
                .iter()
                .find(|(_, record)| record.handle.conn_id == conn_id)
                .map(|(identity, _)| identity.clone());
            if let Some(identity) = &identity {
                registry.records.remove(identity);
            }
            identity
        };

        if let Some(identity) = removed {
            debug!("{} released", identity);
            self.broadcast_snapshot().await;
        }
    }

    /// Ordered list of `{identity, avatar}`, registration order.
    pub async fn snapshot(&self) -> Vec<PresenceEntry> {
        let registry = self.inner.registry.read().await;
        let mut entries: Vec<(u64, PresenceEntry)> = registry
            .records
            .iter()
            .map(|(identity, record)| {
                (
                    record.seq,
                    PresenceEntry {
                        identity: identity.clone(),
                        avatar: record.avatar.clone(),
                    },
                )
            })
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    async fn broadcast_snapshot(&self) {
        let users = self.snapshot().await;
        let _ = self
            .inner
            .broadcast_tx
            .send(RelayEvent::DirectorySnapshot { users });
    }
}

impl Default for PresenceDirectory {
    fn default() -> Self {
        Self::new()
    }
}
