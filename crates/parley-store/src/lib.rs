pub mod http;
pub mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use tokio::sync::watch;

use parley_types::model::{Message, MessageBody};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("message not found: {0}")]
    NotFound(String),

    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("invalid store payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Contract of the external durable message collection: append-only,
/// key-addressed, with per-key partial updates and a full-collection
/// change feed. There is no query-by-filter — consumers read the whole
/// collection and filter client-side, which bounds this design to
/// small total message volumes.
pub trait MessageStore {
    /// Append a message; returns the opaque store-assigned key.
    fn append(&self, message: Message) -> impl Future<Output = StoreResult<String>>;

    /// One-shot read of the full keyed collection.
    fn snapshot(&self) -> impl Future<Output = StoreResult<BTreeMap<String, Message>>>;

    /// Mark a persisted message as seen by its recipient. Set-once in
    /// practice; re-setting is harmless.
    fn set_seen(&self, key: &str) -> impl Future<Output = StoreResult<()>>;

    /// Replace a message's body in place. Used for edits and for the
    /// logical-delete tombstone; the record and its timestamp stay.
    fn set_body(&self, key: &str, body: MessageBody) -> impl Future<Output = StoreResult<()>>;

    /// Write back the full identity set for one reaction kind.
    /// Field-level last-writer-wins: concurrent toggles on the same
    /// kind can overwrite each other.
    fn set_reactions(
        &self,
        key: &str,
        kind: &str,
        users: BTreeSet<String>,
    ) -> impl Future<Output = StoreResult<()>>;

    /// Change feed: the receiver's value bumps on every collection
    /// change. Subscribers re-read the snapshot and re-derive views.
    fn subscribe(&self) -> watch::Receiver<u64>;
}
