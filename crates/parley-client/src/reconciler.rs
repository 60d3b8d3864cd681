use std::collections::{BTreeMap, HashMap};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use parley_store::{MessageStore, StoreResult};
use parley_types::events::ClientSignal;
use parley_types::model::{Message, MessageBody};

/// Client-side reconciliation over the durable store's full change
/// feed. Derives the active conversation view and per-peer unread
/// counts, and issues seen/edit/delete/reaction mutations back to the
/// store. This is how a recipient that was offline at send time still
/// receives the message after reconnecting: everything is re-derived
/// from the store, not from live delivery.
pub struct Reconciler<S: MessageStore> {
    store: S,
    identity: String,
    /// Outbound ephemeral signals towards the relay (the live path).
    signals: mpsc::UnboundedSender<ClientSignal>,
    selected_peer: Option<String>,
    conversation: Vec<(String, Message)>,
    unread: HashMap<String, usize>,
}

impl<S: MessageStore> Reconciler<S> {
    pub fn new(
        store: S,
        identity: impl Into<String>,
        signals: mpsc::UnboundedSender<ClientSignal>,
    ) -> Self {
        Self {
            store,
            identity: identity.into(),
            signals,
            selected_peer: None,
            conversation: Vec::new(),
            unread: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The derived view for the currently selected peer: key/message
    /// pairs, timestamp ascending.
    pub fn conversation(&self) -> &[(String, Message)] {
        &self.conversation
    }

    pub fn unread_count(&self, peer: &str) -> usize {
        self.unread.get(peer).copied().unwrap_or(0)
    }

    /// Send a message: write it to the store (system of record) and
    /// emit the live-path signal in parallel. The two are not ordered
    /// with respect to each other; live delivery is best-effort only.
    pub async fn send(&mut self, to: &str, timestamp: i64, body: MessageBody) -> StoreResult<String> {
        let message = Message::new(self.identity.clone(), to, timestamp, body.clone());
        let _ = self.signals.send(ClientSignal::SendMessage {
            from: self.identity.clone(),
            to: to.to_string(),
            timestamp,
            body,
        });
        let key = self.store.append(message).await?;
        self.refresh().await?;
        Ok(key)
    }

    /// Re-read the collection and re-derive the view and unread
    /// counts. Called on every change-feed tick.
    pub async fn refresh(&mut self) -> StoreResult<()> {
        let snapshot = self.store.snapshot().await?;
        self.conversation = match &self.selected_peer {
            Some(peer) => conversation_view(&snapshot, &self.identity, peer),
            None => Vec::new(),
        };
        self.unread = unread_counts(&snapshot, &self.identity);
        Ok(())
    }

    /// Select a peer: one-shot read, derive the view, mark every
    /// inbound unseen message as seen in the store, then tell the peer
    /// over the live path so their ticks update in near-real-time.
    /// Offline peers pick the flag up from the store on their next
    /// read.
    pub async fn select_peer(&mut self, peer: &str) -> StoreResult<()> {
        self.selected_peer = Some(peer.to_string());
        let snapshot = self.store.snapshot().await?;
        let view = conversation_view(&snapshot, &self.identity, peer);

        let mut marked = 0usize;
        for (key, message) in &view {
            if message.to == self.identity && !message.seen {
                self.store.set_seen(key).await?;
                marked += 1;
            }
        }
        if marked > 0 {
            debug!("marked {} messages from {} as seen", marked, peer);
        }

        let _ = self.signals.send(ClientSignal::Seen {
            from: self.identity.clone(),
            to: peer.to_string(),
        });

        self.refresh().await
    }

    /// Replace a message's body in place. Ownership enforcement is a
    /// store-side authorization concern.
    pub async fn edit(&mut self, key: &str, text: impl Into<String>) -> StoreResult<()> {
        self.store.set_body(key, MessageBody::text(text.into())).await?;
        self.refresh().await
    }

    /// Logical delete: the body becomes the tombstone, the record and
    /// its position in the conversation stay. Idempotent.
    pub async fn delete(&mut self, key: &str) -> StoreResult<()> {
        self.store.set_body(key, MessageBody::tombstone()).await?;
        self.refresh().await
    }

    /// Toggle own membership in one reaction kind's identity set and
    /// write the whole set back. Last-writer-wins at the field level;
    /// two identities toggling the same kind concurrently can race.
    pub async fn toggle_reaction(&mut self, key: &str, kind: &str) -> StoreResult<()> {
        let snapshot = self.store.snapshot().await?;
        let message = snapshot
            .get(key)
            .ok_or_else(|| parley_store::StoreError::NotFound(key.to_string()))?;

        let mut users = message.reactions.get(kind).cloned().unwrap_or_default();
        if !users.remove(&self.identity) {
            users.insert(self.identity.clone());
        }
        self.store.set_reactions(key, kind, users).await?;
        self.refresh().await
    }

    /// Drive reconciliation off the change feed until the store side
    /// closes. Each tick re-derives everything from a fresh snapshot.
    /// A failed refresh is logged and retried on the next tick; a
    /// transient store outage must not end reconciliation for good.
    pub async fn run(&mut self) {
        let mut feed = self.store.subscribe();
        loop {
            if feed.changed().await.is_err() {
                return;
            }
            if let Err(e) = self.refresh().await {
                warn!("refresh failed, retrying on next change: {}", e);
            }
        }
    }
}

/// The subsequence of messages between `me` and `peer` (either
/// direction), ordered by timestamp ascending. Derived, never stored.
pub fn conversation_view(
    snapshot: &BTreeMap<String, Message>,
    me: &str,
    peer: &str,
) -> Vec<(String, Message)> {
    let mut view: Vec<(String, Message)> = snapshot
        .iter()
        .filter(|(_, message)| message.is_between(me, peer))
        .map(|(key, message)| (key.clone(), message.clone()))
        .collect();
    view.sort_by_key(|(_, message)| message.timestamp);
    view
}

/// Unseen inbound messages grouped by sender.
pub fn unread_counts(snapshot: &BTreeMap<String, Message>, me: &str) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for message in snapshot.values() {
        if message.to == me && !message.seen {
            *counts.entry(message.from.clone()).or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::sync::watch;

    use parley_store::memory::MemoryStore;

    use super::*;

    fn reconciler(
        store: MemoryStore,
        identity: &str,
    ) -> (Reconciler<MemoryStore>, mpsc::UnboundedReceiver<ClientSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Reconciler::new(store, identity, tx), rx)
    }

    async fn seed(store: &MemoryStore, from: &str, to: &str, timestamp: i64, text: &str) -> String {
        store
            .append(Message::new(from, to, timestamp, MessageBody::text(text)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn view_filters_to_the_pair_and_sorts_by_time() {
        let store = MemoryStore::new();
        seed(&store, "bob", "alice", 30, "third").await;
        seed(&store, "alice", "bob", 10, "first").await;
        seed(&store, "carol", "alice", 20, "unrelated").await;
        seed(&store, "alice", "bob", 20, "second").await;

        let snapshot = store.snapshot().await.unwrap();
        let view = conversation_view(&snapshot, "alice", "bob");
        let texts: Vec<&str> = view
            .iter()
            .map(|(_, m)| match &m.body {
                MessageBody::Text { text } => text.as_str(),
                MessageBody::Attachment { .. } => "<attachment>",
            })
            .collect();
        assert_eq!(texts, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn unread_counts_group_by_sender() {
        let store = MemoryStore::new();
        seed(&store, "bob", "alice", 1, "one").await;
        seed(&store, "bob", "alice", 2, "two").await;
        seed(&store, "carol", "alice", 3, "three").await;
        // Outbound and already-seen messages never count.
        seed(&store, "alice", "bob", 4, "mine").await;
        let seen = seed(&store, "bob", "alice", 5, "old").await;
        store.set_seen(&seen).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        let counts = unread_counts(&snapshot, "alice");
        assert_eq!(counts.get("bob"), Some(&2));
        assert_eq!(counts.get("carol"), Some(&1));
    }

    #[tokio::test]
    async fn select_peer_marks_inbound_seen_and_signals_the_peer() {
        let store = MemoryStore::new();
        let inbound = seed(&store, "bob", "alice", 1, "hi").await;
        let outbound = seed(&store, "alice", "bob", 2, "hello").await;

        let (mut alice, mut signals) = reconciler(store.clone(), "alice");
        alice.select_peer("bob").await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert!(snapshot[&inbound].seen);
        // Own messages are not marked by the reader.
        assert!(!snapshot[&outbound].seen);
        assert_eq!(alice.unread_count("bob"), 0);

        match signals.recv().await.unwrap() {
            ClientSignal::Seen { from, to } => {
                assert_eq!(from, "alice");
                assert_eq!(to, "bob");
            }
            other => panic!("unexpected signal: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_appends_and_emits_the_live_signal() {
        let store = MemoryStore::new();
        let (mut alice, mut signals) = reconciler(store.clone(), "alice");

        let key = alice.send("bob", 42, MessageBody::text("hi")).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        let record = &snapshot[&key];
        assert!(record.delivered);
        assert!(!record.seen);

        assert!(matches!(
            signals.recv().await,
            Some(ClientSignal::SendMessage { .. })
        ));
    }

    #[tokio::test]
    async fn double_toggle_is_idempotent_at_the_boundary() {
        let store = MemoryStore::new();
        let key = seed(&store, "bob", "alice", 1, "hi").await;
        let (mut alice, _signals) = reconciler(store.clone(), "alice");

        alice.toggle_reaction(&key, "❤️").await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        assert!(snapshot[&key].reactions["❤️"].contains("alice"));

        alice.toggle_reaction(&key, "❤️").await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        assert!(snapshot[&key].reactions.is_empty());
    }

    #[tokio::test]
    async fn toggles_by_different_identities_accumulate() {
        let store = MemoryStore::new();
        let key = seed(&store, "bob", "alice", 1, "hi").await;
        let (mut alice, _a) = reconciler(store.clone(), "alice");
        let (mut bob, _b) = reconciler(store.clone(), "bob");

        alice.toggle_reaction(&key, "👍").await.unwrap();
        bob.toggle_reaction(&key, "👍").await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        let users = &snapshot[&key].reactions["👍"];
        assert_eq!(users.len(), 2);
        assert!(users.contains("alice") && users.contains("bob"));
    }

    #[tokio::test]
    async fn delete_is_logical_and_idempotent() {
        let store = MemoryStore::new();
        let key = seed(&store, "alice", "bob", 9, "typo").await;
        let (mut alice, _signals) = reconciler(store.clone(), "alice");
        alice.selected_peer = Some("bob".into());

        alice.delete(&key).await.unwrap();
        alice.delete(&key).await.unwrap();

        let (view_key, record) = &alice.conversation()[0];
        assert_eq!(view_key, &key);
        assert!(record.body.is_tombstone());
        assert_eq!(record.timestamp, 9);
    }

    #[tokio::test]
    async fn edit_replaces_body_in_place() {
        let store = MemoryStore::new();
        let key = seed(&store, "alice", "bob", 3, "helo").await;
        let (mut alice, _signals) = reconciler(store.clone(), "alice");

        alice.edit(&key, "hello").await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot[&key].body, MessageBody::text("hello"));
        assert_eq!(snapshot[&key].timestamp, 3);
    }

    /// Delegates to a real store but fails the next snapshot once when
    /// armed, standing in for a transient backend outage.
    struct FlakyStore {
        inner: MemoryStore,
        fail_next: Arc<AtomicBool>,
    }

    impl MessageStore for FlakyStore {
        async fn append(&self, message: Message) -> StoreResult<String> {
            self.inner.append(message).await
        }

        async fn snapshot(&self) -> StoreResult<BTreeMap<String, Message>> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(parley_store::StoreError::NotFound("outage".into()));
            }
            self.inner.snapshot().await
        }

        async fn set_seen(&self, key: &str) -> StoreResult<()> {
            self.inner.set_seen(key).await
        }

        async fn set_body(&self, key: &str, body: MessageBody) -> StoreResult<()> {
            self.inner.set_body(key, body).await
        }

        async fn set_reactions(
            &self,
            key: &str,
            kind: &str,
            users: BTreeSet<String>,
        ) -> StoreResult<()> {
            self.inner.set_reactions(key, kind, users).await
        }

        fn subscribe(&self) -> watch::Receiver<u64> {
            self.inner.subscribe()
        }
    }

    #[tokio::test]
    async fn transient_refresh_failure_does_not_stop_the_feed_loop() {
        let store = MemoryStore::new();
        let fail_next = Arc::new(AtomicBool::new(true));
        let (tx, _signals) = mpsc::unbounded_channel();
        let mut bob = Reconciler::new(
            FlakyStore {
                inner: store.clone(),
                fail_next: fail_next.clone(),
            },
            "bob",
            tx,
        );

        let driver = async {
            // Let the feed loop subscribe before the first change.
            tokio::task::yield_now().await;
            // First change hits the armed failure.
            seed(&store, "alice", "bob", 1, "one").await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            // The loop must still be alive to pick this one up.
            seed(&store, "alice", "bob", 2, "two").await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        tokio::select! {
            _ = bob.run() => panic!("feed loop ended while the store was open"),
            _ = driver => {}
        }

        // The armed failure was consumed, and the later change still
        // made it into the derived state.
        assert!(!fail_next.load(Ordering::SeqCst));
        assert_eq!(bob.unread_count("alice"), 2);
    }

    #[tokio::test]
    async fn offline_recipient_catches_up_from_the_store() {
        // Scenario: bob was offline when alice sent. No live delivery
        // ever happened, but the record is in the store; when bob's
        // client comes up and selects alice, the view includes the
        // message and bob issues the seen mutation.
        let store = MemoryStore::new();
        let key = seed(&store, "alice", "bob", 100, "you there?").await;

        let (mut bob, _signals) = reconciler(store.clone(), "bob");
        bob.refresh().await.unwrap();
        assert_eq!(bob.unread_count("alice"), 1);

        bob.select_peer("alice").await.unwrap();
        assert_eq!(bob.conversation().len(), 1);
        assert!(store.snapshot().await.unwrap()[&key].seen);
        assert_eq!(bob.unread_count("alice"), 0);
    }
}
