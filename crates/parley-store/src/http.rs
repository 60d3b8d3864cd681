use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use parley_types::model::{Message, MessageBody};

use crate::{MessageStore, StoreError, StoreResult};

/// How often the change feed re-reads the collection when the backend
/// offers no push channel.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// REST client for a realtime-document-store backend (Firebase-style
/// API: `POST /<collection>.json` appends and returns the assigned
/// key, `PATCH /<path>.json` merges fields, `GET /<collection>.json`
/// reads everything).
///
/// The change feed is an interval poll over the full collection. Fine
/// at two-party-chat scale; a scalability ceiling, not a bug.
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    version_tx: watch::Sender<u64>,
    /// Keeps the poll loop alive for the store's lifetime even before
    /// the first subscriber shows up.
    _feed_keepalive: watch::Receiver<u64>,
}

#[derive(Debug, serde::Deserialize)]
struct AppendReply {
    /// The store-assigned key of the appended record.
    name: String,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_poll_interval(base_url, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(base_url: impl Into<String>, poll_interval: Duration) -> Self {
        let base_url = base_url.into();
        let client = reqwest::Client::new();
        let (version_tx, _) = watch::channel(0);

        spawn_poll_loop(
            client.clone(),
            collection_url(&base_url),
            poll_interval,
            version_tx.clone(),
        );

        let _feed_keepalive = version_tx.subscribe();
        Self {
            client,
            base_url,
            version_tx,
            _feed_keepalive,
        }
    }

    fn collection_url(&self) -> String {
        collection_url(&self.base_url)
    }

    fn record_url(&self, key: &str) -> String {
        format!("{}/messages/{}.json", self.base_url.trim_end_matches('/'), key)
    }

    async fn patch(&self, url: &str, body: serde_json::Value) -> StoreResult<()> {
        let response = self.client.patch(url).json(&body).send().await?;
        check_status(response)?;
        Ok(())
    }
}

fn collection_url(base_url: &str) -> String {
    format!("{}/messages.json", base_url.trim_end_matches('/'))
}

/// Build the merge patch that replaces a message body wholesale. PATCH
/// merges field by field and null deletes, so the other variant's
/// fields must be nulled explicitly: otherwise tombstoning an
/// attachment would leave its `attachment_url` behind and the record
/// would still read back as an attachment.
fn body_patch(body: &MessageBody) -> StoreResult<serde_json::Value> {
    let mut patch = serde_json::json!({
        "text": serde_json::Value::Null,
        "attachment_url": serde_json::Value::Null,
        "caption": serde_json::Value::Null,
    });
    let fields = serde_json::to_value(body)?;
    if let (Some(patch_map), Some(field_map)) = (patch.as_object_mut(), fields.as_object()) {
        for (name, value) in field_map {
            patch_map.insert(name.clone(), value.clone());
        }
    }
    Ok(patch)
}

fn check_status(response: reqwest::Response) -> StoreResult<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(StoreError::Status(response.status()))
    }
}

fn spawn_poll_loop(
    client: reqwest::Client,
    url: String,
    poll_interval: Duration,
    version_tx: watch::Sender<u64>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        let mut last_body: Option<String> = None;

        loop {
            ticker.tick().await;
            // Stop polling once every subscriber is gone.
            if version_tx.is_closed() {
                return;
            }

            let body = match client.get(&url).send().await {
                Ok(response) if response.status().is_success() => response.text().await.ok(),
                Ok(response) => {
                    warn!("change-feed poll returned {}", response.status());
                    None
                }
                Err(e) => {
                    warn!("change-feed poll failed: {}", e);
                    None
                }
            };

            let Some(body) = body else { continue };
            if last_body.as_deref() != Some(body.as_str()) {
                debug!("message collection changed");
                last_body = Some(body);
                version_tx.send_modify(|version| *version += 1);
            }
        }
    });
}

impl MessageStore for HttpStore {
    async fn append(&self, message: Message) -> StoreResult<String> {
        let response = self
            .client
            .post(self.collection_url())
            .json(&message)
            .send()
            .await?;
        let reply: AppendReply = check_status(response)?.json().await?;
        Ok(reply.name)
    }

    async fn snapshot(&self) -> StoreResult<BTreeMap<String, Message>> {
        let response = self.client.get(self.collection_url()).send().await?;
        // An empty collection reads back as JSON null.
        let records: Option<BTreeMap<String, Message>> = check_status(response)?.json().await?;
        Ok(records.unwrap_or_default())
    }

    async fn set_seen(&self, key: &str) -> StoreResult<()> {
        self.patch(&self.record_url(key), serde_json::json!({ "seen": true }))
            .await
    }

    async fn set_body(&self, key: &str, body: MessageBody) -> StoreResult<()> {
        self.patch(&self.record_url(key), body_patch(&body)?).await
    }

    async fn set_reactions(
        &self,
        key: &str,
        kind: &str,
        users: BTreeSet<String>,
    ) -> StoreResult<()> {
        // Patching the reactions subtree keeps other kinds intact; an
        // empty set deletes the kind (null removes the field).
        let value = if users.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::to_value(&users)?
        };
        let url = format!(
            "{}/messages/{}/reactions.json",
            self.base_url.trim_end_matches('/'),
            key
        );
        self.patch(&url, serde_json::json!({ kind: value })).await
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }
}
