use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Sentinel body of a logically deleted message. The record itself is
/// never removed from the store.
pub const TOMBSTONE: &str = "[deleted]";

/// Directory entry broadcast to every connected session after a
/// presence change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// A message carries exactly one of a text body or an attachment
/// reference. The variant is decided once, at construction — readers
/// match on it instead of probing for fields.
///
/// Untagged on the wire: an `attachment_url` field marks an attachment
/// (checked first, so an attachment with a caption never parses as
/// plain text), a `text` field marks a text body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Attachment {
        attachment_url: String,
        /// Optional caption sent alongside the attachment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Text { text: String },
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn attachment(url: impl Into<String>, caption: Option<String>) -> Self {
        Self::Attachment {
            attachment_url: url.into(),
            caption,
        }
    }

    /// The body a deleted message is replaced with.
    pub fn tombstone() -> Self {
        Self::Text {
            text: TOMBSTONE.to_string(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Text { text } if text == TOMBSTONE)
    }
}

/// A durable message record as held by the store. Owned by the store
/// once appended; identified by an opaque store-assigned key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: String,
    pub to: String,
    /// Epoch milliseconds, assigned by the sending client.
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default)]
    pub seen: bool,
    /// reaction kind -> set of reacting identities. An identity appears
    /// at most once per kind.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, BTreeSet<String>>,
}

impl Message {
    /// Canonical record for a fresh send: delivered is recorded
    /// optimistically with the append, seen starts false.
    pub fn new(from: impl Into<String>, to: impl Into<String>, timestamp: i64, body: MessageBody) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            timestamp,
            body,
            delivered: true,
            seen: false,
            reactions: BTreeMap::new(),
        }
    }

    /// True if this message belongs to the conversation between `a` and
    /// `b`, in either direction.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.from == a && self.to == b) || (self.from == b && self.to == a)
    }
}
