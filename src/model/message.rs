use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::ids::*;
pub use crate::model::ids::MessageId;
use crate::model::user::PublicUser;

/// Longest allowed message content, in characters.
pub const MAX_CONTENT_LEN: usize = 2000;

/// Bulk-delete refuses messages older than this (14 days), in milliseconds.
pub const BULK_DELETE_MAX_AGE_MILLIS: u64 = 14 * 24 * 60 * 60 * 1000;

static USER_MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"<@!?(\d+)>").unwrap());

serde_repr! {
    pub enum MessageKind: u8 {
        Default = 0,
    }
}

/// A message in a text channel. The author is referenced by id; the wire
/// form resolves it through the server's user container.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Message {
    /// message id; creation time is embedded in it
    pub id: MessageId,
    /// the text channel this was sent in
    pub channel_id: ChannelId,
    /// id of the author
    pub author_id: UserId,
    /// message content
    pub content: String,
    /// set when the message has been edited
    pub edited_at: Option<DateTime<Utc>>,
    /// whether this message is pinned in its channel
    #[serde(default)]
    pub pinned: bool,
    /// ids of attached files
    #[serde(default)]
    pub attachments: Vec<AttachmentId>,
    /// user ids mentioned in `content`
    #[serde(default)]
    pub mentions: Vec<UserId>,
    /// client-supplied duplicate-suppression token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(rename = "type", default = "MessageKind::default_kind")]
    pub kind: MessageKind,
}

obj_id_impl!(Message => MessageId);

impl MessageKind {
    const fn default_kind() -> Self {
        Self::Default
    }
}

impl Message {
    pub fn created_at(&self) -> DateTime<Utc> {
        self.id.timestamp()
    }

    pub fn mentions_everyone(&self) -> bool {
        self.content.contains("@everyone")
    }

    /// Recompute the mention set after the content changed.
    pub fn refresh_mentions(&mut self) {
        self.mentions = extract_mentions(&self.content);
    }
}

/// The distinct user ids mentioned by `<@id>` / `<@!id>` markup, in order of
/// first appearance.
pub fn extract_mentions(content: &str) -> Vec<UserId> {
    let mut seen = Vec::new();
    for capture in USER_MENTION.captures_iter(content) {
        if let Ok(id) = capture[1].parse::<u64>() {
            let id = UserId(id);
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
    }
    seen
}

/// A message as clients see it: ids as strings, the author and mentions
/// resolved to user objects, timestamps explicit.
#[derive(Serialize, Debug, Clone)]
pub struct MessageView {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author: PublicUser,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub edited_timestamp: Option<DateTime<Utc>>,
    pub tts: bool,
    pub mention_everyone: bool,
    pub mentions: Vec<PublicUser>,
    pub mention_roles: Vec<RoleId>,
    pub attachments: Vec<AttachmentId>,
    pub embeds: Vec<serde_json::Value>,
    pub pinned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

/// The body of `POST /channels/{id}/messages`.
#[derive(Deserialize, Debug)]
pub struct MessageCreateBody {
    #[serde(default)]
    pub content: String,
    pub nonce: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentId>,
}

/// The body of `PATCH /channels/{id}/messages/{message_id}`.
#[derive(Deserialize, Debug)]
pub struct MessageEditBody {
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mentions_are_extracted_and_deduplicated() {
        let mentions = extract_mentions("hi <@123> and <@!456>, again <@123>");
        assert_eq!(mentions, vec![UserId(123), UserId(456)]);
    }

    #[test]
    fn no_mentions_in_plain_text() {
        assert!(extract_mentions("just some words @here").is_empty());
        assert!(extract_mentions("<@not_a_number>").is_empty());
    }

    #[test]
    fn mention_everyone_flag() {
        let mut message = Message {
            id: MessageId(1 << 11),
            channel_id: ChannelId(2),
            author_id: UserId(3),
            content: "hey @everyone".into(),
            edited_at: None,
            pinned: false,
            attachments: vec![],
            mentions: vec![],
            nonce: None,
            kind: MessageKind::Default,
        };
        assert!(message.mentions_everyone());
        message.content = "hey everyone".into();
        assert!(!message.mentions_everyone());
    }

    #[test]
    fn created_at_comes_from_the_id() {
        use crate::model::ids::{Snowflakes, snowflake_time};
        use crate::utils::Clock;

        let flakes = Snowflakes::new(Clock::new());
        let raw = flakes.generate_raw();
        let id = MessageId(raw);
        assert_eq!(id.timestamp(), snowflake_time(raw));
    }
}
