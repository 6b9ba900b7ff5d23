use serde::{Deserialize, Serialize, Serializer};
use serde::de::Error as _;
use serde_json::Value;

use crate::model::ids::*;
pub use crate::model::ids::ChannelId;

/// Most pinned messages a single text channel can carry.
pub const MAX_PINS: usize = 50;

pub const MIN_BITRATE: u32 = 8000;
pub const MAX_BITRATE: u32 = 96_000;
pub const MAX_USER_LIMIT: u32 = 99;

serde_repr! {
    /// The numeric `type` tag on the wire form of a channel.
    pub enum ChannelKind: u8 {
        Text = 0,
        Voice = 2,
    }
}

/// A guild channel. The variant decides which operations apply: messages and
/// pins only exist on [`Text`](Self::Text), bitrate and user limits only on
/// [`Voice`](Self::Voice).
#[derive(Debug, Clone)]
pub enum Channel {
    Text(TextChannel),
    Voice(VoiceChannel),
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TextChannel {
    pub id: ChannelId,
    pub guild_id: GuildId,
    pub name: String,
    pub position: i32,
    /// channel topic, empty by default
    #[serde(default)]
    pub topic: String,
    /// id of the most recent message, if any
    pub last_message_id: Option<MessageId>,
    /// pinned message ids, oldest pin first
    #[serde(default)]
    pub pins: Vec<MessageId>,
}

obj_id_impl!(TextChannel => ChannelId);

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct VoiceChannel {
    pub id: ChannelId,
    pub guild_id: GuildId,
    pub name: String,
    pub position: i32,
    pub bitrate: u32,
    /// 0 means unlimited
    pub user_limit: u32,
}

obj_id_impl!(VoiceChannel => ChannelId);

impl Channel {
    pub const fn kind(&self) -> ChannelKind {
        match self {
            Self::Text(_) => ChannelKind::Text,
            Self::Voice(_) => ChannelKind::Voice,
        }
    }

    pub const fn channel_id(&self) -> ChannelId {
        match self {
            Self::Text(t) => t.id,
            Self::Voice(v) => v.id,
        }
    }

    pub const fn guild_id(&self) -> GuildId {
        match self {
            Self::Text(t) => t.guild_id,
            Self::Voice(v) => v.guild_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Text(t) => &t.name,
            Self::Voice(v) => &v.name,
        }
    }

    pub const fn text(&self) -> Option<&TextChannel> {
        match self {
            Self::Text(text) => Some(text),
            Self::Voice(_) => None,
        }
    }

    pub fn text_mut(&mut self) -> Option<&mut TextChannel> {
        match self {
            Self::Text(text) => Some(text),
            Self::Voice(_) => None,
        }
    }
}

impl Id for Channel {
    type Id = ChannelId;

    fn id(&self) -> ChannelId {
        self.channel_id()
    }
}

// The wire form carries a numeric `type` tag next to the variant's own
// fields, so (de)serialization goes through a mediator with every field
// optional, like the gateway's frame mediator.
#[derive(Deserialize)]
struct RawChannel {
    #[serde(rename = "type")]
    kind: ChannelKind,
    #[serde(flatten)]
    rest: Value,
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let RawChannel { kind, rest } = RawChannel::deserialize(d)?;
        match kind {
            ChannelKind::Text => serde_json::from_value(rest)
                .map(Self::Text)
                .map_err(D::Error::custom),
            ChannelKind::Voice => serde_json::from_value(rest)
                .map(Self::Voice)
                .map_err(D::Error::custom),
        }
    }
}

impl Serialize for Channel {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Shim<'a, T> {
            #[serde(rename = "type")]
            kind: ChannelKind,
            #[serde(flatten)]
            t: &'a T,
        }

        match self {
            Self::Text(t) => Shim { kind: ChannelKind::Text, t }.serialize(s),
            Self::Voice(v) => Shim { kind: ChannelKind::Voice, t: v }.serialize(s),
        }
    }
}

/// Edit payload for text channels (`PATCH /channels/{id}` on a text channel).
#[derive(Deserialize, Debug)]
pub struct TextChannelEdit {
    pub name: Option<String>,
    pub position: Option<i32>,
    pub topic: Option<String>,
}

/// Edit payload for voice channels.
#[derive(Deserialize, Debug)]
pub struct VoiceChannelEdit {
    pub name: Option<String>,
    pub position: Option<i32>,
    pub bitrate: Option<u32>,
    pub user_limit: Option<u32>,
}

pub fn valid_channel_name(name: &str) -> bool {
    (2..=100).contains(&name.chars().count())
}

impl TextChannelEdit {
    pub fn validate(&self) -> bool {
        self.name.as_deref().map_or(true, valid_channel_name)
            && self.topic.as_ref().map_or(true, |t| t.chars().count() <= 1024)
    }
}

impl VoiceChannelEdit {
    pub fn validate(&self) -> bool {
        self.name.as_deref().map_or(true, valid_channel_name)
            && self.bitrate.map_or(true, |b| (MIN_BITRATE..=MAX_BITRATE).contains(&b))
            && self.user_limit.map_or(true, |l| l <= MAX_USER_LIMIT)
    }
}
