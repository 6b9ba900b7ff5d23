use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::*;
use crate::model::channel::ChannelKind;
use crate::model::user::PublicUser;

/// An invite to a channel. Codes are short opaque strings, unique at
/// issuance by retry-on-collision.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Invite {
    /// the invite code
    pub code: String,
    /// the channel this invite points at
    pub channel_id: ChannelId,
    /// the user who created the invite
    pub inviter_id: UserId,
    /// when the invite stops working; `None` means it never expires
    pub expires_at: Option<DateTime<Utc>>,
    /// remaining uses; `-1` means unlimited
    pub uses: i32,
    /// whether membership granted through this invite is temporary
    #[serde(default)]
    pub temporary: bool,
}

impl Invite {
    /// Whether the invite can still be used at `now`.
    pub fn valid(&self, now: DateTime<Utc>) -> bool {
        if let Some(expiry) = self.expires_at {
            if now > expiry {
                return false;
            }
        }
        self.uses == -1 || self.uses > 0
    }

    /// Consume one use. Returns false without mutating if the invite is
    /// already spent or expired.
    pub fn consume(&mut self, now: DateTime<Utc>) -> bool {
        if !self.valid(now) {
            return false;
        }
        if self.uses > 0 {
            self.uses -= 1;
        }
        true
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expiry| now > expiry)
    }
}

/// The body of `POST /channels/{id}/invites`.
#[derive(Deserialize, Debug)]
pub struct InviteCreateBody {
    /// lifetime in seconds; 0 means the invite never expires
    #[serde(default)]
    pub max_age: u64,
    /// total uses; 0 means unlimited
    #[serde(default)]
    pub max_uses: i32,
    #[serde(default)]
    pub temporary: bool,
}

/// The wire form of an invite: code plus partial guild/channel/inviter
/// objects.
#[derive(Serialize, Debug, Clone)]
pub struct InviteView {
    pub code: String,
    pub guild: InviteGuild,
    pub channel: InviteChannel,
    pub inviter: PublicUser,
    pub uses: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub temporary: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct InviteGuild {
    pub id: GuildId,
    pub name: String,
    pub icon: Option<String>,
    pub splash: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct InviteChannel {
    pub id: ChannelId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
}
