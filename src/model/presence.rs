use serde::{Deserialize, Serialize};

use crate::model::ids::*;
use crate::model::user::PublicUser;

/// A user's availability as shown to other members.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Idle,
    Dnd,
    Offline,
}

impl Default for Status {
    fn default() -> Self {
        Self::Online
    }
}

/// What the user is currently playing/streaming, if anything.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Game {
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A user's merged presence. One of these exists per user; the per-guild
/// wire form is derived by attaching a guild id at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub status: Status,
    pub game: Game,
}

impl Default for Presence {
    fn default() -> Self {
        Self {
            status: Status::Online,
            game: Game::default(),
        }
    }
}

/// Partial presence data from a STATUS_UPDATE op or an IDENTIFY. Missing
/// fields keep their current value; the most recent update wins.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct PresenceUpdateRequest {
    pub status: Option<Status>,
    pub game: Option<Game>,
}

impl Presence {
    pub fn offline() -> Self {
        Self {
            status: Status::Offline,
            game: Game::default(),
        }
    }

    /// Merge an update over this presence, most-recent-wins.
    pub fn merge(&mut self, update: PresenceUpdateRequest) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(game) = update.game {
            self.game = game;
        }
    }
}

/// The wire form of a presence, scoped to one guild.
#[derive(Serialize, Debug, Clone)]
pub struct PresenceView {
    pub user: PublicUser,
    pub guild_id: GuildId,
    pub roles: Vec<RoleId>,
    pub game: Game,
    pub status: Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_unspecified_fields() {
        let mut presence = Presence {
            status: Status::Online,
            game: Game { name: Some("chess".into()), kind: 0, url: None },
        };
        presence.merge(PresenceUpdateRequest { status: Some(Status::Idle), game: None });
        assert_eq!(presence.status, Status::Idle);
        assert_eq!(presence.game.name.as_deref(), Some("chess"));
    }

    #[test]
    fn latest_update_wins() {
        let mut presence = Presence::default();
        presence.merge(PresenceUpdateRequest { status: Some(Status::Dnd), game: None });
        presence.merge(PresenceUpdateRequest { status: Some(Status::Idle), game: None });
        assert_eq!(presence.status, Status::Idle);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Dnd).unwrap(), "\"dnd\"");
        let back: Status = serde_json::from_str("\"idle\"").unwrap();
        assert_eq!(back, Status::Idle);
    }
}
