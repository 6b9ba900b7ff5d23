//! The presence tracker: one merged presence per user, queried per guild.
//!
//! Emission (PRESENCE_UPDATE per guild the user is in) lives on
//! [`ChatState`](crate::ChatState), which owns the guild containers; this
//! module owns the stored state and the merge rule.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::model::ids::UserId;
use crate::model::presence::{Presence, PresenceUpdateRequest, Status};

#[derive(Default)]
pub struct PresenceTracker {
    presences: RwLock<HashMap<UserId, Presence>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The user's current presence; users with no stored presence are
    /// offline.
    pub async fn get(&self, user_id: UserId) -> Presence {
        self.presences
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_else(Presence::offline)
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.presences
            .read()
            .await
            .get(&user_id)
            .map_or(false, |presence| presence.status != Status::Offline)
    }

    /// Merge an update over the user's presence and return the result.
    /// Missing fields default the user to online (the IDENTIFY path).
    /// Most recent update wins; connections do not vote.
    pub async fn merge(&self, user_id: UserId, update: PresenceUpdateRequest) -> Presence {
        let mut presences = self.presences.write().await;
        let presence = presences.entry(user_id).or_default();
        presence.merge(update);
        presence.clone()
    }

    /// Drop the user's stored presence (final disconnect) and return the
    /// offline presence to broadcast.
    pub async fn clear(&self, user_id: UserId) -> Presence {
        self.presences.write().await.remove(&user_id);
        Presence::offline()
    }
}

#[cfg(test)]
mod tests {
    use crate::model::presence::Game;

    use super::*;

    #[tokio::test]
    async fn unknown_user_is_offline() {
        let tracker = PresenceTracker::new();
        assert_eq!(tracker.get(UserId(1)).await.status, Status::Offline);
        assert!(!tracker.is_online(UserId(1)).await);
    }

    #[tokio::test]
    async fn identify_defaults_to_online() {
        let tracker = PresenceTracker::new();
        let merged = tracker.merge(UserId(1), PresenceUpdateRequest::default()).await;
        assert_eq!(merged.status, Status::Online);
        assert!(tracker.is_online(UserId(1)).await);
    }

    #[tokio::test]
    async fn most_recent_update_wins_across_connections() {
        let tracker = PresenceTracker::new();
        // connection A identifies, connection B goes dnd, A's game persists
        tracker
            .merge(UserId(1), PresenceUpdateRequest {
                status: None,
                game: Some(Game { name: Some("chess".into()), kind: 0, url: None }),
            })
            .await;
        let merged = tracker
            .merge(UserId(1), PresenceUpdateRequest { status: Some(Status::Dnd), game: None })
            .await;
        assert_eq!(merged.status, Status::Dnd);
        assert_eq!(merged.game.name.as_deref(), Some("chess"));
    }

    #[tokio::test]
    async fn clear_goes_offline() {
        let tracker = PresenceTracker::new();
        tracker.merge(UserId(1), PresenceUpdateRequest::default()).await;
        let offline = tracker.clear(UserId(1)).await;
        assert_eq!(offline.status, Status::Offline);
        assert_eq!(tracker.get(UserId(1)).await.status, Status::Offline);
    }
}
