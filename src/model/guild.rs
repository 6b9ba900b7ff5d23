use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::IdMap;
use crate::model::ids::*;
pub use crate::model::ids::GuildId;
use crate::model::permissions::Role;
use crate::model::user::PublicUser;

/// A guild: an isolated collection of members, channels and roles.
///
/// Channels live in the server's flat channel container and point back here
/// through `guild_id`; the guild itself only aggregates membership, roles,
/// bans, and the *viewer set* — the user ids currently subscribed to this
/// guild's live event stream.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Guild {
    /// guild id
    pub id: GuildId,
    /// guild name
    pub name: String,
    /// id of the owner; the owner is always a member
    pub owner_id: UserId,
    /// voice region id, carried but unused
    pub region: String,
    /// icon hash
    pub icon: Option<String>,
    /// splash hash
    pub splash: Option<String>,
    /// enabled guild features
    #[serde(default)]
    pub features: Vec<String>,
    /// ids of every member
    #[serde(default)]
    pub member_ids: HashSet<UserId>,
    /// member records; every id in `member_ids` resolves to one of these
    #[serde(default)]
    pub members: IdMap<Member>,
    /// roles; the role sharing the guild's id is `@everyone`
    #[serde(default)]
    pub roles: IdMap<Role>,
    /// ids of banned users
    #[serde(default)]
    pub bans: HashSet<UserId>,
    /// user ids subscribed to this guild's live events; not persisted
    #[serde(skip)]
    pub viewers: HashSet<UserId>,
}

obj_id_impl!(Guild => GuildId);

impl Guild {
    pub fn member_count(&self) -> usize {
        self.member_ids.len()
    }

    /// Guilds past this size only stream online members on READY.
    pub fn large(&self) -> bool {
        self.member_count() > 250
    }

    pub fn is_member<I: Id<Id=UserId>>(&self, user: I) -> bool {
        self.member_ids.contains(&user.id())
    }

    /// Mark a user id as a viewer of this guild, so guild dispatch reaches
    /// its connections.
    pub fn mark_viewer(&mut self, user_id: UserId) {
        if self.viewers.insert(user_id) {
            log::debug!("[guild:{}] marked {} as viewer", self.id, user_id);
        }
    }

    pub fn unmark_viewer(&mut self, user_id: UserId) {
        if self.viewers.remove(&user_id) {
            log::debug!("[guild:{}] unmarked {} as viewer", self.id, user_id);
        }
    }

    pub fn everyone_role(&self) -> Option<&Role> {
        self.roles.get(RoleId(self.id.0))
    }
}

/// The (guild, user) relationship. Exists iff the user id is in
/// `guild.member_ids`.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Member {
    /// the member's user id; doubles as the member's id inside the guild
    #[serde(rename = "user_id")]
    pub id: UserId,
    /// the guild this membership belongs to
    pub guild_id: GuildId,
    /// per-guild nickname
    pub nick: Option<String>,
    /// when the user joined the guild
    pub joined_at: DateTime<Utc>,
    /// whether the member is deafened in voice channels
    #[serde(default)]
    pub deaf: bool,
    /// whether the member is muted in voice channels
    #[serde(default)]
    pub mute: bool,
    /// ids of the roles this member holds, `@everyone` excluded
    #[serde(default)]
    pub roles: Vec<RoleId>,
}

obj_id_impl!(Member => UserId);

/// A member as it appears on the wire: the member record plus the resolved
/// public user object.
#[derive(Serialize, Debug, Clone)]
pub struct MemberView {
    pub user: PublicUser,
    pub nick: Option<String>,
    pub roles: Vec<RoleId>,
    pub joined_at: DateTime<Utc>,
    pub deaf: bool,
    pub mute: bool,
    /// present on events that are not already scoped to a guild
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<GuildId>,
}

impl Member {
    pub fn view(&self, user: PublicUser) -> MemberView {
        MemberView {
            user,
            nick: self.nick.clone(),
            roles: self.roles.clone(),
            joined_at: self.joined_at,
            deaf: self.deaf,
            mute: self.mute,
            guild_id: None,
        }
    }
}

/// The edit payload accepted by `PATCH /guilds/{guild_id}`.
#[derive(Deserialize, Debug)]
pub struct GuildEdit {
    pub name: Option<String>,
    pub region: Option<String>,
    pub icon: Option<String>,
    pub splash: Option<String>,
    pub owner_id: Option<UserId>,
}

impl GuildEdit {
    pub fn validate(&self) -> bool {
        self.name.as_ref().map_or(true, |n| {
            let len = n.trim().chars().count();
            (2..=100).contains(&len)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guild() -> Guild {
        let mut members = IdMap::default();
        members.insert(Member {
            id: UserId(1),
            guild_id: GuildId(9),
            nick: None,
            joined_at: Utc::now(),
            deaf: false,
            mute: false,
            roles: vec![],
        });
        Guild {
            id: GuildId(9),
            name: "testers".into(),
            owner_id: UserId(1),
            region: "local".into(),
            icon: None,
            splash: None,
            features: vec![],
            member_ids: [UserId(1)].into_iter().collect(),
            members,
            roles: [Role::everyone(GuildId(9))].into_iter().collect(),
            bans: HashSet::new(),
            viewers: HashSet::new(),
        }
    }

    #[test]
    fn member_ids_and_members_agree() {
        let guild = guild();
        for id in &guild.member_ids {
            assert!(guild.members.get(*id).is_some());
        }
    }

    #[test]
    fn viewer_set_is_not_persisted() {
        let mut guild = guild();
        guild.mark_viewer(UserId(1));
        let json = serde_json::to_value(&guild).unwrap();
        assert!(json.get("viewers").is_none());
        let back: Guild = serde_json::from_value(json).unwrap();
        assert!(back.viewers.is_empty());
        assert!(back.is_member(UserId(1)));
    }

    #[test]
    fn viewer_marking_is_idempotent() {
        let mut guild = guild();
        guild.mark_viewer(UserId(1));
        guild.mark_viewer(UserId(1));
        assert_eq!(guild.viewers.len(), 1);
        guild.unmark_viewer(UserId(1));
        guild.unmark_viewer(UserId(1));
        assert!(guild.viewers.is_empty());
    }
}
