use serde::{Deserialize, Serialize};

use crate::model::ids::*;
pub use crate::model::ids::RoleId;

bitflags! {
    /// Permission bits carried by roles. The gateway core only stores and
    /// forwards these; fine-grained enforcement on channel operations is an
    /// extension point.
    pub struct Permissions: u64 {
        const CREATE_INSTANT_INVITE = 1 << 0;
        const KICK_MEMBERS = 1 << 1;
        const BAN_MEMBERS = 1 << 2;
        const ADMINISTRATOR = 1 << 3;
        const MANAGE_CHANNELS = 1 << 4;
        const MANAGE_GUILD = 1 << 5;
        const VIEW_CHANNEL = 1 << 10;
        const SEND_MESSAGES = 1 << 11;
        const MANAGE_MESSAGES = 1 << 13;
        const MENTION_EVERYONE = 1 << 17;
        const CONNECT = 1 << 20;
        const SPEAK = 1 << 21;
        const MUTE_MEMBERS = 1 << 22;
        const DEAFEN_MEMBERS = 1 << 23;
        const MANAGE_ROLES = 1 << 28;
    }
}
serde_bitflag!(Permissions: u64);

impl Default for Permissions {
    fn default() -> Self {
        Self::VIEW_CHANNEL | Self::SEND_MESSAGES | Self::CONNECT | Self::SPEAK
    }
}

/// A guild role. The role whose id equals the guild's id is the implicit
/// `@everyone` role every member holds.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Role {
    /// role id
    pub id: RoleId,
    /// the guild this role belongs to
    pub guild_id: GuildId,
    /// role name
    pub name: String,
    /// integer representation of a hex color
    pub color: u32,
    /// whether the role is pinned in the user listing
    pub hoist: bool,
    /// sorting position of the role
    pub position: i32,
    /// permission bit set
    pub permissions: Permissions,
    /// whether the role is managed by an integration
    pub managed: bool,
    /// whether the role can be mentioned
    pub mentionable: bool,
}

obj_id_impl!(Role => RoleId);

impl Role {
    pub fn everyone(guild_id: GuildId) -> Self {
        Self {
            id: RoleId(guild_id.0),
            guild_id,
            name: "@everyone".into(),
            color: 0,
            hoist: false,
            position: 0,
            permissions: Permissions::default(),
            managed: false,
            mentionable: false,
        }
    }

    pub fn is_everyone(&self) -> bool {
        self.id.0 == self.guild_id.0
    }
}

/// The edit payload accepted by `PATCH /guilds/{guild_id}/roles/{role_id}`.
#[derive(Deserialize, Debug)]
pub struct RoleEdit {
    pub name: Option<String>,
    pub color: Option<u32>,
    pub hoist: Option<bool>,
    pub position: Option<i32>,
    pub permissions: Option<Permissions>,
    pub mentionable: Option<bool>,
}

impl Role {
    pub fn apply(&mut self, edit: RoleEdit) {
        let RoleEdit { name, color, hoist, position, permissions, mentionable } = edit;
        // @everyone keeps its name no matter what the edit says
        if let Some(name) = name {
            if !self.is_everyone() {
                self.name = name;
            }
        }
        if let Some(color) = color { self.color = color; }
        if let Some(hoist) = hoist { self.hoist = hoist; }
        if let Some(position) = position { self.position = position; }
        if let Some(permissions) = permissions { self.permissions = permissions; }
        if let Some(mentionable) = mentionable { self.mentionable = mentionable; }
    }
}
