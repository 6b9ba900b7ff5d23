//! `/api/guilds/*`: guild objects, channels, members, bans, roles.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::model::channel::ChannelKind;
use crate::model::guild::GuildEdit;
use crate::model::ids::*;
use crate::model::permissions::RoleEdit;

use super::{ApiError, Auth};
use crate::ChatState;

type AppState = State<Arc<ChatState>>;

#[derive(Deserialize)]
pub struct GuildCreateBody {
    pub name: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub icon: Option<String>,
}

fn default_region() -> String {
    "local".into()
}

/// `POST /guilds`
pub async fn create_guild(
    State(state): AppState,
    Auth(user): Auth,
    Json(body): Json<GuildCreateBody>,
) -> Result<Json<Value>, ApiError> {
    let guild = state.create_guild(&user, body.name, body.region, body.icon).await?;
    Ok(Json(guild))
}

/// `GET /guilds/{guild_id}`
pub async fn get_guild(
    State(state): AppState,
    Auth(user): Auth,
    Path(guild_id): Path<GuildId>,
) -> Result<Json<Value>, ApiError> {
    state.require_member(guild_id, user.id).await?;
    let guild = state.guild(guild_id).await.ok_or(ApiError::UnknownGuild)?;
    Ok(Json(state.guild_json(&guild, usize::MAX).await))
}

/// `PATCH /guilds/{guild_id}`
pub async fn edit_guild(
    State(state): AppState,
    Auth(user): Auth,
    Path(guild_id): Path<GuildId>,
    Json(edit): Json<GuildEdit>,
) -> Result<Json<Value>, ApiError> {
    let guild = state.edit_guild(&user, guild_id, edit).await?;
    Ok(Json(guild))
}

/// `DELETE /guilds/{guild_id}`
pub async fn delete_guild(
    State(state): AppState,
    Auth(user): Auth,
    Path(guild_id): Path<GuildId>,
) -> Result<StatusCode, ApiError> {
    state.delete_guild(&user, guild_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /guilds/{guild_id}/channels`
pub async fn get_channels(
    State(state): AppState,
    Auth(user): Auth,
    Path(guild_id): Path<GuildId>,
) -> Result<Json<Vec<Value>>, ApiError> {
    state.require_member(guild_id, user.id).await?;
    let channels = state.guild_channels(guild_id).await;
    let values = channels.iter()
        .map(serde_json::to_value)
        .collect::<Result<_, _>>()?;
    Ok(Json(values))
}

#[derive(Deserialize)]
pub struct ChannelCreateBody {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<ChannelKind>,
}

/// `POST /guilds/{guild_id}/channels`: owner-only.
pub async fn create_channel(
    State(state): AppState,
    Auth(user): Auth,
    Path(guild_id): Path<GuildId>,
    Json(body): Json<ChannelCreateBody>,
) -> Result<Json<Value>, ApiError> {
    let kind = body.kind.unwrap_or(ChannelKind::Text);
    let channel = state.create_channel(&user, guild_id, body.name, kind).await?;
    Ok(Json(serde_json::to_value(&channel)?))
}

/// `GET /guilds/{guild_id}/members`
pub async fn get_members(
    State(state): AppState,
    Auth(user): Auth,
    Path(guild_id): Path<GuildId>,
) -> Result<Json<Vec<Value>>, ApiError> {
    state.require_member(guild_id, user.id).await?;
    let guild = state.guild(guild_id).await.ok_or(ApiError::UnknownGuild)?;

    let mut views = Vec::with_capacity(guild.member_count());
    for member in guild.members.iter() {
        if let Some(view) = state.member_view(member).await {
            views.push(serde_json::to_value(view)?);
        }
    }
    Ok(Json(views))
}

/// `GET /guilds/{guild_id}/members/{user_id}`
pub async fn get_member(
    State(state): AppState,
    Auth(user): Auth,
    Path((guild_id, user_id)): Path<(GuildId, UserId)>,
) -> Result<Json<Value>, ApiError> {
    state.require_member(guild_id, user.id).await?;
    let guild = state.guild(guild_id).await.ok_or(ApiError::UnknownGuild)?;
    let member = guild.members.get(user_id).ok_or(ApiError::UnknownMember)?;
    let view = state.member_view(member).await.ok_or(ApiError::UnknownUser)?;
    Ok(Json(serde_json::to_value(view)?))
}

#[derive(Deserialize)]
pub struct MemberEditBody {
    pub nick: Option<String>,
}

/// `PATCH /guilds/{guild_id}/members/{user_id}`
pub async fn edit_member(
    State(state): AppState,
    Auth(user): Auth,
    Path((guild_id, user_id)): Path<(GuildId, UserId)>,
    Json(body): Json<MemberEditBody>,
) -> Result<StatusCode, ApiError> {
    state.edit_member_nick(&user, guild_id, user_id, body.nick).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /guilds/{guild_id}/members/{user_id}`: kick, owner-only.
pub async fn kick_member(
    State(state): AppState,
    Auth(user): Auth,
    Path((guild_id, user_id)): Path<(GuildId, UserId)>,
) -> Result<StatusCode, ApiError> {
    let guild = state.guild(guild_id).await.ok_or(ApiError::UnknownGuild)?;
    if guild.owner_id != user.id {
        return Err(ApiError::MissingPermissions);
    }
    if user_id == guild.owner_id {
        return Err(ApiError::BadRequest("cannot kick the guild owner".into()));
    }
    state.remove_member(guild_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /guilds/{guild_id}/bans`
pub async fn get_bans(
    State(state): AppState,
    Auth(user): Auth,
    Path(guild_id): Path<GuildId>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let guild = state.guild(guild_id).await.ok_or(ApiError::UnknownGuild)?;
    if guild.owner_id != user.id {
        return Err(ApiError::MissingPermissions);
    }
    let mut bans = Vec::with_capacity(guild.bans.len());
    for user_id in &guild.bans {
        if let Some(banned) = state.public_user(*user_id).await {
            bans.push(serde_json::json!({ "user": banned }));
        }
    }
    Ok(Json(bans))
}

#[derive(Deserialize, Default)]
pub struct BanBody {
    #[serde(rename = "delete-message-days", alias = "delete_message_days")]
    pub delete_message_days: Option<u32>,
}

/// `PUT /guilds/{guild_id}/bans/{user_id}`: ban, owner-only. A day window
/// deletes that many days of the user's messages.
pub async fn ban_member(
    State(state): AppState,
    Auth(user): Auth,
    Path((guild_id, user_id)): Path<(GuildId, UserId)>,
    body: Option<Json<BanBody>>,
) -> Result<StatusCode, ApiError> {
    let days = body.and_then(|Json(body)| body.delete_message_days);
    state.ban_user(&user, guild_id, user_id, days).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /guilds/{guild_id}/bans/{user_id}`
pub async fn unban_member(
    State(state): AppState,
    Auth(user): Auth,
    Path((guild_id, user_id)): Path<(GuildId, UserId)>,
) -> Result<StatusCode, ApiError> {
    state.unban_user(&user, guild_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PATCH /guilds/{guild_id}/roles/{role_id}`: owner-only.
pub async fn edit_role(
    State(state): AppState,
    Auth(user): Auth,
    Path((guild_id, role_id)): Path<(GuildId, RoleId)>,
    Json(edit): Json<RoleEdit>,
) -> Result<Json<Value>, ApiError> {
    let role = state.edit_role(&user, guild_id, role_id, edit).await?;
    Ok(Json(serde_json::to_value(role)?))
}
