//! `/api/users/*`: the account itself and its guild list.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::model::ids::*;
use crate::model::user::pick_discriminator;
use crate::repo::{collections, Query};

use super::{ApiError, Auth};
use crate::ChatState;

type AppState = State<Arc<ChatState>>;

/// `GET /users/@me`
pub async fn get_me(Auth(user): Auth) -> Json<Value> {
    Json(serde_json::to_value(user.private()).expect("users serialize"))
}

/// `GET /users/{user_id}`: the public shape.
pub async fn get_user(
    State(state): AppState,
    Auth(_user): Auth,
    Path(user_id): Path<UserId>,
) -> Result<Json<Value>, ApiError> {
    let user = state.public_user(user_id).await.ok_or(ApiError::UnknownUser)?;
    Ok(Json(serde_json::to_value(user)?))
}

#[derive(Deserialize)]
pub struct UserEditBody {
    pub username: Option<String>,
    pub avatar: Option<String>,
}

/// `PATCH /users/@me`. Changing the username regenerates the
/// discriminator; a username shared by 8000 accounts is full.
pub async fn edit_me(
    State(state): AppState,
    Auth(user): Auth,
    Json(body): Json<UserEditBody>,
) -> Result<Json<Value>, ApiError> {
    let updated = {
        let mut users = state.users.write().await;

        if let Some(username) = &body.username {
            let len = username.trim().chars().count();
            if !(2..=32).contains(&len) {
                return Err(ApiError::BadRequest("username must be 2-32 characters".into()));
            }
            let taken: Vec<String> = users.iter()
                .filter(|u| u.username == *username && u.id != user.id)
                .map(|u| u.discriminator.clone())
                .collect();
            let discriminator = pick_discriminator(&taken)
                .ok_or_else(|| ApiError::BadRequest("too many users with this username".into()))?;

            let target = users.get_mut(user.id).ok_or(ApiError::UnknownUser)?;
            target.username = username.clone();
            target.discriminator = discriminator;
        }
        if let Some(avatar) = body.avatar {
            let target = users.get_mut(user.id).ok_or(ApiError::UnknownUser)?;
            target.avatar = Some(avatar);
        }
        users.get(user.id).cloned().ok_or(ApiError::UnknownUser)?
    };

    state.repo.collection(collections::USERS)
        .replace_one(Query::new().eq("id", user.id.to_string()), serde_json::to_value(&updated)?)
        .await?;

    Ok(Json(serde_json::to_value(updated.private())?))
}

/// `GET /users/@me/guilds`: partial guild objects for the account.
pub async fn get_my_guilds(
    State(state): AppState,
    Auth(user): Auth,
) -> Result<Json<Vec<Value>>, ApiError> {
    let mut list = Vec::new();
    for guild_id in state.user_guild_ids(user.id).await {
        if let Some(guild) = state.guild(guild_id).await {
            list.push(json!({
                "id": guild.id,
                "name": guild.name,
                "icon": guild.icon,
                "owner": guild.owner_id == user.id,
            }));
        }
    }
    Ok(Json(list))
}

/// `DELETE /users/@me/guilds/{guild_id}`: leave a guild. The owner cannot
/// leave their own guild.
pub async fn leave_guild(
    State(state): AppState,
    Auth(user): Auth,
    Path(guild_id): Path<GuildId>,
) -> Result<StatusCode, ApiError> {
    let guild = state.guild(guild_id).await.ok_or(ApiError::UnknownGuild)?;
    if guild.owner_id == user.id {
        return Err(ApiError::BadRequest("the owner cannot leave their own guild".into()));
    }
    state.remove_member(guild_id, user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}
