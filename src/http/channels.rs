//! `/api/channels/*`: channel objects, messages, pins, typing.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;

use crate::model::channel::{Channel, TextChannelEdit, VoiceChannelEdit};
use crate::model::ids::*;
use crate::model::message::{MessageCreateBody, MessageEditBody};

use super::{ApiError, Auth};
use crate::ChatState;

type AppState = State<Arc<ChatState>>;

/// `GET /channels/{channel_id}`
pub async fn get_channel(
    State(state): AppState,
    Auth(user): Auth,
    Path(channel_id): Path<ChannelId>,
) -> Result<Json<Value>, ApiError> {
    let channel = state.channel(channel_id).await.ok_or(ApiError::UnknownChannel)?;
    state.require_member(channel.guild_id(), user.id).await?;
    Ok(Json(serde_json::to_value(&channel)?))
}

/// `PATCH`/`PUT /channels/{channel_id}`: owner-only; the edit schema is
/// picked by the channel variant.
pub async fn edit_channel(
    State(state): AppState,
    Auth(user): Auth,
    Path(channel_id): Path<ChannelId>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let channel = state.channel(channel_id).await.ok_or(ApiError::UnknownChannel)?;
    let guild = state.guild(channel.guild_id()).await.ok_or(ApiError::UnknownGuild)?;
    if guild.owner_id != user.id {
        return Err(ApiError::Unauthorized);
    }

    let updated = match &channel {
        Channel::Text(_) => {
            let edit: TextChannelEdit = serde_json::from_value(body)
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            if !edit.validate() {
                return Err(ApiError::BadRequest("invalid channel edit".into()));
            }
            state.apply_channel_edit(channel_id, move |channel| {
                if let Channel::Text(text) = channel {
                    if let Some(name) = edit.name { text.name = name; }
                    if let Some(position) = edit.position { text.position = position; }
                    if let Some(topic) = edit.topic { text.topic = topic; }
                }
            }).await?
        }
        Channel::Voice(_) => {
            let edit: VoiceChannelEdit = serde_json::from_value(body)
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            if !edit.validate() {
                return Err(ApiError::BadRequest("invalid channel edit".into()));
            }
            state.apply_channel_edit(channel_id, move |channel| {
                if let Channel::Voice(voice) = channel {
                    if let Some(name) = edit.name { voice.name = name; }
                    if let Some(position) = edit.position { voice.position = position; }
                    if let Some(bitrate) = edit.bitrate { voice.bitrate = bitrate; }
                    if let Some(user_limit) = edit.user_limit { voice.user_limit = user_limit; }
                }
            }).await?
        }
    };
    Ok(Json(serde_json::to_value(&updated)?))
}

/// `DELETE /channels/{channel_id}`
pub async fn delete_channel(
    State(state): AppState,
    Auth(user): Auth,
    Path(channel_id): Path<ChannelId>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state.delete_channel(&user, channel_id).await?;
    Ok(Json(serde_json::to_value(&deleted)?))
}

/// `GET /channels/{channel_id}/messages?limit=&before=&after=&around=`
pub async fn get_messages(
    State(state): AppState,
    Auth(user): Auth,
    Path(channel_id): Path<ChannelId>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let channel = state.channel(channel_id).await.ok_or(ApiError::UnknownChannel)?;
    state.require_member(channel.guild_id(), user.id).await?;

    let limit = match params.get("limit") {
        Some(raw) => raw.parse::<usize>()
            .map_err(|_| ApiError::BadRequest("limit is not an integer".into()))?,
        None => 50,
    };
    if !(1..=100).contains(&limit) {
        return Err(ApiError::BadRequest(format!("limit not in 1-100 range, {}", limit)));
    }
    let anchor = |key: &str| -> Result<Option<MessageId>, ApiError> {
        params.get(key)
            .map(|raw| raw.parse().map_err(|_| ApiError::BadRequest(format!("{} is not a snowflake", key))))
            .transpose()
    };

    let messages = state
        .channel_messages(channel_id, limit, anchor("before")?, anchor("after")?, anchor("around")?)
        .await;
    let mut views = Vec::with_capacity(messages.len());
    for message in &messages {
        if let Some(view) = state.message_view(message).await {
            views.push(serde_json::to_value(view)?);
        }
    }
    Ok(Json(views))
}

/// `POST /channels/{channel_id}/messages`
pub async fn post_message(
    State(state): AppState,
    Auth(user): Auth,
    Path(channel_id): Path<ChannelId>,
    Json(body): Json<MessageCreateBody>,
) -> Result<Json<Value>, ApiError> {
    let view = state.create_message(&user, channel_id, body).await?;
    Ok(Json(serde_json::to_value(view)?))
}

/// `GET /channels/{channel_id}/messages/{message_id}`
pub async fn get_message(
    State(state): AppState,
    Auth(user): Auth,
    Path((channel_id, message_id)): Path<(ChannelId, MessageId)>,
) -> Result<Json<Value>, ApiError> {
    let channel = state.channel(channel_id).await.ok_or(ApiError::UnknownChannel)?;
    state.require_member(channel.guild_id(), user.id).await?;

    let message = state.message(message_id).await
        .filter(|m| m.channel_id == channel_id)
        .ok_or(ApiError::UnknownMessage)?;
    let view = state.message_view(&message).await.ok_or(ApiError::UnknownUser)?;
    Ok(Json(serde_json::to_value(view)?))
}

/// `PATCH /channels/{channel_id}/messages/{message_id}`
pub async fn edit_message(
    State(state): AppState,
    Auth(user): Auth,
    Path((channel_id, message_id)): Path<(ChannelId, MessageId)>,
    Json(body): Json<MessageEditBody>,
) -> Result<Json<Value>, ApiError> {
    let view = state.edit_message(&user, channel_id, message_id, body.content).await?;
    Ok(Json(serde_json::to_value(view)?))
}

/// `DELETE /channels/{channel_id}/messages/{message_id}`
pub async fn delete_message(
    State(state): AppState,
    Auth(user): Auth,
    Path((channel_id, message_id)): Path<(ChannelId, MessageId)>,
) -> Result<StatusCode, ApiError> {
    state.delete_message(&user, channel_id, message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(serde::Deserialize)]
pub struct BulkDeleteBody {
    pub messages: Vec<MessageId>,
}

/// `POST /channels/{channel_id}/messages/bulk-delete`
pub async fn bulk_delete(
    State(state): AppState,
    Auth(user): Auth,
    Path(channel_id): Path<ChannelId>,
    Json(body): Json<BulkDeleteBody>,
) -> Result<StatusCode, ApiError> {
    state.bulk_delete(&user, channel_id, body.messages).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /channels/{channel_id}/typing`
pub async fn post_typing(
    State(state): AppState,
    Auth(user): Auth,
    Path(channel_id): Path<ChannelId>,
) -> Result<StatusCode, ApiError> {
    let channel = state.channel(channel_id).await.ok_or(ApiError::UnknownChannel)?;
    state.require_member(channel.guild_id(), user.id).await?;
    state.typing_start(user.id, channel_id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /channels/{channel_id}/pins`
pub async fn get_pins(
    State(state): AppState,
    Auth(user): Auth,
    Path(channel_id): Path<ChannelId>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let channel = state.channel(channel_id).await.ok_or(ApiError::UnknownChannel)?;
    state.require_member(channel.guild_id(), user.id).await?;
    let pins = channel.text().map(|text| text.pins.clone()).unwrap_or_default();

    let mut views = Vec::with_capacity(pins.len());
    for id in pins {
        if let Some(message) = state.message(id).await {
            if let Some(view) = state.message_view(&message).await {
                views.push(serde_json::to_value(view)?);
            }
        }
    }
    Ok(Json(views))
}

/// `PUT /channels/{channel_id}/pins/{message_id}`
pub async fn add_pin(
    State(state): AppState,
    Auth(user): Auth,
    Path((channel_id, message_id)): Path<(ChannelId, MessageId)>,
) -> Result<StatusCode, ApiError> {
    state.pin_message(&user, channel_id, message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /channels/{channel_id}/pins/{message_id}`
pub async fn remove_pin(
    State(state): AppState,
    Auth(user): Auth,
    Path((channel_id, message_id)): Path<(ChannelId, MessageId)>,
) -> Result<StatusCode, ApiError> {
    state.unpin_message(&user, channel_id, message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
