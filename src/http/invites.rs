//! `/api/invites/*` plus invite creation under a channel.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;

use crate::model::ids::ChannelId;
use crate::model::invite::InviteCreateBody;

use super::{ApiError, Auth};
use crate::ChatState;

type AppState = State<Arc<ChatState>>;

/// `POST /channels/{channel_id}/invites`
pub async fn create_invite(
    State(state): AppState,
    Auth(user): Auth,
    Path(channel_id): Path<ChannelId>,
    body: Option<Json<InviteCreateBody>>,
) -> Result<Json<Value>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or(InviteCreateBody {
        max_age: 0,
        max_uses: 0,
        temporary: false,
    });
    let view = state.create_invite(&user, channel_id, body).await?;
    Ok(Json(serde_json::to_value(view)?))
}

/// `GET /invites/{code}`
pub async fn get_invite(
    State(state): AppState,
    Path(code): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let invite = state.invite(&code).await.ok_or(ApiError::UnknownInvite)?;
    if invite.expired(state.clock.now()) {
        return Err(ApiError::UnknownInvite);
    }
    let view = state.invite_view(&invite).await.ok_or(ApiError::UnknownInvite)?;
    Ok(Json(serde_json::to_value(view)?))
}

/// `POST /invites/{code}`: accept the invite and join its guild.
pub async fn accept_invite(
    State(state): AppState,
    Auth(user): Auth,
    Path(code): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let view = state.accept_invite(&user, &code).await?;
    Ok(Json(serde_json::to_value(view)?))
}

/// `DELETE /invites/{code}`: inviter or guild owner.
pub async fn delete_invite(
    State(state): AppState,
    Auth(user): Auth,
    Path(code): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.delete_invite(&user, &code).await?;
    Ok(StatusCode::NO_CONTENT)
}
