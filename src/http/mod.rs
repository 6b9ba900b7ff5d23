//! The REST surface under `/api`. Handlers authenticate, check scope,
//! validate shape, then hand the mutation to [`ChatState`] which performs
//! it and dispatches the resulting gateway events.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post, put};
use axum::{Json, Router};
use serde_json::json;
use thiserror::Error;

use crate::model::user::User;
use crate::repo::RepoError;
use crate::ChatState;

pub mod channels;
pub mod guilds;
pub mod invites;
pub mod users;

/// The numeric error taxonomy. `code()` is the stable wire number,
/// `status()` the HTTP status it travels with (10xxx lookups are 404,
/// 40001 is 403, business rules are 400 unless mapped otherwise).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unknown Channel")]
    UnknownChannel,
    #[error("Unknown Guild")]
    UnknownGuild,
    #[error("Unknown Invite")]
    UnknownInvite,
    #[error("Unknown Member")]
    UnknownMember,
    #[error("Unknown Message")]
    UnknownMessage,
    #[error("Unknown Role")]
    UnknownRole,
    #[error("Unknown User")]
    UnknownUser,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Cannot edit a message authored by another user")]
    CannotEditOthersMessage,
    #[error("Cannot send an empty message")]
    EmptyMessage,
    #[error("Cannot send messages in a voice channel")]
    CannotSendInVoice,
    #[error("Missing Permissions")]
    MissingPermissions,
    #[error("A message can only be pinned to the channel it was sent in")]
    PinChannelMismatch,
    #[error("A message provided was too old to bulk delete")]
    MessageTooOld,
    #[error("Message content exceeds the maximum length")]
    ContentTooLong,
    #[error("A message with this nonce was already sent")]
    NonceConflict,
    #[error("Channel pin limit exceeded")]
    PinLimit,
    #[error("{0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("storage error: {0}")]
    Repo(#[from] RepoError),
}

impl ApiError {
    pub fn code(&self) -> u32 {
        match self {
            Self::UnknownChannel => 10003,
            Self::UnknownGuild => 10004,
            Self::UnknownInvite => 10006,
            Self::UnknownMember => 10007,
            Self::UnknownMessage => 10008,
            Self::UnknownRole => 10011,
            Self::UnknownUser => 10013,
            Self::Unauthorized => 40001,
            Self::CannotEditOthersMessage => 50005,
            Self::EmptyMessage => 50006,
            Self::CannotSendInVoice => 50008,
            Self::MissingPermissions => 50013,
            Self::PinChannelMismatch => 50019,
            Self::MessageTooOld => 50034,
            Self::ContentTooLong => 50035,
            Self::NonceConflict | Self::PinLimit | Self::BadRequest(_) => 0,
            Self::Internal(_) | Self::Repo(_) => 0,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownChannel
            | Self::UnknownGuild
            | Self::UnknownInvite
            | Self::UnknownMember
            | Self::UnknownMessage
            | Self::UnknownRole
            | Self::UnknownUser => StatusCode::NOT_FOUND,
            Self::Unauthorized | Self::MissingPermissions => StatusCode::FORBIDDEN,
            Self::NonceConflict => StatusCode::CONFLICT,
            Self::Internal(_) | Self::Repo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Internal(_) | Self::Repo(_)) {
            log::error!("[http] {}", self);
        }
        let body = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        Self::Internal(error.to_string())
    }
}

/// Bearer-token authentication: resolves `Authorization` to the user.
pub struct Auth(pub User);

#[axum::async_trait]
impl FromRequestParts<Arc<ChatState>> for Auth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<ChatState>) -> Result<Self, Self::Rejection> {
        let header = parts.headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        // both bare tokens and "Bot <token>" are accepted
        let token = header.strip_prefix("Bot ").unwrap_or(header);
        state.token_user(token).await.map(Auth).ok_or(ApiError::Unauthorized)
    }
}

/// The `/api` route table.
pub fn api_router() -> Router<Arc<ChatState>> {
    Router::new()
        .route("/gateway", get(gateway_info))
        // channels
        .route("/channels/:channel_id", get(channels::get_channel)
            .patch(channels::edit_channel)
            .put(channels::edit_channel)
            .delete(channels::delete_channel))
        .route("/channels/:channel_id/messages", get(channels::get_messages)
            .post(channels::post_message))
        .route("/channels/:channel_id/messages/bulk-delete", post(channels::bulk_delete))
        .route("/channels/:channel_id/messages/:message_id", get(channels::get_message)
            .patch(channels::edit_message)
            .delete(channels::delete_message))
        .route("/channels/:channel_id/typing", post(channels::post_typing))
        .route("/channels/:channel_id/pins", get(channels::get_pins))
        .route("/channels/:channel_id/pins/:message_id", put(channels::add_pin)
            .delete(channels::remove_pin))
        .route("/channels/:channel_id/invites", post(invites::create_invite))
        // guilds
        .route("/guilds", post(guilds::create_guild))
        .route("/guilds/:guild_id", get(guilds::get_guild)
            .patch(guilds::edit_guild)
            .delete(guilds::delete_guild))
        .route("/guilds/:guild_id/channels", get(guilds::get_channels)
            .post(guilds::create_channel))
        .route("/guilds/:guild_id/members", get(guilds::get_members))
        .route("/guilds/:guild_id/members/:user_id", get(guilds::get_member)
            .patch(guilds::edit_member)
            .delete(guilds::kick_member))
        .route("/guilds/:guild_id/bans", get(guilds::get_bans))
        .route("/guilds/:guild_id/bans/:user_id", put(guilds::ban_member)
            .delete(guilds::unban_member))
        .route("/guilds/:guild_id/roles/:role_id", patch(guilds::edit_role))
        // invites
        .route("/invites/:code", get(invites::get_invite)
            .post(invites::accept_invite)
            .delete(invites::delete_invite))
        // users
        .route("/users/@me", get(users::get_me).patch(users::edit_me))
        .route("/users/@me/guilds", get(users::get_my_guilds))
        .route("/users/@me/guilds/:guild_id", delete(users::leave_guild))
        .route("/users/:user_id", get(users::get_user))
}

/// `GET /api/gateway`: where to open the websocket.
async fn gateway_info(
    axum::extract::State(state): axum::extract::State<Arc<ChatState>>,
) -> Json<serde_json::Value> {
    Json(json!({ "url": state.config.gateway_url }))
}
