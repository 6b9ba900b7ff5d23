//! The gateway: one websocket per client, HELLO/IDENTIFY/RESUME handshake,
//! heartbeats, and the per-connection reader/writer pair.
//!
//! Each accepted socket is split: the reader runs the state machine below,
//! the writer drains a bounded queue and owns the sink. Fan-out never
//! touches the socket directly; it enqueues into the writer's queue and a
//! full queue closes the connection as a slow consumer.

use std::borrow::Cow;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use itertools::Itertools;
use log::{debug, info, warn};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Duration, Instant};

use crate::model::ids::*;
use crate::model::presence::PresenceUpdateRequest;
use crate::ChatState;

pub mod codec;
pub mod dispatch;
pub mod etf;
pub mod payload;
pub mod presence;
pub mod ratelimit;
pub mod session;

use codec::{CodecError, Encoding};
use dispatch::{
    ConnHandle, Event, GuildMembersChunk, GuildSyncReply, Ready, Resumed, UserReadyExtras,
    WriterCmd, OUTBOUND_QUEUE_FRAMES,
};
use payload::{
    op_frame, trace, ClientPayload, CloseCode, Identify, Opcode, PayloadError,
    RequestGuildMembers, Resume, GATEWAY_VERSION,
};
use ratelimit::WsRateLimits;
use session::{Session, RESUME_MAX_EVENTS};

/// Heartbeat intervals are random per connection, in this window (ms).
const HB_MIN_MSEC: u64 = 40_000;
const HB_MAX_MSEC: u64 = 42_000;

/// Grace added on top of the heartbeat interval before the deadline fires.
const HB_GRACE: Duration = Duration::from_secs(3);

/// Member chunk size for GUILD_MEMBERS_CHUNK.
const MEMBER_CHUNK_SIZE: usize = 1000;

/// The websocket endpoint: `/?v=6&encoding=<json|etf>`. Bad versions and
/// encodings are accepted and immediately closed with 4000, so the client
/// gets a close code rather than a failed upgrade.
pub async fn gateway_handler(
    State(state): State<Arc<ChatState>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let version: Option<u8> = match params.get("v") {
        Some(raw) => raw.parse().ok(),
        None => Some(GATEWAY_VERSION),
    };
    let encoding: Option<Encoding> = match params.get("encoding") {
        Some(raw) => raw.parse().ok(),
        None => Some(Encoding::Json),
    };

    ws.on_upgrade(move |socket| handle_socket(state, socket, version, encoding))
}

async fn handle_socket(
    state: Arc<ChatState>,
    socket: WebSocket,
    version: Option<u8>,
    encoding: Option<Encoding>,
) {
    let (mut sink, stream) = socket.split();

    let encoding = match (version, encoding) {
        (Some(GATEWAY_VERSION), Some(encoding)) => encoding,
        (version, _) => {
            debug!("[ws] refusing connection: v={:?}", version);
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::UnknownError.code(),
                    reason: Cow::from("unsupported version or encoding"),
                })))
                .await;
            return;
        }
    };

    let conn_id = state.next_conn_id();
    info!("[ws] new connection {} ({:?})", conn_id, encoding);

    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_FRAMES);
    let writer = tokio::spawn(write_loop(sink, rx, encoding));

    let mut connection = Connection {
        state,
        conn_id,
        encoding,
        tx,
        kill: Arc::new(Notify::new()),
        phase: Phase::Unauthenticated,
        session: None,
        hb_interval: Duration::from_millis(rand::thread_rng().gen_range(HB_MIN_MSEC..=HB_MAX_MSEC)),
        limits: WsRateLimits::default(),
    };
    connection.run(stream).await;
    connection.cleanup().await;

    // dropping the last queue sender ends the writer
    drop(connection);
    let _ = writer.await;
}

/// Encode-and-transmit task. Owns the sink; ends when every queue sender is
/// gone or a close was requested.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<WriterCmd>,
    encoding: Encoding,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Frame { frame, compress } => {
                let bytes = match encoding.encode(&*frame) {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        warn!("[ws] encode failed: {}", error);
                        continue;
                    }
                };
                let message = if compress {
                    match codec::compress(&bytes) {
                        Ok(deflated) => Message::Binary(deflated),
                        Err(error) => {
                            warn!("[ws] compress failed: {}", error);
                            continue;
                        }
                    }
                } else if encoding.is_binary() {
                    Message::Binary(bytes)
                } else {
                    match String::from_utf8(bytes) {
                        Ok(text) => Message::Text(text),
                        Err(error) => {
                            warn!("[ws] non-utf8 json frame: {}", error);
                            continue;
                        }
                    }
                };
                if sink.send(message).await.is_err() {
                    return;
                }
            }
            WriterCmd::Close { code, reason } => {
                let _ = sink.send(Message::Close(Some(CloseFrame { code, reason }))).await;
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unauthenticated,
    Identifying,
    Established,
    Closing,
    /// heartbeats lapsed; terminal
    Zombie,
}

struct Connection {
    state: Arc<ChatState>,
    conn_id: u64,
    encoding: Encoding,
    tx: mpsc::Sender<WriterCmd>,
    kill: Arc<Notify>,
    phase: Phase,
    session: Option<Arc<Session>>,
    hb_interval: Duration,
    limits: WsRateLimits,
}

impl Connection {
    async fn run(&mut self, mut stream: SplitStream<WebSocket>) {
        self.send_op(Opcode::Hello, json!({
            "heartbeat_interval": self.hb_interval.as_millis() as u64,
            "_trace": trace("hello"),
        })).await;

        let mut deadline = Instant::now() + self.hb_interval + HB_GRACE;
        let kill = Arc::clone(&self.kill);

        loop {
            tokio::select! {
                () = kill.notified() => {
                    self.close(CloseCode::UnknownError, "slow consumer").await;
                    break;
                }
                () = sleep_until(deadline) => {
                    info!("[ws] heartbeat expired on conn {}", self.conn_id);
                    self.phase = Phase::Zombie;
                    self.close(CloseCode::UnknownError, "Heartbeat expired").await;
                    break;
                }
                message = stream.next() => {
                    let bytes = match message {
                        Some(Ok(Message::Text(text))) => text.into_bytes(),
                        Some(Ok(Message::Binary(bytes))) => bytes,
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                        Some(Ok(Message::Close(frame))) => {
                            debug!("[ws] conn {} closed by peer: {:?}", self.conn_id, frame);
                            break;
                        }
                        Some(Err(error)) => {
                            debug!("[ws] conn {} read error: {}", self.conn_id, error);
                            break;
                        }
                        None => break,
                    };
                    self.handle_frame(&bytes, &mut deadline).await;
                }
            }
            if matches!(self.phase, Phase::Closing | Phase::Zombie) {
                break;
            }
        }
    }

    async fn handle_frame(&mut self, bytes: &[u8], deadline: &mut Instant) {
        let value = match self.encoding.decode(bytes) {
            Ok(value) => value,
            Err(CodecError::TooLarge(len)) => {
                warn!("[ws] conn {} sent {} byte frame", self.conn_id, len);
                self.close(CloseCode::PayloadTooLarge, "payload too large").await;
                return;
            }
            Err(error) => {
                warn!("[ws] conn {} decode error: {}", self.conn_id, error);
                self.close(CloseCode::DecodeError, "decode error").await;
                return;
            }
        };

        let payload = match ClientPayload::try_from(value) {
            Ok(payload) => payload,
            Err(PayloadError::BadData { op: Opcode::Resume, error }) => {
                warn!("[ws] conn {} bad RESUME: {}", self.conn_id, error);
                self.invalidate(false, None).await;
                return;
            }
            Err(error) => {
                warn!("[ws] conn {} bad frame: {}", self.conn_id, error);
                self.close(CloseCode::DecodeError, "unknown or malformed op").await;
                return;
            }
        };

        if !self.limits.all.check() {
            self.close(CloseCode::UnknownError, "op ratelimit exceeded").await;
            return;
        }

        // in Unauthenticated, the only semantic ops accepted are
        // IDENTIFY and RESUME; heartbeats are allowed at any time
        if self.phase == Phase::Unauthenticated
            && !matches!(
                payload,
                ClientPayload::Heartbeat(_) | ClientPayload::Identify(_) | ClientPayload::Resume(_)
            )
        {
            self.close(CloseCode::NotAuthenticated, "not authenticated").await;
            return;
        }

        match payload {
            ClientPayload::Heartbeat(seq) => {
                if let (Some(session), Some(seq)) = (&self.session, seq) {
                    session.lock().await.recv_seq = seq;
                }
                *deadline = Instant::now() + self.hb_interval + HB_GRACE;
                self.send_op(Opcode::HeartbeatAck, Value::Null).await;
            }
            ClientPayload::Identify(identify) => self.identify(*identify).await,
            ClientPayload::Resume(resume) => self.resume(resume).await,
            ClientPayload::StatusUpdate(update) => {
                if self.phase != Phase::Established {
                    self.close(CloseCode::NotAuthenticated, "not identified").await;
                    return;
                }
                if !self.limits.presence_updates.check() {
                    debug!("[ws] conn {} presence update dropped (ratelimit)", self.conn_id);
                    return;
                }
                let user_id = self.session.as_ref().expect("established").user_id;
                self.state.presence_global_update(user_id, update.into_request()).await;
            }
            ClientPayload::RequestGuildMembers(request) => {
                if self.phase != Phase::Established {
                    self.close(CloseCode::NotAuthenticated, "not identified").await;
                    return;
                }
                self.request_guild_members(request).await;
            }
            ClientPayload::GuildSync(guild_ids) => {
                if self.phase != Phase::Established {
                    self.close(CloseCode::NotAuthenticated, "not identified").await;
                    return;
                }
                self.guild_sync(guild_ids).await;
            }
            ClientPayload::VoiceStateUpdate(data) => {
                // voice is not transported here; acknowledge by logging only
                debug!("[ws] conn {} VOICE_STATE_UPDATE {:?}", self.conn_id, data);
            }
            ClientPayload::VoiceServerPing => {
                debug!("[ws] conn {} VOICE_SERVER_PING", self.conn_id);
            }
        }
    }

    // ------------------------------------------------------------------
    // IDENTIFY

    async fn identify(&mut self, identify: Identify) {
        if self.phase == Phase::Established {
            self.close(CloseCode::AlreadyAuthenticated, "already authenticated").await;
            return;
        }
        if !self.limits.identify.check() {
            self.close(CloseCode::UnknownError, "identify ratelimit exceeded").await;
            return;
        }
        self.phase = Phase::Identifying;

        let Some(user) = self.state.token_user(&identify.token).await else {
            self.close(CloseCode::AuthFailed, "authentication failed").await;
            return;
        };

        let shard = match validate_shard(identify.shard.as_deref(), user.bot) {
            Ok(shard) => shard,
            Err(reason) => {
                self.close(CloseCode::InvalidShard, reason).await;
                return;
            }
        };

        let guild_ids = self.state.user_guild_ids(user.id).await;
        if user.bot && guild_ids.len() > 2500 && shard.1 <= 1 {
            self.close(CloseCode::InvalidShard, "sharding required").await;
            return;
        }

        let Some(session_id) = self.state.sessions.generate_id().await else {
            // if clients end up in a reconnect loop, session id generation
            // is the first thing to check
            self.close(CloseCode::SessionTimeout, "could not allocate session").await;
            return;
        };

        let large_threshold = identify.large_threshold.unwrap_or(50) as usize;
        let session = Arc::new(Session::new(
            session_id.clone(),
            identify.token,
            user.id,
            user.bot,
            shard,
            identify.compress,
            large_threshold,
            identify.properties,
        ));
        self.state.sessions.insert(Arc::clone(&session)).await;

        let handle = ConnHandle::new(
            self.conn_id,
            Arc::clone(&session),
            self.tx.clone(),
            Arc::clone(&self.kill),
        );
        self.state.dispatcher.add_connection(user.id, handle.clone()).await;
        self.session = Some(Arc::clone(&session));

        // presence goes up before the guild list is computed, so the list's
        // presence blocks already include this user and no PRESENCE_UPDATE
        // can beat READY to this connection
        self.state
            .presence_global_update(user.id, PresenceUpdateRequest::default())
            .await;

        self.phase = Phase::Established;

        let mut guild_list = Vec::with_capacity(guild_ids.len());
        for guild_id in &guild_ids {
            if let Some(guild) = self.state.guild(*guild_id).await {
                guild_list.push(self.state.guild_json(&guild, large_threshold).await);
            }
        }

        info!(
            "[ready] new session {} for {} ({} guilds)",
            session_id, user.username, guild_list.len(),
        );

        let ready_guilds = if user.bot {
            guild_list.iter()
                .map(|guild| json!({ "id": guild["id"], "unavailable": true }))
                .collect()
        } else {
            guild_list.clone()
        };

        let ready = Event::Ready(Ready {
            v: GATEWAY_VERSION,
            user: user.private(),
            session_id,
            guilds: ready_guilds,
            private_channels: vec![],
            trace: trace("ready"),
            user_extras: (!user.bot).then(UserReadyExtras::stub),
        });
        if handle.dispatch(&ready).await.is_err() {
            return;
        }

        // bots get the real guilds streamed after the stub READY
        if user.bot {
            for guild in guild_list {
                if handle.dispatch(&Event::GuildCreate(guild)).await.is_err() {
                    return;
                }
            }
        }

        // non-atomic clients watch every guild they are in; atomic clients
        // subscribe later, guild by guild, with GUILD_SYNC. Marking happens
        // only once READY (and the bot guild stream) is enqueued: a viewer
        // mark makes guild dispatch reach this connection, and nothing may
        // take a seq ahead of READY.
        if !session.atomic {
            let mut guilds = self.state.guilds.write().await;
            for guild_id in &guild_ids {
                if let Some(guild) = guilds.get_mut(*guild_id) {
                    guild.mark_viewer(user.id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // RESUME

    async fn resume(&mut self, resume: Resume) {
        if self.phase == Phase::Established {
            self.close(CloseCode::AlreadyAuthenticated, "already authenticated").await;
            return;
        }
        info!("[resume] conn {} resuming {}", self.conn_id, resume.session_id);

        let Some(session) = self.state.sessions.lookup(&resume.session_id).await else {
            warn!("[resume] session {} not found", resume.session_id);
            self.invalidate(false, None).await;
            return;
        };
        if session.token != resume.token {
            warn!("[resume] token mismatch for {}", resume.session_id);
            self.invalidate(false, Some(&resume.session_id)).await;
            return;
        }

        let handle = ConnHandle::new(
            self.conn_id,
            Arc::clone(&session),
            self.tx.clone(),
            Arc::clone(&self.kill),
        );

        // replay under the dispatch lock: no live event can interleave, and
        // the ring cannot move underneath us
        let replayed = {
            let inner = session.lock().await;
            let sent_seq = inner.sent_seq;
            if resume.seq > sent_seq {
                drop(inner);
                warn!("[resume] seq {} is ahead of {}", resume.seq, sent_seq);
                self.invalidate(false, Some(&resume.session_id)).await;
                return;
            }
            if sent_seq - resume.seq > RESUME_MAX_EVENTS as u64 {
                drop(inner);
                warn!("[resume] gap {} exceeds the resume window", sent_seq - resume.seq);
                self.invalidate(false, Some(&resume.session_id)).await;
                return;
            }

            let mut presences = Vec::new();
            let mut replayed = 0usize;
            for frame in inner.replay_after(resume.seq) {
                let is_presence = frame.get("t").and_then(Value::as_str) == Some("PRESENCE_UPDATE");
                if is_presence {
                    if let Some(d) = frame.get("d") {
                        presences.push(d.clone());
                    }
                } else if handle.enqueue_raw(frame).is_err() {
                    return;
                }
                replayed += 1;
            }
            drop(inner);

            if !presences.is_empty()
                && handle.dispatch(&Event::PresencesReplace(presences)).await.is_err()
            {
                return;
            }
            replayed
        };
        info!("[resume] replayed {} events to {}", replayed, resume.session_id);

        if self.state.user(session.user_id).await.is_none() {
            self.invalidate(false, Some(&resume.session_id)).await;
            return;
        }

        self.state.dispatcher.add_connection(session.user_id, handle.clone()).await;
        self.session = Some(Arc::clone(&session));
        self.phase = Phase::Established;

        // viewer marks may have decayed while the user was gone
        if !session.atomic {
            let guild_ids = self.state.user_guild_ids(session.user_id).await;
            let mut guilds = self.state.guilds.write().await;
            for guild_id in guild_ids {
                if let Some(guild) = guilds.get_mut(guild_id) {
                    guild.mark_viewer(session.user_id);
                }
            }
        }

        self.state
            .presence_global_update(session.user_id, PresenceUpdateRequest::default())
            .await;

        let _ = handle.dispatch(&Event::Resumed(Resumed { trace: trace("resume") })).await;
    }

    // ------------------------------------------------------------------
    // other ops

    async fn request_guild_members(&mut self, request: RequestGuildMembers) {
        let RequestGuildMembers { guild_id, query, limit } = request;
        let session = self.session.as_ref().expect("established").clone();

        let Some(guild) = self.state.guild(guild_id).await else { return };
        if !guild.is_member(session.user_id) {
            return;
        }

        let limit = match limit {
            0 => MEMBER_CHUNK_SIZE,
            n => (n as usize).min(MEMBER_CHUNK_SIZE),
        };

        let mut views = Vec::new();
        for member in guild.members.iter() {
            if !query.is_empty() {
                let matches = self.state.user(member.id).await
                    .map_or(false, |user| user.username.to_lowercase().starts_with(&query.to_lowercase()));
                if !matches {
                    continue;
                }
            }
            if let Some(view) = self.state.member_view(member).await {
                views.push(view);
            }
        }
        // results past a full chunk are sent anyway, split into chunks;
        // only sub-chunk results honor the requested limit
        if views.len() <= MEMBER_CHUNK_SIZE {
            views.truncate(limit);
        }

        let handle = self.handle();
        let chunks: Vec<Vec<_>> = views
            .into_iter()
            .chunks(MEMBER_CHUNK_SIZE)
            .into_iter()
            .map(|chunk| chunk.collect())
            .collect();
        for chunk in chunks {
            let event = Event::GuildMembersChunk(GuildMembersChunk {
                guild_id,
                members: chunk,
            });
            if handle.dispatch(&event).await.is_err() {
                return;
            }
        }
    }

    async fn guild_sync(&mut self, guild_ids: Vec<GuildId>) {
        let session = self.session.as_ref().expect("established").clone();

        for guild_id in guild_ids {
            let Some(guild) = self.state.guild(guild_id).await else { continue };
            if !guild.is_member(session.user_id) {
                continue;
            }

            if session.atomic {
                let mut guilds = self.state.guilds.write().await;
                if let Some(guild) = guilds.get_mut(guild_id) {
                    guild.mark_viewer(session.user_id);
                }
            }

            let event = Event::GuildSync(GuildSyncReply {
                id: guild_id,
                presences: self.state.guild_presences(&guild).await,
                members: self.state.online_member_views(&guild).await,
            });
            if self.handle().dispatch(&event).await.is_err() {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // plumbing

    fn handle(&self) -> ConnHandle {
        ConnHandle::new(
            self.conn_id,
            Arc::clone(self.session.as_ref().expect("established")),
            self.tx.clone(),
            Arc::clone(&self.kill),
        )
    }

    async fn send_op(&self, op: Opcode, d: Value) {
        let frame = Arc::new(op_frame(op, d));
        if self.tx.send(WriterCmd::Frame { frame, compress: false }).await.is_err() {
            debug!("[ws] conn {} writer gone", self.conn_id);
        }
    }

    /// OP 9 INVALID_SESSION. Non-resumable invalidation reclaims the
    /// session for garbage collection.
    async fn invalidate(&mut self, resumable: bool, session_id: Option<&str>) {
        info!("[ws] conn {} invalidated, resumable: {}", self.conn_id, resumable);
        self.send_op(Opcode::InvalidSession, Value::Bool(resumable)).await;
        if !resumable {
            if let Some(sid) = session_id {
                self.state.sessions.remove(sid).await;
            }
            if let Some(session) = &self.session {
                self.state.sessions.remove(&session.session_id).await;
            }
        }
    }

    async fn close(&mut self, code: CloseCode, reason: impl Into<Cow<'static, str>>) {
        if self.phase != Phase::Zombie {
            self.phase = Phase::Closing;
        }
        let _ = self.tx
            .send(WriterCmd::Close { code: code.code(), reason: reason.into() })
            .await;
    }

    /// Detach from the fan-out fabric. The session stays in the registry;
    /// only a non-resumable invalidation removes it.
    async fn cleanup(&mut self) {
        let Some(session) = self.session.take() else { return };
        let remaining = self.state.dispatcher
            .remove_connection(session.user_id, self.conn_id)
            .await;
        info!(
            "[ws] conn {} detached, user {} has {} connections",
            self.conn_id, session.user_id, remaining,
        );
        if remaining == 0 {
            self.state.presence_offline(session.user_id).await;
        }
    }
}

fn validate_shard(shard: Option<&[i64]>, bot: bool) -> Result<(u32, u32), &'static str> {
    let Some(shard) = shard else { return Ok((0, 1)) };
    if shard.len() != 2 {
        return Err("invalid shard payload (length)");
    }
    let (id, count) = (shard[0], shard[1]);
    if id < 0 || count < 1 {
        return Err("invalid shard payload (range)");
    }
    if id >= count {
        return Err("invalid shard payload (id >= count)");
    }
    if count > 1 && !bot {
        return Err("user accounts cannot shard");
    }
    Ok((id as u32, count as u32))
}

impl UserReadyExtras {
    fn stub() -> Self {
        Self {
            notes: json!({}),
            user_settings: json!({}),
            analytics_token: "na".into(),
            required_action: None,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_validation() {
        assert_eq!(validate_shard(None, false), Ok((0, 1)));
        assert_eq!(validate_shard(Some(&[0, 1]), false), Ok((0, 1)));
        assert_eq!(validate_shard(Some(&[3, 8]), true), Ok((3, 8)));
        assert!(validate_shard(Some(&[0]), true).is_err());
        assert!(validate_shard(Some(&[0, 0]), true).is_err());
        assert!(validate_shard(Some(&[2, 2]), true).is_err());
        assert!(validate_shard(Some(&[-1, 2]), true).is_err());
        // only bots shard
        assert!(validate_shard(Some(&[0, 2]), false).is_err());
        assert!(validate_shard(Some(&[0, 2]), true).is_ok());
    }

    #[test]
    fn heartbeat_interval_is_in_window() {
        for _ in 0..100 {
            let interval = rand::thread_rng().gen_range(HB_MIN_MSEC..=HB_MAX_MSEC);
            assert!((HB_MIN_MSEC..=HB_MAX_MSEC).contains(&interval));
        }
    }
}
