//! The fan-out router and the events it routes.
//!
//! Every state change becomes an [`Event`]; the [`Dispatcher`] holds the
//! `user -> connections` index and pushes frames into each connection's
//! bounded outbound queue. Guild-level routing walks the guild's viewer set
//! and is implemented on [`ChatState`](crate::ChatState), which owns the
//! guild containers.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::model::guild::MemberView;
use crate::model::ids::*;
use crate::model::message::MessageView;
use crate::model::presence::PresenceView;
use crate::model::user::{PrivateUser, PublicUser};

use super::payload::dispatch_frame;
use super::session::Session;

/// How many outbound frames a connection can buffer before it is considered
/// a slow consumer and closed.
pub const OUTBOUND_QUEUE_FRAMES: usize = 128;

/// Everything the server dispatches over OP 0. The serialized form is the
/// `{t, d}` pair of the frame; `op` and `s` are attached per connection at
/// send time.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "t", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Ready(Ready),
    Resumed(Resumed),

    GuildCreate(Value),
    GuildUpdate(Value),
    GuildDelete(GuildDelete),
    GuildBanAdd(GuildBan),
    GuildBanRemove(GuildBan),
    GuildMemberAdd(MemberView),
    GuildMemberRemove(GuildMemberRemove),
    GuildMemberUpdate(GuildMemberUpdate),
    GuildMembersChunk(GuildMembersChunk),
    GuildRoleUpdate(GuildRoleUpdate),
    GuildSync(GuildSyncReply),

    ChannelCreate(Value),
    ChannelUpdate(Value),
    ChannelDelete(Value),
    ChannelPinsUpdate(ChannelPinsUpdate),

    MessageCreate(MessageView),
    MessageUpdate(MessageView),
    MessageDelete(MessageDelete),
    MessageDeleteBulk(MessageDeleteBulk),

    PresenceUpdate(PresenceView),
    PresencesReplace(Vec<Value>),
    TypingStart(TypingStart),
}

impl Event {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ready(_) => "READY",
            Self::Resumed(_) => "RESUMED",
            Self::GuildCreate(_) => "GUILD_CREATE",
            Self::GuildUpdate(_) => "GUILD_UPDATE",
            Self::GuildDelete(_) => "GUILD_DELETE",
            Self::GuildBanAdd(_) => "GUILD_BAN_ADD",
            Self::GuildBanRemove(_) => "GUILD_BAN_REMOVE",
            Self::GuildMemberAdd(_) => "GUILD_MEMBER_ADD",
            Self::GuildMemberRemove(_) => "GUILD_MEMBER_REMOVE",
            Self::GuildMemberUpdate(_) => "GUILD_MEMBER_UPDATE",
            Self::GuildMembersChunk(_) => "GUILD_MEMBERS_CHUNK",
            Self::GuildRoleUpdate(_) => "GUILD_ROLE_UPDATE",
            Self::GuildSync(_) => "GUILD_SYNC",
            Self::ChannelCreate(_) => "CHANNEL_CREATE",
            Self::ChannelUpdate(_) => "CHANNEL_UPDATE",
            Self::ChannelDelete(_) => "CHANNEL_DELETE",
            Self::ChannelPinsUpdate(_) => "CHANNEL_PINS_UPDATE",
            Self::MessageCreate(_) => "MESSAGE_CREATE",
            Self::MessageUpdate(_) => "MESSAGE_UPDATE",
            Self::MessageDelete(_) => "MESSAGE_DELETE",
            Self::MessageDeleteBulk(_) => "MESSAGE_DELETE_BULK",
            Self::PresenceUpdate(_) => "PRESENCE_UPDATE",
            Self::PresencesReplace(_) => "PRESENCES_REPLACE",
            Self::TypingStart(_) => "TYPING_START",
        }
    }

    /// READY and RESUMED bootstrap a connection; they are never replayed.
    pub const fn replayable(&self) -> bool {
        !matches!(self, Self::Ready(_) | Self::Resumed(_))
    }

    /// The event's `d` payload as a json value.
    pub fn data(&self) -> Value {
        let serialized = serde_json::to_value(self)
            .expect("events always serialize");
        match serialized {
            Value::Object(mut map) => map.remove("d").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct Ready {
    pub v: u8,
    pub user: PrivateUser,
    pub session_id: String,
    pub guilds: Vec<Value>,
    pub private_channels: Vec<Value>,
    #[serde(rename = "_trace")]
    pub trace: Vec<String>,
    /// extra fields only user (non-bot) READYs carry; flattening `None`
    /// emits nothing
    #[serde(flatten)]
    pub user_extras: Option<UserReadyExtras>,
}

/// Cosmetic fields stock clients expect on a user-account READY. None of
/// them carry real data here; clients tolerate the stubs.
#[derive(Serialize, Debug, Clone, Default)]
pub struct UserReadyExtras {
    pub relationships: Vec<Value>,
    pub presences: Vec<Value>,
    pub read_state: Vec<Value>,
    pub user_settings: Value,
    pub user_guild_settings: Vec<Value>,
    pub connected_accounts: Vec<Value>,
    pub notes: Value,
    pub friend_suggestion_count: u32,
    pub analytics_token: String,
    pub experiments: Vec<Value>,
    pub guild_experiments: Vec<Value>,
    pub required_action: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct Resumed {
    #[serde(rename = "_trace")]
    pub trace: Vec<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct GuildDelete {
    pub id: GuildId,
    pub unavailable: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct GuildBan {
    #[serde(flatten)]
    pub user: PublicUser,
    pub guild_id: GuildId,
}

#[derive(Serialize, Debug, Clone)]
pub struct GuildMemberRemove {
    pub guild_id: GuildId,
    pub user: PublicUser,
}

#[derive(Serialize, Debug, Clone)]
pub struct GuildMemberUpdate {
    pub guild_id: GuildId,
    pub roles: Vec<RoleId>,
    pub user: PublicUser,
    pub nick: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct GuildMembersChunk {
    pub guild_id: GuildId,
    pub members: Vec<MemberView>,
}

#[derive(Serialize, Debug, Clone)]
pub struct GuildRoleUpdate {
    pub guild_id: GuildId,
    pub role: crate::model::permissions::Role,
}

#[derive(Serialize, Debug, Clone)]
pub struct GuildSyncReply {
    pub id: GuildId,
    pub presences: Vec<PresenceView>,
    pub members: Vec<MemberView>,
}

#[derive(Serialize, Debug, Clone)]
pub struct ChannelPinsUpdate {
    pub channel_id: ChannelId,
    pub last_pin_timestamp: Option<DateTime<Utc>>,
}

#[derive(Serialize, Debug, Clone)]
pub struct MessageDelete {
    pub id: MessageId,
    pub channel_id: ChannelId,
}

#[derive(Serialize, Debug, Clone)]
pub struct MessageDeleteBulk {
    pub ids: Vec<MessageId>,
    pub channel_id: ChannelId,
}

#[derive(Serialize, Debug, Clone)]
pub struct TypingStart {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub timestamp: i64,
}

/// Commands consumed by a connection's writer task.
#[derive(Debug)]
pub enum WriterCmd {
    /// Encode and transmit a frame; `compress` wraps it in a zlib deflate.
    Frame { frame: Arc<Value>, compress: bool },
    /// Send a close frame and stop writing.
    Close { code: u16, reason: Cow<'static, str> },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("outbound queue full (slow consumer)")]
    SlowConsumer,
    #[error("connection gone")]
    Closed,
}

/// A live connection as the dispatcher sees it: the session it serves, its
/// outbound queue, and a kill switch for force-closing the socket.
#[derive(Clone)]
pub struct ConnHandle {
    pub conn_id: u64,
    pub session: Arc<Session>,
    tx: mpsc::Sender<WriterCmd>,
    kill: Arc<Notify>,
}

impl ConnHandle {
    pub fn new(conn_id: u64, session: Arc<Session>, tx: mpsc::Sender<WriterCmd>, kill: Arc<Notify>) -> Self {
        Self { conn_id, session, tx, kill }
    }

    /// Dispatch one event: assign the next seq, record it in the resume
    /// ring, and enqueue it for the writer. All under the session's
    /// dispatch lock so seq order, ring contents and queue order agree.
    /// READY and RESUMED bootstrap the stream without consuming a seq, so
    /// the first replayable event a fresh session sees is `s = 1`.
    pub async fn dispatch(&self, event: &Event) -> Result<u64, DispatchError> {
        let mut inner = self.session.lock().await;
        let seq = if event.replayable() {
            inner.sent_seq + 1
        } else {
            inner.sent_seq
        };

        let frame = Arc::new(dispatch_frame(seq, event.name(), event.data()));
        if event.replayable() {
            inner.sent_seq = seq;
            inner.record(Arc::clone(&frame));
        }

        let compress = self.session.compress && matches!(event, Event::Ready(_));
        match self.tx.try_send(WriterCmd::Frame { frame, compress }) {
            Ok(()) => Ok(seq),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("[dispatch] slow consumer on conn {}, closing", self.conn_id);
                self.force_close();
                Err(DispatchError::SlowConsumer)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }

    /// Enqueue an already-built frame (RESUME replay). The caller holds the
    /// session lock.
    pub fn enqueue_raw(&self, frame: Arc<Value>) -> Result<(), DispatchError> {
        match self.tx.try_send(WriterCmd::Frame { frame, compress: false }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.force_close();
                Err(DispatchError::SlowConsumer)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }

    /// Tear the connection down without waiting for queue space.
    pub fn force_close(&self) {
        self.kill.notify_waiters();
    }
}

/// The `user -> connections` half of the fan-out fabric.
#[derive(Default)]
pub struct Dispatcher {
    connections: RwLock<HashMap<UserId, Vec<ConnHandle>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_connection(&self, user_id: UserId, handle: ConnHandle) {
        self.connections.write().await.entry(user_id).or_default().push(handle);
    }

    /// Detach one connection. Returns how many connections the user still
    /// has; at zero the user is implicitly offline.
    pub async fn remove_connection(&self, user_id: UserId, conn_id: u64) -> usize {
        let mut connections = self.connections.write().await;
        if let Some(handles) = connections.get_mut(&user_id) {
            handles.retain(|handle| handle.conn_id != conn_id);
            if handles.is_empty() {
                connections.remove(&user_id);
                return 0;
            }
            return handles.len();
        }
        0
    }

    pub async fn connection_count(&self, user_id: UserId) -> usize {
        self.connections.read().await.get(&user_id).map_or(0, Vec::len)
    }

    pub async fn handles_for(&self, user_id: UserId) -> Vec<ConnHandle> {
        self.connections.read().await.get(&user_id).cloned().unwrap_or_default()
    }

    /// Send an event to every connection of one user. Connections that fail
    /// are detached. Returns the number of successful sends; zero means the
    /// user is effectively offline.
    pub async fn dispatch_user(&self, user_id: UserId, event: &Event) -> usize {
        let handles = self.handles_for(user_id).await;
        if handles.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut failed = Vec::new();
        for handle in &handles {
            match handle.dispatch(event).await {
                Ok(_) => delivered += 1,
                Err(error) => {
                    log::debug!("[dispatch] {} to conn {} failed: {}", event.name(), handle.conn_id, error);
                    failed.push(handle.conn_id);
                }
            }
        }

        if !failed.is_empty() {
            let mut connections = self.connections.write().await;
            if let Some(handles) = connections.get_mut(&user_id) {
                handles.retain(|handle| !failed.contains(&handle.conn_id));
                if handles.is_empty() {
                    connections.remove(&user_id);
                }
            }
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use crate::gateway::payload::ConnectionProperties;
    use crate::utils::random_session_id;

    use super::*;

    fn test_session(user: UserId) -> Arc<Session> {
        Arc::new(Session::new(
            random_session_id(),
            "tok".into(),
            user,
            false,
            (0, 1),
            false,
            250,
            ConnectionProperties::default(),
        ))
    }

    fn typing(user: UserId) -> Event {
        Event::TypingStart(TypingStart {
            channel_id: ChannelId(5),
            user_id: user,
            timestamp: 0,
        })
    }

    #[test]
    fn event_names_serialize_screaming_snake() {
        let event = typing(UserId(1));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["t"], "TYPING_START");
        assert_eq!(value["d"]["channel_id"], "5");
        assert_eq!(event.name(), "TYPING_START");
    }

    #[test]
    fn ready_is_not_replayable() {
        let ready = Event::Resumed(Resumed { trace: vec![] });
        assert!(!ready.replayable());
        assert!(typing(UserId(1)).replayable());
    }

    #[tokio::test]
    async fn dispatch_assigns_increasing_seqs_and_fills_ring() {
        let session = test_session(UserId(1));
        let (tx, mut rx) = mpsc::channel(8);
        let handle = ConnHandle::new(1, Arc::clone(&session), tx, Arc::new(Notify::new()));

        let s1 = handle.dispatch(&typing(UserId(1))).await.unwrap();
        let s2 = handle.dispatch(&typing(UserId(1))).await.unwrap();
        assert_eq!((s1, s2), (1, 2));

        for expect in 1..=2u64 {
            match rx.recv().await.unwrap() {
                WriterCmd::Frame { frame, .. } => assert_eq!(frame["s"].as_u64(), Some(expect)),
                WriterCmd::Close { .. } => panic!("unexpected close"),
            }
        }

        let inner = session.lock().await;
        assert_eq!(inner.sent_seq, 2);
        assert_eq!(inner.replay_after(0).len(), 2);
    }

    #[tokio::test]
    async fn full_queue_counts_as_slow_consumer() {
        let session = test_session(UserId(1));
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnHandle::new(1, Arc::clone(&session), tx, Arc::new(Notify::new()));

        assert!(handle.dispatch(&typing(UserId(1))).await.is_ok());
        let err = handle.dispatch(&typing(UserId(1))).await.unwrap_err();
        assert!(matches!(err, DispatchError::SlowConsumer));
    }

    #[tokio::test]
    async fn failed_connections_are_detached() {
        let dispatcher = Dispatcher::new();
        let user = UserId(9);

        let session = test_session(user);
        let (tx, rx) = mpsc::channel(4);
        drop(rx); // dead connection
        dispatcher
            .add_connection(user, ConnHandle::new(1, session, tx, Arc::new(Notify::new())))
            .await;

        assert_eq!(dispatcher.dispatch_user(user, &typing(user)).await, 0);
        assert_eq!(dispatcher.connection_count(user).await, 0);
    }

    #[tokio::test]
    async fn multi_connection_fanout() {
        let dispatcher = Dispatcher::new();
        let user = UserId(4);

        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        dispatcher.add_connection(user, ConnHandle::new(1, test_session(user), tx_a, Arc::new(Notify::new()))).await;
        dispatcher.add_connection(user, ConnHandle::new(2, test_session(user), tx_b, Arc::new(Notify::new()))).await;

        assert_eq!(dispatcher.dispatch_user(user, &typing(user)).await, 2);
        assert!(matches!(rx_a.recv().await, Some(WriterCmd::Frame { .. })));
        assert!(matches!(rx_b.recv().await, Some(WriterCmd::Frame { .. })));
    }
}
