use std::collections::HashMap;
use std::convert::TryFrom;

use num_enum::TryFromPrimitive;
use once_cell::sync::Lazy;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::model::ids::*;
use crate::model::presence::{Game, PresenceUpdateRequest, Status};

/// The gateway protocol version this server speaks.
pub const GATEWAY_VERSION: u8 = 6;

serde_repr! {
    #[derive(TryFromPrimitive)]
    pub enum Opcode: u8 {
        /// Receive: an event; `t` carries the event name.
        Dispatch = 0,
        /// Send/Receive: fired periodically by the client to keep the connection alive.
        Heartbeat = 1,
        /// Receive: starts a new session during the initial handshake.
        Identify = 2,
        /// Receive: the client's presence changed.
        StatusUpdate = 3,
        /// Receive: voice connection request (stubbed).
        VoiceStateUpdate = 4,
        /// Receive: voice server ping (stubbed).
        VoiceServerPing = 5,
        /// Receive: resume a previous session that was disconnected.
        Resume = 6,
        /// Send: ask the client to reconnect.
        Reconnect = 7,
        /// Receive: request offline guild members in a large guild.
        RequestGuildMembers = 8,
        /// Send: the session has been invalidated; `d` is whether it is resumable.
        InvalidSession = 9,
        /// Send: sent immediately after connecting, carries heartbeat_interval.
        Hello = 10,
        /// Send: acknowledges a received heartbeat.
        HeartbeatAck = 11,
        /// Receive: subscribe to specific guilds' viewer sets.
        GuildSync = 12,
    }
}

/// Close codes the gateway sends when it hangs up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// unknown error / heartbeat expired / slow consumer
    UnknownError = 4000,
    /// decode error or unknown op
    DecodeError = 4001,
    /// inbound frame over the size limit
    PayloadTooLarge = 4002,
    NotAuthenticated = 4003,
    AuthFailed = 4004,
    AlreadyAuthenticated = 4005,
    InvalidSeq = 4007,
    /// could not allocate a session id
    SessionTimeout = 4009,
    /// sharding required or invalid shard payload
    InvalidShard = 4011,
}

impl CloseCode {
    pub const fn code(self) -> u16 {
        self as u16
    }
}

/// `_trace` identifier pools, one set of fake server names per process.
static TRACE_SERVERS: Lazy<HashMap<&'static str, Vec<String>>> = Lazy::new(|| {
    let mut rng = rand::thread_rng();
    let mut pool = |prefix: &str| {
        (0..5)
            .map(|_| format!("{}-{}", prefix, rng.gen_range(1..100)))
            .collect::<Vec<_>>()
    };
    [
        ("hello", pool("concord-hello")),
        ("ready", pool("concord-session")),
        ("resume", pool("concord-resumer")),
    ]
    .into_iter()
    .collect()
});

/// Identifier list carried in HELLO / READY / RESUMED `_trace` fields.
pub fn trace(module: &str) -> Vec<String> {
    let mut rng = rand::thread_rng();
    TRACE_SERVERS
        .get(module)
        .map(|names| vec![names[rng.gen_range(0..names.len())].clone()])
        .unwrap_or_else(|| vec!["concord-general-1".into()])
}

/// Build a non-dispatch server frame.
pub fn op_frame(op: Opcode, d: Value) -> Value {
    json!({ "op": op as u8, "d": d })
}

/// Build an OP 0 DISPATCH frame.
pub fn dispatch_frame(seq: u64, name: &str, d: Value) -> Value {
    json!({ "op": Opcode::Dispatch as u8, "s": seq, "t": name, "d": d })
}

/// IDENTIFY payload sent by the client.
#[derive(Deserialize, Debug)]
pub struct Identify {
    pub token: String,
    #[serde(default)]
    pub properties: ConnectionProperties,
    #[serde(default)]
    pub compress: bool,
    pub large_threshold: Option<u32>,
    /// `[shard_id, shard_count]`, validated by the connection handler
    pub shard: Option<Vec<i64>>,
}

/// Connection properties announced at IDENTIFY. Only used for diagnostics
/// and the atomic-client marker.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct ConnectionProperties {
    #[serde(rename = "$os", alias = "os")]
    pub os: Option<String>,
    #[serde(rename = "$browser", alias = "browser")]
    pub browser: Option<String>,
    #[serde(rename = "$device", alias = "device")]
    pub device: Option<String>,
}

/// RESUME payload sent by the client.
#[derive(Deserialize, Debug)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// REQUEST_GUILD_MEMBERS payload.
#[derive(Deserialize, Debug)]
pub struct RequestGuildMembers {
    pub guild_id: GuildId,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub limit: u32,
}

/// STATUS_UPDATE payload. `afk`/`since` force the status to idle, matching
/// what stock clients expect.
#[derive(Deserialize, Debug, Default)]
pub struct StatusUpdate {
    pub status: Option<Status>,
    #[serde(default)]
    pub afk: bool,
    pub since: Option<u64>,
    pub game: Option<Game>,
}

impl StatusUpdate {
    pub fn into_request(self) -> PresenceUpdateRequest {
        let Self { status, afk, since, game } = self;
        let status = if afk || since.is_some() {
            Some(Status::Idle)
        } else {
            status
        };
        PresenceUpdateRequest { status, game }
    }
}

/// A decoded client frame, already routed by opcode.
#[derive(Debug)]
pub enum ClientPayload {
    Heartbeat(Option<u64>),
    Identify(Box<Identify>),
    StatusUpdate(StatusUpdate),
    VoiceStateUpdate(Value),
    VoiceServerPing,
    Resume(Resume),
    RequestGuildMembers(RequestGuildMembers),
    GuildSync(Vec<GuildId>),
}

impl ClientPayload {
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Heartbeat(_) => Opcode::Heartbeat,
            Self::Identify(_) => Opcode::Identify,
            Self::StatusUpdate(_) => Opcode::StatusUpdate,
            Self::VoiceStateUpdate(_) => Opcode::VoiceStateUpdate,
            Self::VoiceServerPing => Opcode::VoiceServerPing,
            Self::Resume(_) => Opcode::Resume,
            Self::RequestGuildMembers(_) => Opcode::RequestGuildMembers,
            Self::GuildSync(_) => Opcode::GuildSync,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("frame is not an object")]
    NotAnObject,
    #[error("missing or non-integer op")]
    MissingOp,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u64),
    #[error("op {0:?} is not sent by clients")]
    ServerOnlyOpcode(Opcode),
    #[error("bad payload for {op:?}: {error}")]
    BadData { op: Opcode, error: serde_json::Error },
}

impl TryFrom<Value> for ClientPayload {
    type Error = PayloadError;

    fn try_from(frame: Value) -> Result<Self, Self::Error> {
        if !frame.is_object() {
            return Err(PayloadError::NotAnObject);
        }
        let raw_op = frame.get("op").and_then(Value::as_u64).ok_or(PayloadError::MissingOp)?;
        let op = u8::try_from(raw_op)
            .ok()
            .and_then(|op| Opcode::try_from(op).ok())
            .ok_or(PayloadError::UnknownOpcode(raw_op))?;
        let d = frame.get("d").cloned().unwrap_or(Value::Null);

        fn data<T: serde::de::DeserializeOwned>(op: Opcode, d: Value) -> Result<T, PayloadError> {
            serde_json::from_value(d).map_err(|error| PayloadError::BadData { op, error })
        }

        match op {
            Opcode::Heartbeat => Ok(Self::Heartbeat(d.as_u64())),
            Opcode::Identify => Ok(Self::Identify(Box::new(data(op, d)?))),
            Opcode::StatusUpdate => Ok(Self::StatusUpdate(data(op, d)?)),
            Opcode::VoiceStateUpdate => Ok(Self::VoiceStateUpdate(d)),
            Opcode::VoiceServerPing => Ok(Self::VoiceServerPing),
            Opcode::Resume => Ok(Self::Resume(data(op, d)?)),
            Opcode::RequestGuildMembers => Ok(Self::RequestGuildMembers(data(op, d)?)),
            Opcode::GuildSync => Ok(Self::GuildSync(data(op, d)?)),
            Opcode::Dispatch
            | Opcode::Reconnect
            | Opcode::InvalidSession
            | Opcode::Hello
            | Opcode::HeartbeatAck => Err(PayloadError::ServerOnlyOpcode(op)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_parses() {
        let frame = json!({
            "op": 2,
            "d": {
                "token": "tok",
                "properties": {"$os": "linux", "$browser": "test"},
                "large_threshold": 100,
                "compress": true,
                "shard": [0, 1]
            }
        });
        match ClientPayload::try_from(frame).unwrap() {
            ClientPayload::Identify(identify) => {
                assert_eq!(identify.token, "tok");
                assert!(identify.compress);
                assert_eq!(identify.large_threshold, Some(100));
                assert_eq!(identify.shard, Some(vec![0, 1]));
                assert_eq!(identify.properties.browser.as_deref(), Some("test"));
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn heartbeat_allows_null_seq() {
        let parsed = ClientPayload::try_from(json!({"op": 1, "d": null})).unwrap();
        assert!(matches!(parsed, ClientPayload::Heartbeat(None)));
        let parsed = ClientPayload::try_from(json!({"op": 1, "d": 42})).unwrap();
        assert!(matches!(parsed, ClientPayload::Heartbeat(Some(42))));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let err = ClientPayload::try_from(json!({"op": 69, "d": {}})).unwrap_err();
        assert!(matches!(err, PayloadError::UnknownOpcode(69)));
    }

    #[test]
    fn server_opcodes_are_rejected_from_clients() {
        let err = ClientPayload::try_from(json!({"op": 10, "d": {}})).unwrap_err();
        assert!(matches!(err, PayloadError::ServerOnlyOpcode(Opcode::Hello)));
    }

    #[test]
    fn afk_forces_idle() {
        let update = StatusUpdate {
            status: Some(Status::Online),
            afk: true,
            since: None,
            game: None,
        };
        assert_eq!(update.into_request().status, Some(Status::Idle));
    }

    #[test]
    fn trace_is_nonempty() {
        assert!(!trace("hello").is_empty());
        assert!(!trace("nonsense").is_empty());
    }
}
