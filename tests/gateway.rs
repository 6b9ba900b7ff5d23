//! End-to-end runs against a served gateway: real sockets, real HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_tungstenite::tokio::{connect_async, ConnectStream};
use async_tungstenite::tungstenite::Message;
use async_tungstenite::WebSocketStream;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;

use concord::config::Config;
use concord::gateway::gateway_handler;
use concord::http::api_router;
use concord::model::ids::UserId;
use concord::model::user::User;
use concord::repo::{collections, MemoryRepository, Repository};
use concord::ChatState;

type Ws = WebSocketStream<ConnectStream>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    http: reqwest::Client,
}

impl TestServer {
    async fn spawn(users: &[(u64, &str, &str)]) -> Self {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        for (id, name, token) in users {
            let user = User {
                id: UserId(*id),
                username: (*name).to_string(),
                discriminator: format!("{:04}", id),
                avatar: None,
                bot: false,
                verified: true,
                email: None,
                password_hash: None,
                password_salt: None,
            };
            repo.collection(collections::USERS)
                .insert_one(serde_json::to_value(&user).unwrap())
                .await
                .unwrap();
            repo.collection(collections::TOKENS)
                .insert_one(json!({ "token": token, "user_id": user.id }))
                .await
                .unwrap();
        }

        let state = ChatState::load(repo, Config::default()).await.unwrap();
        let app = Router::new()
            .route("/", get(gateway_handler))
            .nest("/api", api_router())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            http: reqwest::Client::new(),
        }
    }

    fn api(&self, path: &str) -> String {
        format!("http://{}/api{}", self.addr, path)
    }

    async fn connect(&self) -> Ws {
        self.connect_with_params("v=6&encoding=json").await
    }

    async fn connect_with_params(&self, params: &str) -> Ws {
        let url = format!("ws://{}/?{}", self.addr, params);
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }

    async fn post(&self, token: &str, path: &str, body: Value) -> reqwest::Response {
        self.http
            .post(self.api(path))
            .header("Authorization", token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn delete(&self, token: &str, path: &str) -> reqwest::Response {
        self.http
            .delete(self.api(path))
            .header("Authorization", token)
            .send()
            .await
            .unwrap()
    }

    /// Create a guild as `owner_token` and join every other token through
    /// an invite. Returns (guild_id, channel_id).
    async fn guild_with_members(&self, owner_token: &str, member_tokens: &[&str]) -> (String, String) {
        let guild: Value = self
            .post(owner_token, "/guilds", json!({"name": "testers"}))
            .await
            .json()
            .await
            .unwrap();
        let guild_id = guild["id"].as_str().unwrap().to_string();
        let channel_id = guild["channels"][0]["id"].as_str().unwrap().to_string();

        for token in member_tokens {
            let invite: Value = self
                .post(owner_token, &format!("/channels/{}/invites", channel_id), json!({}))
                .await
                .json()
                .await
                .unwrap();
            let code = invite["code"].as_str().unwrap();
            let accepted = self.post(token, &format!("/invites/{}", code), json!({})).await;
            assert!(accepted.status().is_success());
        }

        (guild_id, channel_id)
    }
}

async fn recv_frame(ws: &mut Ws) -> Value {
    loop {
        let message = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {:?}", other),
        }
    }
}

/// Read frames until a DISPATCH with event name `t` arrives.
async fn recv_event(ws: &mut Ws, t: &str) -> Value {
    loop {
        let frame = recv_frame(ws).await;
        if frame["op"] == 0 && frame["t"] == t {
            return frame;
        }
    }
}

/// Read until the socket closes, returning the close code.
async fn recv_close(ws: &mut Ws) -> u16 {
    loop {
        let message = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close");
        match message {
            Some(Ok(Message::Close(Some(frame)))) => return frame.code.into(),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("socket ended without a close frame"),
        }
    }
}

async fn send(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// HELLO then IDENTIFY; returns (hello, ready).
async fn identify(ws: &mut Ws, token: &str) -> (Value, Value) {
    let hello = recv_frame(ws).await;
    assert_eq!(hello["op"], 10);
    let interval = hello["d"]["heartbeat_interval"].as_u64().unwrap();
    assert!((40_000..=42_000).contains(&interval), "interval {}", interval);

    send(ws, json!({
        "op": 2,
        "d": {
            "token": token,
            "properties": {"$os": "linux", "$browser": "tests"},
            "large_threshold": 250,
        }
    })).await;
    let ready = recv_event(ws, "READY").await;
    (hello, ready)
}

#[tokio::test]
async fn identify_then_live_message_then_resume() {
    let server = TestServer::spawn(&[(1, "alice", "tok_a"), (2, "bob", "tok_b")]).await;
    let (_guild_id, channel_id) = server.guild_with_members("tok_a", &["tok_b"]).await;

    // scenario: connect, identify, get READY with our guild
    let mut ws = server.connect().await;
    let (_hello, ready) = identify(&mut ws, "tok_a").await;
    let session_id = ready["d"]["session_id"].as_str().unwrap().to_string();
    assert_eq!(ready["d"]["v"], 6);
    assert_eq!(ready["d"]["user"]["username"], "alice");
    assert_eq!(ready["d"]["guilds"].as_array().unwrap().len(), 1);

    // a second client posts over HTTP; we see it live with s = 1
    let response = server
        .post("tok_b", &format!("/channels/{}/messages", channel_id), json!({"content": "hi alice"}))
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let created = recv_event(&mut ws, "MESSAGE_CREATE").await;
    assert_eq!(created["s"], 1);
    assert_eq!(created["d"]["content"], "hi alice");
    assert_eq!(created["d"]["author"]["username"], "bob");

    // drop the socket without closing the session
    drop(ws);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // resume from seq 0: the buffered MESSAGE_CREATE is replayed first
    let mut ws = server.connect().await;
    let hello = recv_frame(&mut ws).await;
    assert_eq!(hello["op"], 10);
    send(&mut ws, json!({
        "op": 6,
        "d": {"token": "tok_a", "session_id": session_id, "seq": 0}
    })).await;

    let replayed = recv_frame(&mut ws).await;
    assert_eq!(replayed["t"], "MESSAGE_CREATE");
    assert_eq!(replayed["s"], 1);
    assert_eq!(replayed["d"]["content"], "hi alice");

    recv_event(&mut ws, "RESUMED").await;
}

#[tokio::test]
async fn resume_with_current_seq_replays_nothing() {
    let server = TestServer::spawn(&[(1, "alice", "tok_a")]).await;
    server.guild_with_members("tok_a", &[]).await;

    let mut ws = server.connect().await;
    let (_, ready) = identify(&mut ws, "tok_a").await;
    let session_id = ready["d"]["session_id"].as_str().unwrap().to_string();
    drop(ws);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut ws = server.connect().await;
    recv_frame(&mut ws).await; // HELLO
    send(&mut ws, json!({
        "op": 6,
        "d": {"token": "tok_a", "session_id": session_id, "seq": 0}
    })).await;

    // nothing was buffered, so the next dispatch is RESUMED (a presence
    // refresh may precede it)
    let frame = recv_event(&mut ws, "RESUMED").await;
    assert_eq!(frame["op"], 0);
}

#[tokio::test]
async fn resume_with_unknown_session_is_invalidated() {
    let server = TestServer::spawn(&[(1, "alice", "tok_a")]).await;

    let mut ws = server.connect().await;
    recv_frame(&mut ws).await; // HELLO
    send(&mut ws, json!({
        "op": 6,
        "d": {"token": "tok_a", "session_id": "doesnotexist", "seq": 3}
    })).await;

    let frame = recv_frame(&mut ws).await;
    assert_eq!(frame["op"], 9);
    assert_eq!(frame["d"], false);
}

#[tokio::test]
async fn duplicate_nonce_returns_conflict() {
    let server = TestServer::spawn(&[(1, "alice", "tok_a")]).await;
    let (_guild_id, channel_id) = server.guild_with_members("tok_a", &[]).await;
    let path = format!("/channels/{}/messages", channel_id);

    let first = server.post("tok_a", &path, json!({"content": "one", "nonce": "a"})).await;
    assert_eq!(first.status().as_u16(), 200);

    let second = server.post("tok_a", &path, json!({"content": "two", "nonce": "a"})).await;
    assert_eq!(second.status().as_u16(), 409);
}

#[tokio::test]
async fn status_update_reaches_every_connection_and_member() {
    let server = TestServer::spawn(&[(1, "alice", "tok_a"), (2, "bob", "tok_b")]).await;
    server.guild_with_members("tok_a", &["tok_b"]).await;

    let mut alice_1 = server.connect().await;
    identify(&mut alice_1, "tok_a").await;
    let mut alice_2 = server.connect().await;
    identify(&mut alice_2, "tok_a").await;
    let mut bob = server.connect().await;
    identify(&mut bob, "tok_b").await;

    // one of alice's connections goes idle
    send(&mut alice_1, json!({
        "op": 3,
        "d": {"status": "idle", "afk": false, "since": null, "game": null}
    })).await;

    for ws in [&mut alice_1, &mut alice_2, &mut bob] {
        loop {
            let frame = recv_event(ws, "PRESENCE_UPDATE").await;
            if frame["d"]["user"]["username"] == "alice" && frame["d"]["status"] == "idle" {
                break;
            }
        }
    }
}

#[tokio::test]
async fn kick_sends_guild_delete_and_member_remove() {
    let server = TestServer::spawn(&[(1, "alice", "tok_a"), (2, "bob", "tok_b")]).await;
    let (guild_id, _channel_id) = server.guild_with_members("tok_a", &["tok_b"]).await;

    let mut alice = server.connect().await;
    identify(&mut alice, "tok_a").await;
    let mut bob = server.connect().await;
    identify(&mut bob, "tok_b").await;

    let response = server.delete("tok_a", &format!("/guilds/{}/members/2", guild_id)).await;
    assert_eq!(response.status().as_u16(), 204);

    let removed = recv_event(&mut alice, "GUILD_MEMBER_REMOVE").await;
    assert_eq!(removed["d"]["guild_id"], guild_id);
    assert_eq!(removed["d"]["user"]["username"], "bob");

    let deleted = recv_event(&mut bob, "GUILD_DELETE").await;
    assert_eq!(deleted["d"]["id"], guild_id);
    assert_eq!(deleted["d"]["unavailable"], false);
}

#[tokio::test]
async fn unsupported_version_closes_4000() {
    let server = TestServer::spawn(&[]).await;
    let mut ws = server.connect_with_params("v=5&encoding=json").await;
    assert_eq!(recv_close(&mut ws).await, 4000);
}

#[tokio::test]
async fn unknown_encoding_closes_4000() {
    let server = TestServer::spawn(&[]).await;
    let mut ws = server.connect_with_params("v=6&encoding=msgpack").await;
    assert_eq!(recv_close(&mut ws).await, 4000);
}

#[tokio::test]
async fn unknown_opcode_closes_4001() {
    let server = TestServer::spawn(&[]).await;
    let mut ws = server.connect().await;
    recv_frame(&mut ws).await; // HELLO
    send(&mut ws, json!({"op": 69, "d": {}})).await;
    assert_eq!(recv_close(&mut ws).await, 4001);
}

#[tokio::test]
async fn semantic_op_before_identify_closes_4003() {
    let server = TestServer::spawn(&[]).await;
    let mut ws = server.connect().await;
    recv_frame(&mut ws).await; // HELLO
    send(&mut ws, json!({"op": 3, "d": {"status": "idle"}})).await;
    assert_eq!(recv_close(&mut ws).await, 4003);
}

#[tokio::test]
async fn bad_token_closes_4004() {
    let server = TestServer::spawn(&[]).await;
    let mut ws = server.connect().await;
    recv_frame(&mut ws).await; // HELLO
    send(&mut ws, json!({
        "op": 2,
        "d": {"token": "wrong", "properties": {}}
    })).await;
    assert_eq!(recv_close(&mut ws).await, 4004);
}

#[tokio::test]
async fn double_identify_closes_4005() {
    let server = TestServer::spawn(&[(1, "alice", "tok_a")]).await;
    let mut ws = server.connect().await;
    identify(&mut ws, "tok_a").await;
    send(&mut ws, json!({
        "op": 2,
        "d": {"token": "tok_a", "properties": {}}
    })).await;
    assert_eq!(recv_close(&mut ws).await, 4005);
}

#[tokio::test]
async fn invalid_shard_closes_4011() {
    let server = TestServer::spawn(&[(1, "alice", "tok_a")]).await;
    let mut ws = server.connect().await;
    recv_frame(&mut ws).await; // HELLO
    send(&mut ws, json!({
        "op": 2,
        "d": {"token": "tok_a", "properties": {}, "shard": [2, 2]}
    })).await;
    assert_eq!(recv_close(&mut ws).await, 4011);
}

#[tokio::test]
async fn heartbeat_is_acked() {
    let server = TestServer::spawn(&[(1, "alice", "tok_a")]).await;
    let mut ws = server.connect().await;
    recv_frame(&mut ws).await; // HELLO
    send(&mut ws, json!({"op": 1, "d": null})).await;
    let ack = recv_frame(&mut ws).await;
    assert_eq!(ack["op"], 11);
}

#[tokio::test]
async fn oversized_frame_closes_4002() {
    let server = TestServer::spawn(&[]).await;
    let mut ws = server.connect().await;
    recv_frame(&mut ws).await; // HELLO
    let padding = "x".repeat(5000);
    send(&mut ws, json!({"op": 1, "d": null, "padding": padding})).await;
    assert_eq!(recv_close(&mut ws).await, 4002);
}

#[tokio::test]
async fn typing_start_reaches_guild_members() {
    let server = TestServer::spawn(&[(1, "alice", "tok_a"), (2, "bob", "tok_b")]).await;
    let (_guild_id, channel_id) = server.guild_with_members("tok_a", &["tok_b"]).await;

    let mut bob = server.connect().await;
    identify(&mut bob, "tok_b").await;

    let response = server
        .post("tok_a", &format!("/channels/{}/typing", channel_id), json!({}))
        .await;
    assert_eq!(response.status().as_u16(), 204);

    let typing = recv_event(&mut bob, "TYPING_START").await;
    assert_eq!(typing["d"]["channel_id"], channel_id);
    assert_eq!(typing["d"]["user_id"], "1");
}
