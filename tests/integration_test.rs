//! Integration tests for the shitcord backend
//!
//! These spawn the server in-process on a random port with an in-memory
//! database and exercise the REST surface and the WebSocket fan-out
//! end-to-end.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use shitcord_server::permissions::Role;
use shitcord_server::routes::build_router;
use shitcord_server::state::{AppState, SharedState};

/// Test server instance
struct TestServer {
    base_url: String,
    client: Client,
    state: SharedState,
}

impl TestServer {
    /// Start a new test server on a random port
    async fn new() -> Self {
        let state: SharedState = Arc::new(AppState::new_in_memory().await.unwrap());
        let app = build_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{addr}");

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            base_url,
            client: Client::new(),
            state,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.base_url.replace("http://", ""))
    }

    /// Register a user; returns `(user_id, access_token, refresh_token)`.
    async fn register(&self, username: &str) -> (Uuid, String, String) {
        let response = self
            .client
            .post(self.url("/auth/register"))
            .json(&json!({
                "username": username,
                "email": format!("{username}@example.com"),
                "password": "password123",
            }))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 201, "registration failed for {username}");
        let body: Value = response.json().await.unwrap();
        (
            Uuid::parse_str(body["user"]["id"].as_str().unwrap()).unwrap(),
            body["token"].as_str().unwrap().to_string(),
            body["refresh_token"].as_str().unwrap().to_string(),
        )
    }

    /// Create a server and return `(server_id, text_channel_id, voice_channel_id)`.
    async fn create_server(&self, token: &str, name: &str) -> (Uuid, Uuid, Uuid) {
        let response = self
            .client
            .post(self.url("/servers"))
            .bearer_auth(token)
            .json(&json!({ "name": name }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);

        let body: Value = response.json().await.unwrap();
        let server_id = Uuid::parse_str(body["id"].as_str().unwrap()).unwrap();
        let channels = body["channels"].as_array().unwrap();
        let text = channels.iter().find(|c| c["type"] == "text").unwrap();
        let voice = channels.iter().find(|c| c["type"] == "voice").unwrap();
        (
            server_id,
            Uuid::parse_str(text["id"].as_str().unwrap()).unwrap(),
            Uuid::parse_str(voice["id"].as_str().unwrap()).unwrap(),
        )
    }

    async fn send_message(&self, token: &str, channel_id: Uuid, content: &str) -> Value {
        let response = self
            .client
            .post(self.url(&format!("/channels/{channel_id}/messages")))
            .bearer_auth(token)
            .json(&json!({
                "content": content,
                "nonce": "AAAA",
                "encryption_header": "e2e-aes-256-gcm",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        response.json().await.unwrap()
    }
}

/// A connected WebSocket client that has already consumed its READY frame.
struct WsClient {
    sink: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>,
    stream: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl WsClient {
    async fn connect(server: &TestServer, token: &str) -> Self {
        let url = format!("{}?token={token}", server.ws_url());
        let (ws, _) = connect_async(&url).await.unwrap();
        let (sink, stream) = ws.split();
        let mut client = Self { sink, stream };

        let ready = client.next_event(5).await.expect("expected READY");
        assert_eq!(ready["event"], "READY");
        client
    }

    async fn send(&mut self, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data, "timestamp": 0 }).to_string();
        self.sink.send(WsMessage::Text(frame)).await.unwrap();
    }

    /// Next text frame as parsed JSON, or None on timeout.
    async fn next_event(&mut self, secs: u64) -> Option<Value> {
        loop {
            match timeout(Duration::from_secs(secs), self.stream.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    return Some(serde_json::from_str(&text).unwrap())
                }
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }

    /// Round-trip a heartbeat so every frame the reader saw before it has
    /// been dispatched; skipped frames are discarded.
    async fn sync(&mut self) {
        self.send("HEARTBEAT", json!({})).await;
        loop {
            let event = self.next_event(5).await.expect("heartbeat ack lost");
            if event["event"] == "HEARTBEAT_ACK" {
                return;
            }
        }
    }

    async fn subscribe_channel(&mut self, channel_id: Uuid) {
        self.send("SUBSCRIBE_CHANNEL", json!({ "channel_id": channel_id }))
            .await;
        self.sync().await;
    }

    async fn subscribe_server(&mut self, server_id: Uuid) {
        self.send("SUBSCRIBE_SERVER", json!({ "server_id": server_id }))
            .await;
        self.sync().await;
    }

    async fn expect_silence(&mut self, ms: u64) {
        let got = timeout(Duration::from_millis(ms), self.stream.next()).await;
        assert!(got.is_err(), "expected no frame, got: {got:?}");
    }
}

// ── REST surface ──

#[tokio::test]
async fn health_endpoint() {
    let server = TestServer::new().await;

    let response = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "shitcord-server");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn register_login_refresh_flow() {
    let server = TestServer::new().await;
    let (_, _, refresh) = server.register("alice").await;

    // Duplicate username is a conflict.
    let dup = server
        .client
        .post(server.url("/auth/register"))
        .json(&json!({
            "username": "alice",
            "email": "alice2@example.com",
            "password": "password123",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(dup.status(), 409);

    // Wrong password.
    let bad = server
        .client
        .post(server.url("/auth/login"))
        .json(&json!({ "email": "alice@example.com", "password": "wrong-password" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 401);

    // Correct login returns a fresh pair.
    let login = server
        .client
        .post(server.url("/auth/login"))
        .json(&json!({ "email": "alice@example.com", "password": "password123" }))
        .send()
        .await
        .unwrap();
    assert_eq!(login.status(), 200);
    let login_body: Value = login.json().await.unwrap();
    let access = login_body["token"].as_str().unwrap().to_string();
    assert_eq!(login_body["user"]["status"], "online");

    // Refresh accepts only the refresh token.
    let refreshed = server
        .client
        .post(server.url("/auth/refresh"))
        .json(&json!({ "refresh_token": refresh }))
        .send()
        .await
        .unwrap();
    assert_eq!(refreshed.status(), 200);

    // An access token at the refresh endpoint is rejected by issuer.
    let wrong_kind = server
        .client
        .post(server.url("/auth/refresh"))
        .json(&json!({ "refresh_token": access }))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_kind.status(), 401);

    // And a refresh token is not an access token.
    let me = server
        .client
        .get(server.url("/users/me"))
        .bearer_auth(&refresh)
        .send()
        .await
        .unwrap();
    assert_eq!(me.status(), 401);
}

#[tokio::test]
async fn profile_update_and_public_view() {
    let server = TestServer::new().await;
    let (alice_id, token, _) = server.register("alice").await;

    let bad_status = server
        .client
        .put(server.url("/users/me"))
        .bearer_auth(&token)
        .json(&json!({ "status": "invisible" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_status.status(), 400);

    let updated = server
        .client
        .put(server.url("/users/me"))
        .bearer_auth(&token)
        .json(&json!({ "display_name": "Alice A.", "status": "idle" }))
        .send()
        .await
        .unwrap();
    assert_eq!(updated.status(), 200);
    let body: Value = updated.json().await.unwrap();
    assert_eq!(body["display_name"], "Alice A.");
    assert_eq!(body["status"], "idle");

    // Public view hides the email.
    let (_, bob_token, _) = server.register("bob").await;
    let public = server
        .client
        .get(server.url(&format!("/users/{alice_id}")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    assert_eq!(public.status(), 200);
    let public_body: Value = public.json().await.unwrap();
    assert_eq!(public_body["username"], "alice");
    assert!(public_body.get("email").is_none());
}

#[tokio::test]
async fn key_distribution_replaces_non_one_time_keys() {
    let server = TestServer::new().await;
    let (alice_id, alice_token, _) = server.register("alice").await;
    let (_, bob_token, _) = server.register("bob").await;

    for key in ["identity-key-1", "identity-key-2"] {
        let response = server
            .client
            .post(server.url("/users/me/keys"))
            .bearer_auth(&alice_token)
            .json(&json!({ "key_type": "identity", "public_key": key, "key_id": 1 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
    }

    let keys = server
        .client
        .get(server.url(&format!("/users/{alice_id}/keys")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    let keys: Vec<Value> = keys.json().await.unwrap();
    assert_eq!(keys.len(), 1, "old identity key must be deactivated");
    assert_eq!(keys[0]["public_key"], "identity-key-2");

    let bad = server
        .client
        .post(server.url("/users/me/keys"))
        .bearer_auth(&alice_token)
        .json(&json!({ "key_type": "master", "public_key": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);
}

#[tokio::test]
async fn role_checks_gate_channel_creation_but_not_invites() {
    let server = TestServer::new().await;
    let (_, owner_token, _) = server.register("owner").await;
    let (_, member_token, _) = server.register("member").await;

    let (server_id, _, _) = server.create_server(&owner_token, "Test Server").await;

    let join = server
        .client
        .post(server.url(&format!("/servers/{server_id}/join")))
        .bearer_auth(&member_token)
        .send()
        .await
        .unwrap();
    assert_eq!(join.status(), 200);

    // A plain member may not create channels...
    let forbidden = server
        .client
        .post(server.url(&format!("/servers/{server_id}/channels")))
        .bearer_auth(&member_token)
        .json(&json!({ "name": "plotting" }))
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status(), 403);

    // ...but may create invites.
    let invite = server
        .client
        .post(server.url(&format!("/servers/{server_id}/invite")))
        .bearer_auth(&member_token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(invite.status(), 201);

    // The owner can create channels.
    let created = server
        .client
        .post(server.url(&format!("/servers/{server_id}/channels")))
        .bearer_auth(&owner_token)
        .json(&json!({ "name": "announcements", "type": "text" }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
}

#[tokio::test]
async fn invite_exhaustion_returns_gone() {
    let server = TestServer::new().await;
    let (_, owner_token, _) = server.register("owner").await;
    let (server_id, _, _) = server.create_server(&owner_token, "Invite Server").await;

    let invite = server
        .client
        .post(server.url(&format!("/servers/{server_id}/invite")))
        .bearer_auth(&owner_token)
        .json(&json!({ "max_uses": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(invite.status(), 201);
    let invite: Value = invite.json().await.unwrap();
    let code = invite["code"].as_str().unwrap();

    for name in ["guest1", "guest2"] {
        let (_, token, _) = server.register(name).await;
        let join = server
            .client
            .post(server.url(&format!("/servers/join/{code}")))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(join.status(), 200, "{name} should join successfully");
    }

    let (_, late_token, _) = server.register("guest3").await;
    let gone = server
        .client
        .post(server.url(&format!("/servers/join/{code}")))
        .bearer_auth(&late_token)
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 410);
}

#[tokio::test]
async fn owner_cannot_leave_and_cannot_be_kicked() {
    let server = TestServer::new().await;
    let (owner_id, owner_token, _) = server.register("owner").await;
    let (mod_id, mod_token, _) = server.register("mod").await;

    let (server_id, _, _) = server.create_server(&owner_token, "Owned").await;
    server
        .state
        .db
        .add_member(server_id, mod_id, Role::Moderator)
        .await
        .unwrap();

    let leave = server
        .client
        .post(server.url(&format!("/servers/{server_id}/leave")))
        .bearer_auth(&owner_token)
        .send()
        .await
        .unwrap();
    assert_eq!(leave.status(), 400);

    let kick_owner = server
        .client
        .delete(server.url(&format!("/servers/{server_id}/members/{owner_id}")))
        .bearer_auth(&mod_token)
        .send()
        .await
        .unwrap();
    assert_eq!(kick_owner.status(), 403);
}

#[tokio::test]
async fn message_edit_and_delete_permissions() {
    let server = TestServer::new().await;
    let (_, alice_token, _) = server.register("alice").await;
    let (bob_id, bob_token, _) = server.register("bob").await;
    let (carol_id, carol_token, _) = server.register("carol").await;

    let (server_id, channel_id, _) = server.create_server(&alice_token, "Msg Server").await;
    server.state.db.add_member(server_id, bob_id, Role::Member).await.unwrap();
    server
        .state
        .db
        .add_member(server_id, carol_id, Role::Moderator)
        .await
        .unwrap();

    let message = server.send_message(&alice_token, channel_id, "b3JpZ2luYWw=").await;
    let message_id = message["id"].as_str().unwrap();

    // Only the author edits.
    let foreign_edit = server
        .client
        .put(server.url(&format!("/channels/{channel_id}/messages/{message_id}")))
        .bearer_auth(&bob_token)
        .json(&json!({ "content": "aGlqYWNrZWQ=" }))
        .send()
        .await
        .unwrap();
    assert_eq!(foreign_edit.status(), 403);

    let edit = server
        .client
        .put(server.url(&format!("/channels/{channel_id}/messages/{message_id}")))
        .bearer_auth(&alice_token)
        .json(&json!({ "content": "ZWRpdGVk" }))
        .send()
        .await
        .unwrap();
    assert_eq!(edit.status(), 200);
    let edited: Value = edit.json().await.unwrap();
    assert_eq!(edited["is_edited"], true);
    assert_eq!(edited["content"], "ZWRpdGVk");

    // A plain member cannot delete someone else's message.
    let member_delete = server
        .client
        .delete(server.url(&format!("/channels/{channel_id}/messages/{message_id}")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    assert_eq!(member_delete.status(), 403);

    // A moderator can.
    let mod_delete = server
        .client
        .delete(server.url(&format!("/channels/{channel_id}/messages/{message_id}")))
        .bearer_auth(&carol_token)
        .send()
        .await
        .unwrap();
    assert_eq!(mod_delete.status(), 200);

    let history = server
        .client
        .get(server.url(&format!("/channels/{channel_id}/messages")))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    let history: Vec<Value> = history.json().await.unwrap();
    assert!(history.is_empty(), "deleted message must leave the history");
}

#[tokio::test]
async fn message_history_pagination() {
    let server = TestServer::new().await;
    let (_, token, _) = server.register("alice").await;
    let (_, channel_id, _) = server.create_server(&token, "History").await;

    let mut ids = Vec::new();
    for i in 0..5 {
        tokio::time::sleep(Duration::from_millis(2)).await;
        let message = server.send_message(&token, channel_id, &format!("bXNnLXtpfQ=={i}")).await;
        ids.push(message["id"].as_str().unwrap().to_string());
    }

    let page = server
        .client
        .get(server.url(&format!("/channels/{channel_id}/messages?limit=2")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let page: Vec<Value> = page.json().await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0]["id"], ids[3].as_str());
    assert_eq!(page[1]["id"], ids[4].as_str());

    let earlier = server
        .client
        .get(server.url(&format!(
            "/channels/{channel_id}/messages?limit=50&before={}",
            ids[3]
        )))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let earlier: Vec<Value> = earlier.json().await.unwrap();
    assert_eq!(earlier.len(), 3);
    assert_eq!(earlier.last().unwrap()["id"], ids[2].as_str());
}

#[tokio::test]
async fn dm_creation_is_idempotent_per_pair() {
    let server = TestServer::new().await;
    let (_, alice_token, _) = server.register("alice").await;
    let (bob_id, bob_token, _) = server.register("bob").await;

    let first = server
        .client
        .post(server.url("/dms"))
        .bearer_auth(&alice_token)
        .json(&json!({ "recipient_id": bob_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 201);
    let first: Value = first.json().await.unwrap();

    // The reverse direction finds the same channel.
    let alice_id = first["user1_id"].as_str().unwrap();
    let second = server
        .client
        .post(server.url("/dms"))
        .bearer_auth(&bob_token)
        .json(&json!({ "recipient_id": alice_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    let second: Value = second.json().await.unwrap();
    assert_eq!(first["id"], second["id"]);

    let self_dm = server
        .client
        .post(server.url("/dms"))
        .bearer_auth(&bob_token)
        .json(&json!({ "recipient_id": bob_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(self_dm.status(), 409);
}

#[tokio::test]
async fn upload_stores_file_and_rejects_bad_extensions() {
    let server = TestServer::new().await;
    let (_, token, _) = server.register("uploader").await;

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(b"hello world".to_vec())
            .file_name("note.txt")
            .mime_str("text/plain")
            .unwrap(),
    );
    let response = server
        .client
        .post(server.url("/upload"))
        .bearer_auth(&token)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert!(body["url"].as_str().unwrap().starts_with("/uploads/"));
    assert_eq!(body["filename"], "note.txt");
    assert_eq!(body["size"], 11);
    assert_eq!(body["type"], "file");

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(b"MZ".to_vec()).file_name("setup.exe"),
    );
    let rejected = server
        .client
        .post(server.url("/upload"))
        .bearer_auth(&token)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 400);
}

// ── WebSocket fan-out ──

#[tokio::test]
async fn websocket_rejects_missing_or_invalid_token() {
    let server = TestServer::new().await;

    assert!(connect_async(server.ws_url()).await.is_err());
    assert!(connect_async(format!("{}?token=garbage", server.ws_url()))
        .await
        .is_err());
}

#[tokio::test]
async fn message_fanout_reaches_subscribers_but_not_the_author() {
    let server = TestServer::new().await;
    let (_, alice_token, _) = server.register("alice").await;
    let (_, bob_token, _) = server.register("bob").await;
    let (_, carol_token, _) = server.register("carol").await;

    let (_, channel_id, _) = server.create_server(&alice_token, "Fanout").await;

    let mut alice = WsClient::connect(&server, &alice_token).await;
    let mut bob = WsClient::connect(&server, &bob_token).await;
    let mut carol = WsClient::connect(&server, &carol_token).await;

    alice.subscribe_channel(channel_id).await;
    bob.subscribe_channel(channel_id).await;
    carol.subscribe_channel(channel_id).await;
    // Clear the presence chatter from the three connects.
    alice.sync().await;
    bob.sync().await;
    carol.sync().await;

    let created = server.send_message(&alice_token, channel_id, "aGVsbG8=").await;
    let message_id = created["id"].as_str().unwrap();

    for (name, client) in [("bob", &mut bob), ("carol", &mut carol)] {
        let event = client.next_event(5).await.unwrap_or_else(|| panic!("{name} got nothing"));
        assert_eq!(event["event"], "MESSAGE_CREATE");
        assert_eq!(event["channel_id"], channel_id.to_string());
        assert_eq!(event["data"]["id"], message_id);
        assert_eq!(event["data"]["content"], "aGVsbG8=");
        client.expect_silence(300).await;
    }

    // The author is excluded from its own broadcast.
    alice.expect_silence(500).await;

    // The broadcast row is already fetchable over REST.
    let history = server
        .client
        .get(server.url(&format!("/channels/{channel_id}/messages")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    let history: Vec<Value> = history.json().await.unwrap();
    assert!(history.iter().any(|m| m["id"] == message_id));
}

#[tokio::test]
async fn typing_indicator_excludes_the_typist() {
    let server = TestServer::new().await;
    let (alice_id, alice_token, _) = server.register("alice").await;
    let (_, bob_token, _) = server.register("bob").await;
    let (_, channel_id, _) = server.create_server(&alice_token, "Typing").await;

    let mut alice = WsClient::connect(&server, &alice_token).await;
    let mut bob = WsClient::connect(&server, &bob_token).await;
    alice.subscribe_channel(channel_id).await;
    bob.subscribe_channel(channel_id).await;
    alice.sync().await;
    bob.sync().await;

    alice
        .send("TYPING_START", json!({ "channel_id": channel_id }))
        .await;

    let event = bob.next_event(5).await.expect("bob should see typing");
    assert_eq!(event["event"], "TYPING_START");
    assert_eq!(event["data"]["user_id"], alice_id.to_string());
    assert_eq!(event["data"]["username"], "alice");
    assert_eq!(event["data"]["channel_id"], channel_id.to_string());

    alice.expect_silence(500).await;
}

#[tokio::test]
async fn webrtc_signal_is_relayed_to_exactly_the_target() {
    let server = TestServer::new().await;
    let (alice_id, alice_token, _) = server.register("alice").await;
    let (bob_id, bob_token, _) = server.register("bob").await;
    let (_, carol_token, _) = server.register("carol").await;
    let (_, channel_id, _) = server.create_server(&alice_token, "Calls").await;

    let mut alice = WsClient::connect(&server, &alice_token).await;
    let mut bob = WsClient::connect(&server, &bob_token).await;
    let mut carol = WsClient::connect(&server, &carol_token).await;
    alice.sync().await;
    bob.sync().await;
    carol.sync().await;

    alice
        .send(
            "WEBRTC_OFFER",
            json!({
                "target_user_id": bob_id,
                "signal": { "type": "offer", "sdp": "v=0..." },
                "channel_id": channel_id,
            }),
        )
        .await;

    let event = bob.next_event(5).await.expect("bob should get the offer");
    assert_eq!(event["event"], "WEBRTC_OFFER");
    assert_eq!(event["data"]["from_user_id"], alice_id.to_string());
    assert_eq!(event["data"]["from_username"], "alice");
    assert_eq!(event["data"]["signal"]["sdp"], "v=0...");
    assert_eq!(event["data"]["channel_id"], channel_id.to_string());

    alice.expect_silence(400).await;
    carol.expect_silence(400).await;
}

#[tokio::test]
async fn dm_call_ring_is_relayed_to_target() {
    let server = TestServer::new().await;
    let (alice_id, alice_token, _) = server.register("alice").await;
    let (bob_id, bob_token, _) = server.register("bob").await;

    let mut alice = WsClient::connect(&server, &alice_token).await;
    let mut bob = WsClient::connect(&server, &bob_token).await;
    alice.sync().await;
    bob.sync().await;

    let dm_channel_id = Uuid::new_v4();
    alice
        .send(
            "DM_CALL_RING",
            json!({
                "target_user_id": bob_id,
                "dm_channel_id": dm_channel_id,
                "call_type": "video",
            }),
        )
        .await;

    let event = bob.next_event(5).await.expect("bob should be rung");
    assert_eq!(event["event"], "DM_CALL_RING");
    assert_eq!(event["data"]["from_user_id"], alice_id.to_string());
    assert_eq!(event["data"]["call_type"], "video");
    assert_eq!(event["data"]["dm_channel_id"], dm_channel_id.to_string());
}

#[tokio::test]
async fn presence_is_broadcast_on_connect_and_disconnect() {
    let server = TestServer::new().await;
    let (_, alice_token, _) = server.register("alice").await;
    let (bob_id, bob_token, _) = server.register("bob").await;

    let mut alice = WsClient::connect(&server, &alice_token).await;
    alice.sync().await;

    let bob = WsClient::connect(&server, &bob_token).await;
    let online = alice.next_event(5).await.expect("expected online presence");
    assert_eq!(online["event"], "PRESENCE_UPDATE");
    assert_eq!(online["data"]["user_id"], bob_id.to_string());
    assert_eq!(online["data"]["status"], "online");

    drop(bob);
    let offline = alice.next_event(5).await.expect("expected offline presence");
    assert_eq!(offline["event"], "PRESENCE_UPDATE");
    assert_eq!(offline["data"]["user_id"], bob_id.to_string());
    assert_eq!(offline["data"]["status"], "offline");
}

#[tokio::test]
async fn unknown_and_malformed_frames_are_ignored() {
    let server = TestServer::new().await;
    let (_, token, _) = server.register("alice").await;

    let mut client = WsClient::connect(&server, &token).await;
    client
        .sink
        .send(WsMessage::Text("this is not json".to_string()))
        .await
        .unwrap();
    client.send("TOTALLY_MADE_UP", json!({ "x": 1 })).await;

    // The connection survives and still answers heartbeats.
    client.send("HEARTBEAT", json!({})).await;
    let ack = client.next_event(5).await.expect("expected heartbeat ack");
    assert_eq!(ack["event"], "HEARTBEAT_ACK");
}

#[tokio::test]
async fn member_join_event_reaches_server_subscribers() {
    let server = TestServer::new().await;
    let (_, owner_token, _) = server.register("owner").await;
    let (guest_id, guest_token, _) = server.register("guest").await;
    let (server_id, _, _) = server.create_server(&owner_token, "Joinable").await;

    let mut owner = WsClient::connect(&server, &owner_token).await;
    owner.subscribe_server(server_id).await;
    owner.sync().await;

    let join = server
        .client
        .post(server.url(&format!("/servers/{server_id}/join")))
        .bearer_auth(&guest_token)
        .send()
        .await
        .unwrap();
    assert_eq!(join.status(), 200);

    let event = owner.next_event(5).await.expect("expected MEMBER_JOIN");
    assert_eq!(event["event"], "MEMBER_JOIN");
    assert_eq!(event["server_id"], server_id.to_string());
    assert_eq!(event["data"]["member"]["user_id"], guest_id.to_string());
    assert_eq!(event["data"]["member"]["user"]["username"], "guest");
    assert_eq!(event["data"]["member"]["role"], "member");
}

// ── Voice ──

#[tokio::test]
async fn voice_join_emits_event_and_keeps_single_seat() {
    let server = TestServer::new().await;
    let (_, owner_token, _) = server.register("owner").await;
    let (guest_id, guest_token, _) = server.register("guest").await;
    let (server_id, text_channel, voice_channel) =
        server.create_server(&owner_token, "Voice Server").await;
    server
        .state
        .db
        .add_member(server_id, guest_id, Role::Member)
        .await
        .unwrap();

    // Joining a text channel is refused.
    let wrong_kind = server
        .client
        .post(server.url(&format!("/voice/join/{text_channel}")))
        .bearer_auth(&guest_token)
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_kind.status(), 400);

    let mut owner = WsClient::connect(&server, &owner_token).await;
    owner.subscribe_channel(voice_channel).await;
    owner.sync().await;

    let join = server
        .client
        .post(server.url(&format!("/voice/join/{voice_channel}")))
        .bearer_auth(&guest_token)
        .send()
        .await
        .unwrap();
    assert_eq!(join.status(), 200);
    let join_body: Value = join.json().await.unwrap();
    assert_eq!(join_body["voice_state"]["user_id"], guest_id.to_string());
    assert_eq!(join_body["participants"].as_array().unwrap().len(), 1);

    let event = owner.next_event(5).await.expect("expected VOICE_STATE_JOIN");
    assert_eq!(event["event"], "VOICE_STATE_JOIN");
    assert_eq!(event["data"]["channel_id"], voice_channel.to_string());
    assert_eq!(
        event["data"]["voice_state"]["user_id"],
        guest_id.to_string()
    );

    // Re-joining moves the single seat, never duplicates it.
    let rejoin = server
        .client
        .post(server.url(&format!("/voice/join/{voice_channel}")))
        .bearer_auth(&guest_token)
        .send()
        .await
        .unwrap();
    let rejoin_body: Value = rejoin.json().await.unwrap();
    assert_eq!(rejoin_body["participants"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn voice_leave_without_a_seat_still_emits_the_event() {
    let server = TestServer::new().await;
    let (_, owner_token, _) = server.register("owner").await;
    let (guest_id, guest_token, _) = server.register("guest").await;
    let (server_id, _, voice_channel) = server.create_server(&owner_token, "Empty Voice").await;
    server
        .state
        .db
        .add_member(server_id, guest_id, Role::Member)
        .await
        .unwrap();

    let mut owner = WsClient::connect(&server, &owner_token).await;
    owner.subscribe_channel(voice_channel).await;
    owner.sync().await;

    // No voice state exists; leaving is still a success and still notifies.
    let leave = server
        .client
        .post(server.url(&format!("/voice/leave/{voice_channel}")))
        .bearer_auth(&guest_token)
        .send()
        .await
        .unwrap();
    assert_eq!(leave.status(), 200);

    let event = owner.next_event(5).await.expect("expected VOICE_STATE_LEAVE");
    assert_eq!(event["event"], "VOICE_STATE_LEAVE");
    assert_eq!(event["data"]["user_id"], guest_id.to_string());
    assert_eq!(event["data"]["channel_id"], voice_channel.to_string());

    assert!(server
        .state
        .db
        .get_voice_state_for_user(guest_id)
        .await
        .unwrap()
        .is_none());
}
