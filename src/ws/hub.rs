//! The Hub: single-writer actor owning the Subscription Index
//!
//! All registry mutations and fan-outs are linearised through one task.
//! Connection lifecycle commands arrive on an unbounded channel and take
//! priority over the bounded broadcast channel, so a broadcast never touches
//! a connection the hub already knows is gone.
//!
//! Fan-out never blocks on a slow consumer: each delivery is a non-blocking
//! offer to the connection's bounded outbound queue, and a full queue drops
//! the frame for that connection only. A client that fell behind reconciles
//! over REST after reconnecting.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::envelope::{Envelope, Event, PresencePayload, ReadyPayload};
use crate::models::PresenceStatus;

/// Capacity of each connection's outbound frame queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the hub's broadcast command channel.
const BROADCAST_QUEUE_CAPACITY: usize = 256;

/// Where a broadcast is routed. Resolution priority is user, then channel,
/// then server.
#[derive(Debug, Clone, Copy)]
enum Target {
    User(Uuid),
    Channel(Uuid),
    Server(Uuid),
}

#[derive(Debug)]
struct Broadcast {
    frame: String,
    target: Target,
    exclude: Option<Uuid>,
}

enum Command {
    Register {
        user_id: Uuid,
        username: String,
        seq: u64,
        sender: mpsc::Sender<String>,
    },
    Unregister {
        user_id: Uuid,
        seq: u64,
    },
    SubscribeChannel {
        user_id: Uuid,
        channel_id: Uuid,
    },
    UnsubscribeChannel {
        user_id: Uuid,
        channel_id: Uuid,
    },
    SubscribeServer {
        user_id: Uuid,
        server_id: Uuid,
    },
}

/// A registered connection as the hub sees it. The subscription sets live
/// here, owned by the hub task; the connection itself only holds a handle.
struct Client {
    seq: u64,
    username: String,
    sender: mpsc::Sender<String>,
    channels: HashSet<Uuid>,
    servers: HashSet<Uuid>,
}

/// Cloneable handle used by connections and HTTP handlers to talk to the hub.
#[derive(Clone)]
pub struct HubHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    broadcast_tx: mpsc::Sender<Broadcast>,
    seq: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl HubHandle {
    /// Monotonic connection sequence; disambiguates reconnects under the
    /// same user id.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Frames dropped so far because an outbound queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn register(&self, user_id: Uuid, username: String, seq: u64, sender: mpsc::Sender<String>) {
        let _ = self.cmd_tx.send(Command::Register {
            user_id,
            username,
            seq,
            sender,
        });
    }

    pub fn unregister(&self, user_id: Uuid, seq: u64) {
        let _ = self.cmd_tx.send(Command::Unregister { user_id, seq });
    }

    pub fn subscribe_channel(&self, user_id: Uuid, channel_id: Uuid) {
        let _ = self.cmd_tx.send(Command::SubscribeChannel { user_id, channel_id });
    }

    pub fn unsubscribe_channel(&self, user_id: Uuid, channel_id: Uuid) {
        let _ = self.cmd_tx.send(Command::UnsubscribeChannel { user_id, channel_id });
    }

    pub fn subscribe_server(&self, user_id: Uuid, server_id: Uuid) {
        let _ = self.cmd_tx.send(Command::SubscribeServer { user_id, server_id });
    }

    /// Serialise an event and enqueue it for every subscriber of a channel.
    pub async fn broadcast_to_channel<T: Serialize>(
        &self,
        channel_id: Uuid,
        event: Event,
        data: &T,
        exclude: Option<Uuid>,
    ) {
        let envelope = Envelope::new(event, data).map(|e| e.with_channel(channel_id));
        self.dispatch(envelope, Target::Channel(channel_id), exclude).await;
    }

    /// Serialise an event and enqueue it for every connection subscribed to
    /// a server.
    pub async fn broadcast_to_server<T: Serialize>(
        &self,
        server_id: Uuid,
        event: Event,
        data: &T,
        exclude: Option<Uuid>,
    ) {
        let envelope = Envelope::new(event, data).map(|e| e.with_server(server_id));
        self.dispatch(envelope, Target::Server(server_id), exclude).await;
    }

    /// Serialise an event and enqueue it for one user, if connected.
    pub async fn send_to_user<T: Serialize>(&self, target: Uuid, event: Event, data: &T) {
        let envelope = Envelope::new(event, data);
        self.dispatch(envelope, Target::User(target), None).await;
    }

    async fn dispatch(
        &self,
        envelope: anyhow::Result<Envelope>,
        target: Target,
        exclude: Option<Uuid>,
    ) {
        let frame = match envelope.and_then(|e| e.to_frame()) {
            Ok(frame) => frame,
            Err(err) => {
                error!("failed to encode event frame: {err:#}");
                return;
            }
        };

        if self
            .broadcast_tx
            .send(Broadcast { frame, target, exclude })
            .await
            .is_err()
        {
            error!("hub task is gone, broadcast lost");
        }
    }
}

/// The hub state. Only the hub task touches it.
pub struct Hub {
    clients: HashMap<Uuid, Client>,
    channels: HashMap<Uuid, HashSet<Uuid>>,
    dropped: Arc<AtomicU64>,
}

impl Hub {
    /// Spawn the hub task and return a handle to it.
    pub fn spawn() -> HubHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));

        let hub = Hub {
            clients: HashMap::new(),
            channels: HashMap::new(),
            dropped: dropped.clone(),
        };
        tokio::spawn(hub.run(cmd_rx, broadcast_rx));

        HubHandle {
            cmd_tx,
            broadcast_tx,
            seq: Arc::new(AtomicU64::new(1)),
            dropped,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut broadcast_rx: mpsc::Receiver<Broadcast>,
    ) {
        loop {
            // Lifecycle commands win over fan-out so a broadcast never races
            // a registration it should have observed.
            tokio::select! {
                biased;
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                broadcast = broadcast_rx.recv() => match broadcast {
                    Some(broadcast) => self.handle_broadcast(broadcast),
                    None => break,
                },
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Register {
                user_id,
                username,
                seq,
                sender,
            } => {
                if let Some(old) = self.clients.remove(&user_id) {
                    debug!(%user_id, "replacing existing connection");
                    self.purge_channel_subscriptions(user_id, &old.channels);
                }

                if let Ok(frame) =
                    Envelope::new(Event::Ready, &ReadyPayload::connected()).and_then(|e| e.to_frame())
                {
                    let _ = sender.try_send(frame);
                }

                info!(%user_id, %username, "client connected");
                self.clients.insert(
                    user_id,
                    Client {
                        seq,
                        username: username.clone(),
                        sender,
                        channels: HashSet::new(),
                        servers: HashSet::new(),
                    },
                );

                self.broadcast_presence(user_id, &username, PresenceStatus::Online);
            }

            Command::Unregister { user_id, seq } => {
                // A stale unregister from a replaced connection must not
                // tear down its successor.
                if !self.clients.get(&user_id).is_some_and(|c| c.seq == seq) {
                    return;
                }
                let Some(client) = self.clients.remove(&user_id) else {
                    return;
                };
                self.purge_channel_subscriptions(user_id, &client.channels);

                info!(%user_id, username = %client.username, "client disconnected");
                self.broadcast_presence(user_id, &client.username, PresenceStatus::Offline);
            }

            Command::SubscribeChannel { user_id, channel_id } => {
                let Some(client) = self.clients.get_mut(&user_id) else {
                    return;
                };
                client.channels.insert(channel_id);
                self.channels.entry(channel_id).or_default().insert(user_id);
            }

            Command::UnsubscribeChannel { user_id, channel_id } => {
                if let Some(client) = self.clients.get_mut(&user_id) {
                    client.channels.remove(&channel_id);
                }
                let empty = self
                    .channels
                    .get_mut(&channel_id)
                    .map(|bucket| {
                        bucket.remove(&user_id);
                        bucket.is_empty()
                    })
                    .unwrap_or(false);
                if empty {
                    self.channels.remove(&channel_id);
                }
            }

            Command::SubscribeServer { user_id, server_id } => {
                if let Some(client) = self.clients.get_mut(&user_id) {
                    client.servers.insert(server_id);
                }
            }
        }
    }

    fn handle_broadcast(&mut self, broadcast: Broadcast) {
        match broadcast.target {
            Target::User(user_id) => {
                if let Some(client) = self.clients.get(&user_id) {
                    self.offer(client, &broadcast.frame);
                }
            }

            Target::Channel(channel_id) => {
                let Some(bucket) = self.channels.get(&channel_id) else {
                    return;
                };
                for user_id in bucket {
                    if broadcast.exclude == Some(*user_id) {
                        continue;
                    }
                    if let Some(client) = self.clients.get(user_id) {
                        self.offer(client, &broadcast.frame);
                    }
                }
            }

            Target::Server(server_id) => {
                for (user_id, client) in &self.clients {
                    if broadcast.exclude == Some(*user_id) {
                        continue;
                    }
                    if client.servers.contains(&server_id) {
                        self.offer(client, &broadcast.frame);
                    }
                }
            }
        }
    }

    fn purge_channel_subscriptions(&mut self, user_id: Uuid, subscribed: &HashSet<Uuid>) {
        for channel_id in subscribed {
            let empty = self
                .channels
                .get_mut(channel_id)
                .map(|bucket| {
                    bucket.remove(&user_id);
                    bucket.is_empty()
                })
                .unwrap_or(false);
            if empty {
                self.channels.remove(channel_id);
            }
        }
    }

    fn broadcast_presence(&self, about: Uuid, username: &str, status: PresenceStatus) {
        let payload = PresencePayload {
            user_id: about,
            username: username.to_string(),
            status,
        };
        let Ok(frame) = Envelope::new(Event::PresenceUpdate, &payload).and_then(|e| e.to_frame())
        else {
            return;
        };

        for (user_id, client) in &self.clients {
            if *user_id != about {
                self.offer(client, &frame);
            }
        }
    }

    /// Non-blocking enqueue; a full queue drops the frame for this
    /// connection only.
    fn offer(&self, client: &Client, frame: &str) {
        match client.sender.try_send(frame.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("outbound queue full, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn new_conn() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(OUTBOUND_QUEUE_CAPACITY)
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<String>) -> Envelope {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed");
        Envelope::from_frame(&frame).unwrap()
    }

    /// Push a marker through the broadcast channel and drain `rx` up to it.
    /// Everything the hub processed before the marker has been delivered by
    /// the time it returns.
    async fn flush(hub: &HubHandle, user: Uuid, rx: &mut mpsc::Receiver<String>) -> Vec<Envelope> {
        hub.send_to_user(user, Event::HeartbeatAck, &serde_json::json!({ "marker": true }))
            .await;
        let mut seen = Vec::new();
        loop {
            let envelope = recv_frame(rx).await;
            if envelope.event == "HEARTBEAT_ACK" && envelope.data["marker"] == true {
                return seen;
            }
            seen.push(envelope);
        }
    }

    fn register(hub: &HubHandle, name: &str) -> (Uuid, u64, mpsc::Receiver<String>) {
        let user_id = Uuid::new_v4();
        let seq = hub.next_seq();
        let (tx, rx) = new_conn();
        hub.register(user_id, name.to_string(), seq, tx);
        (user_id, seq, rx)
    }

    #[tokio::test]
    async fn register_sends_ready_then_presence_to_others() {
        let hub = Hub::spawn();
        let (a, _, mut rx_a) = register(&hub, "alice");
        assert_eq!(recv_frame(&mut rx_a).await.event, "READY");

        let (b, _, mut rx_b) = register(&hub, "bob");
        assert_eq!(recv_frame(&mut rx_b).await.event, "READY");

        let presence = recv_frame(&mut rx_a).await;
        assert_eq!(presence.event, "PRESENCE_UPDATE");
        assert_eq!(presence.data["user_id"], b.to_string());
        assert_eq!(presence.data["status"], "online");

        // The new connection never hears about itself.
        let leftovers = flush(&hub, b, &mut rx_b).await;
        assert!(leftovers.is_empty(), "unexpected frames: {leftovers:?}");
        let _ = a;
    }

    #[tokio::test]
    async fn unregister_emits_offline_presence_and_purges_index() {
        let hub = Hub::spawn();
        let (a, _, mut rx_a) = register(&hub, "alice");
        let (b, seq_b, mut rx_b) = register(&hub, "bob");
        let channel = Uuid::new_v4();
        hub.subscribe_channel(b, channel);

        let _ = flush(&hub, a, &mut rx_a).await;
        drop(rx_b);
        hub.unregister(b, seq_b);

        let presence = recv_frame(&mut rx_a).await;
        assert_eq!(presence.event, "PRESENCE_UPDATE");
        assert_eq!(presence.data["user_id"], b.to_string());
        assert_eq!(presence.data["status"], "offline");

        // The channel bucket no longer routes to the dead connection.
        hub.broadcast_to_channel(channel, Event::MessageCreate, &serde_json::json!({}), None)
            .await;
        let leftovers = flush(&hub, a, &mut rx_a).await;
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn channel_fanout_excludes_sender() {
        let hub = Hub::spawn();
        let (a, _, mut rx_a) = register(&hub, "alice");
        let (b, _, mut rx_b) = register(&hub, "bob");
        let (c, _, mut rx_c) = register(&hub, "carol");

        let channel = Uuid::new_v4();
        for user in [a, b, c] {
            hub.subscribe_channel(user, channel);
        }

        let _ = flush(&hub, a, &mut rx_a).await;
        let _ = flush(&hub, b, &mut rx_b).await;
        let _ = flush(&hub, c, &mut rx_c).await;

        hub.broadcast_to_channel(
            channel,
            Event::MessageCreate,
            &serde_json::json!({ "id": "m1" }),
            Some(a),
        )
        .await;

        for rx in [&mut rx_b, &mut rx_c] {
            let envelope = recv_frame(rx).await;
            assert_eq!(envelope.event, "MESSAGE_CREATE");
            assert_eq!(envelope.channel_id, Some(channel));
        }

        let leftovers = flush(&hub, a, &mut rx_a).await;
        assert!(leftovers.is_empty(), "sender must not receive its own event");
    }

    #[tokio::test]
    async fn duplicate_subscribe_delivers_once() {
        let hub = Hub::spawn();
        let (a, _, mut rx_a) = register(&hub, "alice");
        let (b, _, mut rx_b) = register(&hub, "bob");

        let channel = Uuid::new_v4();
        hub.subscribe_channel(b, channel);
        hub.subscribe_channel(b, channel);

        let _ = flush(&hub, b, &mut rx_b).await;
        hub.broadcast_to_channel(channel, Event::MessageCreate, &serde_json::json!({}), Some(a))
            .await;

        let delivered = flush(&hub, b, &mut rx_b).await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].event, "MESSAGE_CREATE");
        let _ = rx_a;
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = Hub::spawn();
        let (a, _, mut rx_a) = register(&hub, "alice");
        let channel = Uuid::new_v4();
        hub.subscribe_channel(a, channel);
        hub.unsubscribe_channel(a, channel);

        hub.broadcast_to_channel(channel, Event::MessageCreate, &serde_json::json!({}), None)
            .await;

        let frames = flush(&hub, a, &mut rx_a).await;
        // Only the READY from registration precedes the marker.
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "READY");
    }

    #[tokio::test]
    async fn server_broadcast_scans_subscribed_connections() {
        let hub = Hub::spawn();
        let (a, _, mut rx_a) = register(&hub, "alice");
        let (b, _, mut rx_b) = register(&hub, "bob");
        let server = Uuid::new_v4();
        hub.subscribe_server(a, server);

        let _ = flush(&hub, a, &mut rx_a).await;
        let _ = flush(&hub, b, &mut rx_b).await;

        hub.broadcast_to_server(server, Event::MemberJoin, &serde_json::json!({}), None)
            .await;

        let envelope = recv_frame(&mut rx_a).await;
        assert_eq!(envelope.event, "MEMBER_JOIN");
        assert_eq!(envelope.server_id, Some(server));

        let leftovers = flush(&hub, b, &mut rx_b).await;
        assert!(leftovers.is_empty(), "non-subscriber must not receive server events");
    }

    #[tokio::test]
    async fn user_target_reaches_exactly_one_connection() {
        let hub = Hub::spawn();
        let (a, _, mut rx_a) = register(&hub, "alice");
        let (b, _, mut rx_b) = register(&hub, "bob");

        let _ = flush(&hub, a, &mut rx_a).await;
        let _ = flush(&hub, b, &mut rx_b).await;

        hub.send_to_user(b, Event::WebrtcOffer, &serde_json::json!({ "sdp": "v=0" }))
            .await;

        let envelope = recv_frame(&mut rx_b).await;
        assert_eq!(envelope.event, "WEBRTC_OFFER");

        let leftovers = flush(&hub, a, &mut rx_a).await;
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn full_outbound_queue_drops_frames_for_that_connection_only() {
        let hub = Hub::spawn();
        let (a, _, mut rx_a) = register(&hub, "alice");
        let (b, _, mut rx_b) = register(&hub, "bob");

        let channel = Uuid::new_v4();
        hub.subscribe_channel(a, channel);
        hub.subscribe_channel(b, channel);

        // Drain the handshake frames, then stop draining A.
        let _ = flush(&hub, a, &mut rx_a).await;
        let _ = flush(&hub, b, &mut rx_b).await;

        for i in 0..300 {
            hub.broadcast_to_channel(
                channel,
                Event::MessageCreate,
                &serde_json::json!({ "seq": i }),
                None,
            )
            .await;
            // B keeps draining, so the hub never drops for B.
            let envelope = recv_frame(&mut rx_b).await;
            assert_eq!(envelope.event, "MESSAGE_CREATE");
        }

        // A's queue held at most its capacity; the rest were dropped.
        let mut received = 0;
        while let Ok(Some(_)) = timeout(Duration::from_millis(50), rx_a.recv()).await {
            received += 1;
        }
        assert_eq!(received, OUTBOUND_QUEUE_CAPACITY);
        assert_eq!(hub.dropped_frames(), 300 - OUTBOUND_QUEUE_CAPACITY as u64);
    }

    #[tokio::test]
    async fn stale_unregister_does_not_tear_down_successor() {
        let hub = Hub::spawn();
        let user_id = Uuid::new_v4();

        let old_seq = hub.next_seq();
        let (old_tx, _old_rx) = new_conn();
        hub.register(user_id, "alice".to_string(), old_seq, old_tx);

        let new_seq = hub.next_seq();
        let (new_tx, mut new_rx) = new_conn();
        hub.register(user_id, "alice".to_string(), new_seq, new_tx);
        assert_eq!(recv_frame(&mut new_rx).await.event, "READY");

        // The old connection's death arrives late.
        hub.unregister(user_id, old_seq);

        hub.send_to_user(user_id, Event::HeartbeatAck, &serde_json::json!({}))
            .await;
        assert_eq!(recv_frame(&mut new_rx).await.event, "HEARTBEAT_ACK");
    }
}
