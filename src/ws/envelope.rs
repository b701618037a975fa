//! Wire envelope and event vocabulary for the WebSocket surface
//!
//! Every frame in either direction is one JSON `Envelope`. Outgoing payloads
//! are typed structs serialised through this single codec; the Hub only ever
//! handles the resulting pre-serialised frame. Unknown event names from
//! clients are ignored.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{now_ms, MemberWithUser, PresenceStatus, VoiceStateWithUser};

/// Closed set of event kinds carried by envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    TypingStart,
    PresenceUpdate,
    VoiceStateJoin,
    VoiceStateLeave,
    WebrtcOffer,
    WebrtcAnswer,
    WebrtcIceCandidate,
    ChannelUpdate,
    MemberJoin,
    MemberLeave,
    Heartbeat,
    HeartbeatAck,
    Ready,
    DmCallRing,
    DmCallAccept,
    DmCallReject,
    DmCallEnd,
    SubscribeChannel,
    UnsubscribeChannel,
    SubscribeServer,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::MessageCreate => "MESSAGE_CREATE",
            Event::MessageUpdate => "MESSAGE_UPDATE",
            Event::MessageDelete => "MESSAGE_DELETE",
            Event::TypingStart => "TYPING_START",
            Event::PresenceUpdate => "PRESENCE_UPDATE",
            Event::VoiceStateJoin => "VOICE_STATE_JOIN",
            Event::VoiceStateLeave => "VOICE_STATE_LEAVE",
            Event::WebrtcOffer => "WEBRTC_OFFER",
            Event::WebrtcAnswer => "WEBRTC_ANSWER",
            Event::WebrtcIceCandidate => "WEBRTC_ICE_CANDIDATE",
            Event::ChannelUpdate => "CHANNEL_UPDATE",
            Event::MemberJoin => "MEMBER_JOIN",
            Event::MemberLeave => "MEMBER_LEAVE",
            Event::Heartbeat => "HEARTBEAT",
            Event::HeartbeatAck => "HEARTBEAT_ACK",
            Event::Ready => "READY",
            Event::DmCallRing => "DM_CALL_RING",
            Event::DmCallAccept => "DM_CALL_ACCEPT",
            Event::DmCallReject => "DM_CALL_REJECT",
            Event::DmCallEnd => "DM_CALL_END",
            Event::SubscribeChannel => "SUBSCRIBE_CHANNEL",
            Event::UnsubscribeChannel => "UNSUBSCRIBE_CHANNEL",
            Event::SubscribeServer => "SUBSCRIBE_SERVER",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "MESSAGE_CREATE" => Some(Event::MessageCreate),
            "MESSAGE_UPDATE" => Some(Event::MessageUpdate),
            "MESSAGE_DELETE" => Some(Event::MessageDelete),
            "TYPING_START" => Some(Event::TypingStart),
            "PRESENCE_UPDATE" => Some(Event::PresenceUpdate),
            "VOICE_STATE_JOIN" => Some(Event::VoiceStateJoin),
            "VOICE_STATE_LEAVE" => Some(Event::VoiceStateLeave),
            "WEBRTC_OFFER" => Some(Event::WebrtcOffer),
            "WEBRTC_ANSWER" => Some(Event::WebrtcAnswer),
            "WEBRTC_ICE_CANDIDATE" => Some(Event::WebrtcIceCandidate),
            "CHANNEL_UPDATE" => Some(Event::ChannelUpdate),
            "MEMBER_JOIN" => Some(Event::MemberJoin),
            "MEMBER_LEAVE" => Some(Event::MemberLeave),
            "HEARTBEAT" => Some(Event::Heartbeat),
            "HEARTBEAT_ACK" => Some(Event::HeartbeatAck),
            "READY" => Some(Event::Ready),
            "DM_CALL_RING" => Some(Event::DmCallRing),
            "DM_CALL_ACCEPT" => Some(Event::DmCallAccept),
            "DM_CALL_REJECT" => Some(Event::DmCallReject),
            "DM_CALL_END" => Some(Event::DmCallEnd),
            "SUBSCRIBE_CHANNEL" => Some(Event::SubscribeChannel),
            "UNSUBSCRIBE_CHANNEL" => Some(Event::UnsubscribeChannel),
            "SUBSCRIBE_SERVER" => Some(Event::SubscribeServer),
            _ => None,
        }
    }
}

/// The JSON frame exchanged over the WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<Uuid>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    pub fn new<T: Serialize>(event: Event, data: &T) -> Result<Self> {
        Ok(Self {
            event: event.as_str().to_string(),
            data: serde_json::to_value(data)?,
            channel_id: None,
            server_id: None,
            timestamp: now_ms(),
        })
    }

    pub fn with_channel(mut self, channel_id: Uuid) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn with_server(mut self, server_id: Uuid) -> Self {
        self.server_id = Some(server_id);
        self
    }

    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_frame(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}

// ── Server → client payloads ──

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub status: String,
}

impl ReadyPayload {
    pub fn connected() -> Self {
        Self {
            status: "connected".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: Uuid,
    pub username: String,
    pub status: PresenceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TypingPayload {
    pub user_id: Uuid,
    pub username: String,
    pub channel_id: Uuid,
}

/// Relayed WebRTC signaling; `signal` is opaque to the server.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignalRelay {
    pub from_user_id: Uuid,
    pub from_username: String,
    pub signal: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DmCallRelay {
    pub from_user_id: Uuid,
    pub from_username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dm_channel_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MemberJoinPayload {
    pub server_id: Uuid,
    pub member: MemberWithUser,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MemberLeavePayload {
    pub server_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageDeletePayload {
    pub message_id: Uuid,
    pub channel_id: Uuid,
}

/// Channel create/update/delete notification; `channel` is absent when the
/// channel was deleted.
#[derive(Debug, Serialize)]
pub struct ChannelUpdatePayload {
    pub server_id: Uuid,
    pub channel_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<crate::models::Channel>,
}

#[derive(Debug, Serialize)]
pub struct VoiceJoinPayload {
    pub channel_id: Uuid,
    pub server_id: Uuid,
    pub voice_state: VoiceStateWithUser,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoiceLeavePayload {
    pub channel_id: Uuid,
    pub user_id: Uuid,
}

// ── Client → server payloads ──

#[derive(Debug, Default, Deserialize)]
pub struct ChannelRef {
    #[serde(default)]
    pub channel_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerRef {
    #[serde(default)]
    pub server_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub target_user_id: Uuid,
    #[serde(default)]
    pub signal: Value,
    #[serde(default)]
    pub channel_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct DmCallRequest {
    pub target_user_id: Uuid,
    #[serde(default)]
    pub dm_channel_id: Option<Uuid>,
    #[serde(default)]
    pub call_type: Option<String>,
}
