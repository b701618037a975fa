//! Data models: durable entities and request/response types
//!
//! Timestamps are UTC milliseconds since the epoch. Message content, nonce,
//! and encryption header are opaque strings produced by client-side E2E
//! encryption; the server never inspects them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::permissions::Role;

// ── Durable entities ──

/// A user account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub display_name: String,
    pub avatar_url: String,
    pub status: PresenceStatus,
    pub bio: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    pub fn public(&self) -> PublicUser {
        PublicUser {
            id: self.id,
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
            status: self.status,
            bio: self.bio.clone(),
        }
    }
}

/// The subset of a user profile visible to other users
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub avatar_url: String,
    pub status: PresenceStatus,
    pub bio: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    Idle,
    Dnd,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
            PresenceStatus::Idle => "idle",
            PresenceStatus::Dnd => "dnd",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "online" => Some(PresenceStatus::Online),
            "offline" => Some(PresenceStatus::Offline),
            "idle" => Some(PresenceStatus::Idle),
            "dnd" => Some(PresenceStatus::Dnd),
            _ => None,
        }
    }
}

/// An E2E encryption public key published by a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPublicKey {
    pub id: Uuid,
    pub user_id: Uuid,
    pub key_type: KeyType,
    pub public_key: String,
    pub key_id: i64,
    pub signature: String,
    pub is_active: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Identity,
    SignedPrekey,
    OneTimePrekey,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Identity => "identity",
            KeyType::SignedPrekey => "signed_prekey",
            KeyType::OneTimePrekey => "one_time_prekey",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "identity" => Some(KeyType::Identity),
            "signed_prekey" => Some(KeyType::SignedPrekey),
            "one_time_prekey" => Some(KeyType::OneTimePrekey),
            _ => None,
        }
    }
}

/// A server (guild)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub icon_url: String,
    pub owner_id: Uuid,
    pub invite_code: String,
    pub is_private: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A server together with its channel list
#[derive(Debug, Clone, Serialize)]
pub struct ServerWithChannels {
    #[serde(flatten)]
    pub server: Server,
    pub channels: Vec<Channel>,
}

/// A user's membership in a server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMember {
    pub id: Uuid,
    pub server_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub nickname: String,
    pub joined_at: i64,
}

/// Membership row joined with the member's public profile
#[derive(Debug, Clone, Serialize)]
pub struct MemberWithUser {
    #[serde(flatten)]
    pub member: ServerMember,
    pub user: PublicUser,
}

/// A channel within a server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub server_id: Uuid,
    pub name: String,
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    pub position: i64,
    pub is_private: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Text,
    Voice,
    Video,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Text => "text",
            ChannelKind::Voice => "voice",
            ChannelKind::Video => "video",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ChannelKind::Text),
            "voice" => Some(ChannelKind::Voice),
            "video" => Some(ChannelKind::Video),
            _ => None,
        }
    }

    pub fn carries_media(&self) -> bool {
        matches!(self, ChannelKind::Voice | ChannelKind::Video)
    }
}

/// A direct-message channel between two users
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmChannel {
    pub id: Uuid,
    pub user1_id: Uuid,
    pub user2_id: Uuid,
    pub created_at: i64,
}

/// DM channel joined with both participants' public profiles
#[derive(Debug, Clone, Serialize)]
pub struct DmChannelWithUsers {
    #[serde(flatten)]
    pub channel: DmChannel,
    pub user1: PublicUser,
    pub user2: PublicUser,
}

/// A chat message; content/nonce/encryption_header are opaque E2E blobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub nonce: String,
    pub encryption_header: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Uuid>,
    pub is_edited: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::System => "system",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "file" => Some(MessageKind::File),
            "system" => Some(MessageKind::System),
            _ => None,
        }
    }
}

/// Message joined with its author's public profile
#[derive(Debug, Clone, Serialize)]
pub struct MessageWithAuthor {
    #[serde(flatten)]
    pub message: Message,
    pub author: PublicUser,
}

/// The fact that a user currently occupies a voice/video channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceState {
    pub id: Uuid,
    pub user_id: Uuid,
    pub channel_id: Uuid,
    pub server_id: Uuid,
    pub joined_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceStateWithUser {
    #[serde(flatten)]
    pub state: VoiceState,
    pub user: PublicUser,
}

/// A redeemable server invite. `max_uses == 0` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    pub id: Uuid,
    pub code: String,
    pub server_id: Uuid,
    pub creator_id: Uuid,
    pub max_uses: i64,
    pub uses: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

impl Invite {
    pub fn is_exhausted(&self) -> bool {
        self.max_uses > 0 && self.uses >= self.max_uses
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|t| t <= now_ms)
    }
}

// ── Request / response types ──

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub refresh_token: String,
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KeyUploadRequest {
    pub key_type: String,
    pub public_key: String,
    #[serde(default)]
    pub key_id: i64,
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateServerRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub icon_url: Option<String>,
    pub is_private: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
    #[serde(default)]
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateChannelRequest {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub position: Option<i64>,
    pub is_private: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub encryption_header: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub attachment_url: Option<String>,
    pub reply_to_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub encryption_header: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateInviteRequest {
    #[serde(default)]
    pub max_uses: i64,
    pub expires_in_hours: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateDmRequest {
    pub recipient_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct MessageHistoryQuery {
    pub limit: Option<i64>,
    pub before: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub url: String,
    pub filename: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub content_type: String,
}

#[derive(Debug, Serialize)]
pub struct VoiceJoinResponse {
    pub voice_state: VoiceStateWithUser,
    pub participants: Vec<VoiceStateWithUser>,
}

/// Current time as UTC milliseconds since the epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
