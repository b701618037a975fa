//! HTTP handlers for the REST surface
//!
//! Every state-changing handler follows the same discipline: validate,
//! authorise against the store, write, and only then post one broadcast to
//! the hub. A subscriber that sees the notification can always fetch the
//! canonical row over REST and find it present.

use anyhow::anyhow;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::info;
use uuid::Uuid;

use crate::auth::{issue_token_pair, verify_token, AuthUser, REFRESH_ISSUER};
use crate::crypto::generate_invite_code;
use crate::error::{ApiError, ApiResult};
use crate::files::{categorize_extension, extension_allowed, MAX_UPLOAD_SIZE};
use crate::models::{
    now_ms, AuthResponse, Channel, ChannelKind, CreateChannelRequest, CreateDmRequest,
    CreateInviteRequest, CreateServerRequest, DmChannelWithUsers, EditMessageRequest,
    HealthResponse, Invite, KeyType, KeyUploadRequest, LoginRequest, MemberWithUser, MessageKind,
    MessageHistoryQuery, MessageWithAuthor, PresenceStatus, PublicUser, RefreshRequest,
    RegisterRequest, SendMessageRequest, ServerMember, ServerWithChannels, UpdateChannelRequest,
    UpdateProfileRequest, UpdateServerRequest, UploadResponse, User, UserPublicKey,
    VoiceJoinResponse, VoiceStateWithUser,
};
use crate::permissions::{has_min_role, Role};
use crate::state::SharedState;
use crate::validation;
use crate::ws::envelope::{
    ChannelUpdatePayload, MemberJoinPayload, MemberLeavePayload, MessageDeletePayload,
    VoiceJoinPayload, VoiceLeavePayload,
};
use crate::ws::Event;

// ── Health ──

pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "shitcord-server".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ── Auth ──

pub async fn register_handler(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    validation::validate_username(&req.username).map_err(ApiError::BadRequest)?;
    validation::validate_password(&req.password).map_err(ApiError::BadRequest)?;
    validation::validate_email(&req.email).map_err(ApiError::BadRequest)?;

    if state
        .db
        .username_or_email_taken(&req.username, &req.email)
        .await?
    {
        return Err(ApiError::conflict("Username or email already taken"));
    }

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| anyhow!("failed to hash password: {e}"))?
        .to_string();

    let user = state
        .db
        .create_user(&req.username, &req.email, &password_hash)
        .await?;

    let (token, refresh_token) = issue_token_pair(
        user.id,
        &user.username,
        &state.config.jwt_secret,
        state.config.jwt_expiry_hours,
    )?;

    info!(user_id = %user.id, username = %user.username, "registered new user");
    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            token,
            refresh_token,
            user,
        }),
    ))
}

pub async fn login_handler(
    State(state): State<SharedState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let mut user = state
        .db
        .get_user_by_email(&req.email)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid email or password"))?;

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|e| anyhow!("stored password hash is invalid: {e}"))?;
    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::unauthorized("Invalid email or password"))?;

    state
        .db
        .set_user_status(user.id, PresenceStatus::Online)
        .await?;
    user.status = PresenceStatus::Online;

    let (token, refresh_token) = issue_token_pair(
        user.id,
        &user.username,
        &state.config.jwt_secret,
        state.config.jwt_expiry_hours,
    )?;

    info!(user_id = %user.id, "user authenticated");
    Ok(Json(AuthResponse {
        token,
        refresh_token,
        user,
    }))
}

pub async fn refresh_handler(
    State(state): State<SharedState>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<AuthResponse>> {
    // Access tokens are rejected here: only the refresh issuer is accepted.
    let claims = verify_token(&req.refresh_token, &state.config.jwt_secret, REFRESH_ISSUER)
        .map_err(|_| ApiError::unauthorized("Invalid refresh token"))?;

    let user = state
        .db
        .get_user_by_id(claims.user_id)
        .await?
        .ok_or_else(|| ApiError::unauthorized("User not found"))?;

    let (token, refresh_token) = issue_token_pair(
        user.id,
        &user.username,
        &state.config.jwt_secret,
        state.config.jwt_expiry_hours,
    )?;

    Ok(Json(AuthResponse {
        token,
        refresh_token,
        user,
    }))
}

// ── Users ──

pub async fn get_me_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
) -> ApiResult<Json<User>> {
    let user = state
        .db
        .get_user_by_id(auth.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(Json(user))
}

pub async fn update_me_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Json(req): Json<UpdateProfileRequest>,
) -> ApiResult<Json<User>> {
    if req.display_name.is_none() && req.avatar_url.is_none() && req.bio.is_none() && req.status.is_none()
    {
        return Err(ApiError::bad_request("No fields to update"));
    }

    if let Some(display_name) = &req.display_name {
        validation::validate_display_name(display_name).map_err(ApiError::BadRequest)?;
    }
    if let Some(bio) = &req.bio {
        validation::validate_bio(bio).map_err(ApiError::BadRequest)?;
    }
    let status = req
        .status
        .as_deref()
        .map(|s| {
            PresenceStatus::from_str(s)
                .ok_or_else(|| ApiError::bad_request("Invalid status. Must be: online, offline, idle, dnd"))
        })
        .transpose()?;

    let user = state
        .db
        .update_user_profile(auth.user_id, req.display_name, req.avatar_url, req.bio, status)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    Ok(Json(user))
}

pub async fn get_user_handler(
    _auth: AuthUser,
    State(state): State<SharedState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<PublicUser>> {
    let user = state
        .db
        .get_user_by_id(user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(Json(user.public()))
}

// ── E2E key distribution ──

pub async fn get_my_keys_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
) -> ApiResult<Json<Vec<UserPublicKey>>> {
    Ok(Json(state.db.get_active_public_keys(auth.user_id).await?))
}

pub async fn upload_key_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Json(req): Json<KeyUploadRequest>,
) -> ApiResult<(StatusCode, Json<UserPublicKey>)> {
    let key_type =
        KeyType::from_str(&req.key_type).ok_or_else(|| ApiError::bad_request("Invalid key type"))?;
    if req.public_key.is_empty() {
        return Err(ApiError::bad_request("Public key cannot be empty"));
    }

    let key = state
        .db
        .upload_public_key(auth.user_id, key_type, &req.public_key, req.key_id, &req.signature)
        .await?;

    Ok((StatusCode::CREATED, Json(key)))
}

pub async fn get_user_keys_handler(
    _auth: AuthUser,
    State(state): State<SharedState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Vec<UserPublicKey>>> {
    Ok(Json(state.db.get_active_public_keys(user_id).await?))
}

// ── Servers ──

pub async fn create_server_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Json(req): Json<CreateServerRequest>,
) -> ApiResult<(StatusCode, Json<ServerWithChannels>)> {
    validation::validate_server_name(&req.name).map_err(ApiError::BadRequest)?;

    let (server, channels) = state
        .db
        .create_server(
            req.name.trim(),
            &req.description,
            auth.user_id,
            req.is_private,
            &generate_invite_code(),
        )
        .await?;

    info!(server_id = %server.id, owner = %auth.user_id, "server created");
    Ok((
        StatusCode::CREATED,
        Json(ServerWithChannels { server, channels }),
    ))
}

pub async fn list_servers_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
) -> ApiResult<Json<Vec<ServerWithChannels>>> {
    let servers = state.db.get_user_servers(auth.user_id).await?;

    let mut result = Vec::with_capacity(servers.len());
    for server in servers {
        let channels = state.db.get_server_channels(server.id).await?;
        result.push(ServerWithChannels { server, channels });
    }
    Ok(Json(result))
}

pub async fn get_server_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<Json<ServerWithChannels>> {
    let server = state
        .db
        .get_server(server_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Server not found"))?;
    require_membership(&state, server_id, auth.user_id).await?;

    let channels = state.db.get_server_channels(server_id).await?;
    Ok(Json(ServerWithChannels { server, channels }))
}

pub async fn update_server_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(server_id): Path<Uuid>,
    Json(req): Json<UpdateServerRequest>,
) -> ApiResult<Json<ServerWithChannels>> {
    require_min_role(&state, server_id, auth.user_id, Role::Admin).await?;

    if let Some(name) = &req.name {
        validation::validate_server_name(name).map_err(ApiError::BadRequest)?;
    }

    let server = state
        .db
        .update_server(server_id, req.name, req.description, req.icon_url, req.is_private)
        .await?
        .ok_or_else(|| ApiError::not_found("Server not found"))?;

    let channels = state.db.get_server_channels(server_id).await?;
    Ok(Json(ServerWithChannels { server, channels }))
}

pub async fn delete_server_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let server = state
        .db
        .get_server(server_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Server not found"))?;

    if server.owner_id != auth.user_id {
        return Err(ApiError::forbidden("Only the server owner can delete the server"));
    }

    state.db.delete_server(server_id).await?;
    info!(%server_id, "server deleted");
    Ok(Json(serde_json::json!({ "message": "Server deleted successfully" })))
}

pub async fn join_server_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let server = state
        .db
        .get_server(server_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Server not found"))?;

    if server.is_private {
        return Err(ApiError::forbidden(
            "This server is private. Use an invite link to join.",
        ));
    }
    if state.db.is_member(server_id, auth.user_id).await? {
        return Err(ApiError::conflict("Already a member of this server"));
    }

    state.db.add_member(server_id, auth.user_id, Role::Member).await?;
    broadcast_member_join(&state, server_id, auth.user_id).await?;

    Ok(Json(serde_json::json!({ "message": "Joined server successfully" })))
}

pub async fn leave_server_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let server = state
        .db
        .get_server(server_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Server not found"))?;

    if server.owner_id == auth.user_id {
        return Err(ApiError::bad_request(
            "Server owner cannot leave. Transfer ownership or delete the server.",
        ));
    }

    if !state.db.remove_member(server_id, auth.user_id).await? {
        return Err(ApiError::not_found("You are not a member of this server"));
    }

    state
        .hub
        .broadcast_to_server(
            server_id,
            Event::MemberLeave,
            &MemberLeavePayload {
                server_id,
                user_id: auth.user_id,
            },
            None,
        )
        .await;

    Ok(Json(serde_json::json!({ "message": "Left server successfully" })))
}

pub async fn list_members_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<Json<Vec<MemberWithUser>>> {
    require_membership(&state, server_id, auth.user_id).await?;
    Ok(Json(state.db.get_members(server_id).await?))
}

pub async fn kick_member_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path((server_id, target_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<serde_json::Value>> {
    require_min_role(&state, server_id, auth.user_id, Role::Moderator).await?;

    let server = state
        .db
        .get_server(server_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Server not found"))?;
    if server.owner_id == target_id {
        return Err(ApiError::forbidden("Cannot kick the server owner"));
    }

    if !state.db.remove_member(server_id, target_id).await? {
        return Err(ApiError::not_found("Member not found"));
    }

    info!(%server_id, kicked = %target_id, by = %auth.user_id, "member kicked");
    state
        .hub
        .broadcast_to_server(
            server_id,
            Event::MemberLeave,
            &MemberLeavePayload {
                server_id,
                user_id: target_id,
            },
            None,
        )
        .await;

    Ok(Json(serde_json::json!({ "message": "Member kicked successfully" })))
}

// ── Invites ──

pub async fn create_invite_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(server_id): Path<Uuid>,
    req: Option<Json<CreateInviteRequest>>,
) -> ApiResult<(StatusCode, Json<Invite>)> {
    require_membership(&state, server_id, auth.user_id).await?;
    let Json(req) = req.unwrap_or_default();

    if req.max_uses < 0 {
        return Err(ApiError::bad_request("max_uses cannot be negative"));
    }
    let expires_at = req
        .expires_in_hours
        .map(|hours| now_ms() + (hours as i64) * 3600 * 1000);

    let invite = state
        .db
        .create_invite(
            &generate_invite_code(),
            server_id,
            auth.user_id,
            req.max_uses,
            expires_at,
        )
        .await?;

    info!(%server_id, code = %invite.code, "invite created");
    Ok((StatusCode::CREATED, Json(invite)))
}

pub async fn join_by_invite_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    // Explicit invites first, then the server's built-in code.
    let invite = state.db.get_invite_by_code(&code).await?;
    let server_id = match &invite {
        Some(invite) => {
            if invite.is_exhausted() {
                return Err(ApiError::gone(
                    "This invite has reached its maximum number of uses",
                ));
            }
            if invite.is_expired(now_ms()) {
                return Err(ApiError::gone("This invite has expired"));
            }
            invite.server_id
        }
        None => state
            .db
            .get_server_by_invite_code(&code)
            .await?
            .ok_or_else(|| ApiError::not_found("Invalid invite code"))?
            .id,
    };

    if state.db.is_member(server_id, auth.user_id).await? {
        return Err(ApiError::conflict("Already a member of this server"));
    }

    state.db.add_member(server_id, auth.user_id, Role::Member).await?;
    if let Some(invite) = &invite {
        state.db.increment_invite_uses(invite.id).await?;
    }

    broadcast_member_join(&state, server_id, auth.user_id).await?;

    let server = state
        .db
        .get_server(server_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Server not found"))?;
    let channels = state.db.get_server_channels(server_id).await?;

    Ok(Json(serde_json::json!({
        "message": "Joined server successfully",
        "server": ServerWithChannels { server, channels },
    })))
}

// ── Channels ──

pub async fn create_channel_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(server_id): Path<Uuid>,
    Json(req): Json<CreateChannelRequest>,
) -> ApiResult<(StatusCode, Json<Channel>)> {
    require_min_role(&state, server_id, auth.user_id, Role::Admin).await?;
    validation::validate_channel_name(&req.name).map_err(ApiError::BadRequest)?;
    let kind = parse_channel_kind(req.kind.as_deref())?;

    let channel = state
        .db
        .create_channel(server_id, &req.name, &req.topic, kind, req.position, req.is_private)
        .await?;

    broadcast_channel_update(&state, server_id, channel.id, Some(channel.clone())).await;
    Ok((StatusCode::CREATED, Json(channel)))
}

pub async fn list_channels_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Channel>>> {
    require_membership(&state, server_id, auth.user_id).await?;
    Ok(Json(state.db.get_server_channels(server_id).await?))
}

pub async fn get_channel_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path((server_id, channel_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Channel>> {
    require_membership(&state, server_id, auth.user_id).await?;
    let channel = channel_in_server(&state, server_id, channel_id).await?;
    Ok(Json(channel))
}

pub async fn update_channel_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path((server_id, channel_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateChannelRequest>,
) -> ApiResult<Json<Channel>> {
    require_min_role(&state, server_id, auth.user_id, Role::Admin).await?;
    channel_in_server(&state, server_id, channel_id).await?;

    if let Some(name) = &req.name {
        validation::validate_channel_name(name).map_err(ApiError::BadRequest)?;
    }

    let channel = state
        .db
        .update_channel(channel_id, req.name, req.topic, req.position, req.is_private)
        .await?
        .ok_or_else(|| ApiError::not_found("Channel not found"))?;

    broadcast_channel_update(&state, server_id, channel_id, Some(channel.clone())).await;
    Ok(Json(channel))
}

pub async fn delete_channel_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path((server_id, channel_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<serde_json::Value>> {
    require_min_role(&state, server_id, auth.user_id, Role::Admin).await?;
    channel_in_server(&state, server_id, channel_id).await?;

    state.db.delete_channel(channel_id).await?;
    broadcast_channel_update(&state, server_id, channel_id, None).await;

    Ok(Json(serde_json::json!({ "message": "Channel deleted successfully" })))
}

// ── Messages ──

pub async fn list_messages_handler(
    _auth: AuthUser,
    State(state): State<SharedState>,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<MessageHistoryQuery>,
) -> ApiResult<Json<Vec<MessageWithAuthor>>> {
    if !state.db.channel_or_dm_exists(channel_id).await? {
        return Err(ApiError::not_found("Channel not found"));
    }

    let limit = match query.limit {
        Some(limit) if limit > 100 => 100,
        Some(limit) if limit >= 1 => limit,
        _ => 50,
    };

    let messages = state.db.list_messages(channel_id, limit, query.before).await?;
    Ok(Json(messages))
}

pub async fn send_message_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(channel_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<MessageWithAuthor>)> {
    if req.content.is_empty() && req.attachment_url.as_deref().unwrap_or("").is_empty() {
        return Err(ApiError::bad_request("Message content cannot be empty"));
    }
    let kind = parse_message_kind(req.kind.as_deref())?;

    if !state.db.channel_or_dm_exists(channel_id).await? {
        return Err(ApiError::not_found("Channel not found"));
    }

    let message = state
        .db
        .create_message(
            channel_id,
            auth.user_id,
            &req.content,
            &req.nonce,
            &req.encryption_header,
            kind,
            req.attachment_url,
            req.reply_to_id,
        )
        .await?;

    let full = state
        .db
        .get_message_with_author(message.id)
        .await?
        .ok_or_else(|| ApiError::Internal(anyhow!("message vanished after insert")))?;

    // Persist first, broadcast second: a subscriber that sees the event can
    // already fetch the row.
    state
        .hub
        .broadcast_to_channel(channel_id, Event::MessageCreate, &full, Some(auth.user_id))
        .await;

    Ok((StatusCode::CREATED, Json(full)))
}

pub async fn edit_message_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path((_channel_id, message_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<Json<MessageWithAuthor>> {
    let message = state
        .db
        .get_message(message_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Message not found"))?;

    if message.author_id != auth.user_id {
        return Err(ApiError::forbidden("You can only edit your own messages"));
    }

    state
        .db
        .update_message(message_id, &req.content, &req.nonce, &req.encryption_header)
        .await?;

    let full = state
        .db
        .get_message_with_author(message_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Message not found"))?;

    state
        .hub
        .broadcast_to_channel(
            message.channel_id,
            Event::MessageUpdate,
            &full,
            Some(auth.user_id),
        )
        .await;

    Ok(Json(full))
}

pub async fn delete_message_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path((_channel_id, message_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<serde_json::Value>> {
    let message = state
        .db
        .get_message(message_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Message not found"))?;

    // Authors delete their own messages; moderators and up delete any
    // message in their server.
    if message.author_id != auth.user_id {
        match state.db.get_channel(message.channel_id).await? {
            Some(channel) => {
                require_min_role(&state, channel.server_id, auth.user_id, Role::Moderator).await?;
            }
            None => return Err(ApiError::forbidden("Insufficient permissions")),
        }
    }

    state.db.soft_delete_message(message_id).await?;

    state
        .hub
        .broadcast_to_channel(
            message.channel_id,
            Event::MessageDelete,
            &MessageDeletePayload {
                message_id,
                channel_id: message.channel_id,
            },
            Some(auth.user_id),
        )
        .await;

    Ok(Json(serde_json::json!({ "message": "Message deleted successfully" })))
}

// ── Direct messages ──

pub async fn list_dms_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
) -> ApiResult<Json<Vec<DmChannelWithUsers>>> {
    Ok(Json(state.db.get_user_dm_channels(auth.user_id).await?))
}

pub async fn create_dm_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Json(req): Json<CreateDmRequest>,
) -> ApiResult<(StatusCode, Json<DmChannelWithUsers>)> {
    if req.recipient_id == auth.user_id {
        return Err(ApiError::conflict("Cannot create a DM with yourself"));
    }
    if state.db.get_user_by_id(req.recipient_id).await?.is_none() {
        return Err(ApiError::not_found("User not found"));
    }

    // Idempotent per unordered user pair.
    if let Some(existing) = state.db.find_dm_channel(auth.user_id, req.recipient_id).await? {
        let full = state
            .db
            .get_dm_channel_with_users(existing.id)
            .await?
            .ok_or_else(|| ApiError::Internal(anyhow!("dm channel vanished")))?;
        return Ok((StatusCode::OK, Json(full)));
    }

    let dm = state.db.create_dm_channel(auth.user_id, req.recipient_id).await?;
    let full = state
        .db
        .get_dm_channel_with_users(dm.id)
        .await?
        .ok_or_else(|| ApiError::Internal(anyhow!("dm channel vanished after insert")))?;

    Ok((StatusCode::CREATED, Json(full)))
}

// ── Uploads ──

pub async fn upload_handler(
    _auth: AuthUser,
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::bad_request("Invalid multipart body"))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or("").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        let extension = std::path::Path::new(&filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        if !extension_allowed(&extension) {
            return Err(ApiError::bad_request(format!(
                "File type '.{extension}' is not allowed"
            )));
        }

        let data = field
            .bytes()
            .await
            .map_err(|_| ApiError::bad_request("Failed to read file"))?;
        if data.len() > MAX_UPLOAD_SIZE {
            return Err(ApiError::bad_request("File too large. Maximum size is 50MB"));
        }

        let stored = state.files.store(&extension, &data).await?;
        return Ok((
            StatusCode::CREATED,
            Json(UploadResponse {
                url: stored.url,
                filename,
                size: data.len() as u64,
                kind: categorize_extension(&extension).to_string(),
                content_type,
            }),
        ));
    }

    Err(ApiError::bad_request("No file provided"))
}

// ── Voice ──

pub async fn join_voice_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(channel_id): Path<Uuid>,
) -> ApiResult<Json<VoiceJoinResponse>> {
    let channel = state
        .db
        .get_channel(channel_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Channel not found"))?;

    if !channel.kind.carries_media() {
        return Err(ApiError::bad_request("This is not a voice/video channel"));
    }
    require_membership(&state, channel.server_id, auth.user_id).await?;

    // Any prior seat is released in the same transaction: at most one voice
    // state per user.
    let voice_state = state
        .db
        .upsert_voice_state(auth.user_id, channel_id, channel.server_id)
        .await?;

    let user = state
        .db
        .get_user_by_id(auth.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?
        .public();
    let voice_state = VoiceStateWithUser {
        state: voice_state,
        user,
    };
    let participants = state.db.get_channel_voice_states(channel_id).await?;

    state
        .hub
        .broadcast_to_channel(
            channel_id,
            Event::VoiceStateJoin,
            &VoiceJoinPayload {
                channel_id,
                server_id: channel.server_id,
                voice_state: VoiceStateWithUser {
                    state: voice_state.state.clone(),
                    user: voice_state.user.clone(),
                },
            },
            Some(auth.user_id),
        )
        .await;

    Ok(Json(VoiceJoinResponse {
        voice_state,
        participants,
    }))
}

pub async fn leave_voice_handler(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(channel_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    // Leaving without a seat is a success and still notifies the channel.
    state.db.delete_voice_state(auth.user_id, channel_id).await?;

    state
        .hub
        .broadcast_to_channel(
            channel_id,
            Event::VoiceStateLeave,
            &VoiceLeavePayload {
                channel_id,
                user_id: auth.user_id,
            },
            Some(auth.user_id),
        )
        .await;

    Ok(Json(serde_json::json!({ "message": "Left voice channel" })))
}

// ── Helpers ──

async fn require_membership(
    state: &SharedState,
    server_id: Uuid,
    user_id: Uuid,
) -> ApiResult<ServerMember> {
    state
        .db
        .get_member(server_id, user_id)
        .await?
        .ok_or_else(|| ApiError::forbidden("You are not a member of this server"))
}

async fn require_min_role(
    state: &SharedState,
    server_id: Uuid,
    user_id: Uuid,
    min: Role,
) -> ApiResult<ServerMember> {
    let member = require_membership(state, server_id, user_id).await?;
    if !has_min_role(member.role, min) {
        return Err(ApiError::forbidden("Insufficient permissions"));
    }
    Ok(member)
}

async fn channel_in_server(
    state: &SharedState,
    server_id: Uuid,
    channel_id: Uuid,
) -> ApiResult<Channel> {
    let channel = state
        .db
        .get_channel(channel_id)
        .await?
        .filter(|c| c.server_id == server_id)
        .ok_or_else(|| ApiError::not_found("Channel not found"))?;
    Ok(channel)
}

fn parse_channel_kind(kind: Option<&str>) -> ApiResult<ChannelKind> {
    match kind {
        None | Some("") => Ok(ChannelKind::Text),
        Some(kind) => ChannelKind::from_str(kind)
            .ok_or_else(|| ApiError::bad_request("Invalid channel type. Must be: text, voice, or video")),
    }
}

fn parse_message_kind(kind: Option<&str>) -> ApiResult<MessageKind> {
    match kind {
        None | Some("") => Ok(MessageKind::Text),
        Some(kind) => MessageKind::from_str(kind)
            .ok_or_else(|| ApiError::bad_request("Invalid message type")),
    }
}

async fn broadcast_member_join(
    state: &SharedState,
    server_id: Uuid,
    user_id: Uuid,
) -> ApiResult<()> {
    let member = state
        .db
        .get_member_with_user(server_id, user_id)
        .await?
        .ok_or_else(|| ApiError::Internal(anyhow!("member vanished after insert")))?;

    state
        .hub
        .broadcast_to_server(
            server_id,
            Event::MemberJoin,
            &MemberJoinPayload { server_id, member },
            None,
        )
        .await;
    Ok(())
}

async fn broadcast_channel_update(
    state: &SharedState,
    server_id: Uuid,
    channel_id: Uuid,
    channel: Option<Channel>,
) {
    state
        .hub
        .broadcast_to_server(
            server_id,
            Event::ChannelUpdate,
            &ChannelUpdatePayload {
                server_id,
                channel_id,
                channel,
            },
            None,
        )
        .await;
}
