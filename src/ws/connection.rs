//! Per-connection WebSocket actor
//!
//! Each accepted socket becomes two tasks: the writer drains the bounded
//! outbound queue to the wire, the reader parses inbound envelopes and
//! dispatches them. The reader never writes to the socket and the writer
//! never reads; the queue is the only shared state. Either side failing
//! tears the connection down through a single unregister.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::envelope::{
    ChannelRef, DmCallRelay, DmCallRequest, Envelope, Event, ServerRef, SignalRelay, SignalRequest,
    TypingPayload, VoiceLeavePayload,
};
use super::hub::OUTBOUND_QUEUE_CAPACITY;
use crate::auth::{verify_token, ACCESS_ISSUER};
use crate::error::ApiError;
use crate::state::SharedState;

/// WebSocket upgrade endpoint. Browsers cannot set upgrade headers, so the
/// bearer token arrives as `?token=`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<SharedState>,
) -> Response {
    let Some(token) = params.get("token") else {
        return ApiError::unauthorized("Missing token parameter").into_response();
    };

    let claims = match verify_token(token, &state.config.jwt_secret, ACCESS_ISSUER) {
        Ok(claims) => claims,
        Err(_) => return ApiError::unauthorized("Invalid or expired token").into_response(),
    };

    info!(user_id = %claims.user_id, "websocket connection established");
    ws.on_upgrade(move |socket| handle_socket(socket, claims.user_id, claims.username, state))
}

async fn handle_socket(socket: WebSocket, user_id: Uuid, username: String, state: SharedState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);

    let seq = state.hub.next_seq();
    state.hub.register(user_id, username.clone(), seq, tx.clone());

    // Writer: drains the queue until every sender (hub registry + heartbeat
    // handle) is gone, then lets the socket drop.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // Reader: one frame at a time; unparseable frames are skipped, any
    // socket error ends the connection.
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_client_frame(&text, user_id, &username, &tx, &state).await;
            }
            Ok(Message::Close(_)) => {
                info!(%user_id, "websocket closed by client");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(%user_id, "websocket read error: {err}");
                break;
            }
        }
    }

    state.hub.unregister(user_id, seq);

    if state.config.clear_voice_on_disconnect {
        clear_voice_state(user_id, &state).await;
    }

    // Drop the heartbeat sender so the writer can finish draining.
    drop(tx);
    let _ = writer.await;
    info!(%user_id, "websocket handler terminated");
}

async fn handle_client_frame(
    text: &str,
    user_id: Uuid,
    username: &str,
    tx: &mpsc::Sender<String>,
    state: &SharedState,
) {
    let Ok(envelope) = Envelope::from_frame(text) else {
        return;
    };
    let Some(event) = Event::from_str(&envelope.event) else {
        return;
    };

    match event {
        Event::Heartbeat => {
            // Reply directly on this connection, bypassing the hub.
            if let Ok(frame) = Envelope::new(Event::HeartbeatAck, &serde_json::json!({}))
                .and_then(|e| e.to_frame())
            {
                let _ = tx.try_send(frame);
            }
        }

        Event::SubscribeChannel => {
            let Ok(payload) = serde_json::from_value::<ChannelRef>(envelope.data) else {
                return;
            };
            if let Some(channel_id) = payload.channel_id {
                state.hub.subscribe_channel(user_id, channel_id);
            }
        }

        Event::UnsubscribeChannel => {
            let Ok(payload) = serde_json::from_value::<ChannelRef>(envelope.data) else {
                return;
            };
            if let Some(channel_id) = payload.channel_id {
                state.hub.unsubscribe_channel(user_id, channel_id);
            }
        }

        Event::SubscribeServer => {
            let Ok(payload) = serde_json::from_value::<ServerRef>(envelope.data) else {
                return;
            };
            if let Some(server_id) = payload.server_id {
                state.hub.subscribe_server(user_id, server_id);
            }
        }

        Event::TypingStart => {
            let Ok(payload) = serde_json::from_value::<ChannelRef>(envelope.data) else {
                return;
            };
            let Some(channel_id) = payload.channel_id else {
                return;
            };
            // Stateless: clients clear the indicator themselves after a
            // short grace period.
            state
                .hub
                .broadcast_to_channel(
                    channel_id,
                    Event::TypingStart,
                    &TypingPayload {
                        user_id,
                        username: username.to_string(),
                        channel_id,
                    },
                    Some(user_id),
                )
                .await;
        }

        Event::WebrtcOffer | Event::WebrtcAnswer | Event::WebrtcIceCandidate => {
            let Ok(payload) = serde_json::from_value::<SignalRequest>(envelope.data) else {
                return;
            };
            // The signal blob is relayed untouched.
            state
                .hub
                .send_to_user(
                    payload.target_user_id,
                    event,
                    &SignalRelay {
                        from_user_id: user_id,
                        from_username: username.to_string(),
                        signal: payload.signal,
                        channel_id: payload.channel_id,
                    },
                )
                .await;
        }

        Event::DmCallRing | Event::DmCallAccept | Event::DmCallReject | Event::DmCallEnd => {
            let Ok(payload) = serde_json::from_value::<DmCallRequest>(envelope.data) else {
                return;
            };
            state
                .hub
                .send_to_user(
                    payload.target_user_id,
                    event,
                    &DmCallRelay {
                        from_user_id: user_id,
                        from_username: username.to_string(),
                        dm_channel_id: payload.dm_channel_id,
                        call_type: payload.call_type,
                    },
                )
                .await;
        }

        // Server-emitted kinds coming back from a client are ignored.
        _ => {}
    }
}

/// Disconnect policy: when enabled, a dropped socket releases the user's
/// voice seat and notifies the channel.
async fn clear_voice_state(user_id: Uuid, state: &SharedState) {
    let voice_state = match state.db.get_voice_state_for_user(user_id).await {
        Ok(Some(vs)) => vs,
        Ok(None) => return,
        Err(err) => {
            error!(%user_id, "failed to look up voice state on disconnect: {err:#}");
            return;
        }
    };

    if let Err(err) = state.db.delete_voice_states_for_user(user_id).await {
        error!(%user_id, "failed to clear voice state on disconnect: {err:#}");
        return;
    }

    state
        .hub
        .broadcast_to_channel(
            voice_state.channel_id,
            Event::VoiceStateLeave,
            &VoiceLeavePayload {
                channel_id: voice_state.channel_id,
                user_id,
            },
            Some(user_id),
        )
        .await;
}
