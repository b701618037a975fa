//! Router assembly: REST surface, WebSocket endpoint, static serving

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::files::MAX_UPLOAD_SIZE;
use crate::handlers::*;
use crate::state::SharedState;
use crate::ws::ws_handler;

/// Build the full application router around the shared state.
pub fn build_router(state: SharedState) -> Router {
    let api = Router::new()
        .route("/health", get(health_handler))
        // Auth (public)
        .route("/auth/register", post(register_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/refresh", post(refresh_handler))
        // Users
        .route("/users/me", get(get_me_handler).put(update_me_handler))
        .route(
            "/users/me/keys",
            get(get_my_keys_handler).post(upload_key_handler),
        )
        .route("/users/:id", get(get_user_handler))
        .route("/users/:id/keys", get(get_user_keys_handler))
        // Servers and membership
        .route("/servers", post(create_server_handler).get(list_servers_handler))
        .route("/servers/join/:code", post(join_by_invite_handler))
        .route(
            "/servers/:serverId",
            get(get_server_handler)
                .put(update_server_handler)
                .delete(delete_server_handler),
        )
        .route("/servers/:serverId/join", post(join_server_handler))
        .route("/servers/:serverId/leave", post(leave_server_handler))
        .route("/servers/:serverId/members", get(list_members_handler))
        .route(
            "/servers/:serverId/members/:userId",
            delete(kick_member_handler),
        )
        .route("/servers/:serverId/invite", post(create_invite_handler))
        // Channels
        .route(
            "/servers/:serverId/channels",
            post(create_channel_handler).get(list_channels_handler),
        )
        .route(
            "/servers/:serverId/channels/:channelId",
            get(get_channel_handler)
                .put(update_channel_handler)
                .delete(delete_channel_handler),
        )
        // Messages
        .route(
            "/channels/:channelId/messages",
            get(list_messages_handler).post(send_message_handler),
        )
        .route(
            "/channels/:channelId/messages/:messageId",
            put(edit_message_handler).delete(delete_message_handler),
        )
        // Direct messages
        .route("/dms", get(list_dms_handler).post(create_dm_handler))
        // Uploads
        .route("/upload", post(upload_handler))
        // Voice state transitions
        .route("/voice/join/:channelId", post(join_voice_handler))
        .route("/voice/leave/:channelId", post(leave_voice_handler));

    let frontend_dir = state.config.frontend_dir.clone();
    let spa_index = frontend_dir.join("index.html");

    Router::new()
        .nest("/api/v1", api)
        .route("/ws", get(ws_handler))
        .nest_service("/uploads", ServeDir::new(state.files.root()))
        .fallback_service(
            ServeDir::new(&frontend_dir).not_found_service(ServeFile::new(spa_index)),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_SIZE + 1024 * 1024))
        .with_state(state.clone())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&state)),
        )
}

fn cors_layer(state: &SharedState) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if state.config.allowed_origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    }
}
