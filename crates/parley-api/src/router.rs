use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::middleware::require_auth;
use crate::{AppState, chat, files, identity, membership};

/// Assembles the full route surface. Group and file routes authenticate
/// with the external identity header; thread routes require the
/// service-issued bearer token.
pub fn router(state: AppState) -> Router {
    let group_routes = Router::new()
        .route("/userToken", get(identity::get_user_token))
        .route("/groups/{group_id}/user", post(membership::join_group))
        .route("/groups/{group_id}/chatThread", get(membership::get_chat_thread))
        .route(
            "/groups/{group_id}/files",
            get(files::list_files).post(files::upload_file),
        )
        .route("/groups/{group_id}/files/{file_id}", get(files::download_file))
        .with_state(state.clone());

    let thread_routes = Router::new()
        .route("/threads/{thread_id}", get(chat::get_thread))
        .route("/threads/{thread_id}/members", get(chat::get_members))
        .route(
            "/threads/{thread_id}/messages",
            get(chat::list_messages).post(chat::send_message),
        )
        .route(
            "/threads/{thread_id}/messages/{message_id}",
            get(chat::get_message),
        )
        .route(
            "/threads/{thread_id}/typing",
            get(chat::get_typing).post(chat::post_typing),
        )
        .route(
            "/threads/{thread_id}/readReceipts",
            get(chat::list_read_receipts).post(chat::post_read_receipt),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(group_routes)
        .merge(thread_routes)
}

async fn health() -> &'static str {
    "ok"
}
