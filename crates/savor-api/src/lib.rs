pub mod auth;
pub mod comments;
pub mod convert;
pub mod devices;
pub mod error;
pub mod follows;
pub mod messages;
pub mod middleware;
pub mod posts;
pub mod storage;

use axum::{
    Router,
    extract::{DefaultBodyLimit, State, WebSocketUpgrade},
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::AppState;

/// Every route of the backend, with auth, CORS and request tracing applied.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/realtime", get(realtime_upgrade));

    let protected_routes = Router::new()
        .route("/feed", get(posts::feed))
        .route("/posts", post(posts::create_post))
        .route("/posts/{post_id}", get(posts::get_post))
        .route(
            "/posts/{post_id}/like",
            post(posts::like_post).delete(posts::unlike_post),
        )
        .route("/posts/{post_id}/like/toggle", post(posts::toggle_like))
        .route("/posts/{post_id}/share", post(posts::share_post))
        .route(
            "/posts/{post_id}/comments",
            get(comments::list_comments).post(comments::add_comment),
        )
        .route(
            "/comments/{comment_id}/like/toggle",
            post(comments::toggle_comment_like),
        )
        .route("/comments/{comment_id}", delete(comments::delete_comment))
        .route(
            "/users/{user_id}/follow",
            get(follows::follow_status)
                .post(follows::follow)
                .delete(follows::unfollow),
        )
        .route(
            "/conversations",
            get(messages::list_conversations).post(messages::open_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/conversations/{conversation_id}/read",
            post(messages::mark_read),
        )
        .route(
            "/devices",
            post(devices::register_device).delete(devices::unregister_device),
        )
        .route(
            "/storage/{bucket}/{file_name}",
            put(storage::upload).layer(DefaultBodyLimit::max(storage::MAX_FILE_SIZE)),
        )
        .layer(from_fn_with_state(state.clone(), middleware::require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn realtime_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let hub = state.hub.clone();
    let jwt_secret = state.jwt_secret.clone();
    ws.on_upgrade(move |socket| savor_realtime::connection::handle_connection(socket, hub, jwt_secret))
}
