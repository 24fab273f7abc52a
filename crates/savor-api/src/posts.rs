use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use savor_types::api::{Claims, CreatePostRequest, Envelope, FeedPage, ShareResult, ToggleResult};
use savor_types::events::{ChangeEvent, ChangeKind, tables};
use savor_types::models::{InteractionKind, Post};

use crate::auth::{AppState, with_db};
use crate::convert;
use crate::error::{ApiError, ApiResult, ok};

const MAX_CAPTION_LEN: usize = 2200;

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: `next_cursor` of the previous page.
    pub before: Option<DateTime<Utc>>,
}

fn default_limit() -> u32 {
    10
}

pub async fn feed(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<FeedQuery>,
) -> ApiResult<FeedPage> {
    let limit = query.limit.clamp(1, 50);
    let before = query.before.map(savor_db::timestamp);
    let viewer = claims.sub.to_string();

    let rows = with_db(&state, move |db| db.list_feed(&viewer, before.as_deref(), limit)).await?;

    let posts: Vec<Post> = rows.into_iter().map(convert::post).collect();
    let next_cursor = if posts.len() == limit as usize {
        posts.last().map(|p| p.created_at)
    } else {
        None
    };

    ok(FeedPage { posts, next_cursor })
}

pub async fn get_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(post_id): Path<Uuid>,
) -> ApiResult<Post> {
    ok(fetch_post(&state, claims.sub, post_id).await?)
}

pub async fn create_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreatePostRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caption = req.caption.trim().to_string();
    if caption.len() > MAX_CAPTION_LEN {
        return Err(ApiError::BadRequest("Caption is too long".to_string()));
    }

    let post_id = Uuid::new_v4();
    let author = claims.sub.to_string();
    let row = with_db(&state, move |db| {
        db.insert_post(&post_id.to_string(), &author, &caption, req.media_path.as_deref())
    })
    .await?;
    let post = convert::post(row);

    state.hub.publish(ChangeEvent::new(
        tables::POSTS,
        ChangeKind::Insert,
        json!({ "id": post.id, "author_id": post.author_id }),
    ));

    Ok((StatusCode::CREATED, Json(Envelope::ok(post))))
}

/// Add a like. A repeated like answers 409 so callers can tell it apart.
pub async fn like_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(post_id): Path<Uuid>,
) -> ApiResult<ToggleResult> {
    fetch_post(&state, claims.sub, post_id).await?;

    let actor = claims.sub.to_string();
    let count = with_db(&state, move |db| {
        db.insert_interaction(
            &Uuid::new_v4().to_string(),
            &actor,
            &post_id.to_string(),
            InteractionKind::Like,
        )
    })
    .await?;

    publish_like(&state, ChangeKind::Insert, post_id, claims.sub);
    ok(ToggleResult {
        active: true,
        count,
    })
}

pub async fn unlike_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(post_id): Path<Uuid>,
) -> ApiResult<ToggleResult> {
    let actor = claims.sub.to_string();
    let (removed, count) = with_db(&state, move |db| {
        db.delete_interaction(&actor, &post_id.to_string(), InteractionKind::Like)
    })
    .await?;

    if removed {
        publish_like(&state, ChangeKind::Delete, post_id, claims.sub);
    }
    ok(ToggleResult {
        active: false,
        count,
    })
}

pub async fn toggle_like(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(post_id): Path<Uuid>,
) -> ApiResult<ToggleResult> {
    fetch_post(&state, claims.sub, post_id).await?;

    let actor = claims.sub.to_string();
    let (active, count) = with_db(&state, move |db| {
        db.toggle_interaction(
            &Uuid::new_v4().to_string(),
            &actor,
            &post_id.to_string(),
            InteractionKind::Like,
        )
    })
    .await?;

    let kind = if active { ChangeKind::Insert } else { ChangeKind::Delete };
    publish_like(&state, kind, post_id, claims.sub);
    ok(ToggleResult { active, count })
}

pub async fn share_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(post_id): Path<Uuid>,
) -> ApiResult<ShareResult> {
    fetch_post(&state, claims.sub, post_id).await?;

    let actor = claims.sub.to_string();
    let shares_count = with_db(&state, move |db| {
        db.insert_interaction(
            &Uuid::new_v4().to_string(),
            &actor,
            &post_id.to_string(),
            InteractionKind::Share,
        )
    })
    .await?;

    state.hub.publish(ChangeEvent::new(
        tables::SHARES,
        ChangeKind::Insert,
        json!({ "post_id": post_id, "user_id": claims.sub }),
    ));
    ok(ShareResult { shares_count })
}

pub(crate) async fn fetch_post(
    state: &AppState,
    viewer: Uuid,
    post_id: Uuid,
) -> Result<Post, ApiError> {
    let row = with_db(state, move |db| {
        db.get_post(&viewer.to_string(), &post_id.to_string())
    })
    .await?
    .ok_or(ApiError::NotFound("Post"))?;
    Ok(convert::post(row))
}

fn publish_like(state: &AppState, kind: ChangeKind, post_id: Uuid, user_id: Uuid) {
    state.hub.publish(ChangeEvent::new(
        tables::LIKES,
        kind,
        json!({ "post_id": post_id, "user_id": user_id }),
    ));
}
