use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use uuid::Uuid;

use savor_types::api::{AddCommentRequest, Claims, Envelope, ToggleResult};
use savor_types::events::{ChangeEvent, ChangeKind, tables};
use savor_types::models::{CommentNode, InteractionKind};

use crate::auth::{AppState, with_db};
use crate::convert;
use crate::error::{ApiError, ApiResult, ok};
use crate::posts::fetch_post;

pub const MAX_COMMENT_LEN: usize = 2000;

/// Flat list, oldest first. Replies carry `parent_id`; the client nests them.
pub async fn list_comments(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(post_id): Path<Uuid>,
) -> ApiResult<Vec<CommentNode>> {
    let viewer = claims.sub.to_string();
    let rows = with_db(&state, move |db| db.list_comments(&viewer, &post_id.to_string())).await?;
    ok(rows.into_iter().map(convert::comment).collect())
}

pub async fn add_comment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(post_id): Path<Uuid>,
    Json(req): Json<AddCommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::BadRequest("Comment cannot be empty".to_string()));
    }
    if content.chars().count() > MAX_COMMENT_LEN {
        return Err(ApiError::BadRequest("Comment is too long".to_string()));
    }

    fetch_post(&state, claims.sub, post_id).await?;

    if let Some(parent_id) = req.parent_id {
        let viewer = claims.sub.to_string();
        let parent = with_db(&state, move |db| db.get_comment(&viewer, &parent_id.to_string()))
            .await?
            .ok_or(ApiError::NotFound("Parent comment"))?;
        if parent.post_id != post_id.to_string() {
            return Err(ApiError::BadRequest(
                "Reply must belong to the same post".to_string(),
            ));
        }
    }

    let comment_id = Uuid::new_v4();
    let author = claims.sub.to_string();
    let parent = req.parent_id.map(|p| p.to_string());
    let row = with_db(&state, move |db| {
        db.insert_comment(
            &comment_id.to_string(),
            &post_id.to_string(),
            &author,
            parent.as_deref(),
            &content,
        )
    })
    .await?;
    let comment = convert::comment(row);

    state.hub.publish(ChangeEvent::new(
        tables::COMMENTS,
        ChangeKind::Insert,
        json!({
            "id": comment.id,
            "post_id": post_id,
            "parent_id": comment.parent_id,
            "author_id": comment.author_id,
        }),
    ));

    Ok((StatusCode::CREATED, Json(Envelope::ok(comment))))
}

pub async fn toggle_comment_like(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(comment_id): Path<Uuid>,
) -> ApiResult<ToggleResult> {
    let viewer = claims.sub.to_string();
    let comment = with_db(&state, move |db| db.get_comment(&viewer, &comment_id.to_string()))
        .await?
        .ok_or(ApiError::NotFound("Comment"))?;
    if comment.is_deleted {
        return Err(ApiError::NotFound("Comment"));
    }

    let actor = claims.sub.to_string();
    let (active, count) = with_db(&state, move |db| {
        db.toggle_interaction(
            &Uuid::new_v4().to_string(),
            &actor,
            &comment_id.to_string(),
            InteractionKind::CommentLike,
        )
    })
    .await?;

    state.hub.publish(ChangeEvent::new(
        tables::COMMENT_LIKES,
        if active { ChangeKind::Insert } else { ChangeKind::Delete },
        json!({ "comment_id": comment_id, "post_id": comment.post_id, "user_id": claims.sub }),
    ));

    ok(ToggleResult { active, count })
}

/// Soft delete: the row stays, flagged, so reply threads keep their shape.
pub async fn delete_comment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(comment_id): Path<Uuid>,
) -> ApiResult<Uuid> {
    let author = claims.sub.to_string();
    let post_id = with_db(&state, move |db| {
        db.soft_delete_comment(&comment_id.to_string(), &author)
    })
    .await?;

    let Some(post_id) = post_id else {
        // Either missing, already deleted, or someone else's comment
        let viewer = claims.sub.to_string();
        let exists = with_db(&state, move |db| db.get_comment(&viewer, &comment_id.to_string()))
            .await?
            .is_some_and(|c| !c.is_deleted);
        return Err(if exists {
            ApiError::Forbidden
        } else {
            ApiError::NotFound("Comment")
        });
    };

    state.hub.publish(ChangeEvent::new(
        tables::COMMENTS,
        ChangeKind::Update,
        json!({ "id": comment_id, "post_id": post_id, "is_deleted": true }),
    ));

    ok(comment_id)
}
