use axum::{
    Extension,
    extract::{Path, State},
};
use serde_json::json;
use uuid::Uuid;

use savor_types::api::{Claims, ToggleResult};
use savor_types::events::{ChangeEvent, ChangeKind, tables};
use savor_types::models::InteractionKind;

use crate::auth::{AppState, with_db};
use crate::error::{ApiError, ApiResult, ok};

/// Follow a user. `count` is the followee's follower count.
pub async fn follow(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<ToggleResult> {
    if user_id == claims.sub {
        return Err(ApiError::BadRequest("You cannot follow yourself".to_string()));
    }
    with_db(&state, move |db| db.get_user_by_id(&user_id.to_string()))
        .await?
        .ok_or(ApiError::NotFound("User"))?;

    let follower = claims.sub.to_string();
    let count = with_db(&state, move |db| {
        db.insert_interaction(
            &Uuid::new_v4().to_string(),
            &follower,
            &user_id.to_string(),
            InteractionKind::Follow,
        )
    })
    .await?;

    publish_follow(&state, ChangeKind::Insert, claims.sub, user_id);
    ok(ToggleResult {
        active: true,
        count,
    })
}

pub async fn unfollow(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<ToggleResult> {
    let follower = claims.sub.to_string();
    let (removed, count) = with_db(&state, move |db| {
        db.delete_interaction(&follower, &user_id.to_string(), InteractionKind::Follow)
    })
    .await?;

    if removed {
        publish_follow(&state, ChangeKind::Delete, claims.sub, user_id);
    }
    ok(ToggleResult {
        active: false,
        count,
    })
}

pub async fn follow_status(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<ToggleResult> {
    let follower = claims.sub.to_string();
    let (active, count) = with_db(&state, move |db| {
        let target = user_id.to_string();
        let active = db.has_interaction(&follower, &target, InteractionKind::Follow)?;
        let count = db.count_interactions(&target, InteractionKind::Follow)?;
        Ok((active, count))
    })
    .await?;

    ok(ToggleResult { active, count })
}

fn publish_follow(state: &AppState, kind: ChangeKind, follower_id: Uuid, followee_id: Uuid) {
    state.hub.publish(ChangeEvent::new(
        tables::FOLLOWS,
        kind,
        json!({ "follower_id": follower_id, "followee_id": followee_id }),
    ));
}
