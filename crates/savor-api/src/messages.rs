use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use savor_types::api::{Claims, Envelope, OpenConversationRequest, SendMessageRequest};
use savor_types::events::{ChangeEvent, ChangeKind, tables};
use savor_types::models::{Conversation, Message};

use crate::auth::{AppState, with_db};
use crate::convert;
use crate::error::{ApiError, ApiResult, ok};

const MAX_MESSAGE_LEN: usize = 4000;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Vec<Conversation>> {
    let user = claims.sub.to_string();
    let rows = with_db(&state, move |db| db.list_conversations(&user)).await?;
    ok(rows.into_iter().map(convert::conversation).collect())
}

/// Find or create the direct conversation with another user.
pub async fn open_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<OpenConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.with_user_id == claims.sub {
        return Err(ApiError::BadRequest(
            "You cannot message yourself".to_string(),
        ));
    }

    let me = claims.sub.to_string();
    let other = req.with_user_id.to_string();
    let (conversation, created) = with_db(&state, move |db| {
        if db.get_user_by_id(&other)?.is_none() {
            return Ok(None);
        }
        let (id, created) = match db.find_direct_conversation(&me, &other)? {
            Some(id) => (id, false),
            None => {
                let id = Uuid::new_v4().to_string();
                db.create_conversation(&id, &[me.as_str(), other.as_str()])?;
                (id, true)
            }
        };
        Ok(db.get_conversation(&id)?.map(|c| (c, created)))
    })
    .await?
    .ok_or(ApiError::NotFound("User"))?;

    let conversation = convert::conversation(conversation);
    if created {
        info!("Conversation {} opened by {}", conversation.id, claims.sub);
        publish_conversation(&state, ChangeKind::Insert, &conversation);
    }

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(Envelope::ok(conversation))))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
) -> ApiResult<Vec<Message>> {
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let viewer = claims.sub.to_string();
    let limit = query.limit.clamp(1, 200);
    let rows = with_db(&state, move |db| {
        db.list_messages(&conversation_id.to_string(), &viewer, limit)
    })
    .await?;

    ok(rows.into_iter().map(convert::message).collect())
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let body = req.body.trim().to_string();
    if body.is_empty() {
        return Err(ApiError::BadRequest("Message cannot be empty".to_string()));
    }
    if body.chars().count() > MAX_MESSAGE_LEN {
        return Err(ApiError::BadRequest("Message is too long".to_string()));
    }

    ensure_participant(&state, conversation_id, claims.sub).await?;

    let message_id = Uuid::new_v4();
    let sender = claims.sub.to_string();
    let (row, conversation) = with_db(&state, move |db| {
        let cid = conversation_id.to_string();
        let row = db.insert_message(&message_id.to_string(), &cid, &sender, &body)?;
        Ok((row, db.get_conversation(&cid)?))
    })
    .await?;
    let message = convert::message(row);

    state.hub.publish(ChangeEvent::new(
        tables::MESSAGES,
        ChangeKind::Insert,
        json!({
            "id": message.id,
            "conversation_id": conversation_id,
            "sender_id": message.sender_id,
        }),
    ));
    if let Some(conversation) = conversation {
        publish_conversation(&state, ChangeKind::Update, &convert::conversation(conversation));
    }

    Ok((StatusCode::CREATED, Json(Envelope::ok(message))))
}

/// Mark the conversation read for the caller. Returns how many messages
/// flipped to read.
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<usize> {
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let reader = claims.sub.to_string();
    let changed = with_db(&state, move |db| {
        db.mark_read(&conversation_id.to_string(), &reader)
    })
    .await?;

    if changed > 0 {
        state.hub.publish(ChangeEvent::new(
            tables::MESSAGES,
            ChangeKind::Update,
            json!({ "conversation_id": conversation_id, "read_by": claims.sub }),
        ));
    }
    ok(changed)
}

async fn ensure_participant(
    state: &AppState,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<(), ApiError> {
    let member = with_db(state, move |db| {
        db.is_participant(&conversation_id.to_string(), &user_id.to_string())
    })
    .await?;
    if member {
        Ok(())
    } else {
        Err(ApiError::NotFound("Conversation"))
    }
}

fn publish_conversation(state: &AppState, kind: ChangeKind, conversation: &Conversation) {
    let participant_ids: Vec<Uuid> = conversation.participants.iter().map(|p| p.user_id).collect();
    state.hub.publish(ChangeEvent::new(
        tables::CONVERSATIONS,
        kind,
        json!({ "id": conversation.id, "participant_ids": participant_ids }),
    ));
}
