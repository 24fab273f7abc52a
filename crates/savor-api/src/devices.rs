use axum::{Extension, Json, extract::State};
use tracing::info;

use savor_types::api::{Claims, RegisterDeviceRequest, UnregisterDeviceRequest};
use savor_types::models::DevicePlatform;

use crate::auth::{AppState, with_db};
use crate::error::{ApiError, ApiResult, ok};

/// Store a push registration token. Delivery happens elsewhere; this only
/// records where to deliver. A token registered twice answers 409.
pub async fn register_device(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<RegisterDeviceRequest>,
) -> ApiResult<bool> {
    let token = req.token.trim().to_string();
    if token.is_empty() || token.len() > 4096 {
        return Err(ApiError::BadRequest("Invalid device token".to_string()));
    }

    let platform = match req.platform {
        DevicePlatform::Web => "web",
        DevicePlatform::Android => "android",
        DevicePlatform::Ios => "ios",
    };
    let user = claims.sub.to_string();
    with_db(&state, move |db| db.insert_device(&token, &user, platform)).await?;

    info!("Device registered for {} ({})", claims.sub, platform);
    ok(true)
}

pub async fn unregister_device(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UnregisterDeviceRequest>,
) -> ApiResult<bool> {
    let user = claims.sub.to_string();
    let removed = with_db(&state, move |db| db.delete_device(&user, &req.token)).await?;
    ok(removed)
}
