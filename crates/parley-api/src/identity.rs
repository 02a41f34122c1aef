use axum::{Json, extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::error;
use uuid::Uuid;

use parley_types::api::{Claims, TokenResponse};

use crate::AppState;
use crate::middleware::identity;

/// Issued chat tokens are valid for a day; callers re-request as needed.
pub const TOKEN_TTL_HOURS: i64 = 24;

/// GET /userToken — look up (or lazily create) the caller's chat identity
/// and issue a token for it. The external→chat identity mapping is
/// immutable: a concurrent first request races on the insert and both
/// callers read back whichever mapping won.
pub async fn get_user_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    let user_id = identity(&headers)?;

    let st = state.clone();
    let uid = user_id.clone();
    let user = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        st.db.create_user_if_absent(&uid, Uuid::new_v4())?;
        st.db
            .get_user(&uid)?
            .ok_or_else(|| anyhow::anyhow!("user '{}' missing after insert", uid))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|e| {
        error!("user lookup error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let chat_user_id: Uuid = user.chat_user_id.parse().map_err(|e| {
        error!("corrupt chat_user_id for '{}': {}", user_id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let (token, expires_on) =
        issue_token(&state.jwt_secret, chat_user_id, &user_id, "user").map_err(|e| {
            error!("token issuance error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(TokenResponse {
        token,
        expires_on,
        user_id: chat_user_id,
    }))
}

pub fn issue_token(
    secret: &str,
    chat_user_id: Uuid,
    name: &str,
    role: &str,
) -> anyhow::Result<(String, DateTime<Utc>)> {
    let expires_on = Utc::now() + chrono::Duration::hours(TOKEN_TTL_HOURS);
    let claims = Claims {
        sub: chat_user_id,
        name: name.to_string(),
        role: role.to_string(),
        exp: expires_on.timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok((token, expires_on))
}
