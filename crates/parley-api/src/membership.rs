use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use parley_types::api::ChatThreadResponse;
use parley_types::models::{Appointment, MemberRole};

use crate::{AppState, AppStateInner};
use crate::middleware::identity;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Outcome of a successful membership resolution.
#[derive(Debug, PartialEq, Eq)]
pub enum Authorized {
    Joined,
    AlreadyMember,
}

/// Ensures the user is associated with the group's chat thread, creating
/// the thread and its appointment binding on first use.
///
/// A group is either unbootstrapped (no appointment record) or
/// bootstrapped (appointment with a moderator identity and a thread). The
/// transition happens once: the first caller to observe "no appointment"
/// creates a moderator identity and a thread holding {moderator, caller},
/// then binds them with a conditional insert. A concurrent second caller
/// loses that insert, discards its thread, and joins the winner's instead.
pub async fn ensure_user_in_group(
    state: &AppState,
    group_id: &str,
    user_id: &str,
) -> Result<Authorized, MembershipError> {
    let st = state.clone();
    let gid = group_id.to_string();
    let uid = user_id.to_string();

    tokio::task::spawn_blocking(move || resolve(&st, &gid, &uid))
        .await
        .map_err(|e| MembershipError::Storage(anyhow::anyhow!("join error: {}", e)))?
}

fn resolve(
    state: &AppStateInner,
    group_id: &str,
    user_id: &str,
) -> Result<Authorized, MembershipError> {
    // The caller must have completed identity issuance first.
    let Some(user) = state.db.get_user(user_id)? else {
        return Err(MembershipError::UnknownUser(user_id.to_string()));
    };
    let chat_user_id: Uuid = user
        .chat_user_id
        .parse()
        .map_err(|e| anyhow::anyhow!("corrupt chat_user_id for '{}': {}", user_id, e))?;

    // Idempotent: an existing join record means the thread membership was
    // already established.
    if state.db.appointment_user_exists(group_id, user_id)? {
        return Ok(Authorized::AlreadyMember);
    }

    match state.db.get_appointment(group_id)? {
        Some(appointment) => {
            let thread_id: Uuid = appointment
                .chat_thread_id
                .parse()
                .map_err(|e| anyhow::anyhow!("corrupt chat_thread_id for '{}': {}", group_id, e))?;
            state
                .db
                .add_thread_member(thread_id, chat_user_id, user_id, MemberRole::User.as_str())?;
        }
        None => {
            let moderator_id = Uuid::new_v4();
            let thread_id = Uuid::new_v4();

            state.db.create_thread(thread_id, group_id, Utc::now())?;
            state.db.add_thread_member(
                thread_id,
                moderator_id,
                "moderator",
                MemberRole::Moderator.as_str(),
            )?;
            state
                .db
                .add_thread_member(thread_id, chat_user_id, user_id, MemberRole::User.as_str())?;

            let won = state
                .db
                .insert_appointment_if_absent(group_id, thread_id, moderator_id)?;
            if won {
                info!("bootstrapped group '{}' with thread {}", group_id, thread_id);
            } else {
                // Lost the bootstrap race: discard our thread and join the
                // winner's.
                state.db.delete_thread(thread_id)?;
                let appointment = state
                    .db
                    .get_appointment(group_id)?
                    .ok_or_else(|| anyhow::anyhow!("appointment for '{}' vanished", group_id))?;
                let winner: Uuid = appointment.chat_thread_id.parse().map_err(|e| {
                    anyhow::anyhow!("corrupt chat_thread_id for '{}': {}", group_id, e)
                })?;
                state
                    .db
                    .add_thread_member(winner, chat_user_id, user_id, MemberRole::User.as_str())?;
            }
        }
    }

    state.db.add_appointment_user(group_id, user_id)?;
    Ok(Authorized::Joined)
}

/// POST /groups/{groupId}/user — associate the caller with the group.
pub async fn join_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    let user_id = identity(&headers)?;

    match ensure_user_in_group(&state, &group_id, &user_id).await {
        Ok(Authorized::Joined) => Ok(StatusCode::CREATED),
        Ok(Authorized::AlreadyMember) => Err(StatusCode::CONFLICT),
        Err(MembershipError::UnknownUser(_)) => Err(StatusCode::FORBIDDEN),
        Err(MembershipError::Storage(e)) => {
            error!("membership resolution failed for '{}': {}", group_id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /groups/{groupId}/chatThread — resolve the group's thread id.
pub async fn get_chat_thread(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    let user_id = identity(&headers)?;
    let appointment = require_member(&state, &group_id, &user_id).await?;

    Ok(Json(ChatThreadResponse {
        thread_id: appointment.chat_thread_id,
    }))
}

/// Gate for group-scoped operations: the caller must hold a join record.
/// Non-members get a bare 403 regardless of whether the group exists.
pub(crate) async fn require_member(
    state: &AppState,
    group_id: &str,
    user_id: &str,
) -> Result<Appointment, StatusCode> {
    let st = state.clone();
    let gid = group_id.to_string();
    let uid = user_id.to_string();

    let row = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        if !st.db.appointment_user_exists(&gid, &uid)? {
            return Ok(None);
        }
        st.db.get_appointment(&gid)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|e| {
        error!("membership check error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let Some(row) = row else {
        return Err(StatusCode::FORBIDDEN);
    };

    row.into_appointment().map_err(|e| {
        error!("corrupt appointment for '{}': {}", group_id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
