//! Callback ingress.
//!
//! Worker-only endpoints, reached through the callback URL injected at
//! container creation. This is the sole surface through which a meeting
//! advances beyond `reserved` (the reaper being the other status writer).
//! Every call authenticates with the session_uid itself: 122 random bits
//! known only to the worker and the store. All handlers are idempotent, so
//! workers may retry them blindly.

use std::sync::Arc;

use axum::{
    extract::State,
    response::Json,
    routing::{patch, post},
    Router,
};
use chrono::Utc;
use log::{info, warn};
use serde::Deserialize;

use crate::shared::error::ManagerError;
use crate::shared::models::{Meeting, MeetingStatus};
use crate::shared::state::AppState;
use crate::store::{retry_unavailable, StatusChange};

#[derive(Debug, Deserialize)]
pub struct StartedPayload {
    pub session_uid: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinedPayload {
    pub session_uid: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    pub session_uid: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusPayload {
    pub session_uid: String,
    pub status: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExitedPayload {
    pub session_uid: String,
    pub exit_code: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Resolve the meeting a session_uid belongs to. A token that matches no
/// reservation is an authentication failure, not a 404: the uid doubles as
/// the callback credential.
async fn authenticate(state: &AppState, session_uid: &str) -> Result<Meeting, ManagerError> {
    state
        .store
        .find_by_session_uid(session_uid.to_string())
        .await?
        .ok_or(ManagerError::Unauthorized)
}

fn ok_response(meeting: &Meeting) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "meeting_id": meeting.id,
    }))
}

/// First contact: record the session, move `reserved` to `starting`.
async fn started_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StartedPayload>,
) -> Result<Json<serde_json::Value>, ManagerError> {
    let meeting = authenticate(&state, &payload.session_uid).await?;
    let now = Utc::now();

    retry_unavailable(|| {
        state
            .store
            .upsert_session(meeting.id, payload.session_uid.clone(), now)
    })
    .await?;

    let advanced = retry_unavailable(|| {
        state.store.advance_status(
            meeting.id,
            &[MeetingStatus::Reserved],
            MeetingStatus::Starting,
            StatusChange::started_at(now),
        )
    })
    .await;
    match advanced {
        Ok(updated) => {
            info!("Meeting {} is starting", meeting.id);
            Ok(ok_response(&updated))
        }
        // A reconnecting worker already moved past `starting`.
        Err(ManagerError::IllegalTransition {
            from: MeetingStatus::Active | MeetingStatus::Stopping,
            ..
        }) => Ok(ok_response(&meeting)),
        Err(e) => Err(e),
    }
}

/// The bot is in the meeting: `starting` becomes `active`.
async fn joined_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<JoinedPayload>,
) -> Result<Json<serde_json::Value>, ManagerError> {
    let meeting = authenticate(&state, &payload.session_uid).await?;

    let updated = retry_unavailable(|| {
        state.store.advance_status(
            meeting.id,
            &[MeetingStatus::Starting],
            MeetingStatus::Active,
            StatusChange::none(),
        )
    })
    .await?;

    state
        .store
        .update_config(meeting.id, payload.language.clone(), payload.task.clone())
        .await?;

    info!("Meeting {} is active", meeting.id);
    Ok(ok_response(&updated))
}

async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<HeartbeatPayload>,
) -> Result<Json<serde_json::Value>, ManagerError> {
    let meeting = authenticate(&state, &payload.session_uid).await?;
    retry_unavailable(|| state.store.touch(meeting.id)).await?;
    Ok(ok_response(&meeting))
}

/// Intermediate transitions the worker legitimately owns. Today that is
/// exactly `active -> stopping`.
async fn status_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StatusPayload>,
) -> Result<Json<serde_json::Value>, ManagerError> {
    let meeting = authenticate(&state, &payload.session_uid).await?;

    if payload.status != MeetingStatus::Stopping.as_str() {
        return Err(ManagerError::Validation(format!(
            "workers may only report status 'stopping', got '{}'",
            payload.status
        )));
    }

    let updated = retry_unavailable(|| {
        state.store.advance_status(
            meeting.id,
            &[MeetingStatus::Active],
            MeetingStatus::Stopping,
            StatusChange::none(),
        )
    })
    .await?;

    state
        .store
        .update_config(meeting.id, payload.language.clone(), payload.task.clone())
        .await?;

    info!("Meeting {} is stopping", meeting.id);
    Ok(ok_response(&updated))
}

/// Final report. Exit code zero completes the meeting, anything else fails
/// it. Duplicate deliveries are acknowledged without effect.
async fn exited_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExitedPayload>,
) -> Result<Json<serde_json::Value>, ManagerError> {
    let meeting = authenticate(&state, &payload.session_uid).await?;

    let current = meeting.status_parsed().ok_or_else(|| {
        ManagerError::Unavailable(format!(
            "meeting {} has unknown status '{}'",
            meeting.id, meeting.status
        ))
    })?;
    if current.is_terminal() {
        return Ok(ok_response(&meeting));
    }

    let now = Utc::now();
    let (from, to, reason): (&[MeetingStatus], _, _) = if payload.exit_code == 0 {
        (
            &[
                MeetingStatus::Starting,
                MeetingStatus::Active,
                MeetingStatus::Stopping,
            ],
            MeetingStatus::Completed,
            None,
        )
    } else {
        (
            &[
                MeetingStatus::Reserved,
                MeetingStatus::Starting,
                MeetingStatus::Active,
                MeetingStatus::Stopping,
            ],
            MeetingStatus::Failed,
            Some(
                payload
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("exit_code_{}", payload.exit_code)),
            ),
        )
    };

    let advanced = retry_unavailable(|| {
        state
            .store
            .advance_status(meeting.id, from, to, StatusChange::ended_at(now, reason.clone()))
    })
    .await;
    match advanced {
        Ok(updated) => {
            info!(
                "Meeting {} finished as {} (exit code {})",
                meeting.id, to, payload.exit_code
            );
            Ok(ok_response(&updated))
        }
        // Another actor (duplicate callback, reaper) already terminated it.
        Err(ManagerError::IllegalTransition { from: current, .. }) if current.is_terminal() => {
            warn!(
                "Exit callback for meeting {} raced an earlier termination",
                meeting.id
            );
            Ok(ok_response(&meeting))
        }
        Err(e) => Err(e),
    }
}

pub fn configure_callback_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/callback/started", post(started_handler))
        .route("/callback/joined", post(joined_handler))
        .route("/callback/heartbeat", post(heartbeat_handler))
        .route("/callback/exited", post(exited_handler))
        .route("/callback/status", patch(status_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exited_payload_defaults_reason() {
        let payload: ExitedPayload =
            serde_json::from_value(serde_json::json!({"session_uid": "s1", "exit_code": 1}))
                .unwrap();
        assert_eq!(payload.exit_code, 1);
        assert!(payload.reason.is_none());
    }

    #[test]
    fn status_payload_accepts_config_fields() {
        let payload: StatusPayload = serde_json::from_value(serde_json::json!({
            "session_uid": "s1",
            "status": "stopping",
            "language": "de",
        }))
        .unwrap();
        assert_eq!(payload.language.as_deref(), Some("de"));
        assert!(payload.task.is_none());
    }
}
