//! Lifecycle coordinator and the public bot API.
//!
//! Accepts external requests and translates them into store writes,
//! orchestrator calls, and command publishes. After the initial reservation
//! the coordinator never writes `status`; workers advance their own state
//! through the callback ingress, and the reaper handles the silent ones.
//! The one exception the design grants: compensating a failed launch while
//! the row is still `reserved`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{delete, get, patch, post},
    Router,
};
use chrono::Utc;
use log::{error, info, warn};
use serde::Deserialize;
use uuid::Uuid;

use crate::admission::{AdmissionController, StartBotRequest, TASK_TRANSCRIBE, TASK_TRANSLATE};
use crate::bus::{BotCommand, CommandBus};
use crate::config::AppConfig;
use crate::orchestrator::{container_name, ContainerOrchestrator, ContainerSpec};
use crate::platform::Platform;
use crate::shared::error::ManagerError;
use crate::shared::models::{Meeting, MeetingConfig, MeetingResponse, MeetingStatus};
use crate::shared::state::AppState;
use crate::store::{retry_unavailable, MeetingStore, StatusChange};

/// Overall deadline for one `start_bot` call; partial progress past it is
/// compensated.
pub const START_RPC_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_GRACE: Duration = Duration::from_secs(10);

/// `PATCH /bots/{platform}/{native_meeting_id}/config` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigUpdateRequest {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
}

#[derive(Debug)]
pub enum StopOutcome {
    /// Leave command published; the worker or the reaper finishes the job.
    Accepted,
    /// The meeting was already terminal; nothing to do.
    AlreadyTerminal(Meeting),
}

#[derive(Clone)]
pub struct LifecycleCoordinator {
    store: MeetingStore,
    bus: CommandBus,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    config: Arc<AppConfig>,
    admission: AdmissionController,
}

impl LifecycleCoordinator {
    pub fn new(
        store: MeetingStore,
        bus: CommandBus,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        config: Arc<AppConfig>,
    ) -> Self {
        let admission = AdmissionController::new(store.clone());
        LifecycleCoordinator {
            store,
            bus,
            orchestrator,
            config,
            admission,
        }
    }

    /// Reserve a slot, create and start the worker container, and return the
    /// reserved meeting. Does not wait for the worker to come up.
    pub async fn start_bot(
        &self,
        user_id: Uuid,
        request: StartBotRequest,
    ) -> Result<Meeting, ManagerError> {
        let meeting = self.admission.admit(user_id, &request).await?;
        info!(
            "Reserved meeting {} for user {} ({}/{})",
            meeting.id, user_id, meeting.platform, meeting.native_meeting_id
        );

        let bot_config: MeetingConfig = serde_json::from_value(meeting.config.clone())
            .map_err(|e| ManagerError::Unavailable(format!("stored config unreadable: {}", e)))?;
        let spec = ContainerSpec::for_worker(&self.config, &meeting, &bot_config);

        let launch = async {
            let container_id = self
                .orchestrator
                .create(&spec)
                .await
                .map_err(|e| ("orchestrator_create", None, e))?;
            retry_unavailable(|| self.store.set_container(meeting.id, container_id.clone()))
                .await
                .map_err(|e| ("store_set_container", Some(container_id.clone()), e))?;
            self.orchestrator
                .start(&container_id)
                .await
                .map_err(|e| ("orchestrator_start", Some(container_id.clone()), e))?;
            Ok::<String, (&'static str, Option<String>, ManagerError)>(container_id)
        };

        match tokio::time::timeout(START_RPC_TIMEOUT, launch).await {
            Ok(Ok(container_id)) => {
                info!(
                    "Started container {} for meeting {}",
                    container_id, meeting.id
                );
                self.store.read(meeting.id).await
            }
            Ok(Err((reason, container, err))) => {
                error!(
                    "Launch failed for meeting {} at {}: {}",
                    meeting.id, reason, err
                );
                self.fail_reservation(&meeting, reason, container).await;
                Err(err)
            }
            Err(_) => {
                error!(
                    "Launch for meeting {} exceeded {:?}",
                    meeting.id, START_RPC_TIMEOUT
                );
                // The container may exist under its deterministic name even
                // though the create call never returned.
                self.fail_reservation(&meeting, "start_timeout", Some(container_name(meeting.id)))
                    .await;
                Err(ManagerError::OrchestratorFailed(
                    "bot start timed out".to_string(),
                ))
            }
        }
    }

    /// Best-effort compensation for a launch that died mid-way. The reaper
    /// backstops anything missed here.
    async fn fail_reservation(&self, meeting: &Meeting, reason: &str, container: Option<String>) {
        let result = retry_unavailable(|| {
            self.store.advance_status(
                meeting.id,
                &[MeetingStatus::Reserved],
                MeetingStatus::Failed,
                StatusChange::ended_at(Utc::now(), Some(reason.to_string())),
            )
        })
        .await;
        if let Err(e) = result {
            warn!("Could not mark meeting {} failed: {}", meeting.id, e);
        }
        if let Some(container_id) = container {
            if let Err(e) = self.orchestrator.stop(&container_id, STOP_GRACE).await {
                warn!("Cleanup stop of {} failed: {}", container_id, e);
            }
        }
    }

    /// Publish a Leave command. Status is advanced by the worker's callbacks
    /// or, failing that, the reaper.
    pub async fn stop_bot(&self, meeting_id: Uuid) -> Result<StopOutcome, ManagerError> {
        let meeting = self.store.read(meeting_id).await?;
        let status = parse_status(&meeting)?;
        if status.is_terminal() {
            return Ok(StopOutcome::AlreadyTerminal(meeting));
        }
        self.bus
            .publish(&meeting.session_uid, &BotCommand::Leave)
            .await?;
        info!("Published leave for meeting {}", meeting_id);
        Ok(StopOutcome::Accepted)
    }

    /// Publish a Reconfigure command to a live bot. The store reflects the
    /// new config once the worker reports it back.
    pub async fn reconfigure_bot(
        &self,
        meeting_id: Uuid,
        update: ConfigUpdateRequest,
    ) -> Result<(), ManagerError> {
        if let Some(task) = update.task.as_deref() {
            if task != TASK_TRANSCRIBE && task != TASK_TRANSLATE {
                return Err(ManagerError::Validation(format!(
                    "task must be '{}' or '{}'",
                    TASK_TRANSCRIBE, TASK_TRANSLATE
                )));
            }
        }

        let meeting = self.store.read(meeting_id).await?;
        let status = parse_status(&meeting)?;
        if !matches!(status, MeetingStatus::Starting | MeetingStatus::Active) {
            return Err(ManagerError::IllegalState(format!(
                "meeting {} is {}, reconfigure requires starting or active",
                meeting_id, status
            )));
        }

        self.bus
            .publish(
                &meeting.session_uid,
                &BotCommand::Reconfigure {
                    language: update.language,
                    task: update.task,
                },
            )
            .await?;
        info!("Published reconfigure for meeting {}", meeting_id);
        Ok(())
    }

    pub async fn get_meeting(&self, meeting_id: Uuid) -> Result<Meeting, ManagerError> {
        self.store.read(meeting_id).await
    }

    pub async fn list_bots_for_user(
        &self,
        user_id: Uuid,
        status: Option<MeetingStatus>,
    ) -> Result<Vec<Meeting>, ManagerError> {
        self.store.list(Some(user_id), status).await
    }

    pub async fn get_active_count(&self, user_id: Uuid) -> Result<i64, ManagerError> {
        self.store.active_count_for_user(user_id).await
    }
}

fn parse_status(meeting: &Meeting) -> Result<MeetingStatus, ManagerError> {
    meeting.status_parsed().ok_or_else(|| {
        ManagerError::Unavailable(format!(
            "meeting {} has unknown status '{}'",
            meeting.id, meeting.status
        ))
    })
}

/// The caller identity, pre-resolved by the gateway in front of us.
fn require_user(headers: &HeaderMap) -> Result<Uuid, ManagerError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| ManagerError::Validation("missing or invalid x-user-id header".to_string()))
}

async fn start_bot_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<MeetingResponse>, ManagerError> {
    let user_id = require_user(&headers)?;
    let request: StartBotRequest = serde_json::from_value(body)?;
    let meeting = state.lifecycle.start_bot(user_id, request).await?;
    Ok(Json(meeting.into()))
}

async fn stop_bot_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((platform, native_meeting_id)): Path<(Platform, String)>,
) -> Result<(StatusCode, Json<serde_json::Value>), ManagerError> {
    let user_id = require_user(&headers)?;
    let meeting = state
        .store
        .latest_for_native(user_id, platform, native_meeting_id.clone())
        .await?
        .ok_or_else(|| {
            ManagerError::NotFound(format!("no meeting for {}/{}", platform, native_meeting_id))
        })?;

    match state.lifecycle.stop_bot(meeting.id).await? {
        StopOutcome::Accepted => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "message": "stop request accepted",
                "meeting_id": meeting.id,
            })),
        )),
        StopOutcome::AlreadyTerminal(meeting) => Ok((
            StatusCode::OK,
            Json(serde_json::json!({
                "message": "meeting already finished",
                "meeting_id": meeting.id,
                "status": meeting.status,
            })),
        )),
    }
}

async fn reconfigure_bot_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((platform, native_meeting_id)): Path<(Platform, String)>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<serde_json::Value>), ManagerError> {
    let user_id = require_user(&headers)?;
    let update: ConfigUpdateRequest = serde_json::from_value(body)?;
    let meeting = state
        .store
        .latest_for_native(user_id, platform, native_meeting_id.clone())
        .await?
        .ok_or_else(|| {
            ManagerError::NotFound(format!("no meeting for {}/{}", platform, native_meeting_id))
        })?;

    state.lifecycle.reconfigure_bot(meeting.id, update).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "message": "reconfigure request accepted",
            "meeting_id": meeting.id,
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct ListMeetingsQuery {
    status: Option<String>,
}

async fn list_meetings_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListMeetingsQuery>,
) -> Result<Json<Vec<MeetingResponse>>, ManagerError> {
    let user_id = require_user(&headers)?;
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(MeetingStatus::parse(raw).ok_or_else(|| {
            ManagerError::Validation(format!("unknown status filter '{}'", raw))
        })?),
    };
    let meetings = state.lifecycle.list_bots_for_user(user_id, status).await?;
    Ok(Json(meetings.into_iter().map(Into::into).collect()))
}

async fn get_meeting_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(meeting_id): Path<Uuid>,
) -> Result<Json<MeetingResponse>, ManagerError> {
    let user_id = require_user(&headers)?;
    let meeting = state.lifecycle.get_meeting(meeting_id).await?;
    if meeting.user_id != user_id {
        return Err(ManagerError::NotFound(format!("meeting {}", meeting_id)));
    }
    Ok(Json(meeting.into()))
}

pub fn configure_bot_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bots", post(start_bot_handler))
        .route(
            "/bots/:platform/:native_meeting_id",
            delete(stop_bot_handler),
        )
        .route(
            "/bots/:platform/:native_meeting_id/config",
            patch(reconfigure_bot_handler),
        )
        .route("/meetings", get(list_meetings_handler))
        .route("/meetings/:id", get(get_meeting_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn user_header_extraction() {
        let mut headers = HeaderMap::new();
        assert!(require_user(&headers).is_err());

        headers.insert("x-user-id", HeaderValue::from_static("not-a-uuid"));
        assert!(require_user(&headers).is_err());

        let uid = Uuid::new_v4();
        headers.insert(
            "x-user-id",
            HeaderValue::from_str(&uid.to_string()).unwrap(),
        );
        assert_eq!(require_user(&headers).ok(), Some(uid));
    }

    #[test]
    fn config_update_rejects_unknown_keys() {
        let body = serde_json::json!({"language": "fr", "mute": true});
        assert!(serde_json::from_value::<ConfigUpdateRequest>(body).is_err());

        let body = serde_json::json!({"language": "fr"});
        let update: ConfigUpdateRequest = serde_json::from_value(body).unwrap();
        assert_eq!(update.language.as_deref(), Some("fr"));
        assert_eq!(update.task, None);
    }
}
