//! Admission controller.
//!
//! The single place where a bot request is validated, defaulted, and turned
//! into a reservation, and the only place that translates a cap breach into
//! a user-visible refusal. Future policies (priority queues, per-platform
//! quotas) slot in here.

use serde::Deserialize;
use uuid::Uuid;

use crate::platform::Platform;
use crate::shared::error::ManagerError;
use crate::shared::models::{Meeting, MeetingConfig};
use crate::store::MeetingStore;

pub const TASK_TRANSCRIBE: &str = "transcribe";
pub const TASK_TRANSLATE: &str = "translate";
const BOT_NAME_MAX_LEN: usize = 64;

/// `POST /bots` body. Unknown keys are rejected at this boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartBotRequest {
    pub platform: Platform,
    pub native_meeting_id: String,
    pub bot_name: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
}

#[derive(Clone)]
pub struct AdmissionController {
    store: MeetingStore,
}

impl AdmissionController {
    pub fn new(store: MeetingStore) -> Self {
        AdmissionController { store }
    }

    /// Validate the request and reserve a slot under the user's cap.
    pub async fn admit(
        &self,
        user_id: Uuid,
        request: &StartBotRequest,
    ) -> Result<Meeting, ManagerError> {
        let config = validate(request)?;
        let meeting_url = request
            .platform
            .construct_meeting_url(&request.native_meeting_id)
            .ok_or_else(|| {
                ManagerError::Validation(format!(
                    "'{}' is not a valid {} meeting id",
                    request.native_meeting_id, request.platform
                ))
            })?;

        crate::store::retry_unavailable(|| {
            self.store.reserve(
                user_id,
                request.platform,
                request.native_meeting_id.clone(),
                Some(meeting_url.clone()),
                config.clone(),
            )
        })
        .await
    }
}

/// Apply defaults and bounds checks. `language = None` means auto-detect and
/// passes through untouched.
pub fn validate(request: &StartBotRequest) -> Result<MeetingConfig, ManagerError> {
    let name = request.bot_name.trim();
    if name.is_empty() || name.len() > BOT_NAME_MAX_LEN {
        return Err(ManagerError::Validation(format!(
            "bot_name must be 1..={} characters",
            BOT_NAME_MAX_LEN
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(ManagerError::Validation(
            "bot_name must contain only printable characters".to_string(),
        ));
    }

    let task = match request.task.as_deref() {
        None => TASK_TRANSCRIBE.to_string(),
        Some(TASK_TRANSCRIBE) => TASK_TRANSCRIBE.to_string(),
        Some(TASK_TRANSLATE) => TASK_TRANSLATE.to_string(),
        Some(other) => {
            return Err(ManagerError::Validation(format!(
                "task must be '{}' or '{}', got '{}'",
                TASK_TRANSCRIBE, TASK_TRANSLATE, other
            )))
        }
    };

    Ok(MeetingConfig {
        language: request.language.clone(),
        task,
        bot_name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> StartBotRequest {
        StartBotRequest {
            platform: Platform::Zoom,
            native_meeting_id: "123456789".to_string(),
            bot_name: "Rec".to_string(),
            language: None,
            task: None,
        }
    }

    #[test]
    fn task_defaults_to_transcribe() {
        let config = validate(&request()).unwrap();
        assert_eq!(config.task, "transcribe");
        assert_eq!(config.language, None);
    }

    #[test]
    fn translate_is_accepted() {
        let mut req = request();
        req.task = Some("translate".to_string());
        assert_eq!(validate(&req).unwrap().task, "translate");
    }

    #[test]
    fn unknown_task_is_rejected() {
        let mut req = request();
        req.task = Some("summarize".to_string());
        assert!(matches!(
            validate(&req),
            Err(ManagerError::Validation(_))
        ));
    }

    #[test]
    fn bot_name_bounds() {
        let mut req = request();
        req.bot_name = String::new();
        assert!(validate(&req).is_err());

        req.bot_name = "x".repeat(65);
        assert!(validate(&req).is_err());

        req.bot_name = "x".repeat(64);
        assert!(validate(&req).is_ok());

        req.bot_name = "tab\tname".to_string();
        assert!(validate(&req).is_err());
    }

    #[test]
    fn language_passes_through() {
        let mut req = request();
        req.language = Some("pl".to_string());
        assert_eq!(validate(&req).unwrap().language.as_deref(), Some("pl"));
    }

    #[test]
    fn unknown_body_keys_are_rejected() {
        let body = serde_json::json!({
            "platform": "zoom",
            "native_meeting_id": "123",
            "bot_name": "Rec",
            "record_video": true,
        });
        assert!(serde_json::from_value::<StartBotRequest>(body).is_err());
    }
}
