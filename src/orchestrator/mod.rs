//! Container orchestrator adapter.
//!
//! The lifecycle manager knows only this interface. Two backends exist: a
//! local container daemon driven through the `docker` CLI and a clustered
//! scheduler driven through the `incus` CLI.

pub mod docker;
pub mod incus;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{AppConfig, OrchKind};
use crate::shared::error::ManagerError;
use crate::shared::models::{Meeting, MeetingConfig};

pub use docker::DockerOrchestrator;
pub use incus::IncusOrchestrator;

/// Everything a backend needs to launch one worker. Resource requirements
/// are fixed per image, so the spec is deterministic for a given meeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub network: Option<String>,
    pub env: Vec<(String, String)>,
}

impl ContainerSpec {
    /// Worker environment contract: the session_uid doubles as the callback
    /// token, and the callback URL points back at the callback ingress.
    pub fn for_worker(config: &AppConfig, meeting: &Meeting, bot_config: &MeetingConfig) -> Self {
        let mut env = vec![
            ("MEETING_ID".to_string(), meeting.id.to_string()),
            ("CONNECTION_ID".to_string(), meeting.session_uid.clone()),
            ("PLATFORM".to_string(), meeting.platform.clone()),
            (
                "NATIVE_MEETING_ID".to_string(),
                meeting.native_meeting_id.clone(),
            ),
            ("BOT_NAME".to_string(), bot_config.bot_name.clone()),
            ("TASK".to_string(), bot_config.task.clone()),
            ("BUS_URL".to_string(), config.bus_url.clone()),
            (
                "CALLBACK_URL".to_string(),
                format!(
                    "{}/callback",
                    config.callback_base_url.trim_end_matches('/')
                ),
            ),
        ];
        if let Some(url) = &meeting.meeting_url {
            env.push(("MEETING_URL".to_string(), url.clone()));
        }
        if let Some(language) = &bot_config.language {
            env.push(("LANGUAGE".to_string(), language.clone()));
        }

        ContainerSpec {
            image: config.bot_image.clone(),
            name: container_name(meeting.id),
            network: config.container_network.clone(),
            env,
        }
    }
}

pub fn container_name(meeting_id: Uuid) -> String {
    format!("bot-{}", meeting_id)
}

/// Point-in-time view of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: Option<i64>,
    pub exit_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub exit_code: i64,
    pub exit_reason: Option<String>,
}

#[async_trait]
pub trait ContainerOrchestrator: Send + Sync {
    /// Create a container for the spec, returning its opaque id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ManagerError>;

    /// Start a created container. Idempotent on already-running.
    async fn start(&self, container_id: &str) -> Result<(), ManagerError>;

    /// Request graceful termination within `grace`, then force. Safe to call
    /// repeatedly and on containers that are already gone.
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), ManagerError>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, ManagerError>;

    /// Block until the container exits or the timeout lapses.
    async fn wait_exit(
        &self,
        container_id: &str,
        timeout: Duration,
    ) -> Result<ExitStatus, ManagerError>;
}

pub fn build_orchestrator(config: &AppConfig) -> Arc<dyn ContainerOrchestrator> {
    match config.orch_kind {
        OrchKind::Local => Arc::new(DockerOrchestrator::new()),
        OrchKind::Cluster => Arc::new(IncusOrchestrator::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReaperConfig, ServerConfig};
    use chrono::Utc;

    fn test_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            store_url: "postgres://localhost/test".to_string(),
            bus_url: "redis://localhost:6379".to_string(),
            orch_kind: OrchKind::Local,
            bot_image: "meeting-bot:latest".to_string(),
            container_network: Some("fleet_net".to_string()),
            callback_base_url: "http://manager:8080/".to_string(),
            reaper: ReaperConfig::default(),
        }
    }

    fn test_meeting() -> Meeting {
        let now = Utc::now();
        Meeting {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            platform: "google_meet".to_string(),
            native_meeting_id: "abc-defg-hij".to_string(),
            meeting_url: Some("https://meet.google.com/abc-defg-hij".to_string()),
            status: "reserved".to_string(),
            session_uid: Uuid::new_v4().to_string(),
            bot_container_id: None,
            start_time: None,
            end_time: None,
            config: serde_json::json!({}),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn worker_spec_carries_session_and_callback() {
        let meeting = test_meeting();
        let spec = ContainerSpec::for_worker(
            &test_config(),
            &meeting,
            &MeetingConfig {
                language: Some("fr".to_string()),
                task: "transcribe".to_string(),
                bot_name: "Rec".to_string(),
            },
        );

        let env: std::collections::HashMap<_, _> = spec.env.iter().cloned().collect();
        assert_eq!(env["CONNECTION_ID"], meeting.session_uid);
        assert_eq!(env["MEETING_ID"], meeting.id.to_string());
        assert_eq!(env["CALLBACK_URL"], "http://manager:8080/callback");
        assert_eq!(env["LANGUAGE"], "fr");
        assert_eq!(spec.name, format!("bot-{}", meeting.id));
        assert_eq!(spec.network.as_deref(), Some("fleet_net"));
    }

    #[test]
    fn worker_spec_omits_absent_language() {
        let meeting = test_meeting();
        let spec = ContainerSpec::for_worker(
            &test_config(),
            &meeting,
            &MeetingConfig {
                language: None,
                task: "transcribe".to_string(),
                bot_name: "Rec".to_string(),
            },
        );
        assert!(spec.env.iter().all(|(k, _)| k != "LANGUAGE"));
    }
}
