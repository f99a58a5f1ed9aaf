//! Cluster backend: drives an Incus cluster through its CLI. The cluster
//! schedules the instance onto a node; this adapter only names instances
//! and observes their lifecycle.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::process::Command as AsyncCommand;

use super::{ContainerOrchestrator, ContainerSpec, ContainerState, ExitStatus};
use crate::shared::error::ManagerError;

const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct IncusOrchestrator {
    binary: String,
}

impl IncusOrchestrator {
    pub fn new() -> Self {
        IncusOrchestrator {
            binary: "incus".to_string(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String, ManagerError> {
        debug!("{} {}", self.binary, args.join(" "));
        let output = AsyncCommand::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| ManagerError::OrchestratorFailed(format!("spawning incus: {}", e)))?;

        if !output.status.success() {
            return Err(ManagerError::OrchestratorFailed(format!(
                "incus {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for IncusOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

pub(super) fn init_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "init".to_string(),
        spec.image.clone(),
        spec.name.clone(),
        "--ephemeral".to_string(),
    ];
    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    for (key, value) in &spec.env {
        args.push("--config".to_string());
        args.push(format!("environment.{}={}", key, value));
    }
    args
}

#[derive(Debug, Deserialize)]
struct IncusInstance {
    status: String,
}

fn is_missing_instance(message: &str) -> bool {
    message.contains("Instance not found") || message.contains("not found")
}

#[async_trait]
impl ContainerOrchestrator for IncusOrchestrator {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ManagerError> {
        self.run(&init_args(spec)).await?;
        // Incus addresses instances by name; the name is the id.
        Ok(spec.name.clone())
    }

    async fn start(&self, container_id: &str) -> Result<(), ManagerError> {
        let result = self
            .run(&["start".to_string(), container_id.to_string()])
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(ManagerError::OrchestratorFailed(msg)) if msg.contains("already running") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), ManagerError> {
        let result = self
            .run(&[
                "stop".to_string(),
                container_id.to_string(),
                "--timeout".to_string(),
                grace.as_secs().to_string(),
                "--force".to_string(),
            ])
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(ManagerError::OrchestratorFailed(msg))
                if is_missing_instance(&msg) || msg.contains("already stopped") =>
            {
                warn!("stop: instance {} already gone", container_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, ManagerError> {
        let raw = self
            .run(&[
                "list".to_string(),
                container_id.to_string(),
                "--format".to_string(),
                "json".to_string(),
            ])
            .await?;
        let instances: Vec<IncusInstance> = serde_json::from_str(&raw).map_err(|e| {
            ManagerError::OrchestratorFailed(format!("parsing incus list output: {}", e))
        })?;
        let Some(instance) = instances.first() else {
            // An ephemeral instance that finished is indistinguishable from
            // a stopped one; report not-running.
            return Ok(ContainerState::default());
        };
        let running = instance.status.eq_ignore_ascii_case("running");
        Ok(ContainerState {
            running,
            exit_code: None,
            exit_reason: None,
        })
    }

    async fn wait_exit(
        &self,
        container_id: &str,
        timeout: Duration,
    ) -> Result<ExitStatus, ManagerError> {
        // Incus has no blocking wait; poll until the instance stops.
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.inspect(container_id).await?;
            if !state.running {
                return Ok(ExitStatus {
                    exit_code: state.exit_code.unwrap_or(0),
                    exit_reason: state.exit_reason,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ManagerError::OrchestratorFailed(format!(
                    "instance {} did not exit within {:?}",
                    container_id, timeout
                )));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_args_shape() {
        let spec = ContainerSpec {
            image: "meeting-bot:latest".to_string(),
            name: "bot-11".to_string(),
            network: None,
            env: vec![("TASK".to_string(), "transcribe".to_string())],
        };
        let args = init_args(&spec);
        assert_eq!(args[0], "init");
        assert_eq!(args[1], "meeting-bot:latest");
        assert_eq!(args[2], "bot-11");
        assert!(args.contains(&"--ephemeral".to_string()));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "--config" && w[1] == "environment.TASK=transcribe"));
    }

    #[test]
    fn instance_status_parsing() {
        let raw = r#"[{"status":"Running"}]"#;
        let instances: Vec<IncusInstance> = serde_json::from_str(raw).unwrap();
        assert_eq!(instances[0].status, "Running");
    }
}
