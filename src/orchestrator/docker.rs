//! Local backend: drives the `docker` CLI.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::process::Command as AsyncCommand;

use super::{ContainerOrchestrator, ContainerSpec, ContainerState, ExitStatus};
use crate::shared::error::ManagerError;

pub struct DockerOrchestrator {
    binary: String,
}

impl DockerOrchestrator {
    pub fn new() -> Self {
        DockerOrchestrator {
            binary: "docker".to_string(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String, ManagerError> {
        debug!("{} {}", self.binary, args.join(" "));
        let output = AsyncCommand::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| ManagerError::OrchestratorFailed(format!("spawning docker: {}", e)))?;

        if !output.status.success() {
            return Err(ManagerError::OrchestratorFailed(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

pub(super) fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--label".to_string(),
        "managed-by=botfleet".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];
    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(spec.image.clone());
    args
}

/// Subset of `docker inspect --format '{{json .State}}'`.
#[derive(Debug, Deserialize)]
struct DockerContainerState {
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "ExitCode")]
    exit_code: i64,
    #[serde(rename = "Error", default)]
    error: String,
}

fn is_missing_container(message: &str) -> bool {
    message.contains("No such container") || message.contains("No such object")
}

#[async_trait]
impl ContainerOrchestrator for DockerOrchestrator {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ManagerError> {
        self.run(&create_args(spec)).await
    }

    async fn start(&self, container_id: &str) -> Result<(), ManagerError> {
        // `docker start` succeeds on an already-running container.
        self.run(&["start".to_string(), container_id.to_string()])
            .await?;
        Ok(())
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), ManagerError> {
        let result = self
            .run(&[
                "stop".to_string(),
                "-t".to_string(),
                grace.as_secs().to_string(),
                container_id.to_string(),
            ])
            .await;
        match result {
            Ok(_) => Ok(()),
            // A container that is already gone satisfies a stop request.
            Err(ManagerError::OrchestratorFailed(msg)) if is_missing_container(&msg) => {
                warn!("stop: container {} already gone", container_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, ManagerError> {
        let raw = self
            .run(&[
                "inspect".to_string(),
                "--format".to_string(),
                "{{json .State}}".to_string(),
                container_id.to_string(),
            ])
            .await?;
        let state: DockerContainerState = serde_json::from_str(&raw).map_err(|e| {
            ManagerError::OrchestratorFailed(format!("parsing docker inspect output: {}", e))
        })?;
        Ok(ContainerState {
            running: state.running,
            exit_code: (!state.running).then_some(state.exit_code),
            exit_reason: (!state.error.is_empty()).then(|| state.error),
        })
    }

    async fn wait_exit(
        &self,
        container_id: &str,
        timeout: Duration,
    ) -> Result<ExitStatus, ManagerError> {
        let wait_args = ["wait".to_string(), container_id.to_string()];
        let wait = self.run(&wait_args);
        let raw = tokio::time::timeout(timeout, wait).await.map_err(|_| {
            ManagerError::OrchestratorFailed(format!(
                "container {} did not exit within {:?}",
                container_id, timeout
            ))
        })??;

        let exit_code = raw.parse::<i64>().map_err(|e| {
            ManagerError::OrchestratorFailed(format!("parsing docker wait output '{}': {}", raw, e))
        })?;
        let reason = self
            .inspect(container_id)
            .await
            .ok()
            .and_then(|s| s.exit_reason);
        Ok(ExitStatus {
            exit_code,
            exit_reason: reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_args_shape() {
        let spec = ContainerSpec {
            image: "meeting-bot:latest".to_string(),
            name: "bot-42".to_string(),
            network: Some("fleet_net".to_string()),
            env: vec![("CONNECTION_ID".to_string(), "uid-1".to_string())],
        };
        let args = create_args(&spec);
        assert_eq!(args[0], "create");
        assert_eq!(args.last().map(String::as_str), Some("meeting-bot:latest"));
        assert!(args.windows(2).any(|w| w[0] == "--name" && w[1] == "bot-42"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "--network" && w[1] == "fleet_net"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-e" && w[1] == "CONNECTION_ID=uid-1"));
    }

    #[test]
    fn create_args_without_network() {
        let spec = ContainerSpec {
            image: "meeting-bot:latest".to_string(),
            name: "bot-7".to_string(),
            network: None,
            env: vec![],
        };
        assert!(!create_args(&spec).contains(&"--network".to_string()));
    }

    #[test]
    fn inspect_state_parsing() {
        let raw = r#"{"Running":false,"ExitCode":137,"Error":"OOM"}"#;
        let state: DockerContainerState = serde_json::from_str(raw).unwrap();
        assert!(!state.running);
        assert_eq!(state.exit_code, 137);
        assert_eq!(state.error, "OOM");
    }

    #[test]
    fn missing_container_detection() {
        assert!(is_missing_container("Error: No such container: bot-9"));
        assert!(!is_missing_container("permission denied"));
    }
}
