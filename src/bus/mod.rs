//! Command bus adapter.
//!
//! One redis pub/sub channel per live bot, named by session_uid. Delivery is
//! at-most-once with no ack and no persistence: state truth lives in the
//! store, the bus only conveys intent. A publish with zero subscribers is a
//! success; the reaper or a follow-up request compensates for the loss.

use log::{debug, info, warn};
use redis::AsyncCommands;
use serde::Serialize;

use crate::shared::error::ManagerError;

/// Runtime commands a worker honors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BotCommand {
    Reconfigure {
        language: Option<String>,
        task: Option<String>,
    },
    Leave,
}

#[derive(Clone)]
pub struct CommandBus {
    client: redis::Client,
}

impl CommandBus {
    pub fn connect(bus_url: &str) -> Result<Self, ManagerError> {
        let client = redis::Client::open(bus_url)
            .map_err(|e| ManagerError::Unavailable(format!("invalid BUS_URL: {}", e)))?;
        Ok(CommandBus { client })
    }

    pub fn channel(session_uid: &str) -> String {
        format!("bot_commands:{}", session_uid)
    }

    /// Check connectivity at startup; failures are logged, not fatal.
    pub async fn ping(&self) {
        match self.client.get_multiplexed_async_connection().await {
            Ok(mut conn) => match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
                Ok(_) => info!("Connected to command bus"),
                Err(e) => warn!("Command bus ping failed: {}", e),
            },
            Err(e) => warn!("Failed to connect to command bus: {}", e),
        }
    }

    pub async fn publish(
        &self,
        session_uid: &str,
        command: &BotCommand,
    ) -> Result<(), ManagerError> {
        let payload = serde_json::to_string(command)?;
        let channel = Self::channel(session_uid);

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ManagerError::Unavailable(format!("command bus: {}", e)))?;

        // The receiver count is informational only; zero subscribers is not
        // an error under at-most-once semantics.
        let receivers: i64 = conn
            .publish(&channel, &payload)
            .await
            .map_err(|e| ManagerError::Unavailable(format!("command bus publish: {}", e)))?;
        debug!(
            "Published {} to '{}' ({} receivers)",
            payload, channel, receivers
        );
        Ok(())
    }
}

impl std::fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBus").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_naming() {
        assert_eq!(
            CommandBus::channel("0f9c2a"),
            "bot_commands:0f9c2a".to_string()
        );
    }

    #[test]
    fn leave_wire_format() {
        let payload = serde_json::to_string(&BotCommand::Leave).unwrap();
        assert_eq!(payload, r#"{"action":"leave"}"#);
    }

    #[test]
    fn reconfigure_wire_format() {
        let payload = serde_json::to_value(BotCommand::Reconfigure {
            language: Some("fr".to_string()),
            task: None,
        })
        .unwrap();
        assert_eq!(payload["action"], "reconfigure");
        assert_eq!(payload["language"], "fr");
        assert!(payload["task"].is_null());
    }
}
