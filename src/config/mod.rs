//! Environment-driven configuration.
//!
//! Recognized variables: `STORE_URL`, `BUS_URL`, `ORCH_KIND`, `BOT_IMAGE`,
//! `CALLBACK_BASE_URL`, `CONTAINER_NETWORK`, `HOST`, `PORT` and the reaper
//! thresholds `T_REAP`, `T_RESERVE_STALE`, `T_STARTING_STALE`,
//! `T_HEARTBEAT_STALE`, `T_STOPPING_STALE` (seconds).

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store_url: String,
    pub bus_url: String,
    pub orch_kind: OrchKind,
    pub bot_image: String,
    pub container_network: Option<String>,
    pub callback_base_url: String,
    pub reaper: ReaperConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrchKind {
    /// Local container daemon, driven through the `docker` CLI.
    Local,
    /// Clustered scheduler, driven through the `incus` CLI.
    Cluster,
}

impl OrchKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "cluster" => Some(Self::Cluster),
            _ => None,
        }
    }
}

/// Tick period and per-status staleness thresholds for the reaper.
#[derive(Clone, Debug)]
pub struct ReaperConfig {
    pub tick: Duration,
    pub reserve_stale: Duration,
    pub starting_stale: Duration,
    pub heartbeat_stale: Duration,
    pub stopping_stale: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            tick: Duration::from_secs(60),
            reserve_stale: Duration::from_secs(5 * 60),
            starting_stale: Duration::from_secs(10 * 60),
            heartbeat_stale: Duration::from_secs(2 * 60),
            stopping_stale: Duration::from_secs(5 * 60),
        }
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn env_secs(key: &str, fallback: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

impl AppConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let defaults = ReaperConfig::default();

        let orch_raw = env_or("ORCH_KIND", "local");
        let orch_kind = OrchKind::parse(&orch_raw)
            .ok_or_else(|| anyhow::anyhow!("ORCH_KIND must be 'local' or 'cluster', got '{}'", orch_raw))?;

        let port = env_or("PORT", "8080")
            .parse::<u16>()
            .map_err(|e| anyhow::anyhow!("invalid PORT: {}", e))?;

        Ok(AppConfig {
            server: ServerConfig {
                host: env_or("HOST", "0.0.0.0"),
                port,
            },
            store_url: env_or(
                "STORE_URL",
                "postgres://postgres:@localhost:5432/botfleet",
            ),
            bus_url: env_or("BUS_URL", "redis://localhost:6379"),
            orch_kind,
            bot_image: env_or("BOT_IMAGE", "meeting-bot:latest"),
            container_network: std::env::var("CONTAINER_NETWORK")
                .ok()
                .filter(|v| !v.is_empty()),
            callback_base_url: env_or("CALLBACK_BASE_URL", "http://localhost:8080"),
            reaper: ReaperConfig {
                tick: env_secs("T_REAP", defaults.tick),
                reserve_stale: env_secs("T_RESERVE_STALE", defaults.reserve_stale),
                starting_stale: env_secs("T_STARTING_STALE", defaults.starting_stale),
                heartbeat_stale: env_secs("T_HEARTBEAT_STALE", defaults.heartbeat_stale),
                stopping_stale: env_secs("T_STOPPING_STALE", defaults.stopping_stale),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orch_kind_parsing() {
        assert_eq!(OrchKind::parse("local"), Some(OrchKind::Local));
        assert_eq!(OrchKind::parse("cluster"), Some(OrchKind::Cluster));
        assert_eq!(OrchKind::parse("swarm"), None);
    }

    #[test]
    fn reaper_defaults() {
        let cfg = ReaperConfig::default();
        assert_eq!(cfg.tick, Duration::from_secs(60));
        assert_eq!(cfg.reserve_stale, Duration::from_secs(300));
        assert_eq!(cfg.starting_stale, Duration::from_secs(600));
        assert_eq!(cfg.heartbeat_stale, Duration::from_secs(120));
        assert_eq!(cfg.stopping_stale, Duration::from_secs(300));
    }
}
