//! Reaper.
//!
//! Periodic scanner that drives stuck meetings to terminal `failed` and
//! releases their containers. A worker that dies silently at any lifecycle
//! phase stops bumping `updated_at`; once the row exceeds the threshold for
//! its status, the next tick reaps it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use tokio::task::JoinHandle;

use crate::config::ReaperConfig;
use crate::orchestrator::ContainerOrchestrator;
use crate::shared::error::ManagerError;
use crate::shared::models::{Meeting, MeetingStatus};
use crate::store::{retry_unavailable, MeetingStore, StatusChange};

const REAP_STOP_GRACE: Duration = Duration::from_secs(10);

/// Failure reason recorded when reaping a meeting stuck in `status`.
pub fn stale_reason(status: MeetingStatus) -> Option<&'static str> {
    match status {
        MeetingStatus::Reserved => Some("startup_timeout"),
        MeetingStatus::Starting => Some("join_timeout"),
        MeetingStatus::Active => Some("heartbeat_lost"),
        MeetingStatus::Stopping => Some("shutdown_timeout"),
        MeetingStatus::Completed | MeetingStatus::Failed => None,
    }
}

#[derive(Clone)]
pub struct Reaper {
    store: MeetingStore,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    config: ReaperConfig,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReapSummary {
    pub scanned: usize,
    pub reaped: usize,
}

impl Reaper {
    pub fn new(
        store: MeetingStore,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        config: ReaperConfig,
    ) -> Self {
        Reaper {
            store,
            orchestrator,
            config,
        }
    }

    /// Spawn the periodic loop. Aborting the returned handle interrupts the
    /// reaper at the next tick boundary.
    pub fn start(self) -> JoinHandle<()> {
        info!("Starting reaper (tick every {:?})", self.config.tick);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match self.tick().await {
                    Ok(summary) if summary.reaped > 0 => {
                        info!(
                            "Reaper tick: {} stale, {} reaped",
                            summary.scanned, summary.reaped
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("Reaper tick failed: {}", e),
                }
            }
        })
    }

    /// One scan over the store. Each stale meeting is failed with the reason
    /// matching its stuck phase, then its container is stopped best-effort.
    pub async fn tick(&self) -> Result<ReapSummary, ManagerError> {
        let stale = retry_unavailable(|| {
            self.store.scan_stale(Utc::now(), self.config.clone())
        })
        .await?;

        let mut summary = ReapSummary {
            scanned: stale.len(),
            reaped: 0,
        };
        for meeting in stale {
            if self.reap(&meeting).await {
                summary.reaped += 1;
            }
        }
        Ok(summary)
    }

    async fn reap(&self, meeting: &Meeting) -> bool {
        let Some(status) = meeting.status_parsed() else {
            warn!(
                "Skipping meeting {} with unknown status '{}'",
                meeting.id, meeting.status
            );
            return false;
        };
        let Some(reason) = stale_reason(status) else {
            return false;
        };

        warn!(
            "Reaping meeting {} stuck in {} ({})",
            meeting.id, status, reason
        );

        let from_statuses = [status];
        let advanced = retry_unavailable(|| {
            self.store.advance_status(
                meeting.id,
                &from_statuses,
                MeetingStatus::Failed,
                StatusChange::ended_at(Utc::now(), Some(reason.to_string())),
            )
        })
        .await;
        let reaped = match advanced {
            Ok(_) => true,
            // The worker beat us to a transition between scan and reap.
            Err(ManagerError::IllegalTransition { from, .. }) => {
                info!(
                    "Meeting {} moved to {} before the reaper got to it",
                    meeting.id, from
                );
                false
            }
            Err(e) => {
                error!("Could not fail meeting {}: {}", meeting.id, e);
                false
            }
        };

        if reaped {
            if let Some(container_id) = &meeting.bot_container_id {
                if let Err(e) = self.orchestrator.stop(container_id, REAP_STOP_GRACE).await {
                    warn!(
                        "Stopping container {} for reaped meeting {} failed: {}",
                        container_id, meeting.id, e
                    );
                }
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_match_stuck_phase() {
        assert_eq!(
            stale_reason(MeetingStatus::Reserved),
            Some("startup_timeout")
        );
        assert_eq!(stale_reason(MeetingStatus::Starting), Some("join_timeout"));
        assert_eq!(stale_reason(MeetingStatus::Active), Some("heartbeat_lost"));
        assert_eq!(
            stale_reason(MeetingStatus::Stopping),
            Some("shutdown_timeout")
        );
    }

    #[test]
    fn terminal_rows_are_never_reaped() {
        assert_eq!(stale_reason(MeetingStatus::Completed), None);
        assert_eq!(stale_reason(MeetingStatus::Failed), None);
    }
}
