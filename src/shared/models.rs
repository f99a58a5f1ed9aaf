//! Database models and lifecycle types.
//!
//! The `meetings` row is the single source of truth for one bot attempt;
//! every state machine decision in the service goes through `MeetingStatus`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use super::schema;
pub use super::schema::{meeting_sessions, meetings, users};

/// Lifecycle states of a Meeting. Transitions form a DAG; `completed` and
/// `failed` are terminal and rows in those states are kept for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingStatus {
    Reserved,
    Starting,
    Active,
    Stopping,
    Completed,
    Failed,
}

impl MeetingStatus {
    pub const NON_TERMINAL: [MeetingStatus; 4] = [
        MeetingStatus::Reserved,
        MeetingStatus::Starting,
        MeetingStatus::Active,
        MeetingStatus::Stopping,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reserved" => Some(Self::Reserved),
            "starting" => Some(Self::Starting),
            "active" => Some(Self::Active),
            "stopping" => Some(Self::Stopping),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Edge check for the lifecycle DAG.
    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Reserved, Self::Starting)
                | (Self::Reserved, Self::Failed)
                | (Self::Starting, Self::Active)
                | (Self::Starting, Self::Completed)
                | (Self::Starting, Self::Failed)
                | (Self::Active, Self::Stopping)
                | (Self::Active, Self::Completed)
                | (Self::Active, Self::Failed)
                | (Self::Stopping, Self::Completed)
                | (Self::Stopping, Self::Failed)
        )
    }
}

impl std::fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The recognized per-bot options. Anything else is rejected at admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingConfig {
    #[serde(default)]
    pub language: Option<String>,
    pub task: String,
    pub bot_name: String,
}

impl MeetingConfig {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// User database model. Consulted for the concurrency cap, never written.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub max_concurrent_bots: i32,
    pub created_at: DateTime<Utc>,
}

/// Meeting database model: one bot attempt.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = meetings)]
pub struct Meeting {
    pub id: Uuid,
    pub user_id: Uuid,
    pub platform: String,
    pub native_meeting_id: String,
    pub meeting_url: Option<String>,
    pub status: String,
    pub session_uid: String,
    pub bot_container_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub config: serde_json::Value,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Meeting {
    /// Parsed status column. `None` only if the row was written by a
    /// newer schema revision this binary does not know.
    pub fn status_parsed(&self) -> Option<MeetingStatus> {
        MeetingStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = meetings)]
pub struct NewMeeting {
    pub id: Uuid,
    pub user_id: Uuid,
    pub platform: String,
    pub native_meeting_id: String,
    pub meeting_url: Option<String>,
    pub status: String,
    pub session_uid: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-attempt session record, created on the worker's first callback.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = meeting_sessions)]
pub struct MeetingSession {
    pub id: Uuid,
    pub meeting_id: Uuid,
    pub session_uid: String,
    pub session_start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = meeting_sessions)]
pub struct NewMeetingSession {
    pub id: Uuid,
    pub meeting_id: Uuid,
    pub session_uid: String,
    pub session_start_time: DateTime<Utc>,
}

/// API projection of a Meeting row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingResponse {
    pub meeting_id: Uuid,
    pub user_id: Uuid,
    pub platform: String,
    pub native_meeting_id: String,
    pub status: String,
    pub bot_container_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub config: serde_json::Value,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Meeting> for MeetingResponse {
    fn from(meeting: Meeting) -> Self {
        MeetingResponse {
            meeting_id: meeting.id,
            user_id: meeting.user_id,
            platform: meeting.platform,
            native_meeting_id: meeting.native_meeting_id,
            status: meeting.status,
            bot_container_id: meeting.bot_container_id,
            start_time: meeting.start_time,
            end_time: meeting.end_time,
            config: meeting.config,
            failure_reason: meeting.failure_reason,
            created_at: meeting.created_at,
            updated_at: meeting.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            MeetingStatus::Reserved,
            MeetingStatus::Starting,
            MeetingStatus::Active,
            MeetingStatus::Stopping,
            MeetingStatus::Completed,
            MeetingStatus::Failed,
        ] {
            assert_eq!(MeetingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MeetingStatus::parse("paused"), None);
    }

    #[test]
    fn transition_dag_edges() {
        use MeetingStatus::*;

        assert!(Reserved.can_transition_to(Starting));
        assert!(Reserved.can_transition_to(Failed));
        assert!(Starting.can_transition_to(Active));
        // A worker may exit cleanly before it ever joins.
        assert!(Starting.can_transition_to(Completed));
        assert!(Active.can_transition_to(Stopping));
        assert!(Active.can_transition_to(Completed));
        assert!(Stopping.can_transition_to(Completed));
        assert!(Stopping.can_transition_to(Failed));

        // No edges out of terminal states, no self loops, no skipping back.
        assert!(!Completed.can_transition_to(Active));
        assert!(!Failed.can_transition_to(Reserved));
        assert!(!Active.can_transition_to(Active));
        assert!(!Active.can_transition_to(Starting));
        assert!(!Reserved.can_transition_to(Active));
    }

    #[test]
    fn terminal_states() {
        assert!(MeetingStatus::Completed.is_terminal());
        assert!(MeetingStatus::Failed.is_terminal());
        for status in MeetingStatus::NON_TERMINAL {
            assert!(!status.is_terminal());
        }
    }
}
