//! State store gateway.
//!
//! Typed access to the `meetings` and `meeting_sessions` tables. All
//! concurrency correctness lives here: admission is linearized by a
//! `FOR UPDATE` lock on the user row, and status transitions are a SQL
//! compare-and-set over the lifecycle DAG. diesel is blocking, so every
//! operation crosses `spawn_blocking`; callers never hold a lock across one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::warn;
use rand::Rng;
use uuid::Uuid;

use crate::config::ReaperConfig;
use crate::platform::Platform;
use crate::shared::error::ManagerError;
use crate::shared::models::{
    meeting_sessions, meetings, users, Meeting, MeetingConfig, MeetingStatus, NewMeeting,
    NewMeetingSession, User,
};
use crate::shared::utils::DbPool;

/// Optional column stamps applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusChange {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl StatusChange {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn started_at(at: DateTime<Utc>) -> Self {
        StatusChange {
            start_time: Some(at),
            ..Self::default()
        }
    }

    pub fn ended_at(at: DateTime<Utc>, failure_reason: Option<String>) -> Self {
        StatusChange {
            end_time: Some(at),
            failure_reason,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct MeetingStore {
    pool: DbPool,
}

impl MeetingStore {
    pub fn new(pool: DbPool) -> Self {
        MeetingStore { pool }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, ManagerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, ManagerError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| ManagerError::Unavailable(format!("store worker panicked: {}", e)))?
    }

    /// Reserve a bot slot for the user, enforcing the concurrency cap and
    /// the one-live-bot-per-meeting rule in a single transaction.
    pub async fn reserve(
        &self,
        user_id: Uuid,
        platform: Platform,
        native_meeting_id: String,
        meeting_url: Option<String>,
        config: MeetingConfig,
    ) -> Result<Meeting, ManagerError> {
        self.blocking(move |conn| {
            conn.transaction::<Meeting, ManagerError, _>(|conn| {
                // The row lock serializes concurrent reservations per user.
                let user: User = users::table
                    .find(user_id)
                    .for_update()
                    .first(conn)
                    .optional()?
                    .ok_or_else(|| ManagerError::NotFound(format!("user {}", user_id)))?;

                let live: i64 = meetings::table
                    .filter(meetings::user_id.eq(user_id))
                    .filter(meetings::status.eq_any(non_terminal_strs()))
                    .count()
                    .get_result(conn)?;

                if live >= i64::from(user.max_concurrent_bots) {
                    return Err(ManagerError::LimitExceeded(user.max_concurrent_bots));
                }

                let now = Utc::now();
                let row = NewMeeting {
                    id: Uuid::new_v4(),
                    user_id,
                    platform: platform.as_str().to_string(),
                    native_meeting_id: native_meeting_id.clone(),
                    meeting_url,
                    status: MeetingStatus::Reserved.as_str().to_string(),
                    session_uid: Uuid::new_v4().to_string(),
                    config: config.to_json(),
                    created_at: now,
                    updated_at: now,
                };

                diesel::insert_into(meetings::table)
                    .values(&row)
                    .returning(Meeting::as_returning())
                    .get_result(conn)
                    .map_err(|e| match ManagerError::from(e) {
                        ManagerError::Conflict(_) => ManagerError::Conflict(format!(
                            "a live bot already exists for {}/{}",
                            platform, native_meeting_id
                        )),
                        other => other,
                    })
            })
        })
        .await
    }

    /// Record the container id for a meeting. Single-use: a second call for
    /// the same meeting is a conflict.
    pub async fn set_container(
        &self,
        meeting_id: Uuid,
        container_id: String,
    ) -> Result<(), ManagerError> {
        self.blocking(move |conn| {
            let updated = diesel::update(
                meetings::table
                    .filter(meetings::id.eq(meeting_id))
                    .filter(meetings::bot_container_id.is_null()),
            )
            .set((
                meetings::bot_container_id.eq(&container_id),
                meetings::updated_at.eq(Utc::now()),
            ))
            .execute(conn)?;

            if updated == 1 {
                return Ok(());
            }
            let existing: Option<Meeting> = meetings::table
                .find(meeting_id)
                .first(conn)
                .optional()?;
            match existing {
                None => Err(ManagerError::NotFound(format!("meeting {}", meeting_id))),
                Some(_) => Err(ManagerError::Conflict(format!(
                    "container already recorded for meeting {}",
                    meeting_id
                ))),
            }
        })
        .await
    }

    /// Compare-and-set status transition over the lifecycle DAG. Idempotent
    /// when the row is already in the target state.
    pub async fn advance_status(
        &self,
        meeting_id: Uuid,
        from: &[MeetingStatus],
        to: MeetingStatus,
        change: StatusChange,
    ) -> Result<Meeting, ManagerError> {
        debug_assert!(from.iter().all(|f| f.can_transition_to(to)));
        let from_strs: Vec<&'static str> = from.iter().map(|s| s.as_str()).collect();

        self.blocking(move |conn| {
            let now = Utc::now();
            let target = meetings::table
                .filter(meetings::id.eq(meeting_id))
                .filter(meetings::status.eq_any(from_strs));

            // diesel changesets are statically typed, so each stamp shape is
            // its own update statement.
            let updated = if let Some(start) = change.start_time {
                diesel::update(target)
                    .set((
                        meetings::status.eq(to.as_str()),
                        meetings::start_time.eq(start),
                        meetings::updated_at.eq(now),
                    ))
                    .execute(conn)?
            } else if let Some(end) = change.end_time {
                diesel::update(target)
                    .set((
                        meetings::status.eq(to.as_str()),
                        meetings::end_time.eq(end),
                        meetings::failure_reason.eq(change.failure_reason.clone()),
                        meetings::updated_at.eq(now),
                    ))
                    .execute(conn)?
            } else {
                diesel::update(target)
                    .set((
                        meetings::status.eq(to.as_str()),
                        meetings::updated_at.eq(now),
                    ))
                    .execute(conn)?
            };

            let row: Option<Meeting> = meetings::table
                .find(meeting_id)
                .first(conn)
                .optional()?;
            let row = row.ok_or_else(|| ManagerError::NotFound(format!("meeting {}", meeting_id)))?;

            if updated == 1 {
                return Ok(row);
            }
            match row.status_parsed() {
                // Lost a race against an identical transition; same outcome.
                Some(current) if current == to => Ok(row),
                Some(current) => Err(ManagerError::IllegalTransition { from: current, to }),
                None => Err(ManagerError::Unavailable(format!(
                    "meeting {} has unknown status '{}'",
                    meeting_id, row.status
                ))),
            }
        })
        .await
    }

    /// Bump `updated_at`; the reaper treats it as the liveness signal.
    pub async fn touch(&self, meeting_id: Uuid) -> Result<(), ManagerError> {
        self.blocking(move |conn| {
            let updated = diesel::update(meetings::table.find(meeting_id))
                .set(meetings::updated_at.eq(Utc::now()))
                .execute(conn)?;
            if updated == 0 {
                return Err(ManagerError::NotFound(format!("meeting {}", meeting_id)));
            }
            Ok(())
        })
        .await
    }

    /// Idempotent on `(meeting_id, session_uid)`; reconnects reuse the row.
    pub async fn upsert_session(
        &self,
        meeting_id: Uuid,
        session_uid: String,
        start_time: DateTime<Utc>,
    ) -> Result<(), ManagerError> {
        self.blocking(move |conn| {
            diesel::insert_into(meeting_sessions::table)
                .values(&NewMeetingSession {
                    id: Uuid::new_v4(),
                    meeting_id,
                    session_uid,
                    session_start_time: start_time,
                })
                .on_conflict((
                    meeting_sessions::meeting_id,
                    meeting_sessions::session_uid,
                ))
                .do_nothing()
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    /// Merge worker-accepted `language`/`task` into the stored config.
    pub async fn update_config(
        &self,
        meeting_id: Uuid,
        language: Option<String>,
        task: Option<String>,
    ) -> Result<(), ManagerError> {
        if language.is_none() && task.is_none() {
            return Ok(());
        }
        self.blocking(move |conn| {
            conn.transaction::<(), ManagerError, _>(|conn| {
                let row: Option<Meeting> = meetings::table
                    .find(meeting_id)
                    .for_update()
                    .first(conn)
                    .optional()?;
                let row =
                    row.ok_or_else(|| ManagerError::NotFound(format!("meeting {}", meeting_id)))?;

                let mut config = row.config;
                if let Some(map) = config.as_object_mut() {
                    if let Some(lang) = language {
                        map.insert("language".to_string(), serde_json::Value::String(lang));
                    }
                    if let Some(task) = task {
                        map.insert("task".to_string(), serde_json::Value::String(task));
                    }
                }

                diesel::update(meetings::table.find(meeting_id))
                    .set((
                        meetings::config.eq(config),
                        meetings::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    /// Non-terminal meetings whose `updated_at` is older than the threshold
    /// for their current status.
    pub async fn scan_stale(
        &self,
        now: DateTime<Utc>,
        thresholds: ReaperConfig,
    ) -> Result<Vec<Meeting>, ManagerError> {
        self.blocking(move |conn| {
            let cutoff = |d: Duration| now - chrono::Duration::seconds(d.as_secs() as i64);
            let rows = meetings::table
                .filter(
                    meetings::status
                        .eq(MeetingStatus::Reserved.as_str())
                        .and(meetings::updated_at.lt(cutoff(thresholds.reserve_stale))),
                )
                .or_filter(
                    meetings::status
                        .eq(MeetingStatus::Starting.as_str())
                        .and(meetings::updated_at.lt(cutoff(thresholds.starting_stale))),
                )
                .or_filter(
                    meetings::status
                        .eq(MeetingStatus::Active.as_str())
                        .and(meetings::updated_at.lt(cutoff(thresholds.heartbeat_stale))),
                )
                .or_filter(
                    meetings::status
                        .eq(MeetingStatus::Stopping.as_str())
                        .and(meetings::updated_at.lt(cutoff(thresholds.stopping_stale))),
                )
                .order(meetings::updated_at.asc())
                .load::<Meeting>(conn)?;
            Ok(rows)
        })
        .await
    }

    pub async fn read(&self, meeting_id: Uuid) -> Result<Meeting, ManagerError> {
        self.blocking(move |conn| {
            meetings::table
                .find(meeting_id)
                .first::<Meeting>(conn)
                .optional()?
                .ok_or_else(|| ManagerError::NotFound(format!("meeting {}", meeting_id)))
        })
        .await
    }

    /// Resolve a meeting from the session_uid a worker presented. `None`
    /// means the token matches no reservation.
    pub async fn find_by_session_uid(
        &self,
        session_uid: String,
    ) -> Result<Option<Meeting>, ManagerError> {
        self.blocking(move |conn| {
            Ok(meetings::table
                .filter(meetings::session_uid.eq(session_uid))
                .first::<Meeting>(conn)
                .optional()?)
        })
        .await
    }

    /// Most recent meeting of a user for a platform-native meeting id,
    /// any status.
    pub async fn latest_for_native(
        &self,
        user_id: Uuid,
        platform: Platform,
        native_meeting_id: String,
    ) -> Result<Option<Meeting>, ManagerError> {
        self.blocking(move |conn| {
            Ok(meetings::table
                .filter(meetings::user_id.eq(user_id))
                .filter(meetings::platform.eq(platform.as_str()))
                .filter(meetings::native_meeting_id.eq(native_meeting_id))
                .order(meetings::created_at.desc())
                .first::<Meeting>(conn)
                .optional()?)
        })
        .await
    }

    pub async fn list(
        &self,
        user_id: Option<Uuid>,
        status: Option<MeetingStatus>,
    ) -> Result<Vec<Meeting>, ManagerError> {
        self.blocking(move |conn| {
            let mut query = meetings::table.into_boxed();
            if let Some(uid) = user_id {
                query = query.filter(meetings::user_id.eq(uid));
            }
            if let Some(status) = status {
                query = query.filter(meetings::status.eq(status.as_str()));
            }
            Ok(query
                .order(meetings::created_at.desc())
                .load::<Meeting>(conn)?)
        })
        .await
    }

    pub async fn active_count_for_user(&self, user_id: Uuid) -> Result<i64, ManagerError> {
        self.blocking(move |conn| {
            Ok(meetings::table
                .filter(meetings::user_id.eq(user_id))
                .filter(meetings::status.eq_any(non_terminal_strs()))
                .count()
                .get_result(conn)?)
        })
        .await
    }
}

fn non_terminal_strs() -> Vec<&'static str> {
    MeetingStatus::NON_TERMINAL
        .iter()
        .map(|s| s.as_str())
        .collect()
}

/// Retry an operation on `Unavailable` with capped exponential backoff
/// (3 attempts, 100 ms doubling, jittered). All store mutators are
/// idempotent when keyed by meeting id, so replays are safe.
pub async fn retry_unavailable<T, Fut, F>(mut op: F) -> Result<T, ManagerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ManagerError>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(ManagerError::Unavailable(reason)) if attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                let jitter: u64 = rand::thread_rng().gen_range(0..50);
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt - 1) + jitter);
                warn!(
                    "transient store error ({}), retrying in {:?} ({}/{})",
                    reason,
                    backoff,
                    attempt,
                    MAX_ATTEMPTS - 1
                );
                tokio::time::sleep(backoff).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn status_change_stamps() {
        let now = Utc::now();
        let change = StatusChange::started_at(now);
        assert_eq!(change.start_time, Some(now));
        assert!(change.end_time.is_none());

        let change = StatusChange::ended_at(now, Some("join_timeout".to_string()));
        assert_eq!(change.end_time, Some(now));
        assert_eq!(change.failure_reason.as_deref(), Some("join_timeout"));
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_unavailable(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ManagerError::Unavailable("pool exhausted".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.ok(), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_unavailable(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ManagerError::Unavailable("down".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(ManagerError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_touch_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_unavailable(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ManagerError::LimitExceeded(1)) }
        })
        .await;
        assert!(matches!(result, Err(ManagerError::LimitExceeded(1))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
