/// Focus session lifecycle against PostgreSQL
///
/// Transitions lock the session row (`SELECT ... FOR UPDATE`), apply the
/// domain state machine and write the row back in the same transaction.
/// Interruptions live in their own table and are only ever appended.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use deadpool_postgres::Transaction;
use tokio::sync::Mutex;
use tokio_postgres::Row;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::domain::{
    today, DailySessionKey, DailySessionStats, DomainError, FocusSession, Interruption, NewSession,
    SessionStatus, SessionType, SessionTypeStats,
};
use crate::services::remote::parse_id;
use crate::storage::{execute_with_retry, PostgresStore, StorageError};

const ENTITY: &str = "Focus session";

const SELECT_SESSIONS: &str = "SELECT id, type, start_time, planned_duration, status, date,
            actual_duration, end_time, notes, productivity, paused_at, paused_duration
     FROM focus_sessions";

const SELECT_INTERRUPTIONS: &str = "SELECT focus_session_id, timestamp, reason, app_name
     FROM focus_session_interruptions
     WHERE focus_session_id = ANY($1)
     ORDER BY id";

fn not_found(id: impl ToString) -> StorageError {
    StorageError::NotFound {
        entity: ENTITY,
        id: id.to_string(),
    }
}

fn session_from_row(row: &Row) -> Result<FocusSession, StorageError> {
    let id: i64 = row.try_get("id")?;
    let session_type: String = row.try_get("type")?;
    let status: String = row.try_get("status")?;
    let productivity: Option<i16> = row.try_get("productivity")?;

    Ok(FocusSession {
        id: Some(id.to_string()),
        session_type: SessionType::from_ui(&session_type),
        start_time: row.try_get("start_time")?,
        planned_duration: row.try_get("planned_duration")?,
        status: status.parse()?,
        date: row.try_get("date")?,
        interruptions: Vec::new(),
        actual_duration: row.try_get("actual_duration")?,
        end_time: row.try_get("end_time")?,
        notes: row.try_get("notes")?,
        productivity: productivity.and_then(|p| u8::try_from(p).ok()),
        paused_at: row.try_get("paused_at")?,
        paused_duration: row.try_get("paused_duration")?,
    })
}

/// Attach interruption rows to the sessions they belong to, in row order
fn attach_interruptions(sessions: &mut [FocusSession], rows: &[Row]) -> Result<(), StorageError> {
    let mut by_session: HashMap<String, Vec<Interruption>> = HashMap::new();
    for row in rows {
        let owner: i64 = row.try_get("focus_session_id")?;
        by_session
            .entry(owner.to_string())
            .or_default()
            .push(Interruption::new(
                row.try_get("timestamp")?,
                row.try_get("reason")?,
                row.try_get("app_name")?,
            ));
    }
    for session in sessions {
        if let Some(found) = session.id.as_ref().and_then(|id| by_session.remove(id)) {
            session.interruptions = found;
        }
    }
    Ok(())
}

fn row_ids(sessions: &[FocusSession]) -> Vec<i64> {
    sessions
        .iter()
        .filter_map(|s| s.id.as_deref().and_then(|id| id.parse().ok()))
        .collect()
}

async fn insert_interruptions(
    tx: &Transaction<'_>,
    session_id: i64,
    interruptions: &[Interruption],
) -> Result<(), StorageError> {
    for interruption in interruptions {
        tx.execute(
            "INSERT INTO focus_session_interruptions (focus_session_id, timestamp, reason, app_name)
             VALUES ($1, $2, $3, $4)",
            &[
                &session_id,
                &interruption.timestamp,
                &interruption.reason,
                &interruption.app_name,
            ],
        )
        .await?;
    }
    Ok(())
}

/// Lock a session row and load it with its interruptions
async fn lock_session(tx: &Transaction<'_>, id: i64) -> Result<FocusSession, StorageError> {
    let sql = format!("{} WHERE id = $1 FOR UPDATE", SELECT_SESSIONS);
    let row = tx.query_opt(sql.as_str(), &[&id]).await?.ok_or_else(|| not_found(id))?;
    let mut sessions = vec![session_from_row(&row)?];
    let rows = tx.query(SELECT_INTERRUPTIONS, &[&vec![id]]).await?;
    attach_interruptions(&mut sessions, &rows)?;
    sessions.pop().ok_or_else(|| not_found(id))
}

/// Write a session's mutable columns plus any interruptions past `known`
async fn write_session(
    tx: &Transaction<'_>,
    id: i64,
    session: &FocusSession,
    known: usize,
) -> Result<(), StorageError> {
    tx.execute(
        "UPDATE focus_sessions SET
             status = $2, actual_duration = $3, end_time = $4, notes = $5,
             productivity = $6, paused_at = $7, paused_duration = $8, updated_at = NOW()
         WHERE id = $1",
        &[
            &id,
            &session.status.as_str(),
            &session.actual_duration,
            &session.end_time,
            &session.notes,
            &session.productivity.map(i16::from),
            &session.paused_at,
            &session.paused_duration,
        ],
    )
    .await?;

    let added = session.interruptions.get(known..).unwrap_or_default();
    insert_interruptions(tx, id, added).await
}

/// Service for starting, pausing and ending focus sessions in PostgreSQL
pub struct RemoteFocusSessionService {
    store: Arc<PostgresStore>,
    retry: RetryPolicy,
    current: Mutex<Option<FocusSession>>,
}

impl RemoteFocusSessionService {
    pub fn new(store: Arc<PostgresStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            current: Mutex::new(None),
        }
    }

    pub async fn current_session(&self) -> Option<FocusSession> {
        self.current.lock().await.clone()
    }

    /// Insert a complete session with its interruptions inside a caller's
    /// transaction, returning the new row id
    pub async fn insert_session_in_transaction(
        tx: &Transaction<'_>,
        session: &FocusSession,
    ) -> Result<i64, StorageError> {
        let row = tx
            .query_one(
                "INSERT INTO focus_sessions
                     (type, start_time, planned_duration, status, date, actual_duration,
                      end_time, notes, productivity, paused_at, paused_duration)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 RETURNING id",
                &[
                    &session.session_type.as_str(),
                    &session.start_time,
                    &session.planned_duration,
                    &session.status.as_str(),
                    &session.date,
                    &session.actual_duration,
                    &session.end_time,
                    &session.notes,
                    &session.productivity.map(i16::from),
                    &session.paused_at,
                    &session.paused_duration,
                ],
            )
            .await?;
        let id: i64 = row.try_get(0)?;
        insert_interruptions(tx, id, &session.interruptions).await?;
        Ok(id)
    }

    /// Start a session, cancelling the current one first
    pub async fn start_session(&self, request: NewSession) -> Result<FocusSession, StorageError> {
        let previous = self.current.lock().await.clone();
        if let Some(id) = previous.and_then(|s| s.id) {
            match self.end_session(&id, SessionStatus::Cancelled, None).await {
                Ok(_) => info!("Cancelled focus session {} to start a new one", id),
                Err(StorageError::Validation(DomainError::InvalidTransition { .. }))
                | Err(StorageError::NotFound { .. }) => {
                    debug!("Previous focus session {} was no longer current", id);
                    *self.current.lock().await = None;
                }
                Err(e) => return Err(e),
            }
        }

        let mut session = FocusSession::start(request, Utc::now())?;
        let pending = &session;
        let id = execute_with_retry(self.store.as_ref(), &self.retry, move || {
            let pending = pending.clone();
            self.store.transaction(move |tx| {
                Box::pin(async move { Self::insert_session_in_transaction(tx, &pending).await })
            })
        })
        .await?;

        session.id = Some(id.to_string());
        *self.current.lock().await = Some(session.clone());

        info!(
            "Started {} session {} ({}ms planned)",
            session.session_type, id, session.planned_duration
        );
        Ok(session)
    }

    pub async fn pause_session(&self, id: &str) -> Result<FocusSession, StorageError> {
        let now = Utc::now();
        self.modify(id, move |session| session.pause(now)).await
    }

    pub async fn resume_session(&self, id: &str) -> Result<FocusSession, StorageError> {
        let now = Utc::now();
        self.modify(id, move |session| session.resume(now)).await
    }

    /// Finish a session as completed or cancelled
    pub async fn end_session(
        &self,
        id: &str,
        status: SessionStatus,
        actual_duration: Option<i64>,
    ) -> Result<FocusSession, StorageError> {
        let now = Utc::now();
        let session = self
            .modify(id, move |session| session.end(status, actual_duration, now))
            .await?;
        info!("Focus session {} ended as {}", id, status);
        Ok(session)
    }

    pub async fn add_interruption(
        &self,
        id: &str,
        reason: Option<&str>,
        app_name: Option<&str>,
    ) -> Result<FocusSession, StorageError> {
        let interruption = Interruption::new(
            Utc::now(),
            reason.map(str::to_string),
            app_name.map(str::to_string),
        );
        self.modify(id, move |session| session.add_interruption(interruption.clone()))
            .await
    }

    /// Rate a session from 1 to 5; non-empty notes replace the stored ones
    pub async fn update_session_rating(
        &self,
        id: &str,
        productivity: u8,
        notes: Option<String>,
    ) -> Result<FocusSession, StorageError> {
        self.modify(id, move |session| session.rate(productivity, notes.clone()))
            .await
    }

    async fn modify<F>(&self, id: &str, transition: F) -> Result<FocusSession, StorageError>
    where
        F: Fn(&mut FocusSession) -> Result<(), DomainError> + Clone + Send + Sync + 'static,
    {
        let row_id = parse_id(ENTITY, id)?;
        let transition = &transition;

        let session = execute_with_retry(self.store.as_ref(), &self.retry, move || {
            let transition = transition.clone();
            self.store.transaction(move |tx| {
                Box::pin(async move {
                    let mut session = lock_session(tx, row_id).await?;
                    let known = session.interruptions.len();
                    transition(&mut session)?;
                    write_session(tx, row_id, &session, known).await?;
                    Ok::<_, StorageError>(session)
                })
            })
        })
        .await?;

        self.track(&session).await;
        debug!("Focus session {} is now {}", id, session.status);
        Ok(session)
    }

    async fn track(&self, session: &FocusSession) {
        let mut current = self.current.lock().await;
        if session.status.is_current() {
            *current = Some(session.clone());
        } else if current.as_ref().and_then(|c| c.id.as_ref()) == session.id.as_ref() {
            *current = None;
        }
    }

    /// Sessions matching `condition` in the given order, with interruptions
    async fn load_sessions(
        &self,
        condition: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<FocusSession>, StorageError> {
        let sql = format!("{} WHERE {}", SELECT_SESSIONS, condition);
        let rows = self.store.query(&sql, params).await?;
        let mut sessions = rows
            .iter()
            .map(session_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if sessions.is_empty() {
            return Ok(sessions);
        }

        let ids = row_ids(&sessions);
        let interruptions = self.store.query(SELECT_INTERRUPTIONS, &[&ids]).await?;
        attach_interruptions(&mut sessions, &interruptions)?;
        Ok(sessions)
    }

    pub async fn get_session_by_id(&self, id: &str) -> Result<Option<FocusSession>, StorageError> {
        let Ok(row_id) = parse_id(ENTITY, id) else {
            return Ok(None);
        };
        let mut found = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.load_sessions("id = $1", &[&row_id]).await
        })
        .await?;
        Ok(found.pop())
    }

    /// The most recently started sessions
    pub async fn get_recent_sessions(&self, limit: usize) -> Result<Vec<FocusSession>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.load_sessions("TRUE ORDER BY start_time DESC LIMIT $1", &[&limit])
                .await
        })
        .await
    }

    /// Sessions dated between two days, both inclusive, newest first
    pub async fn get_sessions_by_date_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<FocusSession>, StorageError> {
        execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.load_sessions(
                "date BETWEEN $1 AND $2 ORDER BY start_time DESC",
                &[&start, &end],
            )
            .await
        })
        .await
    }

    /// Completed-session totals per type for today
    pub async fn get_todays_stats(&self) -> Result<Vec<SessionTypeStats>, StorageError> {
        let day = today();
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .query(
                    "SELECT type,
                            COUNT(*) AS total_sessions,
                            COALESCE(SUM(actual_duration), 0)::BIGINT AS total_duration
                     FROM focus_sessions
                     WHERE date = $1 AND status = 'completed'
                     GROUP BY type",
                    &[&day],
                )
                .await
        })
        .await?;

        let mut stats = Vec::with_capacity(rows.len());
        for row in &rows {
            let session_type: String = row.try_get("type")?;
            let total_sessions = row.try_get::<_, i64>("total_sessions")?.max(0) as u64;
            let total_duration: i64 = row.try_get("total_duration")?;
            stats.push(SessionTypeStats {
                session_type: SessionType::from_ui(&session_type),
                total_sessions,
                total_duration,
                avg_duration: if total_sessions > 0 {
                    total_duration as f64 / total_sessions as f64
                } else {
                    0.0
                },
            });
        }
        stats.sort_by_key(|s| s.session_type);
        Ok(stats)
    }

    /// Completed-session totals per day and type over the last seven days
    pub async fn get_weekly_stats(&self) -> Result<Vec<DailySessionStats>, StorageError> {
        let since = today() - Duration::days(7);
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .query(
                    "SELECT date, type,
                            COUNT(*) AS total_sessions,
                            COALESCE(SUM(actual_duration), 0)::BIGINT AS total_duration
                     FROM focus_sessions
                     WHERE date >= $1 AND status = 'completed'
                     GROUP BY date, type",
                    &[&since],
                )
                .await
        })
        .await?;

        let mut stats = Vec::with_capacity(rows.len());
        for row in &rows {
            let session_type: String = row.try_get("type")?;
            stats.push(DailySessionStats {
                key: DailySessionKey {
                    date: row.try_get("date")?,
                    session_type: SessionType::from_ui(&session_type),
                },
                total_sessions: row.try_get::<_, i64>("total_sessions")?.max(0) as u64,
                total_duration: row.try_get("total_duration")?,
            });
        }
        stats.sort_by(|a, b| {
            a.key
                .date
                .cmp(&b.key.date)
                .then_with(|| a.key.session_type.cmp(&b.key.session_type))
        });
        Ok(stats)
    }

    /// Restore the most recently started active or paused session
    pub async fn load_current_session(&self) -> Option<FocusSession> {
        let found = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.load_sessions(
                "status IN ('active', 'paused') ORDER BY start_time DESC LIMIT 1",
                &[],
            )
            .await
        })
        .await;

        let session = match found {
            Ok(mut found) => found.pop(),
            Err(e) => {
                warn!("Could not load current focus session: {}", e);
                None
            }
        };

        if let Some(session) = &session {
            info!(
                "Restored {} focus session {}",
                session.status,
                session.id.as_deref().unwrap_or_default()
            );
        }
        *self.current.lock().await = session.clone();
        session
    }
}
