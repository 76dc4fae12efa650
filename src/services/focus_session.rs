/// Focus session lifecycle over a local backend
///
/// The service remembers the session that is currently running. Starting a
/// new session cancels that one first, so at most one session is current at
/// a time.
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::domain::{
    format_day, today, DailySessionKey, DailySessionStats, DomainError, FocusSession,
    Interruption, NewSession, SessionStatus, SessionType, SessionTypeStats, DAY_FORMAT,
};
use crate::services::{int_field, stored_id, text_field, within_days};
use crate::storage::{
    execute_with_retry, from_document, to_document, Collection, CollectionStore, Document, Filter,
    FindOptions, GroupSpec, SortOrder, StorageError, Update,
};

const COLLECTION: Collection = Collection::FocusSessions;

fn not_found(id: &str) -> StorageError {
    StorageError::NotFound {
        entity: "Focus session",
        id: id.to_string(),
    }
}

fn sessions(documents: Vec<Document>) -> Result<Vec<FocusSession>, StorageError> {
    documents.into_iter().map(from_document).collect()
}

fn newest_first() -> FindOptions {
    FindOptions::new().sort_by("startTime", SortOrder::Descending)
}

fn session_type(group: &Document) -> Result<SessionType, StorageError> {
    Ok(serde_json::from_value(
        group.get("type").cloned().unwrap_or(Value::Null),
    )?)
}

/// Service for starting, pausing and ending focus sessions
pub struct FocusSessionService {
    store: Arc<dyn CollectionStore>,
    retry: RetryPolicy,
    current: Mutex<Option<FocusSession>>,
}

impl FocusSessionService {
    pub fn new(store: Arc<dyn CollectionStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            current: Mutex::new(None),
        }
    }

    /// The session currently running, as last seen by this service
    pub async fn current_session(&self) -> Option<FocusSession> {
        self.current.lock().await.clone()
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

        let session = FocusSession::start(request, Utc::now())?;
        let document = to_document(&session)?;
        let document = &document;
        let stored = execute_with_retry(self.store.as_ref(), &self.retry, move || {
            self.store.insert(COLLECTION, document.clone())
        })
        .await?;

        let mut session = session;
        session.id = Some(stored_id(COLLECTION, &stored)?);
        *self.current.lock().await = Some(session.clone());

        info!(
            "Started {} session {} ({}ms planned)",
            session.session_type,
            session.id.as_deref().unwrap_or_default(),
            session.planned_duration
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
    ///
    /// Without `actual_duration` the time since the session started is used.
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

    /// Load a session, apply a transition and write the changed session back
    async fn modify<F>(&self, id: &str, transition: F) -> Result<FocusSession, StorageError>
    where
        F: Fn(&mut FocusSession) -> Result<(), DomainError> + Send + Sync,
    {
        let filter = Filter::by_id(id);
        let (filter, transition) = (&filter, &transition);

        let session = execute_with_retry(self.store.as_ref(), &self.retry, move || async move {
            let document = self
                .store
                .find_one(COLLECTION, filter)
                .await?
                .ok_or_else(|| not_found(id))?;
            let mut session: FocusSession = from_document(document)?;

            transition(&mut session)?;

            let update = Update::from_document(to_document(&session)?);
            self.store.update(COLLECTION, filter, &update, false).await?;
            Ok(session)
        })
        .await?;

        self.track(&session).await;
        debug!("Focus session {} is now {}", id, session.status);
        Ok(session)
    }

    /// Keep the remembered current session in step with a written session
    async fn track(&self, session: &FocusSession) {
        let mut current = self.current.lock().await;
        if session.status.is_current() {
            *current = Some(session.clone());
        } else if current.as_ref().and_then(|c| c.id.as_ref()) == session.id.as_ref() {
            *current = None;
        }
    }

    pub async fn get_session_by_id(&self, id: &str) -> Result<Option<FocusSession>, StorageError> {
        let filter = Filter::by_id(id);
        let found = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.find_one(COLLECTION, &filter)
        })
        .await?;
        found.map(from_document).transpose()
    }

    /// The most recently started sessions
    pub async fn get_recent_sessions(&self, limit: usize) -> Result<Vec<FocusSession>, StorageError> {
        let options = newest_first().limit(limit);
        let filter = Filter::new();
        let found = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.find(COLLECTION, &filter, &options)
        })
        .await?;
        sessions(found)
    }

    /// Sessions dated between two days, both inclusive, newest first
    pub async fn get_sessions_by_date_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<FocusSession>, StorageError> {
        let filter = within_days(Filter::new(), "date", Some(start), Some(end));
        let options = newest_first();
        let found = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.find(COLLECTION, &filter, &options)
        })
        .await?;
        sessions(found)
    }

    /// Completed-session totals per type for today
    pub async fn get_todays_stats(&self) -> Result<Vec<SessionTypeStats>, StorageError> {
        let spec = GroupSpec::new(&["type"])
            .filter(
                Filter::new()
                    .eq("date", format_day(&today()))
                    .eq("status", SessionStatus::Completed.as_str()),
            )
            .count("totalSessions")
            .sum("totalDuration", "actualDuration");

        let groups = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.aggregate(COLLECTION, &spec)
        })
        .await?;

        let mut stats = groups
            .iter()
            .map(|group| {
                let total_sessions = int_field(group, "totalSessions") as u64;
                let total_duration = int_field(group, "totalDuration");
                Ok(SessionTypeStats {
                    session_type: session_type(group)?,
                    total_sessions,
                    total_duration,
                    avg_duration: if total_sessions > 0 {
                        total_duration as f64 / total_sessions as f64
                    } else {
                        0.0
                    },
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;
        stats.sort_by_key(|s| s.session_type);
        Ok(stats)
    }

    /// Completed-session totals per day and type over the last seven days
    pub async fn get_weekly_stats(&self) -> Result<Vec<DailySessionStats>, StorageError> {
        let since = today() - Duration::days(7);
        let spec = GroupSpec::new(&["date", "type"])
            .filter(
                Filter::new()
                    .gte("date", format_day(&since))
                    .eq("status", SessionStatus::Completed.as_str()),
            )
            .count("totalSessions")
            .sum("totalDuration", "actualDuration");

        let groups = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.aggregate(COLLECTION, &spec)
        })
        .await?;

        let mut stats = Vec::with_capacity(groups.len());
        for group in &groups {
            let day = text_field(group, "date");
            let date = NaiveDate::parse_from_str(&day, DAY_FORMAT)
                .map_err(|_| DomainError::InvalidDate(day.clone()))?;
            stats.push(DailySessionStats {
                key: DailySessionKey {
                    date,
                    session_type: session_type(group)?,
                },
                total_sessions: int_field(group, "totalSessions") as u64,
                total_duration: int_field(group, "totalDuration"),
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

    /// Restore the current session from storage
    ///
    /// Picks the most recently started active or paused session. Failures are
    /// logged and leave no current session.
    pub async fn load_current_session(&self) -> Option<FocusSession> {
        let filter = Filter::new().is_in(
            "status",
            [SessionStatus::Active.as_str(), SessionStatus::Paused.as_str()],
        );
        let options = newest_first().limit(1);

        let found = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.find(COLLECTION, &filter, &options)
        })
        .await
        .and_then(sessions);

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
