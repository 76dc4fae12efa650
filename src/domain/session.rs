/// Focus sessions and their lifecycle
///
/// A session moves `active -> paused -> active` any number of times and ends
/// in `completed` or `cancelled`. The transition rules live on
/// [`FocusSession`] itself so every service variant enforces the same ones.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::types::{day, instant};
use crate::domain::DomainError;

/// Kind of timer a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionType {
    Focus,
    ShortBreak,
    LongBreak,
}

impl SessionType {
    /// Map a session type as the UI names it onto the stored type
    ///
    /// Unknown names fall back to a focus session.
    pub fn from_ui(name: &str) -> Self {
        match name {
            "short-break" | "shortBreak" => SessionType::ShortBreak,
            "long-break" | "longBreak" => SessionType::LongBreak,
            "pomodoro" | "focus" => SessionType::Focus,
            other => {
                tracing::debug!("Unknown session type '{}', defaulting to focus", other);
                SessionType::Focus
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Focus => "focus",
            SessionType::ShortBreak => "shortBreak",
            SessionType::LongBreak => "longBreak",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl SessionStatus {
    /// Active and paused sessions are "current"
    pub fn is_current(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            _ => Err(DomainError::InvalidSessionStatus(s.to_string())),
        }
    }
}

/// Something that pulled the user away during a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interruption {
    #[serde(with = "instant")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub app_name: Option<String>,
}

impl Interruption {
    pub fn new(timestamp: DateTime<Utc>, reason: Option<String>, app_name: Option<String>) -> Self {
        Self {
            timestamp,
            reason,
            app_name,
        }
    }
}

/// Request to start a session
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub session_type: SessionType,
    /// Planned length in milliseconds
    pub planned_duration: i64,
    /// Defaults to now
    pub start_time: Option<DateTime<Utc>>,
}

impl NewSession {
    pub fn new(session_type: SessionType, planned_duration: i64) -> Self {
        Self {
            session_type,
            planned_duration,
            start_time: None,
        }
    }

    /// Build a request from the UI's type names (`pomodoro`, `short-break`, ...)
    pub fn from_ui(session_type: &str, planned_duration: i64) -> Self {
        Self::new(SessionType::from_ui(session_type), planned_duration)
    }

    pub fn starting_at(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }
}

/// A stored focus session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusSession {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    #[serde(with = "instant")]
    pub start_time: DateTime<Utc>,
    pub planned_duration: i64,
    pub status: SessionStatus,
    #[serde(with = "day")]
    pub date: NaiveDate,
    #[serde(default)]
    pub interruptions: Vec<Interruption>,
    #[serde(default)]
    pub actual_duration: Option<i64>,
    #[serde(default, with = "instant::option")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub productivity: Option<u8>,
    #[serde(default, with = "instant::option")]
    pub paused_at: Option<DateTime<Utc>>,
    /// Milliseconds spent paused so far
    #[serde(default)]
    pub paused_duration: i64,
}

impl FocusSession {
    /// Create a fresh active session
    pub fn start(request: NewSession, now: DateTime<Utc>) -> Result<Self, DomainError> {
        if request.planned_duration < 0 {
            return Err(DomainError::validation("Planned duration cannot be negative"));
        }

        let start_time = request.start_time.unwrap_or(now);
        Ok(Self {
            id: None,
            session_type: request.session_type,
            start_time,
            planned_duration: request.planned_duration,
            status: SessionStatus::Active,
            date: start_time.date_naive(),
            interruptions: Vec::new(),
            actual_duration: None,
            end_time: None,
            notes: None,
            productivity: None,
            paused_at: None,
            paused_duration: 0,
        })
    }

    /// active -> paused
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status != SessionStatus::Active {
            return Err(DomainError::InvalidTransition {
                action: "pause",
                status: self.status,
            });
        }
        self.status = SessionStatus::Paused;
        self.paused_at = Some(now);
        Ok(())
    }

    /// paused -> active
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status != SessionStatus::Paused {
            return Err(DomainError::InvalidTransition {
                action: "resume",
                status: self.status,
            });
        }
        self.settle_pause(now);
        self.status = SessionStatus::Active;
        Ok(())
    }

    /// active|paused -> completed|cancelled
    ///
    /// Without an explicit duration the wall-clock time since start is used.
    pub fn end(
        &mut self,
        status: SessionStatus,
        actual_duration: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !status.is_terminal() {
            return Err(DomainError::InvalidSessionStatus(status.to_string()));
        }
        if !self.status.is_current() {
            return Err(DomainError::InvalidTransition {
                action: "end",
                status: self.status,
            });
        }

        self.settle_pause(now);
        let elapsed = (now - self.start_time).num_milliseconds().max(0);
        self.status = status;
        self.end_time = Some(now);
        self.actual_duration = Some(actual_duration.unwrap_or(elapsed));
        Ok(())
    }

    /// Record an interruption; only current sessions accept them
    pub fn add_interruption(&mut self, interruption: Interruption) -> Result<(), DomainError> {
        if !self.status.is_current() {
            return Err(DomainError::InvalidTransition {
                action: "interrupt",
                status: self.status,
            });
        }
        self.interruptions.push(interruption);
        Ok(())
    }

    /// Set the 1-5 productivity rating and optionally replace the notes
    pub fn rate(&mut self, productivity: u8, notes: Option<String>) -> Result<(), DomainError> {
        validate_productivity(productivity)?;
        self.productivity = Some(productivity);
        if let Some(notes) = notes.filter(|n| !n.is_empty()) {
            self.notes = Some(notes);
        }
        Ok(())
    }

    fn settle_pause(&mut self, now: DateTime<Utc>) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_duration += (now - paused_at).num_milliseconds().max(0);
        }
    }
}

/// Ratings run from 1 to 5
pub fn validate_productivity(productivity: u8) -> Result<(), DomainError> {
    if (1..=5).contains(&productivity) {
        Ok(())
    } else {
        Err(DomainError::validation(format!(
            "Productivity must be between 1 and 5, got {}",
            productivity
        )))
    }
}

/// Completed-session totals for one session type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTypeStats {
    #[serde(rename = "_id")]
    pub session_type: SessionType,
    pub total_sessions: u64,
    pub total_duration: i64,
    pub avg_duration: f64,
}

/// Grouping key for daily session totals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySessionKey {
    #[serde(with = "day")]
    pub date: NaiveDate,
    #[serde(rename = "type")]
    pub session_type: SessionType,
}

/// Completed-session totals for one type on one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySessionStats {
    #[serde(rename = "_id")]
    pub key: DailySessionKey,
    pub total_sessions: u64,
    pub total_duration: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn started(now: DateTime<Utc>) -> FocusSession {
        FocusSession::start(NewSession::new(SessionType::Focus, 25 * 60 * 1000), now).unwrap()
    }

    #[test]
    fn test_ui_type_aliases() {
        assert_eq!(SessionType::from_ui("pomodoro"), SessionType::Focus);
        assert_eq!(SessionType::from_ui("short-break"), SessionType::ShortBreak);
        assert_eq!(SessionType::from_ui("long-break"), SessionType::LongBreak);
        assert_eq!(SessionType::from_ui("whatever"), SessionType::Focus);
    }

    #[test]
    fn test_pause_resume_end() {
        let now = Utc::now();
        let mut session = started(now);

        session.pause(now + Duration::seconds(60)).unwrap();
        assert_eq!(session.status, SessionStatus::Paused);
        assert!(session.paused_at.is_some());

        session.resume(now + Duration::seconds(90)).unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.paused_duration, 30_000);
        assert!(session.paused_at.is_none());

        session
            .end(SessionStatus::Completed, None, now + Duration::seconds(300))
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.actual_duration, Some(300_000));
    }

    #[test]
    fn test_illegal_transitions() {
        let now = Utc::now();
        let mut session = started(now);

        assert!(matches!(
            session.resume(now),
            Err(DomainError::InvalidTransition { action: "resume", .. })
        ));

        session.end(SessionStatus::Cancelled, Some(10), now).unwrap();
        assert_eq!(session.actual_duration, Some(10));
        assert!(session.pause(now).is_err());
        assert!(session.end(SessionStatus::Completed, None, now).is_err());
        assert!(session
            .add_interruption(Interruption::new(now, None, None))
            .is_err());

        // Rating is still allowed after the session ended
        session.rate(4, Some("good".to_string())).unwrap();
        assert_eq!(session.productivity, Some(4));
    }

    #[test]
    fn test_end_requires_terminal_status() {
        let now = Utc::now();
        let mut session = started(now);
        assert!(session.end(SessionStatus::Paused, None, now).is_err());
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn test_rating_range() {
        let mut session = started(Utc::now());
        assert!(session.rate(0, None).is_err());
        assert!(session.rate(6, None).is_err());
        assert!(session.rate(5, None).is_ok());
    }

    #[test]
    fn test_session_document_shape() {
        let now = DateTime::parse_from_rfc3339("2024-07-03T09:15:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let session = FocusSession::start(NewSession::from_ui("short-break", 300_000), now).unwrap();
        let value = serde_json::to_value(&session).unwrap();

        assert_eq!(value["type"], "shortBreak");
        assert_eq!(value["status"], "active");
        assert_eq!(value["date"], "2024-07-03");
        assert_eq!(value["startTime"], "2024-07-03T09:15:00.000Z");
        assert_eq!(value["endTime"], serde_json::Value::Null);

        let parsed: FocusSession = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, session);
    }
}
