/// App usage records and the shapes they are reported in
///
/// An [`AppUsageRecord`] is one (date, app, hour) bucket of tracked time.
/// Records without an hour are daily aggregates and never share a key with
/// hourly records of the same app.
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::types::{day, instant};
use crate::domain::DomainError;

/// Category assigned to apps nobody categorized
pub const DEFAULT_APP_CATEGORY: &str = "Miscellaneous";

fn default_category() -> String {
    DEFAULT_APP_CATEGORY.to_string()
}

/// A single observed stretch of foreground time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTimestamp {
    #[serde(with = "instant")]
    pub start: DateTime<Utc>,
    /// Duration in milliseconds
    #[serde(default)]
    pub duration: u64,
}

impl UsageTimestamp {
    pub fn new(start: DateTime<Utc>, duration: u64) -> Self {
        Self { start, duration }
    }
}

/// Stored app usage bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppUsageRecord {
    /// Backend-assigned identifier, absent until the record is stored
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(with = "day")]
    pub date: NaiveDate,
    /// Hour of day (0-23); `None` marks a daily aggregate
    #[serde(default)]
    pub hour: Option<u8>,
    pub app_name: String,
    /// Accumulated milliseconds, never negative
    #[serde(default)]
    pub time_spent: i64,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub timestamps: Vec<UsageTimestamp>,
}

impl AppUsageRecord {
    /// Total duration covered by the attached timestamps
    pub fn timestamp_total(&self) -> u64 {
        self.timestamps.iter().map(|t| t.duration).sum()
    }

    /// Key under which the record is reported for its day
    pub fn hour_key(&self) -> Option<String> {
        self.hour.map(hour_key)
    }
}

/// One observation handed to the live tracking path
///
/// The hour is kept as a wide integer so out-of-range values coming from
/// callers are reported instead of silently truncated.
#[derive(Debug, Clone, PartialEq)]
pub struct AppUsageInput {
    pub date: NaiveDate,
    pub hour: Option<i64>,
    pub app_name: String,
    pub time_spent: i64,
    pub category: String,
    pub description: Option<String>,
    pub domain: Option<String>,
    pub timestamps: Vec<UsageTimestamp>,
}

impl AppUsageInput {
    /// Create an input with no description, domain or timestamps
    pub fn new(
        date: NaiveDate,
        hour: Option<i64>,
        app_name: impl Into<String>,
        time_spent: i64,
        category: impl Into<String>,
    ) -> Self {
        Self {
            date,
            hour,
            app_name: app_name.into(),
            time_spent,
            category: category.into(),
            description: None,
            domain: None,
            timestamps: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: UsageTimestamp) -> Self {
        self.timestamps.push(timestamp);
        self
    }

    /// Validate the input and turn it into a record ready for insertion
    ///
    /// Negative time is clamped to zero; an empty app name or an hour outside
    /// 0-23 is rejected.
    pub fn into_record(self) -> Result<AppUsageRecord, DomainError> {
        let app_name = self.app_name.trim().to_string();
        if app_name.is_empty() {
            return Err(DomainError::validation("App name cannot be empty"));
        }

        let hour = match self.hour {
            Some(h) if (0..=23).contains(&h) => Some(h as u8),
            Some(h) => return Err(DomainError::InvalidHour(h)),
            None => None,
        };

        let category = if self.category.trim().is_empty() {
            default_category()
        } else {
            self.category
        };

        Ok(AppUsageRecord {
            id: None,
            date: self.date,
            hour,
            app_name,
            time_spent: self.time_spent.max(0),
            category,
            description: self.description,
            domain: self.domain,
            timestamps: self.timestamps,
        })
    }
}

/// Per-app payload inside a day report or snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppUsageEntry {
    #[serde(default)]
    pub time: i64,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub timestamps: Vec<UsageTimestamp>,
}

impl From<&AppUsageRecord> for AppUsageEntry {
    fn from(record: &AppUsageRecord) -> Self {
        Self {
            time: record.time_spent,
            category: record.category.clone(),
            description: record.description.clone(),
            domain: record.domain.clone(),
            timestamps: record.timestamps.clone(),
        }
    }
}

impl AppUsageEntry {
    /// Build the stored record this entry describes
    pub fn to_record(&self, date: NaiveDate, hour: Option<u8>, app_name: &str) -> AppUsageRecord {
        AppUsageRecord {
            id: None,
            date,
            hour,
            app_name: app_name.to_string(),
            time_spent: self.time.max(0),
            category: self.category.clone(),
            description: self.description.clone(),
            domain: self.domain.clone(),
            timestamps: self.timestamps.clone(),
        }
    }
}

/// Usage for one day: daily aggregates under `apps`, hourly buckets under
/// `"HH:00"` keys
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DayUsage {
    #[serde(default)]
    pub apps: BTreeMap<String, AppUsageEntry>,
    #[serde(flatten)]
    pub hours: BTreeMap<String, BTreeMap<String, AppUsageEntry>>,
}

impl DayUsage {
    /// File a record under its hour key, or under `apps` for daily records
    pub fn insert_record(&mut self, record: &AppUsageRecord) {
        let entry = AppUsageEntry::from(record);
        match record.hour_key() {
            Some(key) => {
                self.hours
                    .entry(key)
                    .or_default()
                    .insert(record.app_name.clone(), entry);
            }
            None => {
                self.apps.insert(record.app_name.clone(), entry);
            }
        }
    }

    /// Flatten back into records for the given day
    ///
    /// Keys that are not `HH:00` hour keys are ignored.
    pub fn to_records(&self, date: NaiveDate) -> Vec<AppUsageRecord> {
        let mut records: Vec<AppUsageRecord> = self
            .apps
            .iter()
            .map(|(app, entry)| entry.to_record(date, None, app))
            .collect();

        for (key, apps) in &self.hours {
            let Some(hour) = parse_hour_key(key) else {
                tracing::debug!("Ignoring non-hour key in day usage: {}", key);
                continue;
            };
            records.extend(
                apps.iter()
                    .map(|(app, entry)| entry.to_record(date, Some(hour), app)),
            );
        }

        records
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.hours.is_empty()
    }
}

/// Usage snapshot keyed by `YYYY-MM-DD`, the legacy `data.json` layout
pub type UsageSnapshot = BTreeMap<String, DayUsage>;

/// Flatten a snapshot into the records it describes
///
/// Day keys must be `YYYY-MM-DD`.
pub fn snapshot_records(snapshot: &UsageSnapshot) -> Result<Vec<AppUsageRecord>, DomainError> {
    let mut records = Vec::new();
    for (day, usage) in snapshot {
        let date = NaiveDate::parse_from_str(day, crate::domain::DAY_FORMAT)
            .map_err(|_| DomainError::InvalidDate(day.clone()))?;
        records.extend(usage.to_records(date));
    }
    Ok(records)
}

/// Format an hour as its report key (`7` -> `"07:00"`)
pub fn hour_key(hour: u8) -> String {
    format!("{:02}:00", hour)
}

/// Parse a `HH:MM` report key back into an hour
pub fn parse_hour_key(key: &str) -> Option<u8> {
    let (hh, mm) = key.split_once(':')?;
    if hh.len() != 2 || mm.len() != 2 || !mm.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    hh.parse::<u8>().ok().filter(|h| *h <= 23)
}

/// Usage totals for one category over a date range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryUsageStat {
    pub category: String,
    pub total_time: i64,
    pub app_count: u64,
    pub session_count: u64,
}

/// Usage totals for one app and category over a date range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopApp {
    pub app_name: String,
    pub category: String,
    pub total_time: i64,
    pub session_count: u64,
}

/// Usage totals for one category on a single day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyCategoryStat {
    pub category: String,
    pub total_time: i64,
    pub app_count: u64,
}

/// Breakdown of one hour of a day
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourSummary {
    pub total_time: i64,
    pub apps: BTreeMap<String, i64>,
    pub categories: BTreeMap<String, i64>,
}

/// Time spent in one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryTime {
    pub category: String,
    pub time: i64,
}

/// Category totals for one day of a productivity trend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductivityTrendDay {
    #[serde(rename = "_id", with = "day")]
    pub date: NaiveDate,
    pub categories: Vec<CategoryTime>,
}
