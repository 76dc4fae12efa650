/// App usage tracking against PostgreSQL
///
/// Buckets are keyed by `(date, app_name, COALESCE(hour, -1))`, so upserts
/// resolve conflicts on that unique index. Timestamps live in their own
/// table and are attached when records are read.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use deadpool_postgres::Transaction;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::{debug, info};

use crate::config::RetryPolicy;
use crate::domain::{
    format_day, snapshot_records, today, AppUsageInput, AppUsageRecord, CategoryTime,
    CategoryUsageStat, DailyCategoryStat, DayUsage, HourSummary, ProductivityTrendDay, TopApp,
    UsageSnapshot, UsageTimestamp,
};
use crate::services::remote::{hour_from_column, hour_param, millis};
use crate::storage::{execute_with_retry, PostgresStore, StorageError};

const SELECT_RECORDS: &str = "SELECT id, date, hour, app_name, time_spent, category, description, domain
     FROM app_usage";

const ADD_TO_BUCKET: &str = "INSERT INTO app_usage
         (date, hour, app_name, time_spent, category, description, domain)
     VALUES ($1, $2, $3, $4, $5, $6, $7)
     ON CONFLICT (date, app_name, COALESCE(hour, -1)) DO UPDATE SET
         time_spent = app_usage.time_spent + EXCLUDED.time_spent,
         category = EXCLUDED.category,
         description = EXCLUDED.description,
         domain = EXCLUDED.domain,
         updated_at = NOW()
     RETURNING id";

const REPLACE_BUCKET: &str = "INSERT INTO app_usage
         (date, hour, app_name, time_spent, category, description, domain)
     VALUES ($1, $2, $3, $4, $5, $6, $7)
     ON CONFLICT (date, app_name, COALESCE(hour, -1)) DO UPDATE SET
         time_spent = EXCLUDED.time_spent,
         category = EXCLUDED.category,
         description = EXCLUDED.description,
         domain = EXCLUDED.domain,
         updated_at = NOW()
     RETURNING id";

fn record_from_row(row: &Row) -> Result<AppUsageRecord, StorageError> {
    let id: i64 = row.try_get("id")?;
    Ok(AppUsageRecord {
        id: Some(id.to_string()),
        date: row.try_get("date")?,
        hour: hour_from_column(row.try_get("hour")?)?,
        app_name: row.try_get("app_name")?,
        time_spent: row.try_get("time_spent")?,
        category: row.try_get("category")?,
        description: row.try_get("description")?,
        domain: row.try_get("domain")?,
        timestamps: Vec::new(),
    })
}

async fn upsert_bucket(
    tx: &Transaction<'_>,
    statement: &str,
    record: &AppUsageRecord,
) -> Result<i64, StorageError> {
    let row = tx
        .query_one(
            statement,
            &[
                &record.date,
                &hour_param(record.hour),
                &record.app_name,
                &record.time_spent,
                &record.category,
                &record.description,
                &record.domain,
            ],
        )
        .await?;
    Ok(row.try_get(0)?)
}

async fn insert_timestamps(
    tx: &Transaction<'_>,
    app_usage_id: i64,
    timestamps: &[UsageTimestamp],
) -> Result<(), StorageError> {
    for timestamp in timestamps {
        tx.execute(
            "INSERT INTO timestamps (app_usage_id, start_time, duration) VALUES ($1, $2, $3)",
            &[&app_usage_id, &timestamp.start, &millis(timestamp.duration)],
        )
        .await?;
    }
    Ok(())
}

async fn add_to_bucket(tx: &Transaction<'_>, record: &AppUsageRecord) -> Result<i64, StorageError> {
    let id = upsert_bucket(tx, ADD_TO_BUCKET, record).await?;
    insert_timestamps(tx, id, &record.timestamps).await?;
    Ok(id)
}

/// Service for recording and reporting application usage in PostgreSQL
pub struct RemoteAppUsageService {
    store: Arc<PostgresStore>,
    retry: RetryPolicy,
}

impl RemoteAppUsageService {
    pub fn new(store: Arc<PostgresStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Add observed time to its bucket, creating the bucket when needed
    pub async fn save_app_usage(&self, input: AppUsageInput) -> Result<String, StorageError> {
        let record = input.into_record()?;
        let record = &record;
        let id = execute_with_retry(self.store.as_ref(), &self.retry, move || {
            let record = record.clone();
            self.store
                .transaction(move |tx| Box::pin(async move { add_to_bucket(tx, &record).await }))
        })
        .await?;

        debug!("Saved {}ms of {} into bucket {}", record.time_spent, record.app_name, id);
        Ok(id.to_string())
    }

    /// Write a record inside a caller's transaction, replacing the bucket's
    /// time, description and timestamps
    pub async fn save_app_usage_in_transaction(
        tx: &Transaction<'_>,
        record: &AppUsageRecord,
    ) -> Result<i64, StorageError> {
        let id = upsert_bucket(tx, REPLACE_BUCKET, record).await?;
        tx.execute("DELETE FROM timestamps WHERE app_usage_id = $1", &[&id])
            .await?;
        insert_timestamps(tx, id, &record.timestamps).await?;
        Ok(id)
    }

    /// Write a usage snapshot in one transaction, replacing the buckets it names
    pub async fn import_usage_snapshot(&self, snapshot: &UsageSnapshot) -> Result<usize, StorageError> {
        let records = snapshot_records(snapshot)?;
        let records = &records;

        let written = execute_with_retry(self.store.as_ref(), &self.retry, move || {
            let records = records.clone();
            self.store.transaction(move |tx| {
                Box::pin(async move {
                    for record in &records {
                        Self::save_app_usage_in_transaction(tx, record).await?;
                    }
                    Ok::<_, StorageError>(records.len())
                })
            })
        })
        .await?;

        info!("Imported {} usage buckets from {} days", written, snapshot.len());
        Ok(written)
    }

    /// Records matching `condition`, newest first, with their timestamps
    async fn load_records(
        &self,
        condition: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<AppUsageRecord>, StorageError> {
        let sql = format!(
            "{} WHERE {} ORDER BY date DESC, hour DESC NULLS LAST, id",
            SELECT_RECORDS, condition
        );
        let rows = self.store.query(&sql, params).await?;
        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if records.is_empty() {
            return Ok(records);
        }

        let ids: Vec<i64> = records
            .iter()
            .filter_map(|r| r.id.as_deref().and_then(|id| id.parse().ok()))
            .collect();
        let stamp_rows = self
            .store
            .query(
                "SELECT app_usage_id, start_time, duration FROM timestamps
                 WHERE app_usage_id = ANY($1) ORDER BY id",
                &[&ids],
            )
            .await?;

        let mut stamps: HashMap<String, Vec<UsageTimestamp>> = HashMap::new();
        for row in &stamp_rows {
            let owner: i64 = row.try_get(0)?;
            let start: DateTime<Utc> = row.try_get(1)?;
            let duration: i64 = row.try_get(2)?;
            stamps
                .entry(owner.to_string())
                .or_default()
                .push(UsageTimestamp::new(start, duration.max(0) as u64));
        }

        for record in &mut records {
            if let Some(found) = record.id.as_ref().and_then(|id| stamps.remove(id)) {
                record.timestamps = found;
            }
        }
        Ok(records)
    }

    /// All usage between the given days, keyed by `YYYY-MM-DD`
    pub async fn get_app_usage_data(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<BTreeMap<String, DayUsage>, StorageError> {
        let found = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.load_records(
                "($1::date IS NULL OR date >= $1) AND ($2::date IS NULL OR date <= $2)",
                &[&start, &end],
            )
            .await
        })
        .await?;

        let mut data: BTreeMap<String, DayUsage> = BTreeMap::new();
        for record in &found {
            data.entry(format_day(&record.date))
                .or_default()
                .insert_record(record);
        }
        Ok(data)
    }

    /// Usage for a single day
    pub async fn get_app_usage_for_date(&self, date: NaiveDate) -> Result<DayUsage, StorageError> {
        let found = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.load_records("date = $1", &[&date]).await
        })
        .await?;

        let mut usage = DayUsage::default();
        for record in &found {
            usage.insert_record(record);
        }
        Ok(usage)
    }

    /// Delete a day's usage, narrowed to one app (and one hour of it)
    pub async fn delete_app_usage_data(
        &self,
        date: NaiveDate,
        app_name: Option<&str>,
        hour: Option<u8>,
    ) -> Result<u64, StorageError> {
        // The hour only narrows the deletion together with an app
        let hour = app_name.and(hour_param(hour));
        let removed = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .execute(
                    "DELETE FROM app_usage WHERE date = $1
                       AND ($2::text IS NULL OR app_name = $2)
                       AND ($3::smallint IS NULL OR hour = $3)",
                    &[&date, &app_name, &hour],
                )
                .await
        })
        .await?;

        info!("Deleted {} usage buckets for {}", removed, date);
        Ok(removed)
    }

    /// Per-category totals between two days, largest first
    pub async fn get_app_usage_stats(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CategoryUsageStat>, StorageError> {
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .query(
                    "SELECT category,
                            SUM(time_spent)::BIGINT AS total_time,
                            COUNT(DISTINCT app_name) AS app_count,
                            COUNT(*) AS session_count
                     FROM app_usage
                     WHERE date BETWEEN $1 AND $2
                     GROUP BY category
                     ORDER BY total_time DESC, category",
                    &[&start, &end],
                )
                .await
        })
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CategoryUsageStat {
                    category: row.try_get("category")?,
                    total_time: row.try_get("total_time")?,
                    app_count: row.try_get::<_, i64>("app_count")?.max(0) as u64,
                    session_count: row.try_get::<_, i64>("session_count")?.max(0) as u64,
                })
            })
            .collect()
    }

    /// Apps with the most time between two days
    pub async fn get_top_apps(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<TopApp>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .query(
                    "SELECT app_name, category,
                            SUM(time_spent)::BIGINT AS total_time,
                            COUNT(*) AS session_count
                     FROM app_usage
                     WHERE date BETWEEN $1 AND $2
                     GROUP BY app_name, category
                     ORDER BY total_time DESC, app_name
                     LIMIT $3",
                    &[&start, &end, &limit],
                )
                .await
        })
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TopApp {
                    app_name: row.try_get("app_name")?,
                    category: row.try_get("category")?,
                    total_time: row.try_get("total_time")?,
                    session_count: row.try_get::<_, i64>("session_count")?.max(0) as u64,
                })
            })
            .collect()
    }

    /// Per-category totals for one day
    pub async fn get_daily_stats(&self, date: NaiveDate) -> Result<Vec<DailyCategoryStat>, StorageError> {
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .query(
                    "SELECT category,
                            SUM(time_spent)::BIGINT AS total_time,
                            COUNT(DISTINCT app_name) AS app_count
                     FROM app_usage
                     WHERE date = $1
                     GROUP BY category
                     ORDER BY total_time DESC, category",
                    &[&date],
                )
                .await
        })
        .await?;

        rows.iter()
            .map(|row| {
                Ok(DailyCategoryStat {
                    category: row.try_get("category")?,
                    total_time: row.try_get("total_time")?,
                    app_count: row.try_get::<_, i64>("app_count")?.max(0) as u64,
                })
            })
            .collect()
    }

    /// Hour-by-hour totals for one day
    pub async fn get_hourly_breakdown(
        &self,
        date: NaiveDate,
    ) -> Result<BTreeMap<u8, HourSummary>, StorageError> {
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .query(
                    "SELECT hour, app_name, category, SUM(time_spent)::BIGINT AS time
                     FROM app_usage
                     WHERE date = $1 AND hour IS NOT NULL
                     GROUP BY hour, app_name, category",
                    &[&date],
                )
                .await
        })
        .await?;

        let mut breakdown: BTreeMap<u8, HourSummary> = BTreeMap::new();
        for row in &rows {
            let Some(hour) = hour_from_column(row.try_get("hour")?)? else {
                continue;
            };
            let app_name: String = row.try_get("app_name")?;
            let category: String = row.try_get("category")?;
            let time: i64 = row.try_get("time")?;

            let summary = breakdown.entry(hour).or_default();
            summary.total_time += time;
            *summary.apps.entry(app_name).or_default() += time;
            *summary.categories.entry(category).or_default() += time;
        }
        Ok(breakdown)
    }

    /// Recategorize every bucket of an app on one day
    pub async fn update_app_category(
        &self,
        app_name: &str,
        date: NaiveDate,
        category: &str,
    ) -> Result<u64, StorageError> {
        execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .execute(
                    "UPDATE app_usage SET category = $1, updated_at = NOW()
                     WHERE app_name = $2 AND date = $3",
                    &[&category, &app_name, &date],
                )
                .await
        })
        .await
    }

    /// Buckets of one category, newest first
    pub async fn get_app_usage_by_category(
        &self,
        category: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<AppUsageRecord>, StorageError> {
        execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.load_records(
                "category = $1
                 AND ($2::date IS NULL OR date >= $2)
                 AND ($3::date IS NULL OR date <= $3)",
                &[&category, &start, &end],
            )
            .await
        })
        .await
    }

    /// Daily per-category totals over the last `days` days, oldest first
    pub async fn get_productivity_trend(&self, days: u32) -> Result<Vec<ProductivityTrendDay>, StorageError> {
        let since = today() - Duration::days(i64::from(days));
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .query(
                    "SELECT date, category, SUM(time_spent)::BIGINT AS time
                     FROM app_usage
                     WHERE date >= $1
                     GROUP BY date, category
                     ORDER BY date, time DESC, category",
                    &[&since],
                )
                .await
        })
        .await?;

        let mut trend: BTreeMap<NaiveDate, Vec<CategoryTime>> = BTreeMap::new();
        for row in &rows {
            let date: NaiveDate = row.try_get("date")?;
            trend.entry(date).or_default().push(CategoryTime {
                category: row.try_get("category")?,
                time: row.try_get("time")?,
            });
        }
        Ok(trend
            .into_iter()
            .map(|(date, categories)| ProductivityTrendDay { date, categories })
            .collect())
    }

    /// Delete buckets older than `days_to_keep` days
    pub async fn cleanup_old_data(&self, days_to_keep: u32) -> Result<u64, StorageError> {
        let cutoff = today() - Duration::days(i64::from(days_to_keep));
        let removed = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .execute("DELETE FROM app_usage WHERE date < $1", &[&cutoff])
                .await
        })
        .await?;

        info!("Cleaned up {} usage buckets older than {}", removed, cutoff);
        Ok(removed)
    }
}
