/// App usage tracking over a local backend
///
/// Live tracking adds time to the (date, app, hour) bucket it belongs to.
/// Snapshot imports replace bucket contents instead. Reports come back in the
/// nested `{date: {"HH:00": {...}, apps: {...}}}` layout the UI consumes.
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::RetryPolicy;
use crate::domain::{
    format_day, snapshot_records, today, AppUsageInput, AppUsageRecord, CategoryTime,
    CategoryUsageStat, DailyCategoryStat, DayUsage, HourSummary, ProductivityTrendDay, TopApp,
    UsageSnapshot, DAY_FORMAT,
};
use crate::services::{int_field, stored_id, text_field, within_days};
use crate::storage::{
    execute_with_retry, from_document, to_document, BatchWrite, Collection, CollectionStore,
    Document, Filter, FindOptions, GroupSpec, SortOrder, StorageError, Update,
};

const COLLECTION: Collection = Collection::AppUsage;

/// Filter selecting the one bucket a record belongs to
///
/// Daily records match on an explicit null hour so they never collide with
/// an hourly bucket of the same app.
fn bucket_filter(date: &NaiveDate, hour: Option<u8>, app_name: &str) -> Filter {
    Filter::new()
        .eq("date", format_day(date))
        .eq("appName", app_name)
        .eq("hour", hour.map_or(Value::Null, Value::from))
}

/// Update writing the descriptive fields of a record
fn describe(record: &AppUsageRecord, time_spent: i64, timestamps: Value) -> Update {
    Update::new()
        .set("timeSpent", time_spent)
        .set("category", record.category.clone())
        .set("description", record.description.clone())
        .set("domain", record.domain.clone())
        .set("timestamps", timestamps)
}

fn records(documents: Vec<Document>) -> Result<Vec<AppUsageRecord>, StorageError> {
    documents.into_iter().map(from_document).collect()
}

/// Service for recording and reporting application usage
pub struct AppUsageService {
    store: Arc<dyn CollectionStore>,
    retry: RetryPolicy,
}

impl AppUsageService {
    pub fn new(store: Arc<dyn CollectionStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Add observed time to its bucket, creating the bucket when needed
    ///
    /// Time accumulates, timestamps are appended and the descriptive fields
    /// take the latest values. Returns the bucket's id.
    pub async fn save_app_usage(&self, input: AppUsageInput) -> Result<String, StorageError> {
        let record = input.into_record()?;
        let record = &record;
        execute_with_retry(self.store.as_ref(), &self.retry, move || self.add_to_bucket(record))
            .await
    }

    async fn add_to_bucket(&self, record: &AppUsageRecord) -> Result<String, StorageError> {
        let filter = bucket_filter(&record.date, record.hour, &record.app_name);

        match self.store.find_one(COLLECTION, &filter).await? {
            Some(document) => {
                let id = stored_id(COLLECTION, &document)?;
                let existing: AppUsageRecord = from_document(document)?;

                let mut timestamps = existing.timestamps;
                timestamps.extend(record.timestamps.iter().cloned());
                let time_spent = existing.time_spent + record.time_spent;

                let update = describe(record, time_spent, serde_json::to_value(&timestamps)?);
                self.store
                    .update(COLLECTION, &Filter::by_id(&id), &update, false)
                    .await?;

                debug!(
                    "Added {}ms to {} on {} (hour {:?}), now {}ms",
                    record.time_spent, record.app_name, record.date, record.hour, time_spent
                );
                Ok(id)
            }
            None => {
                let stored = self.store.insert(COLLECTION, to_document(record)?).await?;
                debug!(
                    "Created usage bucket for {} on {} (hour {:?})",
                    record.app_name, record.date, record.hour
                );
                stored_id(COLLECTION, &stored)
            }
        }
    }

    /// Write a usage snapshot, replacing the contents of every bucket it names
    ///
    /// Buckets not mentioned in the snapshot are left alone. Returns the
    /// number of buckets written.
    pub async fn import_usage_snapshot(&self, snapshot: &UsageSnapshot) -> Result<usize, StorageError> {
        let buckets = snapshot_records(snapshot)?;
        let buckets = &buckets;
        let written = execute_with_retry(self.store.as_ref(), &self.retry, move || {
            self.replace_buckets(buckets)
        })
        .await?;

        info!("Imported {} usage buckets from {} days", written, snapshot.len());
        Ok(written)
    }

    /// One batch for the whole snapshot, so a failed bucket leaves every
    /// other bucket as it was
    async fn replace_buckets(&self, buckets: &[AppUsageRecord]) -> Result<usize, StorageError> {
        let writes = buckets
            .iter()
            .map(|record| {
                let update = describe(
                    record,
                    record.time_spent,
                    serde_json::to_value(&record.timestamps)?,
                );
                Ok(BatchWrite::upsert(
                    COLLECTION,
                    bucket_filter(&record.date, record.hour, &record.app_name),
                    update,
                    to_document(record)?,
                ))
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        self.store.write_batch(writes).await?;
        debug!("Replaced {} usage buckets", buckets.len());
        Ok(buckets.len())
    }

    /// All usage between the given days, keyed by `YYYY-MM-DD`
    pub async fn get_app_usage_data(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<BTreeMap<String, DayUsage>, StorageError> {
        let filter = within_days(Filter::new(), "date", start, end);
        let options = FindOptions::new()
            .sort_by("date", SortOrder::Descending)
            .sort_by("hour", SortOrder::Descending);

        let found = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.find(COLLECTION, &filter, &options)
        })
        .await?;

        let mut data: BTreeMap<String, DayUsage> = BTreeMap::new();
        for record in records(found)? {
            data.entry(format_day(&record.date))
                .or_default()
                .insert_record(&record);
        }
        Ok(data)
    }

    /// Usage for a single day; empty when nothing was tracked
    pub async fn get_app_usage_for_date(&self, date: NaiveDate) -> Result<DayUsage, StorageError> {
        let filter = Filter::new().eq("date", format_day(&date));
        let options = FindOptions::new().sort_by("hour", SortOrder::Descending);

        let found = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.find(COLLECTION, &filter, &options)
        })
        .await?;

        let mut usage = DayUsage::default();
        for record in records(found)? {
            usage.insert_record(&record);
        }
        Ok(usage)
    }

    /// Delete a day's usage, narrowed to one app (and one hour of it)
    ///
    /// The hour is only considered together with an app. Returns the number of
    /// buckets deleted.
    pub async fn delete_app_usage_data(
        &self,
        date: NaiveDate,
        app_name: Option<&str>,
        hour: Option<u8>,
    ) -> Result<u64, StorageError> {
        let mut filter = Filter::new().eq("date", format_day(&date));
        if let Some(app_name) = app_name {
            filter = filter.eq("appName", app_name);
            if let Some(hour) = hour {
                filter = filter.eq("hour", hour);
            }
        }

        let removed = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.remove(COLLECTION, &filter, true)
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
        let spec = GroupSpec::new(&["category"])
            .filter(within_days(Filter::new(), "date", Some(start), Some(end)))
            .sum("totalTime", "timeSpent")
            .distinct("appCount", "appName")
            .count("sessionCount");

        let groups = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.aggregate(COLLECTION, &spec)
        })
        .await?;

        let mut stats: Vec<CategoryUsageStat> = groups
            .iter()
            .map(|group| CategoryUsageStat {
                category: text_field(group, "category"),
                total_time: int_field(group, "totalTime"),
                app_count: int_field(group, "appCount") as u64,
                session_count: int_field(group, "sessionCount") as u64,
            })
            .collect();
        stats.sort_by(|a, b| b.total_time.cmp(&a.total_time).then_with(|| a.category.cmp(&b.category)));
        Ok(stats)
    }

    /// Apps with the most time between two days
    pub async fn get_top_apps(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<TopApp>, StorageError> {
        let spec = GroupSpec::new(&["appName", "category"])
            .filter(within_days(Filter::new(), "date", Some(start), Some(end)))
            .sum("totalTime", "timeSpent")
            .count("sessionCount");

        let groups = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.aggregate(COLLECTION, &spec)
        })
        .await?;

        let mut apps: Vec<TopApp> = groups
            .iter()
            .map(|group| TopApp {
                app_name: text_field(group, "appName"),
                category: text_field(group, "category"),
                total_time: int_field(group, "totalTime"),
                session_count: int_field(group, "sessionCount") as u64,
            })
            .collect();
        apps.sort_by(|a, b| b.total_time.cmp(&a.total_time).then_with(|| a.app_name.cmp(&b.app_name)));
        apps.truncate(limit);
        Ok(apps)
    }

    /// Per-category totals for one day
    pub async fn get_daily_stats(&self, date: NaiveDate) -> Result<Vec<DailyCategoryStat>, StorageError> {
        let spec = GroupSpec::new(&["category"])
            .filter(Filter::new().eq("date", format_day(&date)))
            .sum("totalTime", "timeSpent")
            .distinct("appCount", "appName");

        let groups = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.aggregate(COLLECTION, &spec)
        })
        .await?;

        let mut stats: Vec<DailyCategoryStat> = groups
            .iter()
            .map(|group| DailyCategoryStat {
                category: text_field(group, "category"),
                total_time: int_field(group, "totalTime"),
                app_count: int_field(group, "appCount") as u64,
            })
            .collect();
        stats.sort_by(|a, b| b.total_time.cmp(&a.total_time).then_with(|| a.category.cmp(&b.category)));
        Ok(stats)
    }

    /// Hour-by-hour totals for one day; daily aggregates are not included
    pub async fn get_hourly_breakdown(
        &self,
        date: NaiveDate,
    ) -> Result<BTreeMap<u8, HourSummary>, StorageError> {
        let filter = Filter::new()
            .eq("date", format_day(&date))
            .ne("hour", Value::Null);
        let options = FindOptions::new().sort_by("hour", SortOrder::Ascending);

        let found = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.find(COLLECTION, &filter, &options)
        })
        .await?;

        let mut breakdown: BTreeMap<u8, HourSummary> = BTreeMap::new();
        for record in records(found)? {
            let Some(hour) = record.hour else { continue };
            let summary = breakdown.entry(hour).or_default();
            summary.total_time += record.time_spent;
            *summary.apps.entry(record.app_name.clone()).or_default() += record.time_spent;
            *summary.categories.entry(record.category.clone()).or_default() += record.time_spent;
        }
        Ok(breakdown)
    }

    /// Recategorize every bucket of an app on one day
    ///
    /// Returns the number of buckets changed.
    pub async fn update_app_category(
        &self,
        app_name: &str,
        date: NaiveDate,
        category: &str,
    ) -> Result<u64, StorageError> {
        let filter = Filter::new()
            .eq("appName", app_name)
            .eq("date", format_day(&date));
        let update = Update::new().set("category", category);

        let changed = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.update(COLLECTION, &filter, &update, true)
        })
        .await?;

        info!("Moved {} buckets of {} on {} to {}", changed, app_name, date, category);
        Ok(changed)
    }

    /// Buckets of one category, newest first
    pub async fn get_app_usage_by_category(
        &self,
        category: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<AppUsageRecord>, StorageError> {
        let filter = within_days(Filter::new().eq("category", category), "date", start, end);
        let options = FindOptions::new()
            .sort_by("date", SortOrder::Descending)
            .sort_by("hour", SortOrder::Descending);

        let found = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.find(COLLECTION, &filter, &options)
        })
        .await?;
        records(found)
    }

    /// Daily per-category totals over the last `days` days, oldest first
    pub async fn get_productivity_trend(&self, days: u32) -> Result<Vec<ProductivityTrendDay>, StorageError> {
        let since = today() - Duration::days(i64::from(days));
        let spec = GroupSpec::new(&["date", "category"])
            .filter(Filter::new().gte("date", format_day(&since)))
            .sum("time", "timeSpent");

        let groups = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.aggregate(COLLECTION, &spec)
        })
        .await?;

        let mut trend: BTreeMap<NaiveDate, Vec<CategoryTime>> = BTreeMap::new();
        for group in &groups {
            let day = text_field(group, "date");
            let Ok(date) = NaiveDate::parse_from_str(&day, DAY_FORMAT) else {
                debug!("Skipping usage group with unreadable date {:?}", day);
                continue;
            };
            trend.entry(date).or_default().push(CategoryTime {
                category: text_field(group, "category"),
                time: int_field(group, "time"),
            });
        }

        Ok(trend
            .into_iter()
            .map(|(date, mut categories)| {
                categories.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| a.category.cmp(&b.category)));
                ProductivityTrendDay { date, categories }
            })
            .collect())
    }

    /// Delete buckets older than `days_to_keep` days
    pub async fn cleanup_old_data(&self, days_to_keep: u32) -> Result<u64, StorageError> {
        let cutoff = today() - Duration::days(i64::from(days_to_keep));
        let filter = Filter::new().lt("date", format_day(&cutoff));

        let removed = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.remove(COLLECTION, &filter, true)
        })
        .await?;

        info!("Cleaned up {} usage buckets older than {}", removed, cutoff);
        Ok(removed)
    }
}

/// Default retention for [`AppUsageService::cleanup_old_data`]
pub const DEFAULT_DAYS_TO_KEEP: u32 = 90;
