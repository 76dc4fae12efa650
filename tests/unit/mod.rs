/// Unit tests for the domain rules and the query model
use chrono::{NaiveDate, TimeZone, Utc};
use focusbook_storage::storage::{Filter, FindOptions, SortOrder, Update};
use focusbook_storage::*;
use serde_json::{json, Value};

fn document(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {}", other),
    }
}

#[cfg(test)]
mod domain_rules {
    use super::*;

    #[test]
    fn test_usage_input_validation() {
        let day = NaiveDate::from_ymd_opt(2024, 7, 3).unwrap();

        let record = AppUsageInput::new(day, Some(23), "  code.exe ", -50, "Code")
            .into_record()
            .unwrap();
        assert_eq!(record.app_name, "code.exe");
        assert_eq!(record.time_spent, 0);
        assert_eq!(record.hour_key().as_deref(), Some("23:00"));

        let too_late = AppUsageInput::new(day, Some(24), "code.exe", 10, "Code").into_record();
        assert_eq!(too_late, Err(DomainError::InvalidHour(24)));

        let unnamed = AppUsageInput::new(day, None, "   ", 10, "Code").into_record();
        assert!(matches!(unnamed, Err(DomainError::Validation { .. })));
    }

    #[test]
    fn test_hour_keys() {
        assert_eq!(hour_key(7), "07:00");
        assert_eq!(parse_hour_key("07:00"), Some(7));
        assert_eq!(parse_hour_key("23:30"), Some(23));
        assert_eq!(parse_hour_key("24:00"), None);
        assert_eq!(parse_hour_key("7:00"), None);
        assert_eq!(parse_hour_key("apps"), None);
    }

    #[test]
    fn test_day_usage_keeps_daily_and_hourly_apart() {
        let day = NaiveDate::from_ymd_opt(2024, 7, 3).unwrap();
        let mut usage = DayUsage::default();
        usage.insert_record(&AppUsageEntry {
            time: 1000,
            category: "Code".to_string(),
            description: None,
            domain: None,
            timestamps: Vec::new(),
        }
        .to_record(day, None, "code.exe"));
        usage.insert_record(&AppUsageEntry {
            time: 2000,
            category: "Code".to_string(),
            description: None,
            domain: None,
            timestamps: Vec::new(),
        }
        .to_record(day, Some(11), "code.exe"));

        let serialized = serde_json::to_value(&usage).unwrap();
        assert_eq!(serialized["apps"]["code.exe"]["time"], json!(1000));
        assert_eq!(serialized["11:00"]["code.exe"]["time"], json!(2000));

        let mut records = usage.to_records(day);
        records.sort_by_key(|r| r.hour);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].hour, None);
        assert_eq!(records[1].hour, Some(11));
    }

    #[test]
    fn test_category_names_are_normalized() {
        let category = Category::new("  code", CategoryType::Productive).unwrap();
        assert_eq!(category.name, "Code");
        assert!(Category::new("   ", CategoryType::Neutral).is_err());
        assert_eq!("Distracted".parse::<CategoryType>(), Ok(CategoryType::Distracted));
        assert!("boring".parse::<CategoryType>().is_err());
    }

    #[test]
    fn test_session_types_from_ui() {
        assert_eq!(SessionType::from_ui("pomodoro"), SessionType::Focus);
        assert_eq!(SessionType::from_ui("short-break"), SessionType::ShortBreak);
        assert_eq!(SessionType::from_ui("longBreak"), SessionType::LongBreak);
        assert_eq!(SessionType::from_ui("nap"), SessionType::Focus);
    }

    #[test]
    fn test_session_transitions() {
        let start = Utc.with_ymd_and_hms(2024, 7, 3, 9, 0, 0).unwrap();
        let mut session =
            FocusSession::start(NewSession::new(SessionType::Focus, 60_000), start).unwrap();
        assert_eq!(session.date, NaiveDate::from_ymd_opt(2024, 7, 3).unwrap());

        assert!(session.resume(start).is_err());
        session.pause(start).unwrap();
        assert!(session.pause(start).is_err());
        session.resume(start).unwrap();

        assert!(session.end(SessionStatus::Paused, None, start).is_err());
        session.end(SessionStatus::Cancelled, Some(10), start).unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);

        let late = Interruption::new(start, Some("phone".to_string()), None);
        assert!(matches!(
            session.add_interruption(late),
            Err(DomainError::InvalidTransition { action: "interrupt", .. })
        ));
        assert!(FocusSession::start(NewSession::new(SessionType::Focus, -1), start).is_err());
    }

    #[test]
    fn test_productivity_rating_range() {
        assert!(validate_productivity(1).is_ok());
        assert!(validate_productivity(5).is_ok());
        assert!(validate_productivity(0).is_err());
        assert!(validate_productivity(6).is_err());
    }

    #[test]
    fn test_day_coercion() {
        let expected = NaiveDate::from_ymd_opt(2024, 7, 3).unwrap();
        assert_eq!(day_from_value(&json!("2024-07-03")).unwrap(), expected);
        assert_eq!(day_from_value(&json!("2024-07-03T10:00:00.000Z")).unwrap(), expected);
        assert!(day_from_value(&json!("garbage")).is_err());
    }
}

#[cfg(test)]
mod query_model {
    use super::*;

    #[test]
    fn test_filter_from_json() {
        let filter = Filter::from_json(&json!({
            "date": {"$gte": "2024-07-01", "$lte": "2024-07-31"},
            "appName": "code.exe"
        }))
        .unwrap();

        assert!(filter.matches(&document(json!({"date": "2024-07-03", "appName": "code.exe"}))));
        assert!(!filter.matches(&document(json!({"date": "2024-08-01", "appName": "code.exe"}))));
        assert!(!filter.matches(&document(json!({"date": "2024-07-03", "appName": "slack.exe"}))));

        assert!(Filter::from_json(&json!({"date": {"$near": 1}})).is_err());
        assert!(Filter::from_json(&json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn test_regex_and_membership() {
        let filter = Filter::new()
            .regex("name", "^co", true)
            .is_in("type", ["productive", "neutral"]);

        assert!(filter.matches(&document(json!({"name": "Code", "type": "productive"}))));
        assert!(!filter.matches(&document(json!({"name": "Code", "type": "distracted"}))));
        assert!(!filter.matches(&document(json!({"name": "Docs", "type": "neutral"}))));
    }

    #[test]
    fn test_sort_and_page() {
        let mut documents = vec![
            document(json!({"hour": 9})),
            document(json!({"hour": 14})),
            document(json!({"hour": 11})),
        ];
        let options = FindOptions::new()
            .sort_by("hour", SortOrder::Descending)
            .skip(1)
            .limit(1);
        options.sort_documents(&mut documents);
        let page = options.page(documents);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].get("hour"), Some(&json!(11)));
    }

    #[test]
    fn test_update_sets_fields() {
        let mut stored = document(json!({"_id": "a", "timeSpent": 100}));
        Update::new()
            .set("timeSpent", 300)
            .set("category", "Code")
            .apply(&mut stored);
        assert_eq!(stored.get("timeSpent"), Some(&json!(300)));
        assert_eq!(stored.get("category"), Some(&json!("Code")));
        assert_eq!(stored.get("_id"), Some(&json!("a")));
    }
}

#[cfg(test)]
mod configuration {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_postgres_config_from_variables() {
        let vars: HashMap<&str, &str> =
            [("DB_HOST", "db.internal"), ("DB_PORT", "6543"), ("DB_NAME", "focus")].into();
        let config = PostgresConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.location(), "db.internal:6543/focus");
        assert_eq!(config.user, "postgres");

        let bad: HashMap<&str, &str> = [("DB_PORT", "not-a-port")].into();
        assert!(PostgresConfig::from_lookup(|key| bad.get(key).map(|v| v.to_string())).is_err());
    }

    #[test]
    fn test_storage_config_defaults() {
        let config = StorageConfig::new("/tmp/focusbook-test");
        assert_eq!(config.backend, BackendChoice::DocumentStore);
        assert!(config.sqlite_path().ends_with("focusbook.db"));

        let retry = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
    }

    #[test]
    fn test_migration_stats_success_rate() {
        let stats = MigrationStats {
            total: 4,
            migrated: 3,
            failed: 1,
        };
        assert_eq!(stats.success_rate(), 75.0);
        assert_eq!(MigrationStats::default().success_rate(), 100.0);
        assert_eq!(EntityKind::CustomCategoryMappings.label(), "customCategoryMappings");
    }
}
