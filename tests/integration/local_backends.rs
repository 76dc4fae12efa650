/// Service behaviour shared by the document store and SQLite
use chrono::{NaiveDate, TimeZone, Utc};
use focusbook_storage::*;
use tempfile::TempDir;

use super::{config, connected, BACKENDS};

fn july_3rd() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 7, 3).unwrap()
}

/// Make every app usage write fail until [`unblock_app_usage_writes`]
fn block_app_usage_writes(dir: &TempDir, backend: BackendChoice) {
    match backend {
        BackendChoice::DocumentStore => {
            std::fs::create_dir(dir.path().join("appUsage.db~")).unwrap();
        }
        BackendChoice::Sqlite => {
            let conn = rusqlite::Connection::open(config(dir, backend).sqlite_path()).unwrap();
            conn.execute_batch(
                "CREATE TRIGGER block_insert BEFORE INSERT ON app_usage
                 BEGIN SELECT RAISE(ABORT, 'blocked'); END;
                 CREATE TRIGGER block_update BEFORE UPDATE ON app_usage
                 BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
            )
            .unwrap();
        }
    }
}

fn unblock_app_usage_writes(dir: &TempDir, backend: BackendChoice) {
    match backend {
        BackendChoice::DocumentStore => {
            std::fs::remove_dir(dir.path().join("appUsage.db~")).unwrap();
        }
        BackendChoice::Sqlite => {
            let conn = rusqlite::Connection::open(config(dir, backend).sqlite_path()).unwrap();
            conn.execute_batch("DROP TRIGGER block_insert; DROP TRIGGER block_update;")
                .unwrap();
        }
    }
}

#[tokio::test]
async fn test_usage_accumulates_in_its_bucket() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let orchestrator = connected(&dir, backend).await;
        let usage = orchestrator.app_usage().await.unwrap();

        let at = |minute| Utc.with_ymd_and_hms(2024, 7, 3, 11, minute, 0).unwrap();
        let first = usage
            .save_app_usage(
                AppUsageInput::new(july_3rd(), Some(11), "code.exe", 5000, "Code")
                    .with_timestamp(UsageTimestamp::new(at(0), 5000)),
            )
            .await
            .unwrap();
        let second = usage
            .save_app_usage(
                AppUsageInput::new(july_3rd(), Some(11), "code.exe", 3000, "Code")
                    .with_timestamp(UsageTimestamp::new(at(10), 3000)),
            )
            .await
            .unwrap();
        assert_eq!(first, second, "{:?}", backend);

        let day = usage.get_app_usage_for_date(july_3rd()).await.unwrap();
        assert!(day.apps.is_empty(), "{:?}", backend);
        assert_eq!(day.hours.len(), 1);
        assert_eq!(day.hours["11:00"]["code.exe"].time, 8000, "{:?}", backend);
        assert_eq!(day.hours["11:00"]["code.exe"].category, "Code");

        let timestamps = &day.hours["11:00"]["code.exe"].timestamps;
        assert_eq!(timestamps.len(), 2, "{:?}", backend);
        assert_eq!(timestamps[0].start, at(0));
        assert_eq!(timestamps[1].duration, 3000);

        orchestrator.disconnect().await.unwrap();
    }
}

#[tokio::test]
async fn test_daily_and_hourly_buckets_are_separate() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let orchestrator = connected(&dir, backend).await;
        let usage = orchestrator.app_usage().await.unwrap();

        usage
            .save_app_usage(AppUsageInput::new(july_3rd(), None, "code.exe", 1000, "Code"))
            .await
            .unwrap();
        usage
            .save_app_usage(AppUsageInput::new(july_3rd(), Some(0), "code.exe", 2000, "Code"))
            .await
            .unwrap();

        let day = usage.get_app_usage_for_date(july_3rd()).await.unwrap();
        assert_eq!(day.apps["code.exe"].time, 1000, "{:?}", backend);
        assert_eq!(day.hours["00:00"]["code.exe"].time, 2000, "{:?}", backend);

        let other_day = usage
            .get_app_usage_for_date(NaiveDate::from_ymd_opt(2024, 7, 4).unwrap())
            .await
            .unwrap();
        assert!(other_day.apps.is_empty() && other_day.hours.is_empty());

        orchestrator.disconnect().await.unwrap();
    }
}

#[tokio::test]
async fn test_invalid_hour_is_rejected_before_writing() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let orchestrator = connected(&dir, backend).await;
        let usage = orchestrator.app_usage().await.unwrap();

        let result = usage
            .save_app_usage(AppUsageInput::new(july_3rd(), Some(24), "code.exe", 1000, "Code"))
            .await;
        assert!(matches!(
            result,
            Err(StorageError::Validation(DomainError::InvalidHour(24)))
        ));

        let day = usage.get_app_usage_for_date(july_3rd()).await.unwrap();
        assert!(day.hours.is_empty(), "{:?}", backend);

        orchestrator.disconnect().await.unwrap();
    }
}

#[tokio::test]
async fn test_add_category_is_idempotent() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let orchestrator = connected(&dir, backend).await;
        let categories = orchestrator.categories().await.unwrap();

        let first = categories.add_category("Code", CategoryType::Productive).await.unwrap();
        let second = categories.add_category("code", CategoryType::Productive).await.unwrap();
        assert_eq!(first.name, second.name);

        let all = categories.get_all_categories().await.unwrap();
        let named_code: Vec<_> = all.iter().filter(|c| c.name == "Code").collect();
        assert_eq!(named_code.len(), 1, "{:?}", backend);
        assert_eq!(named_code[0].category_type, CategoryType::Productive);

        orchestrator.disconnect().await.unwrap();
    }
}

#[tokio::test]
async fn test_session_state_machine() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let orchestrator = connected(&dir, backend).await;
        let sessions = orchestrator.focus_sessions().await.unwrap();

        assert!(sessions.pause_session("no-such-session").await.is_err());

        let session = sessions
            .start_session(NewSession::from_ui("pomodoro", 25 * 60 * 1000))
            .await
            .unwrap();
        let id = session.id.clone().unwrap();
        assert_eq!(session.status, SessionStatus::Active);

        let paused = sessions.pause_session(&id).await.unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);

        let result = sessions.pause_session(&id).await;
        assert!(matches!(
            result,
            Err(StorageError::Validation(DomainError::InvalidTransition { .. }))
        ));

        sessions.resume_session(&id).await.unwrap();
        sessions.add_interruption(&id, Some("phone"), None).await.unwrap();

        let ended = sessions
            .end_session(&id, SessionStatus::Completed, Some(1000))
            .await
            .unwrap();
        assert_eq!(ended.status, SessionStatus::Completed);
        assert_eq!(ended.interruptions.len(), 1);
        assert!(sessions.current_session().await.is_none(), "{:?}", backend);

        let result = sessions.resume_session(&id).await;
        assert!(matches!(
            result,
            Err(StorageError::Validation(DomainError::InvalidTransition { .. }))
        ));

        orchestrator.disconnect().await.unwrap();
    }
}

#[tokio::test]
async fn test_new_session_cancels_previous_exactly_once() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let orchestrator = connected(&dir, backend).await;
        let sessions = orchestrator.focus_sessions().await.unwrap();

        let first = sessions
            .start_session(NewSession::new(SessionType::Focus, 60_000))
            .await
            .unwrap();
        let second = sessions
            .start_session(NewSession::new(SessionType::ShortBreak, 60_000))
            .await
            .unwrap();

        let first_id = first.id.unwrap();
        let second_id = second.id.clone().unwrap();

        let cancelled = sessions.get_session_by_id(&first_id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled, "{:?}", backend);
        assert_eq!(
            sessions.current_session().await.and_then(|s| s.id),
            Some(second_id.clone())
        );

        sessions
            .end_session(&second_id, SessionStatus::Completed, None)
            .await
            .unwrap();
        sessions
            .start_session(NewSession::new(SessionType::Focus, 60_000))
            .await
            .unwrap();

        let completed = sessions.get_session_by_id(&second_id).await.unwrap().unwrap();
        assert_eq!(completed.status, SessionStatus::Completed, "{:?}", backend);

        let recent = sessions.get_recent_sessions(10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(
            recent.iter().filter(|s| s.status.is_current()).count(),
            1,
            "{:?}",
            backend
        );

        orchestrator.disconnect().await.unwrap();
    }
}

#[tokio::test]
async fn test_data_survives_reconnect() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let orchestrator = connected(&dir, backend).await;
        orchestrator
            .app_usage()
            .await
            .unwrap()
            .save_app_usage(AppUsageInput::new(july_3rd(), Some(9), "slack.exe", 700, "Communication"))
            .await
            .unwrap();
        orchestrator.disconnect().await.unwrap();

        let reopened = connected(&dir, backend).await;
        let day = reopened
            .app_usage()
            .await
            .unwrap()
            .get_app_usage_for_date(july_3rd())
            .await
            .unwrap();
        assert_eq!(day.hours["09:00"]["slack.exe"].time, 700, "{:?}", backend);
        reopened.disconnect().await.unwrap();
    }
}

#[tokio::test]
async fn test_failed_save_leaves_bucket_time_unchanged() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let orchestrator = connected(&dir, backend).await;
        let usage = orchestrator.app_usage().await.unwrap();
        let input = |time| AppUsageInput::new(july_3rd(), Some(11), "code.exe", time, "Code");

        usage.save_app_usage(input(5000)).await.unwrap();

        block_app_usage_writes(&dir, backend);
        let result = usage.save_app_usage(input(3000)).await;
        assert!(
            matches!(result, Err(StorageError::RetriesExhausted { .. })),
            "{:?}",
            backend
        );

        let day = usage.get_app_usage_for_date(july_3rd()).await.unwrap();
        assert_eq!(day.hours["11:00"]["code.exe"].time, 5000, "{:?}", backend);

        unblock_app_usage_writes(&dir, backend);
        usage.save_app_usage(input(3000)).await.unwrap();
        let day = usage.get_app_usage_for_date(july_3rd()).await.unwrap();
        assert_eq!(day.hours["11:00"]["code.exe"].time, 8000, "{:?}", backend);

        orchestrator.disconnect().await.unwrap();
    }
}

#[tokio::test]
async fn test_failed_snapshot_import_changes_nothing() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let orchestrator = connected(&dir, backend).await;
        let usage = orchestrator.app_usage().await.unwrap();
        usage
            .save_app_usage(AppUsageInput::new(july_3rd(), Some(11), "code.exe", 5000, "Code"))
            .await
            .unwrap();

        let snapshot: UsageSnapshot = serde_json::from_value(serde_json::json!({
            "2024-07-03": {
                "apps": { "slack.exe": { "time": 700, "category": "Communication" } },
                "11:00": { "code.exe": { "time": 1200, "category": "Code" } }
            }
        }))
        .unwrap();

        block_app_usage_writes(&dir, backend);
        assert!(usage.import_usage_snapshot(&snapshot).await.is_err(), "{:?}", backend);
        unblock_app_usage_writes(&dir, backend);

        let day = usage.get_app_usage_for_date(july_3rd()).await.unwrap();
        assert_eq!(day.hours["11:00"]["code.exe"].time, 5000, "{:?}", backend);
        assert!(day.apps.is_empty(), "{:?}", backend);

        assert_eq!(usage.import_usage_snapshot(&snapshot).await.unwrap(), 2);
        let day = usage.get_app_usage_for_date(july_3rd()).await.unwrap();
        assert_eq!(day.hours["11:00"]["code.exe"].time, 1200, "{:?}", backend);
        assert_eq!(day.apps["slack.exe"].time, 700);

        orchestrator.disconnect().await.unwrap();
    }
}

#[tokio::test]
async fn test_rejected_category_import_keeps_every_category() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let orchestrator = connected(&dir, backend).await;
        let categories = orchestrator.categories().await.unwrap();

        let mut export = categories.export_categories().await.unwrap();
        export.categories = vec![
            Category::new("Code", CategoryType::Productive).unwrap(),
            Category {
                id: None,
                name: " code ".to_string(),
                category_type: CategoryType::Neutral,
            },
        ];

        let result = categories.import_categories(&export).await;
        assert!(matches!(result, Err(StorageError::Validation(_))), "{:?}", backend);
        assert_eq!(categories.get_all_categories().await.unwrap().len(), 6, "{:?}", backend);

        orchestrator.disconnect().await.unwrap();
    }
}
