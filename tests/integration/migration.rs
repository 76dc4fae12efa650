/// Document store to SQLite migration, driven through the public API
use chrono::NaiveDate;
use focusbook_storage::*;
use tempfile::TempDir;

use super::{config, connected};

#[tokio::test]
async fn test_workspace_reads_the_same_after_migration() {
    let dir = TempDir::new().unwrap();
    let day = NaiveDate::from_ymd_opt(2024, 7, 3).unwrap();

    let source = connected(&dir, BackendChoice::DocumentStore).await;
    let usage = source.app_usage().await.unwrap();
    usage
        .save_app_usage(AppUsageInput::new(day, Some(11), "code.exe", 5000, "Code"))
        .await
        .unwrap();
    usage
        .save_app_usage(AppUsageInput::new(day, Some(11), "code.exe", 3000, "Code"))
        .await
        .unwrap();
    usage
        .save_app_usage(AppUsageInput::new(day, None, "code.exe", 8000, "Code"))
        .await
        .unwrap();

    let categories = source.categories().await.unwrap();
    categories
        .add_category("Browsing", CategoryType::Distracted)
        .await
        .unwrap();
    categories
        .add_category("Writing", CategoryType::Productive)
        .await
        .unwrap();
    categories
        .add_custom_category_mapping("notion.exe", "Writing")
        .await
        .unwrap();

    let sessions = source.focus_sessions().await.unwrap();
    let session = sessions
        .start_session(NewSession::new(SessionType::Focus, 60_000))
        .await
        .unwrap();
    let id = session.id.unwrap();
    sessions.add_interruption(&id, Some("phone"), None).await.unwrap();
    sessions
        .end_session(&id, SessionStatus::Completed, Some(50_000))
        .await
        .unwrap();

    let expected_day = usage.get_app_usage_for_date(day).await.unwrap();
    let expected_settings = categories.get_categories_for_settings().await.unwrap();
    let expected_mappings = categories.get_custom_category_mappings().await.unwrap();
    source.disconnect().await.unwrap();

    let report = DocumentToSqliteMigration::new(&config(&dir, BackendChoice::Sqlite))
        .run()
        .await
        .unwrap();
    assert!(report.skipped.is_none());
    assert_eq!(report.total_failed(), 0);
    assert_eq!(report.stats_for(EntityKind::AppUsage).migrated, 2);
    assert_eq!(report.stats_for(EntityKind::FocusSessions).migrated, 1);
    assert_eq!(report.stats_for(EntityKind::Interruptions).migrated, 1);

    let destination = connected(&dir, BackendChoice::Sqlite).await;
    let day_usage = destination
        .app_usage()
        .await
        .unwrap()
        .get_app_usage_for_date(day)
        .await
        .unwrap();
    assert_eq!(day_usage, expected_day);
    assert_eq!(day_usage.hours["11:00"]["code.exe"].time, 8000);
    assert_eq!(day_usage.apps["code.exe"].time, 8000);

    let categories = destination.categories().await.unwrap();
    assert_eq!(
        categories.get_categories_for_settings().await.unwrap(),
        expected_settings
    );
    assert_eq!(
        categories.get_custom_category_mappings().await.unwrap(),
        expected_mappings
    );

    let migrated = destination
        .focus_sessions()
        .await
        .unwrap()
        .get_recent_sessions(10)
        .await
        .unwrap();
    assert_eq!(migrated.len(), 1);
    assert_eq!(migrated[0].status, SessionStatus::Completed);
    assert_eq!(migrated[0].actual_duration, Some(50_000));
    assert_eq!(migrated[0].interruptions.len(), 1);
    assert_eq!(migrated[0].interruptions[0].reason.as_deref(), Some("phone"));

    destination.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_one_bad_record_fails_alone() {
    let dir = TempDir::new().unwrap();
    let lines = [
        r#"{"_id":"a","date":"2024-07-01","hour":9,"appName":"code.exe","timeSpent":1000}"#,
        r#"{"_id":"b","date":"2024-07-01","hour":30,"appName":"code.exe","timeSpent":1000}"#,
        r#"{"_id":"c","date":"2024-07-01","hour":10,"appName":"code.exe","timeSpent":1000}"#,
        r#"{"_id":"d","date":"2024-07-01","appName":"code.exe","timeSpent":2000}"#,
    ];
    std::fs::write(dir.path().join("appUsage.db"), lines.join("\n") + "\n").unwrap();

    let report = DocumentToSqliteMigration::new(&config(&dir, BackendChoice::Sqlite))
        .run()
        .await
        .unwrap();

    let stats = report.stats_for(EntityKind::AppUsage);
    assert_eq!(stats.total, 4);
    assert_eq!(stats.migrated, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].record, "b");

    let printed = report.to_string();
    assert!(printed.contains("appUsage"));
    assert!(printed.contains("Total failed: 1"));
}
