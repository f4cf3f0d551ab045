// Property-based tests for the file-backed task catalog

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::errors::StoreError;
use common::models::{NewTask, NotificationSpec, Outcome, QuerySpec, TaskEntry};
use common::schedule::ScheduleType;
use common::storage::{FileTaskStore, TaskStore};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;

fn draft(name: &str, minutes: i64) -> NewTask {
    NewTask {
        name: name.to_string(),
        description: format!("{} report", name),
        query_spec: QuerySpec {
            database_type: "postgresql".to_string(),
            database_url: "postgresql://localhost/reports".to_string(),
            query: "SELECT * FROM daily_totals".to_string(),
        },
        schedule_type: ScheduleType::Interval,
        schedule_config: json!({ "minutes": minutes }).as_object().cloned().unwrap(),
        notification_spec: NotificationSpec {
            recipients: vec!["finance@example.com".to_string()],
            ..NotificationSpec::default()
        },
        is_active: true,
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever is added reads back identically, in insertion order
    #[test]
    fn property_add_then_get_round_trips(
        names in prop::collection::vec("[a-z]{1,12}", 1..8),
        minutes in 1i64..1440,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::new(dir.path().join("tasks.json"));
        runtime().block_on(async {
            let mut added = Vec::new();
            for name in &names {
                let entry = TaskEntry::create(draft(name, minutes), epoch()).unwrap();
                added.push(store.add(entry).await.unwrap());
            }

            for entry in &added {
                prop_assert_eq!(&store.get(&entry.id).await.unwrap(), entry);
            }
            let first = store.list().await.unwrap();
            let second = store.list().await.unwrap();
            prop_assert_eq!(&first, &added);
            prop_assert_eq!(first, second);
            Ok(())
        })?;
    }

    /// Errors never outnumber runs, whatever the outcome sequence
    #[test]
    fn property_error_count_bounded_by_run_count(outcomes in prop::collection::vec(any::<bool>(), 0..20)) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::new(dir.path().join("tasks.json"));
        runtime().block_on(async {
            let entry = store
                .add(TaskEntry::create(draft("totals", 1), epoch()).unwrap())
                .await
                .unwrap();

            let mut fired_at = epoch();
            for success in &outcomes {
                fired_at += Duration::minutes(1);
                let outcome = if *success {
                    Outcome::Success { rows: 3 }
                } else {
                    Outcome::Failure("Database query failed: timeout".to_string())
                };
                let updated = store.record_run(&entry.id, fired_at, &outcome).await.unwrap();
                prop_assert!(updated.error_count <= updated.run_count);
                prop_assert_eq!(updated.last_run_at, Some(fired_at));
                prop_assert_eq!(updated.next_run_at, Some(fired_at + Duration::minutes(1)));
            }

            let stored = store.get(&entry.id).await.unwrap();
            prop_assert_eq!(stored.run_count, outcomes.len() as u64);
            prop_assert_eq!(
                stored.error_count,
                outcomes.iter().filter(|success| !**success).count() as u64
            );
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn test_interval_entry_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileTaskStore::new(dir.path().join("tasks.json"));

    let entry = store
        .add(TaskEntry::create(draft("hourly", 1), epoch()).unwrap())
        .await
        .unwrap();
    assert_eq!(entry.next_run_at, Some(epoch() + Duration::minutes(1)));

    let fired_at = epoch() + Duration::minutes(1);
    let updated = store
        .record_run(&entry.id, fired_at, &Outcome::Success { rows: 12 })
        .await
        .unwrap();
    assert_eq!(updated.run_count, 1);
    assert_eq!(updated.error_count, 0);
    assert_eq!(updated.next_run_at, Some(epoch() + Duration::minutes(2)));

    let failed = store
        .record_run(
            &entry.id,
            epoch() + Duration::minutes(2),
            &Outcome::Failure("Database connection failed: refused".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(failed.run_count, 2);
    assert_eq!(failed.error_count, 1);
    assert_eq!(
        failed.last_error.as_deref(),
        Some("Database connection failed: refused")
    );
    assert_eq!(failed.next_run_at, Some(epoch() + Duration::minutes(3)));

    store.delete(&entry.id).await.unwrap();
    assert_eq!(
        store.get(&entry.id).await,
        Err(StoreError::NotFound(entry.id.clone()))
    );
    assert!(matches!(
        store.add(entry.clone()).await,
        Err(StoreError::DuplicateId(_))
    ));
}

/// Writers in separate threads, each with its own store handle, never lose an add
#[test]
fn test_concurrent_writers_keep_every_entry() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("tasks.json");
    let threads = 4;
    let per_thread = 10;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let catalog = catalog.clone();
            std::thread::spawn(move || {
                let store = FileTaskStore::new(catalog);
                runtime().block_on(async {
                    let mut ids = Vec::new();
                    for i in 0..per_thread {
                        let entry =
                            TaskEntry::create(draft(&format!("t{}-{}", t, i), 5), epoch()).unwrap();
                        ids.push(store.add(entry).await.unwrap().id);
                    }
                    ids
                })
            })
        })
        .collect();

    let mut expected = HashSet::new();
    for handle in handles {
        expected.extend(handle.join().unwrap());
    }

    let stored: HashSet<String> = runtime()
        .block_on(FileTaskStore::new(&catalog).list())
        .unwrap()
        .into_iter()
        .map(|entry| entry.id)
        .collect();
    assert_eq!(stored.len(), threads * per_thread);
    assert_eq!(stored, expected);
}

#[tokio::test]
async fn test_corrupt_catalog_is_reported_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("tasks.json");
    std::fs::write(&catalog, b"[{\"id\": ").unwrap();
    let store = FileTaskStore::new(&catalog);

    assert!(matches!(
        store.list().await,
        Err(StoreError::StorageCorruption { .. })
    ));
    let entry = TaskEntry::create(draft("fresh", 5), epoch()).unwrap();
    assert!(matches!(
        store.add(entry).await,
        Err(StoreError::StorageCorruption { .. })
    ));
    assert_eq!(std::fs::read(&catalog).unwrap(), b"[{\"id\": ");
}
