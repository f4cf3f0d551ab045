// Tests for on-demand runs through the worker entry point

use async_trait::async_trait;
use chrono::Utc;
use common::errors::{ExecutionError, StoreError};
use common::executor::{ExporterRegistry, QuerySource};
use common::models::{NewTask, NotificationSpec, QuerySpec, ResultSet, TaskEntry};
use common::schedule::ScheduleType;
use common::storage::{FileTaskStore, TaskStore};
use common::worker::{run_now, ExecutionRunner, RunnerOptions};
use serde_json::json;
use std::sync::Arc;

/// Fails for queries against the "broken" database, succeeds otherwise
struct RoutingSource;

#[async_trait]
impl QuerySource for RoutingSource {
    async fn fetch(&self, spec: &QuerySpec) -> Result<ResultSet, ExecutionError> {
        if spec.database_url.ends_with("/broken") {
            return Err(ExecutionError::DatabaseConnectionFailed(
                "connection refused".to_string(),
            ));
        }
        Ok(ResultSet::new(
            vec!["id".to_string()],
            vec![vec![json!(1)], vec![json!(2)]],
        ))
    }
}

fn task(name: &str, database: &str, active: bool) -> NewTask {
    NewTask {
        name: name.to_string(),
        description: String::new(),
        query_spec: QuerySpec {
            database_type: "postgresql".to_string(),
            database_url: format!("postgresql://localhost/{}", database),
            query: "SELECT id FROM orders".to_string(),
        },
        schedule_type: ScheduleType::Cron,
        schedule_config: json!({ "hour": 9, "minute": 0 }).as_object().cloned().unwrap(),
        notification_spec: NotificationSpec {
            export_excel: false,
            ..NotificationSpec::default()
        },
        is_active: active,
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    store: Arc<FileTaskStore>,
    runner: ExecutionRunner,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileTaskStore::new(dir.path().join("tasks.json")));
    let runner = ExecutionRunner::new(
        store.clone(),
        Arc::new(RoutingSource),
        ExporterRegistry::new(),
        None,
        RunnerOptions {
            output_dir: dir.path().join("reports"),
            execution_timeout: None,
        },
    );
    Fixture {
        _dir: dir,
        store,
        runner,
    }
}

async fn add(store: &FileTaskStore, draft: NewTask) -> TaskEntry {
    store
        .add(TaskEntry::create(draft, Utc::now()).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_runs_every_active_task() {
    let f = fixture();
    let ok = add(&f.store, task("sales", "sales", true)).await;
    let broken = add(&f.store, task("stock", "broken", true)).await;
    let paused = add(&f.store, task("paused", "sales", false)).await;

    let summary = run_now(f.store.as_ref(), &f.runner, None).await.unwrap();

    assert_eq!(summary.succeeded, vec![ok.id.clone()]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, broken.id);
    assert!(summary.failed[0].1.contains("connection refused"));
    assert_eq!(summary.skipped, vec![paused.id.clone()]);
    assert!(summary.has_failures());

    let stored = f.store.get(&ok.id).await.unwrap();
    assert_eq!(stored.run_count, 1);
    assert!(stored.last_run_at.is_some());
    assert_eq!(f.store.get(&paused.id).await.unwrap().run_count, 0);

    let stored = f.store.get(&broken.id).await.unwrap();
    assert_eq!(stored.error_count, 1);
    assert!(stored.next_run_at.unwrap() > stored.last_run_at.unwrap());
}

#[tokio::test]
async fn test_runs_single_task_by_id() {
    let f = fixture();
    let first = add(&f.store, task("first", "sales", true)).await;
    let second = add(&f.store, task("second", "sales", true)).await;

    let summary = run_now(f.store.as_ref(), &f.runner, Some(&second.id))
        .await
        .unwrap();

    assert_eq!(summary.succeeded, vec![second.id.clone()]);
    assert!(!summary.has_failures());
    assert_eq!(f.store.get(&first.id).await.unwrap().run_count, 0);
}

#[tokio::test]
async fn test_unknown_task_is_an_error() {
    let f = fixture();
    let result = run_now(f.store.as_ref(), &f.runner, Some("missing")).await;
    assert_eq!(result, Err(StoreError::NotFound("missing".to_string())));
}
