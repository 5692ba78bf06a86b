//! End-to-end tests for the entity tables against a temporary SQLite database.

use std::sync::Arc;

use serde_json::json;

use flowmeta::storage::types::*;
use flowmeta::storage::{
    DatabaseConfig, EntityTable, Envelope, MetadataStore, Outcome, StatusTable,
};

async fn open_store(dir: &tempfile::TempDir) -> Arc<MetadataStore> {
    let config = DatabaseConfig::sqlite_file(&dir.path().join("meta.db"));
    MetadataStore::open(config).await.unwrap()
}

fn run_of(env: Envelope) -> RunRecord {
    match env.into_record() {
        Some(Record::Run(r)) => r,
        other => panic!("expected a run, got {:?}", other),
    }
}

fn task_of(env: Envelope) -> TaskRecord {
    match env.into_record() {
        Some(Record::Task(t)) => t,
        other => panic!("expected a task, got {:?}", other),
    }
}

/// Register a flow, open run 1 and step `start`, and create task 1.
async fn seed(store: &MetadataStore) -> TaskKey {
    let flow = FlowKey::new("demo");
    assert!(store.flows().create(&flow, FlowDraft::default()).await.is_success());
    let run = run_of(store.runs().create(&flow, RunDraft::default()).await);
    let step = run.key().step("start");
    assert!(store.steps().create(&step, StepDraft::default()).await.is_success());
    task_of(store.tasks().create(&step, TaskDraft::default()).await).key()
}

#[tokio::test]
async fn flow_round_trip_preserves_tags() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let draft = FlowDraft {
        name: Some("Demo flow".into()),
        user_name: Some("ada".into()),
        tags: Some(json!(["team:data", "env:prod"])),
        system_tags: Some(json!({"runtime": "local"})),
    };
    let env = store.flows().create(&FlowKey::new("demo"), draft).await;
    assert_eq!(env.outcome, Outcome::Success);

    let env = store.flows().get(&FlowKey::new("demo")).await;
    let Some(Record::Flow(flow)) = env.record() else {
        panic!("expected a flow, got {:?}", env);
    };
    assert_eq!(flow.name, "Demo flow");
    assert_eq!(flow.user_name.as_deref(), Some("ada"));
    assert_eq!(flow.tags, Some(json!(["team:data", "env:prod"])));
    assert_eq!(flow.system_tags, Some(json!({"runtime": "local"})));
    assert!(flow.ts_epoch > 0);
}

#[tokio::test]
async fn flow_name_defaults_to_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let env = store.flows().create(&FlowKey::new("etl"), FlowDraft::default()).await;
    let Some(Record::Flow(flow)) = env.record() else {
        panic!("expected a flow");
    };
    assert_eq!(flow.name, "etl");
}

#[tokio::test]
async fn reregistering_flow_keeps_first_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let key = FlowKey::new("demo");

    let first = store
        .flows()
        .create(&key, FlowDraft { user_name: Some("ada".into()), ..Default::default() })
        .await;
    let second = store
        .flows()
        .create(&key, FlowDraft { user_name: Some("bob".into()), ..Default::default() })
        .await;

    assert_eq!(first, second);
    let listed = store.flows().get_all(&(), None).await;
    assert_eq!(listed.records().unwrap().len(), 1);
}

#[tokio::test]
async fn empty_flow_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let env = store.flows().create(&FlowKey::new(" "), FlowDraft::default()).await;
    assert_eq!(env.outcome, Outcome::ValidationError);
    assert_eq!(env.diagnostic().unwrap().field.as_deref(), Some("flow_id"));
}

#[tokio::test]
async fn run_numbers_start_at_one_per_flow() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    for id in ["a", "b"] {
        store.flows().create(&FlowKey::new(id), FlowDraft::default()).await;
    }
    let a1 = run_of(store.runs().create(&FlowKey::new("a"), RunDraft::default()).await);
    let a2 = run_of(store.runs().create(&FlowKey::new("a"), RunDraft::default()).await);
    let b1 = run_of(store.runs().create(&FlowKey::new("b"), RunDraft::default()).await);

    assert_eq!((a1.run_number, a2.run_number, b1.run_number), (1, 2, 1));
    assert_eq!(a1.status, ExecutionStatus::Created);
    assert!(a1.finished_at.is_none());
}

#[tokio::test]
async fn full_hierarchy_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let task = seed(&store).await;

    assert_eq!(task.to_string(), "demo/1/start/1");

    let env = store.steps().get(&task.step()).await;
    let Some(Record::Step(step)) = env.record() else {
        panic!("expected a step, got {:?}", env);
    };
    assert_eq!(step.step_name, "start");

    let env = store.tasks().get(&task).await;
    assert_eq!(task_of(env).status, ExecutionStatus::Created);

    let second = task_of(store.tasks().create(&task.step(), TaskDraft::default()).await);
    assert_eq!(second.task_id, 2);

    let tasks = store.tasks().get_all(&task.step(), None).await;
    let ids: Vec<i64> = tasks
        .records()
        .unwrap()
        .iter()
        .map(|r| match r {
            Record::Task(t) => t.task_id,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test]
async fn missing_records_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let task = seed(&store).await;

    let env = store.flows().get(&FlowKey::new("nope")).await;
    assert_eq!(env.outcome, Outcome::NotFound);
    assert_eq!(env.http_status(), 404);

    assert_eq!(store.runs().get(&RunKey::new("demo", 9)).await.outcome, Outcome::NotFound);
    assert_eq!(
        store.steps().get(&task.step().run().step("end")).await.outcome,
        Outcome::NotFound
    );
    assert_eq!(
        store.tasks().get(&task.step().task(42)).await.outcome,
        Outcome::NotFound
    );
    assert_eq!(
        store.artifacts().get(&task.artifact("model")).await.outcome,
        Outcome::NotFound
    );
}

#[tokio::test]
async fn listing_under_missing_parent_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let env = store.runs().get_all(&FlowKey::new("ghost"), None).await;
    assert_eq!(env.outcome, Outcome::Success);
    assert!(env.records().unwrap().is_empty());

    let env = store.flows().get_all(&(), None).await;
    assert!(env.records().unwrap().is_empty());
}

#[tokio::test]
async fn status_transitions_are_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let task = seed(&store).await;
    let run = task.step().run();

    let env = store.runs().update_status(&run, ExecutionStatus::Running).await;
    let running = run_of(env);
    assert_eq!(running.status, ExecutionStatus::Running);
    assert!(running.finished_at.is_none());

    let env = store.runs().update_status(&run, ExecutionStatus::Completed).await;
    let done = run_of(env);
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert!(done.finished_at.unwrap() >= done.ts_epoch);

    let env = store.runs().update_status(&run, ExecutionStatus::Running).await;
    assert_eq!(env.outcome, Outcome::ValidationError);
    assert!(env.diagnostic().unwrap().write_not_applied);
    assert_eq!(run_of(store.runs().get(&run).await).status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn task_can_fail_from_created() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let task = seed(&store).await;

    let failed = task_of(store.tasks().update_status(&task, ExecutionStatus::Failed).await);
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert!(failed.finished_at.is_some());

    let env = store
        .tasks()
        .update_status(&task.step().task(99), ExecutionStatus::Running)
        .await;
    assert_eq!(env.outcome, Outcome::NotFound);
}

#[tokio::test]
async fn metadata_is_append_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let task = seed(&store).await;

    let batch = vec![
        MetadataDraft {
            field_name: Some("attempt".into()),
            value: Some("0".into()),
            metadata_type: Some("attempt".into()),
            ..Default::default()
        },
        MetadataDraft {
            field_name: Some("attempt".into()),
            value: Some("1".into()),
            ..Default::default()
        },
    ];
    let env = store.metadata().create(&task, batch).await;
    assert_eq!(env.outcome, Outcome::Accepted);
    assert_eq!(env.http_status(), 202);
    assert_eq!(
        serde_json::to_value(&env.body).unwrap(),
        json!({"metadata_created": 2})
    );

    let env = store.metadata().get(&task).await;
    let values: Vec<(String, String)> = env
        .records()
        .unwrap()
        .iter()
        .map(|r| match r {
            Record::Metadata(m) => (m.value.clone(), m.metadata_type.clone()),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(
        values,
        vec![("0".to_string(), "attempt".to_string()), ("1".to_string(), String::new())]
    );
}

#[tokio::test]
async fn metadata_batch_skips_invalid_entries() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let task = seed(&store).await;

    let batch = vec![
        MetadataDraft {
            field_name: Some("host".into()),
            value: Some("worker-3".into()),
            ..Default::default()
        },
        MetadataDraft {
            value: Some("orphan".into()),
            ..Default::default()
        },
        MetadataDraft {
            field_name: Some("no-value".into()),
            ..Default::default()
        },
    ];
    let env = store.metadata().create(&task, batch).await;
    assert_eq!(
        serde_json::to_value(&env.body).unwrap(),
        json!({"metadata_created": 1})
    );
}

#[tokio::test]
async fn metadata_by_run_spans_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let first = seed(&store).await;
    let second = task_of(store.tasks().create(&first.step(), TaskDraft::default()).await).key();

    for task in [&first, &second] {
        let entry = MetadataDraft {
            field_name: Some("owner".into()),
            value: Some(task.to_string()),
            ..Default::default()
        };
        store.metadata().create(task, vec![entry]).await;
    }

    let env = store.metadata().get_all(&first.step().run(), None).await;
    assert_eq!(env.records().unwrap().len(), 2);
    let env = store.metadata().get(&second).await;
    assert_eq!(env.records().unwrap().len(), 1);
}

#[tokio::test]
async fn artifacts_round_trip_and_default_type() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let task = seed(&store).await;
    let key = task.artifact("model");

    let draft = ArtifactDraft {
        location: Some("s3://bucket/demo/1/start/1/model".into()),
        ds_type: Some("s3".into()),
        sha: Some("abc123".into()),
        content_type: Some("application/octet-stream".into()),
        size: Some(2048),
        ..Default::default()
    };
    let env = store.artifacts().create(&key, draft).await;
    assert_eq!(env.outcome, Outcome::Success);

    let env = store.artifacts().get(&key).await;
    let Some(Record::Artifact(artifact)) = env.record() else {
        panic!("expected an artifact, got {:?}", env);
    };
    assert_eq!(artifact.artifact_type, "object");
    assert_eq!(artifact.size, Some(2048));
    assert_eq!(artifact.location, "s3://bucket/demo/1/start/1/model");

    let env = store.artifacts().get_all(&task, None).await;
    assert_eq!(env.records().unwrap().len(), 1);
}

#[tokio::test]
async fn artifact_requires_location() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let task = seed(&store).await;

    let draft = ArtifactDraft {
        ds_type: Some("local".into()),
        sha: Some("abc".into()),
        ..Default::default()
    };
    let env = store.artifacts().create(&task.artifact("out"), draft).await;
    assert_eq!(env.outcome, Outcome::ValidationError);
    assert_eq!(env.diagnostic().unwrap().field.as_deref(), Some("location"));
}

#[tokio::test]
async fn since_filters_older_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let flow = FlowKey::new("demo");
    store.flows().create(&flow, FlowDraft::default()).await;

    let first = run_of(store.runs().create(&flow, RunDraft::default()).await);
    let second = run_of(store.runs().create(&flow, RunDraft::default()).await);
    assert!(second.ts_epoch > first.ts_epoch);

    let env = store.runs().get_all(&flow, Some(first.ts_epoch)).await;
    let records = env.records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].ts_epoch(), second.ts_epoch);
}

#[tokio::test]
async fn data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let task = {
        let store = open_store(&dir).await;
        let task = seed(&store).await;
        store.shutdown().await;
        task
    };

    let store = open_store(&dir).await;
    assert!(store.tasks().get(&task).await.is_success());
    let next = run_of(store.runs().create(&FlowKey::new("demo"), RunDraft::default()).await);
    assert_eq!(next.run_number, 2);
}

#[tokio::test]
async fn closed_pool_reports_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    store.shutdown().await;

    let env = store.flows().get(&FlowKey::new("demo")).await;
    assert_eq!(env.outcome, Outcome::StoreError);
    assert_eq!(env.http_status(), 503);
    assert!(env.diagnostic().unwrap().retryable);
}

#[tokio::test]
async fn timestamps_stay_ordered_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let ahead = {
        let store = open_store(&dir).await;
        store.flows().create(&FlowKey::new("early"), FlowDraft::default()).await;
        // Leave a stored timestamp an hour past the wall clock, as a burst of
        // same-millisecond writes would.
        let pool = store.connection().pool().unwrap();
        sqlx::query("UPDATE flows SET ts_epoch = ts_epoch + 3600000")
            .execute(pool)
            .await
            .unwrap();
        let env = store.flows().get(&FlowKey::new("early")).await;
        let ahead = env.record().unwrap().ts_epoch();
        store.shutdown().await;
        ahead
    };

    let store = open_store(&dir).await;
    let env = store.flows().create(&FlowKey::new("late"), FlowDraft::default()).await;
    assert!(env.record().unwrap().ts_epoch() > ahead);

    let env = store.flows().get_all(&(), Some(ahead)).await;
    let records = env.records().unwrap();
    assert_eq!(records.len(), 1);
    let Record::Flow(flow) = &records[0] else {
        panic!("expected a flow, got {:?}", records[0]);
    };
    assert_eq!(flow.flow_id, "late");
}

#[tokio::test]
async fn metadata_value_of_any_json_shape_is_stored_as_text() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let task = seed(&store).await;

    let batch: Vec<MetadataDraft> = serde_json::from_value(json!([
        {"field_name": "params", "value": {"lr": 0.1, "layers": [2, 4]}},
        {"field_name": "epochs", "value": 12}
    ]))
    .unwrap();
    let env = store.metadata().create(&task, batch).await;
    assert_eq!(
        serde_json::to_value(&env.body).unwrap(),
        json!({"metadata_created": 2})
    );

    let env = store.metadata().get(&task).await;
    let values: Vec<serde_json::Value> = env
        .records()
        .unwrap()
        .iter()
        .map(|r| match r {
            Record::Metadata(m) => serde_json::from_str(&m.value).unwrap(),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(values, vec![json!({"lr": 0.1, "layers": [2, 4]}), json!(12)]);
}

#[tokio::test]
async fn every_kind_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let flow = FlowKey::new("roundtrip");
    let draft = FlowDraft {
        user_name: Some("ada".into()),
        tags: Some(json!(["a"])),
        ..Default::default()
    };
    let created = store.flows().create(&flow, draft).await.into_record();
    assert!(created.is_some());
    assert_eq!(created, store.flows().get(&flow).await.into_record());

    let draft = RunDraft {
        system_tags: Some(json!({"runtime": "local"})),
        ..Default::default()
    };
    let run = run_of(store.runs().create(&flow, draft).await);
    let fetched = store.runs().get(&run.key()).await.into_record();
    assert_eq!(Some(Record::Run(run.clone())), fetched);

    let step = run.key().step("train");
    let created = store.steps().create(&step, StepDraft::default()).await.into_record();
    assert!(created.is_some());
    assert_eq!(created, store.steps().get(&step).await.into_record());

    let task = task_of(store.tasks().create(&step, TaskDraft::default()).await);
    let fetched = store.tasks().get(&task.key()).await.into_record();
    assert_eq!(Some(Record::Task(task.clone())), fetched);

    let artifact = task.key().artifact("model");
    let draft = ArtifactDraft {
        location: Some("/tmp/model.bin".into()),
        ds_type: Some("local".into()),
        sha: Some("f00d".into()),
        size: Some(64),
        ..Default::default()
    };
    let created = store.artifacts().create(&artifact, draft).await.into_record();
    assert!(created.is_some());
    assert_eq!(created, store.artifacts().get(&artifact).await.into_record());

    // Metadata creates report a count, so compare the stored entry to its draft.
    let entry = MetadataDraft {
        field_name: Some("loss".into()),
        value: Some("0.25".into()),
        metadata_type: Some("float".into()),
        user_name: Some("ada".into()),
        tags: Some(json!({"epoch": 3})),
        ..Default::default()
    };
    store.metadata().create(&task.key(), vec![entry]).await;
    let env = store.metadata().get(&task.key()).await;
    let [Record::Metadata(stored)] = env.records().unwrap() else {
        panic!("expected one metadata entry, got {:?}", env);
    };
    assert_eq!(
        (stored.field_name.as_str(), stored.value.as_str(), stored.metadata_type.as_str()),
        ("loss", "0.25", "float")
    );
    assert_eq!(stored.user_name.as_deref(), Some("ada"));
    assert_eq!(stored.tags, Some(json!({"epoch": 3})));
    assert_eq!(stored.task_id, task.task_id);
}

#[tokio::test]
async fn demo_flow_walkthrough() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let flow = FlowKey::new("demo");
    assert!(store.flows().create(&flow, FlowDraft::default()).await.is_success());

    let first = run_of(store.runs().create(&flow, RunDraft::default()).await);
    assert_eq!(first.run_number, 1);
    let second = run_of(store.runs().create(&flow, RunDraft::default()).await);
    assert_eq!(second.run_number, 2);

    let step = flow.run(1).step("start");
    assert!(store.steps().create(&step, StepDraft::default()).await.is_success());
    let task = task_of(store.tasks().create(&step, TaskDraft::default()).await);
    assert_eq!(task.task_id, 1);

    let entry = MetadataDraft {
        field_name: Some("acc".into()),
        value: Some("0.91".into()),
        ..Default::default()
    };
    let env = store.metadata().create(&task.key(), vec![entry]).await;
    assert_eq!(env.outcome, Outcome::Accepted);

    let env = store.metadata().get(&task.key()).await;
    let records = env.records().unwrap();
    assert_eq!(records.len(), 1);
    let Record::Metadata(acc) = &records[0] else {
        panic!("expected metadata, got {:?}", records[0]);
    };
    assert_eq!(acc.field_name, "acc");
    assert_eq!(acc.value, "0.91");
}
