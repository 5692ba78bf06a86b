use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use crate::storage::types::{
    ArtifactDraft, FlowDraft, FlowKey, MetadataDraft, NodeDraft, RunKey, StatusUpdate, StepKey,
    TaskKey,
};
use crate::storage::{EntityTable, Envelope, StatusTable, StoreError};

use super::AppState;
use super::response::{parse_body, parse_number};

type Reply = Result<Envelope, Envelope>;

// --- Request/Response types ---

#[derive(Deserialize)]
pub struct ListQuery {
    /// Only records created after this epoch-millisecond timestamp. Kept as
    /// text so a malformed value is reported in an envelope.
    pub since: Option<String>,
}

impl ListQuery {
    fn since(&self) -> Result<Option<i64>, Envelope> {
        self.since
            .as_deref()
            .map(|raw| parse_number("since", raw))
            .transpose()
    }
}

#[derive(Serialize)]
pub struct PingResponse {
    pub status: String,
    pub version: String,
}

// --- Path helpers ---

fn run_key(flow_id: String, run_number: &str) -> Result<RunKey, Envelope> {
    Ok(RunKey::new(flow_id, parse_number("run_number", run_number)?))
}

fn step_key(flow_id: String, run_number: &str, step_name: String) -> Result<StepKey, Envelope> {
    Ok(run_key(flow_id, run_number)?.step(step_name))
}

fn task_key(
    flow_id: String,
    run_number: &str,
    step_name: String,
    task_id: &str,
) -> Result<TaskKey, Envelope> {
    Ok(step_key(flow_id, run_number, step_name)?.task(parse_number("task_id", task_id)?))
}

fn parse_status(body: &[u8]) -> Result<crate::storage::types::ExecutionStatus, Envelope> {
    let update: StatusUpdate = parse_body(body)?;
    let raw = update
        .status
        .ok_or_else(|| Envelope::from(StoreError::validation("status", "is required")))?;
    raw.parse()
        .map_err(|message: String| Envelope::from(StoreError::validation("status", message)))
}

// --- Handlers ---

/// GET /ping
pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /flows
pub async fn get_flows(State(state): State<Arc<AppState>>, Query(q): Query<ListQuery>) -> Reply {
    Ok(state.store.flows().get_all(&(), q.since()?).await)
}

/// GET /flows/{flow_id}
pub async fn get_flow(State(state): State<Arc<AppState>>, Path(flow_id): Path<String>) -> Envelope {
    state.store.flows().get(&FlowKey::new(flow_id)).await
}

/// POST /flows/{flow_id}
pub async fn create_flow(
    State(state): State<Arc<AppState>>,
    Path(flow_id): Path<String>,
    body: Bytes,
) -> Reply {
    let draft: FlowDraft = parse_body(&body)?;
    Ok(state.store.flows().create(&FlowKey::new(flow_id), draft).await)
}

/// GET /flows/{flow_id}/runs
pub async fn get_runs(
    State(state): State<Arc<AppState>>,
    Path(flow_id): Path<String>,
    Query(q): Query<ListQuery>,
) -> Reply {
    Ok(state.store.runs().get_all(&FlowKey::new(flow_id), q.since()?).await)
}

/// POST /flows/{flow_id}/run
pub async fn create_run(
    State(state): State<Arc<AppState>>,
    Path(flow_id): Path<String>,
    body: Bytes,
) -> Reply {
    let draft: NodeDraft = parse_body(&body)?;
    Ok(state.store.runs().create(&FlowKey::new(flow_id), draft).await)
}

/// GET /flows/{flow_id}/runs/{run_number}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number)): Path<(String, String)>,
) -> Reply {
    let key = run_key(flow_id, &run_number)?;
    Ok(state.store.runs().get(&key).await)
}

/// POST /flows/{flow_id}/runs/{run_number}/status
pub async fn update_run_status(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number)): Path<(String, String)>,
    body: Bytes,
) -> Reply {
    let key = run_key(flow_id, &run_number)?;
    let status = parse_status(&body)?;
    Ok(state.store.runs().update_status(&key, status).await)
}

/// GET /flows/{flow_id}/runs/{run_number}/metadata
pub async fn get_metadata_by_run(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number)): Path<(String, String)>,
    Query(q): Query<ListQuery>,
) -> Reply {
    let key = run_key(flow_id, &run_number)?;
    Ok(state.store.metadata().get_all(&key, q.since()?).await)
}

/// GET /flows/{flow_id}/runs/{run_number}/steps
pub async fn get_steps(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number)): Path<(String, String)>,
    Query(q): Query<ListQuery>,
) -> Reply {
    let key = run_key(flow_id, &run_number)?;
    Ok(state.store.steps().get_all(&key, q.since()?).await)
}

/// GET /flows/{flow_id}/runs/{run_number}/steps/{step_name}
pub async fn get_step(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number, step_name)): Path<(String, String, String)>,
) -> Reply {
    let key = step_key(flow_id, &run_number, step_name)?;
    Ok(state.store.steps().get(&key).await)
}

/// POST /flows/{flow_id}/runs/{run_number}/steps/{step_name}/step
pub async fn create_step(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number, step_name)): Path<(String, String, String)>,
    body: Bytes,
) -> Reply {
    let key = step_key(flow_id, &run_number, step_name)?;
    let draft: NodeDraft = parse_body(&body)?;
    Ok(state.store.steps().create(&key, draft).await)
}

/// GET /flows/{flow_id}/runs/{run_number}/steps/{step_name}/tasks
pub async fn get_tasks(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number, step_name)): Path<(String, String, String)>,
    Query(q): Query<ListQuery>,
) -> Reply {
    let key = step_key(flow_id, &run_number, step_name)?;
    Ok(state.store.tasks().get_all(&key, q.since()?).await)
}

/// POST /flows/{flow_id}/runs/{run_number}/steps/{step_name}/task
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number, step_name)): Path<(String, String, String)>,
    body: Bytes,
) -> Reply {
    let key = step_key(flow_id, &run_number, step_name)?;
    let draft: NodeDraft = parse_body(&body)?;
    Ok(state.store.tasks().create(&key, draft).await)
}

/// GET .../tasks/{task_id}
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number, step_name, task_id)): Path<(String, String, String, String)>,
) -> Reply {
    let key = task_key(flow_id, &run_number, step_name, &task_id)?;
    Ok(state.store.tasks().get(&key).await)
}

/// POST .../tasks/{task_id}/status
pub async fn update_task_status(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number, step_name, task_id)): Path<(String, String, String, String)>,
    body: Bytes,
) -> Reply {
    let key = task_key(flow_id, &run_number, step_name, &task_id)?;
    let status = parse_status(&body)?;
    Ok(state.store.tasks().update_status(&key, status).await)
}

/// GET .../tasks/{task_id}/metadata
pub async fn get_metadata(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number, step_name, task_id)): Path<(String, String, String, String)>,
) -> Reply {
    let key = task_key(flow_id, &run_number, step_name, &task_id)?;
    Ok(state.store.metadata().get(&key).await)
}

/// POST .../tasks/{task_id}/metadata
///
/// Body is an array of entries; the reply counts those persisted.
pub async fn create_metadata(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number, step_name, task_id)): Path<(String, String, String, String)>,
    body: Bytes,
) -> Reply {
    let key = task_key(flow_id, &run_number, step_name, &task_id)?;
    let entries: Vec<MetadataDraft> = parse_body(&body)?;
    Ok(state.store.metadata().create(&key, entries).await)
}

/// GET .../tasks/{task_id}/artifacts
pub async fn get_artifacts(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number, step_name, task_id)): Path<(String, String, String, String)>,
    Query(q): Query<ListQuery>,
) -> Reply {
    let key = task_key(flow_id, &run_number, step_name, &task_id)?;
    Ok(state.store.artifacts().get_all(&key, q.since()?).await)
}

/// GET .../tasks/{task_id}/artifacts/{artifact_name}
pub async fn get_artifact(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number, step_name, task_id, artifact_name)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
) -> Reply {
    let key = task_key(flow_id, &run_number, step_name, &task_id)?.artifact(artifact_name);
    Ok(state.store.artifacts().get(&key).await)
}

/// POST .../tasks/{task_id}/artifacts/{artifact_name}/artifact
pub async fn create_artifact(
    State(state): State<Arc<AppState>>,
    Path((flow_id, run_number, step_name, task_id, artifact_name)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
    body: Bytes,
) -> Reply {
    let key = task_key(flow_id, &run_number, step_name, &task_id)?.artifact(artifact_name);
    let draft: ArtifactDraft = parse_body(&body)?;
    Ok(state.store.artifacts().create(&key, draft).await)
}
