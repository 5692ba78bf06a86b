use sqlx::AnyPool;
use tracing::debug;

use crate::storage::connection::Backend;
use crate::storage::error::StoreResult;

const FLOWS: &str = "CREATE TABLE IF NOT EXISTS flows (
    flow_id TEXT NOT NULL PRIMARY KEY,
    name TEXT NOT NULL,
    user_name TEXT,
    tags TEXT,
    system_tags TEXT,
    ts_epoch BIGINT NOT NULL
)";

const RUNS: &str = "CREATE TABLE IF NOT EXISTS runs (
    flow_id TEXT NOT NULL,
    run_number BIGINT NOT NULL,
    user_name TEXT,
    tags TEXT,
    system_tags TEXT,
    status TEXT NOT NULL CHECK (status IN ('created', 'running', 'completed', 'failed')),
    ts_epoch BIGINT NOT NULL,
    finished_at BIGINT,
    PRIMARY KEY (flow_id, run_number)
)";

const STEPS: &str = "CREATE TABLE IF NOT EXISTS steps (
    flow_id TEXT NOT NULL,
    run_number BIGINT NOT NULL,
    step_name TEXT NOT NULL,
    user_name TEXT,
    tags TEXT,
    system_tags TEXT,
    ts_epoch BIGINT NOT NULL,
    PRIMARY KEY (flow_id, run_number, step_name)
)";

const TASKS: &str = "CREATE TABLE IF NOT EXISTS tasks (
    flow_id TEXT NOT NULL,
    run_number BIGINT NOT NULL,
    step_name TEXT NOT NULL,
    task_id BIGINT NOT NULL,
    user_name TEXT,
    tags TEXT,
    system_tags TEXT,
    status TEXT NOT NULL CHECK (status IN ('created', 'running', 'completed', 'failed')),
    ts_epoch BIGINT NOT NULL,
    finished_at BIGINT,
    PRIMARY KEY (flow_id, run_number, step_name, task_id)
)";

const ARTIFACTS: &str = "CREATE TABLE IF NOT EXISTS artifacts (
    flow_id TEXT NOT NULL,
    run_number BIGINT NOT NULL,
    step_name TEXT NOT NULL,
    task_id BIGINT NOT NULL,
    artifact_name TEXT NOT NULL,
    location TEXT NOT NULL,
    ds_type TEXT NOT NULL,
    artifact_type TEXT NOT NULL,
    content_type TEXT,
    size BIGINT,
    sha TEXT NOT NULL,
    user_name TEXT,
    tags TEXT,
    system_tags TEXT,
    ts_epoch BIGINT NOT NULL,
    PRIMARY KEY (flow_id, run_number, step_name, task_id, artifact_name)
)";

const METADATA_INDEX: &str = "CREATE INDEX IF NOT EXISTS metadata_by_task
    ON metadata (flow_id, run_number, step_name, task_id)";

/// Metadata rows are keyed by a store-assigned surrogate so repeated field
/// names append instead of colliding.
fn metadata_table(backend: Backend) -> String {
    let id = match backend {
        Backend::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
        Backend::Postgres => "id BIGSERIAL PRIMARY KEY",
    };
    format!(
        "CREATE TABLE IF NOT EXISTS metadata (
    {id},
    flow_id TEXT NOT NULL,
    run_number BIGINT NOT NULL,
    step_name TEXT NOT NULL,
    task_id BIGINT NOT NULL,
    field_name TEXT NOT NULL,
    value TEXT NOT NULL,
    metadata_type TEXT NOT NULL,
    user_name TEXT,
    tags TEXT,
    system_tags TEXT,
    ts_epoch BIGINT NOT NULL
)"
    )
}

pub fn statements(backend: Backend) -> Vec<String> {
    vec![
        FLOWS.to_string(),
        RUNS.to_string(),
        STEPS.to_string(),
        TASKS.to_string(),
        metadata_table(backend),
        METADATA_INDEX.to_string(),
        ARTIFACTS.to_string(),
    ]
}

/// Create every table that does not exist yet.
pub async fn migrate(pool: &AnyPool, backend: Backend) -> StoreResult<()> {
    for statement in statements(backend) {
        sqlx::query(&statement).execute(pool).await?;
    }
    debug!(backend = %backend, "Schema ready");
    Ok(())
}

const LATEST_STAMP: &str = "SELECT COALESCE(MAX(ts), 0) FROM (
    SELECT MAX(ts_epoch) AS ts FROM flows
    UNION ALL SELECT MAX(ts_epoch) FROM runs
    UNION ALL SELECT MAX(finished_at) FROM runs
    UNION ALL SELECT MAX(ts_epoch) FROM steps
    UNION ALL SELECT MAX(ts_epoch) FROM tasks
    UNION ALL SELECT MAX(finished_at) FROM tasks
    UNION ALL SELECT MAX(ts_epoch) FROM metadata
    UNION ALL SELECT MAX(ts_epoch) FROM artifacts
) AS stamps";

/// Highest timestamp already written to any table, or 0 on an empty store.
pub async fn latest_timestamp(pool: &AnyPool) -> StoreResult<i64> {
    let latest: i64 = sqlx::query_scalar(LATEST_STAMP).fetch_one(pool).await?;
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_id_follows_backend() {
        assert!(metadata_table(Backend::Sqlite).contains("AUTOINCREMENT"));
        assert!(metadata_table(Backend::Postgres).contains("BIGSERIAL"));
    }

    #[test]
    fn index_follows_its_table() {
        let stmts = statements(Backend::Sqlite);
        let table = stmts.iter().position(|s| s.contains("TABLE IF NOT EXISTS metadata"));
        let index = stmts.iter().position(|s| s.contains("metadata_by_task"));
        assert!(table.unwrap() < index.unwrap());
    }
}
