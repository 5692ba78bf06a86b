use async_trait::async_trait;
use tracing::info;

use crate::storage::envelope::Envelope;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::hierarchy::{self, Lineage, push_arg};
use crate::storage::tables::{
    EntityTable, StatusTable, TableContext, created, decode_status, decode_tags, encode_tags,
    found, listed, since_clause, transition,
};
use crate::storage::types::{
    EntityKind, ExecutionStatus, StepKey, TaskDraft, TaskKey, TaskRecord,
};

const COLUMNS: &str = "flow_id, run_number, step_name, task_id, user_name, tags, system_tags, \
                       status, ts_epoch, finished_at";

#[derive(sqlx::FromRow)]
struct TaskRow {
    flow_id: String,
    run_number: i64,
    step_name: String,
    task_id: i64,
    user_name: Option<String>,
    tags: Option<String>,
    system_tags: Option<String>,
    status: String,
    ts_epoch: i64,
    finished_at: Option<i64>,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(TaskRecord {
            flow_id: row.flow_id,
            run_number: row.run_number,
            step_name: row.step_name,
            task_id: row.task_id,
            user_name: row.user_name,
            tags: decode_tags("tags", row.tags)?,
            system_tags: decode_tags("system_tags", row.system_tags)?,
            status: decode_status(&row.status)?,
            ts_epoch: row.ts_epoch,
            finished_at: row.finished_at,
        })
    }
}

/// Tasks of a step. Task ids are assigned by the store, starting at 1 per step.
pub struct TaskTable {
    ctx: TableContext,
}

impl TaskTable {
    pub fn new(ctx: TableContext) -> Self {
        Self { ctx }
    }

    pub async fn find(&self, key: &TaskKey) -> StoreResult<Option<TaskRecord>> {
        let lineage = Lineage::from(key);
        let (filter, _) = lineage.filter();
        let sql = format!("SELECT {} FROM tasks WHERE {}", COLUMNS, filter);

        let mut conn = self.ctx.db.acquire().await?;
        let row = sqlx::query_as_with::<_, TaskRow, _>(&sql, lineage.arguments()?)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(TaskRecord::try_from).transpose()
    }

    pub async fn list(&self, step: &StepKey, since: Option<i64>) -> StoreResult<Vec<TaskRecord>> {
        let lineage = Lineage::from(step);
        let (mut filter, next) = lineage.filter();
        since_clause(&mut filter, next, since);
        let sql = format!(
            "SELECT {} FROM tasks WHERE {} ORDER BY ts_epoch, task_id",
            COLUMNS, filter
        );
        let mut args = lineage.arguments()?;
        if let Some(since) = since {
            push_arg(&mut args, since)?;
        }

        let mut conn = self.ctx.db.acquire().await?;
        let rows = sqlx::query_as_with::<_, TaskRow, _>(&sql, args)
            .fetch_all(&mut *conn)
            .await?;
        rows.into_iter().map(TaskRecord::try_from).collect()
    }

    /// Allocate the next task id under `step` and persist the task.
    pub async fn insert(&self, step: &StepKey, draft: TaskDraft) -> StoreResult<TaskRecord> {
        let tags = encode_tags(&draft.tags)?;
        let system_tags = encode_tags(&draft.system_tags)?;

        let _scope = self.ctx.locks.lock(format!("tasks:{}", step)).await;
        let mut unit = self.ctx.db.begin().await?;
        hierarchy::resolve(unit.conn(), &Lineage::from(step)).await?;

        let sql = format!(
            "INSERT INTO tasks (flow_id, run_number, step_name, task_id, user_name, tags, \
             system_tags, status, ts_epoch)
             SELECT $1, $2, $3, COALESCE(MAX(task_id), 0) + 1, $4, $5, $6, $7, $8
             FROM tasks WHERE flow_id = $1 AND run_number = $2 AND step_name = $3
             RETURNING {}",
            COLUMNS
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(step.flow_id.as_str())
            .bind(step.run_number)
            .bind(step.step_name.as_str())
            .bind(draft.user_name)
            .bind(tags)
            .bind(system_tags)
            .bind(ExecutionStatus::Created.as_str())
            .bind(self.ctx.clock.now_millis())
            .fetch_one(unit.conn())
            .await?;
        unit.commit().await?;

        info!(
            flow_id = %row.flow_id,
            run_number = row.run_number,
            step_name = %row.step_name,
            task_id = row.task_id,
            "Task created"
        );
        row.try_into()
    }

    pub async fn set_status(
        &self,
        key: &TaskKey,
        status: ExecutionStatus,
    ) -> StoreResult<Option<TaskRecord>> {
        let lineage = Lineage::from(key);
        let mut unit = self.ctx.db.begin().await?;
        if !transition(&mut unit, &self.ctx.clock, "tasks", &lineage, status).await? {
            return Ok(None);
        }

        let (filter, _) = lineage.filter();
        let sql = format!("SELECT {} FROM tasks WHERE {}", COLUMNS, filter);
        let row = sqlx::query_as_with::<_, TaskRow, _>(&sql, lineage.arguments()?)
            .fetch_one(unit.conn())
            .await?;
        unit.commit().await?;

        info!(task = %key, status = %status, "Task status updated");
        TaskRecord::try_from(row).map(Some)
    }
}

#[async_trait]
impl EntityTable for TaskTable {
    const KIND: EntityKind = EntityKind::Task;

    type Key = TaskKey;
    type Scope = StepKey;
    type Target = StepKey;
    type Draft = TaskDraft;

    async fn get(&self, key: &TaskKey) -> Envelope {
        found(Self::KIND, key, self.find(key).await)
    }

    async fn get_all(&self, scope: &StepKey, since: Option<i64>) -> Envelope {
        listed(self.list(scope, since).await)
    }

    async fn create(&self, target: &StepKey, draft: TaskDraft) -> Envelope {
        created(self.insert(target, draft).await)
    }
}

#[async_trait]
impl StatusTable for TaskTable {
    async fn update_status(&self, key: &TaskKey, status: ExecutionStatus) -> Envelope {
        found(Self::KIND, key, self.set_status(key, status).await)
    }
}
