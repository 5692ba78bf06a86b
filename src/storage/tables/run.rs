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
    EntityKind, ExecutionStatus, FlowKey, RunDraft, RunKey, RunRecord,
};

const COLUMNS: &str =
    "flow_id, run_number, user_name, tags, system_tags, status, ts_epoch, finished_at";

#[derive(sqlx::FromRow)]
struct RunRow {
    flow_id: String,
    run_number: i64,
    user_name: Option<String>,
    tags: Option<String>,
    system_tags: Option<String>,
    status: String,
    ts_epoch: i64,
    finished_at: Option<i64>,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(RunRecord {
            flow_id: row.flow_id,
            run_number: row.run_number,
            user_name: row.user_name,
            tags: decode_tags("tags", row.tags)?,
            system_tags: decode_tags("system_tags", row.system_tags)?,
            status: decode_status(&row.status)?,
            ts_epoch: row.ts_epoch,
            finished_at: row.finished_at,
        })
    }
}

/// Runs of a flow. Run numbers are assigned by the store, starting at 1 per flow.
pub struct RunTable {
    ctx: TableContext,
}

impl RunTable {
    pub fn new(ctx: TableContext) -> Self {
        Self { ctx }
    }

    pub async fn find(&self, key: &RunKey) -> StoreResult<Option<RunRecord>> {
        let lineage = Lineage::from(key);
        let (filter, _) = lineage.filter();
        let sql = format!("SELECT {} FROM runs WHERE {}", COLUMNS, filter);

        let mut conn = self.ctx.db.acquire().await?;
        let row = sqlx::query_as_with::<_, RunRow, _>(&sql, lineage.arguments()?)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(RunRecord::try_from).transpose()
    }

    pub async fn list(&self, flow: &FlowKey, since: Option<i64>) -> StoreResult<Vec<RunRecord>> {
        let lineage = Lineage::from(flow);
        let (mut filter, next) = lineage.filter();
        since_clause(&mut filter, next, since);
        let sql = format!(
            "SELECT {} FROM runs WHERE {} ORDER BY ts_epoch, run_number",
            COLUMNS, filter
        );
        let mut args = lineage.arguments()?;
        if let Some(since) = since {
            push_arg(&mut args, since)?;
        }

        let mut conn = self.ctx.db.acquire().await?;
        let rows = sqlx::query_as_with::<_, RunRow, _>(&sql, args)
            .fetch_all(&mut *conn)
            .await?;
        rows.into_iter().map(RunRecord::try_from).collect()
    }

    /// Allocate the next run number under `flow` and persist the run.
    ///
    /// Allocation for one flow is serialized by a scope lock and performed as a
    /// single `INSERT .. SELECT MAX + 1` inside the write unit.
    pub async fn insert(&self, flow: &FlowKey, draft: RunDraft) -> StoreResult<RunRecord> {
        let tags = encode_tags(&draft.tags)?;
        let system_tags = encode_tags(&draft.system_tags)?;

        let _scope = self.ctx.locks.lock(format!("runs:{}", flow.flow_id)).await;
        let mut unit = self.ctx.db.begin().await?;
        hierarchy::resolve(unit.conn(), &Lineage::from(flow)).await?;

        let sql = format!(
            "INSERT INTO runs (flow_id, run_number, user_name, tags, system_tags, status, ts_epoch)
             SELECT $1, COALESCE(MAX(run_number), 0) + 1, $2, $3, $4, $5, $6
             FROM runs WHERE flow_id = $1
             RETURNING {}",
            COLUMNS
        );
        let row = sqlx::query_as::<_, RunRow>(&sql)
            .bind(flow.flow_id.as_str())
            .bind(draft.user_name)
            .bind(tags)
            .bind(system_tags)
            .bind(ExecutionStatus::Created.as_str())
            .bind(self.ctx.clock.now_millis())
            .fetch_one(unit.conn())
            .await?;
        unit.commit().await?;

        info!(flow_id = %row.flow_id, run_number = row.run_number, "Run created");
        row.try_into()
    }

    pub async fn set_status(
        &self,
        key: &RunKey,
        status: ExecutionStatus,
    ) -> StoreResult<Option<RunRecord>> {
        let lineage = Lineage::from(key);
        let mut unit = self.ctx.db.begin().await?;
        if !transition(&mut unit, &self.ctx.clock, "runs", &lineage, status).await? {
            return Ok(None);
        }

        let (filter, _) = lineage.filter();
        let sql = format!("SELECT {} FROM runs WHERE {}", COLUMNS, filter);
        let row = sqlx::query_as_with::<_, RunRow, _>(&sql, lineage.arguments()?)
            .fetch_one(unit.conn())
            .await?;
        unit.commit().await?;

        info!(flow_id = %key.flow_id, run_number = key.run_number, status = %status, "Run status updated");
        RunRecord::try_from(row).map(Some)
    }
}

#[async_trait]
impl EntityTable for RunTable {
    const KIND: EntityKind = EntityKind::Run;

    type Key = RunKey;
    type Scope = FlowKey;
    type Target = FlowKey;
    type Draft = RunDraft;

    async fn get(&self, key: &RunKey) -> Envelope {
        found(Self::KIND, key, self.find(key).await)
    }

    async fn get_all(&self, scope: &FlowKey, since: Option<i64>) -> Envelope {
        listed(self.list(scope, since).await)
    }

    async fn create(&self, target: &FlowKey, draft: RunDraft) -> Envelope {
        created(self.insert(target, draft).await)
    }
}

#[async_trait]
impl StatusTable for RunTable {
    async fn update_status(&self, key: &RunKey, status: ExecutionStatus) -> Envelope {
        found(Self::KIND, key, self.set_status(key, status).await)
    }
}
