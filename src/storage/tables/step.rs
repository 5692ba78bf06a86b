use async_trait::async_trait;
use tracing::{debug, info};

use crate::storage::envelope::Envelope;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::hierarchy::{self, Lineage, push_arg};
use crate::storage::tables::{
    EntityTable, TableContext, created, decode_tags, encode_tags, found, listed, require_name,
    since_clause,
};
use crate::storage::types::{EntityKind, RunKey, StepDraft, StepKey, StepRecord};

const COLUMNS: &str = "flow_id, run_number, step_name, user_name, tags, system_tags, ts_epoch";

#[derive(sqlx::FromRow)]
struct StepRow {
    flow_id: String,
    run_number: i64,
    step_name: String,
    user_name: Option<String>,
    tags: Option<String>,
    system_tags: Option<String>,
    ts_epoch: i64,
}

impl TryFrom<StepRow> for StepRecord {
    type Error = StoreError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(StepRecord {
            flow_id: row.flow_id,
            run_number: row.run_number,
            step_name: row.step_name,
            user_name: row.user_name,
            tags: decode_tags("tags", row.tags)?,
            system_tags: decode_tags("system_tags", row.system_tags)?,
            ts_epoch: row.ts_epoch,
        })
    }
}

/// Named stages of a run.
pub struct StepTable {
    ctx: TableContext,
}

impl StepTable {
    pub fn new(ctx: TableContext) -> Self {
        Self { ctx }
    }

    pub async fn find(&self, key: &StepKey) -> StoreResult<Option<StepRecord>> {
        let lineage = Lineage::from(key);
        let (filter, _) = lineage.filter();
        let sql = format!("SELECT {} FROM steps WHERE {}", COLUMNS, filter);

        let mut conn = self.ctx.db.acquire().await?;
        let row = sqlx::query_as_with::<_, StepRow, _>(&sql, lineage.arguments()?)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(StepRecord::try_from).transpose()
    }

    pub async fn list(&self, run: &RunKey, since: Option<i64>) -> StoreResult<Vec<StepRecord>> {
        let lineage = Lineage::from(run);
        let (mut filter, next) = lineage.filter();
        since_clause(&mut filter, next, since);
        let sql = format!(
            "SELECT {} FROM steps WHERE {} ORDER BY ts_epoch, step_name",
            COLUMNS, filter
        );
        let mut args = lineage.arguments()?;
        if let Some(since) = since {
            push_arg(&mut args, since)?;
        }

        let mut conn = self.ctx.db.acquire().await?;
        let rows = sqlx::query_as_with::<_, StepRow, _>(&sql, args)
            .fetch_all(&mut *conn)
            .await?;
        rows.into_iter().map(StepRecord::try_from).collect()
    }

    /// Register a step under its run. An existing step is returned as stored.
    pub async fn insert(&self, key: &StepKey, draft: StepDraft) -> StoreResult<StepRecord> {
        require_name("step_name", &key.step_name)?;
        let tags = encode_tags(&draft.tags)?;
        let system_tags = encode_tags(&draft.system_tags)?;

        let mut unit = self.ctx.db.begin().await?;
        hierarchy::resolve(unit.conn(), &Lineage::from(&key.run())).await?;

        let inserted = sqlx::query(
            "INSERT INTO steps (flow_id, run_number, step_name, user_name, tags, system_tags, ts_epoch)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (flow_id, run_number, step_name) DO NOTHING",
        )
        .bind(key.flow_id.as_str())
        .bind(key.run_number)
        .bind(key.step_name.as_str())
        .bind(draft.user_name)
        .bind(tags)
        .bind(system_tags)
        .bind(self.ctx.clock.now_millis())
        .execute(unit.conn())
        .await?;

        let lineage = Lineage::from(key);
        let (filter, _) = lineage.filter();
        let sql = format!("SELECT {} FROM steps WHERE {}", COLUMNS, filter);
        let row = sqlx::query_as_with::<_, StepRow, _>(&sql, lineage.arguments()?)
            .fetch_one(unit.conn())
            .await?;
        unit.commit().await?;

        if inserted.rows_affected() == 0 {
            debug!(step = %key, "Step already registered");
        } else {
            info!(step = %key, "Step registered");
        }
        row.try_into()
    }
}

#[async_trait]
impl EntityTable for StepTable {
    const KIND: EntityKind = EntityKind::Step;

    type Key = StepKey;
    type Scope = RunKey;
    type Target = StepKey;
    type Draft = StepDraft;

    async fn get(&self, key: &StepKey) -> Envelope {
        found(Self::KIND, key, self.find(key).await)
    }

    async fn get_all(&self, scope: &RunKey, since: Option<i64>) -> Envelope {
        listed(self.list(scope, since).await)
    }

    async fn create(&self, target: &StepKey, draft: StepDraft) -> Envelope {
        created(self.insert(target, draft).await)
    }
}
