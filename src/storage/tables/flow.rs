use async_trait::async_trait;
use tracing::{debug, info};

use crate::storage::envelope::Envelope;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::tables::{
    EntityTable, TableContext, created, decode_tags, encode_tags, found, listed, require_name,
};
use crate::storage::types::{EntityKind, FlowDraft, FlowKey, FlowRecord};

const COLUMNS: &str = "flow_id, name, user_name, tags, system_tags, ts_epoch";

#[derive(sqlx::FromRow)]
struct FlowRow {
    flow_id: String,
    name: String,
    user_name: Option<String>,
    tags: Option<String>,
    system_tags: Option<String>,
    ts_epoch: i64,
}

impl TryFrom<FlowRow> for FlowRecord {
    type Error = StoreError;

    fn try_from(row: FlowRow) -> Result<Self, Self::Error> {
        Ok(FlowRecord {
            flow_id: row.flow_id,
            name: row.name,
            user_name: row.user_name,
            tags: decode_tags("tags", row.tags)?,
            system_tags: decode_tags("system_tags", row.system_tags)?,
            ts_epoch: row.ts_epoch,
        })
    }
}

/// Root of the hierarchy. Flows are named by the caller.
pub struct FlowTable {
    ctx: TableContext,
}

impl FlowTable {
    pub fn new(ctx: TableContext) -> Self {
        Self { ctx }
    }

    pub async fn find(&self, key: &FlowKey) -> StoreResult<Option<FlowRecord>> {
        let mut conn = self.ctx.db.acquire().await?;
        let sql = format!("SELECT {} FROM flows WHERE flow_id = $1", COLUMNS);
        let row = sqlx::query_as::<_, FlowRow>(&sql)
            .bind(key.flow_id.as_str())
            .fetch_optional(&mut *conn)
            .await?;
        row.map(FlowRecord::try_from).transpose()
    }

    pub async fn list(&self, since: Option<i64>) -> StoreResult<Vec<FlowRecord>> {
        let mut conn = self.ctx.db.acquire().await?;
        let rows = match since {
            Some(since) => {
                let sql = format!(
                    "SELECT {} FROM flows WHERE ts_epoch > $1 ORDER BY ts_epoch, flow_id",
                    COLUMNS
                );
                sqlx::query_as::<_, FlowRow>(&sql)
                    .bind(since)
                    .fetch_all(&mut *conn)
                    .await?
            }
            None => {
                let sql = format!("SELECT {} FROM flows ORDER BY ts_epoch, flow_id", COLUMNS);
                sqlx::query_as::<_, FlowRow>(&sql).fetch_all(&mut *conn).await?
            }
        };
        rows.into_iter().map(FlowRecord::try_from).collect()
    }

    /// Register a flow. Registering an existing flow id returns the stored
    /// record untouched.
    pub async fn insert(&self, key: &FlowKey, draft: FlowDraft) -> StoreResult<FlowRecord> {
        require_name("flow_id", &key.flow_id)?;
        let name = draft
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| key.flow_id.clone());
        let tags = encode_tags(&draft.tags)?;
        let system_tags = encode_tags(&draft.system_tags)?;

        let mut unit = self.ctx.db.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO flows (flow_id, name, user_name, tags, system_tags, ts_epoch)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (flow_id) DO NOTHING",
        )
        .bind(key.flow_id.as_str())
        .bind(name)
        .bind(draft.user_name)
        .bind(tags)
        .bind(system_tags)
        .bind(self.ctx.clock.now_millis())
        .execute(unit.conn())
        .await?;

        let sql = format!("SELECT {} FROM flows WHERE flow_id = $1", COLUMNS);
        let row = sqlx::query_as::<_, FlowRow>(&sql)
            .bind(key.flow_id.as_str())
            .fetch_one(unit.conn())
            .await?;
        unit.commit().await?;

        if inserted.rows_affected() == 0 {
            debug!(flow_id = %key.flow_id, "Flow already registered");
        } else {
            info!(flow_id = %key.flow_id, "Flow registered");
        }
        row.try_into()
    }
}

#[async_trait]
impl EntityTable for FlowTable {
    const KIND: EntityKind = EntityKind::Flow;

    type Key = FlowKey;
    type Scope = ();
    type Target = FlowKey;
    type Draft = FlowDraft;

    async fn get(&self, key: &FlowKey) -> Envelope {
        found(Self::KIND, key, self.find(key).await)
    }

    async fn get_all(&self, _scope: &(), since: Option<i64>) -> Envelope {
        listed(self.list(since).await)
    }

    async fn create(&self, target: &FlowKey, draft: FlowDraft) -> Envelope {
        created(self.insert(target, draft).await)
    }
}
