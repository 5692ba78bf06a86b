use async_trait::async_trait;
use tracing::{info, warn};

use crate::storage::envelope::Envelope;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::hierarchy::{self, Lineage, push_arg};
use crate::storage::tables::{
    EntityTable, TableContext, decode_tags, encode_tags, listed, required, since_clause,
};
use crate::storage::types::{EntityKind, MetadataDraft, MetadataRecord, RunKey, TaskKey};

const COLUMNS: &str = "id, flow_id, run_number, step_name, task_id, field_name, value, \
                       metadata_type, user_name, tags, system_tags, ts_epoch";

#[derive(sqlx::FromRow)]
struct MetadataRow {
    id: i64,
    flow_id: String,
    run_number: i64,
    step_name: String,
    task_id: i64,
    field_name: String,
    value: String,
    metadata_type: String,
    user_name: Option<String>,
    tags: Option<String>,
    system_tags: Option<String>,
    ts_epoch: i64,
}

impl TryFrom<MetadataRow> for MetadataRecord {
    type Error = StoreError;

    fn try_from(row: MetadataRow) -> Result<Self, Self::Error> {
        Ok(MetadataRecord {
            id: row.id,
            flow_id: row.flow_id,
            run_number: row.run_number,
            step_name: row.step_name,
            task_id: row.task_id,
            field_name: row.field_name,
            value: row.value,
            metadata_type: row.metadata_type,
            user_name: row.user_name,
            tags: decode_tags("tags", row.tags)?,
            system_tags: decode_tags("system_tags", row.system_tags)?,
            ts_epoch: row.ts_epoch,
        })
    }
}

/// A validated entry ready to be written.
struct MetadataEntry {
    field_name: String,
    value: String,
    metadata_type: String,
    user_name: Option<String>,
    tags: Option<String>,
    system_tags: Option<String>,
}

impl TryFrom<MetadataDraft> for MetadataEntry {
    type Error = StoreError;

    fn try_from(draft: MetadataDraft) -> Result<Self, Self::Error> {
        Ok(MetadataEntry {
            field_name: required("field_name", draft.field_name)?,
            value: draft
                .value
                .ok_or_else(|| StoreError::validation("value", "is required"))?,
            metadata_type: draft.metadata_type.unwrap_or_default(),
            user_name: draft.user_name,
            tags: encode_tags(&draft.tags)?,
            system_tags: encode_tags(&draft.system_tags)?,
        })
    }
}

/// Append-only key/value facts recorded against tasks.
///
/// Rows are never updated or deleted; a repeated field name adds a row.
pub struct MetadataTable {
    ctx: TableContext,
}

impl MetadataTable {
    pub fn new(ctx: TableContext) -> Self {
        Self { ctx }
    }

    /// Every entry under `lineage` (a task, or a whole run) in append order.
    pub async fn list(&self, lineage: &Lineage, since: Option<i64>) -> StoreResult<Vec<MetadataRecord>> {
        let (mut filter, next) = lineage.filter();
        since_clause(&mut filter, next, since);
        let sql = format!("SELECT {} FROM metadata WHERE {} ORDER BY id", COLUMNS, filter);
        let mut args = lineage.arguments()?;
        if let Some(since) = since {
            push_arg(&mut args, since)?;
        }

        let mut conn = self.ctx.db.acquire().await?;
        let rows = sqlx::query_as_with::<_, MetadataRow, _>(&sql, args)
            .fetch_all(&mut *conn)
            .await?;
        rows.into_iter().map(MetadataRecord::try_from).collect()
    }

    /// Append a batch of entries to `task` in one write unit.
    ///
    /// Entries that fail validation are skipped; the return value counts the
    /// entries persisted.
    pub async fn append(&self, task: &TaskKey, drafts: Vec<MetadataDraft>) -> StoreResult<usize> {
        let mut entries = Vec::with_capacity(drafts.len());
        for (index, draft) in drafts.into_iter().enumerate() {
            match MetadataEntry::try_from(draft) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(task = %task, index, error = %err, "Skipping metadata entry"),
            }
        }

        let mut unit = self.ctx.db.begin().await?;
        hierarchy::resolve(unit.conn(), &Lineage::from(task)).await?;

        for entry in &entries {
            sqlx::query(
                "INSERT INTO metadata (flow_id, run_number, step_name, task_id, field_name, \
                 value, metadata_type, user_name, tags, system_tags, ts_epoch)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(task.flow_id.as_str())
            .bind(task.run_number)
            .bind(task.step_name.as_str())
            .bind(task.task_id)
            .bind(entry.field_name.as_str())
            .bind(entry.value.as_str())
            .bind(entry.metadata_type.as_str())
            .bind(entry.user_name.clone())
            .bind(entry.tags.clone())
            .bind(entry.system_tags.clone())
            .bind(self.ctx.clock.now_millis())
            .execute(unit.conn())
            .await?;
        }
        unit.commit().await?;

        info!(task = %task, count = entries.len(), "Metadata appended");
        Ok(entries.len())
    }
}

#[async_trait]
impl EntityTable for MetadataTable {
    const KIND: EntityKind = EntityKind::Metadata;

    type Key = TaskKey;
    type Scope = RunKey;
    type Target = TaskKey;
    type Draft = Vec<MetadataDraft>;

    /// All entries recorded against one task.
    async fn get(&self, key: &TaskKey) -> Envelope {
        listed(self.list(&Lineage::from(key), None).await)
    }

    /// All entries recorded against any task of the run.
    async fn get_all(&self, scope: &RunKey, since: Option<i64>) -> Envelope {
        listed(self.list(&Lineage::from(scope), since).await)
    }

    async fn create(&self, target: &TaskKey, draft: Vec<MetadataDraft>) -> Envelope {
        match self.append(target, draft).await {
            Ok(count) => Envelope::metadata_created(count),
            Err(err) => Envelope::from_error(err),
        }
    }
}
