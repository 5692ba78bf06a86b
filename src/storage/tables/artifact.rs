use async_trait::async_trait;
use tracing::{debug, info};

use crate::storage::envelope::Envelope;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::hierarchy::{self, Lineage, push_arg};
use crate::storage::tables::{
    EntityTable, TableContext, created, decode_tags, encode_tags, found, listed, require_name,
    required, since_clause,
};
use crate::storage::types::{ArtifactDraft, ArtifactKey, ArtifactRecord, EntityKind, TaskKey};

const COLUMNS: &str = "flow_id, run_number, step_name, task_id, artifact_name, location, \
                       ds_type, artifact_type, content_type, size, sha, user_name, tags, \
                       system_tags, ts_epoch";

/// Data type recorded when the producer does not name one.
const DEFAULT_ARTIFACT_TYPE: &str = "object";

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    flow_id: String,
    run_number: i64,
    step_name: String,
    task_id: i64,
    artifact_name: String,
    location: String,
    ds_type: String,
    artifact_type: String,
    content_type: Option<String>,
    size: Option<i64>,
    sha: String,
    user_name: Option<String>,
    tags: Option<String>,
    system_tags: Option<String>,
    ts_epoch: i64,
}

impl TryFrom<ArtifactRow> for ArtifactRecord {
    type Error = StoreError;

    fn try_from(row: ArtifactRow) -> Result<Self, Self::Error> {
        Ok(ArtifactRecord {
            flow_id: row.flow_id,
            run_number: row.run_number,
            step_name: row.step_name,
            task_id: row.task_id,
            artifact_name: row.artifact_name,
            location: row.location,
            ds_type: row.ds_type,
            artifact_type: row.artifact_type,
            content_type: row.content_type,
            size: row.size,
            sha: row.sha,
            user_name: row.user_name,
            tags: decode_tags("tags", row.tags)?,
            system_tags: decode_tags("system_tags", row.system_tags)?,
            ts_epoch: row.ts_epoch,
        })
    }
}

/// References to task outputs held in an external datastore.
pub struct ArtifactTable {
    ctx: TableContext,
}

impl ArtifactTable {
    pub fn new(ctx: TableContext) -> Self {
        Self { ctx }
    }

    async fn select_one(
        conn: &mut sqlx::AnyConnection,
        key: &ArtifactKey,
    ) -> StoreResult<Option<ArtifactRow>> {
        let lineage = Lineage::from(&key.task);
        let (filter, next) = lineage.filter();
        let sql = format!(
            "SELECT {} FROM artifacts WHERE {} AND artifact_name = ${}",
            COLUMNS, filter, next
        );
        let mut args = lineage.arguments()?;
        push_arg(&mut args, key.artifact_name.clone())?;

        let row = sqlx::query_as_with::<_, ArtifactRow, _>(&sql, args)
            .fetch_optional(conn)
            .await?;
        Ok(row)
    }

    pub async fn find(&self, key: &ArtifactKey) -> StoreResult<Option<ArtifactRecord>> {
        let mut conn = self.ctx.db.acquire().await?;
        Self::select_one(&mut conn, key)
            .await?
            .map(ArtifactRecord::try_from)
            .transpose()
    }

    pub async fn list(
        &self,
        task: &TaskKey,
        since: Option<i64>,
    ) -> StoreResult<Vec<ArtifactRecord>> {
        let lineage = Lineage::from(task);
        let (mut filter, next) = lineage.filter();
        since_clause(&mut filter, next, since);
        let sql = format!(
            "SELECT {} FROM artifacts WHERE {} ORDER BY ts_epoch, artifact_name",
            COLUMNS, filter
        );
        let mut args = lineage.arguments()?;
        if let Some(since) = since {
            push_arg(&mut args, since)?;
        }

        let mut conn = self.ctx.db.acquire().await?;
        let rows = sqlx::query_as_with::<_, ArtifactRow, _>(&sql, args)
            .fetch_all(&mut *conn)
            .await?;
        rows.into_iter().map(ArtifactRecord::try_from).collect()
    }

    /// Record an artifact produced by a task. An artifact already recorded
    /// under the same name is returned as stored.
    pub async fn insert(
        &self,
        key: &ArtifactKey,
        draft: ArtifactDraft,
    ) -> StoreResult<ArtifactRecord> {
        require_name("artifact_name", &key.artifact_name)?;
        let location = required("location", draft.location)?;
        let ds_type = required("ds_type", draft.ds_type)?;
        let sha = required("sha", draft.sha)?;
        if draft.size.is_some_and(|size| size < 0) {
            return Err(StoreError::validation("size", "must not be negative"));
        }
        let artifact_type = draft
            .artifact_type
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ARTIFACT_TYPE.to_string());
        let tags = encode_tags(&draft.tags)?;
        let system_tags = encode_tags(&draft.system_tags)?;

        let mut unit = self.ctx.db.begin().await?;
        hierarchy::resolve(unit.conn(), &Lineage::from(&key.task)).await?;

        let inserted = sqlx::query(
            "INSERT INTO artifacts (flow_id, run_number, step_name, task_id, artifact_name, \
             location, ds_type, artifact_type, content_type, size, sha, user_name, tags, \
             system_tags, ts_epoch)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
             ON CONFLICT (flow_id, run_number, step_name, task_id, artifact_name) DO NOTHING",
        )
        .bind(key.task.flow_id.as_str())
        .bind(key.task.run_number)
        .bind(key.task.step_name.as_str())
        .bind(key.task.task_id)
        .bind(key.artifact_name.as_str())
        .bind(location)
        .bind(ds_type)
        .bind(artifact_type)
        .bind(draft.content_type)
        .bind(draft.size)
        .bind(sha)
        .bind(draft.user_name)
        .bind(tags)
        .bind(system_tags)
        .bind(self.ctx.clock.now_millis())
        .execute(unit.conn())
        .await?;

        let row = Self::select_one(unit.conn(), key)
            .await?
            .ok_or_else(|| StoreError::Corrupt {
                column: "artifact_name".to_string(),
                message: format!("artifact '{}' vanished inside its write unit", key),
            })?;
        unit.commit().await?;

        if inserted.rows_affected() == 0 {
            debug!(artifact = %key, "Artifact already recorded");
        } else {
            info!(artifact = %key, "Artifact recorded");
        }
        row.try_into()
    }
}

#[async_trait]
impl EntityTable for ArtifactTable {
    const KIND: EntityKind = EntityKind::Artifact;

    type Key = ArtifactKey;
    type Scope = TaskKey;
    type Target = ArtifactKey;
    type Draft = ArtifactDraft;

    async fn get(&self, key: &ArtifactKey) -> Envelope {
        found(Self::KIND, key, self.find(key).await)
    }

    async fn get_all(&self, scope: &TaskKey, since: Option<i64>) -> Envelope {
        listed(self.list(scope, since).await)
    }

    async fn create(&self, target: &ArtifactKey, draft: ArtifactDraft) -> Envelope {
        created(self.insert(target, draft).await)
    }
}
