pub mod artifact;
pub mod flow;
pub mod metadata;
pub mod run;
pub mod step;
pub mod task;

use std::fmt::{Debug, Display};
use std::sync::Arc;

use async_trait::async_trait;

use crate::storage::clock::StoreClock;
use crate::storage::connection::{ConnectionManager, WriteUnit};
use crate::storage::envelope::Envelope;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::hierarchy::{Lineage, push_arg};
use crate::storage::locks::ScopeLocks;
use crate::storage::types::{EntityKind, ExecutionStatus, Record, Tags};

pub use artifact::ArtifactTable;
pub use flow::FlowTable;
pub use metadata::MetadataTable;
pub use run::RunTable;
pub use step::StepTable;
pub use task::TaskTable;

/// Operations every entity table exposes. All outcomes, including failures,
/// come back as an [`Envelope`].
#[async_trait]
pub trait EntityTable: Send + Sync {
    const KIND: EntityKind;

    /// Address of a point lookup.
    type Key: Debug + Display + Send + Sync;
    /// Parent address a range query lists under.
    type Scope: Debug + Send + Sync;
    /// Address a create is issued against: the parent when the store assigns
    /// the key, the full key when the caller names it.
    type Target: Debug + Send + Sync;
    type Draft: Send + 'static;

    async fn get(&self, key: &Self::Key) -> Envelope;

    /// Children of `scope` in creation order, optionally only those created
    /// after `since` (epoch ms).
    async fn get_all(&self, scope: &Self::Scope, since: Option<i64>) -> Envelope;

    async fn create(&self, target: &Self::Target, draft: Self::Draft) -> Envelope;
}

/// Tables whose records move through [`ExecutionStatus`].
#[async_trait]
pub trait StatusTable: EntityTable {
    async fn update_status(&self, key: &Self::Key, status: ExecutionStatus) -> Envelope;
}

/// Handles shared by all tables of one store.
#[derive(Clone)]
pub struct TableContext {
    pub(crate) db: Arc<ConnectionManager>,
    pub(crate) clock: Arc<StoreClock>,
    pub(crate) locks: Arc<ScopeLocks>,
}

impl TableContext {
    pub fn new(db: Arc<ConnectionManager>, clock: StoreClock) -> Self {
        Self {
            db,
            clock: Arc::new(clock),
            locks: Arc::new(ScopeLocks::new()),
        }
    }
}

pub(crate) fn found<R: Into<Record>>(
    kind: EntityKind,
    key: &impl Display,
    result: StoreResult<Option<R>>,
) -> Envelope {
    match result {
        Ok(Some(record)) => Envelope::found(record),
        Ok(None) => Envelope::not_found(kind, key),
        Err(err) => Envelope::from_error(err),
    }
}

pub(crate) fn listed<R: Into<Record>>(result: StoreResult<Vec<R>>) -> Envelope {
    match result {
        Ok(records) => Envelope::listed(records),
        Err(err) => Envelope::from_error(err),
    }
}

pub(crate) fn created<R: Into<Record>>(result: StoreResult<R>) -> Envelope {
    match result {
        Ok(record) => Envelope::found(record),
        Err(err) => Envelope::from_error(err),
    }
}

pub(crate) fn encode_tags(tags: &Option<Tags>) -> StoreResult<Option<String>> {
    tags.as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::validation("tags", e.to_string()))
}

pub(crate) fn decode_tags(column: &str, raw: Option<String>) -> StoreResult<Option<Tags>> {
    raw.map(|text| {
        serde_json::from_str(&text).map_err(|e| StoreError::Corrupt {
            column: column.to_string(),
            message: e.to_string(),
        })
    })
    .transpose()
}

pub(crate) fn decode_status(raw: &str) -> StoreResult<ExecutionStatus> {
    raw.parse().map_err(|message| StoreError::Corrupt {
        column: "status".to_string(),
        message,
    })
}

/// Reject empty caller-supplied names.
pub(crate) fn require_name(field: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::validation(field, "must not be empty"));
    }
    Ok(())
}

/// Unwrap a required attribute from a request payload.
pub(crate) fn required(field: &str, value: Option<String>) -> StoreResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(StoreError::validation(field, "is required")),
    }
}

/// Append the optional `since` bound to a filter.
pub(crate) fn since_clause(filter: &mut String, next: usize, since: Option<i64>) {
    if since.is_some() {
        filter.push_str(&format!(" AND ts_epoch > ${}", next));
    }
}

/// Move the row at `lineage` in `table` to `next` if the transition is allowed.
///
/// The update is conditional on the status just read, so a concurrent writer
/// that moved the row first turns this call into a validation error. Returns
/// `false` when the row does not exist.
pub(crate) async fn transition(
    unit: &mut WriteUnit<'_>,
    clock: &StoreClock,
    table: &str,
    lineage: &Lineage,
    next: ExecutionStatus,
) -> StoreResult<bool> {
    let (filter, n) = lineage.filter();
    let select = format!("SELECT status FROM {} WHERE {}", table, filter);
    let current = sqlx::query_scalar_with::<_, String, _>(&select, lineage.arguments()?)
        .fetch_optional(unit.conn())
        .await?;
    let Some(current) = current else {
        return Ok(false);
    };
    let current = decode_status(&current)?;

    if !current.can_transition_to(next) {
        return Err(StoreError::validation(
            "status",
            format!(
                "{} '{}' cannot move from {} to {}",
                lineage.level(),
                lineage,
                current,
                next
            ),
        ));
    }

    let finished_at = next.is_terminal().then(|| clock.now_millis());
    let update = format!(
        "UPDATE {} SET status = ${}, finished_at = ${} WHERE {} AND status = ${}",
        table,
        n,
        n + 1,
        filter,
        n + 2
    );
    let mut args = lineage.arguments()?;
    push_arg(&mut args, next.as_str())?;
    push_arg(&mut args, finished_at)?;
    push_arg(&mut args, current.as_str())?;

    let result = sqlx::query_with(&update, args).execute(unit.conn()).await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::validation(
            "status",
            format!("{} '{}' changed status concurrently", lineage.level(), lineage),
        ));
    }
    Ok(true)
}
