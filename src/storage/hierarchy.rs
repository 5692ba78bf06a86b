//! Ancestor resolution and key-prefix filters.
//!
//! Every child key embeds its ancestors' keys, so a [`Lineage`] (the key prefix
//! down to some level) is enough both to check that the parent chain exists
//! and to select every record below that level.

use std::fmt;

use sqlx::any::AnyArguments;
use sqlx::encode::Encode;
use sqlx::{Any, AnyConnection, Arguments, Type};
use tracing::debug;

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::types::{EntityKind, FlowKey, RunKey, StepKey, TaskKey};

/// Key prefix naming one node of the flow → run → step → task tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lineage {
    flow_id: String,
    run_number: Option<i64>,
    step_name: Option<String>,
    task_id: Option<i64>,
}

impl Lineage {
    /// Deepest level named by this prefix.
    pub fn level(&self) -> EntityKind {
        if self.task_id.is_some() {
            EntityKind::Task
        } else if self.step_name.is_some() {
            EntityKind::Step
        } else if self.run_number.is_some() {
            EntityKind::Run
        } else {
            EntityKind::Flow
        }
    }

    /// The same prefix cut back to `level`.
    pub fn truncate(&self, level: EntityKind) -> Lineage {
        let depth = depth(level);
        Lineage {
            flow_id: self.flow_id.clone(),
            run_number: self.run_number.filter(|_| depth >= 2),
            step_name: self.step_name.clone().filter(|_| depth >= 3),
            task_id: self.task_id.filter(|_| depth >= 4),
        }
    }

    /// `WHERE` fragment matching every row under this prefix, using `$1..$n`.
    /// Returns the fragment and the next free placeholder index.
    pub fn filter(&self) -> (String, usize) {
        let mut clauses = vec!["flow_id = $1".to_string()];
        let mut next = 2;
        let columns = [
            ("run_number", self.run_number.is_some()),
            ("step_name", self.step_name.is_some()),
            ("task_id", self.task_id.is_some()),
        ];
        for (column, present) in columns {
            if present {
                clauses.push(format!("{} = ${}", column, next));
                next += 1;
            }
        }
        (clauses.join(" AND "), next)
    }

    /// Arguments for [`Lineage::filter`], in placeholder order.
    pub fn arguments<'q>(&self) -> StoreResult<AnyArguments<'q>> {
        let mut args = AnyArguments::default();
        push_arg(&mut args, self.flow_id.clone())?;
        if let Some(run_number) = self.run_number {
            push_arg(&mut args, run_number)?;
        }
        if let Some(step_name) = &self.step_name {
            push_arg(&mut args, step_name.clone())?;
        }
        if let Some(task_id) = self.task_id {
            push_arg(&mut args, task_id)?;
        }
        Ok(args)
    }
}

impl fmt::Display for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.flow_id)?;
        if let Some(run_number) = self.run_number {
            write!(f, "/{}", run_number)?;
        }
        if let Some(step_name) = &self.step_name {
            write!(f, "/{}", step_name)?;
        }
        if let Some(task_id) = self.task_id {
            write!(f, "/{}", task_id)?;
        }
        Ok(())
    }
}

fn depth(level: EntityKind) -> u8 {
    match level {
        EntityKind::Flow => 1,
        EntityKind::Run => 2,
        EntityKind::Step => 3,
        EntityKind::Task | EntityKind::Metadata | EntityKind::Artifact => 4,
    }
}

impl From<&FlowKey> for Lineage {
    fn from(key: &FlowKey) -> Self {
        Lineage {
            flow_id: key.flow_id.clone(),
            run_number: None,
            step_name: None,
            task_id: None,
        }
    }
}

impl From<&RunKey> for Lineage {
    fn from(key: &RunKey) -> Self {
        Lineage {
            flow_id: key.flow_id.clone(),
            run_number: Some(key.run_number),
            step_name: None,
            task_id: None,
        }
    }
}

impl From<&StepKey> for Lineage {
    fn from(key: &StepKey) -> Self {
        Lineage {
            flow_id: key.flow_id.clone(),
            run_number: Some(key.run_number),
            step_name: Some(key.step_name.clone()),
            task_id: None,
        }
    }
}

impl From<&TaskKey> for Lineage {
    fn from(key: &TaskKey) -> Self {
        Lineage {
            flow_id: key.flow_id.clone(),
            run_number: Some(key.run_number),
            step_name: Some(key.step_name.clone()),
            task_id: Some(key.task_id),
        }
    }
}

/// Append one bind value, surfacing encode failures as store errors.
pub(crate) fn push_arg<'q, T>(args: &mut AnyArguments<'q>, value: T) -> StoreResult<()>
where
    T: 'q + Encode<'q, Any> + Type<Any>,
{
    args.add(value)
        .map_err(|e| StoreError::Database(sqlx::Error::Encode(e)))
}

fn table_for(level: EntityKind) -> &'static str {
    match level {
        EntityKind::Flow => "flows",
        EntityKind::Run => "runs",
        EntityKind::Step => "steps",
        _ => "tasks",
    }
}

/// Confirm every level of `lineage` exists, shallow to deep.
///
/// Stops at the first missing level and reports it as
/// [`StoreError::MissingParent`].
pub async fn resolve(conn: &mut AnyConnection, lineage: &Lineage) -> StoreResult<()> {
    let levels = [
        EntityKind::Flow,
        EntityKind::Run,
        EntityKind::Step,
        EntityKind::Task,
    ];
    let target = depth(lineage.level());

    for level in levels.into_iter().filter(|l| depth(*l) <= target) {
        let prefix = lineage.truncate(level);
        let (filter, _) = prefix.filter();
        let sql = format!("SELECT 1 FROM {} WHERE {}", table_for(level), filter);
        let found = sqlx::query_with(&sql, prefix.arguments()?)
            .fetch_optional(&mut *conn)
            .await?;
        if found.is_none() {
            debug!(level = %level, key = %prefix, "Ancestor missing");
            return Err(StoreError::missing(level, prefix.to_string()));
        }
    }
    Ok(())
}
