use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque tag payload. Stored verbatim as JSON text and never interpreted.
pub type Tags = serde_json::Value;

/// The six record kinds held by the store, shallowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Flow,
    Run,
    Step,
    Task,
    Metadata,
    Artifact,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Flow => write!(f, "flow"),
            EntityKind::Run => write!(f, "run"),
            EntityKind::Step => write!(f, "step"),
            EntityKind::Task => write!(f, "task"),
            EntityKind::Metadata => write!(f, "metadata"),
            EntityKind::Artifact => write!(f, "artifact"),
        }
    }
}

/// Execution status of a run or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 4] = [
        ExecutionStatus::Created,
        ExecutionStatus::Running,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Created => "created",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    /// Allowed moves: created → running → completed|failed, and created → failed.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (ExecutionStatus::Created, ExecutionStatus::Running)
                | (ExecutionStatus::Created, ExecutionStatus::Failed)
                | (ExecutionStatus::Running, ExecutionStatus::Completed)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ExecutionStatus::Created),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            _ => Err(format!(
                "Invalid status '{}'. Use: created, running, completed, failed",
                s
            )),
        }
    }
}

// --- Keys ---

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub flow_id: String,
}

impl FlowKey {
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
        }
    }

    pub fn run(&self, run_number: i64) -> RunKey {
        RunKey {
            flow_id: self.flow_id.clone(),
            run_number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub flow_id: String,
    pub run_number: i64,
}

impl RunKey {
    pub fn new(flow_id: impl Into<String>, run_number: i64) -> Self {
        Self {
            flow_id: flow_id.into(),
            run_number,
        }
    }

    pub fn flow(&self) -> FlowKey {
        FlowKey::new(self.flow_id.clone())
    }

    pub fn step(&self, step_name: impl Into<String>) -> StepKey {
        StepKey {
            flow_id: self.flow_id.clone(),
            run_number: self.run_number,
            step_name: step_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepKey {
    pub flow_id: String,
    pub run_number: i64,
    pub step_name: String,
}

impl StepKey {
    pub fn new(flow_id: impl Into<String>, run_number: i64, step_name: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            run_number,
            step_name: step_name.into(),
        }
    }

    pub fn run(&self) -> RunKey {
        RunKey::new(self.flow_id.clone(), self.run_number)
    }

    pub fn task(&self, task_id: i64) -> TaskKey {
        TaskKey {
            flow_id: self.flow_id.clone(),
            run_number: self.run_number,
            step_name: self.step_name.clone(),
            task_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub flow_id: String,
    pub run_number: i64,
    pub step_name: String,
    pub task_id: i64,
}

impl TaskKey {
    pub fn new(
        flow_id: impl Into<String>,
        run_number: i64,
        step_name: impl Into<String>,
        task_id: i64,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            run_number,
            step_name: step_name.into(),
            task_id,
        }
    }

    pub fn step(&self) -> StepKey {
        StepKey::new(self.flow_id.clone(), self.run_number, self.step_name.clone())
    }

    pub fn artifact(&self, artifact_name: impl Into<String>) -> ArtifactKey {
        ArtifactKey {
            task: self.clone(),
            artifact_name: artifact_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    #[serde(flatten)]
    pub task: TaskKey,
    pub artifact_name: String,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.flow_id)
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.flow_id, self.run_number)
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.flow_id, self.run_number, self.step_name)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.flow_id, self.run_number, self.step_name, self.task_id
        )
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task, self.artifact_name)
    }
}

// --- Records ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub flow_id: String,
    pub name: String,
    pub user_name: Option<String>,
    pub tags: Option<Tags>,
    pub system_tags: Option<Tags>,
    pub ts_epoch: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub flow_id: String,
    pub run_number: i64,
    pub user_name: Option<String>,
    pub tags: Option<Tags>,
    pub system_tags: Option<Tags>,
    pub status: ExecutionStatus,
    pub ts_epoch: i64,
    pub finished_at: Option<i64>,
}

impl RunRecord {
    pub fn key(&self) -> RunKey {
        RunKey::new(self.flow_id.clone(), self.run_number)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub flow_id: String,
    pub run_number: i64,
    pub step_name: String,
    pub user_name: Option<String>,
    pub tags: Option<Tags>,
    pub system_tags: Option<Tags>,
    pub ts_epoch: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub flow_id: String,
    pub run_number: i64,
    pub step_name: String,
    pub task_id: i64,
    pub user_name: Option<String>,
    pub tags: Option<Tags>,
    pub system_tags: Option<Tags>,
    pub status: ExecutionStatus,
    pub ts_epoch: i64,
    pub finished_at: Option<i64>,
}

impl TaskRecord {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(
            self.flow_id.clone(),
            self.run_number,
            self.step_name.clone(),
            self.task_id,
        )
    }
}

/// One appended metadata fact. `id` orders entries within the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub id: i64,
    pub flow_id: String,
    pub run_number: i64,
    pub step_name: String,
    pub task_id: i64,
    pub field_name: String,
    pub value: String,
    #[serde(rename = "type")]
    pub metadata_type: String,
    pub user_name: Option<String>,
    pub tags: Option<Tags>,
    pub system_tags: Option<Tags>,
    pub ts_epoch: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub flow_id: String,
    pub run_number: i64,
    pub step_name: String,
    pub task_id: i64,
    pub artifact_name: String,
    pub location: String,
    pub ds_type: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub content_type: Option<String>,
    pub size: Option<i64>,
    pub sha: String,
    pub user_name: Option<String>,
    pub tags: Option<Tags>,
    pub system_tags: Option<Tags>,
    pub ts_epoch: i64,
}

/// Tagged union over the six record shapes carried by an envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Record {
    Flow(FlowRecord),
    Run(RunRecord),
    Step(StepRecord),
    Task(TaskRecord),
    Metadata(MetadataRecord),
    Artifact(ArtifactRecord),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Record::Flow(_) => EntityKind::Flow,
            Record::Run(_) => EntityKind::Run,
            Record::Step(_) => EntityKind::Step,
            Record::Task(_) => EntityKind::Task,
            Record::Metadata(_) => EntityKind::Metadata,
            Record::Artifact(_) => EntityKind::Artifact,
        }
    }

    pub fn ts_epoch(&self) -> i64 {
        match self {
            Record::Flow(r) => r.ts_epoch,
            Record::Run(r) => r.ts_epoch,
            Record::Step(r) => r.ts_epoch,
            Record::Task(r) => r.ts_epoch,
            Record::Metadata(r) => r.ts_epoch,
            Record::Artifact(r) => r.ts_epoch,
        }
    }
}

macro_rules! record_from {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Record {
                fn from(record: $ty) -> Self {
                    Record::$variant(record)
                }
            }
        )*
    };
}

record_from! {
    Flow => FlowRecord,
    Run => RunRecord,
    Step => StepRecord,
    Task => TaskRecord,
    Metadata => MetadataRecord,
    Artifact => ArtifactRecord,
}

// --- Request payloads ---

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FlowDraft {
    /// Display name; defaults to the flow id.
    pub name: Option<String>,
    pub user_name: Option<String>,
    pub tags: Option<Tags>,
    pub system_tags: Option<Tags>,
}

/// Attributes shared by runs, steps and tasks.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeDraft {
    pub user_name: Option<String>,
    pub tags: Option<Tags>,
    pub system_tags: Option<Tags>,
}

pub type RunDraft = NodeDraft;
pub type StepDraft = NodeDraft;
pub type TaskDraft = NodeDraft;

/// One entry of a metadata batch.
///
/// Decoding never fails on a single entry: a non-string `value` is kept as its
/// JSON text, and fields of the wrong shape are dropped so the entry is judged
/// (and possibly skipped) on its own when the batch is appended.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "serde_json::Value")]
pub struct MetadataDraft {
    pub field_name: Option<String>,
    pub value: Option<String>,
    pub metadata_type: Option<String>,
    pub user_name: Option<String>,
    pub tags: Option<Tags>,
    pub system_tags: Option<Tags>,
}

impl From<serde_json::Value> for MetadataDraft {
    fn from(entry: serde_json::Value) -> Self {
        use serde_json::Value;

        let text = |key: &str| entry.get(key).and_then(Value::as_str).map(str::to_string);
        let tags = |key: &str| entry.get(key).filter(|v| !v.is_null()).cloned();
        let value = match entry.get("value") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        };
        Self {
            field_name: text("field_name"),
            value,
            metadata_type: text("type"),
            user_name: text("user_name"),
            tags: tags("tags"),
            system_tags: tags("system_tags"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArtifactDraft {
    pub location: Option<String>,
    pub ds_type: Option<String>,
    #[serde(rename = "type")]
    pub artifact_type: Option<String>,
    pub content_type: Option<String>,
    pub size: Option<i64>,
    pub sha: Option<String>,
    pub user_name: Option<String>,
    pub tags: Option<Tags>,
    pub system_tags: Option<Tags>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatusUpdate {
    pub status: Option<String>,
}
