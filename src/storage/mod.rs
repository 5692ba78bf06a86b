pub mod clock;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod hierarchy;
pub mod locks;
pub mod schema;
pub mod tables;
pub mod types;

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;

use clock::StoreClock;

pub use connection::{ConnectionManager, DatabaseConfig};
pub use envelope::{Body, Envelope, Outcome};
pub use error::{StoreError, StoreResult};
pub use tables::{
    ArtifactTable, EntityTable, FlowTable, MetadataTable, RunTable, StatusTable, StepTable,
    TableContext, TaskTable,
};

static INSTANCE: OnceCell<Arc<MetadataStore>> = OnceCell::const_new();

/// Handle to the connection manager and the six entity tables.
///
/// A store is only handed out after its pool is connected and migrated, so no
/// table can observe a half-built store. Build one with [`MetadataStore::open`]
/// and share it by `Arc`, or use [`MetadataStore::get_instance`] for the
/// process-wide one.
pub struct MetadataStore {
    db: Arc<ConnectionManager>,
    flows: FlowTable,
    runs: RunTable,
    steps: StepTable,
    tasks: TaskTable,
    metadata: MetadataTable,
    artifacts: ArtifactTable,
}

impl MetadataStore {
    /// Connect, migrate, and build the tables.
    ///
    /// The clock resumes past the newest stored timestamp so records written
    /// after a restart still sort after everything already on disk.
    pub async fn open(config: DatabaseConfig) -> StoreResult<Arc<Self>> {
        let db = Arc::new(ConnectionManager::new(config)?);
        db.initialize().await?;
        let floor = schema::latest_timestamp(db.pool()?).await?;
        Ok(Arc::new(Self::with_manager(db, StoreClock::resume(floor))))
    }

    /// The process-wide store, built on first call.
    ///
    /// Callers racing the first call wait for the same construction; `config`
    /// is ignored once the instance exists.
    pub async fn get_instance(config: &DatabaseConfig) -> StoreResult<Arc<Self>> {
        INSTANCE
            .get_or_try_init(|| Self::open(config.clone()))
            .await
            .cloned()
    }

    fn with_manager(db: Arc<ConnectionManager>, clock: StoreClock) -> Self {
        let ctx = TableContext::new(db.clone(), clock);
        info!(backend = %db.backend(), "Metadata store ready");
        Self {
            flows: FlowTable::new(ctx.clone()),
            runs: RunTable::new(ctx.clone()),
            steps: StepTable::new(ctx.clone()),
            tasks: TaskTable::new(ctx.clone()),
            metadata: MetadataTable::new(ctx.clone()),
            artifacts: ArtifactTable::new(ctx),
            db,
        }
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    pub fn runs(&self) -> &RunTable {
        &self.runs
    }

    pub fn steps(&self) -> &StepTable {
        &self.steps
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn metadata(&self) -> &MetadataTable {
        &self.metadata
    }

    pub fn artifacts(&self) -> &ArtifactTable {
        &self.artifacts
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.db
    }

    /// Drain in-flight work and release every connection.
    pub async fn shutdown(&self) {
        self.db.shutdown().await;
    }
}
