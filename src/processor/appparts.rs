//! Deployed applications and reference-counted partition checkout.

use crate::core::{AppQName, PartitionId, ProcessorError, Result};
use crate::extension::ExecContext;
use crate::schema::{AppSchema, CommandDef};
use crate::storage::Storage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{Level, event};

/// Executes command extensions for one partition.
#[derive(Debug)]
pub struct ExtensionEngine {
    id: usize,
}

impl ExtensionEngine {
    fn new(id: usize) -> Self {
        Self { id }
    }

    pub(crate) fn invoke(&mut self, command: &CommandDef, ctx: &mut ExecContext<'_>) -> Result<()> {
        match &command.extension {
            Some(extension) => {
                event!(Level::TRACE, engine = self.id, command = %command.qname, "invoking extension");
                extension(ctx)
            }
            None => Ok(()),
        }
    }
}

/// Everything needed to deploy an application.
pub struct AppDeployment {
    pub app: AppQName,
    pub schema: Arc<AppSchema>,
    pub storage: Arc<dyn Storage>,
    pub partitions: Vec<PartitionId>,
    /// Extension engines per partition; zero keeps the partitions unavailable.
    pub engines_per_partition: usize,
}

impl AppDeployment {
    pub fn new(app: AppQName, schema: AppSchema, storage: Arc<dyn Storage>) -> Self {
        Self {
            app,
            schema: Arc::new(schema),
            storage,
            partitions: vec![0],
            engines_per_partition: 1,
        }
    }

    pub fn with_partitions(mut self, partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        self.partitions = partitions.into_iter().collect();
        self
    }

    pub fn with_engines(mut self, engines_per_partition: usize) -> Self {
        self.engines_per_partition = engines_per_partition;
        self
    }
}

struct PartitionRuntime {
    engines: Mutex<Vec<ExtensionEngine>>,
    borrows: AtomicUsize,
}

struct DeployedApp {
    schema: Arc<AppSchema>,
    storage: Arc<dyn Storage>,
    partitions: HashMap<PartitionId, Arc<PartitionRuntime>>,
}

/// Registry of deployed applications keyed by app and partition.
#[derive(Default)]
pub struct AppPartitions {
    apps: RwLock<HashMap<AppQName, Arc<DeployedApp>>>,
}

impl AppPartitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploys or redeploys an application.
    pub fn deploy(&self, deployment: AppDeployment) -> Result<()> {
        let partitions = deployment
            .partitions
            .iter()
            .map(|partition| {
                let engines = (0..deployment.engines_per_partition)
                    .map(ExtensionEngine::new)
                    .collect();
                let runtime = PartitionRuntime {
                    engines: Mutex::new(engines),
                    borrows: AtomicUsize::new(0),
                };
                (*partition, Arc::new(runtime))
            })
            .collect();

        let app = DeployedApp {
            schema: deployment.schema,
            storage: deployment.storage,
            partitions,
        };
        self.apps.write()?.insert(deployment.app, Arc::new(app));
        Ok(())
    }

    pub fn undeploy(&self, app: &AppQName) -> Result<bool> {
        Ok(self.apps.write()?.remove(app).is_some())
    }

    /// Checks out a partition; the returned guard releases it on drop.
    pub fn borrow(&self, app: &AppQName, partition: PartitionId) -> Result<BorrowedPartition> {
        let deployed = self
            .apps
            .read()?
            .get(app)
            .cloned()
            .ok_or_else(|| {
                ProcessorError::PartitionUnavailable(format!("application '{}' is not deployed", app))
            })?;
        let runtime = deployed.partitions.get(&partition).cloned().ok_or_else(|| {
            ProcessorError::PartitionUnavailable(format!(
                "partition {} of '{}' is not deployed",
                partition, app
            ))
        })?;

        let engine = runtime.engines.lock()?.pop().ok_or_else(|| {
            ProcessorError::PartitionUnavailable(format!(
                "no extension engine ready for partition {} of '{}'",
                partition, app
            ))
        })?;
        runtime.borrows.fetch_add(1, Ordering::SeqCst);

        Ok(BorrowedPartition {
            app: deployed,
            runtime,
            engine: Some(engine),
        })
    }

    /// Partitions currently checked out; zero once every borrow is released.
    pub fn borrowed_count(&self, app: &AppQName, partition: PartitionId) -> Result<usize> {
        let apps = self.apps.read()?;
        Ok(apps
            .get(app)
            .and_then(|deployed| deployed.partitions.get(&partition))
            .map(|runtime| runtime.borrows.load(Ordering::SeqCst))
            .unwrap_or(0))
    }
}

/// Exclusive handle on a partition's schema, storage and extension engine.
pub struct BorrowedPartition {
    app: Arc<DeployedApp>,
    runtime: Arc<PartitionRuntime>,
    engine: Option<ExtensionEngine>,
}

impl BorrowedPartition {
    pub fn schema(&self) -> &AppSchema {
        &self.app.schema
    }

    pub fn storage(&self) -> &dyn Storage {
        self.app.storage.as_ref()
    }

    pub(crate) fn shared_schema(&self) -> Arc<AppSchema> {
        Arc::clone(&self.app.schema)
    }

    pub(crate) fn shared_storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.app.storage)
    }

    pub(crate) fn invoke(&mut self, command: &CommandDef, ctx: &mut ExecContext<'_>) -> Result<()> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| ProcessorError::Internal("extension engine released".to_string()))?;
        engine.invoke(command, ctx)
    }
}

impl Drop for BorrowedPartition {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            if let Ok(mut engines) = self.runtime.engines.lock() {
                engines.push(engine);
            }
        }
        self.runtime.borrows.fetch_sub(1, Ordering::SeqCst);
    }
}
