//! Top-level command processor owning the partition worker registry.

use super::appparts::AppPartitions;
use super::message::{CommandMessage, CommandRequest, CommandResponse};
use super::partition::PartitionStateSnapshot;
use super::pipeline::PipelineServices;
use super::policy::ProcessorPolicy;
use super::ratelimit::RateLimiter;
use super::worker::PartitionWorker;
use crate::auth::{AclAuthorizer, Authenticator, Authorizer, MapTokenService, TokenAuthenticator};
use crate::core::{AppQName, PartitionId, ProcessorError, Result};
use crate::notify::{NoopNotifier, Notifier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

type WorkerKey = (AppQName, PartitionId);

/// Lifetime counters shared by all workers of a processor.
#[derive(Debug, Default)]
pub(crate) struct ProcessorCounters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    busy: AtomicU64,
    cancelled: AtomicU64,
    extension_faults: AtomicU64,
    recoveries: AtomicU64,
}

impl ProcessorCounters {
    pub fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self, err: &ProcessorError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        match err {
            ProcessorError::Cancelled(_) => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            ProcessorError::ExtensionExecutionFault(_) => {
                self.extension_faults.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn busy(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recovered(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time processor statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStats {
    /// Partition workers currently running.
    pub workers: usize,
    /// Commands taken off a partition queue.
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Commands refused because the partition queue was full.
    pub busy: u64,
    pub cancelled: u64,
    pub extension_faults: u64,
    /// Partition recoveries, including forced restarts.
    pub recoveries: u64,
}

pub struct CommandProcessorBuilder {
    partitions: Arc<AppPartitions>,
    authenticator: Arc<dyn Authenticator>,
    authorizer: Arc<dyn Authorizer>,
    notifier: Arc<dyn Notifier>,
    policy: ProcessorPolicy,
}

impl CommandProcessorBuilder {
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn policy(mut self, policy: ProcessorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<CommandProcessor> {
        self.policy.validate()?;
        let services = PipelineServices {
            partitions: self.partitions,
            authenticator: self.authenticator,
            authorizer: self.authorizer,
            notifier: self.notifier,
            rate_limiter: RateLimiter::new(&self.policy.rate_limits),
            policy: self.policy,
            counters: ProcessorCounters::default(),
        };
        Ok(CommandProcessor {
            services: Arc::new(services),
            workers: Mutex::new(HashMap::new()),
        })
    }
}

/// Routes commands to one sequential worker per (application, partition).
///
/// Workers are spawned on first use, so the processor must be driven from
/// inside a tokio runtime.
pub struct CommandProcessor {
    services: Arc<PipelineServices>,
    workers: Mutex<HashMap<WorkerKey, Arc<PartitionWorker>>>,
}

impl CommandProcessor {
    /// Anonymous authentication, deny-all authorization and no notifications
    /// until configured otherwise.
    pub fn builder(partitions: Arc<AppPartitions>) -> CommandProcessorBuilder {
        CommandProcessorBuilder {
            partitions,
            authenticator: Arc::new(TokenAuthenticator::new(MapTokenService::new())),
            authorizer: Arc::new(AclAuthorizer::default()),
            notifier: Arc::new(NoopNotifier),
            policy: ProcessorPolicy::default(),
        }
    }

    pub fn partitions(&self) -> &AppPartitions {
        &self.services.partitions
    }

    pub fn policy(&self) -> &ProcessorPolicy {
        &self.services.policy
    }

    fn worker(&self, app: &AppQName, partition: PartitionId) -> Result<Arc<PartitionWorker>> {
        let mut workers = self.workers.lock()?;
        let key = (app.clone(), partition);
        if let Some(worker) = workers.get(&key).filter(|worker| worker.is_running()) {
            return Ok(Arc::clone(worker));
        }
        let worker = Arc::new(PartitionWorker::spawn(
            Arc::clone(&self.services),
            app.clone(),
            partition,
        ));
        workers.insert(key, Arc::clone(&worker));
        Ok(worker)
    }

    /// Queues a command for its partition; the reply arrives on
    /// `message.reply`. Fails immediately with `Busy` when the queue is full.
    pub fn submit(&self, message: CommandMessage) -> Result<()> {
        let worker = self.worker(&message.request.app, message.request.partition)?;
        worker.try_submit(message).inspect_err(|err| {
            if matches!(err, ProcessorError::Busy(_)) {
                self.services.counters.busy();
            }
        })
    }

    pub async fn execute(&self, request: CommandRequest) -> CommandResponse {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Runs a command to completion; `cancel` is honoured until the append.
    pub async fn execute_with_cancel(
        &self,
        request: CommandRequest,
        cancel: CancellationToken,
    ) -> CommandResponse {
        let (reply, rx) = oneshot::channel();
        let message = CommandMessage {
            request,
            reply,
            cancel,
        };
        if let Err(err) = self.submit(message) {
            return CommandResponse::failure(&err);
        }
        match rx.await {
            Ok(response) => response,
            Err(_) => CommandResponse::failure(&ProcessorError::PartitionUnavailable(
                "partition worker dropped the request".to_string(),
            )),
        }
    }

    /// Discards the partition's in-memory state and recovers it from the log.
    pub async fn restart_partition(
        &self,
        app: &AppQName,
        partition: PartitionId,
    ) -> Result<PartitionStateSnapshot> {
        let worker = self.worker(app, partition)?;
        worker.restart().await
    }

    /// Live state of a partition; `None` until its first request or after a
    /// fatal append.
    pub async fn partition_snapshot(
        &self,
        app: &AppQName,
        partition: PartitionId,
    ) -> Result<Option<PartitionStateSnapshot>> {
        let worker = self.worker(app, partition)?;
        worker.snapshot().await
    }

    pub fn stats(&self) -> Result<ProcessorStats> {
        let workers = self.workers.lock()?.len();
        let counters = &self.services.counters;
        Ok(ProcessorStats {
            workers,
            submitted: counters.submitted.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            busy: counters.busy.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            extension_faults: counters.extension_faults.load(Ordering::Relaxed),
            recoveries: counters.recoveries.load(Ordering::Relaxed),
        })
    }

    /// Stops every worker after its current command.
    pub async fn shutdown(&self) -> Result<()> {
        let workers = self.workers.lock()?.drain().collect::<Vec<_>>();
        let count = workers.len();
        for ((app, partition), worker) in workers {
            match Arc::try_unwrap(worker) {
                Ok(worker) => worker.stop().await?,
                // an in-flight call holds the last handle and stops it on drop
                Err(worker) => {
                    event!(Level::WARN, app = %app, partition, "partition worker still in use at shutdown");
                    drop(worker);
                }
            }
        }
        event!(Level::INFO, workers = count, "command processor shut down");
        Ok(())
    }
}
