//! One sequential worker task per (application, partition).

use super::message::{CommandMessage, CommandResponse};
use super::partition::{PartitionState, PartitionStateSnapshot};
use super::pipeline::{CancelCheck, PipelineServices, process};
use super::recovery::recover_partition;
use crate::core::{AppQName, PartitionId, ProcessorError, Result};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

pub(crate) enum WorkerMessage {
    Command(CommandMessage),
    /// Drops the in-memory state and recovers it from the log.
    Restart(oneshot::Sender<Result<PartitionStateSnapshot>>),
    Snapshot(oneshot::Sender<Option<PartitionStateSnapshot>>),
}

/// Handle on a running partition worker.
pub(crate) struct PartitionWorker {
    tx: mpsc::Sender<WorkerMessage>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    pub fn spawn(services: Arc<PipelineServices>, app: AppQName, partition: PartitionId) -> Self {
        let (tx, rx) = mpsc::channel(services.policy.queue.capacity.max(1));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let worker = WorkerLoop {
            services,
            app,
            partition,
            state: None,
        };
        let join_handle = tokio::spawn(worker.run(rx, stop_rx));
        Self {
            tx,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    /// Queues a command without waiting; a full queue answers `Busy`.
    pub fn try_submit(&self, message: CommandMessage) -> Result<()> {
        self.tx
            .try_send(WorkerMessage::Command(message))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    ProcessorError::Busy("partition queue is full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    ProcessorError::PartitionUnavailable("partition worker stopped".to_string())
                }
            })
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    pub async fn restart(&self) -> Result<PartitionStateSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.control(WorkerMessage::Restart(reply)).await?;
        rx.await.map_err(|_| worker_gone())?
    }

    pub async fn snapshot(&self) -> Result<Option<PartitionStateSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.control(WorkerMessage::Snapshot(reply)).await?;
        rx.await.map_err(|_| worker_gone())
    }

    async fn control(&self, message: WorkerMessage) -> Result<()> {
        self.tx.send(message).await.map_err(|_| worker_gone())
    }

    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| ProcessorError::Internal(format!("partition worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for PartitionWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

fn worker_gone() -> ProcessorError {
    ProcessorError::PartitionUnavailable("partition worker stopped".to_string())
}

struct WorkerLoop {
    services: Arc<PipelineServices>,
    app: AppQName,
    partition: PartitionId,
    state: Option<PartitionState>,
}

impl WorkerLoop {
    async fn run(mut self, mut rx: mpsc::Receiver<WorkerMessage>, mut stop_rx: oneshot::Receiver<()>) {
        event!(Level::DEBUG, app = %self.app, partition = self.partition, "partition worker started");
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                message = rx.recv() => {
                    match message {
                        Some(WorkerMessage::Command(message)) => self.handle_command(message).await,
                        Some(WorkerMessage::Restart(reply)) => {
                            let _ = reply.send(self.restart().await);
                        }
                        Some(WorkerMessage::Snapshot(reply)) => {
                            let _ = reply.send(self.state.as_ref().map(PartitionState::snapshot));
                        }
                        None => break,
                    }
                }
            }
        }
        event!(Level::DEBUG, app = %self.app, partition = self.partition, "partition worker stopped");
    }

    /// Runs one command behind the worker's fault boundary.
    async fn handle_command(&mut self, message: CommandMessage) {
        let CommandMessage {
            request,
            reply,
            cancel,
        } = message;
        let span = info_span!(
            "processor.command",
            request_id = %Uuid::new_v4(),
            app = %request.app,
            partition = request.partition,
            workspace = request.workspace,
            command = %request.command
        );
        let counters = &self.services.counters;
        counters.submitted();

        let outcome = {
            let check = CancelCheck::new(&cancel, &reply);
            AssertUnwindSafe(process(&self.services, &mut self.state, &request, &check))
                .catch_unwind()
                .instrument(span.clone())
                .await
        };

        let response = match outcome {
            Ok(Ok(response)) => {
                counters.succeeded();
                response
            }
            Ok(Err(err)) => {
                counters.failed(&err);
                CommandResponse::failure(&err)
            }
            Err(panic) => {
                let err = ProcessorError::ExtensionExecutionFault(panic_message(panic.as_ref()));
                span.in_scope(|| event!(Level::ERROR, error = %err, "command panicked"));
                counters.failed(&err);
                CommandResponse::failure(&err)
            }
        };
        if reply.send(response).is_err() {
            span.in_scope(|| event!(Level::DEBUG, "caller left before the reply"));
        }
    }

    async fn restart(&mut self) -> Result<PartitionStateSnapshot> {
        self.state = None;
        let borrowed = self.services.partitions.borrow(&self.app, self.partition)?;
        let state = recover_partition(
            borrowed.schema(),
            borrowed.storage(),
            self.partition,
            self.services.policy.recovery.reapply,
        )
        .await?;
        drop(borrowed);

        self.services.counters.recovered();
        let snapshot = state.snapshot();
        self.state = Some(state);
        event!(
            Level::INFO,
            app = %self.app,
            partition = self.partition,
            next_plog_offset = snapshot.next_plog_offset,
            "partition restarted"
        );
        Ok(snapshot)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
