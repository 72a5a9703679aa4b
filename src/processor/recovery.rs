//! Rebuilding partition state from the PLog.

use super::partition::PartitionState;
use super::policy::RecoveryReapplyMode;
use super::projection::apply_sync_projections;
use crate::core::{FIRST_OFFSET, Offset, PartitionId, ProcessorError, Result};
use crate::event::{CommittedEvent, RawEvent};
use crate::schema::AppSchema;
use crate::storage::{EventLog, Storage, ViewStore};
use tracing::{Level, event};

/// Seeds offsets and ID counters from one replayed event.
pub(crate) fn apply_replayed_event(state: &mut PartitionState, raw: &RawEvent) {
    state.next_plog_offset = state.next_plog_offset.max(raw.plog_offset + 1);

    let workspace = state.workspace_mut(raw.workspace);
    workspace.next_wlog_offset = raw.wlog_offset + 1;
    for id in raw.created_ids() {
        workspace.ids.update_on_sync(id);
    }
    if let Some(args) = &raw.args {
        args.walk(&mut |element| {
            if let Some(id) = element.id {
                workspace.ids.update_on_sync(id);
            }
        });
    }
}

/// Replays a whole partition log into a fresh state.
///
/// `keep` selects events the caller wants back, in log order.
pub(crate) async fn replay_partition<L>(
    log: &L,
    partition: PartitionId,
    mut keep: impl FnMut(&CommittedEvent) -> bool + Send,
) -> Result<(PartitionState, Vec<CommittedEvent>)>
where
    L: EventLog + ?Sized,
{
    let mut state = PartitionState::new(partition);
    let mut kept = Vec::new();
    let mut sink = |committed: CommittedEvent| {
        apply_replayed_event(&mut state, &committed);
        if keep(&committed) {
            kept.push(committed);
        }
        Ok::<(), ProcessorError>(())
    };
    log.read_plog(partition, FIRST_OFFSET, None, &mut sink)
        .await
        .map_err(|err| {
            ProcessorError::PartitionRecoveryFailed(format!(
                "partition {} replay: {}",
                partition, err
            ))
        })?;
    Ok((state, kept))
}

/// Rebuilds partition state without touching projections.
pub async fn replay_partition_state<L>(log: &L, partition: PartitionId) -> Result<PartitionState>
where
    L: EventLog + ?Sized,
{
    let (state, _) = replay_partition(log, partition, |_| false).await?;
    Ok(state)
}

/// Restores partition state and repairs trailing sync projections.
pub async fn recover_partition(
    schema: &AppSchema,
    storage: &dyn Storage,
    partition: PartitionId,
    mode: RecoveryReapplyMode,
) -> Result<PartitionState> {
    let (state, tail) = match mode {
        RecoveryReapplyMode::LastEvent => {
            let mut last: Option<CommittedEvent> = None;
            let (state, _) = replay_partition(storage, partition, |committed| {
                last = Some(committed.clone());
                false
            })
            .await?;
            (state, last.into_iter().collect::<Vec<_>>())
        }
        RecoveryReapplyMode::UnprojectedTail => {
            let watermark = lowest_projector_offset(schema, storage, partition)?;
            replay_partition(storage, partition, |committed| {
                committed.plog_offset > watermark
                    && schema.projectors_for(committed).next().is_some()
            })
            .await?
        }
    };

    let mut reapplied = 0usize;
    for committed in &tail {
        match apply_sync_projections(schema, storage, committed).await {
            Ok(applied) => reapplied += applied,
            Err(err) => {
                event!(
                    Level::WARN,
                    partition,
                    plog_offset = committed.plog_offset,
                    error = %err,
                    "projection re-application failed during recovery"
                );
                break;
            }
        }
    }

    event!(
        Level::INFO,
        partition,
        next_plog_offset = state.next_plog_offset(),
        reapplied,
        ?mode,
        "partition recovered"
    );
    Ok(state)
}

fn lowest_projector_offset(
    schema: &AppSchema,
    storage: &dyn Storage,
    partition: PartitionId,
) -> Result<Offset> {
    let mut lowest: Option<Offset> = None;
    for projector in schema.projectors() {
        let offset = storage.projector_offset(partition, &projector.qname)?;
        lowest = Some(lowest.map_or(offset, |current| current.min(offset)));
    }
    Ok(lowest.unwrap_or(Offset::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CudOp, EventCud};
    use crate::ids::IdRegister;
    use crate::storage::MemoryStorage;
    use chrono::Utc;
    use serde_json::Map as JsonMap;

    fn event(plog: Offset, workspace: u64, wlog: Offset, id: u64) -> RawEvent {
        RawEvent {
            app: "test/app".parse().unwrap(),
            partition: 1,
            workspace,
            command: "sys.CUD".parse().unwrap(),
            plog_offset: plog,
            wlog_offset: wlog,
            registered_at: Utc::now(),
            cuds: vec![EventCud {
                op: CudOp::Create,
                id,
                qname: "app.Doc".parse().unwrap(),
                fields: JsonMap::new(),
            }],
            args: Some(crate::event::ArgElement {
                qname: "app.Receipt".parse().unwrap(),
                id: Some(IdRegister::Operation.base() + plog),
                fields: JsonMap::new(),
                containers: Vec::new(),
            }),
            raw_arg: None,
            submitted_by: None,
        }
    }

    #[tokio::test]
    async fn replay_seeds_offsets_and_counters_per_workspace() {
        let storage = MemoryStorage::new();
        let catalog = IdRegister::Catalog.base();
        storage.append(event(1, 10, 1, catalog + 1)).await.unwrap();
        storage.append(event(2, 20, 1, catalog + 1)).await.unwrap();
        storage.append(event(3, 10, 2, catalog + 5)).await.unwrap();

        let state = replay_partition_state(&storage, 1).await.unwrap();
        assert_eq!(state.next_plog_offset(), 4);

        let ws10 = state.workspace(10).unwrap();
        assert_eq!(ws10.next_wlog_offset(), 3);
        assert_eq!(ws10.ids().counters().catalog, 5);
        assert_eq!(ws10.ids().counters().operation, 3);

        let ws20 = state.workspace(20).unwrap();
        assert_eq!(ws20.next_wlog_offset(), 2);
        assert_eq!(ws20.ids().counters().catalog, 1);
    }

    #[tokio::test]
    async fn read_failure_is_a_recovery_failure() {
        let storage = MemoryStorage::new();
        storage.fail_next_plog_reads(1).unwrap();
        let err = replay_partition_state(&storage, 1).await.unwrap_err();
        assert!(matches!(err, ProcessorError::PartitionRecoveryFailed(_)));
        assert!(err.is_retryable());
    }
}
