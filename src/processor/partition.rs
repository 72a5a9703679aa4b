use crate::core::{FIRST_OFFSET, Offset, PartitionId, WorkspaceId};
use crate::ids::{IdCounters, IdGenerator};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Per-workspace offsets and ID counters; owned by the partition worker.
#[derive(Debug, Clone)]
pub struct WorkspaceState {
    pub(crate) next_wlog_offset: Offset,
    pub(crate) ids: IdGenerator,
}

impl WorkspaceState {
    pub fn new() -> Self {
        Self {
            next_wlog_offset: FIRST_OFFSET,
            ids: IdGenerator::new(),
        }
    }

    pub fn next_wlog_offset(&self) -> Offset {
        self.next_wlog_offset
    }

    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }
}

#[derive(Debug, Clone)]
pub struct PartitionState {
    partition: PartitionId,
    pub(crate) next_plog_offset: Offset,
    workspaces: HashMap<WorkspaceId, WorkspaceState>,
}

impl Default for WorkspaceState {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionState {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            next_plog_offset: FIRST_OFFSET,
            workspaces: HashMap::new(),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn next_plog_offset(&self) -> Offset {
        self.next_plog_offset
    }

    pub fn workspace(&self, workspace: WorkspaceId) -> Option<&WorkspaceState> {
        self.workspaces.get(&workspace)
    }

    /// State of a workspace, created empty on first use.
    pub(crate) fn workspace_mut(&mut self, workspace: WorkspaceId) -> &mut WorkspaceState {
        self.workspaces.entry(workspace).or_default()
    }

    pub(crate) fn put_workspace(&mut self, workspace: WorkspaceId, state: WorkspaceState) {
        self.workspaces.insert(workspace, state);
    }

    pub fn snapshot(&self) -> PartitionStateSnapshot {
        PartitionStateSnapshot {
            partition: self.partition,
            next_plog_offset: self.next_plog_offset,
            workspaces: self
                .workspaces
                .iter()
                .map(|(id, state)| {
                    (
                        *id,
                        WorkspaceSnapshot {
                            next_wlog_offset: state.next_wlog_offset,
                            id_counters: state.ids.counters().clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub next_wlog_offset: Offset,
    pub id_counters: IdCounters,
}

/// Comparable view of a partition's recoverable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStateSnapshot {
    pub partition: PartitionId,
    pub next_plog_offset: Offset,
    pub workspaces: BTreeMap<WorkspaceId, WorkspaceSnapshot>,
}
