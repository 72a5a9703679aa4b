use super::{AppendError, EventLog, EventSink, Record, RecordStore, ViewBatch, ViewStore};
use crate::core::{
    FIRST_OFFSET, Offset, PartitionId, ProcessorError, QName, RecordId, Result, WorkspaceId,
};
use crate::event::{CommittedEvent, CudOp, RawEvent};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

type ViewKey = (WorkspaceId, QName, String);

/// In-memory logs, records and views shared by the storage backends.
#[derive(Debug, Default)]
pub(crate) struct StorageIndex {
    plogs: HashMap<PartitionId, Vec<CommittedEvent>>,
    wlogs: HashMap<WorkspaceId, Vec<CommittedEvent>>,
    records: HashMap<(WorkspaceId, RecordId), Record>,
    views: HashMap<ViewKey, JsonValue>,
    projector_offsets: HashMap<(PartitionId, QName), Offset>,
}

impl StorageIndex {
    fn next_offset(
        log: Option<&Vec<CommittedEvent>>,
        offset: impl Fn(&CommittedEvent) -> Offset,
    ) -> Offset {
        log.and_then(|events| events.last())
            .map(|event| offset(event) + 1)
            .unwrap_or(FIRST_OFFSET)
    }

    pub(crate) fn check_append(&self, event: &RawEvent) -> std::result::Result<(), AppendError> {
        let owner = self
            .wlogs
            .get(&event.workspace)
            .and_then(|events| events.last())
            .map(|last| last.partition);
        if let Some(owner) = owner {
            if owner != event.partition {
                return Err(AppendError::Misrouted(format!(
                    "workspace {} belongs to partition {}, not {}",
                    event.workspace, owner, event.partition
                )));
            }
        }
        let next_plog = Self::next_offset(self.plogs.get(&event.partition), |e| e.plog_offset);
        if event.plog_offset != next_plog {
            return Err(AppendError::Fatal(format!(
                "partition {} expects PLog offset {}, got {}",
                event.partition, next_plog, event.plog_offset
            )));
        }
        let next_wlog = Self::next_offset(self.wlogs.get(&event.workspace), |e| e.wlog_offset);
        if event.wlog_offset != next_wlog {
            return Err(AppendError::Fatal(format!(
                "workspace {} expects WLog offset {}, got {}",
                event.workspace, next_wlog, event.wlog_offset
            )));
        }

        let mut created = HashSet::new();
        for cud in &event.cuds {
            let key = (event.workspace, cud.id);
            match cud.op {
                CudOp::Create => {
                    if self.records.contains_key(&key) || !created.insert(cud.id) {
                        return Err(AppendError::Conflict(format!(
                            "record {} already exists in workspace {}",
                            cud.id, event.workspace
                        )));
                    }
                }
                CudOp::Update => {
                    if !self.records.contains_key(&key) && !created.contains(&cud.id) {
                        return Err(AppendError::Conflict(format!(
                            "record {} vanished from workspace {}",
                            cud.id, event.workspace
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn apply_event(&mut self, event: CommittedEvent) {
        for cud in &event.cuds {
            let key = (event.workspace, cud.id);
            match cud.op {
                CudOp::Create => {
                    let record = Record::created(cud.id, cud.qname.clone(), cud.fields.clone());
                    self.records.insert(key, record);
                }
                CudOp::Update => {
                    if let Some(record) = self.records.get_mut(&key) {
                        record.apply_update(&cud.fields);
                    }
                }
            }
        }
        self.wlogs
            .entry(event.workspace)
            .or_default()
            .push(event.clone());
        self.plogs.entry(event.partition).or_default().push(event);
    }

    pub(crate) fn apply_views(&mut self, batch: ViewBatch) {
        for intent in batch.intents {
            let key = (batch.workspace, intent.view, intent.key);
            match intent.value {
                Some(value) => {
                    self.views.insert(key, value);
                }
                None => {
                    self.views.remove(&key);
                }
            }
        }
        for projector in batch.projectors {
            let offset = self
                .projector_offsets
                .entry((batch.partition, projector))
                .or_default();
            *offset = (*offset).max(batch.plog_offset);
        }
    }

    pub(crate) fn plog_range(
        &self,
        partition: PartitionId,
        from: Offset,
        to: Option<Offset>,
    ) -> Vec<CommittedEvent> {
        Self::range(self.plogs.get(&partition), from, to, |e| e.plog_offset)
    }

    pub(crate) fn wlog_range(
        &self,
        workspace: WorkspaceId,
        from: Offset,
        to: Option<Offset>,
    ) -> Vec<CommittedEvent> {
        Self::range(self.wlogs.get(&workspace), from, to, |e| e.wlog_offset)
    }

    fn range(
        log: Option<&Vec<CommittedEvent>>,
        from: Offset,
        to: Option<Offset>,
        offset: impl Fn(&CommittedEvent) -> Offset,
    ) -> Vec<CommittedEvent> {
        log.map(|events| {
            events
                .iter()
                .filter(|event| offset(event) >= from && to.map_or(true, |to| offset(event) <= to))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    pub(crate) fn record(&self, workspace: WorkspaceId, id: RecordId) -> Option<Record> {
        self.records.get(&(workspace, id)).cloned()
    }

    pub(crate) fn view(&self, workspace: WorkspaceId, view: &QName, key: &str) -> Option<JsonValue> {
        self.views
            .get(&(workspace, view.clone(), key.to_string()))
            .cloned()
    }

    pub(crate) fn projector_offset(&self, partition: PartitionId, projector: &QName) -> Offset {
        self.projector_offsets
            .get(&(partition, projector.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions = self.plogs.keys().copied().collect::<Vec<_>>();
        partitions.sort_unstable();
        partitions
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    appends: usize,
    plog_reads: usize,
    view_batches: usize,
}

/// Counts a pending fault down; true when one fired.
pub(crate) fn take_fault(counter: &mut usize) -> bool {
    if *counter == 0 {
        return false;
    }
    *counter -= 1;
    true
}

/// Process-local storage with fault injection for failure scenarios.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    index: RwLock<StorageIndex>,
    faults: Mutex<FaultPlan>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` appends fail fatally without touching the log.
    pub fn fail_next_appends(&self, count: usize) -> Result<()> {
        self.faults.lock()?.appends = count;
        Ok(())
    }

    /// The next `count` PLog reads fail.
    pub fn fail_next_plog_reads(&self, count: usize) -> Result<()> {
        self.faults.lock()?.plog_reads = count;
        Ok(())
    }

    /// The next `count` view batches are rejected.
    pub fn fail_next_view_batches(&self, count: usize) -> Result<()> {
        self.faults.lock()?.view_batches = count;
        Ok(())
    }

    pub fn plog_len(&self, partition: PartitionId) -> Result<usize> {
        Ok(self.index.read()?.plog_range(partition, FIRST_OFFSET, None).len())
    }

    fn fault(&self, pick: impl FnOnce(&mut FaultPlan) -> &mut usize) -> Result<bool> {
        let mut faults = self.faults.lock()?;
        Ok(take_fault(pick(&mut faults)))
    }
}

#[async_trait]
impl EventLog for MemoryStorage {
    async fn append(&self, event: RawEvent) -> std::result::Result<CommittedEvent, AppendError> {
        let injected = self
            .fault(|faults| &mut faults.appends)
            .map_err(|err| AppendError::Fatal(err.to_string()))?;
        if injected {
            return Err(AppendError::Fatal("injected append failure".to_string()));
        }

        let mut index = self
            .index
            .write()
            .map_err(|err| AppendError::Fatal(err.to_string()))?;
        index.check_append(&event)?;
        let committed = CommittedEvent::new(event);
        index.apply_event(committed.clone());
        Ok(committed)
    }

    async fn read_plog(
        &self,
        partition: PartitionId,
        from: Offset,
        to: Option<Offset>,
        sink: &mut EventSink<'_>,
    ) -> Result<()> {
        if self.fault(|faults| &mut faults.plog_reads)? {
            return Err(ProcessorError::Storage(format!(
                "injected PLog read failure for partition {}",
                partition
            )));
        }
        let events = self.index.read()?.plog_range(partition, from, to);
        for event in events {
            sink(event)?;
        }
        Ok(())
    }

    async fn read_wlog(
        &self,
        workspace: WorkspaceId,
        from: Offset,
        to: Option<Offset>,
        sink: &mut EventSink<'_>,
    ) -> Result<()> {
        let events = self.index.read()?.wlog_range(workspace, from, to);
        for event in events {
            sink(event)?;
        }
        Ok(())
    }
}

impl RecordStore for MemoryStorage {
    fn get_record(&self, workspace: WorkspaceId, id: RecordId) -> Result<Option<Record>> {
        Ok(self.index.read()?.record(workspace, id))
    }
}

#[async_trait]
impl ViewStore for MemoryStorage {
    fn get_view(
        &self,
        workspace: WorkspaceId,
        view: &QName,
        key: &str,
    ) -> Result<Option<JsonValue>> {
        Ok(self.index.read()?.view(workspace, view, key))
    }

    fn projector_offset(&self, partition: PartitionId, projector: &QName) -> Result<Offset> {
        Ok(self.index.read()?.projector_offset(partition, projector))
    }

    async fn apply_view_batch(&self, batch: ViewBatch) -> Result<()> {
        if self.fault(|faults| &mut faults.view_batches)? {
            return Err(ProcessorError::Storage(format!(
                "injected view batch failure at PLog offset {}",
                batch.plog_offset
            )));
        }
        self.index.write()?.apply_views(batch);
        Ok(())
    }
}
