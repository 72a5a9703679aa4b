//! Event log, record and view storage collaborators.

mod journal;
mod memory;

pub use journal::{JournalDurability, JournalOptions, JournalStorage};
pub use memory::MemoryStorage;

use crate::core::{Offset, PartitionId, QName, RecordId, Result, WorkspaceId, sys};
use crate::event::{CommittedEvent, RawEvent};
use crate::extension::ViewIntent;
use crate::schema::RecordDef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

/// Current state of a stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub qname: QName,
    pub is_active: bool,
    pub fields: JsonMap<String, JsonValue>,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name)
    }

    pub fn as_i64(&self, name: &str) -> Option<i64> {
        self.field(name).and_then(JsonValue::as_i64)
    }

    pub fn as_str(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(JsonValue::as_str)
    }

    fn created(id: RecordId, qname: QName, mut fields: JsonMap<String, JsonValue>) -> Self {
        let is_active = fields
            .remove(sys::FIELD_IS_ACTIVE)
            .and_then(|value| value.as_bool())
            .unwrap_or(true);
        Self {
            id,
            qname,
            is_active,
            fields,
        }
    }

    fn apply_update(&mut self, fields: &JsonMap<String, JsonValue>) {
        for (name, value) in fields {
            if name == sys::FIELD_IS_ACTIVE {
                self.is_active = value.as_bool().unwrap_or(self.is_active);
            } else if value.is_null() {
                self.fields.remove(name);
            } else {
                self.fields.insert(name.clone(), value.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppendError {
    /// A created record ID is already taken.
    #[error("record ID conflict: {0}")]
    Conflict(String),

    /// The workspace already lives on another partition.
    #[error("misrouted event: {0}")]
    Misrouted(String),

    /// The log can no longer be trusted.
    #[error("append failed: {0}")]
    Fatal(String),
}

/// View intents of one event together with the projectors that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewBatch {
    pub partition: PartitionId,
    pub workspace: WorkspaceId,
    pub plog_offset: Offset,
    pub projectors: Vec<QName>,
    pub intents: Vec<ViewIntent>,
}

pub type EventSink<'a> = dyn FnMut(CommittedEvent) -> Result<()> + Send + 'a;

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends an event and applies its CUDs to the record store atomically.
    async fn append(&self, event: RawEvent) -> std::result::Result<CommittedEvent, AppendError>;

    /// Replays a partition log in offset order; `to` is inclusive.
    async fn read_plog(
        &self,
        partition: PartitionId,
        from: Offset,
        to: Option<Offset>,
        sink: &mut EventSink<'_>,
    ) -> Result<()>;

    async fn read_wlog(
        &self,
        workspace: WorkspaceId,
        from: Offset,
        to: Option<Offset>,
        sink: &mut EventSink<'_>,
    ) -> Result<()>;
}

pub trait RecordStore: Send + Sync {
    fn get_record(&self, workspace: WorkspaceId, id: RecordId) -> Result<Option<Record>>;

    fn get_singleton(&self, workspace: WorkspaceId, def: &RecordDef) -> Result<Option<Record>> {
        match def.singleton_id {
            Some(id) => self.get_record(workspace, id),
            None => Ok(None),
        }
    }
}

#[async_trait]
pub trait ViewStore: Send + Sync {
    fn get_view(&self, workspace: WorkspaceId, view: &QName, key: &str)
    -> Result<Option<JsonValue>>;

    /// Last PLog offset a projector has been applied to, `0` if none.
    fn projector_offset(&self, partition: PartitionId, projector: &QName) -> Result<Offset>;

    /// Applies all intents and advances the projectors' offsets in one step.
    async fn apply_view_batch(&self, batch: ViewBatch) -> Result<()>;
}

pub trait Storage: EventLog + RecordStore + ViewStore {}

impl<T> Storage for T where T: EventLog + RecordStore + ViewStore {}
