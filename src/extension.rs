//! Contexts handed to command extensions and synchronous projectors.

use crate::auth::Principal;
use crate::core::{Offset, QName, RecordId, Result, WorkspaceId};
use crate::event::{ArgElement, RawEvent};
use crate::storage::{Record, RecordStore, Storage, ViewStore};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::sync::Arc;

/// Business logic of a command; runs after the event is durable.
pub type CommandExtension = Arc<dyn Fn(&mut ExecContext<'_>) -> Result<()> + Send + Sync>;

/// Derived-view update; writes only into the supplied intents.
pub type ProjectorHandler =
    Arc<dyn Fn(&ProjectorContext<'_>, &mut ViewIntents) -> Result<()> + Send + Sync>;

pub struct ExecContext<'a> {
    event: &'a RawEvent,
    unlogged: Option<&'a ArgElement>,
    raw_arg: Option<&'a str>,
    storage: &'a dyn Storage,
    principals: &'a [Principal],
    pub(crate) response: Option<JsonMap<String, JsonValue>>,
    pub(crate) response_intents: usize,
}

impl<'a> ExecContext<'a> {
    pub(crate) fn new(
        event: &'a RawEvent,
        unlogged: Option<&'a ArgElement>,
        raw_arg: Option<&'a str>,
        storage: &'a dyn Storage,
        principals: &'a [Principal],
    ) -> Self {
        Self {
            event,
            unlogged,
            raw_arg,
            storage,
            principals,
            response: None,
            response_intents: 0,
        }
    }

    pub fn command(&self) -> &QName {
        &self.event.command
    }

    pub fn workspace(&self) -> WorkspaceId {
        self.event.workspace
    }

    pub fn wlog_offset(&self) -> Offset {
        self.event.wlog_offset
    }

    pub fn event(&self) -> &RawEvent {
        self.event
    }

    /// Logged argument with storage IDs already assigned.
    pub fn args(&self) -> Option<&ArgElement> {
        self.event.args.as_ref()
    }

    pub fn arg(&self, name: &str) -> Option<&JsonValue> {
        self.args().and_then(|args| args.fields.get(name))
    }

    pub fn unlogged_arg(&self, name: &str) -> Option<&JsonValue> {
        self.unlogged.and_then(|args| args.fields.get(name))
    }

    pub fn raw_arg(&self) -> Option<&str> {
        self.raw_arg
    }

    pub fn record(&self, id: RecordId) -> Result<Option<Record>> {
        self.storage.get_record(self.event.workspace, id)
    }

    pub fn principals(&self) -> &[Principal] {
        self.principals
    }

    /// Starts the response object. Only one response may be produced.
    pub fn new_response(&mut self) -> &mut JsonMap<String, JsonValue> {
        self.response_intents += 1;
        self.response.insert(JsonMap::new())
    }
}

pub struct ProjectorContext<'a> {
    event: &'a RawEvent,
    storage: &'a dyn Storage,
}

impl<'a> ProjectorContext<'a> {
    pub(crate) fn new(event: &'a RawEvent, storage: &'a dyn Storage) -> Self {
        Self { event, storage }
    }

    pub fn event(&self) -> &RawEvent {
        self.event
    }

    pub fn workspace(&self) -> WorkspaceId {
        self.event.workspace
    }

    /// Committed value of a view entry; pending intents are not visible.
    pub fn view(&self, view: &QName, key: &str) -> Result<Option<JsonValue>> {
        self.storage.get_view(self.event.workspace, view, key)
    }

    pub fn record(&self, id: RecordId) -> Result<Option<Record>> {
        self.storage.get_record(self.event.workspace, id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewIntent {
    pub view: QName,
    pub key: String,
    /// `None` removes the entry.
    pub value: Option<JsonValue>,
}

#[derive(Debug, Clone, Default)]
pub struct ViewIntents {
    intents: Vec<ViewIntent>,
}

impl ViewIntents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, view: QName, key: impl Into<String>, value: JsonValue) {
        self.intents.push(ViewIntent {
            view,
            key: key.into(),
            value: Some(value),
        });
    }

    pub fn delete(&mut self, view: QName, key: impl Into<String>) {
        self.intents.push(ViewIntent {
            view,
            key: key.into(),
            value: None,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub(crate) fn into_vec(self) -> Vec<ViewIntent> {
        self.intents
    }
}
