//! Deterministic record identifier generation.
//!
//! Clients submit transient raw IDs (`1..=MAX_RAW_RECORD_ID`); the generator
//! maps each of them to a permanent storage ID. Storage IDs are split into
//! registers by record kind so catalog documents and operation documents never
//! share a counter, and singletons get fixed IDs assigned by the schema.

use crate::core::{ProcessorError, RecordId, Result};
use crate::schema::{RecordDef, RecordKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MAX_RAW_RECORD_ID: RecordId = 0xFFFF;
pub const FIRST_SINGLETON_ID: RecordId = MAX_RAW_RECORD_ID + 1;
pub const MAX_SINGLETON_ID: RecordId = FIRST_SINGLETON_ID + 0x1FF;
/// Width of one register's ID space.
pub const REGISTER_FACTOR: RecordId = 1 << 40;

pub fn is_raw_id(id: RecordId) -> bool {
    id > 0 && id <= MAX_RAW_RECORD_ID
}

pub fn is_singleton_id(id: RecordId) -> bool {
    (FIRST_SINGLETON_ID..=MAX_SINGLETON_ID).contains(&id)
}

/// Independent counter spaces for storage IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdRegister {
    /// CDoc, CRecord, WDoc and WRecord records.
    Catalog,
    /// ODoc and ORecord elements carried as command arguments.
    Operation,
}

impl IdRegister {
    fn index(self) -> u64 {
        match self {
            Self::Catalog => 1,
            Self::Operation => 2,
        }
    }

    pub fn base(self) -> RecordId {
        self.index() * REGISTER_FACTOR
    }

    pub fn for_kind(kind: RecordKind) -> Option<Self> {
        match kind {
            RecordKind::CDoc | RecordKind::CRecord | RecordKind::WDoc | RecordKind::WRecord => {
                Some(Self::Catalog)
            }
            RecordKind::ODoc | RecordKind::ORecord => Some(Self::Operation),
            RecordKind::Object => None,
        }
    }

    /// Register a storage ID was issued from, if any.
    pub fn of_id(id: RecordId) -> Option<Self> {
        match id / REGISTER_FACTOR {
            1 => Some(Self::Catalog),
            2 => Some(Self::Operation),
            _ => None,
        }
    }
}

/// Last issued counter value per register.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdCounters {
    pub catalog: u64,
    pub operation: u64,
}

impl IdCounters {
    fn get_mut(&mut self, register: IdRegister) -> &mut u64 {
        match register {
            IdRegister::Catalog => &mut self.catalog,
            IdRegister::Operation => &mut self.operation,
        }
    }
}

/// Per-workspace identifier generator.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    counters: IdCounters,
    session: BTreeMap<RecordId, RecordId>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> &IdCounters {
        &self.counters
    }

    /// Issues the storage ID for `raw_id` of a record defined by `def`.
    pub fn next_id(&mut self, raw_id: RecordId, def: &RecordDef) -> Result<RecordId> {
        if self.session.contains_key(&raw_id) {
            return Err(ProcessorError::MalformedRequest(format!(
                "raw ID {} is used more than once",
                raw_id
            )));
        }

        let id = match def.singleton_id {
            Some(singleton_id) => singleton_id,
            None => {
                let register = IdRegister::for_kind(def.kind).ok_or_else(|| {
                    ProcessorError::MalformedRequest(format!(
                        "'{}' of kind {:?} has no storage ID",
                        def.qname, def.kind
                    ))
                })?;
                let counter = self.counters.get_mut(register);
                *counter = counter.saturating_add(1);
                if *counter >= REGISTER_FACTOR {
                    return Err(ProcessorError::Internal(format!(
                        "{:?} ID register exhausted",
                        register
                    )));
                }
                register.base() + *counter
            }
        };

        self.session.insert(raw_id, id);
        Ok(id)
    }

    /// Storage ID already issued for `raw_id` in the current session.
    pub fn resolve(&self, raw_id: RecordId) -> Option<RecordId> {
        self.session.get(&raw_id).copied()
    }

    /// Advances counters past an ID observed in the log.
    pub fn update_on_sync(&mut self, id: RecordId) {
        let Some(register) = IdRegister::of_id(id) else {
            return;
        };
        let counter = self.counters.get_mut(register);
        *counter = (*counter).max(id - register.base());
    }

    /// Drains the raw-to-storage mapping produced since the last call.
    pub fn take_new_ids(&mut self) -> BTreeMap<RecordId, RecordId> {
        std::mem::take(&mut self.session)
    }
}
