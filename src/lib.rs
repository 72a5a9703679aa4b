// ============================================================================
// Partition Processor Library
// ============================================================================

pub mod auth;
pub mod core;
pub mod event;
pub mod extension;
pub mod ids;
pub mod notify;
pub mod processor;
pub mod schema;
pub mod storage;

// Re-export main types for convenience
pub use core::{AppQName, ProcessorError, QName, Result, StatusClass};
pub use event::{CommittedEvent, EventBuilder, RawEvent};
pub use ids::IdGenerator;
pub use schema::{AppSchema, AppSchemaBuilder, CommandDef, ProjectorDef, RecordDef, RecordKind};
pub use storage::{JournalOptions, JournalStorage, MemoryStorage, Storage};

// Re-export the processing API
pub use processor::{
    AppDeployment, AppPartitions, CommandProcessor, CommandRequest, CommandResponse,
    ProcessorPolicy,
};
