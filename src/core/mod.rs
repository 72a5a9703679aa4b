pub mod error;
pub mod types;

pub use error::{ProcessorError, Result, StatusClass};
pub use types::{
    AppQName, FIRST_OFFSET, NULL_RECORD_ID, Offset, PartitionId, QName, RecordId, WorkspaceId,
    sys,
};
