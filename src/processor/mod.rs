//! Partitioned command processing: workers, pipeline and recovery.

mod appparts;
mod args;
mod cud;
mod message;
mod partition;
mod pipeline;
mod policy;
mod projection;
mod ratelimit;
mod recovery;
mod service;
mod worker;

pub use appparts::{AppDeployment, AppPartitions, BorrowedPartition, ExtensionEngine};
pub use message::{CommandMessage, CommandRequest, CommandResponse, ErrorBody};
pub use partition::{PartitionState, PartitionStateSnapshot, WorkspaceSnapshot, WorkspaceState};
pub use policy::{
    CudPolicy, ProcessorPolicy, QueuePolicy, RateLimit, RecoveryPolicy, RecoveryReapplyMode,
};
pub use ratelimit::RateLimiter;
pub use recovery::{recover_partition, replay_partition_state};
pub use service::{CommandProcessor, CommandProcessorBuilder, ProcessorStats};
