use crate::core::{ProcessorError, QName, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Intake limits of a partition worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuePolicy {
    /// Requests waiting for the worker; a full queue answers `Busy`.
    pub capacity: usize,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self { capacity: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CudPolicy {
    /// Maximum CUDs accepted in one request.
    pub max_cuds: usize,
}

impl Default for CudPolicy {
    fn default() -> Self {
        Self { max_cuds: 100 }
    }
}

/// Call quota of one function per workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimit {
    pub function: QName,
    pub max_calls: u32,
    pub period_ms: u64,
}

/// Which trailing events recovery re-projects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecoveryReapplyMode {
    /// Only the last replayed event.
    LastEvent,
    /// Every event past each projector's stored offset.
    UnprojectedTail,
}

impl Default for RecoveryReapplyMode {
    fn default() -> Self {
        Self::LastEvent
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryPolicy {
    #[serde(default)]
    pub reapply: RecoveryReapplyMode,
}

/// Operational policy of the command processor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessorPolicy {
    #[serde(default)]
    pub queue: QueuePolicy,
    #[serde(default)]
    pub cud: CudPolicy,
    #[serde(default)]
    pub rate_limits: Vec<RateLimit>,
    #[serde(default)]
    pub recovery: RecoveryPolicy,
}

impl ProcessorPolicy {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let policy = serde_json::from_str::<Self>(text)
            .map_err(|err| ProcessorError::Config(format!("processor policy: {}", err)))?;
        policy.validate()?;
        Ok(policy)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(ProcessorError::Config(
                "queue.capacity must be >= 1".to_string(),
            ));
        }
        for limit in &self.rate_limits {
            if limit.max_calls == 0 || limit.period_ms == 0 {
                return Err(ProcessorError::Config(format!(
                    "rate limit for '{}' must allow at least one call per non-empty period",
                    limit.function
                )));
            }
        }
        Ok(())
    }

    pub fn with_rate_limit(mut self, function: QName, max_calls: u32, period_ms: u64) -> Self {
        self.rate_limits.push(RateLimit {
            function,
            max_calls,
            period_ms,
        });
        self
    }
}
