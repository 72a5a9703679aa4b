use super::policy::RateLimit;
use crate::core::{ProcessorError, QName, Result, WorkspaceId};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Sliding-window call quotas per (function, workspace).
#[derive(Debug, Default)]
pub struct RateLimiter {
    limits: HashMap<QName, RateLimit>,
    windows: Mutex<HashMap<(QName, WorkspaceId), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limits: &[RateLimit]) -> Self {
        Self {
            limits: limits
                .iter()
                .map(|limit| (limit.function.clone(), limit.clone()))
                .collect(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Records a call, or fails without recording it when the quota is spent.
    pub fn check(&self, function: &QName, workspace: WorkspaceId) -> Result<()> {
        let Some(limit) = self.limits.get(function) else {
            return Ok(());
        };

        let now = Instant::now();
        let period = Duration::from_millis(limit.period_ms);
        let mut windows = self.windows.lock()?;
        let calls = windows.entry((function.clone(), workspace)).or_default();
        while calls
            .front()
            .is_some_and(|at| now.duration_since(*at) >= period)
        {
            calls.pop_front();
        }

        if calls.len() >= limit.max_calls as usize {
            return Err(ProcessorError::RateLimitExceeded(format!(
                "'{}' allows {} calls per {}ms in workspace {}",
                function, limit.max_calls, limit.period_ms, workspace
            )));
        }
        calls.push_back(now);
        Ok(())
    }
}
