//! "New offset available" notifications.

use crate::core::{AppQName, Offset, QName, Result, WorkspaceId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Identifies a projection whose offset moved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectionKey {
    pub app: AppQName,
    pub projection: QName,
    /// For the PLog projection this carries the partition number.
    pub workspace: WorkspaceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub key: ProjectionKey,
    pub offset: Offset,
}

/// Best-effort pub/sub broker.
pub trait Notifier: Send + Sync {
    fn publish(&self, key: ProjectionKey, offset: Offset) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn publish(&self, _key: ProjectionKey, _offset: Offset) -> Result<()> {
        Ok(())
    }
}

/// Fans notifications out to in-process subscribers.
///
/// Slow subscribers may lag and lose messages; nobody listening is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, key: ProjectionKey, offset: Offset) -> Result<()> {
        let _ = self.tx.send(Notification { key, offset });
        Ok(())
    }
}
