use crate::core::{
    AppQName, Offset, PartitionId, ProcessorError, QName, RecordId, StatusClass, WorkspaceId,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Inbound command as handed over by a protocol adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub app: AppQName,
    pub workspace: WorkspaceId,
    pub partition: PartitionId,
    pub command: QName,
    #[serde(default)]
    pub token: Option<String>,
    /// Request payload; empty when the command has no body.
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub host: String,
}

impl CommandRequest {
    pub fn new(
        app: AppQName,
        workspace: WorkspaceId,
        partition: PartitionId,
        command: QName,
    ) -> Self {
        Self {
            app,
            workspace,
            partition,
            command,
            token: None,
            body: String::new(),
            host: "127.0.0.1".to_string(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

/// A request queued for a partition worker together with its reply sink.
#[derive(Debug)]
pub struct CommandMessage {
    pub request: CommandRequest,
    pub reply: oneshot::Sender<CommandResponse>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub status_class: StatusClass,
    pub status: u16,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandResponse {
    Success {
        #[serde(rename = "currentWLogOffset")]
        current_wlog_offset: Offset,
        #[serde(rename = "newIDs", default, skip_serializing_if = "BTreeMap::is_empty")]
        new_ids: BTreeMap<RecordId, RecordId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<JsonMap<String, JsonValue>>,
    },
    Failure { error: ErrorBody },
}

impl CommandResponse {
    pub fn failure(err: &ProcessorError) -> Self {
        let status_class = err.status_class();
        Self::Failure {
            error: ErrorBody {
                status_class,
                status: status_class.status_code().as_u16(),
                message: err.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn status_class(&self) -> Option<StatusClass> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error } => Some(error.status_class),
        }
    }

    pub fn current_wlog_offset(&self) -> Option<Offset> {
        match self {
            Self::Success {
                current_wlog_offset,
                ..
            } => Some(*current_wlog_offset),
            Self::Failure { .. } => None,
        }
    }

    pub fn new_ids(&self) -> Option<&BTreeMap<RecordId, RecordId>> {
        match self {
            Self::Success { new_ids, .. } => Some(new_ids),
            Self::Failure { .. } => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}
