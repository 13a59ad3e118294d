//! Per-stream lifecycle state

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::assembler::StreamAssembler;

/// Lifecycle of a single stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Pending,
    Opening,
    Streaming,
    Closing,
    Completed,
    Aborted,
    Failed,
}

impl StreamStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamStatus::Completed | StreamStatus::Aborted | StreamStatus::Failed
        )
    }
}

/// The single active stream, owned by the controller
pub(crate) struct StreamState {
    pub(crate) id: u64,
    pub(crate) status: StreamStatus,
    pub(crate) cancel: CancellationToken,
    pub(crate) assembler: StreamAssembler,
}

impl StreamState {
    pub(crate) fn new(id: u64, assembler: StreamAssembler) -> Self {
        Self {
            id,
            status: StreamStatus::Pending,
            cancel: CancellationToken::new(),
            assembler,
        }
    }

    pub(crate) fn set_status(&mut self, status: StreamStatus) {
        tracing::debug!(stream_id = self.id, from = ?self.status, to = ?status, "Stream status");
        self.status = status;
    }
}
