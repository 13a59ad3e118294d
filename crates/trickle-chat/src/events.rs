//! Stream lifecycle events

use serde::{Deserialize, Serialize};
use trickle_wire::Message;

use crate::ledger::ConversationId;

/// Events emitted by the stream controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A stream was registered and is opening
    StreamStart {
        stream_id: u64,
        conversation_id: Option<ConversationId>,
    },

    /// Text appended to the reply
    Delta { stream_id: u64, text: String },

    /// The reply was committed to the ledger
    Committed {
        stream_id: u64,
        conversation_id: ConversationId,
        message: Message,
    },

    /// The stream was cancelled; partial text, if any, went to `conversation_id`
    Aborted {
        stream_id: u64,
        conversation_id: Option<ConversationId>,
    },

    /// The stream failed; nothing was committed
    Failed { stream_id: u64, message: String },
}

impl ChatEvent {
    pub fn stream_id(&self) -> u64 {
        match self {
            ChatEvent::StreamStart { stream_id, .. }
            | ChatEvent::Delta { stream_id, .. }
            | ChatEvent::Committed { stream_id, .. }
            | ChatEvent::Aborted { stream_id, .. }
            | ChatEvent::Failed { stream_id, .. } => *stream_id,
        }
    }

    /// Check if this is the last event of its stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChatEvent::Committed { .. } | ChatEvent::Aborted { .. } | ChatEvent::Failed { .. }
        )
    }
}
