//! Accumulating deltas into the reply and committing it

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use trickle_wire::Message;

use crate::error::Result;
use crate::ledger::{ConversationId, ConversationLedger};

/// The "ongoing result" channel a UI renders from.
///
/// Holds the full accumulated text of the active stream, or an empty string
/// when nothing is streaming. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct LiveBuffer {
    tx: Arc<watch::Sender<String>>,
}

impl Default for LiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveBuffer {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(String::new())),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.tx.subscribe()
    }

    /// Current value
    pub fn current(&self) -> String {
        self.tx.borrow().clone()
    }

    pub(crate) fn publish(&self, text: &str) {
        self.tx.send_replace(text.to_string());
    }

    pub(crate) fn clear(&self) {
        self.tx.send_if_modified(|current| {
            if current.is_empty() {
                false
            } else {
                current.clear();
                true
            }
        });
    }
}

/// Why a stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Completed,
    Aborted,
    Failed,
}

/// What finalize did with the accumulated text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    /// Appended to the ledger as an assistant message
    Committed {
        conversation_id: ConversationId,
        message: Message,
    },
    /// Nothing was appended
    Discarded,
}

/// Accumulates one stream's deltas.
pub struct StreamAssembler {
    conversation_id: Option<ConversationId>,
    /// User turn committed ahead of the reply
    prompt: Option<Message>,
    ledger: Arc<dyn ConversationLedger>,
    live: LiveBuffer,
    text: String,
    finalized: bool,
}

impl StreamAssembler {
    pub fn new(
        conversation_id: Option<ConversationId>,
        prompt: Option<Message>,
        ledger: Arc<dyn ConversationLedger>,
        live: LiveBuffer,
    ) -> Self {
        Self {
            conversation_id: conversation_id.filter(|id| !id.is_empty()),
            prompt,
            ledger,
            live,
            text: String::new(),
            finalized: false,
        }
    }

    /// Append a delta and republish the full text
    pub fn append(&mut self, delta: &str) {
        if self.finalized || delta.is_empty() {
            return;
        }
        self.text.push_str(delta);
        self.live.publish(&self.text);
    }

    /// Text accumulated so far
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Settle the stream.
    ///
    /// Only the first call has an effect; later calls return `Ok(None)`.
    /// Completed and aborted streams commit the accumulated text, however
    /// little arrived. A failed stream commits nothing. The live buffer is
    /// cleared in every case.
    ///
    /// The prompt and the reply are appended as one batch, so a ledger
    /// failure leaves neither stored.
    pub fn finalize(&mut self, reason: FinishReason) -> Result<Option<Finalized>> {
        if self.finalized {
            tracing::debug!(?reason, "Stream already finalized, ignoring");
            return Ok(None);
        }
        self.finalized = true;
        self.live.clear();

        if reason == FinishReason::Failed {
            tracing::debug!(chars = self.text.len(), "Discarding failed stream result");
            return Ok(Some(Finalized::Discarded));
        }

        let message = Message::assistant(std::mem::take(&mut self.text));
        let mut batch = Vec::with_capacity(2);
        batch.extend(self.prompt.take());
        batch.push(message.clone());

        let conversation_id = self
            .ledger
            .append_messages(self.conversation_id.take().as_ref(), batch)?;
        tracing::debug!(?reason, %conversation_id, "Committed assistant message");

        Ok(Some(Finalized::Committed {
            conversation_id,
            message,
        }))
    }
}
