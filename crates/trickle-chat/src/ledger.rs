//! Conversation storage: the collaborator finished replies are committed to.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use trickle_wire::{Message, Role};

use crate::error::{Error, Result};

/// Opaque conversation identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Generate a fresh id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty id means "no conversation yet"
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConversationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A stored conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Content of the first user message; empty until one is appended
    pub first_query: String,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    /// Append-only, in send order
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Start a conversation with its first message
    pub fn new(id: ConversationId, first: Message) -> Self {
        let mut conversation = Self {
            id,
            first_query: String::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
            messages: Vec::new(),
        };
        conversation.push(first);
        conversation
    }

    /// Append a message, filling `first_query` from the first user message
    pub fn push(&mut self, message: Message) {
        if self.first_query.is_empty() && message.role == Role::User {
            self.first_query = message.content.clone();
        }
        self.messages.push(message);
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            first_query: self.first_query.clone(),
            created_at: self.created_at,
            message_count: self.messages.len(),
        }
    }
}

/// Listing entry for a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub first_query: String,
    pub created_at: i64,
    pub message_count: usize,
}

/// Where finalized messages go.
///
/// Messages are only ever appended; past messages are never rewritten.
pub trait ConversationLedger: Send + Sync {
    /// Append messages, in order, as one all-or-nothing write and return the
    /// conversation id they landed in.
    ///
    /// A missing or empty id creates a new conversation. An id the ledger has
    /// not seen (one assigned by the backend) is adopted as a new conversation.
    fn append_messages(
        &self,
        conversation_id: Option<&ConversationId>,
        messages: Vec<Message>,
    ) -> Result<ConversationId>;

    /// Append a single message
    fn append_message(
        &self,
        conversation_id: Option<&ConversationId>,
        message: Message,
    ) -> Result<ConversationId> {
        self.append_messages(conversation_id, vec![message])
    }

    /// All conversations, newest first
    fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;

    /// Load one conversation
    fn get_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation>;

    /// Messages of one conversation, in send order
    fn get_history(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        Ok(self.get_conversation(conversation_id)?.messages)
    }
}

/// In-process ledger
#[derive(Debug, Default)]
pub struct MemoryLedger {
    /// Creation order
    conversations: Mutex<Vec<Conversation>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.conversations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.lock().is_empty()
    }
}

impl ConversationLedger for MemoryLedger {
    fn append_messages(
        &self,
        conversation_id: Option<&ConversationId>,
        messages: Vec<Message>,
    ) -> Result<ConversationId> {
        let mut messages = messages.into_iter();
        let Some(first) = messages.next() else {
            return Err(Error::Ledger("no messages to append".into()));
        };
        let mut conversations = self.conversations.lock();

        let existing = conversation_id.filter(|id| !id.is_empty()).cloned();
        let index = existing
            .as_ref()
            .and_then(|id| conversations.iter().position(|c| &c.id == id));

        let conversation = match index {
            Some(index) => {
                let conversation = &mut conversations[index];
                conversation.push(first);
                conversation
            }
            None => {
                let id = existing.unwrap_or_else(ConversationId::generate);
                tracing::debug!(conversation_id = %id, "Creating conversation");
                conversations.push(Conversation::new(id, first));
                let last = conversations.len() - 1;
                &mut conversations[last]
            }
        };
        for message in messages {
            conversation.push(message);
        }
        Ok(conversation.id.clone())
    }

    fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        Ok(self
            .conversations
            .lock()
            .iter()
            .rev()
            .map(Conversation::summary)
            .collect())
    }

    fn get_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation> {
        self.conversations
            .lock()
            .iter()
            .find(|c| &c.id == conversation_id)
            .cloned()
            .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_string()))
    }
}
