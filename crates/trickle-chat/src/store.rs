//! File-backed conversation ledger (one JSONL file per conversation)

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use trickle_wire::{Message, Role};

use crate::error::{Error, Result};
use crate::ledger::{Conversation, ConversationId, ConversationLedger, ConversationSummary};

/// Line types of a conversation file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LedgerEntry {
    /// Always the first line
    Metadata {
        id: ConversationId,
        first_query: String,
        created_at: i64,
    },
    Message { message: Message },
}

/// Ledger persisted as `<dir>/<conversation id>.jsonl`
pub struct JsonlLedger {
    dir: PathBuf,
    /// Serializes writers within this process
    write_lock: Mutex<()>,
}

impl JsonlLedger {
    /// Open (creating if needed) a ledger directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Default location under the platform data directory
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("trickle")
            .join("conversations")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &ConversationId) -> Result<PathBuf> {
        let raw = id.as_str();
        let valid = !raw.is_empty()
            && raw != "."
            && raw != ".."
            && !raw.contains(['/', '\\', '\0']);
        if !valid {
            return Err(Error::Ledger(format!("invalid conversation id: {:?}", raw)));
        }
        Ok(self.dir.join(format!("{}.jsonl", raw)))
    }

    /// Serialize messages as message lines, one per message
    fn message_lines(messages: &[Message]) -> Result<String> {
        let mut lines = String::new();
        for message in messages {
            lines.push_str(&serde_json::to_string(&LedgerEntry::Message {
                message: message.clone(),
            })?);
            lines.push('\n');
        }
        Ok(lines)
    }

    /// Write a new conversation file. The file appears complete or not at all.
    fn create(&self, id: ConversationId, messages: &[Message]) -> Result<ConversationId> {
        let path = self.path_for(&id)?;
        let metadata = LedgerEntry::Metadata {
            id: id.clone(),
            first_query: messages
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let mut contents = serde_json::to_string(&metadata)?;
        contents.push('\n');
        contents.push_str(&Self::message_lines(messages)?);

        let staging = path.with_extension("jsonl.tmp");
        let written = File::create(&staging).and_then(|file| {
            let mut writer = BufWriter::new(file);
            writer.write_all(contents.as_bytes())?;
            writer.flush()
        });
        if let Err(e) = written.and_then(|()| fs::rename(&staging, &path)) {
            let _ = fs::remove_file(&staging);
            return Err(e.into());
        }

        tracing::debug!(conversation_id = %id, path = %path.display(), "Created conversation file");
        Ok(id)
    }

    fn append(&self, path: &Path, messages: &[Message]) -> Result<()> {
        let lines = Self::message_lines(messages)?;
        let mut file = File::options().append(true).open(path)?;
        file.write_all(lines.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn read(path: &Path) -> Result<Conversation> {
        let reader = BufReader::new(File::open(path)?);
        let mut conversation: Option<Conversation> = None;

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(&line) {
                Ok(LedgerEntry::Metadata {
                    id,
                    first_query,
                    created_at,
                }) => {
                    conversation = Some(Conversation {
                        id,
                        first_query,
                        created_at,
                        messages: Vec::new(),
                    });
                }
                Ok(LedgerEntry::Message { message }) => match conversation.as_mut() {
                    Some(c) => c.push(message),
                    None => {
                        return Err(Error::Ledger(format!(
                            "{} has messages before its metadata",
                            path.display()
                        )));
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Skipping unreadable ledger line: {}", e);
                }
            }
        }

        conversation.ok_or_else(|| Error::Ledger(format!("{} has no metadata", path.display())))
    }
}

impl ConversationLedger for JsonlLedger {
    fn append_messages(
        &self,
        conversation_id: Option<&ConversationId>,
        messages: Vec<Message>,
    ) -> Result<ConversationId> {
        if messages.is_empty() {
            return Err(Error::Ledger("no messages to append".into()));
        }
        let _guard = self.write_lock.lock();

        match conversation_id.filter(|id| !id.is_empty()) {
            Some(id) => {
                let path = self.path_for(id)?;
                if path.exists() {
                    self.append(&path, &messages)?;
                    Ok(id.clone())
                } else {
                    self.create(id.clone(), &messages)
                }
            }
            None => self.create(ConversationId::generate(), &messages),
        }
    }

    fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let mut summaries = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }
            match Self::read(&path) {
                Ok(conversation) => summaries.push(conversation.summary()),
                Err(e) => tracing::warn!(path = %path.display(), "Skipping conversation file: {}", e),
            }
        }

        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        Ok(summaries)
    }

    fn get_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation> {
        let path = self.path_for(conversation_id)?;
        if !path.exists() {
            return Err(Error::ConversationNotFound(conversation_id.to_string()));
        }
        Self::read(&path)
    }
}
