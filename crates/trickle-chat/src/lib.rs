//! trickle-chat: Stream lifecycle and conversation storage
//!
//! This crate drives one streamed completion at a time: the
//! [`StreamController`] opens the transport and feeds decoded deltas into a
//! [`StreamAssembler`], which publishes the running text and commits the
//! finished (or cancelled) reply to a [`ConversationLedger`].

pub mod assembler;
pub mod controller;
pub mod error;
pub mod events;
pub mod ledger;
pub mod state;
pub mod store;

pub use assembler::{Finalized, FinishReason, LiveBuffer, StreamAssembler};
pub use controller::{StreamController, StreamOutcome, StreamTask};
pub use error::{Error, Result};
pub use events::ChatEvent;
pub use ledger::{Conversation, ConversationId, ConversationLedger, ConversationSummary, MemoryLedger};
pub use state::StreamStatus;
pub use store::JsonlLedger;
