//! trickle-wire: Decoding layer for streamed model completions
//!
//! This crate turns the raw body of a completion endpoint into text deltas:
//! a [`FrameLexer`] splits bytes into event frames, and [`decode_payload`]
//! maps each frame's payload onto one of the accepted payload grammars.
//! The [`CompletionTransport`] trait is the seam to the network.

pub mod decode;
pub mod error;
mod escape;
pub mod frame;
pub mod transport;
pub mod types;

pub use decode::{Delta, Grammar, decode_payload};
pub use error::{Error, Result};
pub use frame::{Frame, FrameLexer};
pub use transport::{ByteStream, CompletionTransport, EndpointConfig, HttpTransport, TransportResponse};
pub use types::*;
