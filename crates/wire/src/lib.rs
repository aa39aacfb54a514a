//! fastsync Wire Protocol
//!
//! This crate defines everything that crosses the socket between a client
//! session and the relay. Both the client and the server MUST depend on it.
//!
//! # Message Categories
//!
//! - **Control channel** (text frames): JSON arrays `[verb, ...args]`, see
//!   [`control`], plus the literal `__ping__` / `__pong__` liveness strings.
//! - **Transform channel** (binary frames): fixed-layout little-endian 32-bit
//!   words, see [`codec`].

#![deny(unsafe_code)]

pub mod codec;
pub mod control;

pub use codec::{
    DecodeError, ENTRY_WORDS, Entry, FieldEncoding, FrameCodec, Group, HEADER_WORDS,
    DEFAULT_QUANTIZE_SCALE, MAX_ENTRIES_PER_GROUP, PADDING_WORD, decode, encode,
};
pub use control::{
    AttributeValues, ClientMessage, ControlError, HtmlUpdate, IdData, PING, PONG, PeerMessage,
    RemoteElTemplate, RemoveRemoteEl, ServerMessage, StealOptions, StealRequest, SyncConfig, Verb,
};
pub use fastsync_core::{SessionId, SyncId, Transform};
