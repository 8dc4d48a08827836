//! Shared protocol layer for the browsing-data provider daemon.
//!
//! The daemon is the sole writer of a device's browsing data (bookmarks, open
//! tabs, history, saved pages). Client processes never touch the databases
//! directly; they speak the binary protocol defined here over a private Unix
//! socket. This crate carries everything both sides must agree on:
//!
//! - [`error`]: the wire-visible result codes ([`ErrorCode`]) and the codec
//!   error type ([`WireError`])
//! - [`commands`]: command codes partitioned into basic/read/write ranges,
//!   client-type (domain) tags, and access classes
//! - [`wire`]: the async envelope/string/blob codec
//! - [`search`]: the search-condition payload carried by the find commands
//!
//! # Wire Format
//!
//! All integers are little-endian. Every exchange opens with a fixed 16-byte
//! envelope:
//!
//! ```text
//! +--------------+----------------+------------------+
//! | command: u32 | session_id: u32| record_id: i64   |
//! +--------------+----------------+------------------+
//! ```
//!
//! Replies open with an `i32` error code (0 = success). Strings are a `u32`
//! length followed by UTF-8 bytes (length <= 4096); blobs are a `u32` length
//! followed by raw bytes, moved in 64 KiB chunks. A blob reply additionally
//! carries a `u32` transfer-method flag: when the daemon negotiated a
//! shared-memory transfer the payload is already in the segment and only
//! metadata follows on the socket.

pub mod commands;
pub mod error;
pub mod search;
pub mod wire;

pub use commands::{AccessClass, ClientType, CommandCode, DomainFamily, TransferMethod};
pub use error::{ErrorCode, WireError, WireResult};
pub use search::{DateBucket, DateFilter, KeywordFilter, KeywordScope, SearchQuery};
pub use wire::{Envelope, BLOB_CHUNK, ENVELOPE_LEN, MAX_BLOB_LEN, MAX_STRING_LEN};
