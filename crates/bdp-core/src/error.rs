//! Error taxonomy shared by the daemon and its clients.
//!
//! Two layers live here:
//!
//! - [`ErrorCode`]: the flat `i32` result code that precedes most replies on
//!   the wire. Clients surface it as a queryable last-error value.
//! - [`WireError`]: the codec-level error used inside the daemon. Every
//!   variant maps onto an [`ErrorCode`] via [`WireError::code`]; transport
//!   failures are classified as fatal so the session layer can decide
//!   between answering and tearing the connection down.
//!
//! Transient interruptions (`EINTR`) are retried inside the codec and never
//! surface through either type.

use std::io;

use thiserror::Error;

/// Wire-visible result code.
///
/// `None` (0) is success. All failures are negative so a client can treat
/// "negative reply" uniformly. The numeric values are part of the protocol:
/// changing one breaks deployed clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Success.
    None = 0,
    /// Malformed request: bad command, bad field id, negative length, etc.
    InvalidParameter = -100,
    /// Resource exhaustion: no free session slot, allocation failure.
    OutOfMemory = -200,
    /// Transport broken. Always fatal to the session that observed it.
    Io = -300,
    /// Query legitimately matched nothing (an absent image, a NULL column).
    NoData = -400,
    /// The addressed record does not exist.
    IdNotFound = -401,
    /// A caller-supplied id is already present.
    DuplicatedId = -402,
    /// The permission gate denied the command.
    PermissionDenied = -500,
    /// The database is busy or locked; recoverable next request.
    DiskBusy = -600,
    /// The disk is full; recoverable next request.
    DiskFull = -601,
    /// A string or blob exceeds its protocol bound.
    TooBigData = -700,
    /// Anything that does not fit the taxonomy above.
    Unknown = -999,
}

impl ErrorCode {
    /// Raw wire value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Decode a wire value; unrecognized codes collapse to `Unknown`.
    #[must_use]
    pub const fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::None,
            -100 => Self::InvalidParameter,
            -200 => Self::OutOfMemory,
            -300 => Self::Io,
            -400 => Self::NoData,
            -401 => Self::IdNotFound,
            -402 => Self::DuplicatedId,
            -500 => Self::PermissionDenied,
            -600 => Self::DiskBusy,
            -601 => Self::DiskFull,
            -700 => Self::TooBigData,
            _ => Self::Unknown,
        }
    }

    /// Returns `true` for the success code.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::None)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "ok",
            Self::InvalidParameter => "invalid parameter",
            Self::OutOfMemory => "out of memory",
            Self::Io => "i/o error",
            Self::NoData => "no data",
            Self::IdNotFound => "id not found",
            Self::DuplicatedId => "duplicated id",
            Self::PermissionDenied => "permission denied",
            Self::DiskBusy => "disk busy",
            Self::DiskFull => "disk full",
            Self::TooBigData => "too big data",
            Self::Unknown => "unknown error",
        };
        write!(f, "{name} ({})", self.as_i32())
    }
}

/// Codec-level error for the wire protocol.
#[derive(Debug, Error)]
pub enum WireError {
    /// A string length prefix exceeds the protocol bound.
    ///
    /// Detected BEFORE allocation so a hostile length prefix cannot exhaust
    /// memory.
    #[error("string too long: {len} bytes exceeds maximum {max} bytes")]
    StringTooLong {
        /// Declared length.
        len: usize,
        /// Protocol bound.
        max: usize,
    },

    /// A blob length prefix exceeds the protocol bound.
    #[error("blob too large: {len} bytes exceeds maximum {max} bytes")]
    BlobTooLarge {
        /// Declared length.
        len: usize,
        /// Protocol bound.
        max: usize,
    },

    /// The envelope carried a command code outside every known range.
    ///
    /// The payload length of an unknown command cannot be determined, so the
    /// stream is unrecoverably desynchronized.
    #[error("unknown command code {0:#06x}")]
    UnknownCommand(u32),

    /// The connect handshake carried an unknown client-type tag.
    #[error("unknown client type tag {0:#06x}")]
    UnknownClientType(u32),

    /// A structured payload (search conditions, offset-mask values) did not
    /// decode.
    #[error("invalid payload: {reason}")]
    InvalidPayload {
        /// What failed to decode.
        reason: String,
    },

    /// The peer closed the connection (zero-byte read).
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Hard transport error after bounded retries.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// The wire code a caller should answer with, when answering is still
    /// possible.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::StringTooLong { .. } | Self::BlobTooLarge { .. } => ErrorCode::TooBigData,
            Self::UnknownCommand(_) | Self::UnknownClientType(_) | Self::InvalidPayload { .. } => {
                ErrorCode::InvalidParameter
            },
            Self::ConnectionClosed | Self::Io(_) => ErrorCode::Io,
        }
    }

    /// Returns `true` when the transport itself is broken and the session
    /// must be torn down without attempting a reply.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Io(_))
    }

    /// Returns `true` when the stream is desynchronized: the daemon may still
    /// answer with an error code, but must drop the connection afterwards
    /// because it cannot know where the next request begins.
    #[must_use]
    pub const fn is_desync(&self) -> bool {
        matches!(
            self,
            Self::UnknownCommand(_)
                | Self::UnknownClientType(_)
                | Self::InvalidPayload { .. }
                | Self::StringTooLong { .. }
                | Self::BlobTooLarge { .. }
        )
    }
}

/// Result type for codec operations.
pub type WireResult<T> = Result<T, WireError>;
