//! Command codes, client-type tags, and access classes.
//!
//! Command codes are partitioned into three fixed numeric ranges which the
//! permission gate maps to capability classes:
//!
//! - basic (`0x0001..=0x00FF`): lifecycle and notification, always allowed
//! - read (`0x0100..=0x01FF`): requires the read capability
//! - write (`0x0200..=0x02FF`): requires the write capability
//!
//! Adding a code inside an existing range is backward compatible; moving a
//! code across ranges silently changes its capability class and is not.

use crate::error::WireError;

/// Lower bound of the read command range.
pub const READ_RANGE_START: u32 = 0x0100;
/// Lower bound of the write command range.
pub const WRITE_RANGE_START: u32 = 0x0200;
/// Exclusive upper bound of all command ranges.
pub const COMMAND_RANGE_END: u32 = 0x0300;

/// Capability class of a command, derived from its numeric range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessClass {
    /// Lifecycle and notification commands; never gated.
    Basic,
    /// Commands that only read stored data.
    Read,
    /// Commands that mutate stored data.
    Write,
}

/// Protocol command code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandCode {
    // Basic range.
    /// Connect handshake; followed by a `u32` client-type tag.
    Connect = 0x0001,
    /// Orderly session shutdown.
    Disconnect = 0x0002,
    /// Adopt this connection as the notification channel of an existing
    /// session (the envelope's `session_id` names it).
    AttachNotify = 0x0003,
    /// Register interest in data-changed notifications.
    SetNotifyCallback = 0x0004,
    /// Unregister notification interest.
    UnsetNotifyCallback = 0x0005,
    /// Fan a data-changed marker out to every other compatible session.
    NotifyChange = 0x0006,

    // Read range.
    /// Ids of all live records.
    GetFullIds = 0x0100,
    /// Ids of all records including soft-deleted tombstones.
    GetFullWithDeletedIds = 0x0101,
    /// Ids of live records with the dirty flag set.
    GetDirtyIds = 0x0102,
    /// Ids of soft-deleted records.
    GetDeletedIds = 0x0103,
    /// Offset-mask bulk field read.
    GetRecordFields = 0x0104,
    /// Single integer column read.
    GetInt = 0x0105,
    /// Single string column read.
    GetString = 0x0106,
    /// Image read; may negotiate a shared-memory transfer.
    GetBlob = 0x0107,
    /// Conditioned/keyword search returning an ordered id list.
    FindIds = 0x0108,
    /// Duplicate-detection search (title-or-URL, normalization always on).
    FindDuplicateIds = 0x0109,

    // Write range.
    /// Insert a bare record; the envelope's `record_id` is the requested id
    /// or negative for engine minting.
    CreateRecord = 0x0200,
    /// Delete a record (hard, or soft when a sync counterpart is connected).
    DeleteRecord = 0x0201,
    /// Offset-mask bulk field write.
    SetRecordFields = 0x0202,
    /// Single integer column write.
    SetInt = 0x0203,
    /// Single string column write.
    SetString = 0x0204,
    /// Image write; may negotiate a shared-memory transfer.
    SetBlob = 0x0205,
    /// Clear the dirty flag on every record.
    ClearDirtyIds = 0x0206,
    /// Hard-delete every soft-deleted record.
    ClearDeletedIds = 0x0207,
}

impl CommandCode {
    /// Decode a wire value.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnknownCommand`] for values outside every range;
    /// the caller must treat the stream as desynchronized.
    pub const fn from_u32(value: u32) -> Result<Self, WireError> {
        let code = match value {
            0x0001 => Self::Connect,
            0x0002 => Self::Disconnect,
            0x0003 => Self::AttachNotify,
            0x0004 => Self::SetNotifyCallback,
            0x0005 => Self::UnsetNotifyCallback,
            0x0006 => Self::NotifyChange,
            0x0100 => Self::GetFullIds,
            0x0101 => Self::GetFullWithDeletedIds,
            0x0102 => Self::GetDirtyIds,
            0x0103 => Self::GetDeletedIds,
            0x0104 => Self::GetRecordFields,
            0x0105 => Self::GetInt,
            0x0106 => Self::GetString,
            0x0107 => Self::GetBlob,
            0x0108 => Self::FindIds,
            0x0109 => Self::FindDuplicateIds,
            0x0200 => Self::CreateRecord,
            0x0201 => Self::DeleteRecord,
            0x0202 => Self::SetRecordFields,
            0x0203 => Self::SetInt,
            0x0204 => Self::SetString,
            0x0205 => Self::SetBlob,
            0x0206 => Self::ClearDirtyIds,
            0x0207 => Self::ClearDeletedIds,
            other => return Err(WireError::UnknownCommand(other)),
        };
        Ok(code)
    }

    /// Raw wire value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Capability class from the numeric range.
    #[must_use]
    pub const fn access_class(self) -> AccessClass {
        let value = self.as_u32();
        if value < READ_RANGE_START {
            AccessClass::Basic
        } else if value < WRITE_RANGE_START {
            AccessClass::Read
        } else {
            AccessClass::Write
        }
    }
}

/// Content domain family: one per database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainFamily {
    /// Bookmark tree.
    Bookmark,
    /// Open tabs.
    Tab,
    /// Visit history.
    History,
    /// Saved page snapshots.
    SavedPage,
}

impl DomainFamily {
    /// All families, in database-initialization order.
    pub const ALL: [Self; 4] = [Self::Bookmark, Self::Tab, Self::History, Self::SavedPage];
}

impl std::fmt::Display for DomainFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bookmark => write!(f, "bookmark"),
            Self::Tab => write!(f, "tab"),
            Self::History => write!(f, "history"),
            Self::SavedPage => write!(f, "saved-page"),
        }
    }
}

/// Client-type tag negotiated at connect time.
///
/// Each family has a plain client and a sync client; bookmarks additionally
/// have the carrier-customization (csc) client which is exempt from the
/// permission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ClientType {
    /// Browser bookmark client.
    Bookmark = 0x10,
    /// Bookmark synchronization client.
    BookmarkSync = 0x11,
    /// Carrier-customization bookmark tooling; unrestricted.
    BookmarkCsc = 0x12,
    /// Browser tab client.
    Tab = 0x20,
    /// Tab synchronization client.
    TabSync = 0x21,
    /// Browser history client.
    History = 0x30,
    /// History synchronization client.
    HistorySync = 0x31,
    /// Saved-page client.
    SavedPage = 0x40,
    /// Saved-page synchronization client.
    SavedPageSync = 0x41,
}

impl ClientType {
    /// Decode a wire tag.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnknownClientType`] for unrecognized tags.
    pub const fn from_u32(value: u32) -> Result<Self, WireError> {
        let tag = match value {
            0x10 => Self::Bookmark,
            0x11 => Self::BookmarkSync,
            0x12 => Self::BookmarkCsc,
            0x20 => Self::Tab,
            0x21 => Self::TabSync,
            0x30 => Self::History,
            0x31 => Self::HistorySync,
            0x40 => Self::SavedPage,
            0x41 => Self::SavedPageSync,
            other => return Err(WireError::UnknownClientType(other)),
        };
        Ok(tag)
    }

    /// Raw wire tag.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// The database family this client operates on.
    #[must_use]
    pub const fn family(self) -> DomainFamily {
        match self {
            Self::Bookmark | Self::BookmarkSync | Self::BookmarkCsc => DomainFamily::Bookmark,
            Self::Tab | Self::TabSync => DomainFamily::Tab,
            Self::History | Self::HistorySync => DomainFamily::History,
            Self::SavedPage | Self::SavedPageSync => DomainFamily::SavedPage,
        }
    }

    /// Returns `true` for synchronization clients.
    #[must_use]
    pub const fn is_sync(self) -> bool {
        matches!(self, Self::BookmarkSync | Self::TabSync | Self::HistorySync | Self::SavedPageSync)
    }

    /// Returns `true` when this client bypasses the permission gate.
    #[must_use]
    pub const fn is_unrestricted(self) -> bool {
        matches!(self, Self::BookmarkCsc)
    }

    /// Notification compatibility: same family, sync or not.
    #[must_use]
    pub fn is_compatible(self, other: Self) -> bool {
        self.family() == other.family()
    }
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bookmark => write!(f, "bookmark"),
            Self::BookmarkSync => write!(f, "bookmark-sync"),
            Self::BookmarkCsc => write!(f, "bookmark-csc"),
            Self::Tab => write!(f, "tab"),
            Self::TabSync => write!(f, "tab-sync"),
            Self::History => write!(f, "history"),
            Self::HistorySync => write!(f, "history-sync"),
            Self::SavedPage => write!(f, "saved-page"),
            Self::SavedPageSync => write!(f, "saved-page-sync"),
        }
    }
}

/// How a blob payload crosses the process boundary.
///
/// The daemon chooses per transfer and states its choice in the reply so the
/// client reads the correct channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TransferMethod {
    /// Length-prefixed chunks on the socket.
    Inline = 0,
    /// Payload already placed in the session's shared-memory segment.
    SharedMemory = 1,
}

impl TransferMethod {
    /// Decode a wire flag.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::InvalidPayload`] for unrecognized flags.
    pub fn from_u32(value: u32) -> Result<Self, WireError> {
        match value {
            0 => Ok(Self::Inline),
            1 => Ok(Self::SharedMemory),
            other => Err(WireError::InvalidPayload {
                reason: format!("unknown transfer method {other}"),
            }),
        }
    }

    /// Raw wire flag.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}
