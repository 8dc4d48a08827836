//! Search-condition payload for the find commands.
//!
//! [`SearchQuery`] is the structured argument of [`FindIds`] and
//! [`FindDuplicateIds`](crate::commands::CommandCode::FindDuplicateIds). It
//! travels as a flags word followed by the present fields in flag-bit order,
//! reusing the primitive encoders in [`wire`](crate::wire). Property filters
//! address columns by per-domain field id; column names never appear on the
//! wire.
//!
//! [`FindIds`]: crate::commands::CommandCode::FindIds

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{WireError, WireResult};
use crate::wire;

/// Flag: `parent` filter present.
pub const FLAG_PARENT: u32 = 1 << 0;
/// Flag: `item_type` filter present.
pub const FLAG_ITEM_TYPE: u32 = 1 << 1;
/// Flag: `is_operator` filter present.
pub const FLAG_IS_OPERATOR: u32 = 1 << 2;
/// Flag: date-bucket filter present.
pub const FLAG_DATE: u32 = 1 << 3;
/// Flag: keyword filter present.
pub const FLAG_KEYWORD: u32 = 1 << 4;
/// Flag: explicit limit/offset present.
pub const FLAG_LIMIT: u32 = 1 << 5;
/// Flag: keyword comparison skips URL-prefix normalization.
pub const FLAG_RAW_SEARCH: u32 = 1 << 6;
/// Flag: descending result order.
pub const FLAG_DESCENDING: u32 = 1 << 7;

const KNOWN_FLAGS: u32 = FLAG_PARENT
    | FLAG_ITEM_TYPE
    | FLAG_IS_OPERATOR
    | FLAG_DATE
    | FLAG_KEYWORD
    | FLAG_LIMIT
    | FLAG_RAW_SEARCH
    | FLAG_DESCENDING;

/// Date bucket, computed against local midnights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DateBucket {
    /// Today: `[midnight, midnight + 1d)`.
    Today = 0,
    /// Yesterday: `[midnight - 1d, midnight)`.
    Yesterday = 1,
    /// Last seven days up to now.
    LastSevenDays = 2,
    /// Last thirty days up to now.
    LastMonth = 3,
    /// Older than thirty days.
    Older = 4,
}

impl DateBucket {
    fn from_u32(value: u32) -> WireResult<Self> {
        match value {
            0 => Ok(Self::Today),
            1 => Ok(Self::Yesterday),
            2 => Ok(Self::LastSevenDays),
            3 => Ok(Self::LastMonth),
            4 => Ok(Self::Older),
            other => Err(WireError::InvalidPayload {
                reason: format!("unknown date bucket {other}"),
            }),
        }
    }
}

/// Date-bucket filter against a caller-selected timestamp column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateFilter {
    /// Field id of the timestamp column (creation, modification, or visit
    /// time, per domain schema).
    pub field: u32,
    /// Which bucket to keep.
    pub bucket: DateBucket,
}

/// Which columns a keyword is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KeywordScope {
    /// Title only.
    Title = 0,
    /// URL only.
    Url = 1,
    /// Title OR URL (the "inquired" search).
    TitleOrUrl = 2,
}

impl KeywordScope {
    fn from_u32(value: u32) -> WireResult<Self> {
        match value {
            0 => Ok(Self::Title),
            1 => Ok(Self::Url),
            2 => Ok(Self::TitleOrUrl),
            other => Err(WireError::InvalidPayload {
                reason: format!("unknown keyword scope {other}"),
            }),
        }
    }
}

/// Keyword filter. The keyword may carry `%`/`_` wildcard markers supplied by
/// the caller; comparison is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordFilter {
    /// Caller-supplied pattern.
    pub keyword: String,
    /// Columns to match.
    pub scope: KeywordScope,
    /// Skip URL-prefix normalization ("raw" search).
    pub raw: bool,
}

/// Structured search conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    /// Bookmark tree parent filter.
    pub parent: Option<i64>,
    /// Bookmark item-type filter (0 = item, 1 = folder).
    pub item_type: Option<i64>,
    /// Operator-provenance filter.
    pub is_operator: Option<i64>,
    /// Date-bucket filter.
    pub date: Option<DateFilter>,
    /// Keyword filter.
    pub keyword: Option<KeywordFilter>,
    /// Result limit; `None` lets the engine clamp by a count pre-pass.
    pub limit: Option<u32>,
    /// Result offset, only meaningful with `limit`.
    pub offset: u32,
    /// Field id of the ORDER BY column; 0 selects the creation timestamp.
    pub order_field: u32,
    /// Descending order instead of the ascending default.
    pub descending: bool,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            parent: None,
            item_type: None,
            is_operator: None,
            date: None,
            keyword: None,
            limit: None,
            offset: 0,
            order_field: 0,
            descending: false,
        }
    }
}

impl SearchQuery {
    /// Decode from a stream.
    ///
    /// # Errors
    ///
    /// [`WireError::InvalidPayload`] on unknown flags, buckets, or scopes;
    /// transport errors pass through.
    pub async fn read_from<S: AsyncRead + Unpin>(stream: &mut S) -> WireResult<Self> {
        let flags = wire::read_u32(stream).await?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(WireError::InvalidPayload {
                reason: format!("unknown search flags {:#010x}", flags & !KNOWN_FLAGS),
            });
        }

        let mut query = Self::default();
        if flags & FLAG_PARENT != 0 {
            query.parent = Some(wire::read_i64(stream).await?);
        }
        if flags & FLAG_ITEM_TYPE != 0 {
            query.item_type = Some(wire::read_i64(stream).await?);
        }
        if flags & FLAG_IS_OPERATOR != 0 {
            query.is_operator = Some(wire::read_i64(stream).await?);
        }
        if flags & FLAG_DATE != 0 {
            let field = wire::read_u32(stream).await?;
            let bucket = DateBucket::from_u32(wire::read_u32(stream).await?)?;
            query.date = Some(DateFilter { field, bucket });
        }
        if flags & FLAG_KEYWORD != 0 {
            let scope = KeywordScope::from_u32(wire::read_u32(stream).await?)?;
            let keyword = wire::read_string(stream).await?;
            query.keyword = Some(KeywordFilter {
                keyword,
                scope,
                raw: flags & FLAG_RAW_SEARCH != 0,
            });
        }
        if flags & FLAG_LIMIT != 0 {
            query.limit = Some(wire::read_u32(stream).await?);
            query.offset = wire::read_u32(stream).await?;
        }
        query.order_field = wire::read_u32(stream).await?;
        query.descending = flags & FLAG_DESCENDING != 0;
        Ok(query)
    }

    /// Encode onto a stream.
    pub async fn write_to<S: AsyncWrite + Unpin>(&self, stream: &mut S) -> WireResult<()> {
        let mut flags = 0;
        if self.parent.is_some() {
            flags |= FLAG_PARENT;
        }
        if self.item_type.is_some() {
            flags |= FLAG_ITEM_TYPE;
        }
        if self.is_operator.is_some() {
            flags |= FLAG_IS_OPERATOR;
        }
        if self.date.is_some() {
            flags |= FLAG_DATE;
        }
        if let Some(kw) = &self.keyword {
            flags |= FLAG_KEYWORD;
            if kw.raw {
                flags |= FLAG_RAW_SEARCH;
            }
        }
        if self.limit.is_some() {
            flags |= FLAG_LIMIT;
        }
        if self.descending {
            flags |= FLAG_DESCENDING;
        }

        wire::write_u32(stream, flags).await?;
        if let Some(parent) = self.parent {
            wire::write_i64(stream, parent).await?;
        }
        if let Some(item_type) = self.item_type {
            wire::write_i64(stream, item_type).await?;
        }
        if let Some(is_operator) = self.is_operator {
            wire::write_i64(stream, is_operator).await?;
        }
        if let Some(date) = self.date {
            wire::write_u32(stream, date.field).await?;
            wire::write_u32(stream, date.bucket as u32).await?;
        }
        if let Some(kw) = &self.keyword {
            wire::write_u32(stream, kw.scope as u32).await?;
            wire::write_string(stream, &kw.keyword).await?;
        }
        if let Some(limit) = self.limit {
            wire::write_u32(stream, limit).await?;
            wire::write_u32(stream, self.offset).await?;
        }
        wire::write_u32(stream, self.order_field).await
    }
}
