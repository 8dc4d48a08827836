//! Per-domain table schemas, field catalogs, and offset-mask maps.
//!
//! Every domain is described by a static [`DomainSchema`]: one main table
//! whose rows are the records, plus image side tables keyed by the same id.
//! Commands address columns by numeric field id and bulk accessors select
//! them by offset mask; both are resolved here, so column names never come
//! from the wire and every generated statement binds values only.
//!
//! All main tables carry the engine-owned columns `id`, `is_deleted`,
//! `dirty`, `date_created`, `date_modified`. Those are reachable as fields
//! where it makes sense (the timestamps) but `id`, `is_deleted`, and `dirty`
//! are never settable through the field interface.

use bdp_core::DomainFamily;

/// Value type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// 64-bit integer column.
    Int,
    /// Text column.
    Text,
}

/// One addressable column of a domain's main table.
#[derive(Debug)]
pub struct FieldSpec {
    /// Wire field id.
    pub id: u32,
    /// Offset-mask bit for the bulk accessors.
    pub mask_bit: u32,
    /// Column name in the main table.
    pub column: &'static str,
    /// Value type.
    pub kind: FieldKind,
    /// Whether the field interface may write it.
    pub settable: bool,
}

/// Image attachment kind; each kind is one side table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlobKind {
    /// Small page icon.
    Favicon = 0,
    /// Page snapshot thumbnail.
    Thumbnail = 1,
    /// Large web-app icon.
    WebIcon = 2,
}

impl BlobKind {
    /// Decode a wire tag; `None` for unknown values.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Favicon),
            1 => Some(Self::Thumbnail),
            2 => Some(Self::WebIcon),
            _ => None,
        }
    }
}

/// Static description of one content domain.
#[derive(Debug)]
pub struct DomainSchema {
    /// Main table name.
    pub main_table: &'static str,
    /// Database file name under the data directory.
    pub db_file: &'static str,
    /// Addressable fields, in mask-bit order.
    pub fields: &'static [FieldSpec],
    /// Supported image kinds and their side tables.
    pub blob_tables: &'static [(BlobKind, &'static str)],
    /// Title column for keyword search, if the domain has one.
    pub title_column: Option<&'static str>,
    /// URL column for keyword search, if the domain has one.
    pub url_column: Option<&'static str>,
    /// Schema DDL, executed at open time.
    pub ddl: &'static str,
}

impl DomainSchema {
    /// Look a field up by wire id.
    #[must_use]
    pub fn field(&self, id: u32) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.id == id)
    }

    /// Side table for an image kind, if the domain supports it.
    #[must_use]
    pub fn blob_table(&self, kind: BlobKind) -> Option<&'static str> {
        self.blob_tables.iter().find(|(k, _)| *k == kind).map(|(_, t)| *t)
    }

    /// Every mask bit this domain understands.
    #[must_use]
    pub fn known_mask(&self) -> u32 {
        self.fields.iter().fold(0, |acc, f| acc | f.mask_bit)
    }
}

// Field ids shared by every domain.
/// Creation timestamp (unix seconds).
pub const FIELD_DATE_CREATED: u32 = 1;
/// Modification timestamp (unix seconds).
pub const FIELD_DATE_MODIFIED: u32 = 2;
/// Record title.
pub const FIELD_TITLE: u32 = 3;
/// Record URL.
pub const FIELD_URL: u32 = 4;

// Bookmark-specific field ids.
/// 0 = bookmark item, 1 = folder.
pub const FIELD_BM_TYPE: u32 = 10;
/// Parent folder id; 0 is the root.
pub const FIELD_BM_PARENT: u32 = 11;
/// Manual ordering inside a folder.
pub const FIELD_BM_SEQUENCE: u32 = 12;
/// Operator-provisioned provenance flag, consumed by sync clients.
pub const FIELD_BM_IS_OPERATOR: u32 = 13;
/// Whether the UI may edit the record.
pub const FIELD_BM_IS_EDITABLE: u32 = 14;
/// Last visit timestamp.
pub const FIELD_BM_DATE_VISITED: u32 = 15;
/// Opaque sync cookie.
pub const FIELD_BM_SYNC: u32 = 16;

// Tab-specific field ids.
/// Tab position within its window.
pub const FIELD_TAB_INDEX: u32 = 20;
/// Foreground flag.
pub const FIELD_TAB_IS_ACTIVATED: u32 = 21;
/// Private-browsing flag.
pub const FIELD_TAB_IS_INCOGNITO: u32 = 22;
/// Owning browser instance.
pub const FIELD_TAB_BROWSER_INSTANCE: u32 = 23;
/// Originating device id (multi-device sync).
pub const FIELD_TAB_DEVICE_ID: u32 = 24;
/// Originating device name.
pub const FIELD_TAB_DEVICE_NAME: u32 = 25;
/// Opaque sync cookie.
pub const FIELD_TAB_SYNC: u32 = 26;

// History-specific field ids.
/// Visit counter.
pub const FIELD_HIST_FREQUENCY: u32 = 30;
/// Last visit timestamp.
pub const FIELD_HIST_DATE_VISITED: u32 = 31;

// Saved-page-specific field ids.
/// Directory the snapshot is stored under.
pub const FIELD_SP_DIRECTORY: u32 = 40;
/// Snapshot file path.
pub const FIELD_SP_PATH: u32 = 41;

const BOOKMARK_FIELDS: &[FieldSpec] = &[
    FieldSpec { id: FIELD_BM_TYPE, mask_bit: 1 << 0, column: "type", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_BM_PARENT, mask_bit: 1 << 1, column: "parent", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_BM_SEQUENCE, mask_bit: 1 << 2, column: "sequence", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_BM_IS_OPERATOR, mask_bit: 1 << 3, column: "is_operator", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_BM_IS_EDITABLE, mask_bit: 1 << 4, column: "is_editable", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_TITLE, mask_bit: 1 << 5, column: "title", kind: FieldKind::Text, settable: true },
    FieldSpec { id: FIELD_URL, mask_bit: 1 << 6, column: "url", kind: FieldKind::Text, settable: true },
    FieldSpec { id: FIELD_BM_SYNC, mask_bit: 1 << 7, column: "sync", kind: FieldKind::Text, settable: true },
    FieldSpec { id: FIELD_DATE_CREATED, mask_bit: 1 << 8, column: "date_created", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_DATE_MODIFIED, mask_bit: 1 << 9, column: "date_modified", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_BM_DATE_VISITED, mask_bit: 1 << 10, column: "date_visited", kind: FieldKind::Int, settable: true },
];

const TAB_FIELDS: &[FieldSpec] = &[
    FieldSpec { id: FIELD_TAB_INDEX, mask_bit: 1 << 0, column: "tab_index", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_TAB_IS_ACTIVATED, mask_bit: 1 << 1, column: "is_activated", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_TAB_IS_INCOGNITO, mask_bit: 1 << 2, column: "is_incognito", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_TAB_BROWSER_INSTANCE, mask_bit: 1 << 3, column: "browser_instance", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_TITLE, mask_bit: 1 << 4, column: "title", kind: FieldKind::Text, settable: true },
    FieldSpec { id: FIELD_URL, mask_bit: 1 << 5, column: "url", kind: FieldKind::Text, settable: true },
    FieldSpec { id: FIELD_TAB_DEVICE_ID, mask_bit: 1 << 6, column: "device_id", kind: FieldKind::Text, settable: true },
    FieldSpec { id: FIELD_TAB_DEVICE_NAME, mask_bit: 1 << 7, column: "device_name", kind: FieldKind::Text, settable: true },
    FieldSpec { id: FIELD_TAB_SYNC, mask_bit: 1 << 8, column: "sync", kind: FieldKind::Text, settable: true },
    FieldSpec { id: FIELD_DATE_CREATED, mask_bit: 1 << 9, column: "date_created", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_DATE_MODIFIED, mask_bit: 1 << 10, column: "date_modified", kind: FieldKind::Int, settable: true },
];

const HISTORY_FIELDS: &[FieldSpec] = &[
    FieldSpec { id: FIELD_HIST_FREQUENCY, mask_bit: 1 << 0, column: "frequency", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_TITLE, mask_bit: 1 << 1, column: "title", kind: FieldKind::Text, settable: true },
    FieldSpec { id: FIELD_URL, mask_bit: 1 << 2, column: "url", kind: FieldKind::Text, settable: true },
    FieldSpec { id: FIELD_DATE_CREATED, mask_bit: 1 << 3, column: "date_created", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_DATE_MODIFIED, mask_bit: 1 << 4, column: "date_modified", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_HIST_DATE_VISITED, mask_bit: 1 << 5, column: "date_visited", kind: FieldKind::Int, settable: true },
];

const SAVED_PAGE_FIELDS: &[FieldSpec] = &[
    FieldSpec { id: FIELD_SP_DIRECTORY, mask_bit: 1 << 0, column: "directory", kind: FieldKind::Text, settable: true },
    FieldSpec { id: FIELD_SP_PATH, mask_bit: 1 << 1, column: "path", kind: FieldKind::Text, settable: true },
    FieldSpec { id: FIELD_TITLE, mask_bit: 1 << 2, column: "title", kind: FieldKind::Text, settable: true },
    FieldSpec { id: FIELD_URL, mask_bit: 1 << 3, column: "url", kind: FieldKind::Text, settable: true },
    FieldSpec { id: FIELD_DATE_CREATED, mask_bit: 1 << 4, column: "date_created", kind: FieldKind::Int, settable: true },
    FieldSpec { id: FIELD_DATE_MODIFIED, mask_bit: 1 << 5, column: "date_modified", kind: FieldKind::Int, settable: true },
];

const BOOKMARK_DDL: &str = "
CREATE TABLE IF NOT EXISTS bookmarks (
    id INTEGER PRIMARY KEY,
    type INTEGER NOT NULL DEFAULT 0,
    parent INTEGER NOT NULL DEFAULT 0,
    sequence INTEGER NOT NULL DEFAULT -1,
    is_operator INTEGER NOT NULL DEFAULT 0,
    is_editable INTEGER NOT NULL DEFAULT 1,
    title TEXT,
    url TEXT,
    sync TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    dirty INTEGER NOT NULL DEFAULT 0,
    date_created INTEGER NOT NULL DEFAULT 0,
    date_modified INTEGER NOT NULL DEFAULT 0,
    date_visited INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_bookmarks_parent ON bookmarks(parent);
CREATE INDEX IF NOT EXISTS idx_bookmarks_flags ON bookmarks(is_deleted, dirty);
CREATE TABLE IF NOT EXISTS favicons (
    id INTEGER PRIMARY KEY,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    data BLOB
);
CREATE TABLE IF NOT EXISTS thumbnails (
    id INTEGER PRIMARY KEY,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    data BLOB
);
CREATE TABLE IF NOT EXISTS webicons (
    id INTEGER PRIMARY KEY,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    data BLOB
);
";

const TAB_DDL: &str = "
CREATE TABLE IF NOT EXISTS tabs (
    id INTEGER PRIMARY KEY,
    tab_index INTEGER NOT NULL DEFAULT -1,
    is_activated INTEGER NOT NULL DEFAULT 0,
    is_incognito INTEGER NOT NULL DEFAULT 0,
    browser_instance INTEGER NOT NULL DEFAULT 0,
    title TEXT,
    url TEXT,
    device_id TEXT,
    device_name TEXT,
    sync TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    dirty INTEGER NOT NULL DEFAULT 0,
    date_created INTEGER NOT NULL DEFAULT 0,
    date_modified INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tabs_flags ON tabs(is_deleted, dirty);
CREATE TABLE IF NOT EXISTS favicons (
    id INTEGER PRIMARY KEY,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    data BLOB
);
CREATE TABLE IF NOT EXISTS thumbnails (
    id INTEGER PRIMARY KEY,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    data BLOB
);
";

const HISTORY_DDL: &str = "
CREATE TABLE IF NOT EXISTS history (
    id INTEGER PRIMARY KEY,
    frequency INTEGER NOT NULL DEFAULT 0,
    title TEXT,
    url TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    dirty INTEGER NOT NULL DEFAULT 0,
    date_created INTEGER NOT NULL DEFAULT 0,
    date_modified INTEGER NOT NULL DEFAULT 0,
    date_visited INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_history_flags ON history(is_deleted, dirty);
CREATE INDEX IF NOT EXISTS idx_history_visited ON history(date_visited);
CREATE TABLE IF NOT EXISTS favicons (
    id INTEGER PRIMARY KEY,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    data BLOB
);
CREATE TABLE IF NOT EXISTS thumbnails (
    id INTEGER PRIMARY KEY,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    data BLOB
);
CREATE TABLE IF NOT EXISTS webicons (
    id INTEGER PRIMARY KEY,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    data BLOB
);
";

const SAVED_PAGE_DDL: &str = "
CREATE TABLE IF NOT EXISTS saved_pages (
    id INTEGER PRIMARY KEY,
    directory TEXT,
    path TEXT,
    title TEXT,
    url TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    dirty INTEGER NOT NULL DEFAULT 0,
    date_created INTEGER NOT NULL DEFAULT 0,
    date_modified INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_saved_pages_flags ON saved_pages(is_deleted, dirty);
CREATE TABLE IF NOT EXISTS favicons (
    id INTEGER PRIMARY KEY,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    data BLOB
);
CREATE TABLE IF NOT EXISTS thumbnails (
    id INTEGER PRIMARY KEY,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    data BLOB
);
";

static BOOKMARK_SCHEMA: DomainSchema = DomainSchema {
    main_table: "bookmarks",
    db_file: "bookmarks.db",
    fields: BOOKMARK_FIELDS,
    blob_tables: &[
        (BlobKind::Favicon, "favicons"),
        (BlobKind::Thumbnail, "thumbnails"),
        (BlobKind::WebIcon, "webicons"),
    ],
    title_column: Some("title"),
    url_column: Some("url"),
    ddl: BOOKMARK_DDL,
};

static TAB_SCHEMA: DomainSchema = DomainSchema {
    main_table: "tabs",
    db_file: "tabs.db",
    fields: TAB_FIELDS,
    blob_tables: &[(BlobKind::Favicon, "favicons"), (BlobKind::Thumbnail, "thumbnails")],
    title_column: Some("title"),
    url_column: Some("url"),
    ddl: TAB_DDL,
};

static HISTORY_SCHEMA: DomainSchema = DomainSchema {
    main_table: "history",
    db_file: "history.db",
    fields: HISTORY_FIELDS,
    blob_tables: &[
        (BlobKind::Favicon, "favicons"),
        (BlobKind::Thumbnail, "thumbnails"),
        (BlobKind::WebIcon, "webicons"),
    ],
    title_column: Some("title"),
    url_column: Some("url"),
    ddl: HISTORY_DDL,
};

static SAVED_PAGE_SCHEMA: DomainSchema = DomainSchema {
    main_table: "saved_pages",
    db_file: "saved_pages.db",
    fields: SAVED_PAGE_FIELDS,
    blob_tables: &[(BlobKind::Favicon, "favicons"), (BlobKind::Thumbnail, "thumbnails")],
    title_column: Some("title"),
    url_column: Some("url"),
    ddl: SAVED_PAGE_DDL,
};

/// Static schema for a domain family.
#[must_use]
pub fn schema_for(family: DomainFamily) -> &'static DomainSchema {
    match family {
        DomainFamily::Bookmark => &BOOKMARK_SCHEMA,
        DomainFamily::Tab => &TAB_SCHEMA,
        DomainFamily::History => &HISTORY_SCHEMA,
        DomainFamily::SavedPage => &SAVED_PAGE_SCHEMA,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_bits_are_unique_per_domain() {
        for family in DomainFamily::ALL {
            let schema = schema_for(family);
            let mut seen = 0u32;
            for field in schema.fields {
                assert_eq!(seen & field.mask_bit, 0, "{family}: duplicate mask bit {:#x}", field.mask_bit);
                seen |= field.mask_bit;
            }
            assert_eq!(seen, schema.known_mask());
        }
    }

    #[test]
    fn field_ids_are_unique_per_domain() {
        for family in DomainFamily::ALL {
            let schema = schema_for(family);
            for field in schema.fields {
                let hits = schema.fields.iter().filter(|f| f.id == field.id).count();
                assert_eq!(hits, 1, "{family}: duplicate field id {}", field.id);
            }
        }
    }

    #[test]
    fn every_domain_resolves_common_fields() {
        for family in DomainFamily::ALL {
            let schema = schema_for(family);
            assert!(schema.field(FIELD_DATE_CREATED).is_some(), "{family}");
            assert!(schema.field(FIELD_DATE_MODIFIED).is_some(), "{family}");
            assert!(schema.field(FIELD_TITLE).is_some(), "{family}");
            assert!(schema.field(FIELD_URL).is_some(), "{family}");
        }
    }

    #[test]
    fn bookmark_supports_webicon_but_tab_does_not() {
        assert!(schema_for(DomainFamily::Bookmark).blob_table(BlobKind::WebIcon).is_some());
        assert!(schema_for(DomainFamily::Tab).blob_table(BlobKind::WebIcon).is_none());
    }

    #[test]
    fn blob_kind_tags_round_trip() {
        assert_eq!(BlobKind::from_u32(0), Some(BlobKind::Favicon));
        assert_eq!(BlobKind::from_u32(1), Some(BlobKind::Thumbnail));
        assert_eq!(BlobKind::from_u32(2), Some(BlobKind::WebIcon));
        assert_eq!(BlobKind::from_u32(3), None);
    }
}
