//! Post-handshake command dispatch.
//!
//! One request is processed to completion before the next envelope is read,
//! so request and reply bytes never interleave on a session's stream. Every
//! handler follows the same discipline: read the full request payload first,
//! then gate, then execute, then reply. Reading before gating keeps the
//! stream synchronized even when the answer is a denial.
//!
//! Replies open with a status code. After a non-success status nothing else
//! follows for that request; both sides resynchronize at the next envelope.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use bdp_core::{
    wire, ClientType, CommandCode, Envelope, ErrorCode, SearchQuery, TransferMethod, WireError,
    WireResult, MAX_BLOB_LEN,
};

use crate::notify;
use crate::policy::PeerIdentity;
use crate::shm::{ShmChannel, MAX_SEGMENT_LEN};
use crate::state::DaemonContext;
use crate::storage::{
    schema::{BlobKind, FIELD_BM_PARENT, FIELD_BM_TYPE},
    BlobData, FieldKind, FieldValue, StorageEngine, StorageError,
};

/// What the worker loop should do after a handled command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep reading envelopes.
    Continue,
    /// Orderly shutdown was requested.
    Disconnect,
}

/// Per-session dispatch state owned by the worker task.
pub struct SessionState {
    /// Session id minted at connect time.
    pub id: u32,
    /// Client-type tag from the handshake.
    pub client_type: ClientType,
    /// Peer credentials captured at accept time.
    pub peer: PeerIdentity,
    /// Lazily created shared-memory blob channel.
    pub shm: ShmChannel,
}

impl SessionState {
    /// Fresh dispatch state for a session.
    #[must_use]
    pub fn new(id: u32, client_type: ClientType, peer: PeerIdentity) -> Self {
        Self { id, client_type, peer, shm: ShmChannel::for_session(id) }
    }
}

/// Handle one post-handshake command.
///
/// # Errors
///
/// Transport and framing errors bubble up; the worker classifies them via
/// [`WireError::is_fatal`] / [`WireError::is_desync`].
pub async fn handle_command<S>(
    ctx: &DaemonContext,
    session: &mut SessionState,
    stream: &mut S,
    envelope: &Envelope,
) -> WireResult<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let command = envelope.command;
    let allowed =
        ctx.gate.allows(&session.peer, session.client_type, command.access_class());
    let store = ctx.store(session.client_type.family());

    match command {
        // Connect is a handshake-only command; a second one is a client bug.
        CommandCode::Connect | CommandCode::AttachNotify => {
            warn!(session = session.id, ?command, "handshake command on an established session");
            wire::write_status(stream, ErrorCode::InvalidParameter).await?;
            Ok(Outcome::Continue)
        }

        CommandCode::Disconnect => {
            wire::write_status(stream, ErrorCode::None).await?;
            Ok(Outcome::Disconnect)
        }

        CommandCode::SetNotifyCallback => {
            ctx.slots.set_notify_registered(session.id, true);
            wire::write_status(stream, ErrorCode::None).await?;
            Ok(Outcome::Continue)
        }

        CommandCode::UnsetNotifyCallback => {
            ctx.slots.set_notify_registered(session.id, false);
            wire::write_status(stream, ErrorCode::None).await?;
            Ok(Outcome::Continue)
        }

        CommandCode::NotifyChange => {
            let delivered = notify::fan_out(&ctx.slots, session.id, session.client_type);
            debug!(session = session.id, delivered, "change notification fanned out");
            wire::write_status(stream, ErrorCode::None).await?;
            Ok(Outcome::Continue)
        }

        CommandCode::GetFullIds
        | CommandCode::GetFullWithDeletedIds
        | CommandCode::GetDirtyIds
        | CommandCode::GetDeletedIds => {
            if !allowed {
                wire::write_status(stream, ErrorCode::PermissionDenied).await?;
                return Ok(Outcome::Continue);
            }
            let filter = match command {
                CommandCode::GetFullIds => crate::storage::IdFilter::Live,
                CommandCode::GetFullWithDeletedIds => crate::storage::IdFilter::WithDeleted,
                CommandCode::GetDirtyIds => crate::storage::IdFilter::Dirty,
                _ => crate::storage::IdFilter::Deleted,
            };
            match store.get_ids(filter) {
                Ok(ids) => wire::write_id_list(stream, &ids).await?,
                Err(err) => wire::write_status(stream, err.code()).await?,
            }
            Ok(Outcome::Continue)
        }

        CommandCode::GetRecordFields => {
            let mask = wire::read_u32(stream).await?;
            if !allowed {
                wire::write_status(stream, ErrorCode::PermissionDenied).await?;
                return Ok(Outcome::Continue);
            }
            match store.get_fields(envelope.record_id, mask) {
                Ok((present_mask, values)) => {
                    wire::write_status(stream, ErrorCode::None).await?;
                    wire::write_u32(stream, present_mask).await?;
                    for (field, value) in values {
                        match value {
                            FieldValue::Int(v) => wire::write_i64(stream, v).await?,
                            FieldValue::Text(v) => wire::write_string(stream, &v).await?,
                        }
                        debug_assert!(field.mask_bit & present_mask != 0);
                    }
                }
                Err(err) => wire::write_status(stream, err.code()).await?,
            }
            Ok(Outcome::Continue)
        }

        CommandCode::GetInt => {
            let field_id = wire::read_u32(stream).await?;
            if !allowed {
                wire::write_status(stream, ErrorCode::PermissionDenied).await?;
                return Ok(Outcome::Continue);
            }
            match store.get_int(envelope.record_id, field_id) {
                Ok(value) => {
                    wire::write_status(stream, ErrorCode::None).await?;
                    wire::write_i64(stream, value).await?;
                }
                Err(err) => wire::write_status(stream, err.code()).await?,
            }
            Ok(Outcome::Continue)
        }

        CommandCode::GetString => {
            let field_id = wire::read_u32(stream).await?;
            if !allowed {
                wire::write_status(stream, ErrorCode::PermissionDenied).await?;
                return Ok(Outcome::Continue);
            }
            match store.get_string(envelope.record_id, field_id) {
                Ok(value) => {
                    wire::write_status(stream, ErrorCode::None).await?;
                    wire::write_string(stream, &value).await?;
                }
                Err(err) => wire::write_status(stream, err.code()).await?,
            }
            Ok(Outcome::Continue)
        }

        CommandCode::GetBlob => {
            let kind_raw = wire::read_u32(stream).await?;
            let accepts_shm = wire::read_u32(stream).await? != 0;
            if !allowed {
                wire::write_status(stream, ErrorCode::PermissionDenied).await?;
                return Ok(Outcome::Continue);
            }
            handle_get_blob(session, store, stream, envelope.record_id, kind_raw, accepts_shm)
                .await?;
            Ok(Outcome::Continue)
        }

        CommandCode::FindIds | CommandCode::FindDuplicateIds => {
            let query = SearchQuery::read_from(stream).await?;
            if !allowed {
                wire::write_status(stream, ErrorCode::PermissionDenied).await?;
                return Ok(Outcome::Continue);
            }
            let result = if command == CommandCode::FindIds {
                store.find_ids(&query)
            } else {
                store.find_duplicate_ids(&query)
            };
            match result {
                Ok(ids) => wire::write_id_list(stream, &ids).await?,
                Err(err) => wire::write_status(stream, err.code()).await?,
            }
            Ok(Outcome::Continue)
        }

        CommandCode::CreateRecord => {
            if !allowed {
                wire::write_status(stream, ErrorCode::PermissionDenied).await?;
                return Ok(Outcome::Continue);
            }
            match store.create(envelope.record_id) {
                Ok(id) => {
                    wire::write_status(stream, ErrorCode::None).await?;
                    wire::write_i64(stream, id).await?;
                }
                Err(err) => wire::write_status(stream, err.code()).await?,
            }
            Ok(Outcome::Continue)
        }

        CommandCode::DeleteRecord => {
            if !allowed {
                wire::write_status(stream, ErrorCode::PermissionDenied).await?;
                return Ok(Outcome::Continue);
            }
            let result = handle_delete(ctx, session, store, envelope.record_id);
            match result {
                Ok(()) => wire::write_status(stream, ErrorCode::None).await?,
                Err(err) => wire::write_status(stream, err.code()).await?,
            }
            Ok(Outcome::Continue)
        }

        CommandCode::SetRecordFields => {
            let values = read_field_values(store, stream).await?;
            if !allowed {
                wire::write_status(stream, ErrorCode::PermissionDenied).await?;
                return Ok(Outcome::Continue);
            }
            match store.set_fields(envelope.record_id, &values) {
                Ok(()) => wire::write_status(stream, ErrorCode::None).await?,
                Err(err) => wire::write_status(stream, err.code()).await?,
            }
            Ok(Outcome::Continue)
        }

        CommandCode::SetInt => {
            let field_id = wire::read_u32(stream).await?;
            let value = wire::read_i64(stream).await?;
            if !allowed {
                wire::write_status(stream, ErrorCode::PermissionDenied).await?;
                return Ok(Outcome::Continue);
            }
            match store.set_int(envelope.record_id, field_id, value) {
                Ok(()) => wire::write_status(stream, ErrorCode::None).await?,
                Err(err) => wire::write_status(stream, err.code()).await?,
            }
            Ok(Outcome::Continue)
        }

        CommandCode::SetString => {
            let field_id = wire::read_u32(stream).await?;
            let value = wire::read_string(stream).await?;
            if !allowed {
                wire::write_status(stream, ErrorCode::PermissionDenied).await?;
                return Ok(Outcome::Continue);
            }
            match store.set_string(envelope.record_id, field_id, &value) {
                Ok(()) => wire::write_status(stream, ErrorCode::None).await?,
                Err(err) => wire::write_status(stream, err.code()).await?,
            }
            Ok(Outcome::Continue)
        }

        CommandCode::SetBlob => {
            handle_set_blob(session, store, stream, envelope.record_id, allowed).await?;
            Ok(Outcome::Continue)
        }

        CommandCode::ClearDirtyIds => {
            if !allowed {
                wire::write_status(stream, ErrorCode::PermissionDenied).await?;
                return Ok(Outcome::Continue);
            }
            match store.clear_dirty() {
                Ok(()) => wire::write_status(stream, ErrorCode::None).await?,
                Err(err) => wire::write_status(stream, err.code()).await?,
            }
            Ok(Outcome::Continue)
        }

        CommandCode::ClearDeletedIds => {
            if !allowed {
                wire::write_status(stream, ErrorCode::PermissionDenied).await?;
                return Ok(Outcome::Continue);
            }
            match store.clear_deleted() {
                Ok(()) => wire::write_status(stream, ErrorCode::None).await?,
                Err(err) => wire::write_status(stream, err.code()).await?,
            }
            Ok(Outcome::Continue)
        }
    }
}

/// Decode the offset-mask payload of `SetRecordFields`.
///
/// The payload of an unknown mask bit has no known length, so an unknown bit
/// desynchronizes the stream and is a framing error rather than a status.
async fn read_field_values<S: AsyncRead + Unpin>(
    store: &StorageEngine,
    stream: &mut S,
) -> WireResult<Vec<(u32, FieldValue)>> {
    let mask = wire::read_u32(stream).await?;
    let schema = store.schema();
    if mask & !schema.known_mask() != 0 {
        return Err(WireError::InvalidPayload {
            reason: format!("unknown offset-mask bits {:#010x}", mask & !schema.known_mask()),
        });
    }
    let mut values = Vec::new();
    for field in schema.fields {
        if field.mask_bit & mask == 0 {
            continue;
        }
        let value = match field.kind {
            FieldKind::Int => FieldValue::Int(wire::read_i64(stream).await?),
            FieldKind::Text => FieldValue::Text(wire::read_string(stream).await?),
        };
        values.push((field.id, value));
    }
    Ok(values)
}

async fn handle_get_blob<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut SessionState,
    store: &StorageEngine,
    stream: &mut S,
    record_id: i64,
    kind_raw: u32,
    accepts_shm: bool,
) -> WireResult<()> {
    let Some(kind) = BlobKind::from_u32(kind_raw) else {
        wire::write_status(stream, ErrorCode::InvalidParameter).await?;
        return Ok(());
    };
    let Some(table) = store.schema().blob_table(kind) else {
        wire::write_status(stream, ErrorCode::InvalidParameter).await?;
        return Ok(());
    };
    let blob = match store.get_blob(record_id, table) {
        Ok(blob) => blob,
        Err(err) => {
            wire::write_status(stream, err.code()).await?;
            return Ok(());
        }
    };

    // Prefer the shared segment; any shm failure silently degrades to
    // inline streaming.
    let method = if accepts_shm
        && blob.bytes.len() <= MAX_SEGMENT_LEN
        && session.shm.ensure(blob.bytes.len()).is_ok()
        && session.shm.write(&blob.bytes).is_ok()
    {
        TransferMethod::SharedMemory
    } else {
        TransferMethod::Inline
    };

    wire::write_status(stream, ErrorCode::None).await?;
    wire::write_u32(stream, method.as_u32()).await?;
    wire::write_i32(stream, blob.width).await?;
    wire::write_i32(stream, blob.height).await?;
    wire::write_u32(stream, blob.bytes.len() as u32).await?;
    if method == TransferMethod::Inline {
        wire::write_blob_body(stream, &blob.bytes).await?;
    }
    Ok(())
}

/// Two-stage blob write.
///
/// Stage one: the client announces kind, dimensions, length, and whether it
/// can use the shared segment; the daemon answers with a status and the
/// transfer method it chose. Stage two (success only): inline bytes on the
/// stream, or a one-word acknowledgement after the client filled the
/// segment. A final status closes the exchange.
async fn handle_set_blob<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut SessionState,
    store: &StorageEngine,
    stream: &mut S,
    record_id: i64,
    allowed: bool,
) -> WireResult<()> {
    let kind_raw = wire::read_u32(stream).await?;
    let width = wire::read_i32(stream).await?;
    let height = wire::read_i32(stream).await?;
    let len = wire::read_u32(stream).await? as usize;
    let via_shm = wire::read_u32(stream).await? != 0;

    if !allowed {
        wire::write_status(stream, ErrorCode::PermissionDenied).await?;
        return Ok(());
    }
    let table = BlobKind::from_u32(kind_raw).and_then(|kind| store.schema().blob_table(kind));
    let Some(table) = table else {
        wire::write_status(stream, ErrorCode::InvalidParameter).await?;
        return Ok(());
    };
    if len > MAX_BLOB_LEN {
        wire::write_status(stream, ErrorCode::TooBigData).await?;
        return Ok(());
    }

    let method = if via_shm && len <= MAX_SEGMENT_LEN && session.shm.ensure(len).is_ok() {
        TransferMethod::SharedMemory
    } else {
        TransferMethod::Inline
    };
    wire::write_status(stream, ErrorCode::None).await?;
    wire::write_u32(stream, method.as_u32()).await?;

    let bytes = match method {
        TransferMethod::Inline => wire::read_blob_body(stream, len).await?,
        TransferMethod::SharedMemory => {
            // The client fills the segment, then acknowledges.
            let _ack = wire::read_u32(stream).await?;
            match session.shm.read_copy(len) {
                Ok(bytes) => bytes,
                Err(err) => {
                    wire::write_status(stream, err.code()).await?;
                    return Ok(());
                }
            }
        }
    };

    let blob = BlobData { width, height, bytes };
    match store.set_blob(record_id, table, &blob) {
        Ok(()) => wire::write_status(stream, ErrorCode::None).await?,
        Err(err) => wire::write_status(stream, err.code()).await?,
    }
    Ok(())
}

/// Delete one record, a bookmark subtree, or (negative id) the whole table.
///
/// Deletes are soft while a sync counterpart of the domain is connected, so
/// the tombstones stay observable for reconciliation; with no sync client
/// around, or when the sync client itself deletes, the removal is immediate.
fn handle_delete(
    ctx: &DaemonContext,
    session: &SessionState,
    store: &StorageEngine,
    record_id: i64,
) -> Result<(), StorageError> {
    let family = session.client_type.family();
    let soft = !session.client_type.is_sync() && ctx.slots.sync_counterpart_connected(family);

    if record_id < 0 {
        for id in store.get_ids(crate::storage::IdFilter::Live)? {
            delete_one(store, id, soft)?;
        }
        return Ok(());
    }

    // A missing row or unset type column reads as "not a folder"; anything
    // else (busy disk, io) must abort before any row is removed, or a
    // folder delete could strand its subtree.
    let bm_type = if family == bdp_core::DomainFamily::Bookmark {
        match store.get_int(record_id, FIELD_BM_TYPE) {
            Ok(value) => value,
            Err(StorageError::IdNotFound(_) | StorageError::NoData) => 0,
            Err(err) => return Err(err),
        }
    } else {
        0
    };

    if bm_type == 1 {
        // Folder: remove the subtree, leaves first.
        let mut ordered = vec![record_id];
        let mut cursor = 0;
        while cursor < ordered.len() {
            let children = store.ids_where_int(FIELD_BM_PARENT, ordered[cursor])?;
            ordered.extend(children);
            cursor += 1;
        }
        for id in ordered.iter().rev() {
            delete_one(store, *id, soft)?;
        }
        return Ok(());
    }

    delete_one(store, record_id, soft)
}

fn delete_one(store: &StorageEngine, id: i64, soft: bool) -> Result<(), StorageError> {
    if soft {
        store.soft_delete(id)
    } else {
        store.delete(id)
    }
}
