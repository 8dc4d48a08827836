//! Async wire codec: envelopes, status codes, strings, and chunked blobs.
//!
//! Pure protocol layer with no business logic. Every read validates declared
//! lengths BEFORE allocating, retries transient interruptions a bounded
//! number of times, and treats a zero-byte read as the terminal
//! [`WireError::ConnectionClosed`].
//!
//! Callers must not interleave partial writes from two tasks on one stream;
//! the session layer upholds this by processing one request to completion per
//! worker before accepting the next.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::commands::CommandCode;
use crate::error::{ErrorCode, WireError, WireResult};

/// Size of the fixed command envelope.
pub const ENVELOPE_LEN: usize = 16;
/// Maximum encoded string length in bytes.
pub const MAX_STRING_LEN: usize = 4096;
/// Maximum blob length in bytes, validated before allocation.
pub const MAX_BLOB_LEN: usize = 16 * 1024 * 1024;
/// Chunk size for streaming large blobs.
pub const BLOB_CHUNK: usize = 64 * 1024;
/// Bounded retry budget for interrupted reads and writes.
pub const MAX_INTERRUPT_RETRIES: u32 = 8;

/// Fixed-size command envelope opening every exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Command code, validated on decode.
    pub command: CommandCode,
    /// Session id; 0 during the connect handshake.
    pub session_id: u32,
    /// Target record id; negative means "no specific record".
    pub record_id: i64,
}

impl Envelope {
    /// Build an envelope addressing the whole table.
    #[must_use]
    pub const fn new(command: CommandCode, session_id: u32) -> Self {
        Self { command, session_id, record_id: -1 }
    }

    /// Build an envelope addressing one record.
    #[must_use]
    pub const fn with_record(command: CommandCode, session_id: u32, record_id: i64) -> Self {
        Self { command, session_id, record_id }
    }
}

async fn read_exact_retry<S>(stream: &mut S, buf: &mut [u8]) -> WireResult<()>
where
    S: AsyncRead + Unpin,
{
    let mut attempts = 0;
    loop {
        match stream.read_exact(buf).await {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                attempts += 1;
                if attempts > MAX_INTERRUPT_RETRIES {
                    return Err(WireError::Io(e));
                }
            },
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(WireError::ConnectionClosed);
            },
            Err(e) => return Err(WireError::Io(e)),
        }
    }
}

async fn write_all_retry<S>(stream: &mut S, buf: &[u8]) -> WireResult<()>
where
    S: AsyncWrite + Unpin,
{
    let mut attempts = 0;
    loop {
        match stream.write_all(buf).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                attempts += 1;
                if attempts > MAX_INTERRUPT_RETRIES {
                    return Err(WireError::Io(e));
                }
            },
            Err(e) => return Err(WireError::Io(e)),
        }
    }
}

/// Read one `u32`.
pub async fn read_u32<S: AsyncRead + Unpin>(stream: &mut S) -> WireResult<u32> {
    let mut buf = [0u8; 4];
    read_exact_retry(stream, &mut buf).await?;
    Ok(u32::from_le_bytes(buf))
}

/// Write one `u32`.
pub async fn write_u32<S: AsyncWrite + Unpin>(stream: &mut S, value: u32) -> WireResult<()> {
    write_all_retry(stream, &value.to_le_bytes()).await
}

/// Read one `i32`.
pub async fn read_i32<S: AsyncRead + Unpin>(stream: &mut S) -> WireResult<i32> {
    let mut buf = [0u8; 4];
    read_exact_retry(stream, &mut buf).await?;
    Ok(i32::from_le_bytes(buf))
}

/// Write one `i32`.
pub async fn write_i32<S: AsyncWrite + Unpin>(stream: &mut S, value: i32) -> WireResult<()> {
    write_all_retry(stream, &value.to_le_bytes()).await
}

/// Read one `i64`.
pub async fn read_i64<S: AsyncRead + Unpin>(stream: &mut S) -> WireResult<i64> {
    let mut buf = [0u8; 8];
    read_exact_retry(stream, &mut buf).await?;
    Ok(i64::from_le_bytes(buf))
}

/// Write one `i64`.
pub async fn write_i64<S: AsyncWrite + Unpin>(stream: &mut S, value: i64) -> WireResult<()> {
    write_all_retry(stream, &value.to_le_bytes()).await
}

/// Read and validate a command envelope.
///
/// # Errors
///
/// [`WireError::UnknownCommand`] on an unrecognized code (desync),
/// [`WireError::ConnectionClosed`] on EOF.
pub async fn read_envelope<S: AsyncRead + Unpin>(stream: &mut S) -> WireResult<Envelope> {
    let mut buf = [0u8; ENVELOPE_LEN];
    read_exact_retry(stream, &mut buf).await?;
    let raw_command = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let session_id = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let record_id = i64::from_le_bytes([
        buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
    ]);
    Ok(Envelope {
        command: CommandCode::from_u32(raw_command)?,
        session_id,
        record_id,
    })
}

/// Write a command envelope as exactly one framed write.
pub async fn write_envelope<S: AsyncWrite + Unpin>(
    stream: &mut S,
    envelope: &Envelope,
) -> WireResult<()> {
    let mut buf = [0u8; ENVELOPE_LEN];
    buf[0..4].copy_from_slice(&envelope.command.as_u32().to_le_bytes());
    buf[4..8].copy_from_slice(&envelope.session_id.to_le_bytes());
    buf[8..16].copy_from_slice(&envelope.record_id.to_le_bytes());
    write_all_retry(stream, &buf).await
}

/// Read a reply status code.
pub async fn read_status<S: AsyncRead + Unpin>(stream: &mut S) -> WireResult<ErrorCode> {
    Ok(ErrorCode::from_i32(read_i32(stream).await?))
}

/// Write a reply status code.
pub async fn write_status<S: AsyncWrite + Unpin>(
    stream: &mut S,
    code: ErrorCode,
) -> WireResult<()> {
    write_i32(stream, code.as_i32()).await
}

/// Read a length-prefixed string.
///
/// Invalid UTF-8 is replaced rather than rejected; stored titles come from
/// arbitrary page content.
///
/// # Errors
///
/// [`WireError::StringTooLong`] when the declared length exceeds
/// [`MAX_STRING_LEN`]; the length is checked before any allocation.
pub async fn read_string<S: AsyncRead + Unpin>(stream: &mut S) -> WireResult<String> {
    let len = read_u32(stream).await? as usize;
    if len > MAX_STRING_LEN {
        return Err(WireError::StringTooLong { len, max: MAX_STRING_LEN });
    }
    let mut buf = vec![0u8; len];
    read_exact_retry(stream, &mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Write a length-prefixed string.
///
/// # Errors
///
/// [`WireError::StringTooLong`] when the string exceeds [`MAX_STRING_LEN`].
pub async fn write_string<S: AsyncWrite + Unpin>(stream: &mut S, value: &str) -> WireResult<()> {
    let bytes = value.as_bytes();
    if bytes.len() > MAX_STRING_LEN {
        return Err(WireError::StringTooLong { len: bytes.len(), max: MAX_STRING_LEN });
    }
    write_u32(stream, bytes.len() as u32).await?;
    write_all_retry(stream, bytes).await
}

/// Read a length-prefixed blob, streamed in [`BLOB_CHUNK`] pieces.
///
/// # Errors
///
/// [`WireError::BlobTooLarge`] when the declared length exceeds
/// [`MAX_BLOB_LEN`]; the length is checked before any allocation.
pub async fn read_blob<S: AsyncRead + Unpin>(stream: &mut S) -> WireResult<Vec<u8>> {
    let len = read_u32(stream).await? as usize;
    read_blob_body(stream, len).await
}

/// Read `len` raw blob bytes (the length prefix was already consumed).
pub async fn read_blob_body<S: AsyncRead + Unpin>(
    stream: &mut S,
    len: usize,
) -> WireResult<Vec<u8>> {
    if len > MAX_BLOB_LEN {
        return Err(WireError::BlobTooLarge { len, max: MAX_BLOB_LEN });
    }
    let mut out = Vec::with_capacity(len);
    let mut chunk = [0u8; BLOB_CHUNK];
    let mut remaining = len;
    while remaining > 0 {
        let take = remaining.min(BLOB_CHUNK);
        read_exact_retry(stream, &mut chunk[..take]).await?;
        out.extend_from_slice(&chunk[..take]);
        remaining -= take;
    }
    Ok(out)
}

/// Write a length-prefixed blob, streamed in [`BLOB_CHUNK`] pieces.
///
/// # Errors
///
/// [`WireError::BlobTooLarge`] when the blob exceeds [`MAX_BLOB_LEN`].
pub async fn write_blob<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> WireResult<()> {
    if bytes.len() > MAX_BLOB_LEN {
        return Err(WireError::BlobTooLarge { len: bytes.len(), max: MAX_BLOB_LEN });
    }
    write_u32(stream, bytes.len() as u32).await?;
    write_blob_body(stream, bytes).await
}

/// Write raw blob bytes without a length prefix.
pub async fn write_blob_body<S: AsyncWrite + Unpin>(
    stream: &mut S,
    bytes: &[u8],
) -> WireResult<()> {
    for chunk in bytes.chunks(BLOB_CHUNK) {
        write_all_retry(stream, chunk).await?;
    }
    Ok(())
}

/// Write an id-list reply: status, count, then the ids.
pub async fn write_id_list<S: AsyncWrite + Unpin>(stream: &mut S, ids: &[i64]) -> WireResult<()> {
    write_status(stream, ErrorCode::None).await?;
    write_u32(stream, ids.len() as u32).await?;
    for id in ids {
        write_i64(stream, *id).await?;
    }
    Ok(())
}

/// Read an id-list reply body (after a successful status).
pub async fn read_id_list<S: AsyncRead + Unpin>(stream: &mut S) -> WireResult<Vec<i64>> {
    let count = read_u32(stream).await? as usize;
    // Never size a buffer by the peer's raw count alone.
    let mut ids = Vec::with_capacity(count.min(u16::MAX as usize));
    for _ in 0..count {
        ids.push(read_i64(stream).await?);
    }
    Ok(ids)
}
