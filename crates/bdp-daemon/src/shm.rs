//! Per-session shared-memory blob channel.
//!
//! Large image payloads (icons, page snapshots) can skip the second socket
//! copy: the daemon places the bytes in a POSIX shared-memory segment whose
//! name is derived from the session id, and the reply tells the client to
//! read from there instead of the stream. When the segment cannot be
//! prepared, or the payload exceeds the fixed ceiling, the caller falls back
//! to inline streaming through the wire codec.
//!
//! One global ceiling applies to every blob kind. The segment is created
//! lazily on first use and recreated larger (up to the ceiling) when a
//! payload outgrows it. [`ShmChannel::release`] is idempotent and also runs
//! on drop, so an evicted session cannot leak its segment.

use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use thiserror::Error;
use tracing::{debug, warn};

use bdp_core::ErrorCode;

/// Segment size used when no larger payload has been seen yet.
pub const DEFAULT_SEGMENT_LEN: usize = 512 * 1024;
/// Hard ceiling for any shared-memory transfer; larger payloads stream
/// inline.
pub const MAX_SEGMENT_LEN: usize = 4 * 1024 * 1024;

/// Shared-memory channel errors.
#[derive(Debug, Error)]
pub enum ShmError {
    /// Payload exceeds [`MAX_SEGMENT_LEN`]; caller must stream inline.
    #[error("payload of {0} bytes exceeds the shared segment ceiling")]
    TooBig(usize),
    /// Read/write before a successful `ensure`.
    #[error("shared segment not prepared")]
    NotReady,
    /// Requested length exceeds what the segment holds.
    #[error("read of {requested} bytes exceeds segment capacity {capacity}")]
    OutOfRange {
        /// Bytes asked for.
        requested: usize,
        /// Mapped capacity.
        capacity: usize,
    },
    /// Underlying system call failed.
    #[error("shared memory syscall failed: {0}")]
    Os(#[from] nix::errno::Errno),
}

impl ShmError {
    /// The wire code to answer with when no fallback applies.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::TooBig(_) | Self::OutOfRange { .. } => ErrorCode::TooBigData,
            Self::NotReady | Self::Os(_) => ErrorCode::OutOfMemory,
        }
    }
}

struct Mapping {
    ptr: NonNull<std::ffi::c_void>,
    len: usize,
}

// The mapping is only touched by the owning session's worker.
unsafe impl Send for Mapping {}

/// Per-session shared-memory segment, keyed by session id.
pub struct ShmChannel {
    name: String,
    mapping: Option<Mapping>,
    owner: bool,
}

impl ShmChannel {
    /// Channel for a daemon-side session; the segment is created lazily.
    #[must_use]
    pub fn for_session(session_id: u32) -> Self {
        Self { name: segment_name(session_id), mapping: None, owner: true }
    }

    /// Attach to an existing segment from the client side.
    ///
    /// # Errors
    ///
    /// [`ShmError::Os`] when the segment does not exist or cannot be mapped.
    pub fn open_existing(session_id: u32, len: usize) -> Result<Self, ShmError> {
        let name = segment_name(session_id);
        let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty())?;
        let mapping = map_fd(&fd, len)?;
        Ok(Self { name, mapping: Some(mapping), owner: false })
    }

    /// Lazily (re)create the segment so it can hold `len` bytes.
    ///
    /// The segment is sized to the larger of [`DEFAULT_SEGMENT_LEN`] and
    /// `len`. An existing segment big enough is kept as-is.
    ///
    /// # Errors
    ///
    /// [`ShmError::TooBig`] when `len` exceeds the ceiling — the caller must
    /// fall back to inline streaming; [`ShmError::Os`] on syscall failure.
    pub fn ensure(&mut self, len: usize) -> Result<(), ShmError> {
        if len > MAX_SEGMENT_LEN {
            return Err(ShmError::TooBig(len));
        }
        if let Some(mapping) = &self.mapping {
            if mapping.len >= len {
                return Ok(());
            }
            debug!(segment = %self.name, have = mapping.len, need = len, "growing shared segment");
        }
        self.release();

        let want = len.max(DEFAULT_SEGMENT_LEN);
        let fd = shm_open(
            self.name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        ftruncate(&fd, want as i64)?;
        self.mapping = Some(map_fd(&fd, want)?);
        debug!(segment = %self.name, len = want, "shared segment ready");
        Ok(())
    }

    /// Mapped capacity, zero before the first `ensure`.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mapping.as_ref().map_or(0, |m| m.len)
    }

    /// Copy `bytes` to the start of the segment.
    ///
    /// # Errors
    ///
    /// [`ShmError::NotReady`] before `ensure`; [`ShmError::OutOfRange`] when
    /// the payload does not fit.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), ShmError> {
        let mapping = self.mapping.as_ref().ok_or(ShmError::NotReady)?;
        if bytes.len() > mapping.len {
            return Err(ShmError::OutOfRange { requested: bytes.len(), capacity: mapping.len });
        }
        // Within bounds of a MAP_SHARED region owned by this channel.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                mapping.ptr.as_ptr().cast::<u8>(),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Copy `len` bytes out of the segment.
    ///
    /// # Errors
    ///
    /// As [`ShmChannel::write`].
    pub fn read_copy(&self, len: usize) -> Result<Vec<u8>, ShmError> {
        let mapping = self.mapping.as_ref().ok_or(ShmError::NotReady)?;
        if len > mapping.len {
            return Err(ShmError::OutOfRange { requested: len, capacity: mapping.len });
        }
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                mapping.ptr.as_ptr().cast::<u8>(),
                out.as_mut_ptr(),
                len,
            );
        }
        Ok(out)
    }

    /// Unmap and (for the owning side) unlink the segment. Idempotent.
    pub fn release(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            // Unmapping a region we mapped with this exact length.
            if let Err(err) = unsafe { munmap(mapping.ptr, mapping.len) } {
                warn!(segment = %self.name, %err, "failed to unmap shared segment");
            }
        }
        if self.owner {
            // The name may already be gone; release stays idempotent.
            let _ = shm_unlink(self.name.as_str());
        }
    }
}

impl Drop for ShmChannel {
    fn drop(&mut self) {
        self.release();
    }
}

fn segment_name(session_id: u32) -> String {
    format!("/bdp-shm-{session_id}")
}

fn map_fd(fd: &OwnedFd, len: usize) -> Result<Mapping, ShmError> {
    let size = NonZeroUsize::new(len).ok_or(ShmError::OutOfRange { requested: 0, capacity: 0 })?;
    // MAP_SHARED over a freshly sized shm fd; the fd may close after mmap.
    let ptr = unsafe {
        mmap(None, size, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, MapFlags::MAP_SHARED, fd, 0)
    }?;
    Ok(Mapping { ptr, len })
}
