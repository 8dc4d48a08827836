//! Unix-socket server: bind, handshake, session workers, idle sweep.
//!
//! The listener lives in a daemon-owned directory with restrictive
//! permissions. Binding refuses to traverse a symlinked runtime directory
//! and cleans up a stale socket left by a crashed predecessor, but never
//! deletes a path that is not a socket.
//!
//! Each accepted connection is handshaken on the accept task: a `Connect`
//! spawns a session worker that owns the stream for the session's lifetime;
//! an `AttachNotify` hands the stream over to an existing session as its
//! notification channel and keeps no task at all.

use std::os::unix::fs::{DirBuilderExt, FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use bdp_core::{wire, ClientType, CommandCode, ErrorCode, WireError};

use crate::dispatch::{self, Outcome, SessionState};
use crate::policy::PeerIdentity;
use crate::slots::SlotTable;
use crate::state::DaemonContext;

/// The bound provider socket.
pub struct ProviderServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ProviderServer {
    /// Bind the provider socket, preparing its directory.
    ///
    /// # Errors
    ///
    /// Fails when the runtime directory is a symlink or cannot be created,
    /// when a non-socket file occupies the socket path, or when binding
    /// itself fails.
    pub fn bind(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            prepare_runtime_dir(dir)?;
        }
        remove_stale_socket(path)?;

        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        // Group access only; the directory mode already excludes others.
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
        info!(socket = %path.display(), "provider socket bound");
        Ok(Self { listener, path: path.to_path_buf() })
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Only a broken listener ends the loop with an error; per-connection
    /// failures are logged and absorbed.
    pub async fn run(&self, ctx: Arc<DaemonContext>, shutdown: Arc<Notify>) -> anyhow::Result<()> {
        let sweeper = tokio::spawn(idle_sweep(Arc::clone(&ctx)));
        loop {
            tokio::select! {
                () = shutdown.notified() => {
                    info!("shutdown requested, closing listener");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, _addr) = accepted.context("accept failed")?;
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(err) = handshake(ctx, stream).await {
                            debug!(%err, "connection ended during handshake");
                        }
                    });
                }
            }
        }
        sweeper.abort();
        Ok(())
    }

    /// Path the listener is bound to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProviderServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn prepare_runtime_dir(dir: &Path) -> anyhow::Result<()> {
    match std::fs::symlink_metadata(dir) {
        Ok(meta) if meta.file_type().is_symlink() => {
            anyhow::bail!("runtime directory {} is a symlink; refusing to use it", dir.display())
        }
        Ok(meta) if !meta.is_dir() => {
            anyhow::bail!("runtime path {} exists and is not a directory", dir.display())
        }
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .with_context(|| format!("failed to create runtime directory {}", dir.display())),
        Err(err) => {
            Err(err).with_context(|| format!("failed to inspect {}", dir.display()))
        }
    }
}

fn remove_stale_socket(path: &Path) -> anyhow::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            warn!(socket = %path.display(), "removing stale socket from a previous run");
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))
        }
        Ok(_) => {
            anyhow::bail!("socket path {} is occupied by a non-socket file", path.display())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to inspect {}", path.display())),
    }
}

/// First-envelope handling for a fresh connection.
async fn handshake(ctx: Arc<DaemonContext>, mut stream: UnixStream) -> anyhow::Result<()> {
    let peer = PeerIdentity::from_stream(&stream).context("failed to read peer credentials")?;
    let envelope = wire::read_envelope(&mut stream).await?;

    match envelope.command {
        CommandCode::Connect => {
            let tag = wire::read_u32(&mut stream).await?;
            let client_type = match ClientType::from_u32(tag) {
                Ok(client_type) => client_type,
                Err(err) => {
                    warn!(uid = peer.uid, %err, "connect with unknown client type");
                    wire::write_status(&mut stream, ErrorCode::InvalidParameter).await?;
                    return Ok(());
                }
            };
            let Some(lease) = ctx.slots.insert(client_type) else {
                warn!(uid = peer.uid, %client_type, "no session slot available");
                wire::write_status(&mut stream, ErrorCode::OutOfMemory).await?;
                return Ok(());
            };
            wire::write_status(&mut stream, ErrorCode::None).await?;
            wire::write_u32(&mut stream, lease.id).await?;
            info!(session = lease.id, %client_type, uid = peer.uid, "session connected");

            session_worker(ctx, stream, peer, client_type, lease).await;
            Ok(())
        }

        CommandCode::AttachNotify => {
            if !ctx.slots.contains(envelope.session_id) {
                warn!(session = envelope.session_id, "notify attach for unknown session");
                wire::write_status(&mut stream, ErrorCode::InvalidParameter).await?;
                return Ok(());
            }
            wire::write_status(&mut stream, ErrorCode::None).await?;
            let std_stream = stream.into_std().context("failed to unwrap notify stream")?;
            std_stream
                .set_nonblocking(true)
                .context("failed to set notify stream nonblocking")?;
            // The session may have died between the check and the adoption;
            // the channel is simply dropped then.
            if ctx.slots.set_notify_stream(envelope.session_id, std_stream) {
                debug!(session = envelope.session_id, "notification channel attached");
            }
            Ok(())
        }

        other => {
            warn!(uid = peer.uid, command = ?other, "first envelope is not a handshake");
            wire::write_status(&mut stream, ErrorCode::InvalidParameter).await?;
            Ok(())
        }
    }
}

/// Request loop of one session. Owns the stream; ends on disconnect,
/// transport failure, desync, cancellation, or a mid-request stall.
async fn session_worker(
    ctx: Arc<DaemonContext>,
    mut stream: UnixStream,
    peer: PeerIdentity,
    client_type: ClientType,
    lease: crate::slots::SlotLease,
) {
    let mut state = SessionState::new(lease.id, client_type, peer);
    let receive_timeout = Duration::from_millis(ctx.config.receive_timeout_ms);

    loop {
        let envelope = tokio::select! {
            () = lease.cancel.wait() => {
                debug!(session = lease.id, "session cancelled");
                break;
            }
            result = wire::read_envelope(&mut stream) => match result {
                Ok(envelope) => envelope,
                Err(WireError::ConnectionClosed) => {
                    debug!(session = lease.id, "peer closed the connection");
                    break;
                }
                Err(err) => {
                    warn!(session = lease.id, %err, "failed to read envelope");
                    if err.is_desync() {
                        let _ = wire::write_status(&mut stream, err.code()).await;
                    }
                    break;
                }
            }
        };
        SlotTable::touch(&lease.last_access);

        // A client that stalls mid-request would otherwise pin the worker
        // (and, under contention, a slot) forever.
        let handled =
            timeout(receive_timeout, dispatch::handle_command(&ctx, &mut state, &mut stream, &envelope))
                .await;
        match handled {
            Ok(Ok(Outcome::Continue)) => {}
            Ok(Ok(Outcome::Disconnect)) => {
                info!(session = lease.id, "session disconnected");
                break;
            }
            Ok(Err(err)) if err.is_fatal() => {
                debug!(session = lease.id, %err, "transport failed mid-request");
                break;
            }
            Ok(Err(err)) => {
                warn!(session = lease.id, %err, "request could not be parsed");
                let _ = wire::write_status(&mut stream, err.code()).await;
                break;
            }
            Err(_elapsed) => {
                warn!(session = lease.id, "request stalled past the receive timeout");
                break;
            }
        }
    }

    state.shm.release();
    ctx.slots.free(lease.index, lease.id);
}

/// Close sessions idle past the ceiling. Sessions holding a notification
/// callback are long-lived listeners and exempt.
async fn idle_sweep(ctx: Arc<DaemonContext>) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(ctx.config.idle_sweep_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let ceiling = ctx.config.idle_ceiling_secs;
    loop {
        ticker.tick().await;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        ctx.slots.visit_sessions(|session| {
            if session.notify_registered || session.cancel.is_cancelled() {
                return;
            }
            let last = session.last_access.load(std::sync::atomic::Ordering::Acquire);
            if now.saturating_sub(last) > ceiling {
                info!(session = session.id, idle_secs = now - last, "closing idle session");
                session.cancel.cancel();
            }
        });
    }
}

/// Run the daemon until `shutdown` fires.
///
/// # Errors
///
/// Binding or an accept-loop failure.
pub async fn serve(ctx: Arc<DaemonContext>, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let server = ProviderServer::bind(&ctx.config.socket_path)?;
    let result = server.run(ctx, shutdown).await;
    if let Err(err) = &result {
        error!(%err, "server loop failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_creates_directory_and_socket() {
        let runtime = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let path = runtime.path().join("nested").join("provider.sock");
        let server = ProviderServer::bind(&path).unwrap();
        assert!(path.exists());
        let meta = std::fs::metadata(runtime.path().join("nested")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn bind_replaces_a_stale_socket() {
        let runtime = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let path = runtime.path().join("provider.sock");
        let first = ProviderServer::bind(&path).unwrap();
        // Simulate a crash: the file stays behind.
        std::mem::forget(first);
        let second = ProviderServer::bind(&path).unwrap();
        assert_eq!(second.path(), path);
    }

    #[test]
    fn bind_refuses_a_non_socket_occupant() {
        let runtime = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let path = runtime.path().join("provider.sock");
        std::fs::write(&path, b"not a socket").unwrap();
        assert!(ProviderServer::bind(&path).is_err());
        // The occupant is left untouched.
        assert_eq!(std::fs::read(&path).unwrap(), b"not a socket");
    }

    #[test]
    fn bind_refuses_a_symlinked_runtime_dir() {
        let runtime = tempfile::tempdir().unwrap();
        let real = runtime.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = runtime.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        assert!(ProviderServer::bind(&link.join("provider.sock")).is_err());
    }

    #[test]
    fn socket_permissions_are_group_limited() {
        let runtime = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let path = runtime.path().join("provider.sock");
        let _server = ProviderServer::bind(&path).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o660);
    }
}
