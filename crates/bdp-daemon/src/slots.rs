//! Bounded session pool.
//!
//! The daemon serves at most a fixed number of concurrent sessions. Each
//! session occupies one slot in a preallocated table; when a new client
//! connects with the table full, the session with the stalest last-access
//! stamp is cancelled and its slot handed to the newcomer. Eviction does not
//! interrupt a request in flight: the victim's worker observes the
//! cancellation between requests and tears itself down. Table scans use
//! `try_lock` and skip a slot whose mutex is momentarily held by another
//! scan rather than blocking on it.
//!
//! Slots hold only control-plane state (cancellation flag, last-access
//! stamp, notification channel). The socket itself stays owned by the
//! session's worker task; eviction is cooperative through [`SessionCancel`].

use std::collections::HashSet;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use bdp_core::ClientType;

/// Cooperative cancellation handle shared between a slot and its worker.
///
/// Cancellation is level-triggered: `cancel` flips the flag and wakes any
/// waiter, and `wait` returns immediately once the flag is set, so the order
/// of cancel and wait never loses the signal.
#[derive(Debug, Default)]
pub struct SessionCancel {
    flag: AtomicBool,
    notify: Notify,
}

impl SessionCancel {
    /// Request cancellation and wake the worker.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolve once cancellation is requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the flag so a cancel landing in
            // between is not lost.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Control-plane state of one connected session.
pub struct SessionHandle {
    /// Non-zero session id handed to the client at connect time.
    pub id: u32,
    /// Client-type tag from the handshake.
    pub client_type: ClientType,
    /// Unix-seconds stamp of the last request, shared with the worker.
    pub last_access: Arc<AtomicU64>,
    /// Cancellation handle shared with the worker.
    pub cancel: Arc<SessionCancel>,
    /// Whether the session asked for data-changed notifications.
    pub notify_registered: bool,
    /// The adopted notification connection, in nonblocking mode.
    pub notify_stream: Option<UnixStream>,
}

impl SessionHandle {
    fn new(id: u32, client_type: ClientType) -> Self {
        Self {
            id,
            client_type,
            last_access: Arc::new(AtomicU64::new(unix_now())),
            cancel: Arc::new(SessionCancel::default()),
            notify_registered: false,
            notify_stream: None,
        }
    }
}

/// Outcome of inserting a session into the table.
pub struct SlotLease {
    /// Index the session occupies; pass it back to [`SlotTable::free`].
    pub index: usize,
    /// Minted session id.
    pub id: u32,
    /// Last-access stamp shared with the slot.
    pub last_access: Arc<AtomicU64>,
    /// Cancellation handle shared with the slot.
    pub cancel: Arc<SessionCancel>,
}

/// Fixed-capacity table of session slots.
pub struct SlotTable {
    slots: Vec<Mutex<Option<SessionHandle>>>,
    active_ids: Mutex<HashSet<u32>>,
}

impl SlotTable {
    /// Table with `capacity` slots, all empty.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            active_ids: Mutex::new(HashSet::new()),
        }
    }

    /// Insert a new session, evicting the least recently used idle session
    /// when the table is full.
    ///
    /// Returns `None` only when every slot is either mid-request or pinned
    /// by an unevictable session; the caller refuses the connection.
    pub fn insert(&self, client_type: ClientType) -> Option<SlotLease> {
        let id = self.mint_session_id();
        let handle = SessionHandle::new(id, client_type);
        let lease = |index: usize, handle: &SessionHandle| SlotLease {
            index,
            id,
            last_access: Arc::clone(&handle.last_access),
            cancel: Arc::clone(&handle.cancel),
        };

        // First pass: take any empty slot.
        for (index, slot) in self.slots.iter().enumerate() {
            let Ok(mut guard) = slot.try_lock() else { continue };
            if guard.is_none() {
                let out = lease(index, &handle);
                *guard = Some(handle);
                return Some(out);
            }
        }

        // Table full: evict the stalest idle session. A contended slot is
        // actively serving a request and is skipped.
        let mut victim: Option<(usize, u64)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            let Ok(guard) = slot.try_lock() else { continue };
            if let Some(existing) = guard.as_ref() {
                if existing.cancel.is_cancelled() {
                    continue;
                }
                let stamp = existing.last_access.load(Ordering::Acquire);
                if victim.map_or(true, |(_, best)| stamp < best) {
                    victim = Some((index, stamp));
                }
            }
        }
        let Some((index, _)) = victim else {
            self.retire_id(id);
            return None;
        };

        let Ok(mut guard) = self.slots[index].try_lock() else {
            self.retire_id(id);
            return None;
        };
        if let Some(existing) = guard.as_ref() {
            info!(
                evicted = existing.id,
                client_type = %existing.client_type,
                incoming = id,
                "session table full, evicting least recently used session"
            );
            existing.cancel.cancel();
        }
        let out = lease(index, &handle);
        *guard = Some(handle);
        Some(out)
    }

    /// Release a slot at session teardown.
    ///
    /// The id check keeps a slow teardown from freeing a slot that eviction
    /// already handed to a newer session.
    pub fn free(&self, index: usize, id: u32) {
        if let Some(slot) = self.slots.get(index) {
            if let Ok(mut guard) = slot.lock() {
                if guard.as_ref().is_some_and(|s| s.id == id) {
                    *guard = None;
                }
            }
        }
        self.retire_id(id);
        debug!(session = id, slot = index, "session slot released");
    }

    /// Stamp a session's last-access time (used by the request loop).
    pub fn touch(last_access: &AtomicU64) {
        last_access.store(unix_now(), Ordering::Release);
    }

    /// Flag or unflag a session's notification interest.
    pub fn set_notify_registered(&self, id: u32, registered: bool) -> bool {
        self.with_session_mut(id, |session| session.notify_registered = registered)
    }

    /// Adopt `stream` as the notification channel of session `id`.
    ///
    /// Returns `false` when no such session exists (the channel is dropped).
    pub fn set_notify_stream(&self, id: u32, stream: UnixStream) -> bool {
        self.with_session_mut(id, |session| {
            if session.notify_stream.is_some() {
                warn!(session = id, "replacing existing notification channel");
            }
            session.notify_stream = Some(stream);
        })
    }

    /// Run `visit` over every currently idle session.
    ///
    /// Slots mid-request are skipped; callers must tolerate that.
    pub fn visit_sessions<F: FnMut(&mut SessionHandle)>(&self, mut visit: F) {
        for slot in &self.slots {
            if let Ok(mut guard) = slot.try_lock() {
                if let Some(session) = guard.as_mut() {
                    visit(session);
                }
            }
        }
    }

    /// Whether a sync client of `family` is currently connected.
    ///
    /// Drives the soft-versus-hard delete decision: tombstones are only
    /// worth keeping while someone is there to reconcile them.
    #[must_use]
    pub fn sync_counterpart_connected(&self, family: bdp_core::DomainFamily) -> bool {
        let mut found = false;
        self.visit_sessions(|session| {
            if session.client_type.is_sync()
                && session.client_type.family() == family
                && !session.cancel.is_cancelled()
            {
                found = true;
            }
        });
        found
    }

    /// Number of occupied slots (idle sessions only; mid-request slots are
    /// counted as occupied by skipping them).
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active_ids.lock().map_or(0, |ids| ids.len())
    }

    /// Whether a session with this id currently occupies a slot.
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.active_ids.lock().map_or(false, |ids| ids.contains(&id))
    }

    fn with_session_mut<F: FnOnce(&mut SessionHandle)>(&self, id: u32, apply: F) -> bool {
        for slot in &self.slots {
            if let Ok(mut guard) = slot.lock() {
                if let Some(session) = guard.as_mut() {
                    if session.id == id {
                        apply(session);
                        return true;
                    }
                }
            }
        }
        false
    }

    fn mint_session_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        let mut ids = match self.active_ids.lock() {
            Ok(ids) => ids,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            let candidate: u32 = rng.gen_range(1..=u32::MAX);
            if ids.insert(candidate) {
                return candidate;
            }
        }
    }

    fn retire_id(&self, id: u32) {
        let mut ids = match self.active_ids.lock() {
            Ok(ids) => ids,
            Err(poisoned) => poisoned.into_inner(),
        };
        ids.remove(&id);
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdp_core::DomainFamily;

    #[test]
    fn insert_fills_empty_slots_first() {
        let table = SlotTable::new(3);
        let a = table.insert(ClientType::Bookmark).unwrap();
        let b = table.insert(ClientType::History).unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.index, b.index);
        assert_eq!(table.active_count(), 2);
    }

    #[test]
    fn full_table_evicts_least_recently_used() {
        let table = SlotTable::new(2);
        let old = table.insert(ClientType::Bookmark).unwrap();
        let fresh = table.insert(ClientType::Tab).unwrap();
        old.last_access.store(100, Ordering::Release);
        fresh.last_access.store(200, Ordering::Release);

        let incoming = table.insert(ClientType::History).unwrap();
        assert_eq!(incoming.index, old.index);
        assert!(old.cancel.is_cancelled());
        assert!(!fresh.cancel.is_cancelled());
    }

    #[test]
    fn free_is_id_checked() {
        let table = SlotTable::new(1);
        let first = table.insert(ClientType::Bookmark).unwrap();
        let second = table.insert(ClientType::Tab).unwrap();
        assert_eq!(first.index, second.index);

        // The evicted session's late teardown must not free the reused slot.
        table.free(first.index, first.id);
        assert!(table.set_notify_registered(second.id, true));

        table.free(second.index, second.id);
        assert!(!table.set_notify_registered(second.id, true));
    }

    #[test]
    fn session_ids_are_unique_and_nonzero() {
        let table = SlotTable::new(8);
        let mut seen = HashSet::new();
        for _ in 0..8 {
            let lease = table.insert(ClientType::History).unwrap();
            assert_ne!(lease.id, 0);
            assert!(seen.insert(lease.id));
        }
    }

    #[test]
    fn sync_counterpart_detection_is_per_family() {
        let table = SlotTable::new(4);
        table.insert(ClientType::Bookmark).unwrap();
        table.insert(ClientType::HistorySync).unwrap();
        assert!(table.sync_counterpart_connected(DomainFamily::History));
        assert!(!table.sync_counterpart_connected(DomainFamily::Bookmark));
        assert!(!table.sync_counterpart_connected(DomainFamily::Tab));
    }

    #[tokio::test]
    async fn cancel_wakes_a_pending_wait() {
        let cancel = Arc::new(SessionCancel::default());
        let waiter = {
            let cancel = Arc::clone(&cancel);
            tokio::spawn(async move { cancel.wait().await })
        };
        cancel.cancel();
        waiter.await.unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn wait_after_cancel_returns_immediately() {
        let cancel = SessionCancel::default();
        cancel.cancel();
        cancel.wait().await;
    }
}
