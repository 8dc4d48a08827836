//! Data-changed notification fan-out.
//!
//! A session that registered a callback receives a 4-byte marker on its
//! dedicated notification connection whenever another session of the same
//! content family commits a change. The marker carries no payload; clients
//! re-query through the normal read commands.
//!
//! Delivery is best-effort. The notification stream is nonblocking; a peer
//! whose buffer is full simply misses the marker, which is acceptable
//! because the next marker (or the client's own refresh) catches it up. A
//! slow reader must never stall the writer that triggered the change.

use std::io::{ErrorKind, Write};

use tracing::{debug, warn};

use bdp_core::{ClientType, CommandCode};

use crate::slots::SlotTable;

/// Push a data-changed marker to every compatible registered session.
///
/// `origin_id` is excluded: the writer that made the change already knows.
/// Returns the number of peers the marker was written to.
pub fn fan_out(slots: &SlotTable, origin_id: u32, origin_type: ClientType) -> usize {
    let marker = CommandCode::NotifyChange.as_u32().to_le_bytes();
    let mut delivered = 0usize;

    slots.visit_sessions(|session| {
        if session.id == origin_id
            || !session.notify_registered
            || !session.client_type.is_compatible(origin_type)
            || session.cancel.is_cancelled()
        {
            return;
        }
        let Some(stream) = session.notify_stream.as_mut() else { return };
        match stream.write_all(&marker) {
            Ok(()) => {
                delivered += 1;
                debug!(session = session.id, origin = origin_id, "change marker delivered");
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                // Slow reader; it will catch up on its next refresh.
                warn!(session = session.id, "notification channel full, marker skipped");
            }
            Err(err) => {
                warn!(session = session.id, %err, "notification channel broken, dropping it");
                session.notify_stream = None;
            }
        }
    });

    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    fn pipe() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (a, b)
    }

    fn read_marker(stream: &mut UnixStream) -> u32 {
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        u32::from_le_bytes(buf)
    }

    #[test]
    fn marker_reaches_registered_same_family_peer() {
        let slots = SlotTable::new(4);
        let writer = slots.insert(ClientType::Bookmark).unwrap();
        let listener = slots.insert(ClientType::BookmarkSync).unwrap();

        let (daemon_end, mut client_end) = pipe();
        assert!(slots.set_notify_stream(listener.id, daemon_end));
        assert!(slots.set_notify_registered(listener.id, true));

        assert_eq!(fan_out(&slots, writer.id, ClientType::Bookmark), 1);
        assert_eq!(read_marker(&mut client_end), CommandCode::NotifyChange.as_u32());
    }

    #[test]
    fn origin_and_other_families_are_skipped() {
        let slots = SlotTable::new(4);
        let writer = slots.insert(ClientType::Bookmark).unwrap();
        let other_family = slots.insert(ClientType::History).unwrap();

        let (writer_end, _keep_w) = pipe();
        let (history_end, _keep_h) = pipe();
        slots.set_notify_stream(writer.id, writer_end);
        slots.set_notify_registered(writer.id, true);
        slots.set_notify_stream(other_family.id, history_end);
        slots.set_notify_registered(other_family.id, true);

        assert_eq!(fan_out(&slots, writer.id, ClientType::Bookmark), 0);
    }

    #[test]
    fn unregistered_peer_gets_nothing() {
        let slots = SlotTable::new(4);
        let writer = slots.insert(ClientType::Tab).unwrap();
        let listener = slots.insert(ClientType::TabSync).unwrap();

        let (daemon_end, _client_end) = pipe();
        slots.set_notify_stream(listener.id, daemon_end);
        // Callback never set.
        assert_eq!(fan_out(&slots, writer.id, ClientType::Tab), 0);
    }

    #[test]
    fn broken_channel_is_dropped_not_fatal() {
        let slots = SlotTable::new(4);
        let writer = slots.insert(ClientType::History).unwrap();
        let listener = slots.insert(ClientType::HistorySync).unwrap();

        let (daemon_end, client_end) = pipe();
        drop(client_end);
        slots.set_notify_stream(listener.id, daemon_end);
        slots.set_notify_registered(listener.id, true);

        assert_eq!(fan_out(&slots, writer.id, ClientType::History), 0);
        // Second fan-out finds no stream left.
        assert_eq!(fan_out(&slots, writer.id, ClientType::History), 0);
    }
}
