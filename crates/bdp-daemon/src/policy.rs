//! Per-request permission gate.
//!
//! Every session is bound to the peer credentials captured at accept time.
//! Basic commands (lifecycle, notification) always pass; read and write
//! commands are checked against the policy on every request, never cached,
//! so a policy change takes effect on the next envelope. The
//! carrier-customization client is exempt by design.

use std::io;

use tokio::net::UnixStream;
use tracing::debug;

use bdp_core::{AccessClass, ClientType, DomainFamily};

/// Credentials of the connecting process, captured once at accept time.
#[derive(Debug, Clone, Copy)]
pub struct PeerIdentity {
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
    /// Process id, when the platform reports one.
    pub pid: Option<i32>,
}

impl PeerIdentity {
    /// Read the peer credentials off an accepted socket.
    ///
    /// # Errors
    ///
    /// Propagates the `SO_PEERCRED` failure; the connection is refused.
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let cred = stream.peer_cred()?;
        Ok(Self { uid: cred.uid(), gid: cred.gid(), pid: cred.pid() })
    }
}

/// Access-control policy consulted per request.
pub trait PolicyDecision: Send + Sync {
    /// Whether `peer` may perform a command of `class` against `domain`.
    fn check(&self, peer: &PeerIdentity, domain: DomainFamily, class: AccessClass) -> bool;
}

/// Default policy: the daemon's own user, or a member of its primary group,
/// may read and write every domain.
pub struct SameUserPolicy {
    uid: u32,
    gid: u32,
}

impl SameUserPolicy {
    /// Policy anchored to the daemon's own credentials.
    #[must_use]
    pub fn new() -> Self {
        Self { uid: nix::unistd::getuid().as_raw(), gid: nix::unistd::getgid().as_raw() }
    }
}

impl Default for SameUserPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyDecision for SameUserPolicy {
    fn check(&self, peer: &PeerIdentity, _domain: DomainFamily, _class: AccessClass) -> bool {
        peer.uid == self.uid || peer.gid == self.gid
    }
}

/// The gate a session consults before dispatching each command.
pub struct Gate {
    policy: Box<dyn PolicyDecision>,
}

impl Gate {
    /// Gate backed by `policy`.
    #[must_use]
    pub fn new(policy: Box<dyn PolicyDecision>) -> Self {
        Self { policy }
    }

    /// Decide one request. Called on every envelope; results are never
    /// cached across requests.
    #[must_use]
    pub fn allows(&self, peer: &PeerIdentity, client_type: ClientType, class: AccessClass) -> bool {
        if matches!(class, AccessClass::Basic) {
            return true;
        }
        if client_type.is_unrestricted() {
            return true;
        }
        let allowed = self.policy.check(peer, client_type.family(), class);
        if !allowed {
            debug!(uid = peer.uid, client_type = %client_type, ?class, "permission denied");
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyAll;
    impl PolicyDecision for DenyAll {
        fn check(&self, _: &PeerIdentity, _: DomainFamily, _: AccessClass) -> bool {
            false
        }
    }

    struct ReadOnly;
    impl PolicyDecision for ReadOnly {
        fn check(&self, _: &PeerIdentity, _: DomainFamily, class: AccessClass) -> bool {
            matches!(class, AccessClass::Read)
        }
    }

    fn peer() -> PeerIdentity {
        PeerIdentity { uid: 1000, gid: 1000, pid: Some(4242) }
    }

    #[test]
    fn basic_commands_bypass_the_policy() {
        let gate = Gate::new(Box::new(DenyAll));
        assert!(gate.allows(&peer(), ClientType::History, AccessClass::Basic));
    }

    #[test]
    fn read_and_write_consult_the_policy() {
        let gate = Gate::new(Box::new(ReadOnly));
        assert!(gate.allows(&peer(), ClientType::History, AccessClass::Read));
        assert!(!gate.allows(&peer(), ClientType::History, AccessClass::Write));
    }

    #[test]
    fn csc_client_is_exempt() {
        let gate = Gate::new(Box::new(DenyAll));
        assert!(gate.allows(&peer(), ClientType::BookmarkCsc, AccessClass::Write));
        assert!(!gate.allows(&peer(), ClientType::Bookmark, AccessClass::Write));
    }

    #[test]
    fn same_user_policy_matches_uid_or_gid() {
        let policy = SameUserPolicy { uid: 500, gid: 600 };
        let same_uid = PeerIdentity { uid: 500, gid: 999, pid: None };
        let same_gid = PeerIdentity { uid: 999, gid: 600, pid: None };
        let stranger = PeerIdentity { uid: 999, gid: 999, pid: None };
        assert!(policy.check(&same_uid, DomainFamily::Bookmark, AccessClass::Write));
        assert!(policy.check(&same_gid, DomainFamily::Tab, AccessClass::Read));
        assert!(!policy.check(&stranger, DomainFamily::History, AccessClass::Read));
    }
}
