//! Session boundary - the daemon's core security check
//!
//! The socket file is reachable by any process the OS permits, so mode bits
//! alone are not the boundary. Every request must come from the same
//! interactive login session as the daemon's owner, not merely the same
//! uid. Ambient state (process environment, /proc) is captured once into an
//! explicit [`SessionContext`] so the verification logic stays testable
//! without a real OS session.

use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Kernel value for "no audit session assigned".
const UNSET_SESSION_ID: &str = "4294967295";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("peer uid {peer} does not match daemon owner uid {owner}")]
    UidMismatch { peer: u32, owner: u32 },

    #[error("peer login session '{peer}' does not match daemon session '{owner}'")]
    SessionMismatch { peer: String, owner: String },
}

/// The daemon's own identity: login session id and uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Login session identifier (audit session id on Linux)
    pub session_id: String,
    /// Uid the daemon runs as
    pub uid: u32,
}

impl SessionContext {
    /// Capture the current process's session identity.
    ///
    /// Resolution order: `XDG_SESSION_ID` from the environment, the audit
    /// session id from `/proc/self/sessionid`, then a uid-derived fallback
    /// for hosts without either (containers, non-Linux).
    pub fn current() -> Self {
        let uid = unsafe { libc::getuid() };
        let session_id = std::env::var("XDG_SESSION_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| proc_session_id("self"))
            .unwrap_or_else(|| uid_session_id(uid));
        Self { session_id, uid }
    }

    /// Deterministic socket path for this (login session, owner) pair.
    /// Distinct owners get distinct daemons, isolating otherwise-identical
    /// tooling on one machine.
    pub fn socket_path(&self, owner: &str) -> PathBuf {
        let runtime = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        runtime
            .join("keyrack")
            .join(format!("keyrack-{}-{}.sock", self.session_id, owner))
    }
}

/// What the platform socket API tells us about the connecting peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    pub uid: u32,
    pub pid: Option<i32>,
}

/// Session id derived from a peer's credentials. Falls back to the
/// uid-derived form when the pid is unknown or /proc has no answer, which
/// pairs with the same fallback in [`SessionContext::current`].
pub fn peer_session_id(peer: &PeerIdentity) -> String {
    peer.pid
        .and_then(|pid| proc_session_id(&pid.to_string()))
        .unwrap_or_else(|| uid_session_id(peer.uid))
}

/// Verify the connecting peer belongs to the daemon owner's login session.
/// Runs on every request: unix peer credentials are per-connection.
pub fn verify_peer(ctx: &SessionContext, peer: &PeerIdentity) -> Result<(), SessionError> {
    if peer.uid != ctx.uid {
        return Err(SessionError::UidMismatch { peer: peer.uid, owner: ctx.uid });
    }
    let peer_session = peer_session_id(peer);
    if peer_session != ctx.session_id {
        return Err(SessionError::SessionMismatch {
            peer: peer_session,
            owner: ctx.session_id.clone(),
        });
    }
    Ok(())
}

fn proc_session_id(pid: &str) -> Option<String> {
    let content = fs::read_to_string(format!("/proc/{}/sessionid", pid)).ok()?;
    let id = content.trim().to_string();
    if id.is_empty() || id == UNSET_SESSION_ID {
        None
    } else {
        Some(id)
    }
}

fn uid_session_id(uid: u32) -> String {
    format!("uid-{}", uid)
}
