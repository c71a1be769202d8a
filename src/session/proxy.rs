//! C7 Session Proxy (spec.md §3, §4.7).
//!
//! Generalizes `examples/angkira-rpi-webrtc-streamer/rust/src/streaming/session.rs`'s
//! `SessionManager` (which allows multiple concurrent sessions) down to the
//! spec's single-active-peer slot: this crate serves exactly one browser
//! peer at a time.

use parking_lot::Mutex;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unregistered,
    Registered,
    DisconnectWait,
}

/// Identifies which signaling front-end owns the active session. Only one
/// front-end is expected to be live at a time (spec.md §4.7 invariant), but
/// the type accommodates more than one front-end kind per the original's
/// WebSocket-vs-direct-TCP split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontEnd {
    WebSocket,
    DirectTcp,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub front_end: FrontEnd,
    pub peer_id: String,
    pub peer_name: String,
    pub status: SessionStatus,
    pub socket_id: u64,
    pub room_id: String,
    pub offer_sdp: Option<String>,
}

/// Singleton holding the active session slot (spec.md §4.7). Signaling
/// front-ends hold only a shared reference to this; it exclusively owns the
/// "active session" slot.
pub struct SessionProxy {
    active: Mutex<Option<Session>>,
}

impl SessionProxy {
    pub fn new() -> Self {
        SessionProxy {
            active: Mutex::new(None),
        }
    }

    /// Atomically occupies the slot if empty. Fails with `SessionOccupied`
    /// if taken.
    pub fn obtain(
        &self,
        front_end: FrontEnd,
        peer_id: impl Into<String>,
        peer_name: impl Into<String>,
        room_id: impl Into<String>,
        socket_id: u64,
        offer_sdp: Option<String>,
    ) -> Result<(), SessionError> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(SessionError::SessionOccupied);
        }
        *active = Some(Session {
            front_end,
            peer_id: peer_id.into(),
            peer_name: peer_name.into(),
            status: SessionStatus::Registered,
            socket_id,
            room_id: room_id.into(),
            offer_sdp,
        });
        Ok(())
    }

    /// Releases only if `(front_end, peer_id)` matches the current
    /// occupant; no-op otherwise.
    pub fn release(&self, front_end: FrontEnd, peer_id: &str) {
        let mut active = self.active.lock();
        let matches = active
            .as_ref()
            .map(|s| s.front_end == front_end && s.peer_id == peer_id)
            .unwrap_or(false);
        if matches {
            *active = None;
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn current_peer_id(&self) -> Option<String> {
        self.active.lock().as_ref().map(|s| s.peer_id.clone())
    }

    /// Forwards to the WebRTC stack iff `peer_id` matches the occupant.
    /// Returns `true` if the message was accepted for forwarding.
    pub fn message_from_peer(&self, peer_id: &str) -> bool {
        self.active
            .lock()
            .as_ref()
            .map(|s| s.peer_id == peer_id)
            .unwrap_or(false)
    }

    /// Identifies which front-end currently owns the session, so the caller
    /// can route an outbound message (spec.md §4.7 `send_to_peer`).
    pub fn owning_front_end(&self, peer_id: &str) -> Option<FrontEnd> {
        self.active.lock().as_ref().and_then(|s| {
            if s.peer_id == peer_id {
                Some(s.front_end)
            } else {
                None
            }
        })
    }

    pub fn mark_disconnect_wait(&self, peer_id: &str) {
        let mut active = self.active.lock();
        if let Some(session) = active.as_mut() {
            if session.peer_id == peer_id {
                session.status = SessionStatus::DisconnectWait;
            }
        }
    }
}

impl Default for SessionProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obtain_succeeds_on_empty_slot() {
        let proxy = SessionProxy::new();
        assert!(proxy
            .obtain(FrontEnd::WebSocket, "peer-1", "alice", "room-1", 1, None)
            .is_ok());
        assert!(proxy.is_occupied());
    }

    #[test]
    fn second_register_fails_with_session_occupied_scenario_3() {
        let proxy = SessionProxy::new();
        proxy
            .obtain(FrontEnd::WebSocket, "1", "first", "room-1", 1, None)
            .unwrap();
        let second = proxy.obtain(FrontEnd::WebSocket, "3", "second", "room-1", 2, None);
        assert!(matches!(second, Err(SessionError::SessionOccupied)));
        // first session untouched
        assert_eq!(proxy.current_peer_id(), Some("1".to_string()));
    }

    #[test]
    fn release_is_noop_for_non_matching_occupant() {
        let proxy = SessionProxy::new();
        proxy
            .obtain(FrontEnd::WebSocket, "1", "first", "room-1", 1, None)
            .unwrap();
        proxy.release(FrontEnd::WebSocket, "not-the-peer");
        assert!(proxy.is_occupied());
    }

    #[test]
    fn release_frees_the_slot_for_matching_occupant() {
        let proxy = SessionProxy::new();
        proxy
            .obtain(FrontEnd::WebSocket, "1", "first", "room-1", 1, None)
            .unwrap();
        proxy.release(FrontEnd::WebSocket, "1");
        assert!(!proxy.is_occupied());
        assert!(proxy
            .obtain(FrontEnd::WebSocket, "2", "second", "room-2", 2, None)
            .is_ok());
    }

    #[test]
    fn message_from_peer_rejects_non_occupant() {
        let proxy = SessionProxy::new();
        proxy
            .obtain(FrontEnd::WebSocket, "1", "first", "room-1", 1, None)
            .unwrap();
        assert!(proxy.message_from_peer("1"));
        assert!(!proxy.message_from_peer("imposter"));
    }
}
