use super::SessionId;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub owner: String,
    pub ttl_ms: u64,
    pub last_heartbeat_ms: u64,
    pub state: SessionState,
}

impl Session {
    fn overdue(&self, now_ms: u64) -> bool {
        self.last_heartbeat_ms.saturating_add(self.ttl_ms) < now_ms
    }
}

/// Server side liveness of client sessions. Expired sessions stay on record so late calls can be told apart from
/// calls with made up ids, both are refused.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: u64,
    sessions: BTreeMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn create(&mut self, owner: String, ttl_ms: u64, now_ms: u64) -> SessionId {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        self.sessions.insert(
            id,
            Session {
                owner,
                ttl_ms,
                last_heartbeat_ms: now_ms,
                state: SessionState::Active,
            },
        );
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn is_active(&self, id: SessionId) -> bool {
        matches!(self.sessions.get(&id), Some(s) if s.state == SessionState::Active)
    }

    /// Refreshes an active session, false if it is unknown or already expired
    pub fn heartbeat(&mut self, id: SessionId, now_ms: u64) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) if session.state == SessionState::Active => {
                session.last_heartbeat_ms = session.last_heartbeat_ms.max(now_ms);
                true
            }
            _ => false,
        }
    }

    /// Marks a session expired, false if it was not active
    pub fn close(&mut self, id: SessionId) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) if session.state == SessionState::Active => {
                session.state = SessionState::Expired;
                true
            }
            _ => false,
        }
    }

    pub fn any_overdue(&self, now_ms: u64) -> bool {
        self.sessions
            .values()
            .any(|s| s.state == SessionState::Active && s.overdue(now_ms))
    }

    /// Expires every active session which missed its heartbeats, returning them in id order
    pub fn expire(&mut self, now_ms: u64) -> Vec<SessionId> {
        let mut expired = vec![];
        for (&id, session) in self.sessions.iter_mut() {
            if session.state == SessionState::Active && session.overdue(now_ms) {
                session.state = SessionState::Expired;
                expired.push(id);
            }
        }
        expired
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state == SessionState::Active)
            .count()
    }
}
