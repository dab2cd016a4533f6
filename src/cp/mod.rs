//! The replicated state machine behind the coordination primitives.
//!
//! Every server applies the same [`Command`]s in log order, so all state here is a pure function of the log:
//! time only enters through the `now_ms` carried by session commands, and session expiry happens when the leader
//! proposes [`Operation::ExpireSessions`].
//!
//! Primitives live in one table per type and are created on first reference by name.

mod atomic_ref;
mod latch;
mod lock;
mod session;

pub use self::atomic_ref::RefState;
pub use self::latch::LatchState;
pub use self::lock::{LockState, LockStatus};
pub use self::session::{Session, SessionRegistry, SessionState};

use super::log::Index;
use super::state_machine::StateMachine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Outcomes remembered per session for retried sequence numbers
pub const DEDUP_WINDOW: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issued on every new acquisition of a lock, strictly increasing per lock name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FencingToken(pub u64);

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The names of the primitive instances the owner protocol coordinates through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimitiveNames {
    pub lock: String,
    pub photo_ref: String,
    pub notifier: String,
}

impl Default for PrimitiveNames {
    fn default() -> Self {
        PrimitiveNames {
            lock: "lock".into(),
            photo_ref: "photo".into(),
            notifier: "notifier".into(),
        }
    }
}

/// Presented with a fenced write: the write only applies while `lock` is held under `token`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FenceCheck {
    pub lock: String,
    pub token: FencingToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    CreateSession { owner: String, ttl_ms: u64, now_ms: u64 },
    Heartbeat { session: SessionId, now_ms: u64 },
    CloseSession { session: SessionId },
    ExpireSessions { now_ms: u64 },

    Lock { name: String, session: SessionId, invocation: u64 },
    CancelLock { name: String, session: SessionId, invocation: u64 },
    Unlock { name: String, session: SessionId },
    LockStatus { name: String },
    GetFence { name: String },

    RefGet { name: String },
    RefSet { name: String, value: Option<Vec<u8>> },
    RefCompareAndSet {
        name: String,
        expected_generation: u64,
        value: Option<Vec<u8>>,
        fence: Option<FenceCheck>,
    },

    LatchTrySetCount { name: String, count: u32 },
    LatchCountDown { name: String },
    LatchGet { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// the session sending this command, which enables de-duplication of retries
    pub caller: Option<SessionId>,
    /// per session sequence number, 0 for commands which are safe to repeat
    pub seq: u64,
    pub op: Operation,
}

impl Command {
    pub fn anonymous(op: Operation) -> Self {
        Command {
            caller: None,
            seq: 0,
            op,
        }
    }

    pub fn from_session(caller: SessionId, seq: u64, op: Operation) -> Self {
        Command {
            caller: Some(caller),
            seq,
            op,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Done,
    SessionCreated(SessionId),
    Expired(Vec<SessionId>),
    Acquired(FencingToken),
    Queued { position: usize },
    Cancelled,
    Released { remaining: u32 },
    LockStatus(LockStatus),
    Fence(FencingToken),
    Value { value: Option<Vec<u8>>, generation: u64 },
    Written { generation: u64 },
    Swapped { swapped: bool, generation: u64 },
    CountSet(bool),
    Count { remaining: u32, round: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpError {
    #[error("session {0} has expired")]
    SessionExpired(SessionId),
    #[error("session does not hold lock '{name}'")]
    NotOwner { name: String },
    #[error("stale fence for '{lock}': presented {presented}, current {current}")]
    StaleFence {
        lock: String,
        presented: u64,
        current: u64,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Outcome = Result<Reply, OpError>;

#[derive(Debug, Default)]
struct Dedup {
    outcomes: BTreeMap<SessionId, VecDeque<(u64, Outcome)>>,
}

impl Dedup {
    fn get(&self, session: SessionId, seq: u64) -> Option<&Outcome> {
        self.outcomes
            .get(&session)?
            .iter()
            .find(|(s, _)| *s == seq)
            .map(|(_, outcome)| outcome)
    }

    fn record(&mut self, session: SessionId, seq: u64, outcome: Outcome) {
        let window = self.outcomes.entry(session).or_default();
        if window.len() == DEDUP_WINDOW {
            window.pop_front();
        }
        window.push_back((seq, outcome));
    }

    fn forget(&mut self, session: SessionId) {
        self.outcomes.remove(&session);
    }
}

#[derive(Debug, Default)]
pub struct CpStateMachine {
    locks: BTreeMap<String, LockState>,
    refs: BTreeMap<String, RefState>,
    latches: BTreeMap<String, LatchState>,
    sessions: SessionRegistry,
    dedup: Dedup,
    /// latest time seen in any command
    clock_ms: u64,
}

impl CpStateMachine {
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn lock_status(&self, name: &str) -> LockStatus {
        self.locks
            .get(name)
            .map(LockState::status)
            .unwrap_or_else(|| LockState::default().status())
    }

    pub fn ref_generation(&self, name: &str) -> u64 {
        self.refs.get(name).map_or(0, RefState::generation)
    }

    pub fn clock_ms(&self) -> u64 {
        self.clock_ms
    }

    fn tick(&mut self, now_ms: u64) -> u64 {
        self.clock_ms = self.clock_ms.max(now_ms);
        self.clock_ms
    }

    fn require_active(&self, session: SessionId) -> Result<(), OpError> {
        if self.sessions.is_active(session) {
            Ok(())
        } else {
            Err(OpError::SessionExpired(session))
        }
    }

    /// Releases everything a session held and queued for
    fn end_session(&mut self, session: SessionId) {
        self.dedup.forget(session);
        for (name, lock) in self.locks.iter_mut() {
            if lock.evict(session, &self.sessions) {
                ::log::debug!(
                    "lock '{}' released by ended session {}, now held by {:?} with fence {}",
                    name,
                    session,
                    lock.holder(),
                    lock.fence()
                );
            }
        }
    }

    fn check_fence(&self, fence: &Option<FenceCheck>) -> Result<(), OpError> {
        match fence {
            None => Ok(()),
            Some(FenceCheck { lock, token }) => match self.locks.get(lock) {
                Some(state) => state.check_fence(lock, *token),
                None => Err(OpError::StaleFence {
                    lock: lock.clone(),
                    presented: token.0,
                    current: 0,
                }),
            },
        }
    }

    fn execute(&mut self, index: Index, op: &Operation) -> Outcome {
        match op {
            Operation::CreateSession {
                owner,
                ttl_ms,
                now_ms,
            } => {
                let now = self.tick(*now_ms);
                let id = self.sessions.create(owner.clone(), *ttl_ms, now);
                ::log::debug!("session {} created for '{}'", id, owner);
                Ok(Reply::SessionCreated(id))
            }
            Operation::Heartbeat { session, now_ms } => {
                let now = self.tick(*now_ms);
                if self.sessions.heartbeat(*session, now) {
                    Ok(Reply::Done)
                } else {
                    Err(OpError::SessionExpired(*session))
                }
            }
            Operation::CloseSession { session } => {
                if self.sessions.close(*session) {
                    self.end_session(*session);
                }
                Ok(Reply::Done)
            }
            Operation::ExpireSessions { now_ms } => {
                let now = self.tick(*now_ms);
                let expired = self.sessions.expire(now);
                for &session in &expired {
                    ::log::debug!("session {} expired", session);
                    self.end_session(session);
                }
                Ok(Reply::Expired(expired))
            }

            Operation::Lock {
                name,
                session,
                invocation,
            } => {
                self.require_active(*session)?;
                Ok(self
                    .locks
                    .entry(name.clone())
                    .or_default()
                    .acquire(*session, *invocation, index))
            }
            Operation::CancelLock {
                name,
                session,
                invocation,
            } => {
                self.require_active(*session)?;
                Ok(match self.locks.get_mut(name) {
                    Some(lock) => lock.cancel(*session, *invocation),
                    None => Reply::Cancelled,
                })
            }
            Operation::Unlock { name, session } => {
                self.require_active(*session)?;
                match self.locks.get_mut(name) {
                    Some(lock) => lock.release(name, *session, &self.sessions),
                    None => Err(OpError::NotOwner { name: name.clone() }),
                }
            }
            Operation::LockStatus { name } => Ok(Reply::LockStatus(self.lock_status(name))),
            Operation::GetFence { name } => Ok(Reply::Fence(
                self.locks
                    .get(name)
                    .map_or(FencingToken(0), LockState::fence),
            )),

            Operation::RefGet { name } => Ok(self.refs.get(name).cloned().unwrap_or_default().get()),
            Operation::RefSet { name, value } => Ok(self.refs.entry(name.clone()).or_default().set(value.clone())),
            Operation::RefCompareAndSet {
                name,
                expected_generation,
                value,
                fence,
            } => {
                self.check_fence(fence)?;
                Ok(self
                    .refs
                    .entry(name.clone())
                    .or_default()
                    .compare_and_set(*expected_generation, value.clone()))
            }

            Operation::LatchTrySetCount { name, count } => self
                .latches
                .entry(name.clone())
                .or_default()
                .try_set_count(*count),
            Operation::LatchCountDown { name } => Ok(self.latches.entry(name.clone()).or_default().count_down()),
            Operation::LatchGet { name } => Ok(self.latches.get(name).copied().unwrap_or_default().get()),
        }
    }
}

impl StateMachine for CpStateMachine {
    type Command = Command;
    type Output = Outcome;

    fn apply(&mut self, index: Index, command: &Command) -> Outcome {
        let dedup_key = match command.caller {
            Some(session) if command.seq > 0 => Some((session, command.seq)),
            _ => None,
        };
        if let Some((session, seq)) = dedup_key {
            if let Some(outcome) = self.dedup.get(session, seq) {
                ::log::trace!("repeated command {} from session {}", seq, session);
                return outcome.clone();
            }
        }
        let outcome = self.execute(index, &command.op);
        if let Some((session, seq)) = dedup_key {
            if self.sessions.is_active(session) {
                self.dedup.record(session, seq, outcome.clone());
            }
        }
        outcome
    }

    fn housekeeping(&self, now_ms: u64) -> Option<Command> {
        if self.sessions.any_overdue(now_ms) {
            Some(Command::anonymous(Operation::ExpireSessions { now_ms }))
        } else {
            None
        }
    }
}
