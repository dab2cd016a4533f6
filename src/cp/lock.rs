//! A named reentrant lock owned by sessions, with a fencing token per acquisition.

use super::session::SessionRegistry;
use super::{FencingToken, OpError, Reply, SessionId};
use crate::log::Index;
use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Holder {
    session: SessionId,
    count: u32,
    /// invocations already counted in this hold
    invocations: BTreeSet<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Waiter {
    session: SessionId,
    invocation: u64,
    /// log index of the first request, i.e. the queueing order
    requested_at: Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    pub holder: Option<SessionId>,
    pub hold_count: u32,
    pub fence: FencingToken,
    pub waiters: usize,
}

#[derive(Debug, Default)]
pub struct LockState {
    holder: Option<Holder>,
    /// fence of the latest acquisition, 0 before the first one
    fence: u64,
    waiters: VecDeque<Waiter>,
}

impl LockState {
    /// Grants, re-enters or queues. Repeating a queued or granted invocation changes nothing and reports where
    /// it stands.
    pub fn acquire(&mut self, session: SessionId, invocation: u64, index: Index) -> Reply {
        match &mut self.holder {
            Some(holder) if holder.session == session => {
                if holder.invocations.insert(invocation) {
                    holder.count += 1;
                }
                Reply::Acquired(self.fence())
            }
            Some(_) => {
                let position = match self.waiters.iter().position(|w| w.session == session && w.invocation == invocation) {
                    Some(position) => position,
                    None => {
                        self.waiters.push_back(Waiter {
                            session,
                            invocation,
                            requested_at: index,
                        });
                        self.waiters.len() - 1
                    }
                };
                Reply::Queued { position }
            }
            None => {
                self.grant(session, invocation);
                Reply::Acquired(self.fence())
            }
        }
    }

    /// Withdraws a queued invocation. If it was granted in the meantime the grant stands and is reported.
    pub fn cancel(&mut self, session: SessionId, invocation: u64) -> Reply {
        if let Some(holder) = &self.holder {
            if holder.session == session && holder.invocations.contains(&invocation) {
                return Reply::Acquired(self.fence());
            }
        }
        self.waiters
            .retain(|w| !(w.session == session && w.invocation == invocation));
        Reply::Cancelled
    }

    /// Drops one hold; the last one frees the lock for the next live waiter
    pub fn release(
        &mut self,
        name: &str,
        session: SessionId,
        sessions: &SessionRegistry,
    ) -> Result<Reply, OpError> {
        let holder = match &mut self.holder {
            Some(holder) if holder.session == session => holder,
            _ => {
                return Err(OpError::NotOwner {
                    name: name.to_string(),
                })
            }
        };
        holder.count -= 1;
        let remaining = holder.count;
        if remaining == 0 {
            self.holder = None;
            self.promote(sessions);
        }
        Ok(Reply::Released { remaining })
    }

    /// Removes every trace of a dead session: its hold, whatever the count, and its queued requests.
    /// Returns true if it was the holder.
    pub fn evict(&mut self, session: SessionId, sessions: &SessionRegistry) -> bool {
        self.waiters.retain(|w| w.session != session);
        if self.holder() != Some(session) {
            return false;
        }
        self.holder = None;
        self.promote(sessions);
        true
    }

    pub fn status(&self) -> LockStatus {
        LockStatus {
            holder: self.holder.as_ref().map(|h| h.session),
            hold_count: self.holder.as_ref().map_or(0, |h| h.count),
            fence: self.fence(),
            waiters: self.waiters.len(),
        }
    }

    pub fn holder(&self) -> Option<SessionId> {
        self.holder.as_ref().map(|h| h.session)
    }

    pub fn fence(&self) -> FencingToken {
        FencingToken(self.fence)
    }

    /// A fenced write is only current while the lock is held under exactly this token
    pub fn check_fence(&self, name: &str, presented: FencingToken) -> Result<(), OpError> {
        if self.holder.is_some() && presented.0 == self.fence {
            Ok(())
        } else {
            Err(OpError::StaleFence {
                lock: name.to_string(),
                presented: presented.0,
                current: self.fence,
            })
        }
    }

    pub fn is_idle(&self) -> bool {
        self.holder.is_none() && self.waiters.is_empty()
    }

    fn grant(&mut self, session: SessionId, invocation: u64) {
        self.fence += 1;
        self.holder = Some(Holder {
            session,
            count: 1,
            invocations: std::iter::once(invocation).collect(),
        });
    }

    /// FIFO over live sessions
    fn promote(&mut self, sessions: &SessionRegistry) {
        debug_assert!(self.holder.is_none());
        while let Some(waiter) = self.waiters.pop_front() {
            if sessions.is_active(waiter.session) {
                ::log::trace!(
                    "granting to session {} queued at {}",
                    waiter.session,
                    waiter.requested_at
                );
                self.grant(waiter.session, waiter.invocation);
                // the holder's other queued requests leave the queue and answer as this hold, without counting
                let session = waiter.session;
                let mut absorbed = vec![];
                self.waiters.retain(|w| {
                    if w.session == session {
                        absorbed.push(w.invocation);
                        false
                    } else {
                        true
                    }
                });
                if let Some(holder) = &mut self.holder {
                    holder.invocations.extend(absorbed);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn live(n: u64) -> (SessionRegistry, Vec<SessionId>) {
        let mut sessions = SessionRegistry::default();
        let ids = (0..n)
            .map(|i| sessions.create(format!("s{}", i), 1_000, 0))
            .collect();
        (sessions, ids)
    }

    #[test]
    fn first_acquisition_is_fence_one() {
        let mut lock = LockState::default();
        assert_eq!(lock.fence(), FencingToken(0));
        assert_eq!(lock.acquire(SessionId(1), 1, 1), Reply::Acquired(FencingToken(1)));
        assert_eq!(lock.holder(), Some(SessionId(1)));
    }

    #[test]
    fn reentry_keeps_fence() {
        let (sessions, ids) = live(1);
        let mut lock = LockState::default();
        lock.acquire(ids[0], 1, 1);
        assert_eq!(lock.acquire(ids[0], 2, 2), Reply::Acquired(FencingToken(1)));
        assert_eq!(lock.status().hold_count, 2);
        assert_eq!(lock.release("l", ids[0], &sessions), Ok(Reply::Released { remaining: 1 }));
        assert_eq!(lock.holder(), Some(ids[0]));
        assert_eq!(lock.release("l", ids[0], &sessions), Ok(Reply::Released { remaining: 0 }));
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn repeated_invocation_does_not_reenter() {
        let mut lock = LockState::default();
        lock.acquire(SessionId(1), 7, 1);
        assert_eq!(lock.acquire(SessionId(1), 7, 2), Reply::Acquired(FencingToken(1)));
        assert_eq!(lock.status().hold_count, 1);
    }

    #[test]
    fn mutual_exclusion() {
        let mut lock = LockState::default();
        lock.acquire(SessionId(1), 1, 1);
        assert_eq!(lock.acquire(SessionId(2), 1, 2), Reply::Queued { position: 0 });
        assert_eq!(lock.acquire(SessionId(2), 1, 3), Reply::Queued { position: 0 }, "polling keeps its place");
        assert_eq!(lock.holder(), Some(SessionId(1)));
        assert_eq!(lock.status().waiters, 1);
    }

    #[test]
    fn fifo_promotion_with_new_fence() {
        let (sessions, ids) = live(3);
        let mut lock = LockState::default();
        lock.acquire(ids[0], 1, 1);
        lock.acquire(ids[1], 1, 2);
        lock.acquire(ids[2], 1, 3);
        lock.release("l", ids[0], &sessions).unwrap();
        assert_eq!(lock.holder(), Some(ids[1]));
        assert_eq!(lock.fence(), FencingToken(2));
        assert_eq!(lock.acquire(ids[1], 1, 4), Reply::Acquired(FencingToken(2)), "the poll sees the grant");
        lock.release("l", ids[1], &sessions).unwrap();
        assert_eq!(lock.holder(), Some(ids[2]));
        assert_eq!(lock.fence(), FencingToken(3));
    }

    #[test]
    fn promotion_skips_dead_sessions() {
        let (mut sessions, ids) = live(3);
        let mut lock = LockState::default();
        lock.acquire(ids[0], 1, 1);
        lock.acquire(ids[1], 1, 2);
        lock.acquire(ids[2], 1, 3);
        sessions.close(ids[1]);
        lock.release("l", ids[0], &sessions).unwrap();
        assert_eq!(lock.holder(), Some(ids[2]));
        assert_eq!(lock.status().waiters, 0);
    }

    #[test]
    fn non_holder_unlock_changes_nothing() {
        let (sessions, ids) = live(2);
        let mut lock = LockState::default();
        lock.acquire(ids[0], 1, 1);
        let before = lock.status();
        assert_eq!(
            lock.release("l", ids[1], &sessions),
            Err(OpError::NotOwner { name: "l".into() })
        );
        assert_eq!(lock.status(), before);
    }

    #[test]
    fn eviction_releases_whole_hold() {
        let (mut sessions, ids) = live(2);
        let mut lock = LockState::default();
        lock.acquire(ids[0], 1, 1);
        lock.acquire(ids[0], 2, 2);
        lock.acquire(ids[1], 1, 3);
        sessions.close(ids[0]);
        assert!(lock.evict(ids[0], &sessions));
        assert_eq!(lock.status().holder, Some(ids[1]));
        assert_eq!(lock.status().hold_count, 1);
        assert_eq!(lock.fence(), FencingToken(2));
    }

    #[test]
    fn cancel() {
        let (sessions, ids) = live(2);
        let mut lock = LockState::default();
        lock.acquire(ids[0], 1, 1);
        lock.acquire(ids[1], 5, 2);
        assert_eq!(lock.cancel(ids[1], 5), Reply::Cancelled);
        assert_eq!(lock.status().waiters, 0);
        lock.acquire(ids[1], 6, 3);
        lock.release("l", ids[0], &sessions).unwrap();
        assert_eq!(lock.cancel(ids[1], 6), Reply::Acquired(FencingToken(2)), "granted before the cancel");
    }

    #[test]
    fn promotion_absorbs_the_holders_other_requests() {
        let (sessions, ids) = live(2);
        let mut lock = LockState::default();
        lock.acquire(ids[0], 1, 1);
        lock.acquire(ids[1], 1, 2);
        lock.acquire(ids[1], 2, 3);
        lock.release("l", ids[0], &sessions).unwrap();
        assert_eq!(lock.holder(), Some(ids[1]));
        assert_eq!(lock.status().hold_count, 1);
        assert_eq!(lock.status().waiters, 0);
        assert_eq!(lock.acquire(ids[1], 2, 5), Reply::Acquired(FencingToken(2)), "answered as the same hold");
        assert_eq!(lock.status().hold_count, 1);
        assert_eq!(lock.release("l", ids[1], &sessions), Ok(Reply::Released { remaining: 0 }));
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn stale_fence() {
        let (sessions, ids) = live(2);
        let mut lock = LockState::default();
        assert!(lock.check_fence("l", FencingToken(0)).is_err(), "not held");
        lock.acquire(ids[0], 1, 1);
        assert_eq!(lock.check_fence("l", FencingToken(1)), Ok(()));
        lock.acquire(ids[1], 1, 2);
        lock.release("l", ids[0], &sessions).unwrap();
        assert_eq!(
            lock.check_fence("l", FencingToken(1)),
            Err(OpError::StaleFence {
                lock: "l".into(),
                presented: 1,
                current: 2
            })
        );
    }
}
