use super::{unexpected, CpClient};
use crate::cp::{FencingToken, LockStatus, Operation, Reply};
use crate::error::CpError;
use ::log::{debug, warn};
use std::cell::Cell;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// A named lock owned by this client's session. Reentrant: every `lock` needs a matching `unlock`.
///
/// A wait that ends without handing out the grant withdraws its request, so that a late grant never turns into a
/// hold nobody releases. A request that could not be withdrawn, or whose wait was dropped, is picked up again by
/// the next wait on this handle.
pub struct FencedLock {
    client: CpClient,
    name: String,
    unsettled: Cell<Option<u64>>,
}

/// A lock request in flight; dropped unsettled it is handed back to the lock for reuse
struct Pending<'a> {
    slot: &'a Cell<Option<u64>>,
    invocation: u64,
    settled: bool,
}

impl Pending<'_> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.slot.set(Some(self.invocation));
        }
    }
}

impl FencedLock {
    pub(super) fn new(client: CpClient, name: String) -> Self {
        FencedLock {
            client,
            name,
            unsettled: Cell::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits until the lock is ours
    pub async fn lock(&self) -> Result<(), CpError> {
        self.lock_and_get_fence().await.map(|_| ())
    }

    pub async fn lock_and_get_fence(&self) -> Result<FencingToken, CpError> {
        let mut pending = self.pending();
        loop {
            match self.request(pending.invocation).await {
                Ok(Some(fence)) => {
                    pending.settle();
                    return Ok(fence);
                }
                Ok(None) => tokio::time::sleep(self.client.config().wait_poll_interval()).await,
                Err(e) => return Err(self.give_up(&mut pending, e).await),
            }
        }
    }

    /// As `lock_and_get_fence`, giving up when `abort` resolves first. `None` when aborted, in which case the
    /// request is withdrawn and a grant that raced the abort is released again.
    pub async fn lock_until(&self, abort: impl Future<Output = ()>) -> Result<Option<FencingToken>, CpError> {
        let mut pending = self.pending();
        tokio::pin!(abort);
        loop {
            match self.request(pending.invocation).await {
                Ok(Some(fence)) => {
                    pending.settle();
                    return Ok(Some(fence));
                }
                Ok(None) => {}
                Err(e) => return Err(self.give_up(&mut pending, e).await),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.client.config().wait_poll_interval()) => {}
                _ = &mut abort => {
                    self.withdraw(pending.invocation).await?;
                    pending.settle();
                    return Ok(None);
                }
            }
        }
    }

    pub async fn try_lock(&self, timeout: Duration) -> Result<bool, CpError> {
        Ok(self.try_lock_and_get_fence(timeout).await?.is_some())
    }

    /// As `lock_and_get_fence`, giving up after `timeout`. A zero timeout only takes a free lock.
    pub async fn try_lock_and_get_fence(&self, timeout: Duration) -> Result<Option<FencingToken>, CpError> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending();
        loop {
            match self.request(pending.invocation).await {
                Ok(Some(fence)) => {
                    pending.settle();
                    return Ok(Some(fence));
                }
                Ok(None) => {}
                Err(e) => return Err(self.give_up(&mut pending, e).await),
            }
            let now = Instant::now();
            if now >= deadline {
                // a grant that raced the timeout is kept
                let granted = self.cancel(pending.invocation).await?;
                pending.settle();
                return Ok(granted);
            }
            let poll = self.client.config().wait_poll_interval();
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Drops one hold, fails with `NotOwner` unless this session holds the lock
    pub async fn unlock(&self) -> Result<(), CpError> {
        let name = self.name.clone();
        match self
            .client
            .session_call(|session| Operation::Unlock { name, session })
            .await?
        {
            Reply::Released { remaining } => {
                debug!("{}; unlocked '{}', {} holds left", self.client.name(), self.name, remaining);
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    /// The fence of the latest acquisition, 0 if the lock was never acquired
    pub async fn get_fence(&self) -> Result<FencingToken, CpError> {
        match self
            .client
            .read(Operation::GetFence {
                name: self.name.clone(),
            })
            .await?
        {
            Reply::Fence(fence) => Ok(fence),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&self) -> Result<LockStatus, CpError> {
        match self
            .client
            .read(Operation::LockStatus {
                name: self.name.clone(),
            })
            .await?
        {
            Reply::LockStatus(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn is_locked(&self) -> Result<bool, CpError> {
        Ok(self.status().await?.holder.is_some())
    }

    pub async fn is_locked_by_current_session(&self) -> Result<bool, CpError> {
        let holder = self.status().await?.holder;
        Ok(holder.is_some() && holder == self.client.session_id().await)
    }

    /// Holds by this session, 0 when someone else or no one holds the lock
    pub async fn get_lock_count(&self) -> Result<u32, CpError> {
        let status = self.status().await?;
        if status.holder.is_some() && status.holder == self.client.session_id().await {
            Ok(status.hold_count)
        } else {
            Ok(0)
        }
    }

    /// Resumes an unsettled request, or starts a new one
    fn pending(&self) -> Pending<'_> {
        let invocation = self
            .unsettled
            .take()
            .unwrap_or_else(|| self.client.next_invocation());
        Pending {
            slot: &self.unsettled,
            invocation,
            settled: false,
        }
    }

    /// Cancels a request, unlocking if it was granted meanwhile
    async fn withdraw(&self, invocation: u64) -> Result<(), CpError> {
        if self.cancel(invocation).await?.is_some() {
            debug!("{}; granted '{}' while giving up, unlocking", self.client.name(), self.name);
            self.unlock().await?;
        }
        Ok(())
    }

    /// Withdraws a request whose wait failed with `err`. A dead session has nothing left to withdraw.
    async fn give_up(&self, pending: &mut Pending<'_>, err: CpError) -> CpError {
        if err.is_session_loss() {
            pending.settle();
            return err;
        }
        match self.withdraw(pending.invocation).await {
            Ok(()) => pending.settle(),
            Err(e) => warn!(
                "{}; could not withdraw request {} for '{}', the next wait reuses it: {}",
                self.client.name(),
                pending.invocation,
                self.name,
                e
            ),
        }
        err
    }

    /// Asks for the lock, `None` while queued
    async fn request(&self, invocation: u64) -> Result<Option<FencingToken>, CpError> {
        let name = self.name.clone();
        match self
            .client
            .session_call(|session| Operation::Lock {
                name,
                session,
                invocation,
            })
            .await?
        {
            Reply::Acquired(fence) => Ok(Some(fence)),
            Reply::Queued { .. } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    async fn cancel(&self, invocation: u64) -> Result<Option<FencingToken>, CpError> {
        let name = self.name.clone();
        match self
            .client
            .session_call(|session| Operation::CancelLock {
                name,
                session,
                invocation,
            })
            .await?
        {
            Reply::Acquired(fence) => Ok(Some(fence)),
            Reply::Cancelled => Ok(None),
            other => Err(unexpected(other)),
        }
    }
}
