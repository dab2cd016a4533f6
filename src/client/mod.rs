//! The connection layer: one [`CpClient`] per process, handing out primitive handles bound to its session.
//!
//! Calls are sent to whichever server the client believes leads the group. A `NotLeader` answer with a hint
//! redirects straight away; anything else rotates to the next server after an exponential backoff, until the
//! configured number of attempts is used up and the call fails as [`CpError::Unavailable`].

mod atomic_ref;
mod latch;
mod lock;
mod session;

pub use self::atomic_ref::{AtomicReference, Versioned};
pub use self::latch::CountDownLatch;
pub use self::lock::FencedLock;
pub use self::session::ClientSession;

use crate::cluster::{ClientRequest, ClusterRunner, Members};
use crate::config::ClientConfig;
use crate::cp::{Command, CpStateMachine, Operation, Outcome, Reply, SessionId};
use crate::error::CpError;
use crate::node::CommandError;
use crate::ServerId;
use ::log::{debug, warn};
use actix::Addr;
use futures::lock::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::Cell;
use std::cmp::min;
use std::rc::Rc;
use std::time::Duration;

pub type Cluster = Addr<ClusterRunner<CpStateMachine>>;

pub(crate) struct Inner {
    cluster: Cluster,
    members: ServerId,
    leader: Cell<ServerId>,
    config: ClientConfig,
    session: Mutex<Option<ClientSession>>,
    seq: Cell<u64>,
    invocation: Cell<u64>,
}

/// Cheap to clone, all clones share one session
#[derive(Clone)]
pub struct CpClient {
    inner: Rc<Inner>,
}

impl CpClient {
    pub async fn connect(cluster: Cluster, config: ClientConfig) -> Result<CpClient, CpError> {
        let members = cluster
            .send(Members)
            .await
            .map_err(|_| CpError::Unavailable { attempts: 1 })?;
        debug!("{}; connected to a group of {}", config.instance_name, members);
        Ok(CpClient {
            inner: Rc::new(Inner {
                cluster,
                members,
                leader: Cell::new(0),
                config,
                session: Mutex::new(None),
                seq: Cell::new(0),
                invocation: Cell::new(0),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.config.instance_name
    }

    pub fn get_lock(&self, name: impl Into<String>) -> FencedLock {
        FencedLock::new(self.clone(), name.into())
    }

    pub fn get_atomic_reference<T: Serialize + DeserializeOwned>(&self, name: impl Into<String>) -> AtomicReference<T> {
        AtomicReference::new(self.clone(), name.into())
    }

    pub fn get_count_down_latch(&self, name: impl Into<String>) -> CountDownLatch {
        CountDownLatch::new(self.clone(), name.into())
    }

    /// The current session, created on first use
    pub async fn session(&self) -> Result<SessionId, CpError> {
        let mut session = self.inner.session.lock().await;
        if let Some(existing) = session.as_ref() {
            return Ok(existing.id());
        }
        let created = ClientSession::create(self).await?;
        let id = created.id();
        *session = Some(created);
        Ok(id)
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.inner.session.lock().await.as_ref().map(ClientSession::id)
    }

    /// Ends the session on the cluster, releasing whatever it holds
    pub async fn close_session(&self) -> Result<(), CpError> {
        let session = self.inner.session.lock().await.take();
        if let Some(session) = session {
            let id = session.id();
            drop(session);
            self.call(Command::anonymous(Operation::CloseSession { session: id }))
                .await?;
            debug!("{}; closed session {}", self.name(), id);
        }
        Ok(())
    }

    /// Stops heartbeating without telling the cluster, as a crashed process would
    pub async fn abandon_session(&self) -> Option<SessionId> {
        let session = self.inner.session.lock().await.take();
        session.map(|session| {
            warn!("{}; abandoning session {}", self.name(), session.id());
            session.id()
        })
    }

    /// Forgets the session if it is still `id`, so that the next session bound call starts a new one
    pub async fn forget_session(&self, id: SessionId) {
        let mut session = self.inner.session.lock().await;
        if session.as_ref().map(ClientSession::id) == Some(id) {
            debug!("{}; forgetting session {}", self.name(), id);
            *session = None;
        }
    }

    pub(crate) fn next_invocation(&self) -> u64 {
        let next = self.inner.invocation.get() + 1;
        self.inner.invocation.set(next);
        next
    }

    fn next_seq(&self) -> u64 {
        let next = self.inner.seq.get() + 1;
        self.inner.seq.set(next);
        next
    }

    /// Runs an operation on behalf of this client's session, retries are de-duplicated by the cluster
    pub(crate) async fn session_call(&self, op: impl FnOnce(SessionId) -> Operation) -> Result<Reply, CpError> {
        let session = self.session().await?;
        let command = Command::from_session(session, self.next_seq(), op(session));
        let res = self.call(command).await;
        if let Err(CpError::SessionExpired(expired)) = &res {
            self.forget_session(*expired).await;
        }
        res
    }

    /// Mutations carry the session and a sequence number, so that a retry applies at most once
    pub(crate) async fn write(&self, op: Operation) -> Result<Reply, CpError> {
        self.session_call(move |_| op).await
    }

    pub(crate) async fn read(&self, op: Operation) -> Result<Reply, CpError> {
        self.call(Command::anonymous(op)).await
    }

    pub(crate) async fn call(&self, command: Command) -> Result<Reply, CpError> {
        Ok(self.submit(command).await??)
    }

    /// Delivers a command to the leader, following redirects and retrying with backoff
    pub(crate) async fn submit(&self, command: Command) -> Result<Outcome, CpError> {
        let config = &self.inner.config;
        let mut backoff = config.retry_backoff_initial_ms;
        for attempt in 1..=config.max_attempts {
            let to = self.inner.leader.get();
            let request = self.inner.cluster.send(ClientRequest::<CpStateMachine> {
                to,
                command: command.clone(),
            });
            let failure = match tokio::time::timeout(config.request_timeout(), request).await {
                Ok(Ok(Ok(outcome))) => return Ok(outcome),
                Ok(Ok(Err(CommandError::NotLeader { leader: Some(leader) }))) if leader != to => {
                    debug!("{}; {} redirected us to {}", self.name(), to, leader);
                    self.inner.leader.set(leader);
                    continue;
                }
                Ok(Ok(Err(err))) => err.to_string(),
                Ok(Err(mailbox)) => mailbox.to_string(),
                Err(_) => "timed out".to_string(),
            };
            let next = (to + 1) % self.inner.members;
            debug!(
                "{}; attempt {} at {} failed ({}), trying {} in {}ms",
                self.name(),
                attempt,
                to,
                failure,
                next,
                backoff
            );
            self.inner.leader.set(next);
            tokio::time::sleep(Duration::from_millis(backoff)).await;
            backoff = min(backoff.saturating_mul(2), config.retry_backoff_max_ms);
        }
        warn!(
            "{}; giving up on {:?} after {} attempts",
            self.name(),
            command.op,
            config.max_attempts
        );
        Err(CpError::Unavailable {
            attempts: config.max_attempts,
        })
    }
}

fn unexpected(reply: Reply) -> CpError {
    CpError::UnexpectedReply(format!("{:?}", reply))
}
