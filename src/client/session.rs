use super::{CpClient, Inner};
use crate::cp::{Command, OpError, Operation, Reply, SessionId};
use crate::error::CpError;
use crate::now_unix_ms;
use ::log::{debug, trace, warn};
use std::rc::{Rc, Weak};
use tokio::task::JoinHandle;

/// A live session and the task keeping it alive. Dropping it stops the heartbeats, the cluster then expires the
/// session once its ttl passes.
pub struct ClientSession {
    id: SessionId,
    heartbeat: JoinHandle<()>,
}

impl ClientSession {
    pub(super) async fn create(client: &CpClient) -> Result<ClientSession, CpError> {
        let config = client.config();
        let reply = client
            .call(Command::anonymous(Operation::CreateSession {
                owner: config.instance_name.clone(),
                ttl_ms: config.session_ttl_ms,
                now_ms: now_unix_ms(),
            }))
            .await?;
        let id = match reply {
            Reply::SessionCreated(id) => id,
            other => return Err(super::unexpected(other)),
        };
        debug!("{}; started session {}", client.name(), id);
        let heartbeat = actix::spawn(heartbeat(Rc::downgrade(&client.inner), id));
        Ok(ClientSession { id, heartbeat })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

async fn heartbeat(client: Weak<Inner>, id: SessionId) {
    loop {
        let interval = match client.upgrade() {
            Some(inner) => inner.config.session_heartbeat_interval(),
            None => return,
        };
        tokio::time::sleep(interval).await;
        let client = match client.upgrade() {
            Some(inner) => CpClient { inner },
            None => return,
        };
        let res = client
            .submit(Command::anonymous(Operation::Heartbeat {
                session: id,
                now_ms: now_unix_ms(),
            }))
            .await;
        match res {
            Ok(Ok(_)) => trace!("{}; heartbeat for session {}", client.name(), id),
            Ok(Err(OpError::SessionExpired(_))) => {
                warn!("{}; session {} expired, stopping heartbeats", client.name(), id);
                return;
            }
            Ok(Err(err)) => warn!("{}; heartbeat for session {} refused: {}", client.name(), id, err),
            Err(err) => warn!("{}; heartbeat for session {} failed: {}", client.name(), id, err),
        }
    }
}
