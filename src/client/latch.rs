use super::{unexpected, CpClient};
use crate::cp::{Operation, Reply};
use crate::error::CpError;
use std::time::Duration;
use tokio::time::Instant;

pub struct CountDownLatch {
    client: CpClient,
    name: String,
}

impl CountDownLatch {
    pub(super) fn new(client: CpClient, name: String) -> Self {
        CountDownLatch { client, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arms a spent latch for a new round, false while the current round is still counting
    pub async fn try_set_count(&self, count: u32) -> Result<bool, CpError> {
        match self
            .client
            .write(Operation::LatchTrySetCount {
                name: self.name.clone(),
                count,
            })
            .await?
        {
            Reply::CountSet(set) => Ok(set),
            other => Err(unexpected(other)),
        }
    }

    pub async fn count_down(&self) -> Result<(), CpError> {
        match self
            .client
            .write(Operation::LatchCountDown {
                name: self.name.clone(),
            })
            .await?
        {
            Reply::Count { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_count(&self) -> Result<u32, CpError> {
        Ok(self.state().await?.0)
    }

    pub async fn get_round(&self) -> Result<u64, CpError> {
        Ok(self.state().await?.1)
    }

    /// Waits for the round active now to reach zero, false on timeout
    pub async fn await_zero(&self, timeout: Duration) -> Result<bool, CpError> {
        let deadline = Instant::now() + timeout;
        let (remaining, round) = self.state().await?;
        if remaining == 0 {
            return Ok(true);
        }
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let poll = self.client.config().wait_poll_interval();
            tokio::time::sleep(poll.min(deadline - now)).await;
            let (remaining, current) = self.state().await?;
            // a later round means ours reached zero in between
            if remaining == 0 || current > round {
                return Ok(true);
            }
        }
    }

    async fn state(&self) -> Result<(u32, u64), CpError> {
        match self
            .client
            .read(Operation::LatchGet {
                name: self.name.clone(),
            })
            .await?
        {
            Reply::Count { remaining, round } => Ok((remaining, round)),
            other => Err(unexpected(other)),
        }
    }
}
