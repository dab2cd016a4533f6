//! The pet owner protocol: owners contend for one lock, the holder publishes photos through an atomic reference
//! and signals every publication on a countdown latch.
//!
//! ```text
//! Contending --lock granted--> Leading --shutdown / enough publications--> Released
//!                                 |
//!                                 +--session lost / stale fence--> Expired --supervise--> Contending
//! ```
//!
//! An unelected owner skips the lock: it arms the latch once and publishes with plain compare-and-set, which is
//! allowed because the reference and the latch take writes from any session.

use super::client::{AtomicReference, CountDownLatch, CpClient, FencedLock};
use super::config::OwnerConfig;
use super::cp::{FencingToken, PrimitiveNames};
use super::error::CpError;
use super::photo::{random_between, Pet, Photo};
use ::log::{error, info, warn};
use std::cmp::min;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerState {
    Contending,
    Leading { fence: FencingToken },
    /// publishing without holding the lock
    Unelected,
    Released,
    Expired,
}

/// Tells long running loops to wind down
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn channel() -> (watch::Sender<bool>, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, ShutdownSignal { rx })
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is signalled, or the sender is gone
    pub async fn wait(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct PetOwner {
    client: CpClient,
    pet: Pet,
    config: OwnerConfig,
    lock: FencedLock,
    photo_ref: AtomicReference<Photo>,
    notifier: CountDownLatch,
    state: OwnerState,
    published: u64,
    max_publications: Option<u64>,
    elected: bool,
}

impl PetOwner {
    pub fn new(client: CpClient, pet: Pet, names: &PrimitiveNames, config: OwnerConfig) -> Self {
        PetOwner {
            lock: client.get_lock(names.lock.clone()),
            photo_ref: client.get_atomic_reference(names.photo_ref.clone()),
            notifier: client.get_count_down_latch(names.notifier.clone()),
            client,
            pet,
            config,
            state: OwnerState::Contending,
            published: 0,
            max_publications: None,
            elected: true,
        }
    }

    /// Publish without contending for the lock, sharing the photo sequence with elected owners
    pub fn unelected(mut self) -> Self {
        self.elected = false;
        self
    }

    /// Release the lock after this many publications instead of leading until shutdown
    pub fn with_max_publications(mut self, max_publications: u64) -> Self {
        self.max_publications = Some(max_publications);
        self
    }

    pub fn state(&self) -> OwnerState {
        self.state
    }

    /// Publications over the owner's lifetime
    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn client(&self) -> &CpClient {
        &self.client
    }

    fn name(&self) -> &str {
        self.client.name()
    }

    /// Waits for the lock, then arms the notifier for the first publication
    pub async fn contend(&mut self) -> Result<FencingToken, CpError> {
        self.state = OwnerState::Contending;
        info!("{}; attempting to acquire the lock!", self.name());
        let fence = self.lock.lock_and_get_fence().await?;
        self.lead(fence).await?;
        Ok(fence)
    }

    async fn lead(&mut self, fence: FencingToken) -> Result<(), CpError> {
        self.state = OwnerState::Leading { fence };
        info!(
            "{}; acquired the lock and became the leader with fence {}!",
            self.name(),
            fence
        );
        self.notifier.try_set_count(1).await?;
        Ok(())
    }

    /// Writes the next photo under `fence` and signals it. A lost generation race is retried with a fresh read.
    pub async fn publish(&mut self, fence: FencingToken) -> Result<Photo, CpError> {
        self.publish_with(Some(fence)).await
    }

    /// As `publish`, for an owner that does not hold the lock
    pub async fn publish_unelected(&mut self) -> Result<Photo, CpError> {
        self.publish_with(None).await
    }

    async fn publish_with(&mut self, fence: Option<FencingToken>) -> Result<Photo, CpError> {
        for attempt in 1..=self.config.max_publish_attempts {
            let current = self.photo_ref.get_versioned().await?;
            let photo = Photo::new(
                Photo::next_id(current.value.as_ref()),
                self.pet.random_file_name(self.config.photo_variants),
            );
            let written = match fence {
                Some(fence) => {
                    self.photo_ref
                        .compare_and_set_fenced(current.generation, &photo, &self.lock, fence)
                        .await?
                }
                None => self.photo_ref.compare_and_set(current.generation, &photo).await?,
            };
            if written {
                info!("{}; posted new {}", self.name(), photo);
                self.published += 1;
                self.notifier.count_down().await?;
                self.notifier.try_set_count(1).await?;
                return Ok(photo);
            }
            warn!(
                "{}; generation {} moved on before our write, attempt {}",
                self.name(),
                current.generation,
                attempt
            );
        }
        Err(CpError::Contention {
            attempts: self.config.max_publish_attempts,
        })
    }

    /// Gives the lock up if we are leading
    pub async fn release(&mut self) -> Result<(), CpError> {
        if let OwnerState::Leading { .. } = self.state {
            self.lock.unlock().await?;
            info!("{}; released the lock", self.name());
        }
        self.state = OwnerState::Released;
        Ok(())
    }

    /// One Contending → Leading → (Released | Expired) cycle. The lock is given up on every way out: by unlocking,
    /// or by the session having expired already.
    pub async fn run(&mut self, shutdown: &mut ShutdownSignal) -> Result<OwnerState, CpError> {
        if !self.elected {
            return self.run_unelected(shutdown).await;
        }
        self.state = OwnerState::Contending;
        info!("{}; attempting to acquire the lock!", self.name());
        let fence = match self.lock.lock_until(shutdown.wait()).await {
            Ok(Some(fence)) => fence,
            Ok(None) => {
                self.state = OwnerState::Released;
                return Ok(self.state);
            }
            Err(e) => return Err(self.lost(e)),
        };

        let led = match self.lead(fence).await {
            Ok(()) => self.publish_until_done(Some(fence), shutdown).await,
            Err(e) => Err(e),
        };
        match led {
            Ok(()) => {
                self.release().await?;
                Ok(self.state)
            }
            Err(e) if e.is_session_loss() => Err(self.lost(e)),
            Err(e) => {
                if let Err(unlock) = self.release().await {
                    warn!("{}; could not release the lock: {}", self.name(), unlock);
                }
                Err(e)
            }
        }
    }

    /// Arms the notifier once, then publishes until shutdown or enough publications
    async fn run_unelected(&mut self, shutdown: &mut ShutdownSignal) -> Result<OwnerState, CpError> {
        self.state = OwnerState::Unelected;
        info!("{}; publishing without the lock", self.name());
        let published = match self.notifier.try_set_count(1).await {
            Ok(_) => self.publish_until_done(None, shutdown).await,
            Err(e) => Err(e),
        };
        match published {
            Ok(()) => {
                self.state = OwnerState::Released;
                Ok(self.state)
            }
            Err(e) => Err(self.lost(e)),
        }
    }

    fn lost(&mut self, e: CpError) -> CpError {
        if e.is_session_loss() {
            warn!("{}; lost leadership: {}", self.client.name(), e);
            self.state = OwnerState::Expired;
        }
        e
    }

    async fn publish_until_done(
        &mut self,
        fence: Option<FencingToken>,
        shutdown: &mut ShutdownSignal,
    ) -> Result<(), CpError> {
        loop {
            if shutdown.is_shutdown() || self.max_publications.map_or(false, |max| self.published >= max) {
                return Ok(());
            }
            self.publish_with(fence).await?;
            let pause = Duration::from_millis(random_between(
                self.config.publish_interval_min_ms,
                self.config.publish_interval_max_ms,
            ));
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.wait() => return Ok(()),
            }
        }
    }

    /// Runs cycles until shutdown or a release, starting over after session loss and backing off while the cluster
    /// is unavailable. Fatal errors end the owner.
    pub async fn supervise(&mut self, shutdown: &mut ShutdownSignal) -> Result<(), CpError> {
        let mut backoff = self.config.restart_backoff_initial_ms;
        let res = loop {
            match self.run(shutdown).await {
                Ok(_) => break Ok(()),
                Err(e) if e.is_session_loss() => {
                    warn!("{}; {}, starting over with a new session", self.name(), e.class());
                    if let Err(close) = self.client.close_session().await {
                        warn!("{}; could not close the old session: {}", self.name(), close);
                        self.client.abandon_session().await;
                    }
                    backoff = self.config.restart_backoff_initial_ms;
                }
                Err(e) if e.is_retryable() => {
                    warn!("{}; {}, retrying in {}ms", self.name(), e, backoff);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(backoff)) => {}
                        _ = shutdown.wait() => break Ok(()),
                    }
                    backoff = min(backoff.saturating_mul(2), self.config.restart_backoff_max_ms);
                }
                Err(e) => {
                    error!("{}; fatal {} error: {}", self.name(), e.class(), e);
                    break Err(e);
                }
            }
        };
        if let Err(close) = self.client.close_session().await {
            warn!("{}; could not close the session: {}", self.name(), close);
        }
        res
    }
}

/// The reading side: returns each photo as it is published
pub struct PhotoWatcher {
    client: CpClient,
    photo_ref: AtomicReference<Photo>,
    notifier: CountDownLatch,
    last_generation: u64,
}

impl PhotoWatcher {
    pub fn new(client: &CpClient, names: &PrimitiveNames) -> Self {
        PhotoWatcher {
            client: client.clone(),
            photo_ref: client.get_atomic_reference(names.photo_ref.clone()),
            notifier: client.get_count_down_latch(names.notifier.clone()),
            last_generation: 0,
        }
    }

    /// A photo newer than the last one returned, `None` if none is published within `timeout`
    pub async fn next_photo(&mut self, timeout: Duration) -> Result<Option<Photo>, CpError> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.photo_ref.get_versioned().await?;
            if current.generation > self.last_generation {
                self.last_generation = current.generation;
                if let Some(photo) = current.value {
                    return Ok(Some(photo));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // an unarmed latch is already at zero, the poll interval keeps that from spinning
            if self.notifier.await_zero(deadline - now).await? {
                let left = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(self.client.config().wait_poll_interval().min(left)).await;
            }
        }
    }
}
