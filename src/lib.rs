//! Consensus-backed coordination primitives and the single-leader publish protocol built on them.
//!
//! The crate is layered leaves first:
//!
//! - [`server`] / [`state`] / [`log`] / [`rpc`]: a timer-free Raft core.
//! - [`node`] / [`cluster`]: actix actors that drive the core with timers and route messages in-process.
//! - [`cp`]: the replicated state machine holding named fenced locks, atomic references and countdown latches.
//! - [`client`]: the connection layer handing out session-bound primitive handles.
//! - [`owner`]: the pet owner leader-election / publish protocol.

pub type ServerId = u8;
/// Time is divided into terms, and each term begins with an election. After a successful election, a single leader
/// manages the cluster until the end of the term. Some elections fail, in which case the term ends without choosing
/// a leader. The transitions between terms may be observed at different times on different servers.
pub type Term = u32;
/// Identifies a command proposed to the leader: its log index and the term it was appended in.
pub type CommandPtr = (log::Index, Term);

/// A command was offered to a server which is not the leader of its current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotLeader {
    /// who this server believes the leader is, if anyone
    pub leader: Option<ServerId>,
}

pub mod client;
pub mod cluster;
pub mod config;
pub mod cp;
pub mod error;
pub mod log;
pub mod node;
pub mod owner;
pub mod photo;
pub mod rpc;
pub mod server;
pub mod state;
pub mod state_machine;

pub use client::{AtomicReference, CountDownLatch, CpClient, FencedLock, Versioned};
pub use config::{ClientConfig, ClusterConfig, Config, OwnerConfig};
pub use cp::{CpStateMachine, FencingToken, PrimitiveNames, SessionId};
pub use error::{ConfigError, CpError};
pub use owner::{OwnerState, PetOwner, PhotoWatcher, ShutdownSignal};
pub use photo::{Pet, Photo};

/// Get current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
pub fn now_unix_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
