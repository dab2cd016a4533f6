//! Raft servers communicate using remote procedure calls (RPCs), and the basic consensus algorithm requires only
//! two types of RPCs. RequestVote RPCs are initiated by candidates during elections (Section 5.2), and AppendEntries
//! RPCs are initiated by leaders to replicate log entries and to provide a form of heartbeat (Section 5.3).
//! Servers retry RPCs if they do not receive a response in a timely manner, and they issue RPCs in parallel
//! for best performance.

use super::log::{Index, Item};
use super::{ServerId, Term};
use actix::Message;
use serde::{Deserialize, Serialize};

/// Any RPC request or response, all of which carry the sender's term
pub trait RPCMessage {
    fn term(&self) -> Term;
}

/// Invoked by leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest<Command> {
    /// leader’s term
    pub term: Term,
    /// so follower can redirect clients
    pub leader_id: ServerId,
    /// index of log entry immediately preceding new ones
    pub prev_log_index: Index,
    /// term of prevLogIndex entry
    pub prev_log_term: Term,
    /// log entries to store (empty for heartbeat; may send more than one for efficiency)
    pub entries: Vec<Item<Command>>,
    /// leader’s commitIndex
    pub leader_commit: Index,
}

impl<Command> AppendEntriesRequest<Command> {
    /// The index the follower will match up to if it accepts this request
    pub fn match_index(&self) -> Index {
        self.prev_log_index + self.entries.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// currentTerm, for leader to update itself
    pub term: Term,
    /// true if follower contained entry matching prevLogIndex and prevLogTerm
    pub success: bool,
}

/// Invoked by candidates to gather votes (§5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// candidate’s term
    pub term: Term,
    /// candidate requesting vote
    pub candidate_id: ServerId,
    /// index of candidate’s last log entry (§5.4)
    pub last_log_index: Index,
    /// term of candidate’s last log entry (§5.4)
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// currentTerm, for candidate to update itself
    pub term: Term,
    /// true means candidate received vote
    pub vote_granted: bool,
}

impl<Command> RPCMessage for AppendEntriesRequest<Command> {
    fn term(&self) -> Term {
        self.term
    }
}

impl RPCMessage for AppendEntriesResponse {
    fn term(&self) -> Term {
        self.term
    }
}

impl RPCMessage for RequestVoteRequest {
    fn term(&self) -> Term {
        self.term
    }
}

impl RPCMessage for RequestVoteResponse {
    fn term(&self) -> Term {
        self.term
    }
}

impl<Command: Send + 'static> Message for AppendEntriesRequest<Command> {
    type Result = AppendEntriesResponse;
}

impl Message for RequestVoteRequest {
    type Result = RequestVoteResponse;
}
