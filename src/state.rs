use super::log::{self, Log};
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use super::state_machine::StateMachine;
use super::{CommandPtr, ServerId, Term};
use core::cmp::Ordering;

/// Persistent state on all servers: (Updated on stable storage before responding to RPCs)
// @todo operations here need to be persisted to disk and therefore async
#[derive(Debug, Default)]
pub struct Persistent<Log> {
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
    pub log: Log,
}

impl<Log> Persistent<Log> {
    /// Moving to a newer term forgets the vote cast in the old one
    /// # Panics
    /// In case the term tries to decrease
    fn set_current_term(&mut self, current_term: Term) {
        assert!(
            current_term >= self.current_term,
            "Current term must increase monotonically, tried to decrease from {} to {}",
            self.current_term,
            current_term
        );
        if current_term > self.current_term {
            self.voted_for = None;
        }
        self.current_term = current_term;
    }
}

#[derive(Debug, PartialEq)]
pub struct Leader {
    pub next_index: Vec<log::Index>,
    pub match_index: Vec<log::Index>,
}

impl Leader {
    fn new(num_servers: ServerId, last_log_index: log::Index) -> Leader {
        Leader {
            next_index: vec![last_log_index + 1; num_servers as usize],
            match_index: vec![0; num_servers as usize],
        }
    }

    /// # Panics
    /// In case the match index tries to decrease
    fn set_match_index(&mut self, server: ServerId, match_index: log::Index) {
        assert!(
            match_index >= self.match_index[server as usize],
            "Match index must increase monotonically, tried to decrease from {} to {}",
            self.match_index[server as usize],
            match_index
        );
        self.match_index[server as usize] = match_index;
    }

    /// Which index in the log is matched by the majority of the logs in the cluster
    fn majority_match(&self) -> log::Index {
        let mut idxs = self.match_index.clone();
        idxs.sort_unstable();
        let majority_idx = (idxs.len() + 1) / 2 - 1;
        idxs[majority_idx]
    }
}

/// Server states. Followers only respond to requests from other servers. If a follower receives no communication,
/// it becomes a candidate and initiates an election. A candidate that receives votes from a majority of the full
/// cluster becomes the new leader. Leaders typically operate until they fail.
#[derive(Debug, PartialEq, Default)]
pub enum States {
    #[default]
    Follower,
    Candidate,
    /// Volatile state on leaders: (Reinitialized after election)
    Leader(Leader),
}

/// Volatile state on all servers
#[derive(Debug, Default)]
pub struct ServerState<Log> {
    state: States,
    persistent_state: Persistent<Log>,
    commit_index: log::Index,
    last_applied: log::Index,
    /// the leader of the current term, as far as this server knows
    leader_hint: Option<ServerId>,
}

impl<Log: log::Log> ServerState<Log> {
    pub fn new(persistent_state: Persistent<Log>) -> Self {
        ServerState {
            state: States::Follower,
            persistent_state,
            commit_index: 0,
            last_applied: 0,
            leader_hint: None,
        }
    }

    pub fn current_term(&self) -> Term {
        self.persistent_state.current_term
    }

    pub fn voted_for(&self) -> Option<ServerId> {
        self.persistent_state.voted_for
    }

    pub fn commit_index(&self) -> log::Index {
        self.commit_index
    }

    pub fn leader_hint(&self) -> Option<ServerId> {
        self.leader_hint
    }

    pub fn log(&self) -> &Log {
        &self.persistent_state.log
    }

    pub fn is_follower(&self) -> bool {
        States::Follower == self.state
    }

    pub fn is_candidate(&self) -> bool {
        States::Candidate == self.state
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state, States::Leader(_))
    }

    /// Another server is acknowledged as leader, or a newer term has been seen
    pub fn follow_new_term(&mut self, term: Term) {
        if term > self.persistent_state.current_term {
            self.leader_hint = None;
        }
        self.persistent_state.set_current_term(term);
        self.state = States::Follower;
    }

    /// No messages have been received over the election timeout. Start a new election term
    /// # Followers (§5.2):
    /// -- If election timeout elapses without receiving AppendEntriesRPC from current leader or granting vote to candidate: convert to candidate
    /// # Candidates (§5.2):
    /// - On conversion to candidate, start election:
    /// -- Increment currentTerm
    /// -- Vote for self
    /// -- Reset election timer (to be handled by caller)
    /// -- Send RequestVote RPCs to all other servers
    pub fn start_election(&mut self, server_id: ServerId) -> RequestVoteRequest {
        // convert to candidate
        self.state = States::Candidate;
        self.leader_hint = None;
        // Increment currentTerm
        let term = self.persistent_state.current_term + 1;
        self.persistent_state.set_current_term(term);
        // Vote for self
        self.persistent_state.voted_for = Some(server_id);
        // Send RequestVote RPCs to all other servers
        RequestVoteRequest {
            term,
            candidate_id: server_id,
            last_log_index: self.persistent_state.log.last_log_index(),
            last_log_term: self.persistent_state.log.last_log_term(),
        }
    }

    /// Win an election and become a leader
    pub fn become_leader(&mut self, server_id: ServerId, num_servers: ServerId) {
        let last_log_index = self.persistent_state.log.last_log_index();
        let mut leader = Leader::new(num_servers, last_log_index);
        leader.set_match_index(server_id, last_log_index);
        self.state = States::Leader(leader);
        self.leader_hint = Some(server_id);
    }

    /// # Panics
    /// In case the commit index tries to decrease
    pub fn set_commit_index(&mut self, commit_index: log::Index) {
        assert!(
            commit_index >= self.commit_index,
            "Commit index must increase monotonically, tried to decrease from {} to {}",
            self.commit_index,
            commit_index
        );
        self.commit_index = commit_index;
    }

    pub fn last_applied(&self) -> log::Index {
        self.last_applied
    }

    /// # Panics
    /// In case last applied tries to decrease
    pub fn set_last_applied(&mut self, last_applied: log::Index) {
        assert!(
            last_applied >= self.last_applied,
            "Last applied must increase monotonically, tried to decrease from {} to {}",
            self.last_applied,
            last_applied
        );
        self.last_applied = last_applied;
    }

    /// Add a command from a client to this leader
    /// # Panics
    /// if not a leader
    pub fn add_command(&mut self, server_id: ServerId, command: Log::Command) -> CommandPtr {
        let term = self.persistent_state.current_term;
        let index = self.persistent_state.log.append(term, command);
        if let States::Leader(leader) = &mut self.state {
            leader.set_match_index(server_id, index);
            leader.next_index[server_id as usize] = index + 1;
            let majority_match = leader.majority_match();
            self.update_commit(majority_match);
        } else {
            panic!("must be leader")
        }
        (index, term)
    }

    /// Prepare heartbeat / log updates for followers, at most `max_entries` each
    /// #Panics
    /// if not a leader
    pub fn produce_append_entries(
        &self,
        leader_id: ServerId,
        max_entries: usize,
    ) -> Vec<(ServerId, AppendEntriesRequest<Log::Command>)> {
        if let States::Leader(Leader { next_index, .. }) = &self.state {
            next_index
                .iter()
                .enumerate()
                .filter(|(server_id, _)| *server_id != leader_id as usize)
                .map(|(server_id, &next_index)| {
                    let prev_log_index = next_index - 1;
                    (
                        server_id as ServerId,
                        AppendEntriesRequest {
                            term: self.current_term(),
                            leader_id,
                            prev_log_index,
                            prev_log_term: self
                                .persistent_state
                                .log
                                .get_term(prev_log_index)
                                .unwrap_or(0),
                            entries: self.persistent_state.log.get_from(next_index, max_entries),
                            leader_commit: self.commit_index,
                        },
                    )
                })
                .collect()
        } else {
            panic!("Heartbeat on non-leader")
        }
    }

    /// If there exists an N such that N > commitIndex, a majority of matchIndex[i] ≥ N, and log[N].term == currentTerm: set commitIndex = N (§5.3, §5.4).
    fn update_commit(&mut self, majority_match: log::Index) {
        for n in (self.commit_index + 1)..=majority_match {
            let log_n_term = self
                .persistent_state
                .log
                .get_term(n)
                .expect("should be iterating over existing logs");
            if log_n_term == self.current_term() {
                self.set_commit_index(n);
            }
        }
    }

    /// A follower has successfully appended
    /// If successful: update nextIndex and matchIndex for follower (§5.3)
    pub fn update_follower(&mut self, from: ServerId, match_idx: log::Index) {
        if let States::Leader(leader) = &mut self.state {
            let from_idx = from as usize;
            // responses can arrive out of order, an older one must not move the follower backwards
            if match_idx > leader.match_index[from_idx] {
                leader.set_match_index(from, match_idx);
            }
            leader.next_index[from_idx] = leader.match_index[from_idx] + 1;
            let majority_match_idx = leader.majority_match();
            self.update_commit(majority_match_idx)
        } else {
            panic!("Heartbeat on non-leader")
        }
    }

    /// A followers response indicates that they are inconsistent with the leader
    /// If AppendEntries fails because of log inconsistency: decrement nextIndex and retry (§5.3)
    pub fn follower_inconsistent(&mut self, from: ServerId) {
        if let States::Leader(Leader { next_index, .. }) = &mut self.state {
            let from = from as usize;
            if next_index[from] > 1 {
                next_index[from] -= 1;
            }
        } else {
            panic!("Heartbeat on non-leader")
        }
    }

    /// Invoked by leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    /// 1.  Reply false if term < currentTerm (§5.1)
    /// 2.  Reply false if log doesn’t contain an entry at prevLogIndex whose term matches prevLogTerm (§5.3)
    /// 3.  If an existing entry conflicts with a new one (same index but different terms), delete the existing entry and all that follow it (§5.3)
    /// 4.  Append any new entries not already in the log
    /// 5.  If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
    pub fn receive_append_entries(
        &mut self,
        req: AppendEntriesRequest<Log::Command>,
    ) -> AppendEntriesResponse {
        AppendEntriesResponse {
            success: self.receive_append_entries_int(req),
            term: self.persistent_state.current_term,
        }
    }

    fn receive_append_entries_int(&mut self, req: AppendEntriesRequest<Log::Command>) -> bool {
        // 1.  Reply false if term < currentTerm (§5.1)
        if req.term < self.persistent_state.current_term {
            return false;
        }
        self.leader_hint = Some(req.leader_id);
        // 2.  Reply false if log doesn’t contain an entry at prevLogIndex whose term matches prevLogTerm (§5.3)
        if !self
            .persistent_state
            .log
            .log_term_matches(req.prev_log_index, req.prev_log_term)
        {
            return false;
        }
        // 3.  If an existing entry conflicts with a new one (same index but different terms), delete the existing entry and all that follow it (§5.3)
        // 4.  Append any new entries not already in the log
        let last_new_entry_index = self
            .persistent_state
            .log
            .truncate_if_different_and_append(req.prev_log_index, req.entries);
        // 5.  If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if req.leader_commit > self.commit_index {
            let commit_index = std::cmp::min(req.leader_commit, last_new_entry_index);
            if commit_index > self.commit_index {
                self.set_commit_index(commit_index)
            }
        }
        true
    }

    /// Requested to vote for candidate
    /// 1.  Reply false if term < currentTerm (§5.1)
    /// 2.  If votedFor is null or candidateId, and candidate’s log is at least as up-to-date as receiver’s log, grant vote (§5.2, §5.4)
    pub fn receive_request_vote(&mut self, req: RequestVoteRequest) -> RequestVoteResponse {
        // 1.  Reply false if term < currentTerm (§5.1)
        let vote_granted = if req.term < self.persistent_state.current_term {
            false
        }
        // 2.  If votedFor is null or candidateId, and candidate’s log is at least as up-to-date as receiver’s log, grant vote (§5.2, §5.4)
        else if (self.persistent_state.voted_for.is_none()
            || self.persistent_state.voted_for == Some(req.candidate_id))
            && self
                .persistent_state
                .log
                .up_to_date_cmp(req.last_log_index, req.last_log_term)
                != Ordering::Greater
        {
            self.persistent_state.voted_for = Some(req.candidate_id);
            true
        } else {
            false
        };
        RequestVoteResponse {
            vote_granted,
            term: self.persistent_state.current_term,
        }
    }

    /// Apply all commited log items, returning the pointer and output of each command newly applied
    pub fn apply_commited<SM>(&mut self, state_machine: &mut SM) -> Vec<(CommandPtr, SM::Output)>
    where
        SM: StateMachine<Command = Log::Command>,
    {
        let mut applied = vec![];
        while self.commit_index > self.last_applied {
            let index = self.last_applied + 1;
            let log = &self.persistent_state.log;
            let command = log.get_command(index).expect("applied command to exist");
            let term = log.get_term(index).expect("applied command to exist");
            let output = state_machine.apply(index, command);
            self.set_last_applied(index);
            applied.push(((index, term), output));
        }
        applied
    }
}

#[cfg(test)]
impl<Log: log::Log> ServerState<Log> {
    pub fn set_log(&mut self, log: Log) {
        self.persistent_state.log = log
    }

    pub fn set_current_term(&mut self, term: Term) {
        self.persistent_state.current_term = term;
    }

    pub fn get_leader_state(&self) -> &Leader {
        if let States::Leader(leader) = &self.state {
            leader
        } else {
            panic!("Not leader")
        }
    }
}
