use super::log::{self, Log};
use super::rpc::*;
use super::state::{Persistent, ServerState};
use super::state_machine::StateMachine;
use super::{CommandPtr, NotLeader, ServerId};

/// Entries carried by a single AppendEntries request unless configured otherwise
pub const DEFAULT_MAX_ENTRIES_PER_APPEND: usize = 64;

/// The Raft rules for a single server, with no timers, transport or async.
/// The caller is in charge of delivering the returned requests and resetting timers.
pub struct Server<SM: StateMachine, L: Log<Command = SM::Command> = log::InVec<<SM as StateMachine>::Command>> {
    state: ServerState<L>,
    state_machine: SM,
    server_id: ServerId,
    num_servers: ServerId,
    votes_this_term: ServerId,
    max_entries_per_append: usize,
}

impl<SM: StateMachine, L: Log<Command = SM::Command>> Server<SM, L> {
    pub fn new(
        server_id: ServerId,
        num_servers: ServerId,
        persistent: Persistent<L>,
        state_machine: SM,
    ) -> Self {
        Self {
            state: ServerState::new(persistent),
            state_machine,
            server_id,
            num_servers,
            votes_this_term: 0,
            max_entries_per_append: DEFAULT_MAX_ENTRIES_PER_APPEND,
        }
    }

    pub fn with_max_entries_per_append(mut self, max_entries_per_append: usize) -> Self {
        self.max_entries_per_append = max_entries_per_append.max(1);
        self
    }

    pub fn id(&self) -> ServerId {
        self.server_id
    }

    pub fn get_state(&self) -> &ServerState<L> {
        &self.state
    }

    pub fn state_machine(&self) -> &SM {
        &self.state_machine
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    /// Where clients should be sent, as far as this server knows
    pub fn leader_hint(&self) -> Option<ServerId> {
        self.state.leader_hint()
    }

    /// Prehandling of all RPC requests and responses before the receiver logic
    /// If RPC request or response contains term T > currentTerm: set currentTerm = T, convert to follower (§5.1)
    pub fn pre_handle(&mut self, message: &impl RPCMessage) {
        if message.term() > self.state.current_term() {
            self.state.follow_new_term(message.term());
        }
    }

    /// If commitIndex > lastApplied: increment lastApplied, apply log[lastApplied] to state machine (§5.3)
    fn post_handle(&mut self) -> Vec<(CommandPtr, SM::Output)> {
        self.state.apply_commited(&mut self.state_machine)
    }

    /// No messages have been received over the election timeout.
    /// # Followers (§5.2):
    /// -- If election timeout elapses without receiving AppendEntriesRPC from current leader or granting vote to candidate: convert to candidate
    /// # Candidates (§5.2):
    /// - On conversion to candidate, start election:
    /// -- Increment currentTerm
    /// -- Vote for self
    /// -- Reset election timer
    /// -- Send RequestVote RPCs to all other servers
    /// ...
    /// -- If election timeout elapses: start new election
    ///
    /// A cluster of one has its majority straight away and is leader on return.
    pub fn election_timeout(&mut self) -> RequestVoteRequest {
        assert!(
            !self.state.is_leader(),
            "election timeout is not expected on a leader"
        );
        self.votes_this_term = 1;
        let req = self.state.start_election(self.server_id);
        self.check_majority();
        req
    }

    fn check_majority(&mut self) -> bool {
        // If votes received from majority of servers: become leader
        if self.state.is_candidate() && self.votes_this_term > self.num_servers / 2 {
            self.state.become_leader(self.server_id, self.num_servers);
            true
        } else {
            false
        }
    }

    pub fn receive_request_vote(&mut self, req: RequestVoteRequest) -> RequestVoteResponse {
        self.pre_handle(&req);
        self.state.receive_request_vote(req)
    }

    /// Counts a vote, returns true if this server has just become leader.
    /// Upon election the caller should send initial empty AppendEntries RPCs (heartbeat) to each server
    pub fn receive_vote(&mut self, res: RequestVoteResponse) -> bool {
        self.pre_handle(&res);
        if !self.state.is_candidate() {
            return false;
        }
        // count votes
        if res.term == self.state.current_term() && res.vote_granted {
            self.votes_this_term += 1;
        }
        self.check_majority()
    }

    /// While waiting for votes, a candidate may receive an AppendEntries RPC from another server claiming to be leader. If the leader’s term
    /// (included in its RPC) is at least as large as the candidate’s current term, then the candidate recognizes the leader as legitimate and
    /// returns to follower state. If the term in the RPC is smaller than the candidate’s current term, then the candidate rejects the RPC and continues in candidate state.
    ///
    /// Newly committed commands are applied to the state machine before responding.
    pub fn receive_append_entries(
        &mut self,
        req: AppendEntriesRequest<SM::Command>,
    ) -> AppendEntriesResponse {
        self.pre_handle(&req);
        if self.state.is_leader() && req.term == self.state.current_term() {
            // two leaders in one term would break election safety, this can only be a misrouted message
            ::log::warn!(
                "{}; rejecting append entries from {} in own term {}",
                self.server_id,
                req.leader_id,
                req.term
            );
            return AppendEntriesResponse {
                term: self.state.current_term(),
                success: false,
            };
        }
        if self.state.is_candidate() && req.term >= self.state.current_term() {
            self.state.follow_new_term(req.term);
        }
        let res = self.state.receive_append_entries(req);
        self.post_handle();
        res
    }

    /// Heartbeat / replication requests to send to each other server
    pub fn heartbeat(&self) -> Vec<(ServerId, AppendEntriesRequest<SM::Command>)> {
        if self.state.is_leader() {
            self.state
                .produce_append_entries(self.server_id, self.max_entries_per_append)
        } else {
            vec![]
        }
    }

    /// If command received from client: append entry to local log, respond after entry applied to state machine (§5.3)
    pub fn command(&mut self, command: SM::Command) -> Result<CommandPtr, NotLeader> {
        if !self.state.is_leader() {
            return Err(NotLeader {
                leader: self.state.leader_hint(),
            });
        }
        Ok(self.state.add_command(self.server_id, command))
    }

    /// Applies anything committed but not yet applied, e.g. after a command on a single server cluster
    pub fn apply_commited(&mut self) -> Vec<(CommandPtr, SM::Output)> {
        self.post_handle()
    }

    /// - If successful: update nextIndex and matchIndex for follower (§5.3)
    /// - If AppendEntries fails because of log inconsistency: decrement nextIndex and retry (§5.3)
    /// - If there exists an N such that N > commitIndex, a majority of matchIndex[i] ≥ N, and log[N].term == currentTerm: set commitIndex = N (§5.3, §5.4).
    ///
    /// Returns the commands applied as a result.
    pub fn receive_append_entries_response(
        &mut self,
        from: ServerId,
        match_index: log::Index,
        res: AppendEntriesResponse,
    ) -> Vec<(CommandPtr, SM::Output)> {
        self.pre_handle(&res);
        if !self.state.is_leader() || res.term < self.state.current_term() {
            return vec![];
        }
        if res.success {
            self.state.update_follower(from, match_index);
        } else {
            self.state.follower_inconsistent(from);
        }
        self.post_handle()
    }
}
