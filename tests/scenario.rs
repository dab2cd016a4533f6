//! Tests scenarios for clusters using the `cp_raft::server::Server` api without using any timers, serialisation or real async

use cp_raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteResponse};
use cp_raft::server::Server;
use cp_raft::state::Persistent;
use cp_raft::state_machine::StateMachine;
use cp_raft::*;

/// Adds up every command it is given
#[derive(Default)]
struct Sum(i32);

impl StateMachine for Sum {
    type Command = i32;
    type Output = i32;

    fn apply(&mut self, _index: log::Index, command: &i32) -> i32 {
        self.0 += command;
        self.0
    }
}

struct TestServer {
    api: Server<Sum>,
}

impl TestServer {
    fn new(server_id: ServerId, num_servers: ServerId, current_term: Term, log: log::InVec<i32>) -> TestServer {
        let persistent = Persistent {
            current_term,
            log,
            voted_for: None,
        };
        TestServer {
            api: Server::new(server_id, num_servers, persistent, Sum::default()),
        }
    }

    fn value(&self) -> i32 {
        self.api.state_machine().0
    }
}

/// Delivers one round of append entries from `leader` to `followers`, returning what the leader applied
fn replicate(leader: &mut TestServer, followers: &mut [TestServer]) -> Vec<(CommandPtr, i32)> {
    let mut applied = vec![];
    for (follower_id, req) in leader.api.heartbeat() {
        let match_index = req.match_index();
        let follower = followers
            .iter_mut()
            .find(|f| f.api.id() == follower_id)
            .expect("known follower");
        let resp = follower.api.receive_append_entries(req);
        applied.extend(
            leader
                .api
                .receive_append_entries_response(follower_id, match_index, resp),
        );
    }
    applied
}

#[test]
fn happy_path() {
    // cluster of 3 servers
    let mut servers: Vec<TestServer> = (0..3)
        .map(|server_id| TestServer::new(server_id, 3, 0, vec![]))
        .collect();

    // If a follower receives no communication over a period of time called the election timeout, then it assumes there is no viable leader and begins an election to choose a new leader.
    let vote_request = servers[0].api.election_timeout();
    // To begin an election, a follower increments its current term and transitions to candidate state. It then votes for itself and issues RequestVote RPCs in parallel to each of the other servers in the cluster.
    let vote = servers[1].api.receive_request_vote(vote_request.clone());
    let won1 = servers[0].api.receive_vote(vote);
    let vote = servers[2].api.receive_request_vote(vote_request);
    let won2 = servers[0].api.receive_vote(vote);
    // A candidate wins an election if it receives votes from a majority of the servers in the full cluster for the same
    // term. Each server will vote for at most one candidate in a given term, on a first-come-first-served basis.
    // (In this three server cluster, the first vote is enough to have a majority)
    assert!(won1);
    assert!(!won2);
    // Once a candidate wins an election, it becomes leader. It then sends heartbeat messages to all of the other servers to establish its authority and prevent new elections.
    for (server_id, req) in servers[0].api.heartbeat() {
        let match_index = req.match_index();
        // the announcement is an AppendEntriesRequest with no entries
        assert_eq!(req.entries.len(), 0);
        let response = servers[server_id as usize].api.receive_append_entries(req);
        // they respond so the leader can keep track of their progress
        let applied_commands = servers[0]
            .api
            .receive_append_entries_response(server_id, match_index, response);
        // there were no commands to apply yet
        assert_eq!(applied_commands.len(), 0);
        assert_eq!(servers[server_id as usize].api.leader_hint(), Some(0));
    }
    // we can now give it a command
    let command_ptr = servers[0].api.command(11).unwrap();
    // at this point the command is not applied
    assert_eq!(servers[0].value(), 0);
    // after a heartbeat the other servers' logs are updated to match the leader
    for (count, (server_id, req)) in servers[0].api.heartbeat().into_iter().enumerate() {
        let match_index = req.match_index();
        let response = servers[server_id as usize].api.receive_append_entries(req);
        let applied_commands = servers[0]
            .api
            .receive_append_entries_response(server_id, match_index, response);
        // once the first server has responded that it has replicated the command, we have a majority and so the command will be committed and applied
        if count == 0 {
            assert_eq!(applied_commands, vec![(command_ptr, 11)]);
            assert_eq!(servers[0].value(), 11);
        } else {
            assert_eq!(applied_commands.len(), 0);
        }
        // the other servers wont know about the commit yet and so wont have applied
        assert_eq!(servers[server_id as usize].value(), 0);
    }
    // after another heartbeat the other servers' will know about the commit an apply the command
    for (server_id, req) in servers[0].api.heartbeat() {
        let match_index = req.match_index();
        let response = servers[server_id as usize].api.receive_append_entries(req);
        assert!(response.success);
        let applied_commands = servers[0]
            .api
            .receive_append_entries_response(server_id, match_index, response);
        // the leader has no more commands to apply
        assert_eq!(applied_commands.len(), 0);
        // the server has now applied the commited command
        assert_eq!(servers[server_id as usize].value(), 11);
    }
}

#[test]
fn followers_redirect_to_leader() {
    let mut leader = TestServer::new(0, 3, 0, vec![]);
    let mut followers: Vec<TestServer> = (1..3).map(|id| TestServer::new(id, 3, 0, vec![])).collect();
    let req = leader.api.election_timeout();
    for follower in followers.iter_mut() {
        let vote = follower.api.receive_request_vote(req.clone());
        leader.api.receive_vote(vote);
    }
    replicate(&mut leader, &mut followers);
    assert_eq!(followers[0].api.command(1), Err(NotLeader { leader: Some(0) }));
}

mod elections {
    use super::*;

    fn append(term: Term, leader_id: ServerId) -> AppendEntriesRequest<i32> {
        AppendEntriesRequest {
            term,
            leader_id,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        }
    }

    // While waiting for votes, a candidate may receive an AppendEntries RPC from another server claiming to be leader.
    // If the leader’s term (included in its RPC) is at least as large as the candidate’s current term, then the candidate
    // recognizes the leader as legitimate and returns to follower state.
    #[test]
    fn candidate_loses() {
        let mut a = TestServer::new(0, 3, 0, vec![]);
        let mut b = TestServer::new(1, 3, 0, vec![]);
        a.api.election_timeout();
        let req = b.api.election_timeout();
        assert_eq!(req.term, 1);
        // a has voted for itself this term
        let vote = a.api.receive_request_vote(req);
        assert!(!vote.vote_granted);
        // b wins with c's vote and announces itself
        b.api.receive_vote(RequestVoteResponse {
            term: 1,
            vote_granted: true,
        });
        assert!(b.api.is_leader());
        let (_, announce) = b.api.heartbeat().into_iter().find(|(to, _)| *to == 0).unwrap();
        let resp = a.api.receive_append_entries(announce);
        assert!(resp.success);
        assert!(a.api.get_state().is_follower());
        assert_eq!(a.api.leader_hint(), Some(1));
    }

    // If the term in the RPC is smaller than the candidate’s current term, then the candidate rejects the RPC and continues in candidate state.
    #[test]
    fn old_leader_returns() {
        let mut a = TestServer::new(0, 3, 3, vec![]);
        a.api.election_timeout();
        let resp = a.api.receive_append_entries(append(3, 2));
        assert!(!resp.success);
        assert_eq!(resp.term, 4);
        assert!(a.api.get_state().is_candidate());

        // and the old leader steps down on hearing the new term
        let mut old = TestServer::new(2, 3, 3, vec![]);
        old.api.election_timeout();
        old.api.receive_vote(RequestVoteResponse {
            term: 4,
            vote_granted: true,
        });
        assert!(old.api.is_leader());
        old.api.receive_append_entries_response(
            0,
            0,
            AppendEntriesResponse {
                term: 5,
                success: false,
            },
        );
        assert!(!old.api.is_leader());
        assert_eq!(old.api.get_state().current_term(), 5);
    }

    // The third possible outcome is that a candidate neither wins nor loses the election: if many followers become
    // candidates at the same time, votes could be split so that no candidate obtains a majority. When this happens,
    // each candidate will time out and start a new election by incrementing its term and initiating another round
    // of Request-Vote RPCs.
    #[test]
    fn split_vote() {
        let mut servers: Vec<TestServer> = (0..4).map(|id| TestServer::new(id, 4, 0, vec![])).collect();
        let req0 = servers[0].api.election_timeout();
        let req1 = servers[1].api.election_timeout();
        // 2 and 3 split their votes
        let vote = servers[2].api.receive_request_vote(req0);
        assert!(!servers[0].api.receive_vote(vote));
        let vote = servers[3].api.receive_request_vote(req1);
        assert!(!servers[1].api.receive_vote(vote));
        assert!(servers[0].api.get_state().is_candidate());
        assert!(servers[1].api.get_state().is_candidate());

        // a new round in a newer term
        let req0 = servers[0].api.election_timeout();
        assert_eq!(req0.term, 2);
        let mut won = false;
        for id in 1..4 {
            let vote = servers[id].api.receive_request_vote(req0.clone());
            assert!(vote.vote_granted);
            won |= servers[0].api.receive_vote(vote);
        }
        assert!(won);
        assert!(servers[1].api.get_state().is_follower(), "the rival stepped down on the newer term");
    }

    #[test]
    fn outdated_log_loses() {
        let log = vec![log::Item::new(1, 1), log::Item::new(2, 2)];
        let mut up_to_date = TestServer::new(0, 3, 2, log);
        let mut behind = TestServer::new(1, 3, 2, vec![log::Item::new(1, 1)]);
        let req = behind.api.election_timeout();
        let vote = up_to_date.api.receive_request_vote(req);
        assert!(!vote.vote_granted);
        assert_eq!(up_to_date.api.get_state().current_term(), 3);
    }
}

/// a series of scenarios from Figure 7 of the Raft paper. A leader comes to power and its follower doesn't match and needs either some more
/// commands, some removed, or both. the leader will force the follower to duplicate its own log §5.3
mod leader_catch_up {
    use super::*;

    const LEADER_LOG: [u32; 10] = [1, 1, 1, 4, 4, 5, 5, 6, 6, 6];

    fn log_of(terms: &[Term]) -> log::InVec<i32> {
        terms
            .iter()
            .map(|&term| log::Item::new(term, term as i32))
            .collect()
    }

    fn leader() -> TestServer {
        let mut server = TestServer::new(0, 2, 7, log_of(&LEADER_LOG[..]));
        let req = server.api.election_timeout();
        assert_eq!(req.term, 8);
        let won = server.api.receive_vote(RequestVoteResponse {
            vote_granted: true,
            term: req.term,
        });
        assert!(won);
        server
    }

    fn follower(terms: &[Term]) -> TestServer {
        TestServer::new(1, 2, 0, log_of(terms))
    }

    /// entries from earlier terms are never committed by counting replicas, so nothing is applied
    fn catch_up(terms: &[Term], rounds: usize) -> TestServer {
        let mut leader = leader();
        let mut followers = [follower(terms)];
        for _ in 0..rounds {
            let completed_commands = replicate(&mut leader, &mut followers);
            assert_eq!(completed_commands.len(), 0);
        }
        let [follower] = followers;
        follower
    }

    #[test]
    fn a() {
        let follower = catch_up(&[1, 1, 1, 4, 4, 5, 5, 6, 6], 2);
        assert_eq!(follower.api.get_state().log(), &log_of(&LEADER_LOG));
    }

    #[test]
    fn b() {
        let follower = catch_up(&[1, 1, 1, 4], 7);
        assert_eq!(follower.api.get_state().log(), &log_of(&LEADER_LOG));
    }

    #[test]
    fn e() {
        let follower = catch_up(&[1, 1, 1, 4, 4, 4, 4], 7);
        assert_eq!(follower.api.get_state().log(), &log_of(&LEADER_LOG));
    }

    #[test]
    fn f() {
        let follower = catch_up(&[1, 1, 1, 2, 2, 2, 3, 3, 3, 3, 3], 8);
        assert_eq!(follower.api.get_state().log(), &log_of(&LEADER_LOG));
    }

    /// Followers with extra entries keep them until the leader writes over them in its own term
    fn overwritten(terms: &[Term]) {
        let mut leader = leader();
        let mut followers = [follower(terms)];
        replicate(&mut leader, &mut followers);
        assert_eq!(followers[0].api.get_state().log().len(), terms.len());

        let ptr = leader.api.command(100).unwrap();
        assert_eq!(ptr, (11, 8));
        let applied = replicate(&mut leader, &mut followers);
        // the whole log commits with the first entry of the new term
        assert_eq!(applied.len(), 11);
        assert_eq!(applied.last().unwrap().0, ptr);

        let mut expected = log_of(&LEADER_LOG);
        expected.push(log::Item::new(8, 100));
        assert_eq!(followers[0].api.get_state().log(), &expected);
    }

    #[test]
    fn c() {
        overwritten(&[1, 1, 1, 4, 4, 5, 5, 6, 6, 6, 6]);
    }

    #[test]
    fn d() {
        overwritten(&[1, 1, 1, 4, 4, 5, 5, 6, 6, 6, 7, 7]);
    }
}
