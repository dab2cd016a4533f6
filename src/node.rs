//! A Raft server as an actix actor: owns the timers and the clients waiting for their commands to apply.

use super::cluster::{ClusterRunner, RoutedMessage};
use super::config::ClusterConfig;
use super::rpc::*;
use super::server::Server;
use super::state::Persistent;
use super::state_machine::StateMachine;
use super::{now_unix_ms, CommandPtr, NotLeader, ServerId, Term};
use ::log::{debug, info, trace};
use actix::dev::Request;
use actix::prelude::*;
use futures::channel::oneshot;
use std::collections::HashMap;
use std::time::Duration;

enum Timers {
    Uninitialised,
    Election(SpawnHandle),
    Heartbeat(SpawnHandle),
}

/// Why a command was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("not the leader, leader hint {leader:?}")]
    NotLeader { leader: Option<ServerId> },
    #[error("server unreachable")]
    Unreachable,
    /// the leader lost its leadership, or the entry was overwritten, before the command applied
    #[error("response canceled")]
    ResponseCanceled,
}

impl From<NotLeader> for CommandError {
    fn from(NotLeader { leader }: NotLeader) -> Self {
        CommandError::NotLeader { leader }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: ServerId,
    pub term: Term,
    pub role: Role,
    pub leader_hint: Option<ServerId>,
    pub commit_index: usize,
    pub last_applied: usize,
}

pub struct Configuration<SM: StateMachine> {
    pub own_id: ServerId,
    pub num_servers: ServerId,
    pub broker: Addr<ClusterRunner<SM>>,
    pub cluster: ClusterConfig,
}

impl<SM: StateMachine> Configuration<SM> {
    fn to_peers<Req>(&self, req: Req) -> Vec<(ServerId, Request<ClusterRunner<SM>, RoutedMessage<Req>>)>
    where
        Req: Message + Clone + Send + 'static,
        Req::Result: Send,
        ClusterRunner<SM>: Handler<RoutedMessage<Req>>,
        <ClusterRunner<SM> as Actor>::Context: actix::dev::ToEnvelope<ClusterRunner<SM>, RoutedMessage<Req>>,
    {
        (0..self.num_servers)
            .filter(|&id| id != self.own_id)
            .map(|id| {
                (
                    id,
                    self.broker.send(RoutedMessage {
                        from: self.own_id,
                        to: id,
                        msg: req.clone(),
                    }),
                )
            })
            .collect()
    }

    /// random between the configured minimum and maximum
    fn election_timeout(&self) -> Duration {
        let rand: f64 = random_number::rand::random();
        let min = self.cluster.election_timeout_min_ms;
        let spread = self.cluster.election_timeout_max_ms.saturating_sub(min);
        Duration::from_millis(min + (spread as f64 * rand) as u64)
    }
}

pub struct Node<SM: StateMachine> {
    configuration: Configuration<SM>,
    timer: Timers,
    core: Server<SM>,
    commands: HashMap<CommandPtr, oneshot::Sender<SM::Output>>,
}

impl<SM: StateMachine> Node<SM> {
    pub fn new(
        own_id: ServerId,
        broker: Addr<ClusterRunner<SM>>,
        cluster: &ClusterConfig,
        state_machine: SM,
    ) -> Self {
        let num_servers = cluster.members;
        Node {
            configuration: Configuration {
                own_id,
                num_servers,
                broker,
                cluster: cluster.clone(),
            },
            timer: Timers::Uninitialised,
            core: Server::new(own_id, num_servers, Persistent::default(), state_machine)
                .with_max_entries_per_append(cluster.max_entries_per_append),
            commands: HashMap::new(),
        }
    }

    fn own_id(&self) -> ServerId {
        self.configuration.own_id
    }

    /// Answers the clients waiting on applied commands. A waiting client whose index was applied with a different
    /// term lost its entry to a newer leader.
    fn complete_responses(&mut self, applied: Vec<(CommandPtr, SM::Output)>) {
        for ((index, term), output) in applied {
            if let Some(sender) = self.commands.remove(&(index, term)) {
                let _ = sender.send(output);
            }
            self.commands.retain(|&(pending_index, _), _| pending_index != index);
        }
    }

    fn deferred_response(&mut self, cmd: CommandPtr) -> oneshot::Receiver<SM::Output> {
        let (sender, receiver) = oneshot::channel();
        self.commands.insert(cmd, sender);
        receiver
    }

    fn cancel_timer(&mut self, ctx: &mut Context<Self>) {
        match std::mem::replace(&mut self.timer, Timers::Uninitialised) {
            Timers::Election(handle) | Timers::Heartbeat(handle) => {
                ctx.cancel_future(handle);
            }
            Timers::Uninitialised => {}
        }
    }

    fn reset_election_timer(&mut self, ctx: &mut Context<Self>) {
        self.cancel_timer(ctx);
        let timeout = self.configuration.election_timeout();
        self.timer = Timers::Election(ctx.notify_later(ElectionTimeout, timeout));
    }

    fn reset_heartbeat(&mut self, ctx: &mut Context<Self>) {
        self.cancel_timer(ctx);
        let interval = self.configuration.cluster.heartbeat_interval();
        self.timer = Timers::Heartbeat(ctx.notify_later(Heartbeat, interval));
    }

    /// Swaps timers when leadership changed while handling a message
    fn after_transition(&mut self, was_leader: bool, ctx: &mut Context<Self>) {
        let is_leader = self.core.is_leader();
        if is_leader && !was_leader {
            info!(
                "{}; we became the leader in term {}",
                self.own_id(),
                self.core.get_state().current_term()
            );
            ctx.notify(Heartbeat);
        } else if was_leader && !is_leader {
            info!(
                "{}; stepped down in term {}, failing {} pending commands",
                self.own_id(),
                self.core.get_state().current_term(),
                self.commands.len()
            );
            // dropping the senders cancels the waiting clients, they retry against the new leader
            self.commands.clear();
            self.reset_election_timer(ctx);
        }
    }

    /// Proposes the state machine's housekeeping command while leader
    fn housekeeping(&mut self, ctx: &mut Context<Self>) {
        if !self.core.is_leader() {
            return;
        }
        if let Some(command) = self.core.state_machine().housekeeping(now_unix_ms()) {
            trace!("{}; proposing housekeeping {:?}", self.own_id(), command);
            if self.core.command(command).is_ok() {
                let applied = self.core.apply_commited();
                self.complete_responses(applied);
                ctx.notify(Heartbeat);
            }
        }
    }

    fn status(&self) -> NodeStatus {
        let state = self.core.get_state();
        let role = if state.is_leader() {
            Role::Leader
        } else if state.is_candidate() {
            Role::Candidate
        } else {
            Role::Follower
        };
        NodeStatus {
            id: self.own_id(),
            term: state.current_term(),
            role,
            leader_hint: state.leader_hint(),
            commit_index: state.commit_index(),
            last_applied: state.last_applied(),
        }
    }
}

impl<SM: StateMachine> Actor for Node<SM> {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.reset_election_timer(ctx);
        let interval = self.configuration.cluster.housekeeping_interval();
        ctx.run_interval(interval, |act, ctx| act.housekeeping(ctx));
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct ElectionTimeout;

impl<SM: StateMachine> Handler<ElectionTimeout> for Node<SM> {
    type Result = ();

    fn handle(&mut self, _: ElectionTimeout, ctx: &mut Self::Context) -> Self::Result {
        if self.core.is_leader() {
            return;
        }
        let req = self.core.election_timeout();
        debug!("{}; election timeout, standing in term {}", self.own_id(), req.term);

        self.reset_election_timer(ctx);
        if self.core.is_leader() {
            self.after_transition(false, ctx);
            return;
        }

        let own_id = self.own_id();
        for (id, request) in self.configuration.to_peers(req) {
            ctx.spawn(
                fut::wrap_future(async move {
                    trace!("{}; requesting vote from {}", own_id, id);
                    request.await
                })
                .map(move |resp, _actor, ctx: &mut Self::Context| match resp {
                    Ok(Some(resp)) => ctx.notify(VoteReceived(resp)),
                    _ => trace!("{}; no vote from {}", own_id, id),
                }),
            );
        }
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct Heartbeat;

impl<SM: StateMachine> Handler<Heartbeat> for Node<SM> {
    type Result = ();

    fn handle(&mut self, _: Heartbeat, ctx: &mut Self::Context) -> Self::Result {
        if !self.core.is_leader() {
            return;
        }
        let own_id = self.own_id();
        for (id, req) in self.core.heartbeat() {
            let match_index = req.match_index();
            let request = self.configuration.broker.send(RoutedMessage {
                from: own_id,
                to: id,
                msg: req,
            });
            ctx.spawn(fut::wrap_future(request).map(
                move |resp, _actor, ctx: &mut Self::Context| match resp {
                    Ok(Some(resp)) => ctx.notify(AppendEntriesReceived(resp, match_index, id)),
                    _ => trace!("{}; no append entries response from {}", own_id, id),
                },
            ));
        }

        self.reset_heartbeat(ctx);
    }
}

impl<SM: StateMachine> Handler<AppendEntriesRequest<SM::Command>> for Node<SM> {
    type Result = MessageResult<AppendEntriesRequest<SM::Command>>;

    fn handle(
        &mut self,
        req: AppendEntriesRequest<SM::Command>,
        ctx: &mut Self::Context,
    ) -> Self::Result {
        let was_leader = self.core.is_leader();
        let leader_term = req.term;
        let res = self.core.receive_append_entries(req);
        if leader_term == self.core.get_state().current_term() && !self.core.is_leader() {
            // heard from the legitimate leader of this term
            self.reset_election_timer(ctx);
        }
        self.after_transition(was_leader, ctx);
        MessageResult(res)
    }
}

impl<SM: StateMachine> Handler<RequestVoteRequest> for Node<SM> {
    type Result = MessageResult<RequestVoteRequest>;

    fn handle(&mut self, req: RequestVoteRequest, ctx: &mut Self::Context) -> Self::Result {
        trace!("{}; received vote request from {}", self.own_id(), req.candidate_id);
        let was_leader = self.core.is_leader();
        let res = self.core.receive_request_vote(req);
        if res.vote_granted {
            self.reset_election_timer(ctx);
        }
        self.after_transition(was_leader, ctx);
        MessageResult(res)
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct VoteReceived(RequestVoteResponse);

impl<SM: StateMachine> Handler<VoteReceived> for Node<SM> {
    type Result = ();

    fn handle(&mut self, VoteReceived(res): VoteReceived, ctx: &mut Self::Context) -> Self::Result {
        trace!("{}; received vote {:?}", self.own_id(), res);
        let was_leader = self.core.is_leader();
        self.core.receive_vote(res);
        self.after_transition(was_leader, ctx);
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct AppendEntriesReceived(AppendEntriesResponse, usize, ServerId);

impl<SM: StateMachine> Handler<AppendEntriesReceived> for Node<SM> {
    type Result = ();

    fn handle(
        &mut self,
        AppendEntriesReceived(resp, match_index, from): AppendEntriesReceived,
        ctx: &mut Self::Context,
    ) -> Self::Result {
        let was_leader = self.core.is_leader();
        let applied = self
            .core
            .receive_append_entries_response(from, match_index, resp);
        self.complete_responses(applied);
        self.after_transition(was_leader, ctx);
    }
}

/// A client command, answered with the state machine's output once applied on this leader
pub struct ApplyCommand<SM: StateMachine>(pub SM::Command);

impl<SM: StateMachine> Message for ApplyCommand<SM> {
    type Result = Result<SM::Output, CommandError>;
}

impl<SM: StateMachine> Handler<ApplyCommand<SM>> for Node<SM> {
    type Result = ResponseActFuture<Self, Result<SM::Output, CommandError>>;

    fn handle(&mut self, ApplyCommand(command): ApplyCommand<SM>, ctx: &mut Self::Context) -> Self::Result {
        // add command to raftlog
        let ptr = match self.core.command(command) {
            Ok(ptr) => ptr,
            Err(not_leader) => {
                return Box::pin(
                    futures::future::ready(Err(CommandError::from(not_leader))).into_actor(self),
                );
            }
        };
        let future = self.deferred_response(ptr);
        // a cluster of one commits straight away
        let applied = self.core.apply_commited();
        self.complete_responses(applied);
        // send heartbeat immediately
        ctx.notify(Heartbeat);
        Box::pin(future.into_actor(self).map(|res, _act, _ctx| {
            res.map_err(|oneshot::Canceled| CommandError::ResponseCanceled)
        }))
    }
}

#[derive(Message)]
#[rtype(result = "NodeStatus")]
pub struct GetStatus;

impl<SM: StateMachine> Handler<GetStatus> for Node<SM> {
    type Result = MessageResult<GetStatus>;

    fn handle(&mut self, _: GetStatus, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.status())
    }
}

/// Reads this server's copy of the state machine
pub struct Inspect<SM, R>(pub Box<dyn FnOnce(&SM) -> R + Send>);

impl<SM: StateMachine, R: Send + 'static> Message for Inspect<SM, R> {
    type Result = R;
}

impl<SM: StateMachine, R: Send + 'static> Handler<Inspect<SM, R>> for Node<SM> {
    type Result = MessageResult<Inspect<SM, R>>;

    fn handle(&mut self, Inspect(f): Inspect<SM, R>, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(f(self.core.state_machine()))
    }
}
