//! In-process transport: every server of the group is an actor and all traffic between them, and from clients to
//! them, passes through a single router which can simulate servers becoming unreachable.

use super::config::ClusterConfig;
use super::node::{ApplyCommand, CommandError, GetStatus, Node, NodeStatus};
use super::state_machine::StateMachine;
use super::ServerId;
use ::log::{info, trace};
use actix::prelude::*;
use futures::future::join_all;
use std::collections::HashSet;
use std::fmt::Debug;
use std::marker::PhantomData;

/// A message from one server to another, answered with `None` when it could not be delivered
#[derive(Debug, Clone)]
pub struct RoutedMessage<Req> {
    pub from: ServerId,
    pub to: ServerId,
    pub msg: Req,
}

impl<Req: Message> Message for RoutedMessage<Req>
where
    Req::Result: Send,
{
    type Result = Option<Req::Result>;
}

/// A client command addressed to one server
pub struct ClientRequest<SM: StateMachine> {
    pub to: ServerId,
    pub command: SM::Command,
}

impl<SM: StateMachine> Message for ClientRequest<SM> {
    type Result = Result<SM::Output, CommandError>;
}

/// Cuts a server off from the rest of the group and from clients, or reconnects it
#[derive(Message, Debug, Clone, Copy)]
#[rtype(result = "()")]
pub struct SetReachable {
    pub server: ServerId,
    pub reachable: bool,
}

#[derive(Message)]
#[rtype(result = "ServerId")]
pub struct Members;

#[derive(Message)]
#[rtype(result = "Vec<NodeStatus>")]
pub struct ClusterStatus;

/// The addresses of every server, for tests which need to talk to one directly
pub struct NodeAddrs<SM>(PhantomData<fn() -> SM>);

impl<SM> Default for NodeAddrs<SM> {
    fn default() -> Self {
        NodeAddrs(PhantomData)
    }
}

impl<SM: StateMachine> Message for NodeAddrs<SM> {
    type Result = Vec<Addr<Node<SM>>>;
}

pub struct ClusterRunner<SM: StateMachine> {
    addrs: Vec<Addr<Node<SM>>>,
    unreachable: HashSet<ServerId>,
}

impl<SM: StateMachine> ClusterRunner<SM> {
    /// Starts the router and one server per configured member, each with the state machine built by `factory`
    pub fn start(config: &ClusterConfig, factory: impl Fn(ServerId) -> SM + 'static) -> Addr<Self> {
        let config = config.clone();
        ClusterRunner::create(move |ctx| {
            let broker = ctx.address();
            info!("R; starting a cluster of {}", config.members);
            let addrs = (0..config.members)
                .map(|id| Node::new(id, broker.clone(), &config, factory(id)).start())
                .collect();
            ClusterRunner {
                addrs,
                unreachable: HashSet::new(),
            }
        })
    }

    fn reachable(&self, id: ServerId) -> bool {
        (id as usize) < self.addrs.len() && !self.unreachable.contains(&id)
    }
}

impl<SM: StateMachine> Actor for ClusterRunner<SM> {
    type Context = Context<Self>;
}

/// ClusterRunner will route any `RoutedMessage`s that nodes can handle to its cluster nodes
impl<SM, Req> Handler<RoutedMessage<Req>> for ClusterRunner<SM>
where
    SM: StateMachine,
    Req: Message + Send + Debug + 'static,
    Req::Result: Send + Debug,
    Node<SM>: Handler<Req>,
    <Node<SM> as Actor>::Context: actix::dev::ToEnvelope<Node<SM>, Req>,
{
    type Result = ResponseFuture<Option<Req::Result>>;

    fn handle(
        &mut self,
        RoutedMessage { from, to, msg }: RoutedMessage<Req>,
        _ctx: &mut Self::Context,
    ) -> Self::Result {
        if !self.reachable(from) || !self.reachable(to) {
            trace!("R; dropping {} -> {} - {:?}", from, to, msg);
            return Box::pin(async { None });
        }
        trace!("R; {} -> {} - {:?}", from, to, msg);
        let req_fut = self.addrs[to as usize].send(msg);
        Box::pin(async move {
            let res = req_fut.await.ok();
            trace!("R; {} <- {} - {:?}", from, to, res);
            res
        })
    }
}

impl<SM: StateMachine> Handler<ClientRequest<SM>> for ClusterRunner<SM> {
    type Result = ResponseFuture<Result<SM::Output, CommandError>>;

    fn handle(&mut self, ClientRequest { to, command }: ClientRequest<SM>, _ctx: &mut Self::Context) -> Self::Result {
        if !self.reachable(to) {
            return Box::pin(async { Err(CommandError::Unreachable) });
        }
        let req_fut = self.addrs[to as usize].send(ApplyCommand(command));
        Box::pin(async move {
            match req_fut.await {
                Ok(res) => res,
                Err(_) => Err(CommandError::Unreachable),
            }
        })
    }
}

impl<SM: StateMachine> Handler<SetReachable> for ClusterRunner<SM> {
    type Result = ();

    fn handle(&mut self, SetReachable { server, reachable }: SetReachable, _ctx: &mut Self::Context) {
        info!("R; server {} reachable: {}", server, reachable);
        if reachable {
            self.unreachable.remove(&server);
        } else {
            self.unreachable.insert(server);
        }
    }
}

impl<SM: StateMachine> Handler<Members> for ClusterRunner<SM> {
    type Result = ServerId;

    fn handle(&mut self, _: Members, _ctx: &mut Self::Context) -> ServerId {
        self.addrs.len() as ServerId
    }
}

impl<SM: StateMachine> Handler<ClusterStatus> for ClusterRunner<SM> {
    type Result = ResponseFuture<Vec<NodeStatus>>;

    fn handle(&mut self, _: ClusterStatus, _ctx: &mut Self::Context) -> Self::Result {
        let requests = join_all(self.addrs.iter().map(|addr| addr.send(GetStatus)));
        Box::pin(async move { requests.await.into_iter().filter_map(Result::ok).collect() })
    }
}

impl<SM: StateMachine> Handler<NodeAddrs<SM>> for ClusterRunner<SM> {
    type Result = MessageResult<NodeAddrs<SM>>;

    fn handle(&mut self, _: NodeAddrs<SM>, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.addrs.clone())
    }
}
