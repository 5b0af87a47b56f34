use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use libp2p::identify::{
    Behaviour as IdentifyBehavior,
    Config as IdentifyConfig,
    Event as IdentifyEvent,
};
use libp2p::request_response::cbor::Behaviour as RequestResponseBehavior;
use libp2p::request_response::{
    Config as RequestResponseConfig,
    Event as RequestResponseEvent,
    Message as RequestResponseMessage,
    OutboundRequestId,
    ProtocolSupport as RequestResponseProtocolSupport,
    ResponseChannel,
};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{identity, noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::behavior::Behavior;
use crate::behavior::Event as AgentEvent;
use crate::block::Block;
use crate::constants::*;
use crate::errors::RpcError;
use crate::message::{Request, Response};

type Reply = oneshot::Sender<Result<Response, RpcError>>;

/// Outbound side of the transport, addressed by peer multiaddr. Transport
/// failures never escape `send_block`/`request_block`: they read as a
/// refusal or a missing block.
pub trait PeerClient: Send + Sync + 'static {
    fn call(
        &self,
        peer: &Multiaddr,
        request: Request,
    ) -> impl Future<Output = Result<Response, RpcError>> + Send;

    fn send_block(&self, peer: &Multiaddr, block: &Block) -> impl Future<Output = bool> + Send {
        let request = Request::send_block(block.clone());
        async move {
            match self.call(peer, request).await {
                Ok(Response::Accepted) => true,
                Ok(other) => {
                    debug!("{} did not take the block: {:?}", peer, other);
                    false
                }
                Err(e) => {
                    debug!("send block to {}: {}", peer, e);
                    false
                }
            }
        }
    }

    fn request_block(
        &self,
        peer: &Multiaddr,
        sequence_number: u64,
    ) -> impl Future<Output = Option<Block>> + Send {
        async move {
            match self.call(peer, Request::request_block(sequence_number)).await {
                Ok(Response::Found(block)) => Some(block),
                Ok(Response::NotFound) => None,
                Ok(other) => {
                    debug!(
                        "unexpected answer from {} for block {}: {:?}",
                        peer, sequence_number, other
                    );
                    None
                }
                Err(e) => {
                    debug!("request block {} from {}: {}", sequence_number, peer, e);
                    None
                }
            }
        }
    }
}

/// Inbound side: turns a request into the response sent back to the caller.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> impl Future<Output = Response> + Send;
}

enum Command {
    Call {
        peer: Multiaddr,
        request: Request,
        reply: Reply,
    },
    Respond {
        channel: ResponseChannel<Response>,
        response: Response,
    },
}

pub struct InboundRequest {
    pub peer: PeerId,
    pub request: Request,
    channel: ResponseChannel<Response>,
}

/// Cheap handle to the network task.
#[derive(Clone)]
pub struct RpcClient {
    commands: mpsc::UnboundedSender<Command>,
    timeout: Duration,
}

impl RpcClient {
    fn respond(&self, channel: ResponseChannel<Response>, response: Response) {
        if self.commands.send(Command::Respond { channel, response }).is_err() {
            debug!("network stopped before a response could be sent");
        }
    }
}

impl PeerClient for RpcClient {
    fn call(
        &self,
        peer: &Multiaddr,
        request: Request,
    ) -> impl Future<Output = Result<Response, RpcError>> + Send {
        let peer = peer.clone();
        let commands = self.commands.clone();
        let timeout = self.timeout;
        async move {
            let (reply, rx) = oneshot::channel();
            commands
                .send(Command::Call {
                    peer: peer.clone(),
                    request,
                    reply,
                })
                .map_err(|_| RpcError::Disconnected)?;
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(RpcError::Disconnected),
                Err(_) => Err(RpcError::PeerTimeout {
                    peer: peer.to_string(),
                }),
            }
        }
    }
}

/// Owns the libp2p swarm. Calls to peers that are not connected yet are
/// parked until the dial settles.
pub struct Network {
    swarm: Swarm<Behavior>,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedSender<InboundRequest>,
    alive: Arc<AtomicBool>,
    listening: bool,
    listen_addrs: Vec<Multiaddr>,
    peers_by_addr: HashMap<Multiaddr, PeerId>,
    dialing: HashMap<ConnectionId, Multiaddr>,
    parked: HashMap<Multiaddr, Vec<(Request, Reply)>>,
    outstanding: HashMap<OutboundRequestId, (Multiaddr, Reply)>,
}

impl Network {
    pub fn new(
        local_key: identity::Keypair,
        listen: Option<Multiaddr>,
        timeout: Duration,
        alive: Arc<AtomicBool>,
    ) -> Result<
        (Network, RpcClient, mpsc::UnboundedReceiver<InboundRequest>),
        Box<dyn std::error::Error>,
    > {
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(local_key)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key| {
                info!("Local peer ID : {}", PeerId::from(key.public()));
                let identify_config =
                    IdentifyConfig::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                        .with_interval(Duration::from_secs(30));
                let rr_config = RequestResponseConfig::default().with_request_timeout(timeout);
                let rr_protocol = StreamProtocol::new(PROTOCOL_NAME);
                let rr = RequestResponseBehavior::<Request, Response>::new(
                    [(rr_protocol, RequestResponseProtocolSupport::Full)],
                    rr_config,
                );
                Behavior::new(IdentifyBehavior::new(identify_config), rr)
            })?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();
        let listening = match listen {
            Some(addr) => {
                swarm.listen_on(addr.clone())?;
                info!("listening on {}", addr);
                true
            }
            None => false,
        };

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let network = Network {
            swarm,
            commands,
            inbound,
            alive,
            listening,
            listen_addrs: Vec::new(),
            peers_by_addr: HashMap::new(),
            dialing: HashMap::new(),
            parked: HashMap::new(),
            outstanding: HashMap::new(),
        };
        let client = RpcClient {
            commands: commands_tx,
            timeout,
        };
        Ok((network, client, inbound_rx))
    }

    pub fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    /// The first address the listener is bound to, once the transport has
    /// reported it. Resolves a port 0 request to the real port. `None` if the
    /// network was built without a listen address or the listener closed.
    pub async fn listen_address(&mut self) -> Option<Multiaddr> {
        while self.listening && self.listen_addrs.is_empty() {
            let event = self.swarm.select_next_some().await;
            self.handle_event(event);
        }
        self.listen_addrs.first().cloned()
    }

    /// Drives the swarm until the liveness flag clears or every client
    /// handle is gone.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(LIVENESS_TICK);
        while self.alive.load(Ordering::SeqCst) {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = tick.tick() => {}
            }
        }
        info!("network stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call {
                peer,
                request,
                reply,
            } => match self.peers_by_addr.get(&peer).copied() {
                Some(peer_id) if self.swarm.is_connected(&peer_id) => {
                    self.dispatch(peer_id, peer, request, reply)
                }
                _ => self.park(peer, request, reply),
            },
            Command::Respond { channel, response } => {
                if self.swarm.behaviour_mut().send_response(channel, response).is_err() {
                    warn!("could not send response, requester has gone away");
                }
            }
        }
    }

    fn dispatch(&mut self, peer_id: PeerId, addr: Multiaddr, request: Request, reply: Reply) {
        debug!("send {} to {} ({})", request.kind(), addr, peer_id);
        let request_id = self.swarm.behaviour_mut().send_request(&peer_id, request);
        self.outstanding.insert(request_id, (addr, reply));
    }

    fn park(&mut self, addr: Multiaddr, request: Request, reply: Reply) {
        let dial_pending = self.parked.contains_key(&addr);
        self.parked.entry(addr.clone()).or_default().push((request, reply));
        if dial_pending {
            return;
        }
        let opts = DialOpts::unknown_peer_id().address(addr.clone()).build();
        let connection_id = opts.connection_id();
        match self.swarm.dial(opts) {
            Ok(()) => {
                info!("Dialing: {} | {}", addr, connection_id);
                self.dialing.insert(connection_id, addr);
            }
            Err(e) => {
                warn!("cannot dial {}: {}", addr, e);
                self.fail_parked(&addr);
            }
        }
    }

    fn fail_parked(&mut self, addr: &Multiaddr) {
        for (_, reply) in self.parked.remove(addr).unwrap_or_default() {
            let _ = reply.send(Err(RpcError::PeerUnreachable {
                peer: addr.to_string(),
            }));
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<AgentEvent>) {
        match event {
            SwarmEvent::NewListenAddr {
                listener_id,
                address,
            } => {
                info!("NewListenAddr: {listener_id:?} | {address:?}");
                self.listen_addrs.push(address);
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                debug!("ExpiredListenAddr: {address:?}");
                self.listen_addrs.retain(|a| *a != address);
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                reason,
                ..
            } => {
                warn!("ListenerClosed: {listener_id:?} | {reason:?}");
                self.listening = false;
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                info!("ConnectionEstablished: {peer_id} | {connection_id} | {endpoint:?}");
                if let Some(addr) = self.dialing.remove(&connection_id) {
                    self.peers_by_addr.insert(addr.clone(), peer_id);
                    for (request, reply) in self.parked.remove(&addr).unwrap_or_default() {
                        self.dispatch(peer_id, addr.clone(), request, reply);
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                warn!("OutgoingConnectionError: {peer_id:?} | {connection_id} | {error}");
                if let Some(addr) = self.dialing.remove(&connection_id) {
                    self.fail_parked(&addr);
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                debug!("ConnectionClosed: {peer_id} | remaining {num_established}");
            }
            SwarmEvent::Behaviour(AgentEvent::Identify(event)) => match event {
                IdentifyEvent::Received { peer_id, info, .. } => {
                    info!(
                        "IdentifyEvent:Received: {peer_id} | {:?} | {:?}",
                        info.agent_version, info.listen_addrs
                    );
                }
                IdentifyEvent::Error { peer_id, error, .. } => {
                    debug!("IdentifyEvent:Error: {peer_id} | {error}")
                }
                _ => {}
            },
            SwarmEvent::Behaviour(AgentEvent::RequestResponse(event)) => {
                self.handle_request_response(event)
            }
            _ => {}
        }
    }

    fn handle_request_response(&mut self, event: RequestResponseEvent<Request, Response>) {
        match event {
            RequestResponseEvent::Message { peer, message, .. } => match message {
                RequestResponseMessage::Request { request, channel, .. } => {
                    debug!(
                        "RequestResponseEvent::Request -> PeerID: {peer} | {}",
                        request.kind()
                    );
                    let inbound = InboundRequest {
                        peer,
                        request,
                        channel,
                    };
                    if self.inbound.send(inbound).is_err() {
                        warn!("no request handler running, dropping request from {peer}");
                    }
                }
                RequestResponseMessage::Response { request_id, response } => {
                    if let Some((_, reply)) = self.outstanding.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            RequestResponseEvent::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                warn!(
                    "RequestResponseEvent::OutboundFailure -> PeerID: {peer} | \
                     RequestID: {request_id} | Error: {error}"
                );
                if let Some((addr, reply)) = self.outstanding.remove(&request_id) {
                    let _ = reply.send(Err(RpcError::PeerUnreachable {
                        peer: addr.to_string(),
                    }));
                }
            }
            RequestResponseEvent::InboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                warn!(
                    "RequestResponseEvent::InboundFailure -> PeerID: {peer} | \
                     RequestID: {request_id} | Error: {error}"
                )
            }
            RequestResponseEvent::ResponseSent {
                peer, request_id, ..
            } => {
                debug!(
                    "RequestResponseEvent::ResponseSent -> PeerID: {peer} | RequestID: {request_id}"
                )
            }
        }
    }
}

/// Answers inbound requests, one task per request, so a handler waiting on
/// the chain lock never holds up the swarm.
pub async fn serve<H: RequestHandler>(
    handler: Arc<H>,
    client: RpcClient,
    mut inbound: mpsc::UnboundedReceiver<InboundRequest>,
) {
    while let Some(InboundRequest {
        peer,
        request,
        channel,
    }) = inbound.recv().await
    {
        let handler = handler.clone();
        let client = client.clone();
        tokio::spawn(async move {
            debug!("handling {} from {}", request.kind(), peer);
            let response = handler.handle(request).await;
            client.respond(channel, response);
        });
    }
    debug!("request dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::empty_chain;

    struct Scripted(Result<Response, RpcError>);

    impl PeerClient for Scripted {
        fn call(
            &self,
            _peer: &Multiaddr,
            _request: Request,
        ) -> impl Future<Output = Result<Response, RpcError>> + Send {
            let answer = self.0.clone();
            async move { answer }
        }
    }

    /// Serves block requests from a fixed chain and refuses everything else.
    struct ChainHandler(Vec<Block>);

    impl RequestHandler for ChainHandler {
        fn handle(&self, request: Request) -> impl Future<Output = Response> + Send {
            let response = match request {
                Request::RequestBlock(msg) => self
                    .0
                    .get(msg.sequence_number as usize)
                    .cloned()
                    .map(Response::Found)
                    .unwrap_or(Response::NotFound),
                _ => Response::Rejected("read only".into()),
            };
            async move { response }
        }
    }

    fn addr() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/9000".parse().unwrap()
    }

    fn network(
        listen: Option<Multiaddr>,
        alive: &Arc<AtomicBool>,
    ) -> (Network, RpcClient, mpsc::UnboundedReceiver<InboundRequest>) {
        let key = identity::Keypair::generate_ed25519();
        Network::new(key, listen, Duration::from_secs(5), alive.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_send_block_reads_acceptance() {
        let block = empty_chain(1).pop().unwrap();
        assert!(Scripted(Ok(Response::Accepted)).send_block(&addr(), &block).await);
        let full = Scripted(Ok(Response::Rejected("full".into())));
        assert!(!full.send_block(&addr(), &block).await);
        let down = Scripted(Err(RpcError::PeerUnreachable {
            peer: addr().to_string(),
        }));
        assert!(!down.send_block(&addr(), &block).await);
    }

    #[tokio::test]
    async fn test_request_block_treats_failures_as_missing() {
        let block = empty_chain(1).pop().unwrap();
        assert_eq!(
            Scripted(Ok(Response::Found(block.clone()))).request_block(&addr(), 1).await,
            Some(block)
        );
        assert_eq!(Scripted(Ok(Response::NotFound)).request_block(&addr(), 1).await, None);
        assert_eq!(Scripted(Ok(Response::Accepted)).request_block(&addr(), 1).await, None);
        let slow = Scripted(Err(RpcError::PeerTimeout {
            peer: addr().to_string(),
        }));
        assert_eq!(slow.request_block(&addr(), 1).await, None);
    }

    #[tokio::test]
    async fn test_client_reports_stopped_network() {
        let alive = Arc::new(AtomicBool::new(true));
        let (network, client, _inbound) = network(None, &alive);
        drop(network);
        assert_eq!(
            client.call(&addr(), Request::request_block(1)).await,
            Err(RpcError::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_listen_address_needs_a_listener() {
        let alive = Arc::new(AtomicBool::new(true));
        let (mut quiet, _client, _inbound) = network(None, &alive);
        assert_eq!(quiet.listen_address().await, None);

        let (mut bound, _client, _inbound) =
            network(Some("/ip4/127.0.0.1/tcp/0".parse().unwrap()), &alive);
        let listening = tokio::time::timeout(Duration::from_secs(5), bound.listen_address())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(listening, "/ip4/127.0.0.1/tcp/0".parse::<Multiaddr>().unwrap());
    }

    #[tokio::test]
    async fn test_blocks_served_between_two_networks() {
        let blocks = empty_chain(2);
        let alive = Arc::new(AtomicBool::new(true));

        let (mut serving, responder, inbound) =
            network(Some("/ip4/127.0.0.1/tcp/0".parse().unwrap()), &alive);
        let listening = tokio::time::timeout(Duration::from_secs(5), serving.listen_address())
            .await
            .unwrap()
            .unwrap();
        let serving = tokio::spawn(serving.run());
        let dispatcher = tokio::spawn(serve(
            Arc::new(ChainHandler(blocks.clone())),
            responder,
            inbound,
        ));

        let (calling, client, _inbound) = network(None, &alive);
        let calling = tokio::spawn(calling.run());

        assert_eq!(client.request_block(&listening, 1).await, Some(blocks[1].clone()));
        assert_eq!(client.request_block(&listening, 2).await, Some(blocks[2].clone()));
        assert_eq!(client.request_block(&listening, 5).await, None);
        assert!(!client.send_block(&listening, &blocks[2]).await);

        alive.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(5), serving).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(5), calling).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(5), dispatcher).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_port_reads_as_unreachable() {
        let port = {
            let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        let nobody: Multiaddr = format!("/ip4/127.0.0.1/tcp/{}", port).parse().unwrap();
        let alive = Arc::new(AtomicBool::new(true));
        let (calling, client, _inbound) = network(None, &alive);
        let calling = tokio::spawn(calling.run());

        assert_eq!(
            client.call(&nobody, Request::request_block(1)).await,
            Err(RpcError::PeerUnreachable {
                peer: nobody.to_string()
            })
        );
        assert_eq!(client.request_block(&nobody, 1).await, None);

        alive.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(5), calling).await.unwrap().unwrap();
    }
}
