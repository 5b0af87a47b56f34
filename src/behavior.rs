use libp2p::PeerId;
use libp2p::swarm::NetworkBehaviour;

use libp2p::identify::{
    Behaviour as IdentifyBehavior,
    Event as IdentifyEvent,
};

use libp2p::request_response::{Event as RequestResponseEvent, OutboundRequestId, ResponseChannel};
use libp2p::request_response::cbor::Behaviour as RequestResponseBehavior;

use crate::message::{Request, Response};

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "Event")]
pub(crate) struct Behavior {
    identify: IdentifyBehavior,
    rr: RequestResponseBehavior<Request, Response>,
}

impl Behavior {
    pub fn new(identify: IdentifyBehavior, rr: RequestResponseBehavior<Request, Response>) -> Self {
        Self { identify, rr }
    }

    pub fn send_request(&mut self, peer_id: &PeerId, request: Request) -> OutboundRequestId {
        self.rr.send_request(peer_id, request)
    }

    pub fn send_response(
        &mut self,
        channel: ResponseChannel<Response>,
        response: Response,
    ) -> Result<(), Response> {
        self.rr.send_response(channel, response)
    }
}

#[derive(Debug)]
pub(crate) enum Event {
    Identify(IdentifyEvent),
    RequestResponse(RequestResponseEvent<Request, Response>),
}

impl From<IdentifyEvent> for Event {
    fn from(value: IdentifyEvent) -> Self {
        Self::Identify(value)
    }
}

impl From<RequestResponseEvent<Request, Response>> for Event {
    fn from(value: RequestResponseEvent<Request, Response>) -> Self {
        Self::RequestResponse(value)
    }
}
