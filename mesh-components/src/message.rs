//! The one event type every mesh participant understands.
//!
//! Nodes, routers and traffic generators all implement
//! `Component<Event = MeshEvent>`, so a single [`Address`] type can name any of them
//! and a return path can mix them freely.

use crate::request::{Request, Response};
use mesh_core::{Key, Scheduler};

/// Address of a mesh participant.
pub type Address = Key<MeshEvent>;

#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A request delivered by `from`.
    Request { request: Request, from: Address },
    /// A response delivered by `from`, the hop that popped itself off the path.
    Response { response: Response, from: Address },
    /// `from` opens a connection. Only sticky routers care.
    Connect { from: Address },
    /// Periodic self-scheduled timer.
    Tick,
    /// Self-message that performs one downstream send.
    SendDownstream { request: Request },
}

impl MeshEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MeshEvent::Request { .. } => "request",
            MeshEvent::Response { .. } => "response",
            MeshEvent::Connect { .. } => "connect",
            MeshEvent::Tick => "tick",
            MeshEvent::SendDownstream { .. } => "send_downstream",
        }
    }
}

/// Hands `request` to `to` at the current instant.
pub fn send_request(scheduler: &mut Scheduler, from: Address, to: Address, request: Request) {
    scheduler.schedule_now(to, MeshEvent::Request { request, from });
}

/// Hands `response` to `to` at the current instant.
pub fn send_response(scheduler: &mut Scheduler, from: Address, to: Address, response: Response) {
    scheduler.schedule_now(to, MeshEvent::Response { response, from });
}
