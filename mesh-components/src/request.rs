//! Request and response values
//!
//! A [`Request`] keeps the same [`RequestId`] and creation time for its whole life,
//! across every hop and every retry. What changes from hop to hop is the attempt
//! number and the [`ReturnPath`], the stack of addresses a [`Response`] has to unwind
//! to find its way back to the original sender.
//!
//! Both are plain values: forwarding a request or replying to one produces a new value
//! instead of mutating shared state, so two retries of one logical request can never
//! see each other's hops.

use crate::error::MeshError;
use crate::message::Address;
use mesh_core::SimTime;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier of a logical request. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Draw an id from a caller-owned RNG, so seeded runs produce the same ids.
    pub fn from_rng<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(Uuid::from_u128(rng.gen()))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Ordered stack of the addresses a request passed through.
///
/// Every hop that forwards a request pushes itself; every hop that passes a response
/// back pops itself and sends the response to the new top.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReturnPath(Vec<Address>);

impl ReturnPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// A copy of this path with `hop` on top.
    #[must_use]
    pub fn pushed(&self, hop: Address) -> Self {
        let mut hops = Vec::with_capacity(self.0.len() + 1);
        hops.extend_from_slice(&self.0);
        hops.push(hop);
        Self(hops)
    }

    /// Splits off the top of the path. `None` if the path is empty.
    #[must_use]
    pub fn popped(&self) -> Option<(Address, Self)> {
        let (&top, rest) = self.0.split_last()?;
        Some((top, Self(rest.to_vec())))
    }

    pub fn last(&self) -> Option<Address> {
        self.0.last().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn hops(&self) -> &[Address] {
        &self.0
    }
}

/// A request as seen by one hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    /// Set once when the logical request is created; end-to-end latency is measured
    /// from here.
    pub created_at: SimTime,
    /// Retry counter for the current hop, starting at 0.
    pub attempt: u32,
    pub return_path: ReturnPath,
}

impl Request {
    pub fn new(id: RequestId, created_at: SimTime) -> Self {
        Self {
            id,
            created_at,
            attempt: 0,
            return_path: ReturnPath::new(),
        }
    }

    /// This request with `hop` pushed onto its return path.
    #[must_use]
    pub fn via(&self, hop: Address) -> Self {
        Self {
            return_path: self.return_path.pushed(hop),
            ..self.clone()
        }
    }

    /// The copy sent to a downstream service for the given attempt.
    ///
    /// Identity and creation time are kept; the return path is copied so the
    /// downstream's hops never show up in this request.
    #[must_use]
    pub fn descend(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    /// End-to-end age of the logical request.
    pub fn age(&self, now: SimTime) -> Duration {
        now.duration_since(self.created_at)
    }
}

/// Terminal outcome of a request at one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// The computation completed.
    Ok,
    /// Rejected by the limiter before any work started.
    Discarded,
    /// The computation completed but the node's failure policy made it fail.
    Error,
    /// The downstream call used up its retry budget.
    DownstreamError,
}

impl ResponseStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ResponseStatus::Ok)
    }

    /// Label used for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Ok => "ok",
            ResponseStatus::Discarded => "discarded",
            ResponseStatus::Error => "error",
            ResponseStatus::DownstreamError => "downstream_error",
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The request this answers, with the return path as of the reply.
    pub request: Request,
    pub status: ResponseStatus,
}

impl Response {
    pub fn new(request: Request, status: ResponseStatus) -> Self {
        Self { request, status }
    }

    pub fn latency(&self, now: SimTime) -> Duration {
        self.request.age(now)
    }

    /// Checks that `hop` is on top of the return path without changing it.
    pub fn check_top(&self, hop: Address) -> Result<(), MeshError> {
        match self.request.return_path.last() {
            Some(top) if top == hop => Ok(()),
            Some(top) => Err(MeshError::ReturnPathMismatch {
                expected: hop.to_string(),
                found: top.to_string(),
            }),
            None => Err(MeshError::ReturnPathExhausted { at: hop.to_string() }),
        }
    }

    /// Pops `hop` off the return path and returns the address to pass the response
    /// to next.
    pub fn unwind(self, hop: Address) -> Result<(Address, Response), MeshError> {
        let response = self.pop(hop)?;
        let next = response
            .request
            .return_path
            .last()
            .ok_or_else(|| MeshError::ReturnPathExhausted { at: hop.to_string() })?;
        Ok((next, response))
    }

    /// Pops `hop`, which must be the origin of the request: nothing may remain below it.
    pub fn arrive(self, hop: Address) -> Result<Response, MeshError> {
        let response = self.pop(hop)?;
        if !response.request.return_path.is_empty() {
            return Err(MeshError::ReturnPathNotUnwound {
                at: hop.to_string(),
                remaining: response.request.return_path.len(),
            });
        }
        Ok(response)
    }

    fn pop(self, hop: Address) -> Result<Response, MeshError> {
        self.check_top(hop)?;
        let Response { request, status } = self;
        let (_, rest) = request
            .return_path
            .popped()
            .ok_or_else(|| MeshError::ReturnPathExhausted { at: hop.to_string() })?;
        Ok(Response {
            request: Request {
                return_path: rest,
                ..request
            },
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u128) -> Address {
        Address::new_with_id(Uuid::from_u128(n))
    }

    fn request() -> Request {
        Request::new(RequestId(Uuid::from_u128(9)), SimTime::from_millis(5))
    }

    #[test]
    fn test_via_does_not_touch_the_original() {
        let base = request().via(addr(1));
        let forwarded = base.via(addr(2));
        assert_eq!(base.return_path.hops(), &[addr(1)]);
        assert_eq!(forwarded.return_path.hops(), &[addr(1), addr(2)]);
    }

    #[test]
    fn test_descend_keeps_identity_and_path() {
        let base = request().via(addr(1)).via(addr(2));
        let child = base.descend(2);
        assert_eq!(child.id, base.id);
        assert_eq!(child.created_at, base.created_at);
        assert_eq!(child.attempt, 2);
        assert_eq!(child.return_path, base.return_path);

        let grandchild = child.via(addr(3));
        assert_eq!(base.return_path.len(), 2);
        assert_eq!(grandchild.return_path.len(), 3);
    }

    #[test]
    fn test_unwind_walks_back_hop_by_hop() {
        let deep = request().via(addr(1)).via(addr(2)).via(addr(3));
        let response = Response::new(deep, ResponseStatus::Ok);

        let (next, response) = response.unwind(addr(3)).unwrap();
        assert_eq!(next, addr(2));
        let (next, response) = response.unwind(addr(2)).unwrap();
        assert_eq!(next, addr(1));
        let response = response.arrive(addr(1)).unwrap();
        assert!(response.request.return_path.is_empty());
    }

    #[test]
    fn test_unwind_rejects_foreign_top() {
        let response = Response::new(request().via(addr(1)).via(addr(2)), ResponseStatus::Ok);
        assert!(matches!(
            response.unwind(addr(1)),
            Err(MeshError::ReturnPathMismatch { .. })
        ));
    }

    #[test]
    fn test_unwind_needs_somewhere_to_go() {
        let response = Response::new(request().via(addr(1)), ResponseStatus::Error);
        assert!(matches!(
            response.unwind(addr(1)),
            Err(MeshError::ReturnPathExhausted { .. })
        ));
    }

    #[test]
    fn test_arrive_requires_empty_path() {
        let response = Response::new(request().via(addr(1)).via(addr(2)), ResponseStatus::Ok);
        assert!(matches!(
            response.arrive(addr(2)),
            Err(MeshError::ReturnPathNotUnwound { remaining: 1, .. })
        ));
    }

    #[test]
    fn test_latency_uses_creation_time() {
        let response = Response::new(request().descend(3), ResponseStatus::Ok);
        assert_eq!(response.latency(SimTime::from_millis(45)), Duration::from_millis(40));
    }
}
