//! Service-mesh components for the `mesh-core` simulation kernel
//!
//! The building blocks of a simulated mesh of services:
//!
//! - [`Node`]: a service with a CPU-contention model, an admission [`Limiter`] and
//!   downstream retries with exponential backoff.
//! - [`Router`]: a load balancer in front of a pool of nodes.
//! - [`TrafficGenerator`]: the client side, producing load and per-second reports.
//! - [`Scenario`] and [`MeshBuilder`]: wiring the above into a [`mesh_core::Simulation`].
//!
//! All of them exchange [`MeshEvent`]s and are addressed by an [`Address`]. Requests
//! carry the path they came along, and responses retrace it hop by hop.

pub mod config;
pub mod error;
pub mod failure;
pub mod limiter;
pub mod message;
pub mod node;
pub mod request;
pub mod router;
pub mod topology;
pub mod traffic;

pub use error::{ConfigError, ConfigResult, MeshError};
pub use failure::{AlwaysFail, FailureConfig, FailurePolicy, NeverFail, Periodic, RandomPercentage};
pub use limiter::{
    AdmissionLimit, Adjustment, AimdControl, ErrorRateLimit, LatencyLimit, Limiter, LimiterConfig,
    Reaction, StaticLimit, Unlimited,
};
pub use message::{send_request, send_response, Address, MeshEvent};
pub use node::{Node, NodeConfig, NodeStats};
pub use request::{Request, RequestId, Response, ResponseStatus, ReturnPath};
pub use router::{Balancing, Router, RouterStats};
pub use topology::{Mesh, MeshBuilder, Scenario, TierSpec};
pub use traffic::{IntervalReport, TrafficConfig, TrafficGenerator, TrafficTotals};
