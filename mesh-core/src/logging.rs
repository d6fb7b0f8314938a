//! Structured logging for mesh simulations
//!
//! Everything in the workspace logs through `tracing`. These helpers install a
//! `tracing-subscriber` formatter once per process; `RUST_LOG` always wins over the
//! level passed in code.
//!
//! ```bash
//! # Per-interval traffic reports only
//! RUST_LOG=info cargo run -p mesh-components --example two_tier_mesh
//!
//! # Limiter moves, retries and routing decisions
//! RUST_LOG=mesh_components=debug cargo run -p mesh-components --example two_tier_mesh
//! ```
//!
//! Level guidelines used by the mesh crates:
//! - **TRACE**: every delivered event and per-request state change
//! - **DEBUG**: limiter adjustments, retries, stale responses
//! - **INFO**: simulation start/stop and periodic traffic reports
//! - **WARN**: dropped events and suspicious configurations
//! - **ERROR**: invariant violations, logged right before the handler aborts

use tracing::{info, Span};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging at `info`.
pub fn init_simulation_logging() {
    init_simulation_logging_with_level("info")
}

/// Initialize logging with a specific level for the mesh crates.
///
/// Calling this more than once (for instance from several tests) is harmless: only
/// the first call installs a subscriber.
pub fn init_simulation_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("warn,mesh_core={level},mesh_components={level}").into()
    });

    let installed = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .try_init()
        .is_ok();

    if installed {
        info!("Simulation logging initialized at level: {}", level);
    }
}

/// Initialize verbose, pretty-printed logging for debugging a single scenario.
pub fn init_detailed_simulation_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "debug,mesh_core=trace,mesh_components=trace".into());

    let installed = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_file(true)
                .with_line_number(true)
                .pretty(),
        )
        .with(filter)
        .try_init()
        .is_ok();

    if installed {
        info!("Detailed simulation logging initialized");
    }
}

/// Span covering a whole simulation run.
pub fn simulation_span(name: &str) -> Span {
    tracing::info_span!("simulation", name = name)
}

/// Span covering one component's handling of one event.
pub fn component_span(kind: &'static str, name: &str) -> Span {
    tracing::trace_span!("component", kind = kind, name = name)
}
