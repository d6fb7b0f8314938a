//! Two tiers of services behind load balancers, one leaf failing every two seconds.
//!
//! ```bash
//! RUST_LOG=info cargo run -p mesh-components --example two_tier_mesh
//! RUST_LOG=info cargo run -p mesh-components --example two_tier_mesh -- scenario.json
//! ```
//!
//! Without an argument the built-in scenario runs: 20 leaves plus a faulty one,
//! 20 front services, 10 requests per millisecond, 30 simulated seconds.

use mesh_components::Scenario;
use mesh_core::{init_simulation_logging, simulation_span, Executor, SimTime, Simulation, SimulationConfig};
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    init_simulation_logging();

    let scenario = match std::env::args().nth(1) {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Scenario::two_tier(20, 10),
    };

    let span = simulation_span("two_tier_mesh");
    let _enter = span.enter();

    let mut sim = Simulation::new(SimulationConfig {
        seed: scenario.seed,
    });
    let mesh = scenario.build(&mut sim)?;
    sim.execute(Executor::timed(SimTime::from_secs(30)));

    if let Some(generator) = mesh.generator(&sim) {
        println!("\n=== Totals ===");
        println!("{:#?}", generator.totals());
    }
    for &leaf in &mesh.leaves {
        if let Some(node) = mesh.node(&sim, leaf) {
            println!(
                "{:>10}: limit {:?}, {:?}",
                node.name(),
                node.limiter().limit(),
                node.stats()
            );
        }
    }
    Ok(())
}
