//! Wiring nodes, routers and generators into a simulation
//!
//! [`MeshBuilder`] registers mesh components and arms their first tick. [`Scenario`]
//! describes a whole two-tier mesh (front services calling leaf services, each tier
//! behind its own router, driven by one generator) and can be loaded from JSON.
//!
//! ```rust
//! use mesh_components::topology::Scenario;
//! use mesh_core::{Executor, SimTime, Simulation, SimulationConfig};
//!
//! let scenario = Scenario::small();
//! let mut sim = Simulation::new(SimulationConfig { seed: scenario.seed });
//! let mesh = scenario.build(&mut sim).unwrap();
//! sim.execute(Executor::timed(SimTime::from_millis(500)));
//!
//! let totals = mesh.generator(&sim).unwrap().totals().clone();
//! assert!(totals.sent > 0);
//! ```

use crate::error::ConfigResult;
use crate::failure::FailureConfig;
use crate::limiter::LimiterConfig;
use crate::message::{Address, MeshEvent};
use crate::node::{Node, NodeConfig};
use crate::router::{Balancing, Router};
use crate::traffic::{TrafficConfig, TrafficGenerator};
use mesh_core::{Component, SimTime, Simulation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Registers mesh components with a simulation.
pub struct MeshBuilder<'a> {
    sim: &'a mut Simulation,
}

impl<'a> MeshBuilder<'a> {
    pub fn new(sim: &'a mut Simulation) -> Self {
        Self { sim }
    }

    /// Adds a component whose clock is driven by `Tick` events and fires the first
    /// one at the current instant.
    pub fn ticking<C: Component<Event = MeshEvent> + 'static>(&mut self, component: C) -> Address {
        let address = self.sim.add_component(component);
        self.sim.schedule(SimTime::zero(), address, MeshEvent::Tick);
        address
    }

    pub fn node(&mut self, node: Node) -> Address {
        self.ticking(node)
    }

    /// Routers have no timer.
    pub fn router(&mut self, router: Router) -> Address {
        self.sim.add_component(router)
    }

    pub fn generator(&mut self, generator: TrafficGenerator) -> Address {
        self.ticking(generator)
    }

    /// A pool of identical nodes named `{prefix}_{index}`.
    pub fn tier(&mut self, spec: &TierSpec, downstream: Option<Address>) -> ConfigResult<Vec<Address>> {
        (0..spec.size)
            .map(|index| -> ConfigResult<Address> {
                let config = NodeConfig {
                    name: format!("{}_{index}", spec.prefix),
                    ..spec.node.clone()
                };
                let node = Node::new(config, spec.limiter.build()?, spec.failure.build()?, downstream)?;
                Ok(self.node(node))
            })
            .collect()
    }
}

/// One tier of identical services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSpec {
    pub prefix: String,
    pub size: usize,
    /// Template for every node of the tier; the name is replaced.
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub failure: FailureConfig,
    #[serde(default)]
    pub balancing: Balancing,
}

/// Two tiers, each behind a router, and a generator in front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub seed: u64,
    pub leaves: TierSpec,
    /// Failure policy of one extra leaf added to the leaf pool.
    #[serde(default)]
    pub faulty_leaf: Option<FailureConfig>,
    pub fronts: TierSpec,
    #[serde(default)]
    pub traffic: TrafficConfig,
}

/// Addresses of everything a [`Scenario`] created.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub leaves: Vec<Address>,
    pub leaf_router: Address,
    pub fronts: Vec<Address>,
    pub front_router: Address,
    pub driver: Address,
}

impl Mesh {
    pub fn generator<'s>(&self, sim: &'s Simulation) -> Option<&'s TrafficGenerator> {
        sim.get_component(self.driver)
    }

    pub fn node<'s>(&self, sim: &'s Simulation, address: Address) -> Option<&'s Node> {
        sim.get_component(address)
    }
}

impl Scenario {
    /// Services doing 100 ms of work each, limited by errors with a top limit of
    /// 200, one leaf failing every two seconds.
    pub fn two_tier(tier_size: usize, per_tick: usize) -> Self {
        let service = NodeConfig::default()
            .with_available_concurrency(100)
            .with_compute_time(Duration::from_millis(100));
        let tier = |prefix: &str| TierSpec {
            prefix: prefix.to_string(),
            size: tier_size,
            node: service.clone(),
            limiter: LimiterConfig::by_errors(200),
            failure: FailureConfig::Never,
            balancing: Balancing::LeastBusy,
        };
        Self {
            seed: 42,
            leaves: tier("bottom"),
            faulty_leaf: Some(FailureConfig::Periodic {
                period: Duration::from_secs(2),
            }),
            fronts: tier("top"),
            traffic: TrafficConfig::new("driver").with_rate(per_tick, Duration::from_millis(1)),
        }
    }

    /// A scaled-down [`two_tier`](Scenario::two_tier) for quick runs.
    pub fn small() -> Self {
        Self::two_tier(3, 2)
    }

    pub fn build(&self, sim: &mut Simulation) -> ConfigResult<Mesh> {
        let mut builder = MeshBuilder::new(sim);

        let mut leaves = builder.tier(&self.leaves, None)?;
        if let Some(failure) = &self.faulty_leaf {
            let config = NodeConfig {
                name: format!("{}_bad", self.leaves.prefix),
                ..self.leaves.node.clone()
            };
            let node = Node::new(config, self.leaves.limiter.build()?, failure.build()?, None)?;
            leaves.push(builder.node(node));
        }
        let leaf_router = builder.router(Router::new(
            format!("{}_envoy", self.leaves.prefix),
            leaves.clone(),
            self.leaves.balancing,
        )?);

        let fronts = builder.tier(&self.fronts, Some(leaf_router))?;
        let front_router = builder.router(Router::new(
            format!("{}_envoy", self.fronts.prefix),
            fronts.clone(),
            self.fronts.balancing,
        )?);

        let driver = builder.generator(TrafficGenerator::new(self.traffic.clone(), vec![front_router])?);

        info!(
            leaves = leaves.len(),
            fronts = fronts.len(),
            per_tick = self.traffic.per_tick,
            "Two-tier mesh built"
        );
        Ok(Mesh {
            leaves,
            leaf_router,
            fronts,
            front_router,
            driver,
        })
    }
}
