//! Bondsim - Dynamic Bonding Core
//!
//! Rigid bodies carry bonding sites. Each tick a [`DynamicBondManager`] finds
//! nearby compatible site pairs, scores them through a prioritised rule chain
//! and turns the best into joints in the physics scene. The [`batch`] layer
//! runs seeded replicates of a scene, samples metrics, stops on termination
//! conditions and aggregates the results.
//!
//! Physics is an external capability behind [`physics::PhysicsScene`];
//! [`physics::ReferenceEngine`] is a small deterministic implementation.

pub mod batch;
pub mod bonding;
pub mod error;
pub mod physics;
pub mod profiler;
pub mod scenes;
pub mod spatial;

pub use batch::{BatchConfig, BatchSimulationRunner, BatchSummary, SimulationResult};
pub use bonding::{
    Bond, BondConfig, BondEvent, BondableEntity, BondableEntityDef, BondingSiteDef, DynamicBondManager,
    DynamicBondManagerConfig,
};
pub use error::{SimError, SimResult};
pub use physics::{PhysicsEngine, PhysicsScene, ReferenceEngine, ReferenceScene, ReferenceSceneConfig};
pub use profiler::{TickPhase, TickProfiler};
pub use spatial::SiteSpatialHash;
