//! Batch experimentation: metrics, termination conditions and the replicate
//! runner.
//!
//! A batch runs many seeded replicates of one scene. Each replicate samples
//! its [`Metric`]s every metric interval, stops at the first
//! [`TerminationCondition`] that fires, and yields a [`SimulationResult`].

pub mod conditions;
pub mod graph;
pub mod metrics;
pub mod mser;
pub mod results;
pub mod runner;

pub use conditions::{
    AllSaturatedCondition, BondCountCondition, Comparison, CompositeCondition, CustomCondition, Logic,
    MetricThresholdCondition, MovingAverageSteadyStateCondition, RingFormationCondition,
    SteadyStateCondition, TerminationCondition, TimeoutCondition,
};
pub use graph::{connected_components, find_ring};
pub use metrics::{
    kinetic_energy, AvailableSiteCountMetric, BondCountMetric, ClusterSizeMetric, CustomMetric,
    DistanceMetric, EntityCountMetric, KineticEnergyMetric, Metric, MetricValue, RingFormationMetric,
    SimContext,
};
pub use mser::{mser_truncation, MserConfig, MserSteadyStateCondition};
pub use results::{write_csv, write_json, BatchSummary, SimulationResult};
pub use runner::{
    BatchConfig, BatchSimulationRunner, CancelHandle, ProgressCallback, SceneFactory, CANCELLED, FAILED,
    MAX_TIME_REACHED,
};
