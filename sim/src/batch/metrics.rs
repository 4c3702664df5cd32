//! Metrics sampled during a replicate.

use super::graph::{connected_components, find_ring};
use crate::bonding::{DynamicBondManager, EntityId};
use crate::physics::PhysicsScene;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Read-only view of a replicate handed to metrics and conditions.
#[derive(Clone, Copy)]
pub struct SimContext<'a> {
    pub scene: &'a dyn PhysicsScene,
    pub manager: &'a DynamicBondManager,
}

/// Total kinetic energy of dynamic actors.
///
/// The rotational term treats inertia as equal to mass.
pub fn kinetic_energy(scene: &dyn PhysicsScene, include_angular: bool) -> f32 {
    scene
        .dynamic_actors()
        .into_iter()
        .map(|actor| {
            let mass = scene.mass(actor).unwrap_or(0.0);
            let linear = scene.linear_velocity(actor).unwrap_or_default().length_squared();
            let angular = if include_angular {
                scene.angular_velocity(actor).unwrap_or_default().length_squared()
            } else {
                0.0
            };
            0.5 * mass * (linear + angular)
        })
        .sum()
}

// ============================================================================
// VALUES
// ============================================================================

/// Value reported by a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    Double(f64),
    Text(String),
    FloatVec(Vec<f32>),
    IntVec(Vec<i32>),
}

impl Default for MetricValue {
    fn default() -> Self {
        MetricValue::Int(0)
    }
}

impl MetricValue {
    /// Numeric view of scalar values. Booleans, text and vectors have none.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            MetricValue::Int(v) => Some(v as f64),
            MetricValue::Float(v) => Some(v as f64),
            MetricValue::Double(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            write!(f, "[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", item)?;
            }
            write!(f, "]")
        }

        match self {
            MetricValue::Bool(v) => write!(f, "{}", v),
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
            MetricValue::Double(v) => write!(f, "{}", v),
            MetricValue::Text(v) => write!(f, "{}", v),
            MetricValue::FloatVec(v) => list(f, v),
            MetricValue::IntVec(v) => list(f, v),
        }
    }
}

// ============================================================================
// METRIC TRAIT
// ============================================================================

/// A quantity tracked over a replicate.
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> String {
        String::new()
    }

    fn update(&mut self, ctx: &SimContext<'_>, time: f32, dt: f32);

    fn value(&self) -> MetricValue;

    /// `(time, value)` samples, empty unless the metric records them.
    fn time_series(&self) -> Vec<(f32, MetricValue)> {
        Vec::new()
    }

    fn reset(&mut self);

    fn box_clone(&self) -> Box<dyn Metric>;
}

impl Clone for Box<dyn Metric> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Optional `(time, value)` recording shared by the scalar metrics.
#[derive(Debug, Clone, Default)]
struct Series<T> {
    enabled: bool,
    samples: Vec<(f32, T)>,
}

impl<T: Copy> Series<T> {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            samples: Vec::new(),
        }
    }

    fn push(&mut self, time: f32, value: T) {
        if self.enabled {
            self.samples.push((time, value));
        }
    }

    fn to_values(&self, wrap: fn(T) -> MetricValue) -> Vec<(f32, MetricValue)> {
        self.samples.iter().map(|&(t, v)| (t, wrap(v))).collect()
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

// ============================================================================
// BOND-GRAPH METRICS
// ============================================================================

/// Number of live bonds.
#[derive(Debug, Clone, Default)]
pub struct BondCountMetric {
    current: i32,
    series: Series<i32>,
}

impl BondCountMetric {
    pub fn new(track_time_series: bool) -> Self {
        Self {
            current: 0,
            series: Series::new(track_time_series),
        }
    }
}

impl Metric for BondCountMetric {
    fn name(&self) -> &str {
        "bond_count"
    }

    fn description(&self) -> String {
        "Number of active bonds".into()
    }

    fn update(&mut self, ctx: &SimContext<'_>, time: f32, _dt: f32) {
        self.current = ctx.manager.bond_count() as i32;
        self.series.push(time, self.current);
    }

    fn value(&self) -> MetricValue {
        MetricValue::Int(self.current)
    }

    fn time_series(&self) -> Vec<(f32, MetricValue)> {
        self.series.to_values(MetricValue::Int)
    }

    fn reset(&mut self) {
        self.current = 0;
        self.series.clear();
    }

    fn box_clone(&self) -> Box<dyn Metric> {
        Box::new(Self::new(self.series.enabled))
    }
}

/// Latches the first ring of the target size (any size when 0).
#[derive(Debug, Clone, Default)]
pub struct RingFormationMetric {
    target_ring_size: usize,
    ring_size: usize,
    formation_time: Option<f32>,
}

impl RingFormationMetric {
    pub fn new(target_ring_size: usize) -> Self {
        Self {
            target_ring_size,
            ..Default::default()
        }
    }

    pub fn has_ring_formed(&self) -> bool {
        self.formation_time.is_some()
    }

    pub fn ring_formation_time(&self) -> Option<f32> {
        self.formation_time
    }

    /// Size of the detected ring, 0 if none.
    pub fn ring_size(&self) -> usize {
        self.ring_size
    }
}

impl Metric for RingFormationMetric {
    fn name(&self) -> &str {
        "ring_formation"
    }

    fn description(&self) -> String {
        if self.target_ring_size > 0 {
            format!("Detects ring formation of size {}", self.target_ring_size)
        } else {
            "Detects any ring formation".into()
        }
    }

    fn update(&mut self, ctx: &SimContext<'_>, time: f32, _dt: f32) {
        if self.has_ring_formed() {
            return;
        }
        if let Some(size) = find_ring(ctx.manager.bonds(), self.target_ring_size) {
            self.ring_size = size;
            self.formation_time = Some(time);
        }
    }

    fn value(&self) -> MetricValue {
        MetricValue::Int(self.ring_size as i32)
    }

    fn reset(&mut self) {
        self.ring_size = 0;
        self.formation_time = None;
    }

    fn box_clone(&self) -> Box<dyn Metric> {
        Box::new(Self::new(self.target_ring_size))
    }
}

/// Connected-component sizes of the bond graph, largest first.
#[derive(Debug, Clone, Default)]
pub struct ClusterSizeMetric {
    sizes: Vec<usize>,
}

impl ClusterSizeMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn largest_cluster_size(&self) -> usize {
        self.sizes.first().copied().unwrap_or(0)
    }

    pub fn cluster_count(&self) -> usize {
        self.sizes.len()
    }
}

impl Metric for ClusterSizeMetric {
    fn name(&self) -> &str {
        "cluster_sizes"
    }

    fn description(&self) -> String {
        "Sizes of bonded clusters".into()
    }

    fn update(&mut self, ctx: &SimContext<'_>, _time: f32, _dt: f32) {
        self.sizes = connected_components(ctx.manager.entity_ids(), ctx.manager.bonds());
    }

    fn value(&self) -> MetricValue {
        MetricValue::IntVec(self.sizes.iter().map(|&s| s as i32).collect())
    }

    fn reset(&mut self) {
        self.sizes.clear();
    }

    fn box_clone(&self) -> Box<dyn Metric> {
        Box::new(Self::new())
    }
}

/// Registered entity count.
#[derive(Debug, Clone, Default)]
pub struct EntityCountMetric {
    current: i32,
}

impl Metric for EntityCountMetric {
    fn name(&self) -> &str {
        "entity_count"
    }

    fn update(&mut self, ctx: &SimContext<'_>, _time: f32, _dt: f32) {
        self.current = ctx.manager.entity_count() as i32;
    }

    fn value(&self) -> MetricValue {
        MetricValue::Int(self.current)
    }

    fn reset(&mut self) {
        self.current = 0;
    }

    fn box_clone(&self) -> Box<dyn Metric> {
        Box::new(Self::default())
    }
}

/// Sites with spare valency across all entities.
#[derive(Debug, Clone, Default)]
pub struct AvailableSiteCountMetric {
    current: i32,
}

impl Metric for AvailableSiteCountMetric {
    fn name(&self) -> &str {
        "available_sites"
    }

    fn update(&mut self, ctx: &SimContext<'_>, _time: f32, _dt: f32) {
        self.current = ctx.manager.stats().available_site_count as i32;
    }

    fn value(&self) -> MetricValue {
        MetricValue::Int(self.current)
    }

    fn reset(&mut self) {
        self.current = 0;
    }

    fn box_clone(&self) -> Box<dyn Metric> {
        Box::new(Self::default())
    }
}

// ============================================================================
// PHYSICAL METRICS
// ============================================================================

/// Kinetic energy of all dynamic actors, linear plus rotational.
#[derive(Debug, Clone, Default)]
pub struct KineticEnergyMetric {
    current: f32,
    series: Series<f32>,
}

impl KineticEnergyMetric {
    pub fn new(track_time_series: bool) -> Self {
        Self {
            current: 0.0,
            series: Series::new(track_time_series),
        }
    }
}

impl Metric for KineticEnergyMetric {
    fn name(&self) -> &str {
        "kinetic_energy"
    }

    fn description(&self) -> String {
        "Total kinetic energy of dynamic actors".into()
    }

    fn update(&mut self, ctx: &SimContext<'_>, time: f32, _dt: f32) {
        self.current = kinetic_energy(ctx.scene, true);
        self.series.push(time, self.current);
    }

    fn value(&self) -> MetricValue {
        MetricValue::Float(self.current)
    }

    fn time_series(&self) -> Vec<(f32, MetricValue)> {
        self.series.to_values(MetricValue::Float)
    }

    fn reset(&mut self) {
        self.current = 0.0;
        self.series.clear();
    }

    fn box_clone(&self) -> Box<dyn Metric> {
        Box::new(Self::new(self.series.enabled))
    }
}

/// Distance between two entities' origins; -1 while either is missing.
#[derive(Debug, Clone)]
pub struct DistanceMetric {
    entity1: EntityId,
    entity2: EntityId,
    current: f32,
    series: Series<f32>,
}

impl DistanceMetric {
    pub fn new(entity1: EntityId, entity2: EntityId, track_time_series: bool) -> Self {
        Self {
            entity1,
            entity2,
            current: 0.0,
            series: Series::new(track_time_series),
        }
    }
}

impl Metric for DistanceMetric {
    fn name(&self) -> &str {
        "distance"
    }

    fn description(&self) -> String {
        format!("Distance between entities {} and {}", self.entity1, self.entity2)
    }

    fn update(&mut self, ctx: &SimContext<'_>, time: f32, _dt: f32) {
        let pose = |id| ctx.manager.entity(id).and_then(|e| e.world_pose(ctx.scene));
        match (pose(self.entity1), pose(self.entity2)) {
            (Some(p1), Some(p2)) => {
                self.current = p1.position.distance(p2.position);
                self.series.push(time, self.current);
            }
            _ => self.current = -1.0,
        }
    }

    fn value(&self) -> MetricValue {
        MetricValue::Float(self.current)
    }

    fn time_series(&self) -> Vec<(f32, MetricValue)> {
        self.series.to_values(MetricValue::Float)
    }

    fn reset(&mut self) {
        self.current = 0.0;
        self.series.clear();
    }

    fn box_clone(&self) -> Box<dyn Metric> {
        Box::new(Self::new(self.entity1, self.entity2, self.series.enabled))
    }
}

// ============================================================================
// CUSTOM
// ============================================================================

pub type MetricFn = Arc<dyn Fn(&SimContext<'_>, f32, f32) -> MetricValue + Send + Sync>;

/// Metric computed by a caller-supplied closure `(ctx, time, dt)`.
#[derive(Clone)]
pub struct CustomMetric {
    name: String,
    description: String,
    func: MetricFn,
    current: MetricValue,
}

impl CustomMetric {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        func: impl Fn(&SimContext<'_>, f32, f32) -> MetricValue + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            func: Arc::new(func),
            current: MetricValue::default(),
        }
    }
}

impl Metric for CustomMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn update(&mut self, ctx: &SimContext<'_>, time: f32, dt: f32) {
        self.current = (self.func)(ctx, time, dt);
    }

    fn value(&self) -> MetricValue {
        self.current.clone()
    }

    fn reset(&mut self) {
        self.current = MetricValue::default();
    }

    fn box_clone(&self) -> Box<dyn Metric> {
        let mut copy = self.clone();
        copy.reset();
        Box::new(copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bonding::BondableEntityDef;
    use crate::physics::{ActorDesc, ReferenceScene};
    use approx::assert_relative_eq;
    use glam::Vec3;

    fn bonded_pair() -> (ReferenceScene, DynamicBondManager, Vec<EntityId>) {
        let mut scene = ReferenceScene::default();
        let mut manager = DynamicBondManager::default();
        let ids: Vec<EntityId> = [0.0, 2.0, 20.0]
            .iter()
            .map(|&x| {
                let def = BondableEntityDef::dimer(0.5, 0.0).at_position(Vec3::new(x, 0.0, 0.0));
                manager.register_entity(&mut scene, def).unwrap()
            })
            .collect();
        manager
            .create_bond(&mut scene, ids[0], 0, ids[1], 1, None, None)
            .unwrap();
        (scene, manager, ids)
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(MetricValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(MetricValue::Bool(true).as_f64(), None);
        assert_eq!(MetricValue::IntVec(vec![3, 1]).to_string(), "[3,1]");
        assert_eq!(serde_json::to_string(&MetricValue::Float(0.5)).unwrap(), "0.5");
    }

    #[test]
    fn test_graph_metrics() {
        let (scene, manager, _) = bonded_pair();
        let ctx = SimContext {
            scene: &scene,
            manager: &manager,
        };

        let mut bonds = BondCountMetric::new(true);
        bonds.update(&ctx, 0.5, 0.5);
        bonds.update(&ctx, 1.0, 0.5);
        assert_eq!(bonds.value(), MetricValue::Int(1));
        assert_eq!(bonds.time_series().len(), 2);

        let mut clusters = ClusterSizeMetric::new();
        clusters.update(&ctx, 0.0, 0.0);
        assert_eq!(clusters.value(), MetricValue::IntVec(vec![2, 1]));
        assert_eq!(clusters.largest_cluster_size(), 2);
        assert_eq!(clusters.cluster_count(), 2);

        let mut sites = AvailableSiteCountMetric::default();
        sites.update(&ctx, 0.0, 0.0);
        assert_eq!(sites.value(), MetricValue::Int(4));

        let mut ring = RingFormationMetric::new(0);
        ring.update(&ctx, 0.0, 0.0);
        assert!(!ring.has_ring_formed());
        assert_eq!(ring.value(), MetricValue::Int(0));

        let copy = bonds.box_clone();
        assert!(copy.time_series().is_empty());
    }

    #[test]
    fn test_kinetic_energy() {
        let mut scene = ReferenceScene::default();
        let mut desc = ActorDesc::sphere(0.5, Vec3::ZERO);
        desc.linear_velocity = Vec3::new(2.0, 0.0, 0.0);
        desc.angular_velocity = Vec3::new(0.0, 1.0, 0.0);
        let actor = scene.create_actor(&desc).unwrap();
        let mass = scene.mass(actor).unwrap();

        assert_relative_eq!(kinetic_energy(&scene, false), 2.0 * mass, epsilon = 1e-5);
        assert_relative_eq!(kinetic_energy(&scene, true), 2.5 * mass, epsilon = 1e-5);
    }

    #[test]
    fn test_distance_metric() {
        let (scene, manager, ids) = bonded_pair();
        let ctx = SimContext {
            scene: &scene,
            manager: &manager,
        };
        let mut distance = DistanceMetric::new(ids[0], ids[2], true);
        distance.update(&ctx, 0.1, 0.1);
        assert_eq!(distance.value(), MetricValue::Float(20.0));

        let mut missing = DistanceMetric::new(ids[0], 99, true);
        missing.update(&ctx, 0.1, 0.1);
        assert_eq!(missing.value(), MetricValue::Float(-1.0));
        assert!(missing.time_series().is_empty());
    }

    #[test]
    fn test_custom_metric() {
        let (scene, manager, _) = bonded_pair();
        let ctx = SimContext {
            scene: &scene,
            manager: &manager,
        };
        let mut metric = CustomMetric::new("doubled_bonds", "twice the bond count", |ctx, _, _| {
            MetricValue::Int(2 * ctx.manager.bond_count() as i32)
        });
        metric.update(&ctx, 0.0, 0.0);
        assert_eq!(metric.name(), "doubled_bonds");
        assert_eq!(metric.value(), MetricValue::Int(2));
        metric.reset();
        assert_eq!(metric.value(), MetricValue::Int(0));
    }
}
