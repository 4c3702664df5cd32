//! Termination conditions for batch replicates.
//!
//! Conditions are checked once per tick after metrics update. Stateful
//! conditions keep their accumulators in `&mut self` and derive the elapsed
//! time from successive `time` arguments.

use super::graph::find_ring;
use super::metrics::{kinetic_energy, Metric, SimContext};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Decides when a replicate should stop.
pub trait TerminationCondition: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> String {
        self.name().to_string()
    }

    fn should_terminate(&mut self, ctx: &SimContext<'_>, time: f32) -> bool;

    fn reset(&mut self);

    /// Fresh copy with the same parameters and cleared state.
    fn box_clone(&self) -> Box<dyn TerminationCondition>;
}

impl Clone for Box<dyn TerminationCondition> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Comparison of a measured value against a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Less,
    LessEqual,
    /// Within 1e-4 of the threshold.
    Equal,
    GreaterEqual,
    Greater,
}

impl Comparison {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Less => value < threshold,
            Comparison::LessEqual => value <= threshold,
            Comparison::Equal => (value - threshold).abs() < 1e-4,
            Comparison::GreaterEqual => value >= threshold,
            Comparison::Greater => value > threshold,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Less => "<",
            Comparison::LessEqual => "<=",
            Comparison::Equal => "==",
            Comparison::GreaterEqual => ">=",
            Comparison::Greater => ">",
        }
    }
}

/// Time accumulated while a predicate keeps holding; any miss resets it.
#[derive(Debug, Clone, Default)]
struct HoldTimer {
    held: f32,
    last_time: f32,
}

impl HoldTimer {
    fn observe(&mut self, time: f32, holding: bool) -> f32 {
        let dt = time - self.last_time;
        self.last_time = time;
        self.held = if holding { self.held + dt } else { 0.0 };
        self.held
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// SIMPLE CONDITIONS
// ============================================================================

/// Stops once simulated time reaches `max_time`.
#[derive(Debug, Clone)]
pub struct TimeoutCondition {
    pub max_time: f32,
}

impl TimeoutCondition {
    pub fn new(max_time: f32) -> Self {
        Self { max_time }
    }
}

impl TerminationCondition for TimeoutCondition {
    fn name(&self) -> &str {
        "timeout"
    }

    fn description(&self) -> String {
        format!("Terminates after {} seconds", self.max_time)
    }

    fn should_terminate(&mut self, _: &SimContext<'_>, time: f32) -> bool {
        time >= self.max_time
    }

    fn reset(&mut self) {}

    fn box_clone(&self) -> Box<dyn TerminationCondition> {
        Box::new(self.clone())
    }
}

/// Stops when the live bond count satisfies the comparison.
#[derive(Debug, Clone)]
pub struct BondCountCondition {
    pub target: usize,
    pub comparison: Comparison,
}

impl BondCountCondition {
    pub fn new(target: usize, comparison: Comparison) -> Self {
        Self { target, comparison }
    }
}

impl TerminationCondition for BondCountCondition {
    fn name(&self) -> &str {
        "bond_count"
    }

    fn description(&self) -> String {
        format!("Terminates when bond count {} {}", self.comparison.symbol(), self.target)
    }

    fn should_terminate(&mut self, ctx: &SimContext<'_>, _: f32) -> bool {
        self.comparison
            .holds(ctx.manager.bond_count() as f64, self.target as f64)
    }

    fn reset(&mut self) {}

    fn box_clone(&self) -> Box<dyn TerminationCondition> {
        Box::new(self.clone())
    }
}

/// Stops once a ring of the target size (any size when 0) exists.
#[derive(Debug, Clone)]
pub struct RingFormationCondition {
    pub target_ring_size: usize,
}

impl RingFormationCondition {
    pub fn new(target_ring_size: usize) -> Self {
        Self { target_ring_size }
    }
}

impl TerminationCondition for RingFormationCondition {
    fn name(&self) -> &str {
        "ring_formation"
    }

    fn description(&self) -> String {
        if self.target_ring_size > 0 {
            format!("Terminates when ring of size {} forms", self.target_ring_size)
        } else {
            "Terminates when any ring forms".into()
        }
    }

    fn should_terminate(&mut self, ctx: &SimContext<'_>, _: f32) -> bool {
        find_ring(ctx.manager.bonds(), self.target_ring_size).is_some()
    }

    fn reset(&mut self) {}

    fn box_clone(&self) -> Box<dyn TerminationCondition> {
        Box::new(self.clone())
    }
}

/// Stops when every registered entity is fully saturated.
#[derive(Debug, Clone, Default)]
pub struct AllSaturatedCondition;

impl TerminationCondition for AllSaturatedCondition {
    fn name(&self) -> &str {
        "all_saturated"
    }

    fn description(&self) -> String {
        "Terminates when all entities have saturated bonding sites".into()
    }

    fn should_terminate(&mut self, ctx: &SimContext<'_>, _: f32) -> bool {
        let stats = ctx.manager.stats();
        stats.entity_count > 0 && stats.saturated_entity_count == stats.entity_count
    }

    fn reset(&mut self) {}

    fn box_clone(&self) -> Box<dyn TerminationCondition> {
        Box::new(self.clone())
    }
}

pub type ConditionFn = Arc<dyn Fn(&SimContext<'_>, f32) -> bool + Send + Sync>;

/// Condition backed by a caller-supplied closure `(ctx, time)`.
#[derive(Clone)]
pub struct CustomCondition {
    name: String,
    description: String,
    func: ConditionFn,
}

impl CustomCondition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        func: impl Fn(&SimContext<'_>, f32) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            func: Arc::new(func),
        }
    }
}

impl TerminationCondition for CustomCondition {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn should_terminate(&mut self, ctx: &SimContext<'_>, time: f32) -> bool {
        (self.func)(ctx, time)
    }

    fn reset(&mut self) {}

    fn box_clone(&self) -> Box<dyn TerminationCondition> {
        Box::new(self.clone())
    }
}

// ============================================================================
// STEADY-STATE CONDITIONS
// ============================================================================

/// Stops after linear kinetic energy stays below a threshold for `hold_time`.
#[derive(Debug, Clone)]
pub struct SteadyStateCondition {
    pub energy_threshold: f32,
    pub hold_time: f32,
    timer: HoldTimer,
}

impl SteadyStateCondition {
    pub fn new(energy_threshold: f32, hold_time: f32) -> Self {
        Self {
            energy_threshold,
            hold_time,
            timer: HoldTimer::default(),
        }
    }
}

impl TerminationCondition for SteadyStateCondition {
    fn name(&self) -> &str {
        "steady_state"
    }

    fn description(&self) -> String {
        format!(
            "Terminates when kinetic energy < {} for {} seconds",
            self.energy_threshold, self.hold_time
        )
    }

    fn should_terminate(&mut self, ctx: &SimContext<'_>, time: f32) -> bool {
        let calm = kinetic_energy(ctx.scene, false) < self.energy_threshold;
        self.timer.observe(time, calm) >= self.hold_time
    }

    fn reset(&mut self) {
        self.timer.reset();
    }

    fn box_clone(&self) -> Box<dyn TerminationCondition> {
        Box::new(Self::new(self.energy_threshold, self.hold_time))
    }
}

/// Stops once the variance of linear kinetic energy over a sliding window
/// stays below a threshold for `hold_time`.
#[derive(Debug, Clone)]
pub struct MovingAverageSteadyStateCondition {
    pub window_size: usize,
    pub variance_threshold: f32,
    pub hold_time: f32,
    window: VecDeque<f32>,
    timer: HoldTimer,
}

impl Default for MovingAverageSteadyStateCondition {
    fn default() -> Self {
        Self::new(60, 0.01, 1.0)
    }
}

impl MovingAverageSteadyStateCondition {
    pub fn new(window_size: usize, variance_threshold: f32, hold_time: f32) -> Self {
        Self {
            window_size: window_size.max(1),
            variance_threshold,
            hold_time,
            window: VecDeque::new(),
            timer: HoldTimer::default(),
        }
    }

    /// Population variance of the current window.
    pub fn window_variance(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        let n = self.window.len() as f32;
        let mean = self.window.iter().sum::<f32>() / n;
        self.window.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n
    }

    /// Feed one sample directly.
    pub fn observe(&mut self, value: f32, time: f32) -> bool {
        self.window.push_back(value);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }
        if self.window.len() < self.window_size {
            // Keep the clock moving while the window fills.
            self.timer.observe(time, false);
            return false;
        }
        let calm = self.window_variance() < self.variance_threshold;
        self.timer.observe(time, calm) >= self.hold_time
    }
}

impl TerminationCondition for MovingAverageSteadyStateCondition {
    fn name(&self) -> &str {
        "moving_average_steady_state"
    }

    fn description(&self) -> String {
        format!(
            "Terminates when kinetic energy variance < {} over {} samples for {} seconds",
            self.variance_threshold, self.window_size, self.hold_time
        )
    }

    fn should_terminate(&mut self, ctx: &SimContext<'_>, time: f32) -> bool {
        self.observe(kinetic_energy(ctx.scene, false), time)
    }

    fn reset(&mut self) {
        self.window.clear();
        self.timer.reset();
    }

    fn box_clone(&self) -> Box<dyn TerminationCondition> {
        Box::new(Self::new(self.window_size, self.variance_threshold, self.hold_time))
    }
}

// ============================================================================
// METRIC-DRIVEN AND COMPOSITE
// ============================================================================

/// Stops when a metric it owns satisfies the comparison.
///
/// The metric is updated by the condition itself on every check, so it does
/// not need to be registered with the runner. Non-numeric values never stop.
pub struct MetricThresholdCondition {
    metric: Box<dyn Metric>,
    pub threshold: f64,
    pub comparison: Comparison,
    last_time: f32,
}

impl MetricThresholdCondition {
    pub fn new(metric: Box<dyn Metric>, threshold: f64, comparison: Comparison) -> Self {
        Self {
            metric,
            threshold,
            comparison,
            last_time: 0.0,
        }
    }

    pub fn metric(&self) -> &dyn Metric {
        self.metric.as_ref()
    }
}

impl TerminationCondition for MetricThresholdCondition {
    fn name(&self) -> &str {
        "metric_threshold"
    }

    fn description(&self) -> String {
        format!(
            "Terminates when {} {} {}",
            self.metric.name(),
            self.comparison.symbol(),
            self.threshold
        )
    }

    fn should_terminate(&mut self, ctx: &SimContext<'_>, time: f32) -> bool {
        self.metric.update(ctx, time, time - self.last_time);
        self.last_time = time;
        self.metric
            .value()
            .as_f64()
            .map_or(false, |v| self.comparison.holds(v, self.threshold))
    }

    fn reset(&mut self) {
        self.metric.reset();
        self.last_time = 0.0;
    }

    fn box_clone(&self) -> Box<dyn TerminationCondition> {
        Box::new(Self::new(self.metric.box_clone(), self.threshold, self.comparison))
    }
}

/// How a composite combines its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Logic {
    And,
    Or,
}

/// AND/OR over sub-conditions. Every member is checked each time so that
/// stateful members keep sampling; an empty composite never stops.
#[derive(Clone)]
pub struct CompositeCondition {
    pub logic: Logic,
    conditions: Vec<Box<dyn TerminationCondition>>,
}

impl CompositeCondition {
    pub fn new(logic: Logic) -> Self {
        Self {
            logic,
            conditions: Vec::new(),
        }
    }

    pub fn with_condition(mut self, condition: impl TerminationCondition + 'static) -> Self {
        self.add_condition(Box::new(condition));
        self
    }

    pub fn add_condition(&mut self, condition: Box<dyn TerminationCondition>) {
        self.conditions.push(condition);
    }

    pub fn remove_condition(&mut self, name: &str) {
        self.conditions.retain(|c| c.name() != name);
    }

    pub fn clear_conditions(&mut self) {
        self.conditions.clear();
    }

    pub fn conditions(&self) -> &[Box<dyn TerminationCondition>] {
        &self.conditions
    }
}

impl TerminationCondition for CompositeCondition {
    fn name(&self) -> &str {
        "composite"
    }

    fn description(&self) -> String {
        let names: Vec<&str> = self.conditions.iter().map(|c| c.name()).collect();
        let logic = match self.logic {
            Logic::And => "AND",
            Logic::Or => "OR",
        };
        format!("Composite condition ({}): {}", logic, names.join(", "))
    }

    fn should_terminate(&mut self, ctx: &SimContext<'_>, time: f32) -> bool {
        if self.conditions.is_empty() {
            return false;
        }
        let results: Vec<bool> = self
            .conditions
            .iter_mut()
            .map(|c| c.should_terminate(ctx, time))
            .collect();
        match self.logic {
            Logic::And => results.iter().all(|&r| r),
            Logic::Or => results.iter().any(|&r| r),
        }
    }

    fn reset(&mut self) {
        for condition in &mut self.conditions {
            condition.reset();
        }
    }

    fn box_clone(&self) -> Box<dyn TerminationCondition> {
        Box::new(Self {
            logic: self.logic,
            conditions: self.conditions.iter().map(|c| c.box_clone()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::metrics::BondCountMetric;
    use crate::bonding::{BondableEntityDef, DynamicBondManager};
    use crate::physics::{ActorDesc, PhysicsScene, ReferenceScene};
    use glam::Vec3;

    fn world(bonded: bool) -> (ReferenceScene, DynamicBondManager) {
        let mut scene = ReferenceScene::default();
        let mut manager = DynamicBondManager::default();
        let a = manager
            .register_entity(&mut scene, BondableEntityDef::dimer(0.5, 0.0))
            .unwrap();
        let b = manager
            .register_entity(
                &mut scene,
                BondableEntityDef::dimer(0.5, 0.0).at_position(Vec3::new(2.0, 0.0, 0.0)),
            )
            .unwrap();
        if bonded {
            manager.create_bond(&mut scene, a, 0, b, 1, None, None).unwrap();
            manager.create_bond(&mut scene, a, 1, b, 0, None, None).unwrap();
        }
        (scene, manager)
    }

    #[test]
    fn test_comparisons() {
        assert!(Comparison::Equal.holds(1.00005, 1.0));
        assert!(!Comparison::Equal.holds(1.001, 1.0));
        assert!(Comparison::LessEqual.holds(1.0, 1.0));
        assert!(!Comparison::Greater.holds(1.0, 1.0));
    }

    #[test]
    fn test_structural_conditions() {
        let (scene, manager) = world(true);
        let ctx = SimContext {
            scene: &scene,
            manager: &manager,
        };
        assert!(BondCountCondition::new(2, Comparison::GreaterEqual).should_terminate(&ctx, 0.0));
        assert!(!BondCountCondition::new(1, Comparison::Equal).should_terminate(&ctx, 0.0));
        assert!(AllSaturatedCondition.should_terminate(&ctx, 0.0));
        assert!(RingFormationCondition::new(2).should_terminate(&ctx, 0.0));
        assert!(!RingFormationCondition::new(3).should_terminate(&ctx, 0.0));

        let (scene, manager) = world(false);
        let ctx = SimContext {
            scene: &scene,
            manager: &manager,
        };
        assert!(!AllSaturatedCondition.should_terminate(&ctx, 0.0));
        assert!(!RingFormationCondition::new(0).should_terminate(&ctx, 0.0));
        assert!(TimeoutCondition::new(1.0).should_terminate(&ctx, 1.0));
        assert!(!TimeoutCondition::new(1.0).should_terminate(&ctx, 0.9));
    }

    #[test]
    fn test_steady_state_hold_resets_on_excursion() {
        let mut scene = ReferenceScene::default();
        let manager = DynamicBondManager::default();
        let mut desc = ActorDesc::sphere(0.5, Vec3::ZERO);
        desc.linear_velocity = Vec3::new(10.0, 0.0, 0.0);
        let actor = scene.create_actor(&desc).unwrap();

        let mut condition = SteadyStateCondition::new(0.1, 0.5);
        let check = |cond: &mut SteadyStateCondition, scene: &ReferenceScene, t: f32| {
            cond.should_terminate(
                &SimContext {
                    scene,
                    manager: &manager,
                },
                t,
            )
        };
        assert!(!check(&mut condition, &scene, 0.25));

        scene.set_linear_velocity(actor, Vec3::ZERO);
        assert!(!check(&mut condition, &scene, 0.5));
        assert!(check(&mut condition, &scene, 1.0));

        scene.set_linear_velocity(actor, Vec3::new(10.0, 0.0, 0.0));
        assert!(!check(&mut condition, &scene, 1.25));
        scene.set_linear_velocity(actor, Vec3::ZERO);
        assert!(!check(&mut condition, &scene, 1.5));

        condition.reset();
        assert!(!check(&mut condition, &scene, 0.25));
        assert_eq!(scene.dynamic_actors().len(), 1);
    }

    #[test]
    fn test_moving_average_needs_full_window() {
        let mut condition = MovingAverageSteadyStateCondition::new(4, 0.01, 0.25);
        let mut stopped_at = None;
        for i in 0..20 {
            let t = (i + 1) as f32 * 0.1;
            let value = if i < 6 { (i % 2) as f32 * 5.0 } else { 2.0 };
            if condition.observe(value, t) {
                stopped_at = Some(i);
                break;
            }
        }
        // Window is calm from sample 9 on; three calm samples cover the hold.
        assert_eq!(stopped_at, Some(11));
    }

    #[test]
    fn test_metric_threshold_owns_metric() {
        let (scene, manager) = world(true);
        let ctx = SimContext {
            scene: &scene,
            manager: &manager,
        };
        let mut condition =
            MetricThresholdCondition::new(Box::new(BondCountMetric::new(false)), 2.0, Comparison::Equal);
        assert!(condition.should_terminate(&ctx, 0.1));
        assert_eq!(condition.description(), "Terminates when bond_count == 2");
    }

    #[test]
    fn test_composite_logic() {
        let (scene, manager) = world(false);
        let ctx = SimContext {
            scene: &scene,
            manager: &manager,
        };
        let mut or = CompositeCondition::new(Logic::Or)
            .with_condition(TimeoutCondition::new(5.0))
            .with_condition(CustomCondition::new("two_entities", "", |ctx, _| {
                ctx.manager.entity_count() == 2
            }));
        assert!(or.should_terminate(&ctx, 0.0));

        let mut and = or.clone();
        and.logic = Logic::And;
        assert!(!and.should_terminate(&ctx, 0.0));
        assert!(and.should_terminate(&ctx, 5.0));

        and.remove_condition("timeout");
        assert_eq!(and.conditions().len(), 1);
        and.clear_conditions();
        assert!(!and.should_terminate(&ctx, 5.0));
        assert!(or.description().contains("timeout, two_entities"));
    }
}
