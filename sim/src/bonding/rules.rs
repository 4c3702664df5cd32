//! Bond formation rules.
//!
//! A rule scores a candidate site pair. Negative scores veto the candidate,
//! zero is neutral, and positive scores multiply together into the final
//! desirability. Rules run in descending priority so cheap topological
//! vetoes (self bonding, duplicates, valency) short-circuit before the
//! geometric checks.

use super::entity::BondableEntity;
use super::SiteId;
use crate::physics::PhysicsScene;
use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_PI_2;
use tracing::trace;

/// Score returned to reject a candidate outright.
pub const VETO: f32 = -1.0;

/// A scoring rule over a candidate `(entity1, site1, entity2, site2)` pair.
pub trait BondFormationRule: Send + Sync {
    /// Score the candidate. Never panics; rules that cannot apply return 0.
    fn evaluate(
        &self,
        scene: &dyn PhysicsScene,
        e1: &BondableEntity,
        s1: SiteId,
        e2: &BondableEntity,
        s2: SiteId,
    ) -> f32;

    /// Higher runs first.
    fn priority(&self) -> i32;

    fn name(&self) -> &str;

    fn description(&self) -> String {
        self.name().to_string()
    }

    /// Hard rules veto on a negative score; soft rules only penalize.
    fn is_hard_constraint(&self) -> bool {
        true
    }

    /// Follow a manager-wide capture distance change. Only distance-gated
    /// rules react.
    fn set_capture_distance(&mut self, _distance: f32) {}

    fn box_clone(&self) -> Box<dyn BondFormationRule>;
}

impl Clone for Box<dyn BondFormationRule> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Insert keeping descending priority; equal priorities keep insertion order.
pub(crate) fn insert_by_priority(rules: &mut Vec<Box<dyn BondFormationRule>>, rule: Box<dyn BondFormationRule>) {
    let priority = rule.priority();
    let pos = rules
        .iter()
        .position(|r| r.priority() < priority)
        .unwrap_or(rules.len());
    rules.insert(pos, rule);
}

/// Run a priority-ordered rule chain.
///
/// With `soft_violation_factor = None` every negative score vetoes. With
/// `Some(f)`, negative scores from soft rules multiply the result by `f`
/// instead, and only hard rules veto.
pub fn evaluate_chain(
    rules: &[Box<dyn BondFormationRule>],
    scene: &dyn PhysicsScene,
    e1: &BondableEntity,
    s1: SiteId,
    e2: &BondableEntity,
    s2: SiteId,
    soft_violation_factor: Option<f32>,
) -> f32 {
    let mut combined = 1.0f32;
    for rule in rules {
        let score = rule.evaluate(scene, e1, s1, e2, s2);
        if score < 0.0 {
            match soft_violation_factor {
                Some(factor) if !rule.is_hard_constraint() => {
                    combined *= factor;
                    continue;
                }
                _ => {
                    trace!(
                        rule = rule.name(),
                        e1 = e1.entity_id(),
                        s1,
                        e2 = e2.entity_id(),
                        s2,
                        "candidate vetoed"
                    );
                    return VETO;
                }
            }
        }
        if score > 0.0 {
            combined *= score;
        }
    }
    combined
}

fn angle_between(a: Vec3, b: Vec3) -> f32 {
    a.dot(b).clamp(-1.0, 1.0).acos()
}

// ============================================================================
// TOPOLOGICAL RULES
// ============================================================================

/// Vetoes bonds between two sites of the same entity.
#[derive(Debug, Clone, Default)]
pub struct NoSelfBondingRule;

impl BondFormationRule for NoSelfBondingRule {
    fn evaluate(&self, _: &dyn PhysicsScene, e1: &BondableEntity, _: SiteId, e2: &BondableEntity, _: SiteId) -> f32 {
        if e1.entity_id() == e2.entity_id() {
            VETO
        } else {
            1.0
        }
    }

    fn priority(&self) -> i32 {
        99
    }

    fn name(&self) -> &str {
        "no_self_bonding"
    }

    fn description(&self) -> String {
        "Prevents an entity from bonding to itself".into()
    }

    fn box_clone(&self) -> Box<dyn BondFormationRule> {
        Box::new(self.clone())
    }
}

/// Vetoes a second bond between two sites that already share one.
#[derive(Debug, Clone, Default)]
pub struct NoDuplicateBondRule;

impl BondFormationRule for NoDuplicateBondRule {
    fn evaluate(&self, _: &dyn PhysicsScene, e1: &BondableEntity, s1: SiteId, e2: &BondableEntity, s2: SiteId) -> f32 {
        if e1.bonds_at(s1).any(|b| e2.has_bond_at(s2, b)) {
            VETO
        } else {
            1.0
        }
    }

    fn priority(&self) -> i32 {
        98
    }

    fn name(&self) -> &str {
        "no_duplicate_bond"
    }

    fn description(&self) -> String {
        "Prevents duplicate bonds between the same sites".into()
    }

    fn box_clone(&self) -> Box<dyn BondFormationRule> {
        Box::new(self.clone())
    }
}

/// Vetoes when either site has no spare valency.
#[derive(Debug, Clone, Default)]
pub struct ValencyRule;

impl BondFormationRule for ValencyRule {
    fn evaluate(&self, _: &dyn PhysicsScene, e1: &BondableEntity, s1: SiteId, e2: &BondableEntity, s2: SiteId) -> f32 {
        if e1.can_bond_at(s1) && e2.can_bond_at(s2) {
            1.0
        } else {
            VETO
        }
    }

    fn priority(&self) -> i32 {
        95
    }

    fn name(&self) -> &str {
        "valency"
    }

    fn description(&self) -> String {
        "Ensures sites have not exceeded their maximum valency".into()
    }

    fn box_clone(&self) -> Box<dyn BondFormationRule> {
        Box::new(self.clone())
    }
}

/// Vetoes unless each site's compatibility list accepts the other's type.
#[derive(Debug, Clone, Default)]
pub struct TypeCompatibilityRule;

impl BondFormationRule for TypeCompatibilityRule {
    fn evaluate(&self, _: &dyn PhysicsScene, e1: &BondableEntity, s1: SiteId, e2: &BondableEntity, s2: SiteId) -> f32 {
        let (Some(site1), Some(site2)) = (e1.site_def(s1), e2.site_def(s2)) else {
            return VETO;
        };
        if site1.is_compatible_with(&site2.site_type) && site2.is_compatible_with(&site1.site_type) {
            1.0
        } else {
            VETO
        }
    }

    fn priority(&self) -> i32 {
        90
    }

    fn name(&self) -> &str {
        "type_compatibility"
    }

    fn description(&self) -> String {
        "Checks that site types are mutually compatible".into()
    }

    fn box_clone(&self) -> Box<dyn BondFormationRule> {
        Box::new(self.clone())
    }
}

// ============================================================================
// GEOMETRIC RULES
// ============================================================================

/// Gates on site-to-site distance; closer scores higher.
#[derive(Debug, Clone)]
pub struct ProximityRule {
    pub capture_distance: f32,
    pub min_distance: f32,
}

impl Default for ProximityRule {
    fn default() -> Self {
        Self::new(2.0, 0.0)
    }
}

impl ProximityRule {
    pub fn new(capture_distance: f32, min_distance: f32) -> Self {
        Self {
            capture_distance,
            min_distance,
        }
    }
}

impl BondFormationRule for ProximityRule {
    fn evaluate(&self, scene: &dyn PhysicsScene, e1: &BondableEntity, s1: SiteId, e2: &BondableEntity, s2: SiteId) -> f32 {
        let (Some(p1), Some(p2)) = (e1.site_world_position(scene, s1), e2.site_world_position(scene, s2)) else {
            return VETO;
        };
        let distance = p1.distance(p2);
        if distance > self.capture_distance || distance < self.min_distance {
            return VETO;
        }
        1.0 - distance / self.capture_distance
    }

    fn priority(&self) -> i32 {
        100
    }

    fn name(&self) -> &str {
        "proximity"
    }

    fn description(&self) -> String {
        format!(
            "Sites must be within {:.2} (and beyond {:.2}) of each other",
            self.capture_distance, self.min_distance
        )
    }

    fn set_capture_distance(&mut self, distance: f32) {
        self.capture_distance = distance;
    }

    fn box_clone(&self) -> Box<dyn BondFormationRule> {
        Box::new(self.clone())
    }
}

/// How two site directions must relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlignmentMode {
    /// Directions point toward each other.
    Antiparallel,
    /// Directions point the same way.
    Parallel,
    Any,
}

/// Vetoes misaligned site directions; tighter alignment scores higher.
#[derive(Debug, Clone)]
pub struct DirectionalAlignmentRule {
    pub mode: AlignmentMode,
    /// Maximum angular deviation in radians.
    pub angle_tolerance: f32,
}

impl Default for DirectionalAlignmentRule {
    fn default() -> Self {
        Self::new(AlignmentMode::Antiparallel, 0.5236) // ~30 degrees
    }
}

impl DirectionalAlignmentRule {
    pub fn new(mode: AlignmentMode, angle_tolerance: f32) -> Self {
        Self { mode, angle_tolerance }
    }
}

impl BondFormationRule for DirectionalAlignmentRule {
    fn evaluate(&self, scene: &dyn PhysicsScene, e1: &BondableEntity, s1: SiteId, e2: &BondableEntity, s2: SiteId) -> f32 {
        let target = match self.mode {
            AlignmentMode::Any => return 1.0,
            AlignmentMode::Antiparallel => -1.0,
            AlignmentMode::Parallel => 1.0,
        };
        let (Some(d1), Some(d2)) = (e1.site_world_direction(scene, s1), e2.site_world_direction(scene, s2)) else {
            return VETO;
        };
        let angle = angle_between(d1, d2 * target);
        if angle > self.angle_tolerance {
            return VETO;
        }
        1.0 - angle / self.angle_tolerance
    }

    fn priority(&self) -> i32 {
        80
    }

    fn name(&self) -> &str {
        "directional_alignment"
    }

    fn description(&self) -> String {
        format!(
            "Site directions must be {:?} within {:.1} degrees",
            self.mode,
            self.angle_tolerance.to_degrees()
        )
    }

    fn box_clone(&self) -> Box<dyn BondFormationRule> {
        Box::new(self.clone())
    }
}

/// Holds new bonds at a target angle to a site's already-bonded neighbours,
/// biasing growth toward a polygon (90 degrees for squares).
#[derive(Debug, Clone)]
pub struct AngleConstraintRule {
    pub target_angle: f32,
    pub tolerance: f32,
}

impl Default for AngleConstraintRule {
    fn default() -> Self {
        Self::new(FRAC_PI_2, 0.087)
    }
}

impl AngleConstraintRule {
    pub fn new(target_angle: f32, tolerance: f32) -> Self {
        Self { target_angle, tolerance }
    }

    /// Directions from `site` to every other bonded site on the entity.
    fn existing_directions(scene: &dyn PhysicsScene, entity: &BondableEntity, site: SiteId) -> Vec<Vec3> {
        let Some(origin) = entity.site_world_position(scene, site) else {
            return Vec::new();
        };
        entity
            .sites()
            .iter()
            .filter(|s| s.site_id != site && entity.bond_count_at(s.site_id) > 0)
            .filter_map(|s| entity.site_world_position(scene, s.site_id))
            .filter_map(|p| (p - origin).try_normalize())
            .collect()
    }

    fn deviation(&self, a: Vec3, b: Vec3) -> f32 {
        (angle_between(a, b) - self.target_angle).abs()
    }
}

impl BondFormationRule for AngleConstraintRule {
    fn evaluate(&self, scene: &dyn PhysicsScene, e1: &BondableEntity, s1: SiteId, e2: &BondableEntity, s2: SiteId) -> f32 {
        let (Some(p1), Some(p2)) = (e1.site_world_position(scene, s1), e2.site_world_position(scene, s2)) else {
            return 0.0;
        };
        let Some(proposed) = (p2 - p1).try_normalize() else {
            return 0.0;
        };

        let existing1 = Self::existing_directions(scene, e1, s1);
        let existing2 = Self::existing_directions(scene, e2, s2);

        if existing1.iter().any(|&d| self.deviation(proposed, d) > self.tolerance)
            || existing2.iter().any(|&d| self.deviation(-proposed, d) > self.tolerance)
        {
            return VETO;
        }
        if existing1.is_empty() {
            return 1.0;
        }

        let best = existing1
            .iter()
            .map(|&d| self.deviation(proposed, d))
            .fold(self.tolerance, f32::min);
        1.0 - best / self.tolerance
    }

    fn priority(&self) -> i32 {
        60
    }

    fn name(&self) -> &str {
        "angle_constraint"
    }

    fn description(&self) -> String {
        format!(
            "Bond angle must be {:.1} +/- {:.1} degrees",
            self.target_angle.to_degrees(),
            self.tolerance.to_degrees()
        )
    }

    fn box_clone(&self) -> Box<dyn BondFormationRule> {
        Box::new(self.clone())
    }
}

/// Soft preference for bonds lying in the plane of existing bonds.
#[derive(Debug, Clone)]
pub struct CoplanarityRule {
    /// Maximum out-of-plane angle in radians.
    pub max_deviation_angle: f32,
}

impl Default for CoplanarityRule {
    fn default() -> Self {
        Self::new(0.087) // ~5 degrees
    }
}

impl CoplanarityRule {
    pub fn new(max_deviation_angle: f32) -> Self {
        Self { max_deviation_angle }
    }

    /// Plane normal from the entity's first two bond directions, if it has two.
    fn bond_plane(scene: &dyn PhysicsScene, entity: &BondableEntity) -> Option<Vec3> {
        if entity.total_bond_count() < 2 {
            return None;
        }
        let center = entity.world_pose(scene)?.position;
        let mut directions = entity
            .sites()
            .iter()
            .flat_map(|s| std::iter::repeat(s.site_id).take(entity.bond_count_at(s.site_id) as usize))
            .filter_map(|site| entity.site_world_position(scene, site))
            .filter_map(|p| (p - center).try_normalize());
        let first = directions.next()?;
        let second = directions.next()?;
        first.cross(second).try_normalize()
    }
}

impl BondFormationRule for CoplanarityRule {
    fn evaluate(&self, scene: &dyn PhysicsScene, e1: &BondableEntity, s1: SiteId, e2: &BondableEntity, s2: SiteId) -> f32 {
        let planes: Vec<Vec3> = [Self::bond_plane(scene, e1), Self::bond_plane(scene, e2)]
            .into_iter()
            .flatten()
            .collect();
        if planes.is_empty() {
            return 1.0;
        }
        let (Some(p1), Some(p2)) = (e1.site_world_position(scene, s1), e2.site_world_position(scene, s2)) else {
            return 0.0;
        };
        let Some(bond_dir) = (p2 - p1).try_normalize() else {
            return 0.0;
        };

        let deviation = planes
            .iter()
            .map(|n| bond_dir.dot(*n).abs().clamp(0.0, 1.0).asin())
            .fold(0.0f32, f32::max);
        if deviation > self.max_deviation_angle {
            return VETO;
        }
        1.0 - deviation / self.max_deviation_angle
    }

    fn priority(&self) -> i32 {
        50
    }

    fn name(&self) -> &str {
        "coplanarity"
    }

    fn description(&self) -> String {
        format!(
            "Bonds should stay within {:.1} degrees of the existing bond plane",
            self.max_deviation_angle.to_degrees()
        )
    }

    fn is_hard_constraint(&self) -> bool {
        false
    }

    fn box_clone(&self) -> Box<dyn BondFormationRule> {
        Box::new(self.clone())
    }
}

// ============================================================================
// COMPOSITION
// ============================================================================

/// AND over sub-rules: any veto vetoes, positive scores multiply.
#[derive(Clone, Default)]
pub struct CompositeRule {
    rules: Vec<Box<dyn BondFormationRule>>,
}

impl CompositeRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: impl BondFormationRule + 'static) -> Self {
        self.add_rule(Box::new(rule));
        self
    }

    pub fn add_rule(&mut self, rule: Box<dyn BondFormationRule>) {
        insert_by_priority(&mut self.rules, rule);
    }

    pub fn remove_rule(&mut self, name: &str) {
        self.rules.retain(|r| r.name() != name);
    }

    pub fn clear_rules(&mut self) {
        self.rules.clear();
    }

    pub fn rules(&self) -> &[Box<dyn BondFormationRule>] {
        &self.rules
    }
}

impl BondFormationRule for CompositeRule {
    fn evaluate(&self, scene: &dyn PhysicsScene, e1: &BondableEntity, s1: SiteId, e2: &BondableEntity, s2: SiteId) -> f32 {
        evaluate_chain(&self.rules, scene, e1, s1, e2, s2, None)
    }

    /// Minimum priority of the members, so the composite runs no earlier
    /// than its most expensive member.
    fn priority(&self) -> i32 {
        self.rules.iter().map(|r| r.priority()).min().unwrap_or(0)
    }

    fn name(&self) -> &str {
        "composite"
    }

    fn description(&self) -> String {
        let names: Vec<&str> = self.rules.iter().map(|r| r.name()).collect();
        format!("Composite rule with {} sub-rules: {}", names.len(), names.join(", "))
    }

    fn is_hard_constraint(&self) -> bool {
        self.rules.iter().any(|r| r.is_hard_constraint())
    }

    fn set_capture_distance(&mut self, distance: f32) {
        for rule in self.rules.iter_mut() {
            rule.set_capture_distance(distance);
        }
    }

    fn box_clone(&self) -> Box<dyn BondFormationRule> {
        Box::new(self.clone())
    }
}

// ============================================================================
// PRESETS
// ============================================================================

/// Rule set installed in a fresh manager.
pub fn default_rules(capture_distance: f32) -> Vec<Box<dyn BondFormationRule>> {
    vec![
        Box::new(NoSelfBondingRule),
        Box::new(NoDuplicateBondRule),
        Box::new(ValencyRule),
        Box::new(ProximityRule::new(capture_distance, 0.0)),
        Box::new(TypeCompatibilityRule),
    ]
}

/// Molecular-style bonding: defaults plus antiparallel site alignment.
pub fn molecular_rules(capture_distance: f32, angle_tolerance: f32) -> Vec<Box<dyn BondFormationRule>> {
    let mut rules = default_rules(capture_distance);
    rules.push(Box::new(DirectionalAlignmentRule::new(
        AlignmentMode::Antiparallel,
        angle_tolerance,
    )));
    rules
}

/// Ring growth: topological rules plus bond-angle and coplanarity constraints.
pub fn ring_formation_rules(
    capture_distance: f32,
    target_angle: f32,
    angle_tolerance: f32,
) -> Vec<Box<dyn BondFormationRule>> {
    vec![
        Box::new(NoSelfBondingRule),
        Box::new(NoDuplicateBondRule),
        Box::new(ValencyRule),
        Box::new(ProximityRule::new(capture_distance, 0.0)),
        Box::new(AngleConstraintRule::new(target_angle, angle_tolerance)),
        Box::new(CoplanarityRule::new(angle_tolerance)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bonding::entity::BondableEntityDef;
    use crate::physics::{ActorHandle, ReferenceScene};
    use approx::assert_relative_eq;
    use glam::Quat;

    /// Two dimers on the X axis with site 0 of `a` facing site 1 of `b`.
    fn facing_pair(scene: &mut ReferenceScene, gap: f32) -> (BondableEntity, BondableEntity) {
        let def_a = BondableEntityDef::dimer(0.5, 0.0);
        let def_b = BondableEntityDef::dimer(0.5, 0.0).at_position(Vec3::new(1.0 + gap, 0.0, 0.0));
        let a = scene.create_actor(&def_a.actor).unwrap();
        let b = scene.create_actor(&def_b.actor).unwrap();
        (BondableEntity::new(1, def_a, a), BondableEntity::new(2, def_b, b))
    }

    #[test]
    fn test_proximity_scores_closer_higher() {
        let mut scene = ReferenceScene::default();
        let (a, b) = facing_pair(&mut scene, 1.0);
        let rule = ProximityRule::new(2.0, 0.0);
        assert_relative_eq!(rule.evaluate(&scene, &a, 0, &b, 1), 0.5, epsilon = 1e-5);

        let (c, d) = facing_pair(&mut scene, 5.0);
        assert_eq!(rule.evaluate(&scene, &c, 0, &d, 1), VETO);

        let strict = ProximityRule::new(2.0, 1.5);
        assert_eq!(strict.evaluate(&scene, &a, 0, &b, 1), VETO);
    }

    #[test]
    fn test_capture_distance_update_reaches_nested_proximity() {
        let mut scene = ReferenceScene::default();
        let (a, b) = facing_pair(&mut scene, 3.0);

        let mut rule = ProximityRule::new(2.0, 0.0);
        assert_eq!(rule.evaluate(&scene, &a, 0, &b, 1), VETO);
        rule.set_capture_distance(4.0);
        assert_relative_eq!(rule.evaluate(&scene, &a, 0, &b, 1), 0.25, epsilon = 1e-5);

        let mut composite = CompositeRule::new()
            .with_rule(ProximityRule::new(2.0, 0.0))
            .with_rule(NoSelfBondingRule);
        composite.set_capture_distance(4.0);
        assert_relative_eq!(composite.evaluate(&scene, &a, 0, &b, 1), 0.25, epsilon = 1e-5);

        // Rules without a distance gate ignore the update.
        let mut valency = ValencyRule;
        valency.set_capture_distance(4.0);
        assert_eq!(valency.evaluate(&scene, &a, 0, &b, 1), 1.0);
    }

    #[test]
    fn test_alignment_modes() {
        let mut scene = ReferenceScene::default();
        let (a, b) = facing_pair(&mut scene, 1.0);

        let anti = DirectionalAlignmentRule::new(AlignmentMode::Antiparallel, 0.5);
        assert_relative_eq!(anti.evaluate(&scene, &a, 0, &b, 1), 1.0, epsilon = 1e-3);
        // Site 0 on both points +X: parallel, not antiparallel
        assert_eq!(anti.evaluate(&scene, &a, 0, &b, 0), VETO);

        let parallel = DirectionalAlignmentRule::new(AlignmentMode::Parallel, 0.5);
        assert!(parallel.evaluate(&scene, &a, 0, &b, 0) > 0.99);

        let any = DirectionalAlignmentRule::new(AlignmentMode::Any, 0.1);
        assert_eq!(any.evaluate(&scene, &a, 0, &b, 0), 1.0);
    }

    #[test]
    fn test_alignment_tracks_rotation() {
        let mut scene = ReferenceScene::default();
        let def_a = BondableEntityDef::dimer(0.5, 0.0);
        let mut def_b = BondableEntityDef::dimer(0.5, 0.0).at_position(Vec3::new(2.0, 0.0, 0.0));
        def_b.actor.pose.rotation = Quat::from_rotation_z(0.3);
        let a = BondableEntity::new(1, def_a.clone(), scene.create_actor(&def_a.actor).unwrap());
        let b = BondableEntity::new(2, def_b.clone(), scene.create_actor(&def_b.actor).unwrap());

        let rule = DirectionalAlignmentRule::new(AlignmentMode::Antiparallel, 0.6);
        assert_relative_eq!(rule.evaluate(&scene, &a, 0, &b, 1), 0.5, epsilon = 1e-3);
        let tight = DirectionalAlignmentRule::new(AlignmentMode::Antiparallel, 0.2);
        assert_eq!(tight.evaluate(&scene, &a, 0, &b, 1), VETO);
    }

    #[test]
    fn test_topological_rules() {
        let scene = ReferenceScene::default();
        let mut a = BondableEntity::new(1, BondableEntityDef::dimer(0.5, 0.0), ActorHandle(1));
        let mut b = BondableEntity::new(2, BondableEntityDef::dimer(0.5, 0.0), ActorHandle(2));

        assert_eq!(NoSelfBondingRule.evaluate(&scene, &a, 0, &a, 1), VETO);
        assert_eq!(NoSelfBondingRule.evaluate(&scene, &a, 0, &b, 1), 1.0);

        assert_eq!(NoDuplicateBondRule.evaluate(&scene, &a, 0, &b, 1), 1.0);
        a.record_bond(0, 42);
        b.record_bond(1, 42);
        assert_eq!(NoDuplicateBondRule.evaluate(&scene, &a, 0, &b, 1), VETO);

        assert_eq!(ValencyRule.evaluate(&scene, &a, 0, &b, 0), VETO);
        assert_eq!(ValencyRule.evaluate(&scene, &a, 1, &b, 0), 1.0);
    }

    #[test]
    fn test_type_compatibility_is_bidirectional() {
        let scene = ReferenceScene::default();
        let mut def_a = BondableEntityDef::dimer(0.5, 0.0);
        def_a.bonding_sites[0] = def_a.bonding_sites[0].clone().with_type("donor", &["acceptor"]);
        let mut def_b = BondableEntityDef::dimer(0.5, 0.0);
        def_b.bonding_sites[1] = def_b.bonding_sites[1].clone().with_type("acceptor", &["acceptor"]);

        let a = BondableEntity::new(1, def_a, ActorHandle(1));
        let b = BondableEntity::new(2, def_b, ActorHandle(2));

        // a accepts b, but b does not accept donors
        assert_eq!(TypeCompatibilityRule.evaluate(&scene, &a, 0, &b, 1), VETO);
        // a's site 1 is a wildcard "default"; b's site 0 is a wildcard too
        assert_eq!(TypeCompatibilityRule.evaluate(&scene, &a, 1, &b, 0), 1.0);
        assert_eq!(TypeCompatibilityRule.evaluate(&scene, &a, 7, &b, 0), VETO);
    }

    #[test]
    fn test_angle_constraint_without_context_is_permissive() {
        let mut scene = ReferenceScene::default();
        let (a, b) = facing_pair(&mut scene, 0.5);
        let rule = AngleConstraintRule::new(FRAC_PI_2, 0.1);
        assert_eq!(rule.evaluate(&scene, &a, 0, &b, 1), 1.0);
    }

    #[test]
    fn test_angle_constraint_vetoes_off_target() {
        let mut scene = ReferenceScene::default();
        let (mut a, b) = facing_pair(&mut scene, 0.5);
        // a's site 1 (at -X) is bonded, so the existing direction from site 0 is -X
        a.record_bond(1, 9);
        // proposed direction is +X: 180 degrees from the existing bond
        let square = AngleConstraintRule::new(FRAC_PI_2, 0.1);
        assert_eq!(square.evaluate(&scene, &a, 0, &b, 1), VETO);

        let straight = AngleConstraintRule::new(std::f32::consts::PI, 0.1);
        assert!(straight.evaluate(&scene, &a, 0, &b, 1) > 0.9);
    }

    #[test]
    fn test_coplanarity_is_soft() {
        let rule = CoplanarityRule::default();
        assert!(!rule.is_hard_constraint());

        let mut scene = ReferenceScene::default();
        let (a, b) = facing_pair(&mut scene, 0.5);
        // Neither entity has two bonds: no plane, bond allowed
        assert_eq!(rule.evaluate(&scene, &a, 0, &b, 1), 1.0);
    }

    #[test]
    fn test_coplanarity_penalizes_out_of_plane() {
        let mut scene = ReferenceScene::default();
        let def = BondableEntityDef::tetrahedral(0.5);
        let actor = scene.create_actor(&def.actor).unwrap();
        let mut hub = BondableEntity::new(1, def, actor);
        hub.record_bond(0, 1);
        hub.record_bond(1, 2);

        // Partner sitting straight out along the plane normal of sites 0 and 1
        let s0 = hub.site_def(0).unwrap().local_direction;
        let s1 = hub.site_def(1).unwrap().local_direction;
        let normal = s0.cross(s1).normalize();
        let site2 = hub.site_world_position(&scene, 2).unwrap();
        let partner_def = BondableEntityDef::dimer(0.2, 0.0).at_position(site2 + normal * 0.5 + Vec3::X * 0.2);
        let partner_actor = scene.create_actor(&partner_def.actor).unwrap();
        let partner = BondableEntity::new(2, partner_def, partner_actor);

        let rule = CoplanarityRule::new(0.2);
        assert_eq!(rule.evaluate(&scene, &hub, 2, &partner, 1), VETO);

        // Soft: the manager's chain penalizes instead of vetoing
        let chain: Vec<Box<dyn BondFormationRule>> = vec![Box::new(rule)];
        let score = evaluate_chain(&chain, &scene, &hub, 2, &partner, 1, Some(0.1));
        assert_relative_eq!(score, 0.1);
        assert_eq!(evaluate_chain(&chain, &scene, &hub, 2, &partner, 1, None), VETO);
    }

    #[test]
    fn test_composite_and_semantics() {
        let mut scene = ReferenceScene::default();
        let (a, b) = facing_pair(&mut scene, 1.0);

        let composite = CompositeRule::new()
            .with_rule(ProximityRule::new(2.0, 0.0))
            .with_rule(DirectionalAlignmentRule::new(AlignmentMode::Antiparallel, 0.5))
            .with_rule(NoSelfBondingRule);

        assert_eq!(composite.priority(), 80);
        assert_eq!(composite.rules()[0].name(), "proximity");
        assert_relative_eq!(composite.evaluate(&scene, &a, 0, &b, 1), 0.5, epsilon = 1e-3);
        assert_eq!(composite.evaluate(&scene, &a, 0, &a, 1), VETO);
        assert!(composite.description().contains("directional_alignment"));

        let mut trimmed = composite.clone();
        trimmed.remove_rule("directional_alignment");
        assert_eq!(trimmed.rules().len(), 2);
        assert_eq!(trimmed.priority(), 99);
        assert_eq!(CompositeRule::new().priority(), 0);
    }

    #[test]
    fn test_veto_dominates_high_scores() {
        let mut scene = ReferenceScene::default();
        let (a, b) = facing_pair(&mut scene, 0.01);
        let mut rules = default_rules(2.0);
        rules.push(Box::new(DirectionalAlignmentRule::new(AlignmentMode::Parallel, 0.1)));
        assert_eq!(evaluate_chain(&rules, &scene, &a, 0, &b, 1, Some(0.1)), VETO);
    }

    #[test]
    fn test_insert_by_priority_is_stable() {
        let mut rules: Vec<Box<dyn BondFormationRule>> = Vec::new();
        insert_by_priority(&mut rules, Box::new(CoplanarityRule::default()));
        insert_by_priority(&mut rules, Box::new(ProximityRule::default()));
        insert_by_priority(&mut rules, Box::new(ValencyRule));
        insert_by_priority(&mut rules, Box::new(ProximityRule::new(1.0, 0.0)));
        let names: Vec<_> = rules.iter().map(|r| r.description()).collect();
        assert!(names[0].contains("2.00"));
        assert!(names[1].contains("1.00"));
        assert_eq!(rules[2].name(), "valency");
        assert_eq!(rules[3].name(), "coplanarity");
    }
}
