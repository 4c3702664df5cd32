//! Bond-type strategies: how a bond is realized as an engine joint.

use super::bond::{Bond, BondConfig};
use crate::physics::{
    ActorHandle, D6Axis, D6Config, JointDesc, JointHandle, JointKind, PhysicsScene, Pose,
};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_4, PI};

/// Serializable description of the joint a bond type builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointDef {
    pub bond_type: String,
    pub kind: JointKind,
    pub breakable: bool,
    pub break_force: f32,
    pub break_torque: f32,
    pub enable_collision: bool,
}

/// The two actors and local frames a joint attaches to.
#[derive(Debug, Clone, Copy)]
pub struct JointAttachment {
    pub actor1: ActorHandle,
    pub frame1: Pose,
    pub actor2: ActorHandle,
    pub frame2: Pose,
}

/// Strategy for building the constraint behind a bond.
pub trait BondType: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> String;

    /// Build the joint in the scene. `None` if the engine refuses it.
    fn create_joint(
        &self,
        scene: &mut dyn PhysicsScene,
        attachment: JointAttachment,
        bond: &Bond,
        config: &BondConfig,
    ) -> Option<JointHandle>;

    /// Description for export, independent of current geometry.
    fn joint_def(&self, bond: &Bond, config: &BondConfig) -> JointDef;

    fn box_clone(&self) -> Box<dyn BondType>;
}

impl Clone for Box<dyn BondType> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

fn describe(bond_type: &str, kind: JointKind, config: &BondConfig) -> JointDef {
    JointDef {
        bond_type: bond_type.to_string(),
        kind,
        breakable: config.breakable,
        break_force: config.break_force,
        break_torque: config.break_torque,
        enable_collision: config.enable_collision,
    }
}

/// Attach the joint with break thresholds applied when the bond is breakable.
fn build(
    scene: &mut dyn PhysicsScene,
    attachment: JointAttachment,
    kind: JointKind,
    config: &BondConfig,
) -> Option<JointHandle> {
    scene.create_joint(&JointDesc {
        actor1: attachment.actor1,
        frame1: attachment.frame1,
        actor2: attachment.actor2,
        frame2: attachment.frame2,
        kind,
        break_limits: config.break_limits(),
        enable_collision: config.enable_collision,
    })
}

/// Rotate both frames so their X axis lies along `axis`.
fn align_frames(attachment: JointAttachment, axis: Vec3) -> JointAttachment {
    let rotation = Quat::from_rotation_arc(Vec3::X, axis);
    JointAttachment {
        frame1: Pose::new(attachment.frame1.position, attachment.frame1.rotation * rotation),
        frame2: Pose::new(attachment.frame2.position, attachment.frame2.rotation * rotation),
        ..attachment
    }
}

// ============================================================================
// RIGID
// ============================================================================

/// All six degrees of freedom locked.
#[derive(Debug, Clone, Default)]
pub struct RigidBondType;

impl BondType for RigidBondType {
    fn name(&self) -> &str {
        "rigid"
    }

    fn description(&self) -> String {
        "Fixed joint - no relative motion allowed".into()
    }

    fn create_joint(&self, scene: &mut dyn PhysicsScene, attachment: JointAttachment, _: &Bond, config: &BondConfig) -> Option<JointHandle> {
        build(scene, attachment, JointKind::Fixed, config)
    }

    fn joint_def(&self, _: &Bond, config: &BondConfig) -> JointDef {
        describe(self.name(), JointKind::Fixed, config)
    }

    fn box_clone(&self) -> Box<dyn BondType> {
        Box::new(self.clone())
    }
}

// ============================================================================
// COMPLIANT
// ============================================================================

/// Spring-damper distance constraint.
#[derive(Debug, Clone)]
pub struct CompliantBondType {
    pub default_stiffness: f32,
    pub default_damping: f32,
}

impl Default for CompliantBondType {
    fn default() -> Self {
        Self::new(1000.0, 10.0)
    }
}

impl CompliantBondType {
    pub fn new(default_stiffness: f32, default_damping: f32) -> Self {
        Self {
            default_stiffness,
            default_damping,
        }
    }

    fn spring(&self, config: &BondConfig) -> (f32, f32) {
        let stiffness = if config.stiffness > 0.0 { config.stiffness } else { self.default_stiffness };
        let damping = if config.damping > 0.0 { config.damping } else { self.default_damping };
        (stiffness, damping)
    }

    /// Distance limits around `rest_length`, defaulting to ±10 %.
    fn limits(config: &BondConfig, rest_length: f32) -> (f32, f32) {
        let min = if config.min_distance > 0.0 { config.min_distance } else { rest_length * 0.9 };
        let max = if config.max_distance > 0.0 { config.max_distance } else { rest_length * 1.1 };
        (min, max)
    }
}

impl BondType for CompliantBondType {
    fn name(&self) -> &str {
        "compliant"
    }

    fn description(&self) -> String {
        format!(
            "Spring-damper joint with stiffness={} and damping={}",
            self.default_stiffness, self.default_damping
        )
    }

    fn create_joint(&self, scene: &mut dyn PhysicsScene, attachment: JointAttachment, _: &Bond, config: &BondConfig) -> Option<JointHandle> {
        let rest_length = if config.rest_length > 0.0 {
            config.rest_length
        } else {
            let p1 = scene.actor_pose(attachment.actor1)?.transform_point(attachment.frame1.position);
            let p2 = scene.actor_pose(attachment.actor2)?.transform_point(attachment.frame2.position);
            p1.distance(p2)
        };
        let (min_distance, max_distance) = Self::limits(config, rest_length);
        let (stiffness, damping) = self.spring(config);
        let kind = JointKind::Distance {
            min_distance,
            max_distance,
            stiffness,
            damping,
        };
        build(scene, attachment, kind, config)
    }

    fn joint_def(&self, _: &Bond, config: &BondConfig) -> JointDef {
        let (stiffness, damping) = self.spring(config);
        let kind = JointKind::Distance {
            min_distance: config.min_distance,
            max_distance: config.max_distance,
            stiffness,
            damping,
        };
        describe(self.name(), kind, config)
    }

    fn box_clone(&self) -> Box<dyn BondType> {
        Box::new(self.clone())
    }
}

// ============================================================================
// HINGED
// ============================================================================

/// One rotational degree of freedom about a local axis.
#[derive(Debug, Clone)]
pub struct HingedBondType {
    pub axis: Vec3,
    /// Angular limits in radians, if enabled.
    pub limits: Option<(f32, f32)>,
}

impl Default for HingedBondType {
    fn default() -> Self {
        Self::new(Vec3::Z, None)
    }
}

impl HingedBondType {
    pub fn new(axis: Vec3, limits: Option<(f32, f32)>) -> Self {
        Self {
            axis: axis.try_normalize().unwrap_or(Vec3::Z),
            limits,
        }
    }

    pub fn with_limits(axis: Vec3, lower: f32, upper: f32) -> Self {
        Self::new(axis, Some((lower.max(-PI), upper.min(PI))))
    }
}

impl BondType for HingedBondType {
    fn name(&self) -> &str {
        "hinged"
    }

    fn description(&self) -> String {
        match self.limits {
            Some((lo, hi)) => format!("Revolute joint about {:?}, limits [{:.2}, {:.2}]", self.axis, lo, hi),
            None => format!("Revolute joint about {:?}", self.axis),
        }
    }

    fn create_joint(&self, scene: &mut dyn PhysicsScene, attachment: JointAttachment, _: &Bond, config: &BondConfig) -> Option<JointHandle> {
        let kind = JointKind::Revolute { limits: self.limits };
        build(scene, align_frames(attachment, self.axis), kind, config)
    }

    fn joint_def(&self, _: &Bond, config: &BondConfig) -> JointDef {
        describe(self.name(), JointKind::Revolute { limits: self.limits }, config)
    }

    fn box_clone(&self) -> Box<dyn BondType> {
        Box::new(self.clone())
    }
}

// ============================================================================
// BALL AND SOCKET
// ============================================================================

/// Free rotation about the attachment point, optionally within a cone.
#[derive(Debug, Clone, Default)]
pub struct BallSocketBondType {
    /// Cone half-angle in radians, if enabled.
    pub cone_limit: Option<f32>,
}

impl BallSocketBondType {
    pub fn new(cone_limit: Option<f32>) -> Self {
        Self { cone_limit }
    }

    /// Cone-limited socket with the conventional 45 degree half-angle.
    pub fn with_default_cone() -> Self {
        Self::new(Some(FRAC_PI_4))
    }
}

impl BondType for BallSocketBondType {
    fn name(&self) -> &str {
        "ball_socket"
    }

    fn description(&self) -> String {
        match self.cone_limit {
            Some(cone) => format!("Spherical joint with {:.1} degree cone", cone.to_degrees()),
            None => "Spherical joint".into(),
        }
    }

    fn create_joint(&self, scene: &mut dyn PhysicsScene, attachment: JointAttachment, _: &Bond, config: &BondConfig) -> Option<JointHandle> {
        let kind = JointKind::Spherical { cone_limit: self.cone_limit };
        build(scene, attachment, kind, config)
    }

    fn joint_def(&self, _: &Bond, config: &BondConfig) -> JointDef {
        describe(self.name(), JointKind::Spherical { cone_limit: self.cone_limit }, config)
    }

    fn box_clone(&self) -> Box<dyn BondType> {
        Box::new(self.clone())
    }
}

// ============================================================================
// PRISMATIC
// ============================================================================

/// One linear degree of freedom along a local axis.
#[derive(Debug, Clone)]
pub struct PrismaticBondType {
    pub axis: Vec3,
    /// Position limits along the axis, if enabled.
    pub limits: Option<(f32, f32)>,
}

impl Default for PrismaticBondType {
    fn default() -> Self {
        Self::new(Vec3::X, None)
    }
}

impl PrismaticBondType {
    pub fn new(axis: Vec3, limits: Option<(f32, f32)>) -> Self {
        Self {
            axis: axis.try_normalize().unwrap_or(Vec3::X),
            limits,
        }
    }
}

impl BondType for PrismaticBondType {
    fn name(&self) -> &str {
        "prismatic"
    }

    fn description(&self) -> String {
        format!("Prismatic joint along {:?}", self.axis)
    }

    fn create_joint(&self, scene: &mut dyn PhysicsScene, attachment: JointAttachment, _: &Bond, config: &BondConfig) -> Option<JointHandle> {
        let kind = JointKind::Prismatic { limits: self.limits };
        build(scene, align_frames(attachment, self.axis), kind, config)
    }

    fn joint_def(&self, _: &Bond, config: &BondConfig) -> JointDef {
        describe(self.name(), JointKind::Prismatic { limits: self.limits }, config)
    }

    fn box_clone(&self) -> Box<dyn BondType> {
        Box::new(self.clone())
    }
}

// ============================================================================
// D6
// ============================================================================

/// Per-axis configurable joint. Every axis starts locked.
#[derive(Debug, Clone, Default)]
pub struct D6BondType {
    pub config: D6Config,
}

impl D6BondType {
    pub fn new(config: D6Config) -> Self {
        Self { config }
    }

    pub fn set_linear(&mut self, x: D6Axis, y: D6Axis, z: D6Axis) {
        self.config.linear_x = x;
        self.config.linear_y = y;
        self.config.linear_z = z;
    }

    pub fn set_angular(&mut self, twist: D6Axis, swing1: D6Axis, swing2: D6Axis) {
        self.config.twist = twist;
        self.config.swing1 = swing1;
        self.config.swing2 = swing2;
    }
}

impl BondType for D6BondType {
    fn name(&self) -> &str {
        "d6"
    }

    fn description(&self) -> String {
        format!(
            "Configurable 6-DOF joint ({} free linear axes)",
            self.config.free_linear_axes()
        )
    }

    fn create_joint(&self, scene: &mut dyn PhysicsScene, attachment: JointAttachment, _: &Bond, config: &BondConfig) -> Option<JointHandle> {
        build(scene, attachment, JointKind::D6(self.config), config)
    }

    fn joint_def(&self, _: &Bond, config: &BondConfig) -> JointDef {
        describe(self.name(), JointKind::D6(self.config), config)
    }

    fn box_clone(&self) -> Box<dyn BondType> {
        Box::new(self.clone())
    }
}

/// The six built-in bond types, keyed by name.
pub fn default_bond_types() -> Vec<Box<dyn BondType>> {
    vec![
        Box::new(RigidBondType),
        Box::new(CompliantBondType::default()),
        Box::new(HingedBondType::default()),
        Box::new(BallSocketBondType::default()),
        Box::new(PrismaticBondType::default()),
        Box::new(D6BondType::default()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bonding::bond::BondEndpoint;
    use crate::physics::{ActorDesc, D6Motion, ReferenceScene};
    use approx::assert_relative_eq;

    fn setup(gap: f32) -> (ReferenceScene, JointAttachment, Bond) {
        let mut scene = ReferenceScene::default();
        let a = scene.create_actor(&ActorDesc::sphere(0.5, Vec3::ZERO)).unwrap();
        let b = scene
            .create_actor(&ActorDesc::sphere(0.5, Vec3::new(1.0 + gap, 0.0, 0.0)))
            .unwrap();
        let attachment = JointAttachment {
            actor1: a,
            frame1: Pose::from_position(Vec3::new(0.5, 0.0, 0.0)),
            actor2: b,
            frame2: Pose::from_position(Vec3::new(-0.5, 0.0, 0.0)),
        };
        let bond = Bond {
            bond_id: 1,
            endpoint1: BondEndpoint::new(1, 0),
            endpoint2: BondEndpoint::new(2, 1),
            bond_type: String::new(),
            joint: None,
            formation_time: 0.0,
            pending_removal: false,
        };
        (scene, attachment, bond)
    }

    #[test]
    fn test_default_names() {
        let names: Vec<String> = default_bond_types().iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, ["rigid", "compliant", "hinged", "ball_socket", "prismatic", "d6"]);
    }

    #[test]
    fn test_rigid_creates_fixed_joint() {
        let (mut scene, attachment, bond) = setup(0.0);
        let handle = RigidBondType
            .create_joint(&mut scene, attachment, &bond, &BondConfig::default())
            .unwrap();
        let desc = scene.joint_desc(handle).unwrap();
        assert_eq!(desc.kind, JointKind::Fixed);
        assert_eq!(desc.break_limits, None);
    }

    #[test]
    fn test_compliant_derives_rest_length() {
        let (mut scene, attachment, bond) = setup(0.8);
        let handle = CompliantBondType::default()
            .create_joint(&mut scene, attachment, &bond, &BondConfig::default())
            .unwrap();
        match scene.joint_desc(handle).unwrap().kind {
            JointKind::Distance {
                min_distance,
                max_distance,
                stiffness,
                ..
            } => {
                assert_relative_eq!(min_distance, 0.72, epsilon = 1e-5);
                assert_relative_eq!(max_distance, 0.88, epsilon = 1e-5);
                assert_eq!(stiffness, 1000.0);
            }
            other => panic!("unexpected joint kind {:?}", other),
        }
    }

    #[test]
    fn test_compliant_falls_back_to_type_defaults() {
        let config = BondConfig {
            stiffness: 0.0,
            damping: 0.0,
            ..Default::default()
        };
        let def = CompliantBondType::new(250.0, 3.0).joint_def(&setup(0.0).2, &config);
        assert!(matches!(
            def.kind,
            JointKind::Distance { stiffness, damping, .. } if stiffness == 250.0 && damping == 3.0
        ));
    }

    #[test]
    fn test_breakable_config_sets_thresholds() {
        let (mut scene, attachment, bond) = setup(0.0);
        let config = BondConfig::breakable(50.0, 20.0);
        let handle = BallSocketBondType::with_default_cone()
            .create_joint(&mut scene, attachment, &bond, &config)
            .unwrap();
        assert_eq!(scene.joint_desc(handle).unwrap().break_limits, Some((50.0, 20.0)));

        let def = HingedBondType::default().joint_def(&bond, &config);
        assert!(def.breakable);
        assert_eq!(def.break_force, 50.0);
    }

    #[test]
    fn test_hinge_frames_follow_axis() {
        let (mut scene, attachment, bond) = setup(0.0);
        let handle = HingedBondType::with_limits(Vec3::Y, -1.0, 1.0)
            .create_joint(&mut scene, attachment, &bond, &BondConfig::default())
            .unwrap();
        let desc = scene.joint_desc(handle).unwrap();
        let x_axis = desc.frame1.rotate(Vec3::X);
        assert_relative_eq!(x_axis.y, 1.0, epsilon = 1e-5);
        assert_eq!(desc.kind, JointKind::Revolute { limits: Some((-1.0, 1.0)) });
    }

    #[test]
    fn test_d6_defaults_locked() {
        let mut d6 = D6BondType::default();
        assert_eq!(d6.config.free_linear_axes(), 0);
        d6.set_linear(D6Axis::free(), D6Axis::default(), D6Axis::limited(-0.5, 0.5));
        assert_eq!(d6.config.free_linear_axes(), 2);
        assert_eq!(d6.config.twist.motion, D6Motion::Locked);

        let json = serde_json::to_string(&d6.joint_def(&setup(0.0).2, &BondConfig::default())).unwrap();
        assert!(json.contains("\"bond_type\":\"d6\""));
    }

    #[test]
    fn test_boxed_clone_keeps_parameters() {
        let original: Box<dyn BondType> = Box::new(CompliantBondType::new(42.0, 1.0));
        let copy = original.clone();
        assert_eq!(copy.description(), original.description());
    }
}
